// Retry/fatal classification for transport failures
//
// Every failure goes through `classify` exactly once. Anything this module
// does not recognize is fatal.

use super::{ClientError, GraphQLError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;

/// What the transport should do with a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry,
    Fatal,
    /// Fatal, and the user has to log in again
    Unauthenticated,
}

/// Extension code the server attaches when `expectedRemoteFilesVersion` is stale
pub const FILES_VERSION_MISMATCH: &str = "FILES_VERSION_MISMATCH";

const AUTH_CODES: &[&str] = &["UNAUTHENTICATED", "UNAUTHORIZED", "FORBIDDEN", "PERMISSION_DENIED"];

// Message matching is a fallback for servers that omit extension codes
static AUTH_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)unauthenticated|unauthorized|forbidden|not allowed|permission denied")
        .expect("auth pattern is a valid regex")
});

/// Transient network conditions, named after their POSIX/libuv codes
const RETRYABLE_NETWORK_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "ECONNABORTED",
    "EPIPE",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "ENETDOWN",
    "EADDRINUSE",
    "ESOCKETTIMEDOUT",
    "UND_ERR_SOCKET",
    "UND_ERR_CONNECT_TIMEOUT",
    "UND_ERR_HEADERS_TIMEOUT",
    "UND_ERR_BODY_TIMEOUT",
    "ERR_TLS_HANDSHAKE",
];

pub fn classify(error: &ClientError) -> Verdict {
    match error {
        ClientError::Network { code, .. } => {
            if RETRYABLE_NETWORK_CODES.contains(&code.as_str()) {
                Verdict::Retry
            } else {
                Verdict::Fatal
            }
        }
        ClientError::Closed { code, .. } => match code {
            4401 | 4403 => Verdict::Unauthenticated,
            1000 | 1008 => Verdict::Fatal,
            _ => Verdict::Retry,
        },
        ClientError::GraphQL(errors) => classify_graphql(errors),
        ClientError::Messages(messages) => {
            if messages.iter().any(|m| AUTH_MESSAGE.is_match(m)) {
                Verdict::Unauthenticated
            } else {
                Verdict::Retry
            }
        }
        ClientError::Http { status, .. } => match status {
            401 | 403 => Verdict::Unauthenticated,
            408 | 429 | 500..=599 => Verdict::Retry,
            _ => Verdict::Fatal,
        },
        // The orchestrator recomputes the whole attempt instead
        ClientError::FilesVersionMismatch { .. } => Verdict::Fatal,
        ClientError::Unrecognized(_) => Verdict::Fatal,
    }
}

fn classify_graphql(errors: &[GraphQLError]) -> Verdict {
    if errors.is_empty() {
        return Verdict::Fatal;
    }

    // A structured code wins over whatever the message says
    if errors
        .iter()
        .any(|e| e.code().is_some_and(|code| AUTH_CODES.contains(&code)))
    {
        return Verdict::Unauthenticated;
    }
    if errors.iter().any(|e| e.code() == Some(FILES_VERSION_MISMATCH)) {
        return Verdict::Fatal;
    }
    if errors.iter().any(|e| AUTH_MESSAGE.is_match(&e.message)) {
        return Verdict::Unauthenticated;
    }
    Verdict::Retry
}

/// Map an io error onto the network code vocabulary
pub fn io_error_code(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        io::ErrorKind::BrokenPipe => "EPIPE",
        io::ErrorKind::AddrInUse => "EADDRINUSE",
        io::ErrorKind::UnexpectedEof => "ECONNRESET",
        io::ErrorKind::NotConnected => "ECONNRESET",
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => "EAI_AGAIN",
        _ => "EUNKNOWN",
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Network {
            code: io_error_code(e.kind()).to_string(),
            message: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return ClientError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            };
        }

        let code = if e.is_timeout() {
            "ETIMEDOUT"
        } else if e.is_connect() {
            connect_code(&e)
        } else if e.is_request() || e.is_body() {
            "ECONNRESET"
        } else if e.is_decode() {
            return ClientError::Unrecognized(e.to_string());
        } else {
            "EUNKNOWN"
        };

        ClientError::Network {
            code: code.to_string(),
            message: e.to_string(),
        }
    }
}

/// Find the io error (or DNS failure) behind a connect error
fn connect_code(e: &reqwest::Error) -> &'static str {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return io_error_code(io.kind());
        }
        let text = err.to_string().to_ascii_lowercase();
        if text.contains("dns") || text.contains("failed to lookup") {
            return "ENOTFOUND";
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return "ERR_TLS_HANDSHAKE";
        }
        source = err.source();
    }
    "ECONNREFUSED"
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let message = e.to_string();
        match e {
            WsError::Io(io) => io.into(),
            WsError::Http(response) => ClientError::Http {
                status: response.status().as_u16(),
                body: response
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default(),
            },
            WsError::Tls(_) => ClientError::Network {
                code: "ERR_TLS_HANDSHAKE".to_string(),
                message,
            },
            WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Protocol(_) => {
                ClientError::Network {
                    code: "ECONNRESET".to_string(),
                    message,
                }
            }
            _ => ClientError::Unrecognized(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gql(message: &str, code: Option<&str>) -> GraphQLError {
        GraphQLError {
            message: message.to_string(),
            extensions: code.map(|c| json!({ "code": c })),
        }
    }

    #[test]
    fn test_http_statuses() {
        let http = |status| ClientError::Http {
            status,
            body: String::new(),
        };
        assert_eq!(classify(&http(503)), Verdict::Retry);
        assert_eq!(classify(&http(500)), Verdict::Retry);
        assert_eq!(classify(&http(429)), Verdict::Retry);
        assert_eq!(classify(&http(408)), Verdict::Retry);
        assert_eq!(classify(&http(401)), Verdict::Unauthenticated);
        assert_eq!(classify(&http(403)), Verdict::Unauthenticated);
        assert_eq!(classify(&http(400)), Verdict::Fatal);
        assert_eq!(classify(&http(404)), Verdict::Fatal);
    }

    #[test]
    fn test_websocket_close_codes() {
        let closed = |code| ClientError::Closed {
            code,
            reason: String::new(),
        };
        assert_eq!(classify(&closed(1000)), Verdict::Fatal);
        assert_eq!(classify(&closed(1008)), Verdict::Fatal);
        assert_eq!(classify(&closed(4401)), Verdict::Unauthenticated);
        assert_eq!(classify(&closed(4403)), Verdict::Unauthenticated);
        assert_eq!(classify(&closed(1006)), Verdict::Retry);
        assert_eq!(classify(&closed(1011)), Verdict::Retry);
    }

    #[test]
    fn test_network_codes() {
        let net = |code: &str| ClientError::Network {
            code: code.to_string(),
            message: String::new(),
        };
        assert_eq!(classify(&net("ECONNRESET")), Verdict::Retry);
        assert_eq!(classify(&net("ENOTFOUND")), Verdict::Retry);
        assert_eq!(classify(&net("EUNKNOWN")), Verdict::Fatal);
    }

    #[test]
    fn test_graphql_auth_code_wins_over_message() {
        let err = ClientError::GraphQL(vec![gql("something went sideways", Some("FORBIDDEN"))]);
        assert_eq!(classify(&err), Verdict::Unauthenticated);

        let err = ClientError::GraphQL(vec![gql("internal error", Some("INTERNAL_SERVER_ERROR"))]);
        assert_eq!(classify(&err), Verdict::Retry);
    }

    #[test]
    fn test_graphql_auth_message_pattern() {
        let err = ClientError::GraphQL(vec![gql("You are Not Allowed to do that", None)]);
        assert_eq!(classify(&err), Verdict::Unauthenticated);

        let err = ClientError::Messages(vec!["Permission denied".to_string()]);
        assert_eq!(classify(&err), Verdict::Unauthenticated);

        let err = ClientError::Messages(vec!["database timeout".to_string()]);
        assert_eq!(classify(&err), Verdict::Retry);
    }

    #[test]
    fn test_version_mismatch_is_not_retried() {
        let err = ClientError::GraphQL(vec![gql("stale", Some(FILES_VERSION_MISMATCH))]);
        assert_eq!(classify(&err), Verdict::Fatal);
        assert_eq!(
            classify(&ClientError::FilesVersionMismatch { expected: 3 }),
            Verdict::Fatal
        );
    }

    #[test]
    fn test_unrecognized_fails_closed() {
        assert_eq!(
            classify(&ClientError::Unrecognized("?".to_string())),
            Verdict::Fatal
        );
        assert_eq!(classify(&ClientError::GraphQL(Vec::new())), Verdict::Fatal);
    }

    #[test]
    fn test_io_errors_map_to_codes() {
        let err: ClientError = io::Error::new(io::ErrorKind::ConnectionRefused, "nope").into();
        assert_eq!(classify(&err), Verdict::Retry);
        let err: ClientError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(classify(&err), Verdict::Fatal);
    }
}
