// GraphQL client for a hosted environment
//
// Queries and mutations go over HTTPS; the live feed of environment changes
// runs over a websocket (see `subscription`). Every call is retried through
// the shared `Backoff` according to `classify`.

use super::backoff::Backoff;
use super::classify::FILES_VERSION_MISMATCH;
use super::subscription::{self, SubscriptionConfig};
use super::{
    version_string, ClientError, EnvironmentTransport, FileContent, FileSyncFiles, FileSyncHashes,
    GraphQLError, PublishInput, RemoteBatch,
};
use crate::error::{Result, SyncError};
use crate::shutdown::Shutdown;
use crate::sync::changes::Hashes;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

const REMOTE_FILES_VERSION: &str = "query RemoteFilesVersion { remoteFilesVersion }";

const FILE_SYNC_HASHES: &str = "query FileSyncHashes($filesVersion: String) {
  fileSyncHashes(filesVersion: $filesVersion) { filesVersion hashes }
}";

const FILE_SYNC_FILES: &str = "query FileSyncFiles($paths: [String!]!, $filesVersion: String!) {
  fileSyncFiles(paths: $paths, filesVersion: $filesVersion, encoding: base64) {
    filesVersion
    files { path mode content }
  }
}";

const PUBLISH_FILE_SYNC_EVENTS: &str = "mutation PublishFileSyncEvents($input: PublishFileSyncEventsInput!) {
  publishFileSyncEvents(input: $input) { remoteFilesVersion }
}";

pub(crate) const REMOTE_FILE_SYNC_EVENTS: &str = "subscription RemoteFileSyncEvents($localFilesVersion: String!) {
  remoteFileSyncEvents(localFilesVersion: $localFilesVersion, encoding: base64) {
    remoteFilesVersion
    changed { path mode content }
    deleted { path }
  }
}";

/// A file as it appears on the wire, content base64-encoded
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireFile {
    pub path: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub content: String,
}

impl WireFile {
    fn encode(file: &FileContent) -> Self {
        Self {
            path: file.path.clone(),
            mode: file.mode,
            content: BASE64.encode(&file.content),
        }
    }

    pub(crate) fn decode(self) -> std::result::Result<FileContent, ClientError> {
        let content = BASE64.decode(self.content.as_bytes()).map_err(|e| {
            ClientError::Unrecognized(format!("invalid base64 content for {}: {}", self.path, e))
        })?;
        Ok(FileContent {
            path: self.path,
            mode: self.mode,
            content,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WirePath {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HashesData {
    file_sync_hashes: WireHashes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHashes {
    #[serde(with = "version_string")]
    files_version: u64,
    hashes: Hashes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesData {
    file_sync_files: WireFiles,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFiles {
    #[serde(with = "version_string")]
    files_version: u64,
    files: Vec<WireFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionData {
    #[serde(with = "version_string")]
    remote_files_version: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishData {
    publish_file_sync_events: VersionData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireBatch {
    #[serde(with = "version_string")]
    pub remote_files_version: u64,
    #[serde(default)]
    pub changed: Vec<WireFile>,
    #[serde(default)]
    pub deleted: Vec<WirePath>,
}

impl WireBatch {
    pub(crate) fn decode(self) -> std::result::Result<RemoteBatch, ClientError> {
        Ok(RemoteBatch {
            remote_files_version: self.remote_files_version,
            changed: self
                .changed
                .into_iter()
                .map(WireFile::decode)
                .collect::<std::result::Result<_, _>>()?,
            deleted: self.deleted.into_iter().map(|p| p.path).collect(),
        })
    }
}

/// Split a GraphQL response into data or a classified error
///
/// Used for HTTP bodies and for subscription `next` payloads alike.
pub(crate) fn parse_response(body: Value) -> std::result::Result<Value, ClientError> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            return Err(parse_errors(errors));
        }
    }
    match body.get("data") {
        Some(data) if !data.is_null() => Ok(data.clone()),
        _ => Err(ClientError::Unrecognized(truncate(&body.to_string()))),
    }
}

/// Errors are usually GraphQL error objects, sometimes bare strings
pub(crate) fn parse_errors(errors: &[Value]) -> ClientError {
    if errors.iter().all(Value::is_string) {
        return ClientError::Messages(
            errors
                .iter()
                .filter_map(|e| e.as_str().map(str::to_string))
                .collect(),
        );
    }
    let parsed: std::result::Result<Vec<GraphQLError>, _> = errors
        .iter()
        .map(|e| serde_json::from_value(e.clone()))
        .collect();
    match parsed {
        Ok(errors) => ClientError::GraphQL(errors),
        Err(_) => ClientError::Unrecognized(truncate(&Value::from(errors.to_vec()).to_string())),
    }
}

fn decode<T: DeserializeOwned>(data: Value) -> std::result::Result<T, ClientError> {
    serde_json::from_value(data).map_err(|e| ClientError::Unrecognized(e.to_string()))
}

fn truncate(text: &str) -> String {
    const LIMIT: usize = 512;
    if text.len() <= LIMIT {
        return text.to_string();
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// The real environment, reached over HTTPS and websockets
pub struct GraphqlTransport {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    backoff: Backoff,
    shutdown: Shutdown,
}

impl GraphqlTransport {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        backoff: Backoff,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("devsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            token,
            backoff,
            shutdown,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Websocket endpoint for subscriptions, derived from the HTTP endpoint
    pub fn ws_url(&self) -> String {
        if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.url.clone()
        }
    }

    async fn execute_once(&self, query: &str, variables: &Value) -> std::result::Result<Value, ClientError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            // Servers may reject a stale publish with a 409 and a GraphQL body
            if let Ok(body) = serde_json::from_str::<Value>(&text) {
                if let Some(errors) = body.get("errors").and_then(Value::as_array) {
                    if let ClientError::GraphQL(errors) = parse_errors(errors) {
                        if errors.iter().any(|e| e.code() == Some(FILES_VERSION_MISMATCH)) {
                            return Err(ClientError::GraphQL(errors));
                        }
                    }
                }
            }
            return Err(ClientError::Http {
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|_| ClientError::Unrecognized(truncate(&text)))?;
        parse_response(body)
    }

    async fn execute<T: DeserializeOwned + Send>(&self, name: &str, query: &str, variables: Value) -> Result<T> {
        tracing::debug!("GraphQL {}", name);
        self.backoff
            .retry(name, &self.shutdown, || async {
                let data = self.execute_once(query, &variables).await?;
                decode::<T>(data)
            })
            .await
    }
}

#[async_trait]
impl EnvironmentTransport for GraphqlTransport {
    async fn remote_files_version(&self) -> Result<u64> {
        let data: VersionData = self
            .execute("remoteFilesVersion", REMOTE_FILES_VERSION, json!({}))
            .await?;
        Ok(data.remote_files_version)
    }

    async fn file_sync_hashes(&self, files_version: Option<u64>) -> Result<FileSyncHashes> {
        let variables = json!({ "filesVersion": files_version.map(|v| v.to_string()) });
        let data: HashesData = self
            .execute("fileSyncHashes", FILE_SYNC_HASHES, variables)
            .await?;
        Ok(FileSyncHashes {
            files_version: data.file_sync_hashes.files_version,
            hashes: data.file_sync_hashes.hashes,
        })
    }

    async fn file_sync_files(&self, paths: &[String], files_version: u64) -> Result<FileSyncFiles> {
        if paths.is_empty() {
            return Ok(FileSyncFiles {
                files_version,
                files: Vec::new(),
            });
        }

        let variables = json!({
            "paths": paths,
            "filesVersion": files_version.to_string(),
        });
        let data: FilesData = self
            .execute("fileSyncFiles", FILE_SYNC_FILES, variables)
            .await?;
        let files = data
            .file_sync_files
            .files
            .into_iter()
            .map(WireFile::decode)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(FileSyncFiles {
            files_version: data.file_sync_files.files_version,
            files,
        })
    }

    async fn publish_file_sync_events(&self, input: PublishInput) -> Result<u64> {
        let expected = input.expected_remote_files_version;
        let variables = json!({
            "input": {
                "expectedRemoteFilesVersion": expected.to_string(),
                "changed": input.changed.iter().map(WireFile::encode).collect::<Vec<_>>(),
                "deleted": input
                    .deleted
                    .iter()
                    .map(|path| WirePath { path: path.clone() })
                    .collect::<Vec<_>>(),
            }
        });

        let data: PublishData = self
            .backoff
            .retry("publishFileSyncEvents", &self.shutdown, || async {
                match self.execute_once(PUBLISH_FILE_SYNC_EVENTS, &variables).await {
                    Err(ClientError::GraphQL(errors))
                        if errors.iter().any(|e| e.code() == Some(FILES_VERSION_MISMATCH)) =>
                    {
                        Err(ClientError::FilesVersionMismatch { expected })
                    }
                    other => decode(other?),
                }
            })
            .await?;

        Ok(data.publish_file_sync_events.remote_files_version)
    }

    async fn subscribe(
        &self,
        local_files_version: u64,
        shutdown: Shutdown,
    ) -> Result<mpsc::Receiver<Result<RemoteBatch>>> {
        let config = SubscriptionConfig {
            url: self.ws_url(),
            token: self.token.clone(),
            backoff: self.backoff,
        };
        Ok(subscription::spawn(config, local_files_version, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;

    #[test]
    fn test_ws_url() {
        let (_trigger, shutdown) = shutdown::channel();
        let transport = GraphqlTransport::new(
            "https://app.example.com/graphql",
            None,
            Backoff::default(),
            shutdown,
        )
        .unwrap();
        assert_eq!(transport.ws_url(), "wss://app.example.com/graphql");
    }

    #[test]
    fn test_parse_response_variants() {
        let ok = parse_response(json!({ "data": { "remoteFilesVersion": "3" } })).unwrap();
        assert_eq!(ok["remoteFilesVersion"], "3");

        let err = parse_response(json!({ "errors": [{ "message": "boom" }] })).unwrap_err();
        assert!(matches!(err, ClientError::GraphQL(ref e) if e[0].message == "boom"));

        let err = parse_response(json!({ "errors": ["plain"] })).unwrap_err();
        assert!(matches!(err, ClientError::Messages(ref m) if m == &["plain".to_string()]));

        let err = parse_response(json!({ "unexpected": true })).unwrap_err();
        assert!(matches!(err, ClientError::Unrecognized(_)));
    }

    #[test]
    fn test_wire_batch_decodes_base64() {
        let batch: WireBatch = serde_json::from_value(json!({
            "remoteFilesVersion": "5",
            "changed": [{ "path": "a.txt", "mode": 420, "content": "aGVsbG8=" }],
            "deleted": [{ "path": "b.txt" }],
        }))
        .unwrap();
        let batch = batch.decode().unwrap();
        assert_eq!(batch.remote_files_version, 5);
        assert_eq!(batch.changed[0].content, b"hello");
        assert_eq!(batch.deleted, vec!["b.txt".to_string()]);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(400);
        let truncated = truncate(&text);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 515);
    }
}
