pub mod backoff;
pub mod classify;
pub mod graphql;
pub mod memory;
pub mod subscription;

use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::sync::changes::Hashes;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub use backoff::Backoff;
pub use classify::{classify, Verdict};
pub use graphql::GraphqlTransport;
pub use memory::MemoryEnvironment;

/// A file (or directory marker) travelling between the two sides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    /// Normalized key; directories end with `/`
    pub path: String,
    pub mode: u32,
    pub content: Vec<u8>,
}

/// Hashes of the environment at a given filesVersion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSyncHashes {
    pub files_version: u64,
    pub hashes: Hashes,
}

/// File contents of the environment at a given filesVersion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSyncFiles {
    pub files_version: u64,
    pub files: Vec<FileContent>,
}

/// A batch of local mutations to publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishInput {
    /// filesVersion the batch was computed against
    pub expected_remote_files_version: u64,
    pub changed: Vec<FileContent>,
    pub deleted: Vec<String>,
}

impl PublishInput {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// A batch of environment mutations delivered by the subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBatch {
    pub remote_files_version: u64,
    pub changed: Vec<FileContent>,
    pub deleted: Vec<String>,
}

/// One GraphQL error as returned by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub extensions: Option<serde_json::Value>,
}

impl GraphQLError {
    /// `extensions.code`, if present
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

/// Everything that can go wrong talking to the environment
///
/// Each variant is one shape of failure; [`classify`] decides whether it is
/// worth retrying.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("network error ({code}): {message}")]
    Network { code: String, message: String },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("websocket closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    #[error("GraphQL error: {}", join_messages(.0))]
    GraphQL(Vec<GraphQLError>),

    #[error("server error: {}", .0.join("; "))]
    Messages(Vec<String>),

    #[error("the environment's files changed since version {expected}")]
    FilesVersionMismatch { expected: u64 },

    #[error("unrecognized response: {0}")]
    Unrecognized(String),
}

fn join_messages(errors: &[GraphQLError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The environment side of a sync
///
/// Implemented over GraphQL for real environments and in memory for tests.
#[async_trait]
pub trait EnvironmentTransport: Send + Sync {
    /// Latest filesVersion of the environment
    async fn remote_files_version(&self) -> Result<u64>;

    /// Hashes at `files_version`, or at the latest version when `None`
    async fn file_sync_hashes(&self, files_version: Option<u64>) -> Result<FileSyncHashes>;

    /// Contents of `paths` at `files_version`
    async fn file_sync_files(&self, paths: &[String], files_version: u64) -> Result<FileSyncFiles>;

    /// Publish local mutations, returning the environment's new filesVersion
    async fn publish_file_sync_events(&self, input: PublishInput) -> Result<u64>;

    /// Stream environment mutations newer than `local_files_version`
    ///
    /// The stream ends after a fatal error (delivered as the last item) or
    /// once `shutdown` fires.
    async fn subscribe(
        &self,
        local_files_version: u64,
        shutdown: Shutdown,
    ) -> Result<mpsc::Receiver<Result<RemoteBatch>>>;
}

/// filesVersion travels as a decimal string; accept numbers too
pub(crate) mod version_string {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        struct VersionVisitor;

        impl Visitor<'_> for VersionVisitor {
            type Value = u64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a filesVersion as a string or non-negative integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
                u64::try_from(v).map_err(|_| E::custom("negative filesVersion"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
                v.trim().parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

impl fmt::Display for RemoteBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {} ({} changed, {} deleted)",
            self.remote_files_version,
            self.changed.len(),
            self.deleted.len()
        )
    }
}
