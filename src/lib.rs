pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod fs_util;
pub mod lock;
pub mod path;
pub mod shutdown;
pub mod sync;
pub mod transport;

pub use error::{Result, SyncError};
