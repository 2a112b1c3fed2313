//! Remote search adapter: what can be installed, and how to fetch it.

mod client;
mod index;
mod retry;

pub use client::HttpClient;
pub use index::{HttpIndex, IndexDocument};
pub use retry::{MAX_RETRIES, NonRetryableError};

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::model::Kind;

/// An installable artifact listed by the remote index.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    pub kind: Kind,
    /// `lilypond` for toolchain entries
    pub name: String,
    pub version: String,
    pub url: String,
    pub sha256: Option<String>,
    pub dependencies: Vec<String>,
    /// False when the artifact targets another platform
    pub installable: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteIndex: Send + Sync {
    /// Every entry of `kind` the index knows about.
    async fn list_available(&self, kind: Kind) -> Result<Vec<RemoteEntry>>;

    /// Download the artifact of `entry` to `dest`. Returns the byte count.
    async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64>;
}

/// `<os>-<arch>` of the running binary, e.g. `linux-x86_64`.
pub fn current_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}
