//! HTTP implementation of the remote index.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::{HttpClient, RemoteEntry, RemoteIndex, current_platform};
use crate::model::Kind;

const USER_AGENT: &str = concat!("lyp/", env!("CARGO_PKG_VERSION"));

/// Layout of `<index>/index.json`.
#[derive(Debug, Default, Deserialize)]
pub struct IndexDocument {
    #[serde(default)]
    pub lilypond: Vec<IndexLilypond>,
    #[serde(default)]
    pub packages: Vec<IndexPackage>,
}

#[derive(Debug, Deserialize)]
pub struct IndexLilypond {
    pub version: String,
    pub url: String,
    pub sha256: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IndexPackage {
    pub name: String,
    pub version: String,
    pub url: String,
    pub sha256: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

pub struct HttpIndex {
    http: HttpClient,
    base: Url,
    platform: String,
    index_timeout: Duration,
}

impl HttpIndex {
    pub fn new(index_url: &str, index_timeout: Duration, download_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(index_timeout)
            .timeout(download_timeout)
            .build()?;
        Ok(Self {
            http: HttpClient::new(client),
            base: base_url(index_url)?,
            platform: current_platform(),
            index_timeout,
        })
    }

    /// Pretend to run on another platform.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    fn resolve_url(&self, url: &str) -> Result<String> {
        let joined = self
            .base
            .join(url)
            .with_context(|| format!("Invalid artifact URL '{}'", url))?;
        Ok(joined.to_string())
    }

    async fn document(&self) -> Result<IndexDocument> {
        let url = self.base.join("index.json")?;
        info!("Reading package index {}", url);
        tokio::time::timeout(self.index_timeout, self.http.get_json(url.as_str()))
            .await
            .with_context(|| format!("Timed out reading {}", url))?
    }

    fn entries(&self, document: IndexDocument, kind: Kind) -> Result<Vec<RemoteEntry>> {
        match kind {
            Kind::Lilypond => document
                .lilypond
                .into_iter()
                .map(|l| {
                    Ok(RemoteEntry {
                        kind,
                        name: "lilypond".to_string(),
                        installable: l.platform.as_deref().is_none_or(|p| p == self.platform),
                        url: self.resolve_url(&l.url)?,
                        version: l.version,
                        sha256: l.sha256,
                        dependencies: vec![],
                    })
                })
                .collect(),
            Kind::Package => document
                .packages
                .into_iter()
                .map(|p| {
                    Ok(RemoteEntry {
                        kind,
                        url: self.resolve_url(&p.url)?,
                        name: p.name,
                        version: p.version,
                        sha256: p.sha256,
                        dependencies: p.dependencies,
                        installable: true,
                    })
                })
                .collect(),
        }
    }
}

/// Directory-style base URL so relative artifact paths join under it.
fn base_url(index_url: &str) -> Result<Url> {
    let trimmed = index_url.trim_end_matches("/index.json");
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    Url::parse(&with_slash).with_context(|| format!("Invalid index URL '{}'", index_url))
}

#[async_trait]
impl RemoteIndex for HttpIndex {
    #[tracing::instrument(skip(self))]
    async fn list_available(&self, kind: Kind) -> Result<Vec<RemoteEntry>> {
        let document = self.document().await?;
        let entries = self.entries(document, kind)?;
        debug!("Index lists {} {} entries", entries.len(), kind);
        Ok(entries)
    }

    #[tracing::instrument(skip(self, entry))]
    async fn fetch(&self, entry: &RemoteEntry, dest: &Path) -> Result<u64> {
        info!("Downloading {}@{} from {}", entry.name, entry.version, entry.url);
        self.http
            .download_file(&entry.url, || {
                std::fs::File::create(dest).with_context(|| format!("Failed to create {:?}", dest))
            })
            .await
            .with_context(|| format!("Failed to download {}", entry.url))
    }
}
