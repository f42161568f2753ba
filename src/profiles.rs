//! Profile hydration: auth material is always staged onto the local
//! filesystem so the launcher can hand children regular paths.
//!
//! The backing store layout mirrors what operators upload:
//!
//! ```text
//! <prefix>/active/*.json   per-child auth JSON payloads
//! <prefix>/key.txt         optional newline-delimited API keys
//! ```
//!
//! Only `active/` is consumed. Hydrated files land under the cache directory
//! and are wiped on each run so restarts never see stale profiles.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use thiserror::Error;
use tracing::info;

use crate::types::AuthProfile;

/// Hydrated auth material: a directory of profile JSONs plus an optional
/// API-key file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrationResult {
    pub profiles_dir: PathBuf,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum HydrationError {
    #[error("Profile directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("Profile path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("No auth profiles found under {0}")]
    EmptyActiveSet(String),
    #[error("Failed to fetch auth profiles from object store: {0}")]
    Fetch(anyhow::Error),
    #[error("Failed to download API key file from {key}: {cause}")]
    KeyFile { key: String, cause: anyhow::Error },
    #[error("Failed to stage hydrated files locally: {0}")]
    Stage(#[from] std::io::Error),
}

/// Hydrates auth profiles into a local directory.
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    fn backend_name(&self) -> &'static str;
    async fn hydrate(&self) -> Result<HydrationResult, HydrationError>;
}

/// Capability over the remote object store. `fetch` returns `None` when the
/// key does not exist, which the provider treats as non-fatal only for the
/// optional key file.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Reads profiles from an existing on-disk directory.
pub struct LocalProfileProvider {
    profile_dir: PathBuf,
}

impl LocalProfileProvider {
    pub fn new(profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile_dir: profile_dir.into(),
        }
    }
}

#[async_trait]
impl ProfileProvider for LocalProfileProvider {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn hydrate(&self) -> Result<HydrationResult, HydrationError> {
        let directory = &self.profile_dir;
        if !directory.exists() {
            return Err(HydrationError::MissingDirectory(directory.clone()));
        }
        if !directory.is_dir() {
            return Err(HydrationError::NotADirectory(directory.clone()));
        }

        let directory = fs::canonicalize(directory)?;
        let key_candidate = directory
            .parent()
            .map(|parent| parent.join("key.txt"))
            .filter(|candidate| candidate.exists());

        Ok(HydrationResult {
            profiles_dir: directory,
            key_file: key_candidate,
        })
    }
}

/// Downloads profiles from an object store into a local cache directory.
pub struct ObjectStoreProfileProvider {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    cache_dir: PathBuf,
}

impl ObjectStoreProfileProvider {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: Option<&str>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.map(|p| p.trim_matches('/').to_string()).unwrap_or_default(),
            cache_dir: cache_dir.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

#[async_trait]
impl ProfileProvider for ObjectStoreProfileProvider {
    fn backend_name(&self) -> &'static str {
        "object-store"
    }

    async fn hydrate(&self) -> Result<HydrationResult, HydrationError> {
        let active_dir = self.cache_dir.join("active");
        info!(
            prefix = %self.key("active"),
            cache_dir = %self.cache_dir.display(),
            "Hydrating auth profiles from object store"
        );
        clean_directory(&active_dir)?;

        let active_prefix = format!("{}/", self.key("active"));
        let keys = self
            .store
            .list_keys(&active_prefix)
            .await
            .map_err(HydrationError::Fetch)?;

        let mut downloaded = 0usize;
        for key in keys {
            if !key.ends_with(".json") {
                continue;
            }
            let filename = key.rsplit('/').next().unwrap_or(&key);
            let bytes = self
                .store
                .fetch(&key)
                .await
                .map_err(HydrationError::Fetch)?
                .ok_or_else(|| {
                    HydrationError::Fetch(anyhow::anyhow!("listed object vanished: {key}"))
                })?;
            fs::write(active_dir.join(filename), bytes)?;
            downloaded += 1;
        }

        if downloaded == 0 {
            return Err(HydrationError::EmptyActiveSet(active_prefix));
        }

        let key_object = self.key("key.txt");
        let key_file = match self.store.fetch(&key_object).await {
            Ok(Some(bytes)) => {
                let key_path = self.cache_dir.join("key.txt");
                fs::write(&key_path, bytes)?;
                Some(fs::canonicalize(key_path)?)
            }
            Ok(None) => None,
            Err(cause) => {
                return Err(HydrationError::KeyFile {
                    key: key_object,
                    cause,
                })
            }
        };

        Ok(HydrationResult {
            profiles_dir: fs::canonicalize(active_dir)?,
            key_file,
        })
    }
}

/// Production object store over S3.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(bucket: impl Into<String>, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
        }
        Ok(keys)
    }

    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let bytes = output.body.collect().await?.into_bytes();
                Ok(Some(bytes.to_vec()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                Err(anyhow::Error::new(service_err))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Profile directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("Profile path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("Failed to read profile directory {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Enumerate `*.json` files in `dir`, sorted by filename. The filename stem
/// becomes the profile name; the returned paths are absolute.
pub fn discover_profiles(dir: &Path) -> Result<Vec<AuthProfile>, DiscoveryError> {
    if !dir.exists() {
        return Err(DiscoveryError::MissingDirectory(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(DiscoveryError::NotADirectory(dir.to_path_buf()));
    }

    let read_err = |source| DiscoveryError::Read {
        path: dir.to_path_buf(),
        source,
    };

    let mut json_paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(read_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json") && path.is_file())
        .collect();
    json_paths.sort();

    let mut profiles = Vec::with_capacity(json_paths.len());
    for path in json_paths {
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let absolute = fs::canonicalize(&path).map_err(|source| DiscoveryError::Read {
            path: path.clone(),
            source,
        })?;
        profiles.push(AuthProfile::new(stem, absolute));
    }
    Ok(profiles)
}

fn clean_directory(directory: &Path) -> std::io::Result<()> {
    if directory.exists() {
        fs::remove_dir_all(directory)?;
    }
    fs::create_dir_all(directory)
}
