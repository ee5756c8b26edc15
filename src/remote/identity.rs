//! Canonical identity of a finished artifact.
//!
//! The object key computed here is both the idempotency key probed before any
//! work starts and the destination the publisher uploads to. Every path, key
//! and URL for a task is derived from [`tile_folder`], so the probe, the local
//! output and the upload can never disagree.
//!
//! The read URL is assembled from the parts of the key's
//! [`object_store::path::Path`], the same encoded parts the publisher writes
//! under, so a name containing `#`, `?` or `%` addresses one object in both.

use crate::config::Config;
use crate::task::TaskDescriptor;
use anyhow::{anyhow, Context, Result};
use object_store::path::Path as ObjectPath;
use reqwest::Url;
use std::fmt;
use std::path::{Path, PathBuf};

/// Default key prefix under which lat/lon tiles are published.
pub const DEFAULT_KEY_PREFIX: &str = "latlon/v6";

/// Legacy token in Equi7 tile ids and its short replacement.
const LEGACY_ALIAS: (&str, &str) = ("extracont", "aa");

/// Normalize a target tile id for use as a path component.
///
/// Lowercases, turns `_` separators into `.`, and rewrites the legacy
/// `extracont` token to `aa`. Idempotent.
pub fn normalize_tile_id(tile_id: &str) -> String {
    tile_id
        .to_lowercase()
        .replace('_', ".")
        .replace(LEGACY_ALIAS.0, LEGACY_ALIAS.1)
}

/// Folder shared by the local output directory and the remote key:
/// `{source_tile_id}_{normalized_target_tile_id}`.
pub fn tile_folder(descriptor: &TaskDescriptor) -> String {
    format!(
        "{}_{}",
        descriptor.source_tile_id,
        normalize_tile_id(&descriptor.target_tile_id)
    )
}

/// Object key `{prefix}/{tile_folder}/{file_name}`.
pub fn artifact_key(prefix: &str, descriptor: &TaskDescriptor) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", tile_folder(descriptor), descriptor.file_name)
    } else {
        format!("{}/{}/{}", prefix, tile_folder(descriptor), descriptor.file_name)
    }
}

/// Where a task's artifact lives, locally while in flight and remotely once done.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactAddress {
    /// Object key within the bucket
    pub key: String,

    /// Public read URL probed for existence
    pub url: String,

    /// Task-unique local output file
    pub local_path: PathBuf,
}

impl ArtifactAddress {
    /// Location of the artifact inside the object store.
    pub fn store_path(&self) -> ObjectPath {
        ObjectPath::from(self.key.as_str())
    }
}

impl fmt::Display for ArtifactAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Resolves descriptors to addresses. Pure; holds only static configuration.
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    key_prefix: String,
    read_base: Url,
    work_dir: PathBuf,
}

impl ArtifactResolver {
    /// Create a resolver for artifacts read back from `{read_base_url}/{bucket}`.
    ///
    /// # Errors
    /// Returns an error if `read_base_url` is not an absolute URL that can
    /// carry a path (`http://host:port` or `https://host/some/prefix`).
    pub fn new(
        key_prefix: impl Into<String>,
        read_base_url: &str,
        bucket: &str,
        work_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut read_base =
            Url::parse(read_base_url).with_context(|| format!("Invalid read base URL '{}'", read_base_url))?;
        read_base
            .path_segments_mut()
            .map_err(|_| anyhow!("Read base URL '{}' cannot carry a path", read_base_url))?
            .pop_if_empty()
            .push(bucket);

        Ok(Self::with_read_base(key_prefix, read_base, work_dir))
    }

    fn with_read_base(key_prefix: impl Into<String>, read_base: Url, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            read_base,
            work_dir: work_dir.into(),
        }
    }

    /// Build the resolver for a configured store.
    ///
    /// A local store has no HTTP endpoint, so its addresses carry `file://`
    /// URLs pointing into the publish directory.
    pub fn from_config(config: &Config) -> Result<Self> {
        match &config.store.local_path {
            Some(dir) => {
                let dir = std::path::absolute(dir)
                    .with_context(|| format!("Failed to resolve local store path '{}'", dir))?;
                let read_base = Url::from_directory_path(&dir)
                    .map_err(|_| anyhow!("Local store path '{}' is not a directory path", dir.display()))?;
                Ok(Self::with_read_base(
                    config.store.key_prefix.clone(),
                    read_base,
                    config.processing.work_dir.clone(),
                ))
            }
            None => Self::new(
                config.store.key_prefix.clone(),
                &config.store.read_base_url(),
                &config.store.bucket,
                config.processing.work_dir.clone(),
            ),
        }
    }

    /// Canonical address of the artifact `descriptor` produces.
    pub fn resolve(&self, descriptor: &TaskDescriptor) -> ArtifactAddress {
        let key = artifact_key(&self.key_prefix, descriptor);

        let mut url = self.read_base.clone();
        // Always Ok: `new` and `from_config` only accept base URLs
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(ObjectPath::from(key.as_str()).parts().map(|part| part.as_ref().to_owned()));
        }

        let local_path = self
            .work_dir
            .join(tile_folder(descriptor))
            .join(&descriptor.file_name);

        ArtifactAddress {
            key,
            url: url.into(),
            local_path,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}
