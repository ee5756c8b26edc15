//! Configuration for the re-tiling pipeline.
//!
//! A single [`Config`] is loaded and validated at startup, then shared
//! read-only with every component.

use crate::remote::identity::DEFAULT_KEY_PREFIX;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the re-tiling pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Task catalog configuration
    pub catalog: CatalogConfig,

    /// Object store configuration
    pub store: StoreConfig,

    /// External warp tool configuration
    #[serde(default)]
    pub warp: WarpConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Task catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Path to the catalog (GeoJSON, JSON or Parquet; local or s3://)
    pub path: String,

    /// Seed for the task shuffle. Omit to shuffle from OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Drop descriptors that resolve to an already-seen artifact key
    #[serde(default = "default_true")]
    pub deduplicate: bool,
}

/// Object store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// S3 endpoint as host:port
    #[serde(default)]
    pub endpoint: String,

    /// Destination bucket
    pub bucket: String,

    /// Access key (falls back to AWS_ACCESS_KEY_ID)
    #[serde(default)]
    pub access_key: Option<String>,

    /// Secret key (falls back to AWS_SECRET_ACCESS_KEY)
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Use HTTPS for the endpoint
    #[serde(default)]
    pub secure: bool,

    /// Region reported to the S3 API
    #[serde(default = "default_region")]
    pub region: String,

    /// Base URL for unauthenticated existence probes.
    /// Defaults to the endpoint with the scheme implied by `secure`.
    #[serde(default)]
    pub read_base_url: Option<String>,

    /// Key prefix for published tiles
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Publish into a local directory instead of S3 (offline runs and tests).
    /// Existence is then checked against the directory, not over HTTP.
    #[serde(default)]
    pub local_path: Option<String>,

    /// Files above this size (MiB) are uploaded with multipart upload
    #[serde(default = "default_multipart_threshold_mb")]
    pub multipart_threshold_mb: u64,

    /// Multipart part size in MiB
    #[serde(default = "default_multipart_part_size_mb")]
    pub multipart_part_size_mb: u64,
}

impl StoreConfig {
    /// Base URL the existence probe reads from.
    pub fn read_base_url(&self) -> String {
        match &self.read_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let scheme = if self.secure { "https" } else { "http" };
                format!("{}://{}", scheme, self.endpoint)
            }
        }
    }

    /// Endpoint URL for the authenticated S3 API.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }

    /// Check if output goes to the local filesystem.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    pub fn multipart_threshold_bytes(&self) -> u64 {
        self.multipart_threshold_mb * 1024 * 1024
    }

    pub fn multipart_part_size_bytes(&self) -> usize {
        (self.multipart_part_size_mb * 1024 * 1024) as usize
    }
}

/// Settings for the external `gdalwarp` invocation.
///
/// The output CRS, pixel size and extent are fixed by the pipeline; only
/// storage and performance options live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarpConfig {
    /// gdalwarp executable
    #[serde(default = "default_gdalwarp_bin")]
    pub gdalwarp_bin: String,

    /// GDAL_CACHEMAX in MiB
    #[serde(default = "default_cache_max_mb")]
    pub cache_max_mb: u64,

    /// GeoTIFF block size (both axes)
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// GeoTIFF compression codec
    #[serde(default = "default_compress")]
    pub compress: String,

    /// GeoTIFF predictor
    #[serde(default = "default_predictor")]
    pub predictor: u8,

    /// Compression threads per invocation
    #[serde(default = "default_num_threads")]
    pub num_threads: u32,

    /// Allow sparse output files
    #[serde(default = "default_true")]
    pub sparse_ok: bool,

    /// Force BigTIFF output
    #[serde(default = "default_true")]
    pub big_tiff: bool,
}

impl Default for WarpConfig {
    fn default() -> Self {
        Self {
            gdalwarp_bin: default_gdalwarp_bin(),
            cache_max_mb: default_cache_max_mb(),
            block_size: default_block_size(),
            compress: default_compress(),
            predictor: default_predictor(),
            num_threads: default_num_threads(),
            sparse_ok: true,
            big_tiff: true,
        }
    }
}

/// What to do when the existence probe itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailurePolicy {
    /// Fail the task; a later batch re-run retries it
    #[default]
    Fail,
    /// Assume the artifact is missing and redo the work
    TreatAsMissing,
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of tasks in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Scratch directory for warp outputs
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Existence probe timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Policy for probe failures
    #[serde(default)]
    pub probe_failure_policy: ProbeFailurePolicy,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            worker_threads: None,
            work_dir: default_work_dir(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_failure_policy: ProbeFailurePolicy::Fail,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.catalog.path.trim().is_empty() {
            anyhow::bail!("catalog.path must be set");
        }
        if self.store.bucket.trim().is_empty() {
            anyhow::bail!("store.bucket must be set");
        }
        if !self.store.is_local() {
            if self.store.endpoint.trim().is_empty() {
                anyhow::bail!("store.endpoint must be set unless store.local_path is used");
            }
            if self.store.access_key.is_some() != self.store.secret_key.is_some() {
                anyhow::bail!("store.access_key and store.secret_key must be set together");
            }
            let base = self.store.read_base_url();
            if let Err(e) = reqwest::Url::parse(&base) {
                anyhow::bail!("store.read_base_url '{}' is not a valid URL: {}", base, e);
            }
        }
        if self.store.multipart_part_size_mb < 5 {
            anyhow::bail!("store.multipart_part_size_mb must be >= 5 (S3 minimum part size)");
        }
        if self.processing.concurrency == 0 {
            anyhow::bail!("Concurrency must be > 0");
        }
        if self.processing.probe_timeout_secs == 0 {
            anyhow::bail!("processing.probe_timeout_secs must be > 0");
        }
        if self.processing.enable_metrics && self.processing.metrics_interval_secs == 0 {
            anyhow::bail!("processing.metrics_interval_secs must be > 0");
        }
        if self.warp.gdalwarp_bin.trim().is_empty() {
            anyhow::bail!("warp.gdalwarp_bin must be set");
        }
        if self.warp.block_size == 0 || self.warp.block_size % 16 != 0 {
            anyhow::bail!("warp.block_size must be a positive multiple of 16");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_true() -> bool { true }
fn default_region() -> String { "us-east-1".to_string() }
fn default_key_prefix() -> String { DEFAULT_KEY_PREFIX.to_string() }
fn default_multipart_threshold_mb() -> u64 { 64 }
fn default_multipart_part_size_mb() -> u64 { 16 }
fn default_gdalwarp_bin() -> String { "gdalwarp".to_string() }
fn default_cache_max_mb() -> u64 { 9216 }
fn default_block_size() -> u32 { 1024 }
fn default_compress() -> String { "DEFLATE".to_string() }
fn default_predictor() -> u8 { 2 }
fn default_num_threads() -> u32 { 8 }
fn default_concurrency() -> usize { 70 }
fn default_work_dir() -> PathBuf { std::env::temp_dir().join("equi7-retile") }
fn default_probe_timeout_secs() -> u64 { 30 }
fn default_metrics_interval() -> u64 { 30 }

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
catalog:
  path: global_input.geojson
store:
  endpoint: "192.168.49.30:8333"
  bucket: tmp-global-geomorpho
  access_key: key
  secret_key: secret
"#;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::from_yaml(MINIMAL_YAML).unwrap();

        assert_eq!(config.processing.concurrency, 70);
        assert_eq!(config.processing.probe_failure_policy, ProbeFailurePolicy::Fail);
        assert_eq!(config.store.key_prefix, "latlon/v6");
        assert_eq!(config.warp.cache_max_mb, 9216);
        assert_eq!(config.warp.compress, "DEFLATE");
        assert!(config.catalog.deduplicate);
        assert!(config.catalog.seed.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_read_base_url() {
        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        assert_eq!(config.store.read_base_url(), "http://192.168.49.30:8333");

        config.store.secure = true;
        assert_eq!(config.store.read_base_url(), "https://192.168.49.30:8333");

        config.store.read_base_url = Some("http://public.example.com/".to_string());
        assert_eq!(config.store.read_base_url(), "http://public.example.com");
    }

    #[test]
    fn test_probe_policy_parses_snake_case() {
        let yaml = format!("{}processing:\n  probe_failure_policy: treat_as_missing\n", MINIMAL_YAML);
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(
            config.processing.probe_failure_policy,
            ProbeFailurePolicy::TreatAsMissing
        );
    }

    #[test]
    fn test_json_round_trip_through_yaml() {
        let config = Config::from_yaml(MINIMAL_YAML).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.store.bucket, "tmp-global-geomorpho");
        assert!(config.to_yaml().unwrap().contains("tmp-global-geomorpho"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.processing.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.store.secret_key = None;
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.store.endpoint.clear();
        assert!(config.validate().is_err());
        config.store.local_path = Some("/tmp/out".to_string());
        assert!(config.validate().is_ok());

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.warp.block_size = 1000;
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.store.read_base_url = Some("public.example.com".to_string());
        assert!(config.validate().is_err());
    }
}
