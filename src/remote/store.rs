//! Object store clients for the S3-compatible output bucket.
//!
//! Built once at startup and shared by every worker.

use crate::config::{Config, StoreConfig};
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
///
/// # Returns
/// A tuple of (bucket, key) on success.
///
/// # Errors
/// Returns an error if the URI is malformed (missing scheme, bucket, or key).
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    without_scheme
        .split_once('/')
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))
}

/// Client options for long uploads of large rasters.
fn create_client_options(config: &StoreConfig) -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(10))
        // Whole-object puts of multi-GB BigTIFFs take a while
        .with_timeout(Duration::from_secs(600))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(128)
        .with_allow_http(!config.secure)
}

/// Retry configuration for transient failures of individual requests.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(300),
    }
}

/// Create an authenticated client for `bucket` on the configured endpoint.
///
/// Credentials and region are loaded from (in order):
/// - `store.access_key` / `store.secret_key` and `store.region` in the config
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
///
/// Requests use path-style addressing, and plain HTTP is allowed when
/// `store.secure` is off.
///
/// # Arguments
/// * `bucket` - Bucket to read from or write to
/// * `config` - Endpoint, credentials and TLS settings
///
/// # Errors
/// Returns an error if the builder rejects the endpoint or credentials.
pub fn create_s3_store(bucket: &str, config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!(
        "Creating S3 client for bucket {} at {}",
        bucket,
        config.endpoint_url()
    );

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(&config.region)
        .with_client_options(create_client_options(config))
        .with_retry(create_retry_config())
        // MinIO/SeaweedFS style deployments only support path-style addressing
        .with_virtual_hosted_style_request(false)
        .with_allow_http(!config.secure);

    if !config.endpoint.is_empty() {
        builder = builder.with_endpoint(config.endpoint_url());
    }
    if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
    }

    Ok(Arc::new(builder.build()?))
}

/// Create the store artifacts are published to.
/// Uses LocalFileSystem if local_path is set, otherwise S3.
///
/// A missing local directory is created first.
///
/// # Errors
/// Returns an error if the local directory cannot be created or the S3
/// client cannot be built.
pub fn create_output_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match &config.store.local_path {
        Some(local_path) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        None => create_s3_store(&config.store.bucket, &config.store),
    }
}
