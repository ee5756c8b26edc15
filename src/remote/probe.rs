//! Existence probes: the idempotency gate in front of every task.
//!
//! The object store is the only completion ledger. A task whose artifact
//! already exists is skipped before any local work happens.

use crate::config::ProbeFailurePolicy;
use crate::remote::identity::ArtifactAddress;
use async_trait::async_trait;
use object_store::{ObjectStore, ObjectStoreExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The probe could not tell whether the artifact exists.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("existence probe for {target} failed: {reason}")]
    Transient { target: String, reason: String },
}

/// How a probe response status is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Found,
    Missing,
    Transient,
}

/// Interpret the HTTP status of a `HEAD` against the public read endpoint.
///
/// Timeouts, throttling and server errors say nothing about existence.
pub fn classify_status(status: u16) -> ProbeStatus {
    match status {
        200..=299 => ProbeStatus::Found,
        408 | 429 => ProbeStatus::Transient,
        400..=499 => ProbeStatus::Missing,
        _ => ProbeStatus::Transient,
    }
}

/// Checks whether an artifact is already published.
#[async_trait]
pub trait ExistenceProbe: Send + Sync {
    async fn exists(&self, address: &ArtifactAddress) -> Result<bool, ProbeError>;
}

/// Unauthenticated `HEAD` against the store's public read URL.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a probe with its own connection pool.
    ///
    /// # Arguments
    /// * `timeout` - Upper bound for one `HEAD`, connect included
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("equi7-retile/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ExistenceProbe for HttpProbe {
    async fn exists(&self, address: &ArtifactAddress) -> Result<bool, ProbeError> {
        let response = self
            .client
            .head(&address.url)
            .send()
            .await
            .map_err(|e| ProbeError::Transient {
                target: address.url.clone(),
                reason: if e.is_timeout() {
                    "timed out".to_string()
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        match classify_status(status.as_u16()) {
            ProbeStatus::Found => Ok(true),
            ProbeStatus::Missing => Ok(false),
            ProbeStatus::Transient => Err(ProbeError::Transient {
                target: address.url.clone(),
                reason: format!("HTTP {}", status),
            }),
        }
    }
}

/// Metadata request through an object store client.
///
/// Used when publishing to a local directory, where there is no public
/// HTTP endpoint to probe.
pub struct StoreProbe {
    store: Arc<dyn ObjectStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExistenceProbe for StoreProbe {
    async fn exists(&self, address: &ArtifactAddress) -> Result<bool, ProbeError> {
        match self.store.head(&address.store_path()).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(ProbeError::Transient {
                target: address.key.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Outcome of the gate for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The artifact exists; nothing to do
    AlreadyPublished,
    /// The artifact is missing; run the task
    Proceed,
}

/// Applies the probe-failure policy on top of a probe.
pub struct IdempotencyGate {
    probe: Arc<dyn ExistenceProbe>,
    policy: ProbeFailurePolicy,
}

impl IdempotencyGate {
    pub fn new(probe: Arc<dyn ExistenceProbe>, policy: ProbeFailurePolicy) -> Self {
        Self { probe, policy }
    }

    /// Decide whether the task for `address` still has to run.
    ///
    /// # Returns
    /// [`GateDecision::AlreadyPublished`] if the artifact exists, otherwise
    /// [`GateDecision::Proceed`]. Under [`ProbeFailurePolicy::TreatAsMissing`]
    /// an inconclusive answer also proceeds.
    ///
    /// # Errors
    /// Returns [`ProbeError::Transient`] when the probe cannot tell and the
    /// policy is [`ProbeFailurePolicy::Fail`].
    pub async fn check(&self, address: &ArtifactAddress) -> Result<GateDecision, ProbeError> {
        match self.probe.exists(address).await {
            Ok(true) => Ok(GateDecision::AlreadyPublished),
            Ok(false) => Ok(GateDecision::Proceed),
            Err(e) => match self.policy {
                ProbeFailurePolicy::Fail => Err(e),
                ProbeFailurePolicy::TreatAsMissing => {
                    tracing::warn!(address = %address, error = %e, "Probe failed, treating artifact as missing");
                    Ok(GateDecision::Proceed)
                }
            },
        }
    }
}
