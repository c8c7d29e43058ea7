//! Issue one operation to many players at once and collect per-player outcomes.
//!
//! Every target runs in its own future with its own timeout, so total latency
//! is bounded by the slowest reachable peer and a dead peer cannot hold up the
//! rest. Offline peers fail fast without a request.

use crate::error::{CoreError, Result};
use crate::local::LocalTarget;
use crate::peer::LOCAL_PEER_ID;
use crate::registry::PeerRegistry;
use crate::transport::{PeerClient, TransportError};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    ApplyConfig,
    UploadMedia,
    PushUpdate,
}

impl FromStr for OperationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "apply-config" => Ok(OperationKind::ApplyConfig),
            "upload-media" => Ok(OperationKind::UploadMedia),
            "push-update" => Ok(OperationKind::PushUpdate),
            other => Err(CoreError::Config(format!("unknown fan-out operation '{other}'"))),
        }
    }
}

/// A fan-out operation together with its payload.
#[derive(Debug, Clone)]
pub enum FanoutOperation {
    ApplyConfig(Map<String, Value>),
    UploadMedia(Vec<PathBuf>),
    PushUpdate(PathBuf),
}

impl FanoutOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            FanoutOperation::ApplyConfig(_) => OperationKind::ApplyConfig,
            FanoutOperation::UploadMedia(_) => OperationKind::UploadMedia,
            FanoutOperation::PushUpdate(_) => OperationKind::PushUpdate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub target_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetOutcome {
    fn ok(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            success: true,
            error: None,
        }
    }

    fn failed(target_id: &str, error: impl ToString) -> Self {
        Self {
            target_id: target_id.to_string(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutResult {
    pub success_count: usize,
    pub fail_count: usize,
    pub results: Vec<TargetOutcome>,
}

impl FanoutResult {
    fn from_outcomes(results: Vec<TargetOutcome>) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            success_count,
            fail_count: results.len() - success_count,
            results,
        }
    }
}

enum Resolved {
    Local,
    Remote { base: String },
    Failed(String),
}

#[derive(Clone)]
pub struct FanoutDispatcher {
    registry: PeerRegistry,
    client: PeerClient,
    local: Arc<dyn LocalTarget>,
}

impl FanoutDispatcher {
    pub fn new(registry: PeerRegistry, client: PeerClient, local: Arc<dyn LocalTarget>) -> Self {
        Self {
            registry,
            client,
            local,
        }
    }

    /// Run `operation` against every target. Only an empty target set is an
    /// error; per-target failures are reported in the result.
    pub async fn dispatch(
        &self,
        target_ids: &BTreeSet<String>,
        operation: &FanoutOperation,
        per_request_timeout: Duration,
    ) -> Result<FanoutResult> {
        if target_ids.is_empty() {
            return Err(CoreError::EmptyTargets);
        }

        let batch = uuid::Uuid::new_v4();
        tracing::info!(
            %batch,
            operation = ?operation.kind(),
            targets = target_ids.len(),
            "Starting fan-out"
        );

        let futures = target_ids.iter().map(|id| {
            let resolved = self.resolve(id);
            async move {
                let outcome = match resolved {
                    Resolved::Failed(reason) => TargetOutcome::failed(id, reason),
                    Resolved::Local => self.run_local(id, operation, per_request_timeout).await,
                    Resolved::Remote { base } => {
                        self.run_remote(id, &base, operation, per_request_timeout)
                            .await
                    }
                };
                if let Some(err) = &outcome.error {
                    tracing::warn!(%batch, target = %id, error = %err, "Fan-out target failed");
                }
                outcome
            }
        });

        let result = FanoutResult::from_outcomes(join_all(futures).await);
        tracing::info!(
            %batch,
            succeeded = result.success_count,
            failed = result.fail_count,
            "Fan-out finished"
        );
        Ok(result)
    }

    fn resolve(&self, id: &str) -> Resolved {
        if id == LOCAL_PEER_ID {
            return Resolved::Local;
        }
        match self.registry.get(id) {
            None => Resolved::Failed("unknown peer".into()),
            Some(peer) if !peer.online => Resolved::Failed("peer offline".into()),
            Some(peer) => Resolved::Remote {
                base: peer.base_url(),
            },
        }
    }

    async fn run_local(
        &self,
        id: &str,
        operation: &FanoutOperation,
        timeout: Duration,
    ) -> TargetOutcome {
        match tokio::time::timeout(timeout, self.local.apply(operation)).await {
            Ok(Ok(())) => TargetOutcome::ok(id),
            Ok(Err(e)) => TargetOutcome::failed(id, e),
            Err(_) => TargetOutcome::failed(id, "local apply timed out"),
        }
    }

    async fn run_remote(
        &self,
        id: &str,
        base: &str,
        operation: &FanoutOperation,
        timeout: Duration,
    ) -> TargetOutcome {
        let request = async {
            match operation {
                FanoutOperation::ApplyConfig(updates) => {
                    let shared = crate::config::shareable(updates);
                    self.client.apply_config(base, &shared, timeout).await
                }
                FanoutOperation::UploadMedia(files) => {
                    self.client.upload_media(base, files, timeout).await
                }
                FanoutOperation::PushUpdate(package) => {
                    self.client.push_update(base, package, timeout).await
                }
            }
        };

        // The client timeout covers the request; this also bounds opening files.
        let result = match tokio::time::timeout(timeout, request).await {
            Ok(r) => r,
            Err(_) => Err(TransportError::Timeout),
        };
        match result {
            Ok(()) => TargetOutcome::ok(id),
            Err(e) => TargetOutcome::failed(
                id,
                CoreError::Unreachable {
                    peer: id.to_string(),
                    reason: e.to_string(),
                },
            ),
        }
    }
}
