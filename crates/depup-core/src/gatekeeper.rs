//! Admission control
//!
//! At most one non-terminal update and no foreign execution may be active on
//! a deployment. The check and the record insert happen atomically inside
//! [`UpdateStore::create_deployment_update`]; this module owns the
//! rejection reasons and the logging around them.

use crate::config::StorageRetryPolicy;
use crate::error::EngineError;
use crate::retry::with_storage_retry;
use crate::storage::{StorageError, UpdateStore};
use crate::types::{DeploymentUpdate, DeploymentUpdateId, ExecutionId};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tracing::{info, warn};

/// Why an update was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AdmissionRejection {
    /// Another update on this deployment is not terminal
    UpdateInProgress { active: DeploymentUpdateId },
    /// A workflow execution is running on this deployment
    ExecutionInProgress { execution: ExecutionId },
    DeploymentNotFound,
    DeploymentLocked,
}

impl Display for AdmissionRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdateInProgress { active } => write!(f, "update {active} is in progress"),
            Self::ExecutionInProgress { execution } => {
                write!(f, "execution {execution} is in progress")
            }
            Self::DeploymentNotFound => f.write_str("deployment not found"),
            Self::DeploymentLocked => f.write_str("deployment is locked"),
        }
    }
}

/// Submission flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Fail a stale active update whose execution is no longer running
    pub force: bool,
}

impl SubmitOptions {
    #[must_use]
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Admits new update records
pub struct Gatekeeper<S: ?Sized> {
    store: Arc<S>,
    retry: StorageRetryPolicy,
}

impl<S: UpdateStore + ?Sized> Gatekeeper<S> {
    #[must_use]
    pub fn new(store: Arc<S>, retry: StorageRetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Atomically check admission and persist `record`
    ///
    /// # Errors
    /// - [`EngineError::Rejected`] when another update or execution is active
    /// - [`EngineError::Storage`] on persistent storage failures
    pub async fn admit(
        &self,
        record: DeploymentUpdate,
        options: SubmitOptions,
    ) -> Result<DeploymentUpdate, EngineError> {
        let result = with_storage_retry(&self.retry, "create_deployment_update", || {
            self.store.create_deployment_update(record.clone(), options.force)
        })
        .await;

        match result {
            Ok(stored) => {
                info!(
                    update_id = %stored.id,
                    deployment_id = %stored.deployment_id,
                    state = %stored.state,
                    steps = stored.steps.len(),
                    force = options.force,
                    "deployment update admitted"
                );
                Ok(stored)
            }
            Err(StorageError::Rejected(reason)) => {
                warn!(
                    deployment_id = %record.deployment_id,
                    %reason,
                    "deployment update rejected"
                );
                Err(EngineError::Rejected(reason))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_messages() {
        assert_eq!(AdmissionRejection::DeploymentLocked.to_string(), "deployment is locked");
        let active = DeploymentUpdateId::from("dep-1-abc");
        assert_eq!(
            AdmissionRejection::UpdateInProgress { active }.to_string(),
            "update dep-1-abc is in progress"
        );
    }

    #[test]
    fn default_options_do_not_force() {
        assert!(!SubmitOptions::default().force);
        assert!(SubmitOptions::forced().force);
    }
}
