//! Tracks live environments and mediates every remote operation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::SandboxError;
use crate::sandbox::{
    EnvironmentId, ExecOutput, ExecRequest, ProvisionRequest, SandboxBackend, SandboxFile,
};

/// Lifecycle state of a tracked environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    /// Allocated by the provider, not yet accepting commands.
    Provisioning,
    Running,
    TearingDown,
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::TearingDown => write!(f, "tearing_down"),
        }
    }
}

/// A live environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentHandle {
    pub id: EnvironmentId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub auto_stop_at: Option<DateTime<Utc>>,
    /// Snapshot the environment was created from, if any.
    pub snapshot: Option<String>,
    pub status: EnvironmentStatus,
}

/// What `remove` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    Destroyed,
    /// Destroy failed; the entry was dropped anyway.
    Abandoned { reason: String },
    /// Unknown id, or another caller is already tearing it down.
    NotTracked,
}

/// Owner of every environment handle.
///
/// The map lock is only held for reads and writes of the map itself, never
/// across backend I/O.
pub struct EnvironmentRegistry {
    backend: Arc<dyn SandboxBackend>,
    environments: Arc<RwLock<HashMap<EnvironmentId, EnvironmentHandle>>>,
}

impl EnvironmentRegistry {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            environments: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn health_check(&self) -> Result<(), SandboxError> {
        self.backend.health_check().await
    }

    /// Allocate and track a new environment.
    ///
    /// The handle is recorded as soon as the provider returns an id, before
    /// the environment is ready, so a caller that gives up during startup
    /// can still tear it down. When a snapshot is given and allocating from
    /// it fails, falls back to a fresh environment.
    pub async fn allocate(
        &self,
        name: &str,
        snapshot: Option<&str>,
        auto_stop_minutes: Option<u32>,
    ) -> Result<EnvironmentHandle, SandboxError> {
        let mut request = ProvisionRequest {
            name: name.to_string(),
            snapshot: snapshot.map(String::from),
            auto_stop_minutes,
            ..Default::default()
        };
        request
            .labels
            .insert("app".to_string(), "treasury-sim".to_string());

        let (id, used_snapshot) = match self.backend.allocate(&request).await {
            Ok(id) => (id, request.snapshot.clone()),
            Err(e) if request.snapshot.is_some() => {
                tracing::warn!(
                    name = %name,
                    snapshot = ?request.snapshot,
                    error = %e,
                    "Snapshot provisioning failed, falling back to a fresh environment"
                );
                request.snapshot = None;
                (self.backend.allocate(&request).await?, None)
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let handle = EnvironmentHandle {
            id: id.clone(),
            name: name.to_string(),
            created_at: now,
            auto_stop_at: auto_stop_minutes
                .map(|minutes| now + chrono::Duration::minutes(i64::from(minutes))),
            snapshot: used_snapshot,
            status: EnvironmentStatus::Provisioning,
        };
        self.environments
            .write()
            .await
            .insert(id.clone(), handle.clone());

        tracing::info!(environment_id = %id, name = %name, "Allocated environment");
        Ok(handle)
    }

    /// Wait for an allocated environment to start and mark it running.
    pub async fn wait_ready(&self, id: &EnvironmentId) -> Result<(), SandboxError> {
        match self.environments.read().await.get(id) {
            Some(handle) if handle.status == EnvironmentStatus::Provisioning => {}
            _ => return Err(SandboxError::NotFound { id: id.clone() }),
        }

        self.backend.wait_ready(id).await?;

        let mut environments = self.environments.write().await;
        match environments.get_mut(id) {
            Some(handle) if handle.status == EnvironmentStatus::Provisioning => {
                handle.status = EnvironmentStatus::Running;
                tracing::info!(environment_id = %id, "Environment ready");
                Ok(())
            }
            _ => Err(SandboxError::NotFound { id: id.clone() }),
        }
    }

    pub async fn get(&self, id: &EnvironmentId) -> Option<EnvironmentHandle> {
        self.environments.read().await.get(id).cloned()
    }

    pub async fn list_active(&self) -> Vec<EnvironmentId> {
        let mut ids: Vec<_> = self.environments.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn ensure_live(&self, id: &EnvironmentId) -> Result<(), SandboxError> {
        match self.environments.read().await.get(id) {
            Some(handle) if handle.status == EnvironmentStatus::Running => Ok(()),
            _ => Err(SandboxError::NotFound { id: id.clone() }),
        }
    }

    /// Have the provider stop the environment after `minutes` of inactivity.
    pub async fn set_inactivity_deadline(
        &self,
        id: &EnvironmentId,
        minutes: u32,
    ) -> Result<(), SandboxError> {
        self.ensure_live(id).await?;
        self.backend.set_auto_stop(id, minutes).await?;

        let deadline = Utc::now() + chrono::Duration::minutes(i64::from(minutes));
        if let Some(handle) = self.environments.write().await.get_mut(id) {
            handle.auto_stop_at = Some(deadline);
        }
        tracing::debug!(environment_id = %id, minutes, "Inactivity auto-stop set");
        Ok(())
    }

    pub async fn upload(&self, id: &EnvironmentId, file: &SandboxFile) -> Result<(), SandboxError> {
        self.ensure_live(id).await?;
        self.backend.upload(id, file).await
    }

    pub async fn exec(
        &self,
        id: &EnvironmentId,
        request: &ExecRequest,
    ) -> Result<ExecOutput, SandboxError> {
        self.ensure_live(id).await?;
        self.backend.exec(id, request).await
    }

    pub async fn download(&self, id: &EnvironmentId, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.ensure_live(id).await?;
        self.backend.download(id, path).await
    }

    /// Tear an environment down and stop tracking it.
    ///
    /// Covers environments that are still starting. Only the caller that
    /// moves the entry to `TearingDown` destroys it. The entry is removed
    /// whether or not the destroy succeeded.
    pub async fn remove(&self, id: &EnvironmentId) -> TeardownOutcome {
        {
            let mut environments = self.environments.write().await;
            match environments.get_mut(id) {
                Some(handle) if handle.status != EnvironmentStatus::TearingDown => {
                    handle.status = EnvironmentStatus::TearingDown;
                }
                _ => return TeardownOutcome::NotTracked,
            }
        }

        let result = self.backend.destroy(id).await;
        self.environments.write().await.remove(id);

        match result {
            Ok(()) => {
                tracing::info!(environment_id = %id, "Environment destroyed");
                TeardownOutcome::Destroyed
            }
            Err(e) => {
                tracing::warn!(
                    environment_id = %id,
                    error = %e,
                    "Failed to destroy environment, abandoning it to the provider's auto-stop"
                );
                TeardownOutcome::Abandoned {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Tear down every tracked environment. Used at shutdown.
    pub async fn teardown_all(&self) -> Vec<(EnvironmentId, TeardownOutcome)> {
        let ids = self.list_active().await;
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Tearing down remaining environments");
        }
        let outcomes = futures::future::join_all(ids.iter().map(|id| self.remove(id))).await;
        ids.into_iter().zip(outcomes).collect()
    }
}
