use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::{TierProfile, TierProfiles};
use crate::error::{EngineError, EngineResult};
use crate::types::WorkspaceType;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only view of the workspace service: resource-tier defaults per
/// workspace type and filesystem snapshots mounted into the sandbox
/// scratch area. The engine never owns persistent workspace state.
#[async_trait]
pub trait WorkspaceService: Send + Sync {
    async fn tier_profile(&self, workspace_type: WorkspaceType) -> EngineResult<TierProfile>;
    /// Gzipped tar of the workspace filesystem, if one exists.
    async fn fetch_snapshot(&self, workspace_id: &str) -> EngineResult<Option<Vec<u8>>>;
}

/// Serves tier defaults from engine config; no snapshots. Used when no
/// workspace service is deployed (single-node and test setups).
pub struct StaticWorkspace {
    tiers: TierProfiles,
}

impl StaticWorkspace {
    pub fn new(tiers: TierProfiles) -> Self {
        Self { tiers }
    }
}

#[async_trait]
impl WorkspaceService for StaticWorkspace {
    async fn tier_profile(&self, workspace_type: WorkspaceType) -> EngineResult<TierProfile> {
        Ok(self.tiers.for_type(workspace_type).clone())
    }

    async fn fetch_snapshot(&self, _workspace_id: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// HTTP client for a deployed workspace service.
#[derive(Clone)]
pub struct HttpWorkspace {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpWorkspace {
    pub fn new(base_url: String, token: String) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Internal(format!("workspace client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }
}

#[async_trait]
impl WorkspaceService for HttpWorkspace {
    async fn tier_profile(&self, workspace_type: WorkspaceType) -> EngineResult<TierProfile> {
        let url = format!(
            "{}/api/workspace-types/{}/tier",
            self.base_url,
            workspace_type.as_str()
        );
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| EngineError::Workspace(format!("tier fetch: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Workspace(format!("tier fetch: {status}")));
        }
        resp.json()
            .await
            .map_err(|e| EngineError::Workspace(format!("tier decode: {e}")))
    }

    async fn fetch_snapshot(&self, workspace_id: &str) -> EngineResult<Option<Vec<u8>>> {
        let url = format!("{}/api/workspaces/{workspace_id}/snapshot", self.base_url);
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| EngineError::Workspace(format!("snapshot fetch: {e}")))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Workspace(format!("snapshot fetch: {status}")));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::Workspace(format!("snapshot body: {e}")))?;
        Ok(Some(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_workspace_serves_config_tiers() {
        let workspace = StaticWorkspace::new(TierProfiles::default());
        let ephemeral = workspace
            .tier_profile(WorkspaceType::Ephemeral)
            .await
            .unwrap();
        let collaborative = workspace
            .tier_profile(WorkspaceType::Collaborative)
            .await
            .unwrap();

        assert!(ephemeral.memory_mb < collaborative.memory_mb);
        assert!(
            workspace.fetch_snapshot("any").await.unwrap().is_none(),
            "static workspace has no snapshots"
        );
    }
}
