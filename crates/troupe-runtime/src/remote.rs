//! Cross-agent step resolution.
//!
//! Steps referenced across agent boundaries are located through the step
//! registry. Same-host steps are read through the live local index; remote
//! ones are fetched over HTTP as lightweight status+result views. Resolution
//! is strictly read-only.

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use troupe_kernel::error::{KernelError, KernelResult};
use troupe_kernel::services::{DynAgentDirectory, DynLocalStepAccess, StepView};
use troupe_kernel::step::StepStatus;

/// Resolves step views owned by other agents.
#[derive(Clone)]
pub struct CrossAgentResolver {
    directory: DynAgentDirectory,
    /// Live access to co-located agents, if the host exposes one.
    local: Option<DynLocalStepAccess>,
    http: reqwest::Client,
    /// This process's host address, compared against registry locations.
    self_host: String,
    /// Bearer token attached to remote step fetches.
    auth_token: Option<String>,
    /// Completed views never change; cache them.
    cache: std::sync::Arc<DashMap<Uuid, StepView>>,
}

impl CrossAgentResolver {
    pub fn new(directory: DynAgentDirectory, self_host: impl Into<String>) -> Self {
        Self {
            directory,
            local: None,
            http: reqwest::Client::new(),
            self_host: self_host.into(),
            auth_token: None,
            cache: std::sync::Arc::new(DashMap::new()),
        }
    }

    pub fn with_local_access(mut self, local: DynLocalStepAccess) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Resolve a read-only view of a step owned by another agent.
    ///
    /// Returns `Ok(None)` when the registry has no location for the step.
    pub async fn resolve(&self, step_id: Uuid) -> KernelResult<Option<StepView>> {
        if let Some(cached) = self.cache.get(&step_id) {
            return Ok(Some(cached.clone()));
        }

        let Some(location) = self.directory.step_location(step_id).await? else {
            return Ok(None);
        };

        let view = if location.agent_host == self.self_host {
            match &self.local {
                Some(local) => local.step_view(location.owner_agent_id, step_id).await,
                None => None,
            }
        } else {
            self.fetch_remote(&location.agent_host, step_id).await?
        };

        if let Some(view) = &view
            && view.status == StepStatus::Completed
        {
            self.cache.insert(step_id, view.clone());
        }
        Ok(view)
    }

    async fn fetch_remote(&self, host: &str, step_id: Uuid) -> KernelResult<Option<StepView>> {
        let url = format!("{}/agent/step/{}", host.trim_end_matches('/'), step_id);
        debug!(step = %step_id, %url, "fetching remote step view");

        let mut request = self.http.get(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            KernelError::service("cross-agent", format!("fetch {url} failed: {e}"))
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            warn!(step = %step_id, status = %response.status(), "remote step fetch rejected");
            return Err(KernelError::service(
                "cross-agent",
                format!("fetch {url} returned {}", response.status()),
            ));
        }

        let view = response.json::<StepView>().await.map_err(|e| {
            KernelError::service("cross-agent", format!("invalid step view from {url}: {e}"))
        })?;
        Ok(Some(view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use troupe_kernel::agent::AgentState;
    use troupe_kernel::services::{AgentDirectory, AgentInfo, LocalStepAccess, StepLocation};
    use troupe_kernel::step::{OutputRecord, Step};

    struct FixedDirectory {
        location: Option<StepLocation>,
    }

    #[async_trait]
    impl AgentDirectory for FixedDirectory {
        async fn find_agent(&self, _: Uuid, _: &str) -> KernelResult<Option<AgentInfo>> {
            Ok(None)
        }
        async fn request_agent(&self, _: Uuid, _: &str) -> KernelResult<AgentInfo> {
            Err(KernelError::service("directory", "not supported"))
        }
        async fn agent_info(&self, _: Uuid) -> KernelResult<Option<AgentInfo>> {
            Ok(None)
        }
        async fn register_agent(&self, _: AgentInfo) -> KernelResult<()> {
            Ok(())
        }
        async fn step_location(&self, _: Uuid) -> KernelResult<Option<StepLocation>> {
            Ok(self.location.clone())
        }
        async fn update_step_location(&self, _: Uuid, _: StepLocation) -> KernelResult<()> {
            Ok(())
        }
    }

    struct OneStepAccess {
        view: StepView,
    }

    #[async_trait]
    impl LocalStepAccess for OneStepAccess {
        async fn step_view(&self, _: Uuid, step_id: Uuid) -> Option<StepView> {
            (self.view.id == step_id).then(|| self.view.clone())
        }
    }

    fn completed_view() -> StepView {
        let mut step = Step::new(Uuid::new_v4(), Uuid::new_v4(), "CALL");
        step.transition(StepStatus::Running).unwrap();
        step.complete(vec![OutputRecord::new("out", serde_json::json!(7))])
            .unwrap();
        StepView::from(&step)
    }

    #[tokio::test]
    async fn unknown_location_resolves_to_none() {
        let directory = Arc::new(FixedDirectory { location: None });
        let resolver = CrossAgentResolver::new(directory, "http://localhost:1");
        assert!(resolver.resolve(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_host_uses_local_fast_path() {
        let view = completed_view();
        let owner = Uuid::new_v4();
        let directory = Arc::new(FixedDirectory {
            location: Some(StepLocation {
                owner_agent_id: owner,
                agent_host: "http://localhost:1".into(),
            }),
        });
        let resolver = CrossAgentResolver::new(directory, "http://localhost:1")
            .with_local_access(Arc::new(OneStepAccess { view: view.clone() }));

        let resolved = resolver.resolve(view.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, StepStatus::Completed);
        assert_eq!(resolved.result.len(), 1);

        // Completed views are cached; a second resolve does not consult the
        // local index again (the cache answers even if access is removed).
        let resolved_again = resolver.resolve(view.id).await.unwrap().unwrap();
        assert_eq!(resolved_again.id, view.id);
    }
}
