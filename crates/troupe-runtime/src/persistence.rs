//! In-memory persistence backend.
//!
//! Reference implementation of the kernel persistence contract, used by
//! single-process deployments and the test suite. Durable backends implement
//! the same trait against a real store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use troupe_kernel::agent::AgentSnapshot;
use troupe_kernel::error::KernelResult;
use troupe_kernel::event::{StepEvent, WorkProduct};
use troupe_kernel::services::PersistenceService;
use troupe_kernel::step::Step;

/// Thread-safe in-memory store for snapshots, events, and work-products.
#[derive(Default)]
pub struct InMemoryPersistence {
    snapshots: RwLock<HashMap<Uuid, AgentSnapshot>>,
    events: RwLock<Vec<StepEvent>>,
    work_products: RwLock<HashMap<Uuid, WorkProduct>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded step events, in emission order.
    pub async fn events(&self) -> Vec<StepEvent> {
        self.events.read().await.clone()
    }

    /// Step events recorded for one step.
    pub async fn events_for_step(&self, step_id: Uuid) -> Vec<StepEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.step_id == step_id)
            .cloned()
            .collect()
    }

    pub async fn work_product_count(&self) -> usize {
        self.work_products.read().await.len()
    }
}

#[async_trait]
impl PersistenceService for InMemoryPersistence {
    async fn save_snapshot(&self, snapshot: &AgentSnapshot) -> KernelResult<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.agent_id, snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, agent_id: Uuid) -> KernelResult<Option<AgentSnapshot>> {
        Ok(self.snapshots.read().await.get(&agent_id).cloned())
    }

    async fn save_step_event(&self, event: &StepEvent) -> KernelResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn save_work_product(&self, work_product: &WorkProduct) -> KernelResult<()> {
        self.work_products
            .write()
            .await
            .insert(work_product.step_id, work_product.clone());
        Ok(())
    }

    async fn load_work_product(&self, step_id: Uuid) -> KernelResult<Option<WorkProduct>> {
        Ok(self.work_products.read().await.get(&step_id).cloned())
    }

    async fn load_step(&self, step_id: Uuid) -> KernelResult<Option<Step>> {
        // Steps are durable only through agent snapshots.
        let snapshots = self.snapshots.read().await;
        for snapshot in snapshots.values() {
            if let Some(step) = snapshot.steps.iter().find(|s| s.id == step_id) {
                return Ok(Some(step.clone()));
            }
        }
        Ok(None)
    }

    async fn load_deliverables(&self, agent_id: Uuid) -> KernelResult<Vec<WorkProduct>> {
        Ok(self
            .work_products
            .read()
            .await
            .values()
            .filter(|wp| wp.agent_id == agent_id && wp.has_deliverable())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use troupe_kernel::agent::AgentState;
    use troupe_kernel::config::AgentConfig;
    use troupe_kernel::event::StepEventKind;
    use troupe_kernel::step::OutputRecord;

    fn snapshot(agent_id: Uuid, steps: Vec<Step>) -> AgentSnapshot {
        AgentSnapshot {
            agent_id,
            mission_id: Uuid::new_v4(),
            role: "executor".into(),
            state: AgentState::Running,
            config: AgentConfig::default(),
            steps,
            conversation: vec![],
            reflection_done: false,
            replan_depth: 0,
            taken_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let store = InMemoryPersistence::new();
        let agent_id = Uuid::new_v4();
        let step = Step::new(Uuid::new_v4(), agent_id, "CALL");
        let step_id = step.id;

        store.save_snapshot(&snapshot(agent_id, vec![step])).await.unwrap();

        let loaded = store.load_snapshot(agent_id).await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].id, step_id);

        // Steps inside snapshots are addressable individually.
        let found = store.load_step(step_id).await.unwrap().unwrap();
        assert_eq!(found.verb, "CALL");
        assert!(store.load_step(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_accumulate_in_order() {
        let store = InMemoryPersistence::new();
        let (mission, agent, step) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store
            .save_step_event(&StepEvent::new(
                mission,
                agent,
                step,
                StepEventKind::Created { verb: "CALL".into() },
            ))
            .await
            .unwrap();
        store
            .save_step_event(&StepEvent::new(
                mission,
                agent,
                step,
                StepEventKind::WorkProductSaved,
            ))
            .await
            .unwrap();

        let events = store.events_for_step(step).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, StepEventKind::Created { .. }));
    }

    #[tokio::test]
    async fn deliverables_filtered_by_agent_and_flag() {
        let store = InMemoryPersistence::new();
        let agent = Uuid::new_v4();
        let mission = Uuid::new_v4();

        let deliverable = WorkProduct::new(
            mission,
            agent,
            Uuid::new_v4(),
            "RETURN",
            vec![OutputRecord::new("answer", json!("done")).deliverable()],
        );
        let plain = WorkProduct::new(
            mission,
            agent,
            Uuid::new_v4(),
            "THINK",
            vec![OutputRecord::new("answer", json!("draft"))],
        );
        store.save_work_product(&deliverable).await.unwrap();
        store.save_work_product(&plain).await.unwrap();

        let found = store.load_deliverables(agent).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].verb, "RETURN");
        assert!(store.load_deliverables(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
