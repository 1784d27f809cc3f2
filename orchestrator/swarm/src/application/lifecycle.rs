// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent Lifecycle Manager
//!
//! Owns every pooled agent and drives it through
//!
//! ```text
//! spawned -> initializing -> ready <-> executing -> retiring -> terminated
//!                 |                                     |
//!                 v                                     v
//!               failed -> initializing (retry) | retiring
//! ```
//!
//! Each transition is persisted as an `AgentStateRecord` and published on
//! `agent.lifecycle.<state>`.
//!
//! # Single-flight initialization
//!
//! `initialize` runs under a per-agent async mutex that also stores the
//! outcome of the last run and a generation counter. A caller reads the
//! generation before waiting for the mutex; if it changed by the time the
//! mutex is acquired, another caller finished an initialization meanwhile
//! and its outcome is returned as-is. Concurrent callers therefore share a
//! single run, whether it succeeds or fails. A failed agent can be
//! initialized again by a later caller.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Pool membership and per-agent state machine

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use scopeguard::ScopeGuard;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use fleet_core::domain::agent::{AgentHandle, AgentId, AgentState};
use fleet_core::domain::events::AgentLifecycleEvent;
use fleet_core::domain::record::PutOptions;
use fleet_core::domain::task::{Task, TaskId};
use fleet_core::domain::typed_records::AgentStateRecord;
use fleet_core::infrastructure::event_bus::EventBus;
use fleet_core::infrastructure::record_store::RecordStore;

use crate::domain::behavior::{AgentBehavior, AgentContext, BehaviorRegistry, TaskOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Spawn,
    Initialize,
    Execute,
    Retire,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecyclePhase::Spawn => "spawn",
            LifecyclePhase::Initialize => "initialize",
            LifecyclePhase::Execute => "execute",
            LifecyclePhase::Retire => "retire",
        })
    }
}

/// Cloneable so that every caller joining one initialization gets the same error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("no behavior registered for agent type '{0}'")]
    UnknownAgentType(String),

    #[error("agent pool is full ({max_agents} agents)")]
    PoolFull { max_agents: usize },

    #[error("agent {agent_id} cannot {phase} while {state}")]
    InvalidState {
        agent_id: AgentId,
        phase: LifecyclePhase,
        state: AgentState,
    },

    #[error("agent {agent_id} failed during {phase}: {reason}")]
    Failed {
        agent_id: AgentId,
        phase: LifecyclePhase,
        reason: String,
    },

    #[error("agent {agent_id} was found initializing by a second initializer")]
    ConcurrentInitialization { agent_id: AgentId },

    #[error("task {task_id} failed on agent {agent_id}: {reason}")]
    TaskFailed {
        agent_id: AgentId,
        task_id: TaskId,
        reason: String,
    },
}

impl LifecycleError {
    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            LifecycleError::AgentNotFound(agent_id)
            | LifecycleError::InvalidState { agent_id, .. }
            | LifecycleError::Failed { agent_id, .. }
            | LifecycleError::ConcurrentInitialization { agent_id }
            | LifecycleError::TaskFailed { agent_id, .. } => Some(*agent_id),
            LifecycleError::UnknownAgentType(_) | LifecycleError::PoolFull { .. } => None,
        }
    }

    pub fn phase(&self) -> Option<LifecyclePhase> {
        match self {
            LifecycleError::InvalidState { phase, .. } | LifecycleError::Failed { phase, .. } => {
                Some(*phase)
            }
            LifecycleError::ConcurrentInitialization { .. } => Some(LifecyclePhase::Initialize),
            LifecycleError::TaskFailed { .. } => Some(LifecyclePhase::Execute),
            LifecycleError::PoolFull { .. } | LifecycleError::UnknownAgentType(_) => {
                Some(LifecyclePhase::Spawn)
            }
            LifecycleError::AgentNotFound(_) => None,
        }
    }
}

#[derive(Default)]
struct InitSlot {
    generation: u64,
    outcome: Option<Result<(), LifecycleError>>,
}

struct ManagedAgent {
    handle: RwLock<AgentHandle>,
    behavior: Arc<dyn AgentBehavior>,
    context: Arc<AgentContext>,
    init: tokio::sync::Mutex<InitSlot>,
    /// Mirrors `InitSlot::generation`, readable without waiting for the mutex.
    init_generation: AtomicU64,
    execution: tokio::sync::Mutex<()>,
    retiring: AtomicBool,
}

impl ManagedAgent {
    fn id(&self) -> AgentId {
        self.handle.read().id
    }

    fn state(&self) -> AgentState {
        self.handle.read().state
    }

    fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }
}

pub struct AgentLifecycleManager {
    store: Arc<RecordStore>,
    event_bus: EventBus,
    behaviors: BehaviorRegistry,
    max_agents: usize,
    agents: RwLock<HashMap<AgentId, Arc<ManagedAgent>>>,
}

impl AgentLifecycleManager {
    pub fn new(
        store: Arc<RecordStore>,
        event_bus: EventBus,
        behaviors: BehaviorRegistry,
        max_agents: usize,
    ) -> Self {
        Self {
            store,
            event_bus,
            behaviors,
            max_agents,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    pub fn behaviors(&self) -> &BehaviorRegistry {
        &self.behaviors
    }

    /// Add a new agent of `agent_type` in state `spawned`.
    pub fn spawn(&self, agent_type: &str) -> Result<AgentId, LifecycleError> {
        let behavior = self
            .behaviors
            .get(agent_type)
            .ok_or_else(|| LifecycleError::UnknownAgentType(agent_type.to_string()))?;

        let handle = AgentHandle::new(agent_type);
        let agent_id = handle.id;
        let context = Arc::new(AgentContext::new(
            agent_type,
            self.store.agent_view(agent_id),
            self.event_bus.clone(),
        ));
        let agent = Arc::new(ManagedAgent {
            handle: RwLock::new(handle.clone()),
            behavior,
            context,
            init: tokio::sync::Mutex::new(InitSlot::default()),
            init_generation: AtomicU64::new(0),
            execution: tokio::sync::Mutex::new(()),
            retiring: AtomicBool::new(false),
        });

        {
            let mut agents = self.agents.write();
            let active = agents.values().filter(|a| a.state().is_active()).count();
            if active >= self.max_agents {
                return Err(LifecycleError::PoolFull {
                    max_agents: self.max_agents,
                });
            }
            agents.insert(agent_id, agent);
        }

        self.persist(&handle);
        info!(%agent_id, agent_type, "Agent spawned");
        self.event_bus.publish_domain(AgentLifecycleEvent::Transitioned {
            agent_id,
            agent_type: agent_type.to_string(),
            from: None,
            to: AgentState::Spawned,
            at: Utc::now(),
        });
        Ok(agent_id)
    }

    /// Run the agent's one-time setup. Safe to call concurrently; see the
    /// module docs for how callers share one run.
    pub async fn initialize(&self, agent_id: AgentId) -> Result<(), LifecycleError> {
        let agent = self.agent(agent_id)?;
        let seen_generation = agent.init_generation.load(Ordering::Acquire);
        let mut slot = agent.init.lock().await;

        if slot.generation != seen_generation {
            debug!(%agent_id, "Joining initialization that completed while waiting");
            return slot.outcome.clone().unwrap_or(Ok(()));
        }

        match agent.state() {
            AgentState::Spawned | AgentState::Failed if !agent.is_retiring() => {}
            AgentState::Ready | AgentState::Executing => return Ok(()),
            AgentState::Initializing => {
                let err = LifecycleError::ConcurrentInitialization { agent_id };
                error!(%agent_id, "Agent already initializing while its initialization guard is held");
                self.mark_failed(&agent, LifecyclePhase::Initialize, err.to_string());
                Self::finish(&agent, &mut slot, Err(err.clone()));
                return Err(err);
            }
            state => {
                return Err(LifecycleError::InvalidState {
                    agent_id,
                    phase: LifecyclePhase::Initialize,
                    state,
                })
            }
        }

        self.transition(&agent, LifecyclePhase::Initialize, AgentState::Initializing, |_| {})?;

        // Dropped without being defused only if this future is cancelled mid-run.
        let cancelled = scopeguard::guard((), |()| {
            warn!(%agent_id, "Initialization cancelled before completing");
            self.mark_failed(
                &agent,
                LifecyclePhase::Initialize,
                "initialization cancelled".to_string(),
            );
        });

        let result = AssertUnwindSafe(agent.behavior.initialize(&agent.context))
            .catch_unwind()
            .await;
        ScopeGuard::into_inner(cancelled);

        let outcome = match result {
            Ok(Ok(())) => self
                .transition(&agent, LifecyclePhase::Initialize, AgentState::Ready, |_| {})
                .inspect(|_| info!(%agent_id, "Agent initialized")),
            Ok(Err(e)) => Err(self.mark_failed(&agent, LifecyclePhase::Initialize, format!("{:#}", e))),
            Err(_) => Err(self.mark_failed(
                &agent,
                LifecyclePhase::Initialize,
                "initialization panicked".to_string(),
            )),
        };

        Self::finish(&agent, &mut slot, outcome.clone());
        outcome
    }

    fn finish(agent: &ManagedAgent, slot: &mut InitSlot, outcome: Result<(), LifecycleError>) {
        slot.generation += 1;
        slot.outcome = Some(outcome);
        agent.init_generation.store(slot.generation, Ordering::Release);
    }

    /// Claim the least loaded ready agent of `agent_type`, moving it to `executing`.
    pub fn try_claim(&self, agent_type: &str) -> Option<AgentId> {
        let mut candidates: Vec<Arc<ManagedAgent>> = self
            .agents
            .read()
            .values()
            .filter(|agent| {
                let handle = agent.handle.read();
                handle.agent_type == agent_type
                    && handle.state == AgentState::Ready
                    && !agent.is_retiring()
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|agent| {
            let handle = agent.handle.read();
            (handle.task_queue_depth, handle.spawned_at)
        });

        candidates
            .into_iter()
            .find(|agent| self.claim_agent(agent).is_ok())
            .map(|agent| agent.id())
    }

    /// Move a specific ready agent to `executing`.
    pub fn claim(&self, agent_id: AgentId) -> Result<(), LifecycleError> {
        let agent = self.agent(agent_id)?;
        if agent.is_retiring() {
            return Err(LifecycleError::InvalidState {
                agent_id,
                phase: LifecyclePhase::Execute,
                state: agent.state(),
            });
        }
        self.claim_agent(&agent)
    }

    fn claim_agent(&self, agent: &ManagedAgent) -> Result<(), LifecycleError> {
        self.transition(agent, LifecyclePhase::Execute, AgentState::Executing, |handle| {
            handle.task_queue_depth += 1;
        })
    }

    /// Run `task` on an agent previously claimed with [`claim`](Self::claim)
    /// or [`try_claim`](Self::try_claim). The agent returns to `ready`
    /// afterwards unless it is being retired.
    pub async fn run_claimed(
        &self,
        agent_id: AgentId,
        task: &Task,
    ) -> Result<TaskOutput, LifecycleError> {
        let agent = self.agent(agent_id)?;
        let _execution = agent.execution.lock().await;

        let state = agent.state();
        if state != AgentState::Executing {
            return Err(LifecycleError::InvalidState {
                agent_id,
                phase: LifecyclePhase::Execute,
                state,
            });
        }

        debug!(%agent_id, task_id = %task.id, "Executing task");
        let result = AssertUnwindSafe(agent.behavior.execute(&agent.context, task))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(LifecycleError::TaskFailed {
                agent_id,
                task_id: task.id,
                reason: format!("{:#}", e),
            }),
            Err(_) => Err(LifecycleError::TaskFailed {
                agent_id,
                task_id: task.id,
                reason: "task execution panicked".to_string(),
            }),
        };

        let release = |handle: &mut AgentHandle| {
            handle.task_queue_depth = handle.task_queue_depth.saturating_sub(1);
        };
        if agent.is_retiring() {
            release(&mut agent.handle.write());
        } else if let Err(e) =
            self.transition(&agent, LifecyclePhase::Execute, AgentState::Ready, release)
        {
            warn!(%agent_id, error = %e, "Agent could not return to ready");
        }
        outcome
    }

    /// Claim `agent_id` and run `task` on it.
    pub async fn execute(&self, agent_id: AgentId, task: &Task) -> Result<TaskOutput, LifecycleError> {
        self.claim(agent_id)?;
        self.run_claimed(agent_id, task).await
    }

    /// Wait for the in-flight task, flush staged private writes and move the
    /// agent to `terminated`. Terminated agents leave the pool.
    pub async fn retire(&self, agent_id: AgentId) -> Result<(), LifecycleError> {
        let agent = match self.agent(agent_id) {
            Ok(agent) => agent,
            // Retired by a concurrent caller.
            Err(LifecycleError::AgentNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        agent.retiring.store(true, Ordering::Release);
        let _init = agent.init.lock().await;
        let _execution = agent.execution.lock().await;

        if agent.state() == AgentState::Terminated {
            return Ok(());
        }
        self.transition(&agent, LifecyclePhase::Retire, AgentState::Retiring, |_| {})?;

        let pending = agent.context.take_pending();
        let staged = pending.len();
        for (index, write) in pending.iter().enumerate() {
            if let Err(e) = agent.context.store().put_private(
                &write.partition,
                &write.key,
                write.value.clone(),
                write.ttl,
            ) {
                agent.context.restore_pending(pending[index..].to_vec());
                return Err(self.mark_failed(
                    &agent,
                    LifecyclePhase::Retire,
                    format!("flushing {}/{}: {}", write.partition, write.key, e),
                ));
            }
        }
        if let Err(e) = self.store.flush_async().await {
            return Err(self.mark_failed(&agent, LifecyclePhase::Retire, e.to_string()));
        }

        self.transition(&agent, LifecyclePhase::Retire, AgentState::Terminated, |_| {})?;
        self.agents.write().remove(&agent_id);
        info!(%agent_id, flushed = staged, "Agent retired");
        Ok(())
    }

    pub async fn retire_all(&self) -> Vec<(AgentId, Result<(), LifecycleError>)> {
        let ids: Vec<AgentId> = self.agents.read().keys().copied().collect();
        futures::future::join_all(ids.into_iter().map(|agent_id| async move {
            (agent_id, self.retire(agent_id).await)
        }))
        .await
    }

    /// A ready agent of some other type, for recycling a full pool.
    pub fn idle_agent_not_of(&self, agent_type: &str) -> Option<AgentId> {
        self.agents
            .read()
            .values()
            .filter(|agent| !agent.is_retiring())
            .map(|agent| agent.handle.read().clone())
            .filter(|handle| handle.state == AgentState::Ready && handle.agent_type != agent_type)
            .min_by_key(|handle| handle.updated_at)
            .map(|handle| handle.id)
    }

    pub fn handle(&self, agent_id: AgentId) -> Option<AgentHandle> {
        self.agents
            .read()
            .get(&agent_id)
            .map(|agent| agent.handle.read().clone())
    }

    pub fn handles(&self) -> Vec<AgentHandle> {
        let mut handles: Vec<AgentHandle> = self
            .agents
            .read()
            .values()
            .map(|agent| agent.handle.read().clone())
            .collect();
        handles.sort_by_key(|handle| handle.spawned_at);
        handles
    }

    pub fn context(&self, agent_id: AgentId) -> Option<Arc<AgentContext>> {
        self.agents
            .read()
            .get(&agent_id)
            .map(|agent| Arc::clone(&agent.context))
    }

    /// Agents counting against pool capacity.
    pub fn active_count(&self) -> usize {
        self.agents
            .read()
            .values()
            .filter(|agent| agent.state().is_active())
            .count()
    }

    pub fn counts_by_state(&self) -> BTreeMap<AgentState, usize> {
        let mut counts = BTreeMap::new();
        for agent in self.agents.read().values() {
            *counts.entry(agent.state()).or_insert(0) += 1;
        }
        counts
    }

    fn agent(&self, agent_id: AgentId) -> Result<Arc<ManagedAgent>, LifecycleError> {
        self.agents
            .read()
            .get(&agent_id)
            .cloned()
            .ok_or(LifecycleError::AgentNotFound(agent_id))
    }

    /// Check and apply one transition under the handle lock, then persist and publish.
    fn transition(
        &self,
        agent: &ManagedAgent,
        phase: LifecyclePhase,
        to: AgentState,
        update: impl FnOnce(&mut AgentHandle),
    ) -> Result<(), LifecycleError> {
        let (from, snapshot) = {
            let mut handle = agent.handle.write();
            let from = handle.state;
            if !from.can_transition_to(to) {
                return Err(LifecycleError::InvalidState {
                    agent_id: handle.id,
                    phase,
                    state: from,
                });
            }
            update(&mut handle);
            handle.state = to;
            handle.updated_at = Utc::now();
            (from, handle.clone())
        };

        self.persist(&snapshot);
        metrics::counter!("fleet_agent_transitions_total", "state" => to.as_str()).increment(1);
        self.event_bus.publish_domain(AgentLifecycleEvent::Transitioned {
            agent_id: snapshot.id,
            agent_type: snapshot.agent_type,
            from: Some(from),
            to,
            at: snapshot.updated_at,
        });
        Ok(())
    }

    fn mark_failed(&self, agent: &ManagedAgent, phase: LifecyclePhase, reason: String) -> LifecycleError {
        let snapshot = {
            let mut handle = agent.handle.write();
            handle.state = AgentState::Failed;
            handle.updated_at = Utc::now();
            handle.clone()
        };

        error!(agent_id = %snapshot.id, %phase, reason = %reason, "Agent lifecycle failure");
        self.persist(&snapshot);
        metrics::counter!("fleet_agent_failures_total", "phase" => phase.to_string()).increment(1);
        self.event_bus.publish_domain(AgentLifecycleEvent::Failed {
            agent_id: snapshot.id,
            agent_type: snapshot.agent_type,
            phase: phase.to_string(),
            reason: reason.clone(),
            failed_at: snapshot.updated_at,
        });

        LifecycleError::Failed {
            agent_id: snapshot.id,
            phase,
            reason,
        }
    }

    fn persist(&self, handle: &AgentHandle) {
        let record = AgentStateRecord {
            agent_id: handle.id,
            agent_type: handle.agent_type.clone(),
            state: handle.state,
            task_queue_depth: handle.task_queue_depth,
            updated_at: handle.updated_at,
        };
        if let Err(e) = self.store.put_typed(&record, PutOptions::public()) {
            warn!(agent_id = %handle.id, state = %handle.state, error = %e, "Failed to persist agent state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_core::domain::events::topics;
    use fleet_core::infrastructure::event_bus::EventBusError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        inits: AtomicUsize,
        fail_first: AtomicBool,
    }

    #[async_trait]
    impl AgentBehavior for Counting {
        fn agent_type(&self) -> &str {
            "counting"
        }

        async fn initialize(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
            let run = self.inits.fetch_add(1, Ordering::SeqCst);
            if run == 0 && self.fail_first.load(Ordering::SeqCst) {
                anyhow::bail!("warm-up cache unavailable");
            }
            Ok(())
        }

        async fn execute(&self, ctx: &AgentContext, task: &Task) -> anyhow::Result<TaskOutput> {
            ctx.stage_private("coordination", format!("scratch/{}", task.id), b"notes".to_vec(), None);
            Ok(serde_json::json!({ "echo": task.payload }))
        }
    }

    fn manager(behavior: Arc<Counting>) -> (AgentLifecycleManager, Arc<RecordStore>, EventBus) {
        let store = Arc::new(RecordStore::temporary("node-a").unwrap());
        let bus = EventBus::new();
        let registry = BehaviorRegistry::new().with(behavior);
        (
            AgentLifecycleManager::new(Arc::clone(&store), bus.clone(), registry, 2),
            store,
            bus,
        )
    }

    #[tokio::test]
    async fn test_full_lifecycle_persists_every_state() {
        let behavior = Arc::new(Counting::default());
        let (manager, store, bus) = manager(Arc::clone(&behavior));
        let mut lifecycle = bus.subscribe_channel(topics::AGENT_LIFECYCLE_ALL, 32).unwrap();

        let agent_id = manager.spawn("counting").unwrap();
        manager.initialize(agent_id).await.unwrap();
        let output = manager
            .execute(agent_id, &Task::new("counting", serde_json::json!(7)))
            .await
            .unwrap();
        assert_eq!(output["echo"], 7);
        assert_eq!(manager.handle(agent_id).unwrap().state, AgentState::Ready);

        manager.retire(agent_id).await.unwrap();
        assert!(manager.handle(agent_id).is_none());

        let persisted: AgentStateRecord = store
            .get_typed(&AgentStateRecord::key_for(agent_id))
            .unwrap()
            .unwrap();
        assert_eq!(persisted.state, AgentState::Terminated);

        let mut seen = Vec::new();
        loop {
            match lifecycle.try_recv() {
                Ok(event) => seen.push(event.topic),
                Err(EventBusError::Empty) => break,
                Err(e) => panic!("unexpected bus error: {}", e),
            }
        }
        assert_eq!(
            seen,
            vec![
                "agent.lifecycle.spawned",
                "agent.lifecycle.initializing",
                "agent.lifecycle.ready",
                "agent.lifecycle.executing",
                "agent.lifecycle.ready",
                "agent.lifecycle.retiring",
                "agent.lifecycle.terminated",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_initialization_can_be_retried() {
        let behavior = Arc::new(Counting::default());
        behavior.fail_first.store(true, Ordering::SeqCst);
        let (manager, _store, _bus) = manager(Arc::clone(&behavior));

        let agent_id = manager.spawn("counting").unwrap();
        let err = manager.initialize(agent_id).await.unwrap_err();
        assert_eq!(err.agent_id(), Some(agent_id));
        assert_eq!(err.phase(), Some(LifecyclePhase::Initialize));
        assert_eq!(manager.handle(agent_id).unwrap().state, AgentState::Failed);

        manager.initialize(agent_id).await.unwrap();
        assert_eq!(manager.handle(agent_id).unwrap().state, AgentState::Ready);
        assert_eq!(behavior.inits.load(Ordering::SeqCst), 2);

        // Already ready: no third run.
        manager.initialize(agent_id).await.unwrap();
        assert_eq!(behavior.inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_capacity_and_unknown_type() {
        let (manager, _store, _bus) = manager(Arc::new(Counting::default()));
        manager.spawn("counting").unwrap();
        manager.spawn("counting").unwrap();
        assert_eq!(
            manager.spawn("counting"),
            Err(LifecycleError::PoolFull { max_agents: 2 })
        );
        assert!(matches!(
            manager.spawn("unknown"),
            Err(LifecycleError::UnknownAgentType(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_requires_ready_agent() {
        let (manager, _store, _bus) = manager(Arc::new(Counting::default()));
        let agent_id = manager.spawn("counting").unwrap();

        assert!(matches!(
            manager.claim(agent_id),
            Err(LifecycleError::InvalidState {
                state: AgentState::Spawned,
                ..
            })
        ));
        assert_eq!(manager.try_claim("counting"), None);

        manager.initialize(agent_id).await.unwrap();
        assert_eq!(manager.try_claim("counting"), Some(agent_id));
        assert_eq!(manager.try_claim("counting"), None);
        assert_eq!(manager.handle(agent_id).unwrap().task_queue_depth, 1);
    }
}
