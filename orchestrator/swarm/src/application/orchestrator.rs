// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fleet Orchestrator
//!
//! Routes tasks onto the agent pool. A task goes to the least loaded ready
//! agent of its type; failing that a new agent is spawned while the pool
//! has room; failing that the task waits in a bounded FIFO queue, and a
//! full queue rejects it with [`FleetError::CapacityExceeded`]. A task is
//! never dropped silently: every one ends in `task.completed`,
//! `task.failed` or `task.rejected`.
//!
//! Execution runs on tracked tokio tasks. When one finishes the agent is
//! back in `ready` and the queue is drained before anything else.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Task assignment, capacity tracking, pool health

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use fleet_core::domain::agent::AgentId;
use fleet_core::domain::events::TaskEvent;
use fleet_core::domain::node_config::PoolSettings;
use fleet_core::domain::record::PutOptions;
use fleet_core::domain::task::{Task, TaskId};
use fleet_core::domain::typed_records::TaskResultRecord;
use fleet_core::infrastructure::event_bus::EventBus;
use fleet_core::infrastructure::record_store::RecordStore;
use fleet_core::infrastructure::sync::SyncTransport;

use super::lifecycle::{AgentLifecycleManager, LifecycleError};
use crate::domain::health::{FleetHealth, HealthStatus, TaskAssignment};

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("fleet at capacity: {max_agents} agents busy and {queue_capacity} tasks already queued")]
    CapacityExceeded {
        max_agents: usize,
        queue_capacity: usize,
    },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

pub struct FleetOrchestrator {
    lifecycle: Arc<AgentLifecycleManager>,
    store: Arc<RecordStore>,
    event_bus: EventBus,
    settings: PoolSettings,
    sync: Option<Arc<SyncTransport>>,
    queue: Mutex<VecDeque<Task>>,
    /// Serializes placement decisions so capacity checks stay accurate.
    assign_lock: tokio::sync::Mutex<()>,
    running: TaskTracker,
    accepting: AtomicBool,
}

impl FleetOrchestrator {
    pub fn new(
        lifecycle: Arc<AgentLifecycleManager>,
        store: Arc<RecordStore>,
        event_bus: EventBus,
        settings: PoolSettings,
    ) -> Self {
        Self {
            lifecycle,
            store,
            event_bus,
            settings,
            sync: None,
            queue: Mutex::new(VecDeque::new()),
            assign_lock: tokio::sync::Mutex::new(()),
            running: TaskTracker::new(),
            accepting: AtomicBool::new(true),
        }
    }

    /// Report peer connectivity from `sync` in [`health`](Self::health).
    pub fn with_sync(mut self, sync: Arc<SyncTransport>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        &self.lifecycle
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub async fn assign_task(self: &Arc<Self>, task: Task) -> Result<TaskAssignment, FleetError> {
        if !self.accepting.load(Ordering::Acquire) {
            self.publish_rejected(&task, "orchestrator is shutting down");
            return Err(FleetError::ShuttingDown);
        }
        let _assign = self.assign_lock.lock().await;

        // Earlier tasks of the same type keep their turn.
        let same_type_waiting = self
            .queue
            .lock()
            .iter()
            .any(|queued| queued.agent_type == task.agent_type);
        if !same_type_waiting {
            match self.place(&task).await {
                Ok(Some(agent_id)) => {
                    self.dispatch(agent_id, task);
                    return Ok(TaskAssignment::Assigned { agent_id });
                }
                Ok(None) => {}
                Err(e) => {
                    self.publish_failed(&task, None, &e.to_string());
                    return Err(e);
                }
            }
        }
        self.enqueue(task)
    }

    /// Find or make an agent for `task`. `None` means the pool is saturated.
    async fn place(&self, task: &Task) -> Result<Option<AgentId>, FleetError> {
        if let Some(agent_id) = self.lifecycle.try_claim(&task.agent_type) {
            return Ok(Some(agent_id));
        }

        if self.lifecycle.active_count() >= self.settings.max_agents {
            let Some(idle) = self.lifecycle.idle_agent_not_of(&task.agent_type) else {
                return Ok(None);
            };
            debug!(agent_id = %idle, agent_type = %task.agent_type, "Recycling idle agent of another type");
            self.lifecycle.retire(idle).await?;
        }

        let agent_id = match self.lifecycle.spawn(&task.agent_type) {
            Ok(agent_id) => agent_id,
            Err(LifecycleError::PoolFull { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = self.lifecycle.initialize(agent_id).await {
            // Free the slot; the failure is already reported by the lifecycle manager.
            if let Err(retire_err) = self.lifecycle.retire(agent_id).await {
                warn!(%agent_id, error = %retire_err, "Failed to retire agent after failed initialization");
            }
            return Err(e.into());
        }
        self.lifecycle.claim(agent_id)?;
        Ok(Some(agent_id))
    }

    fn enqueue(&self, task: Task) -> Result<TaskAssignment, FleetError> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.settings.task_queue_capacity {
            drop(queue);
            warn!(task_id = %task.id, agent_type = %task.agent_type, "Fleet at capacity, rejecting task");
            metrics::counter!("fleet_tasks_rejected_total").increment(1);
            self.publish_rejected(&task, "fleet at capacity");
            return Err(FleetError::CapacityExceeded {
                max_agents: self.settings.max_agents,
                queue_capacity: self.settings.task_queue_capacity,
            });
        }

        let task_id = task.id;
        queue.push_back(task);
        let position = queue.len();
        drop(queue);

        debug!(%task_id, position, "Task queued");
        metrics::gauge!("fleet_task_queue_depth").set(position as f64);
        self.event_bus.publish_domain(TaskEvent::Queued {
            task_id,
            position,
            queued_at: Utc::now(),
        });
        Ok(TaskAssignment::Queued { position })
    }

    fn dispatch(self: &Arc<Self>, agent_id: AgentId, task: Task) {
        info!(task_id = %task.id, %agent_id, agent_type = %task.agent_type, "Task assigned");
        metrics::counter!("fleet_tasks_assigned_total").increment(1);
        self.event_bus.publish_domain(TaskEvent::Assigned {
            task_id: task.id,
            agent_id,
            assigned_at: Utc::now(),
        });

        let orchestrator = Arc::clone(self);
        self.running.spawn(async move {
            orchestrator.run_task(agent_id, task).await;
            orchestrator.drain_queue().await;
        });
    }

    async fn run_task(&self, agent_id: AgentId, task: Task) {
        let started = Instant::now();
        let result = self.lifecycle.run_claimed(agent_id, &task).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (output, error) = match &result {
            Ok(output) => (Some(output.clone()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let record = TaskResultRecord {
            task_id: task.id,
            agent_id: Some(agent_id),
            agent_type: task.agent_type.clone(),
            success: result.is_ok(),
            output,
            error: error.clone(),
            duration_ms,
            completed_at: Utc::now(),
        };
        if let Err(e) = self.store.put_typed(&record, PutOptions::public()) {
            warn!(task_id = %task.id, error = %e, "Failed to persist task result");
        }

        match error {
            None => {
                debug!(task_id = %task.id, %agent_id, duration_ms, "Task completed");
                metrics::counter!("fleet_tasks_completed_total").increment(1);
                self.event_bus.publish_domain(TaskEvent::Completed {
                    task_id: task.id,
                    agent_id,
                    duration_ms,
                    completed_at: Utc::now(),
                });
            }
            Some(error) => {
                warn!(task_id = %task.id, %agent_id, error = %error, "Task failed");
                self.publish_failed(&task, Some(agent_id), &error);
            }
        }
    }

    /// Place queued tasks, oldest first, until none can be placed.
    async fn drain_queue(self: &Arc<Self>) {
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }
        let _assign = self.assign_lock.lock().await;

        let waiting: Vec<Task> = self.queue.lock().iter().cloned().collect();
        for task in waiting {
            match self.place(&task).await {
                Ok(Some(agent_id)) => {
                    self.remove_queued(task.id);
                    self.dispatch(agent_id, task);
                }
                Ok(None) => {}
                Err(e) => {
                    self.remove_queued(task.id);
                    self.publish_failed(&task, None, &e.to_string());
                }
            }
        }
        metrics::gauge!("fleet_task_queue_depth").set(self.queue_depth() as f64);
    }

    fn remove_queued(&self, task_id: TaskId) {
        self.queue.lock().retain(|queued| queued.id != task_id);
    }

    fn publish_failed(&self, task: &Task, agent_id: Option<AgentId>, error: &str) {
        metrics::counter!("fleet_tasks_failed_total").increment(1);
        self.event_bus.publish_domain(TaskEvent::Failed {
            task_id: task.id,
            agent_id,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
    }

    fn publish_rejected(&self, task: &Task, reason: &str) {
        self.event_bus.publish_domain(TaskEvent::Rejected {
            task_id: task.id,
            reason: reason.to_string(),
            rejected_at: Utc::now(),
        });
    }

    pub fn health(&self) -> FleetHealth {
        let agents_by_state = self.lifecycle.counts_by_state();
        for (state, count) in &agents_by_state {
            metrics::gauge!("fleet_agents", "state" => state.as_str()).set(*count as f64);
        }

        let (peers_connected, peers_total, peers_evicted, fallback_active, sync_error_rate) =
            match &self.sync {
                Some(sync) => {
                    let snapshot = sync.metrics();
                    (
                        snapshot.active_peers,
                        sync.peers().len(),
                        snapshot.peers_evicted,
                        snapshot.fallback_connections > 0,
                        snapshot.error_rate,
                    )
                }
                None => (0, 0, 0, false, 0.0),
            };

        FleetHealth {
            agents_by_state,
            queue_depth: self.queue_depth(),
            queue_capacity: self.settings.task_queue_capacity,
            peers_connected,
            peers_total,
            peers_evicted,
            fallback_active,
            store_write_failures: self.store.write_failures(),
            sync_error_rate,
            status: HealthStatus::Healthy,
        }
        .classify()
    }

    /// Reject queued tasks, wait for running ones and retire every agent.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        {
            let _assign = self.assign_lock.lock().await;
            let abandoned: Vec<Task> = self.queue.lock().drain(..).collect();
            for task in &abandoned {
                self.publish_rejected(task, "orchestrator is shutting down");
            }
            if !abandoned.is_empty() {
                info!(count = abandoned.len(), "Rejected queued tasks on shutdown");
            }
        }

        self.running.close();
        self.running.wait().await;

        for (agent_id, result) in self.lifecycle.retire_all().await {
            if let Err(e) = result {
                warn!(%agent_id, error = %e, "Agent did not retire cleanly");
            }
        }
        info!("Fleet orchestrator stopped");
    }
}
