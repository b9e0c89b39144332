//! Polling observers for pools.
//!
//! One poll cycle asks each observer once: assignment observers surface
//! new status transitions as events, status observers report open/close
//! edges, and analytics observers watch the unique-worker count of exam
//! pools and close them at their configured limit.

use crate::actions::{AssignmentEvent, EventType};
use crate::platform::types::{
    AnalyticsRequest, AssignmentStatus, Operation, OperationStatus, Pool, PoolStatus,
};
use crate::platform::PlatformClient;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Surfaces assignments whose status has not been seen before.
pub struct AssignmentsObserver {
    pool_id: String,
    seen: HashMap<AssignmentStatus, HashSet<String>>,
}

impl AssignmentsObserver {
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            seen: HashMap::new(),
        }
    }

    /// Fetch current assignments and return one event per new
    /// (assignment, status) pair. An assignment that is submitted and
    /// later accepted produces two events over time.
    pub async fn poll(&mut self, client: &PlatformClient) -> Result<Vec<AssignmentEvent>> {
        let statuses = [
            AssignmentStatus::Submitted,
            AssignmentStatus::Accepted,
            AssignmentStatus::Rejected,
        ];

        let assignments = client.get_assignments(&self.pool_id, &statuses).await?;

        let mut events = Vec::new();
        for assignment in assignments {
            let event_type = match assignment.status {
                AssignmentStatus::Submitted => EventType::Submitted,
                AssignmentStatus::Accepted => EventType::Accepted,
                AssignmentStatus::Rejected => EventType::Rejected,
                _ => continue,
            };

            let seen = self.seen.entry(assignment.status).or_default();
            if seen.insert(assignment.id.clone()) {
                events.push(AssignmentEvent {
                    event_type,
                    assignment,
                });
            }
        }

        Ok(events)
    }
}

/// Tracks pool open/close transitions.
pub struct PoolStatusObserver {
    pool_id: String,
    last_status: Option<PoolStatus>,
}

/// A status edge observed on a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTransition {
    Opened,
    Closed,
}

impl PoolStatusObserver {
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            last_status: None,
        }
    }

    /// Fetch the pool and report a transition when its status flipped
    /// since the last poll.
    pub async fn poll(&mut self, client: &PlatformClient) -> Result<(Pool, Option<PoolTransition>)> {
        let pool = client.get_pool(&self.pool_id).await?;

        let transition = match (self.last_status, pool.status) {
            (Some(previous), Some(current)) if previous != current => {
                if pool.is_closed() {
                    info!("Closed pool with ID {}", self.pool_id);
                    Some(PoolTransition::Closed)
                } else if pool.is_open() {
                    info!("Opened pool with ID {}", self.pool_id);
                    Some(PoolTransition::Opened)
                } else {
                    None
                }
            }
            // A pool that drained before the first poll still counts as a
            // close edge, or its closure handlers would never fire.
            (None, Some(_))
                if pool.is_closed()
                    && pool.last_close_reason == Some(crate::platform::types::CloseReason::Completed) =>
            {
                info!("Closed pool with ID {}", self.pool_id);
                Some(PoolTransition::Closed)
            }
            _ => None,
        };

        self.last_status = pool.status;
        Ok((pool, transition))
    }
}

/// Watches exam pools through pool analytics and closes them once the
/// configured number of unique workers have submitted.
pub struct AnalyticsObserver {
    pool_id: String,
    project_id: String,
    limit: u32,
    pub limit_reached: bool,
    prev_workers: Option<u64>,
    operation_id: Option<String>,
}

impl AnalyticsObserver {
    pub fn new(pool_id: impl Into<String>, project_id: impl Into<String>, limit: u32) -> Self {
        Self {
            pool_id: pool_id.into(),
            project_id: project_id.into(),
            limit,
            limit_reached: false,
            prev_workers: None,
            operation_id: None,
        }
    }

    /// Check the pending analytics operation, acting on its result, and
    /// start a new one when none is in flight.
    pub async fn poll(&mut self, client: &PlatformClient) -> Result<()> {
        if let Some(operation_id) = self.operation_id.clone() {
            let operation = client.get_operation(&operation_id).await?;

            if operation.status == OperationStatus::Success {
                if let Some(workers) = unique_workers_count(&operation) {
                    self.handle_worker_count(client, workers).await?;
                }
            }

            if operation.status.is_terminal() {
                self.operation_id = None;
            }
        }

        if self.operation_id.is_none() {
            let operation = client
                .request_analytics(&[
                    AnalyticsRequest::unique_workers_count(&self.pool_id),
                    AnalyticsRequest::submitted_assignments_count(&self.pool_id),
                ])
                .await?;
            self.operation_id = Some(operation.id);
        }

        Ok(())
    }

    async fn handle_worker_count(&mut self, client: &PlatformClient, workers: u64) -> Result<()> {
        if !self.limit_reached && workers >= u64::from(self.limit) {
            warn!(
                "Maximum number of workers ({}) reached for pool {}; closing pool",
                self.limit, self.pool_id
            );
            self.limit_reached = true;

            client.close_pool(&self.pool_id).await?;
            info!("Successfully closed pool {}", self.pool_id);

            // The exam is over, so its trainings can close too.
            for training in client.get_trainings(&self.project_id).await? {
                let Some(training_id) = training.id else { continue };
                match client.close_training(&training_id).await {
                    Ok(()) => info!("Successfully closed training pool {}", training_id),
                    Err(e) => warn!(
                        "Attempted to close training {} for pool {}: {}",
                        training_id, self.pool_id, e
                    ),
                }
            }
            return Ok(());
        }

        if !self.limit_reached && self.prev_workers != Some(workers) {
            info!("{} workers submitted to pool {}", workers, self.pool_id);
            self.prev_workers = Some(workers);
        }

        Ok(())
    }
}

/// Extract the unique-worker count from a finished analytics operation.
fn unique_workers_count(operation: &Operation) -> Option<u64> {
    operation
        .details
        .as_ref()?
        .get("value")?
        .as_array()?
        .iter()
        .find(|response| response["request"]["name"] == "unique_workers_count")
        .and_then(|response| response["result"].as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unique_workers_count_extraction() {
        let operation = Operation {
            id: "op-1".to_string(),
            status: OperationStatus::Success,
            details: Some(json!({
                "value": [
                    {"request": {"name": "submitted_assignments_count"}, "result": 12},
                    {"request": {"name": "unique_workers_count"}, "result": 7},
                ]
            })),
        };

        assert_eq!(unique_workers_count(&operation), Some(7));
    }

    #[test]
    fn test_unique_workers_count_missing() {
        let operation = Operation {
            id: "op-1".to_string(),
            status: OperationStatus::Success,
            details: None,
        };
        assert_eq!(unique_workers_count(&operation), None);

        let operation = Operation {
            id: "op-2".to_string(),
            status: OperationStatus::Success,
            details: Some(json!({ "value": [] })),
        };
        assert_eq!(unique_workers_count(&operation), None);
    }
}
