//! Projection runtime
//!
//! One polling worker per projection, iterating the instances present in
//! the log. Workers cooperate only through checkpoint rows: read cursor,
//! fetch a batch in position order, reduce, advance. A reducer that keeps
//! failing has its event parked so the log is never blocked. Stall
//! detection compares the head of the log against each checkpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::event_store::{EventFilter, EventPosition, EventStore};

use super::{CheckpointStatus, Checkpoints, Projection, ProjectionError};

/// Runtime tunables
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Idle sleep between polls
    pub interval: Duration,
    /// Events fetched per poll
    pub batch_size: i64,
    /// Reduce attempts before an event is parked
    pub max_attempts: u32,
    /// Positions a checkpoint may trail the head before counting as lag
    pub stall_threshold: i64,
    /// How long lag must persist before the projection reports unhealthy
    pub stall_grace: chrono::Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            batch_size: 200,
            max_attempts: 3,
            stall_threshold: 100,
            stall_grace: chrono::Duration::seconds(30),
        }
    }
}

/// Health snapshot for one `(projection, instance)` pair
#[derive(Debug, Clone)]
pub struct ProjectionHealth {
    pub projection: String,
    pub instance_id: String,
    pub checkpoint: EventPosition,
    pub head: EventPosition,
    pub lag: i64,
    pub healthy: bool,
}

/// The projection runtime
pub struct Projector {
    store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn Checkpoints>,
    projections: Vec<Arc<dyn Projection>>,
    config: ProjectorConfig,
    /// When a pair was first seen lagging; cleared once it catches up
    lagging_since: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
}

impl Projector {
    pub fn new(
        store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn Checkpoints>,
        projections: Vec<Arc<dyn Projection>>,
        config: ProjectorConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            store,
            checkpoints,
            projections,
            config,
            lagging_since: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Create tables and checkpoint storage for every projection
    pub async fn init(&self) -> Result<(), ProjectionError> {
        self.checkpoints.init().await?;
        for projection in &self.projections {
            projection.init().await?;
        }
        Ok(())
    }

    /// Spawn one polling worker per projection
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.projections
            .iter()
            .cloned()
            .map(|projection| {
                let projector = Arc::clone(self);
                tokio::spawn(async move {
                    projector.run_projection(projection).await;
                })
            })
            .collect()
    }

    /// Signal all workers to stop after their current event
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn run_projection(self: Arc<Self>, projection: Arc<dyn Projection>) {
        tracing::info!(projection = projection.name(), "Projection worker started");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut applied = 0usize;
            match self.store.instances().await {
                Ok(instances) => {
                    for instance_id in instances {
                        match self.tick(projection.as_ref(), &instance_id).await {
                            Ok(count) => applied += count,
                            Err(err) => {
                                tracing::error!(
                                    projection = projection.name(),
                                    instance_id = %instance_id,
                                    error = %err,
                                    "Projection tick failed"
                                );
                            }
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "Instance discovery failed");
                }
            }

            if applied == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!(projection = projection.name(), "Projection worker stopped");
    }

    /// One poll for one `(projection, instance)`: fetch a batch past the
    /// checkpoint and apply it in order.
    pub async fn tick(
        &self,
        projection: &dyn Projection,
        instance_id: &str,
    ) -> Result<usize, ProjectionError> {
        let cursor = self.checkpoints.get(projection.name(), instance_id).await?;
        let events = self
            .store
            .filter(
                &EventFilter::instance(instance_id)
                    .after_position(cursor)
                    .with_limit(self.config.batch_size),
            )
            .await
            .map_err(|err| ProjectionError::Reducer(err.to_string()))?;

        let mut shutdown = self.shutdown.subscribe();
        let mut applied = 0usize;
        for event in &events {
            if *shutdown.borrow_and_update() {
                break;
            }

            let mut last_error: Option<ProjectionError> = None;
            for attempt in 1..=self.config.max_attempts {
                match projection.reduce(event).await {
                    Ok(()) => {
                        last_error = None;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            projection = projection.name(),
                            event_type = %event.event_type,
                            attempt = attempt,
                            error = %err,
                            "Reducer failed"
                        );
                        last_error = Some(err);
                        tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                    }
                }
            }

            match last_error {
                None => {
                    self.checkpoints
                        .advance(projection.name(), event, CheckpointStatus::Running)
                        .await?;
                }
                Some(err) => {
                    // Park and move on; the log must keep flowing
                    self.checkpoints
                        .park_failed(
                            projection.name(),
                            event,
                            &err.to_string(),
                            self.config.max_attempts,
                        )
                        .await?;
                    self.checkpoints
                        .advance(projection.name(), event, CheckpointStatus::Failing)
                        .await?;
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Run every projection until it has caught up with the log head.
    /// Used by tests and by one-shot rebuilds.
    pub async fn catch_up(&self) -> Result<(), ProjectionError> {
        let instances = self
            .store
            .instances()
            .await
            .map_err(|err| ProjectionError::Reducer(err.to_string()))?;
        for projection in &self.projections {
            for instance_id in &instances {
                while self.tick(projection.as_ref(), instance_id).await? > 0 {}
            }
        }
        Ok(())
    }

    /// Administrative reset: truncate a projection's tables and rewind its
    /// checkpoints, so the next poll replays from scratch.
    pub async fn reset_projection(&self, name: &str) -> Result<(), ProjectionError> {
        let projection = self
            .projections
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| ProjectionError::Reducer(format!("unknown projection {name}")))?;
        let instances = self
            .store
            .instances()
            .await
            .map_err(|err| ProjectionError::Reducer(err.to_string()))?;
        for instance_id in instances {
            projection.reset(&instance_id).await?;
            self.checkpoints.reset(name, &instance_id).await?;
        }
        Ok(())
    }

    /// Compare each checkpoint against the log head. A pair is unhealthy
    /// once it trails by more than the threshold for longer than the grace
    /// period.
    pub async fn health(&self) -> Result<Vec<ProjectionHealth>, ProjectionError> {
        let now = Utc::now();
        let instances = self
            .store
            .instances()
            .await
            .map_err(|err| ProjectionError::Reducer(err.to_string()))?;

        let mut lagging = self.lagging_since.lock().await;
        let mut report = Vec::new();

        for instance_id in &instances {
            let head = self
                .store
                .max_position(instance_id)
                .await
                .map_err(|err| ProjectionError::Reducer(err.to_string()))?
                .unwrap_or_else(EventPosition::zero);

            for projection in &self.projections {
                let checkpoint = self.checkpoints.get(projection.name(), instance_id).await?;
                let lag = head.position - checkpoint.position;
                let key = (projection.name().to_string(), instance_id.clone());

                let healthy = if lag > self.config.stall_threshold {
                    let since = *lagging.entry(key).or_insert(now);
                    now - since < self.config.stall_grace
                } else {
                    lagging.remove(&key);
                    true
                };

                report.push(ProjectionHealth {
                    projection: projection.name().to_string(),
                    instance_id: instance_id.clone(),
                    checkpoint,
                    head,
                    lag,
                    healthy,
                });
            }
        }
        Ok(report)
    }
}
