//! The applier: consumes the order log and keeps a materialized view current.
//!
//! ```text
//!            connect ok                 poll / apply error
//! Connecting ─────────► Consuming ─────────────────────────► Backoff
//!     ▲                                                         │
//!     └───────────────────────── delay elapsed ─────────────────┘
//! any state ── shutdown ──► Stopped
//! ```
//!
//! Each polled batch is split into lanes by a hash of the aggregate id, so
//! envelopes of one aggregate stay in log order inside a single lane while
//! different lanes apply in parallel. A delivery is committed only after its
//! envelope was applied (or recognised as a duplicate, or dead-lettered as
//! poison). Anything left unapplied forces a reconnect, and the reconnected
//! session replays it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use orderflow_core::AggregateId;
use orderflow_events::{
    ApplyOutcome, ConsumerSession, Delivery, EventEnvelope, EventRegistry, EventSource, Projection,
};

use crate::health::{ApplierState, HealthState};
use crate::projections::{ApplyError, MaterializedView};
use crate::read_model::{ProjectionStore, StoreError};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct ApplierConfig {
    pub group: String,
    pub consumer: String,
    /// Upper bound on deliveries taken per poll.
    pub batch_size: usize,
    /// How long one poll waits for new records.
    pub poll_timeout: Duration,
    /// Delay schedule between reconnect attempts; its attempt ceiling is ignored.
    pub backoff: RetryPolicy,
    /// Consecutive failures before health reports degraded.
    pub degraded_after: u32,
    /// Number of apply lanes per batch.
    pub parallelism: usize,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            group: "order-query-consumer".to_string(),
            consumer: "order-query-1".to_string(),
            batch_size: 32,
            poll_timeout: Duration::from_millis(500),
            backoff: RetryPolicy::exponential(
                u32::MAX,
                Duration::from_millis(200),
                Duration::from_secs(10),
            ),
            degraded_after: 5,
            parallelism: 4,
        }
    }
}

/// Handle to control and join a running applier.
#[derive(Debug)]
pub struct ApplierHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    health: Arc<HealthState>,
}

impl ApplierHandle {
    pub fn health(&self) -> Arc<HealthState> {
        self.health.clone()
    }

    /// Request graceful shutdown and wait for the applier to stop.
    ///
    /// The batch in flight is finished and committed first; no new poll is
    /// issued afterwards. A backoff sleep is cut short.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("applier thread panicked");
            }
        }
    }
}

/// What happened to one delivery of a batch.
#[derive(Debug)]
enum Processed {
    Applied(ApplyOutcome),
    Poison(String),
    Failed(StoreError),
    /// An earlier envelope of the same lane failed; this one must wait.
    NotAttempted,
}

#[derive(Debug, Error)]
enum CycleError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} delivery(ies) left unapplied")]
    Incomplete(usize),
}

fn broker<E: std::fmt::Display>(err: E) -> CycleError {
    CycleError::Broker(err.to_string())
}

/// Consumes one consumer group's view of the log into a [`MaterializedView`].
pub struct Applier<Src, P, S> {
    source: Src,
    view: Arc<MaterializedView<P, S>>,
    registry: EventRegistry,
    config: ApplierConfig,
    health: Arc<HealthState>,
}

impl<Src, P, S> Applier<Src, P, S>
where
    Src: EventSource,
    P: Projection,
    S: ProjectionStore<AggregateId, P::Record>,
{
    pub fn new(
        source: Src,
        view: Arc<MaterializedView<P, S>>,
        registry: EventRegistry,
        config: ApplierConfig,
    ) -> Self {
        let health = Arc::new(HealthState::new(config.degraded_after));
        Self {
            source,
            view,
            registry,
            config,
            health,
        }
    }

    pub fn health(&self) -> Arc<HealthState> {
        self.health.clone()
    }

    /// Run the state machine on the current thread until `shutdown` fires or
    /// its sender is dropped.
    pub fn run(&self, shutdown: &mpsc::Receiver<()>) {
        let cfg = &self.config;
        let mut failures: u32 = 0;
        let mut connected_before = false;

        info!(
            group = %cfg.group,
            consumer = %cfg.consumer,
            projection = self.view.projection().name(),
            "applier starting"
        );

        'session: loop {
            if stop_requested(shutdown) {
                break;
            }

            self.health.set_state(ApplierState::Connecting);
            let mut session = match self.source.connect(&cfg.group, &cfg.consumer) {
                Ok(session) => session,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    self.health.stats().record_broker_failure();
                    self.record_failure(&format!("connect failed: {err}"));
                    if self.backoff(failures, shutdown) {
                        break;
                    }
                    continue;
                }
            };

            if connected_before {
                self.health.stats().record_reconnect();
            }
            connected_before = true;
            self.health.record_connected();
            info!(group = %cfg.group, consumer = %cfg.consumer, "applier connected");

            loop {
                if stop_requested(shutdown) {
                    break 'session;
                }

                let batch = match session.poll(cfg.batch_size, cfg.poll_timeout) {
                    Ok(batch) => batch,
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        self.health.stats().record_broker_failure();
                        self.record_failure(&format!("poll failed: {err}"));
                        if self.backoff(failures, shutdown) {
                            break 'session;
                        }
                        continue 'session;
                    }
                };

                if batch.is_empty() {
                    failures = 0;
                    self.health.record_progress();
                    continue;
                }

                match self.process_batch(&mut session, batch) {
                    Ok(()) => {
                        failures = 0;
                        self.health.record_progress();
                    }
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        if matches!(err, CycleError::Broker(_)) {
                            self.health.stats().record_broker_failure();
                        }
                        self.record_failure(&err.to_string());
                        if self.backoff(failures, shutdown) {
                            break 'session;
                        }
                        // Reconnect: the new session replays what was not committed.
                        continue 'session;
                    }
                }
            }
        }

        self.health.record_stopped();
        info!(group = %cfg.group, consumer = %cfg.consumer, "applier stopped");
    }

    fn record_failure(&self, reason: &str) {
        if self.health.record_failure(reason) {
            error!(
                degraded_after = self.config.degraded_after,
                error = %reason,
                "applier degraded"
            );
        } else {
            warn!(error = %reason, "applier cycle failed");
        }
    }

    /// Sleep before reconnecting. Returns true when shutdown was requested.
    fn backoff(&self, failures: u32, shutdown: &mpsc::Receiver<()>) -> bool {
        self.health.set_state(ApplierState::Backoff);
        let delay = self.config.backoff.delay_for_attempt(failures);
        debug!(?delay, failures, "applier backing off");

        match shutdown.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    fn process_batch(
        &self,
        session: &mut Src::Session,
        batch: Vec<Delivery>,
    ) -> Result<(), CycleError> {
        let mut results: Vec<Processed> = batch.iter().map(|_| Processed::NotAttempted).collect();

        let envelopes: Vec<Option<EventEnvelope<JsonValue>>> = batch
            .iter()
            .zip(results.iter_mut())
            .map(|(delivery, result)| {
                match EventEnvelope::from_bytes(&delivery.payload, &self.registry) {
                    Ok(envelope) => Some(envelope),
                    Err(err) => {
                        *result = Processed::Poison(err.to_string());
                        None
                    }
                }
            })
            .collect();

        let lane_count = self.config.parallelism.max(1);
        let mut lanes: Vec<Vec<(usize, &EventEnvelope<JsonValue>)>> =
            (0..lane_count).map(|_| Vec::new()).collect();
        for (index, envelope) in envelopes.iter().enumerate() {
            if let Some(envelope) = envelope {
                lanes[lane_of(envelope.aggregate_id(), lane_count)].push((index, envelope));
            }
        }
        lanes.retain(|lane| !lane.is_empty());

        let view = &*self.view;
        let applied: Vec<(usize, Processed)> = if lanes.len() <= 1 {
            lanes.into_iter().flat_map(|lane| apply_lane(view, lane)).collect()
        } else {
            thread::scope(|scope| {
                let workers: Vec<_> = lanes
                    .into_iter()
                    .map(|lane| scope.spawn(move || apply_lane(view, lane)))
                    .collect();
                workers
                    .into_iter()
                    .flat_map(|worker| match worker.join() {
                        Ok(results) => results,
                        Err(_) => {
                            error!("apply lane panicked");
                            Vec::new()
                        }
                    })
                    .collect()
            })
        };
        for (index, processed) in applied {
            results[index] = processed;
        }

        let stats = self.health.stats();
        let mut store_failure: Option<StoreError> = None;
        let mut unapplied = 0usize;

        for (delivery, processed) in batch.iter().zip(results) {
            match processed {
                Processed::Applied(outcome) => {
                    if outcome.is_skipped() {
                        stats.record_duplicate();
                        debug!(position = %delivery.position, ?outcome, "duplicate envelope skipped");
                    } else {
                        stats.record_applied();
                        debug!(position = %delivery.position, ?outcome, "envelope applied");
                    }
                    session.commit(&delivery.position).map_err(broker)?;
                }
                Processed::Poison(reason) => {
                    stats.record_poison();
                    warn!(
                        position = %delivery.position,
                        redelivered = delivery.redelivered,
                        reason = %reason,
                        "poison message dead-lettered"
                    );
                    session.dead_letter(delivery, &reason).map_err(broker)?;
                    session.commit(&delivery.position).map_err(broker)?;
                }
                Processed::Failed(err) => {
                    stats.record_store_failure();
                    warn!(position = %delivery.position, error = %err, "store rejected envelope");
                    unapplied += 1;
                    store_failure.get_or_insert(err);
                }
                Processed::NotAttempted => unapplied += 1,
            }
        }

        match store_failure {
            Some(err) => Err(CycleError::Store(err)),
            None if unapplied > 0 => Err(CycleError::Incomplete(unapplied)),
            None => Ok(()),
        }
    }
}

impl<Src, P, S> Applier<Src, P, S>
where
    Src: EventSource + 'static,
    P: Projection + 'static,
    S: ProjectionStore<AggregateId, P::Record> + 'static,
{
    /// Run the applier on a dedicated thread.
    pub fn spawn(self, name: impl Into<String>) -> io::Result<ApplierHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let health = self.health.clone();

        let join = thread::Builder::new()
            .name(name.into())
            .spawn(move || self.run(&shutdown_rx))?;

        Ok(ApplierHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            health,
        })
    }
}

fn stop_requested(shutdown: &mpsc::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

fn lane_of(aggregate_id: &AggregateId, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    aggregate_id.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

/// Apply one lane in order. The first store failure stops the lane.
fn apply_lane<P, S>(
    view: &MaterializedView<P, S>,
    lane: Vec<(usize, &EventEnvelope<JsonValue>)>,
) -> Vec<(usize, Processed)>
where
    P: Projection,
    S: ProjectionStore<AggregateId, P::Record>,
{
    let mut out = Vec::with_capacity(lane.len());
    for (index, envelope) in lane {
        match view.apply_envelope(envelope) {
            Ok(outcome) => out.push((index, Processed::Applied(outcome))),
            Err(ApplyError::Poison(reason)) => out.push((index, Processed::Poison(reason))),
            Err(ApplyError::Store(err)) => {
                out.push((index, Processed::Failed(err)));
                break;
            }
        }
    }
    out
}
