//! Scheduling loop.
//!
//! Each tick: gate checks (automated mode, admin state, safety window,
//! backoff), concurrent discovery across backends, then a Bernoulli trial per
//! unclaimed candidate. Every started experiment gets its own polling task
//! that sleeps between polls and runs the blocking health check on the
//! blocking pool.
//!
//! Readers never touch a live [`Experiment`]; pollers publish an
//! [`ExperimentSnapshot`] after every step.
//!
//! The start itself runs inside the poller task, so an experiment is
//! reachable by [`Orchestrator::abandon_all`] from the moment it is claimed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio::task::JoinSet;

use mayhem_core::{
    AdminController, AdminSnapshot, AdminState, ApiStatus, Backend, BackendHealth, BackendLevel,
    BackendType, ChaosError, EngineConfig, Experiment, ExperimentId, ExperimentSnapshot,
    ExperimentSuite, ExperimentTiming, Notifier, OperationName, ResourceRef, ResourceRegistry,
    SafetyWindow,
};

use crate::error::DaemonError;

/// Why a tick did nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ManualMode,
    AdminGate(AdminState),
    OutsideSafetyWindow,
    Backoff { remaining_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Skipped(SkipReason),
    Completed { started: Vec<ExperimentId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub backend_type: BackendType,
    pub level: BackendLevel,
    pub health: BackendHealth,
    pub api_status: ApiStatus,
    pub destruction_probability: f64,
    pub roster_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub admin: AdminSnapshot,
    pub automated_mode: bool,
    pub backoff_period_secs: u64,
    pub seconds_since_last_schedule: Option<u64>,
    pub active_experiments: usize,
    pub tracked_resources: usize,
    pub backends: Vec<BackendStatus>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub automated_mode: bool,
    pub backoff_period: Duration,
    pub timing: ExperimentTiming,
    pub max_concurrent_discoveries: usize,
    pub retention: Duration,
}

impl From<&EngineConfig> for OrchestratorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            automated_mode: config.automated_mode,
            backoff_period: config.backoff_period(),
            timing: config.experiment.timing(),
            max_concurrent_discoveries: config.max_concurrent_discoveries,
            retention: config.retention(),
        }
    }
}

struct Record {
    snapshot: ExperimentSnapshot,
    finished: Option<Instant>,
}

pub struct Orchestrator {
    backends: Vec<Arc<dyn Backend>>,
    registry: Arc<ResourceRegistry>,
    admin: Arc<AdminController>,
    safety: Arc<dyn SafetyWindow>,
    notifier: Arc<dyn Notifier>,
    timing: ExperimentTiming,
    retention: Duration,
    automated_mode: AtomicBool,
    backoff_period: Mutex<Duration>,
    last_scheduled: Mutex<Option<Instant>>,
    rosters: Mutex<HashMap<BackendType, Vec<ResourceRef>>>,
    records: Mutex<HashMap<ExperimentId, Record>>,
    /// Each task yields `true` if it abandoned its experiment.
    pollers: Mutex<JoinSet<bool>>,
    abandon_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
    discovery_slots: Arc<Semaphore>,
    rng: Mutex<StdRng>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        backends: Vec<Arc<dyn Backend>>,
        admin: Arc<AdminController>,
        safety: Arc<dyn SafetyWindow>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (abandon_tx, _) = broadcast::channel(4);
        Self {
            backends,
            registry: Arc::new(ResourceRegistry::new()),
            admin,
            safety,
            notifier,
            timing: settings.timing,
            retention: settings.retention,
            automated_mode: AtomicBool::new(settings.automated_mode),
            backoff_period: Mutex::new(settings.backoff_period),
            last_scheduled: Mutex::new(None),
            rosters: Mutex::new(HashMap::new()),
            records: Mutex::new(HashMap::new()),
            pollers: Mutex::new(JoinSet::new()),
            abandon_tx,
            stopping: AtomicBool::new(false),
            discovery_slots: Arc::new(Semaphore::new(settings.max_concurrent_discoveries.max(1))),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Fix the RNG used for Bernoulli trials.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock().unwrap_or_else(PoisonError::into_inner) = StdRng::seed_from_u64(seed);
        self
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn admin(&self) -> &Arc<AdminController> {
        &self.admin
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    pub fn automated_mode(&self) -> bool {
        self.automated_mode.load(Ordering::SeqCst)
    }

    /// Takes effect on the next tick.
    pub fn set_automated_mode(&self, enabled: bool) {
        tracing::info!(enabled, "automated mode changed");
        self.automated_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn backoff_period(&self) -> Duration {
        *self.backoff_period.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes effect on the next tick.
    pub fn set_backoff_period(&self, period: Duration) {
        tracing::info!(seconds = period.as_secs(), "backoff period changed");
        *self.backoff_period.lock().unwrap_or_else(PoisonError::into_inner) = period;
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    pub async fn tick(self: &Arc<Self>) -> TickOutcome {
        self.tick_at(now(), Utc::now()).await
    }

    pub async fn tick_at(self: &Arc<Self>, now: Instant, wall: DateTime<Utc>) -> TickOutcome {
        self.prune(now);

        if !self.automated_mode() {
            return TickOutcome::Skipped(SkipReason::ManualMode);
        }
        if !self.admin.can_run_experiments() {
            return TickOutcome::Skipped(SkipReason::AdminGate(self.admin.state()));
        }
        if !self.safety.is_within_safe_window(wall) {
            return TickOutcome::Skipped(SkipReason::OutsideSafetyWindow);
        }
        let backoff = self.backoff_period();
        let last = *self.last_scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = last {
            let since = now.saturating_duration_since(last);
            if since < backoff {
                return TickOutcome::Skipped(SkipReason::Backoff {
                    remaining_secs: (backoff - since).as_secs(),
                });
            }
        }

        let mut started = Vec::new();
        'backends: for (backend, roster) in self.discover_all().await {
            let candidates = backend.experiment_candidates(&roster);
            tracing::debug!(
                backend = %backend.backend_type(),
                candidates = candidates.len(),
                "evaluating candidates",
            );
            for resource in candidates {
                if !self.admin.can_run_experiments() {
                    tracing::info!(state = %self.admin.state(), "admin gate closed mid-tick");
                    break 'backends;
                }
                if resource.is_claimed() {
                    continue;
                }
                if !self.trial(backend.destruction_probability()) {
                    continue;
                }
                match self.start_experiment(resource.clone(), None, now).await {
                    Ok(snapshot) => started.push(snapshot.id),
                    Err(err) => tracing::warn!(
                        resource = %resource.display_name(),
                        error = %err,
                        "experiment did not start",
                    ),
                }
            }
        }

        if !started.is_empty() {
            *self.last_scheduled.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        }
        TickOutcome::Completed { started }
    }

    /// Run every pair in `suite` against the backend's last roster, skipping
    /// the Bernoulli trial. An empty match is not an error.
    pub async fn schedule_experiment_suite(
        self: &Arc<Self>,
        suite: &ExperimentSuite,
    ) -> Result<Vec<ExperimentSnapshot>, DaemonError> {
        self.ensure_gate_open()?;
        let backend = self
            .backends
            .iter()
            .find(|b| b.backend_type() == &suite.backend_type)
            .cloned()
            .ok_or_else(|| {
                ChaosError::Config(format!("no backend of type '{}'", suite.backend_type))
            })?;

        let cached = self
            .rosters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&suite.backend_type)
            .cloned();
        let roster = match cached {
            Some(roster) => roster,
            None => self.discover(backend.clone()).await?,
        };

        let now = now();
        let mut started = Vec::new();
        for (key, operation) in suite.pairs() {
            for resource in roster.iter().filter(|r| &r.aggregation_key() == key) {
                self.ensure_gate_open()?;
                if resource.is_claimed() {
                    tracing::info!(
                        resource = %resource.display_name(),
                        operation = %operation,
                        "suite target already under experiment, skipping",
                    );
                    continue;
                }
                match self
                    .start_experiment(resource.clone(), Some(operation.clone()), now)
                    .await
                {
                    Ok(snapshot) => started.push(snapshot),
                    Err(err) => tracing::warn!(
                        resource = %resource.display_name(),
                        operation = %operation,
                        error = %err,
                        "suite experiment did not start",
                    ),
                }
            }
        }
        tracing::info!(
            backend = %suite.backend_type,
            pairs = suite.len(),
            started = started.len(),
            "suite scheduled",
        );
        Ok(started)
    }

    /// Manual single-shot trigger by identity fingerprint or backend id.
    pub async fn experiment_by_resource_id(
        self: &Arc<Self>,
        id: &str,
    ) -> Result<ExperimentSnapshot, DaemonError> {
        self.ensure_gate_open()?;
        let resource = match self.locate(id) {
            Some(resource) => resource,
            None => {
                self.discover_all().await;
                self.locate(id)
                    .ok_or_else(|| ChaosError::ResourceNotFound(id.to_string()))?
            }
        };
        self.start_experiment(resource, None, now()).await
    }

    /// First backend, in configured order, that knows `id`.
    fn locate(&self, id: &str) -> Option<ResourceRef> {
        self.backends
            .iter()
            .find_map(|backend| self.registry.find_by_key(backend.backend_type(), id))
    }

    async fn start_experiment(
        self: &Arc<Self>,
        resource: ResourceRef,
        operation: Option<OperationName>,
        now: Instant,
    ) -> Result<ExperimentSnapshot, DaemonError> {
        self.ensure_gate_open()?;
        let mut builder = Experiment::builder(resource)
            .timing(self.timing)
            .notifier(self.notifier.clone());
        if let Some(operation) = operation {
            builder = builder.operation(operation);
        }
        let experiment = builder.build()?;

        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
            if self.stopping.load(Ordering::SeqCst) {
                return Err(DaemonError::Protocol("orchestrator is shutting down".to_string()));
            }
            let orchestrator = Arc::clone(self);
            let abandon_rx = self.abandon_tx.subscribe();
            pollers.spawn(async move {
                orchestrator
                    .run_experiment(experiment, now, ready_tx, abandon_rx)
                    .await
            });
        }

        ready_rx
            .await
            .map_err(|_| DaemonError::Protocol("experiment task ended before starting".to_string()))?
    }

    /// Start `experiment` on the blocking pool, report the outcome through
    /// `ready`, then poll it to completion.
    async fn run_experiment(
        self: Arc<Self>,
        mut experiment: Experiment,
        start_at: Instant,
        ready: oneshot::Sender<Result<ExperimentSnapshot, DaemonError>>,
        abandon_rx: broadcast::Receiver<()>,
    ) -> bool {
        let started =
            tokio::task::spawn_blocking(move || experiment.start(start_at).map(|()| experiment)).await;
        let mut experiment = match started {
            Ok(Ok(experiment)) => experiment,
            Ok(Err(err)) => {
                let _ = ready.send(Err(err.into()));
                return false;
            }
            Err(err) => {
                let _ = ready.send(Err(DaemonError::Protocol(format!(
                    "experiment start task failed: {err}"
                ))));
                return false;
            }
        };

        if let Err(err) = self.ensure_gate_open() {
            let at = now();
            experiment.abandon(at);
            tracing::warn!(
                experiment = %experiment.id(),
                state = %self.admin.state(),
                "admin gate closed while starting, abandoning experiment",
            );
            self.publish(experiment.snapshot(), Some(at));
            let _ = ready.send(Err(err.into()));
            return true;
        }

        let snapshot = experiment.snapshot();
        self.publish(snapshot.clone(), None);
        let _ = ready.send(Ok(snapshot));
        self.poll_until_done(experiment, abandon_rx).await
    }

    async fn poll_until_done(
        self: Arc<Self>,
        experiment: Experiment,
        mut abandon_rx: broadcast::Receiver<()>,
    ) -> bool {
        let experiment = Arc::new(Mutex::new(experiment));
        loop {
            let delay = {
                let exp = experiment.lock().unwrap_or_else(PoisonError::into_inner);
                if exp.is_terminal() {
                    break;
                }
                exp.next_poll_delay(now())
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = abandon_rx.recv() => {
                    let mut exp = experiment.lock().unwrap_or_else(PoisonError::into_inner);
                    let at = now();
                    let abandoned = exp.abandon(at);
                    self.publish(exp.snapshot(), Some(at));
                    return abandoned;
                }
            }

            let exp = experiment.clone();
            let polled = tokio::task::spawn_blocking(move || {
                let mut exp = exp.lock().unwrap_or_else(PoisonError::into_inner);
                let at = now();
                exp.poll(at);
                (exp.snapshot(), exp.finished_instant())
            })
            .await;

            match polled {
                Ok((snapshot, finished)) => self.publish(snapshot, finished),
                Err(err) => {
                    tracing::error!(error = %err, "poll task failed, abandoning experiment");
                    let mut exp = experiment.lock().unwrap_or_else(PoisonError::into_inner);
                    let at = now();
                    let abandoned = exp.abandon(at);
                    self.publish(exp.snapshot(), Some(at));
                    return abandoned;
                }
            }
        }
        false
    }

    /// Abandon every in-flight experiment, including ones still starting,
    /// and wait for each to record its outcome. Returns how many were
    /// abandoned.
    pub async fn abandon_all(&self) -> usize {
        let mut pollers = std::mem::take(&mut *self.pollers.lock().unwrap_or_else(PoisonError::into_inner));
        if !pollers.is_empty() {
            tracing::warn!(tasks = pollers.len(), "abandoning in-flight experiments");
        }
        let _ = self.abandon_tx.send(());
        let mut abandoned = 0;
        while let Some(joined) = pollers.join_next().await {
            match joined {
                Ok(true) => abandoned += 1,
                Ok(false) => {}
                Err(err) => tracing::error!(error = %err, "experiment poller panicked"),
            }
        }
        abandoned
    }

    /// Refuse new experiments, then abandon the in-flight ones.
    pub async fn shutdown(&self) {
        {
            let _pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
            self.stopping.store(true, Ordering::SeqCst);
        }
        let abandoned = self.abandon_all().await;
        tracing::info!(abandoned, "orchestrator stopped");
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Discover every backend concurrently, bounded by the discovery slots.
    /// A failing backend contributes nothing this tick.
    async fn discover_all(&self) -> Vec<(Arc<dyn Backend>, Vec<ResourceRef>)> {
        let mut handles = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let Ok(permit) = self.discovery_slots.clone().acquire_owned().await else {
                break;
            };
            let registry = self.registry.clone();
            let task_backend = backend.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                task_backend.discover(&registry)
            });
            handles.push((backend.clone(), handle));
        }

        let mut out = Vec::with_capacity(handles.len());
        for (backend, handle) in handles {
            match handle.await {
                Ok(Ok(roster)) => {
                    self.rosters
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(backend.backend_type().clone(), roster.clone());
                    out.push((backend, roster));
                }
                Ok(Err(err)) => tracing::warn!(
                    backend = %backend.backend_type(),
                    error = %err,
                    fatal = err.is_fatal(),
                    "discovery failed, skipping backend this tick",
                ),
                Err(err) => tracing::error!(
                    backend = %backend.backend_type(),
                    error = %err,
                    "discovery task failed",
                ),
            }
        }
        out
    }

    async fn discover(&self, backend: Arc<dyn Backend>) -> Result<Vec<ResourceRef>, DaemonError> {
        let registry = self.registry.clone();
        let ty = backend.backend_type().clone();
        let roster = tokio::task::spawn_blocking(move || backend.discover(&registry))
            .await
            .map_err(|e| DaemonError::Protocol(format!("discovery task failed: {e}")))??;
        self.rosters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ty, roster.clone());
        Ok(roster)
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    /// Every retained experiment, oldest first.
    pub fn experiments(&self) -> Vec<ExperimentSnapshot> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = records.values().map(|r| r.snapshot.clone()).collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub fn active_count(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| !r.snapshot.state.is_terminal())
            .count()
    }

    pub async fn backend_statuses(&self) -> Vec<BackendStatus> {
        let rosters: HashMap<BackendType, usize> = self
            .rosters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(ty, roster)| (ty.clone(), roster.len()))
            .collect();

        let mut out = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let probe = backend.clone();
            let (health, api_status) = tokio::task::spawn_blocking(move || (probe.health(), probe.api_status()))
                .await
                .unwrap_or((BackendHealth::Failed, ApiStatus::Error));
            out.push(BackendStatus {
                backend_type: backend.backend_type().clone(),
                level: backend.level(),
                health,
                api_status,
                destruction_probability: backend.destruction_probability(),
                roster_size: rosters.get(backend.backend_type()).copied().unwrap_or(0),
            });
        }
        out
    }

    pub async fn status(&self) -> StatusReport {
        let last = *self.last_scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        StatusReport {
            admin: self.admin.snapshot(),
            automated_mode: self.automated_mode(),
            backoff_period_secs: self.backoff_period().as_secs(),
            seconds_since_last_schedule: last.map(|t| now().saturating_duration_since(t).as_secs()),
            active_experiments: self.active_count(),
            tracked_resources: self.registry.len(),
            backends: self.backend_statuses().await,
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_gate_open(&self) -> Result<(), ChaosError> {
        if self.admin.can_run_experiments() {
            Ok(())
        } else {
            Err(ChaosError::AdminGate(self.admin.state()))
        }
    }

    fn trial(&self, probability: f64) -> bool {
        if probability.is_nan() || probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(probability)
    }

    fn publish(&self, snapshot: ExperimentSnapshot, finished: Option<Instant>) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.id, Record { snapshot, finished });
    }

    /// Drop finished experiments older than the retention period and reap
    /// poller tasks that have returned.
    pub(crate) fn prune(&self, now: Instant) {
        {
            let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
            while let Some(joined) = pollers.try_join_next() {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "experiment poller panicked");
                }
            }
        }

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, r| match r.finished {
            Some(at) => now.saturating_duration_since(at) < self.retention,
            None => true,
        });
        let pruned = before - records.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned finished experiments");
        }
    }
}

#[cfg(test)]
impl Orchestrator {
    fn poller_count(&self) -> usize {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use mayhem_core::backend::Page;
    use mayhem_core::client::{BackendClient, ClientBackend, ClientSettings, RemoteResource};
    use mayhem_core::inventory::InventoryClient;
    use mayhem_core::script::LocalShell;
    use mayhem_core::{
        AlwaysOpen, CapabilityTable, ExperimentState, FailureReason, FaultType, TracingNotifier,
    };

    use super::*;

    fn remote(id: &str, zone: Option<&str>) -> RemoteResource {
        RemoteResource {
            id: id.to_string(),
            kind: "vm".to_string(),
            status: "running".to_string(),
            attributes: zone
                .map(|z| BTreeMap::from([("zone".to_string(), z.to_string())]))
                .unwrap_or_default(),
        }
    }

    fn backend(resources: Vec<RemoteResource>, probability: f64) -> Arc<dyn Backend> {
        let mut settings = ClientSettings::new("vm");
        settings.destruction_probability = probability;
        settings.grouping_identifiers = vec!["zone".to_string()];
        settings.capabilities.insert(
            "vm".to_string(),
            CapabilityTable::new()
                .with("restart", FaultType::State)
                .with("stop", FaultType::State),
        );
        let client = Arc::new(InventoryClient::from_resources(resources));
        Arc::new(ClientBackend::new(settings, client, Arc::new(LocalShell)))
    }

    /// Inventory whose fault calls take `delay`.
    struct SlowClient {
        inner: InventoryClient,
        delay: Duration,
    }

    impl BackendClient for SlowClient {
        fn list_page(
            &self,
            filter: &BTreeMap<String, String>,
            token: Option<&str>,
        ) -> Result<Page<RemoteResource>, ChaosError> {
            self.inner.list_page(filter, token)
        }

        fn resource_status(&self, id: &str) -> Result<Option<String>, ChaosError> {
            self.inner.resource_status(id)
        }

        fn invoke(&self, id: &str, operation: &OperationName) -> Result<(), ChaosError> {
            std::thread::sleep(self.delay);
            self.inner.invoke(id, operation)
        }

        fn probe(&self) -> Result<(), ChaosError> {
            self.inner.probe()
        }
    }

    fn slow_backend(resources: Vec<RemoteResource>, delay: Duration) -> Arc<dyn Backend> {
        let mut settings = ClientSettings::new("vm");
        settings.destruction_probability = 1.0;
        settings.capabilities.insert(
            "vm".to_string(),
            CapabilityTable::new().with("restart", FaultType::State),
        );
        let client = Arc::new(SlowClient {
            inner: InventoryClient::from_resources(resources),
            delay,
        });
        Arc::new(ClientBackend::new(settings, client, Arc::new(LocalShell)))
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            automated_mode: true,
            backoff_period: Duration::from_secs(100),
            timing: ExperimentTiming::default(),
            max_concurrent_discoveries: 2,
            retention: Duration::from_secs(60),
        }
    }

    fn orchestrator(backends: Vec<Arc<dyn Backend>>, state: AdminState) -> Arc<Orchestrator> {
        Arc::new(
            Orchestrator::new(
                settings(),
                backends,
                Arc::new(AdminController::new(state)),
                Arc::new(AlwaysOpen),
                Arc::new(TracingNotifier),
            )
            .with_seed(7),
        )
    }

    fn started(outcome: &TickOutcome) -> usize {
        match outcome {
            TickOutcome::Completed { started } => started.len(),
            TickOutcome::Skipped(_) => 0,
        }
    }

    #[tokio::test]
    async fn backoff_suppresses_second_tick() {
        let orch = orchestrator(
            vec![backend(vec![remote("vm-1", None), remote("vm-2", None)], 1.0)],
            AdminState::Started,
        );
        let t0 = now();
        let first = orch.tick_at(t0, Utc::now()).await;
        assert_eq!(started(&first), 2);

        let second = orch.tick_at(t0 + Duration::from_secs(10), Utc::now()).await;
        assert_eq!(
            second,
            TickOutcome::Skipped(SkipReason::Backoff { remaining_secs: 90 })
        );
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn idle_tick_does_not_reset_backoff() {
        let orch = orchestrator(vec![backend(vec![remote("vm-1", None)], 0.0)], AdminState::Started);
        let t0 = now();
        assert_eq!(orch.tick_at(t0, Utc::now()).await, TickOutcome::Completed { started: vec![] });
        let again = orch.tick_at(t0 + Duration::from_secs(1), Utc::now()).await;
        assert_eq!(again, TickOutcome::Completed { started: vec![] });
    }

    #[tokio::test]
    async fn paused_admin_starts_nothing() {
        let orch = orchestrator(vec![backend(vec![remote("vm-1", None)], 1.0)], AdminState::Paused);
        let outcome = orch.tick_at(now(), Utc::now()).await;
        assert_eq!(outcome, TickOutcome::Skipped(SkipReason::AdminGate(AdminState::Paused)));
        assert!(orch.experiments().is_empty());

        let manual = orch.experiment_by_resource_id("vm-1").await;
        assert!(matches!(manual, Err(DaemonError::Core(ChaosError::AdminGate(_)))));
    }

    #[tokio::test]
    async fn manual_mode_skips_ticks() {
        let orch = orchestrator(vec![backend(vec![remote("vm-1", None)], 1.0)], AdminState::Started);
        orch.set_automated_mode(false);
        assert_eq!(
            orch.tick_at(now(), Utc::now()).await,
            TickOutcome::Skipped(SkipReason::ManualMode)
        );
    }

    #[tokio::test]
    async fn closed_safety_window_skips_ticks() {
        struct Closed;
        impl SafetyWindow for Closed {
            fn is_within_safe_window(&self, _at: DateTime<Utc>) -> bool {
                false
            }
        }
        let orch = Arc::new(Orchestrator::new(
            settings(),
            vec![backend(vec![remote("vm-1", None)], 1.0)],
            Arc::new(AdminController::new(AdminState::Started)),
            Arc::new(Closed),
            Arc::new(TracingNotifier),
        ));
        assert_eq!(
            orch.tick_at(now(), Utc::now()).await,
            TickOutcome::Skipped(SkipReason::OutsideSafetyWindow)
        );
    }

    #[tokio::test]
    async fn claimed_resources_are_not_rescheduled() {
        let orch = orchestrator(vec![backend(vec![remote("vm-1", None)], 1.0)], AdminState::Started);
        orch.set_backoff_period(Duration::ZERO);
        let t0 = now();
        assert_eq!(started(&orch.tick_at(t0, Utc::now()).await), 1);
        assert_eq!(started(&orch.tick_at(t0 + Duration::from_secs(1), Utc::now()).await), 0);
        assert_eq!(orch.active_count(), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn suite_starts_exact_operation_on_matching_group() {
        let orch = orchestrator(
            vec![backend(vec![remote("vm-1", Some("az-1")), remote("vm-2", Some("az-2"))], 0.0)],
            AdminState::Started,
        );
        let suite = ExperimentSuite::new("vm").with("az-1", ["restart"]);
        let started = orch.schedule_experiment_suite(&suite).await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].operation, Some(OperationName::from("restart")));
        assert_eq!(started[0].resource_name, "vm/vm-1");
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn suite_without_matching_resources_starts_nothing() {
        let orch = orchestrator(vec![backend(vec![], 1.0)], AdminState::Started);
        let suite = ExperimentSuite::new("vm").with("az-1", ["restart"]);
        assert!(orch.schedule_experiment_suite(&suite).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn suite_for_unknown_backend_is_an_error() {
        let orch = orchestrator(vec![backend(vec![], 1.0)], AdminState::Started);
        let suite = ExperimentSuite::new("db").with("az-1", ["restart"]);
        assert!(orch.schedule_experiment_suite(&suite).await.is_err());
    }

    #[tokio::test]
    async fn suite_respects_admin_gate() {
        let orch = orchestrator(vec![backend(vec![remote("vm-1", Some("az-1"))], 1.0)], AdminState::Paused);
        let suite = ExperimentSuite::new("vm").with("az-1", ["restart"]);
        assert!(orch.schedule_experiment_suite(&suite).await.is_err());
    }

    #[tokio::test]
    async fn manual_trigger_finds_resource_by_key() {
        let orch = orchestrator(vec![backend(vec![remote("vm-1", None)], 0.0)], AdminState::Started);
        let snapshot = orch.experiment_by_resource_id("vm-1").await.unwrap();
        assert_eq!(snapshot.state, ExperimentState::Running);

        let missing = orch.experiment_by_resource_id("vm-404").await;
        assert!(matches!(missing, Err(DaemonError::Core(ChaosError::ResourceNotFound(_)))));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_abandons_in_flight_experiments() {
        let orch = orchestrator(vec![backend(vec![remote("vm-1", None)], 1.0)], AdminState::Started);
        assert_eq!(started(&orch.tick_at(now(), Utc::now()).await), 1);

        assert_eq!(orch.abandon_all().await, 1);
        let experiments = orch.experiments();
        assert_eq!(experiments.len(), 1);
        assert_eq!(experiments[0].state, ExperimentState::Failed);
        assert_eq!(experiments[0].failure, Some(FailureReason::Abandoned));
        assert_eq!(orch.active_count(), 0);
        let resource = orch.registry().find_by_key(&BackendType::from("vm"), "vm-1").unwrap();
        assert!(!resource.is_claimed());
    }

    #[tokio::test]
    async fn abort_reaches_experiment_still_starting() {
        let orch = orchestrator(
            vec![slow_backend(vec![remote("vm-1", None)], Duration::from_millis(300))],
            AdminState::Started,
        );
        let trigger = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.experiment_by_resource_id("vm-1").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        orch.admin().set_state(AdminState::Abort);
        assert_eq!(orch.abandon_all().await, 1);

        let outcome = trigger.await.unwrap();
        assert!(matches!(
            outcome,
            Err(DaemonError::Core(ChaosError::AdminGate(AdminState::Abort)))
        ));
        let experiments = orch.experiments();
        assert_eq!(experiments.len(), 1);
        assert_eq!(experiments[0].state, ExperimentState::Failed);
        assert_eq!(experiments[0].failure, Some(FailureReason::Abandoned));
        assert_eq!(orch.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_experiment_still_starting() {
        let orch = orchestrator(
            vec![slow_backend(vec![remote("vm-1", None)], Duration::from_millis(300))],
            AdminState::Started,
        );
        let trigger = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.experiment_by_resource_id("vm-1").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        orch.shutdown().await;
        assert!(trigger.await.unwrap().is_ok());
        let experiments = orch.experiments();
        assert_eq!(experiments.len(), 1);
        assert_eq!(experiments[0].state, ExperimentState::Failed);
        assert_eq!(experiments[0].failure, Some(FailureReason::Abandoned));

        let late = orch.experiment_by_resource_id("vm-1").await;
        assert!(matches!(late, Err(DaemonError::Protocol(_))));
        assert!(orch.experiments().iter().all(|e| e.state.is_terminal()));
    }

    #[tokio::test]
    async fn finished_pollers_are_reaped() {
        let mut fast = settings();
        fast.backoff_period = Duration::ZERO;
        fast.timing = ExperimentTiming {
            minimum: Duration::ZERO,
            ..ExperimentTiming::default()
        };
        let resources: Vec<_> = (0..5).map(|i| remote(&format!("vm-{i}"), None)).collect();
        let orch = Arc::new(
            Orchestrator::new(
                fast,
                vec![backend(resources, 1.0)],
                Arc::new(AdminController::new(AdminState::Started)),
                Arc::new(AlwaysOpen),
                Arc::new(TracingNotifier),
            )
            .with_seed(7),
        );
        assert_eq!(started(&orch.tick_at(now(), Utc::now()).await), 5);

        for _ in 0..300 {
            orch.prune(now());
            if orch.active_count() == 0 && orch.poller_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(orch.active_count(), 0);
        assert_eq!(orch.poller_count(), 0);
        assert!(orch
            .experiments()
            .iter()
            .all(|e| e.state == ExperimentState::Finalized));
    }

    #[tokio::test]
    async fn manual_trigger_prefers_backends_in_configured_order() {
        let mut db = ClientSettings::new("db");
        db.capabilities.insert(
            "vm".to_string(),
            CapabilityTable::new().with("restart", FaultType::State),
        );
        let db: Arc<dyn Backend> = Arc::new(ClientBackend::new(
            db,
            Arc::new(InventoryClient::from_resources(vec![remote("shared-1", None)])),
            Arc::new(LocalShell),
        ));
        let orch = orchestrator(
            vec![db, backend(vec![remote("shared-1", None)], 0.0)],
            AdminState::Started,
        );
        let snapshot = orch.experiment_by_resource_id("shared-1").await.unwrap();
        assert_eq!(snapshot.backend_type, BackendType::from("db"));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn finished_experiments_are_pruned_after_retention() {
        let orch = orchestrator(vec![backend(vec![remote("vm-1", None)], 1.0)], AdminState::Started);
        orch.tick_at(now(), Utc::now()).await;
        orch.abandon_all().await;

        orch.prune(now() + Duration::from_secs(30));
        assert_eq!(orch.experiments().len(), 1);
        orch.prune(now() + Duration::from_secs(61));
        assert!(orch.experiments().is_empty());
    }

    #[tokio::test]
    async fn failing_backend_does_not_stop_the_tick() {
        let broken = Arc::new(InventoryClient::from_resources(vec![remote("db-1", None)]));
        broken.set_reachable(false);
        let mut settings_db = ClientSettings::new("db");
        settings_db.destruction_probability = 1.0;
        let broken: Arc<dyn Backend> =
            Arc::new(ClientBackend::new(settings_db, broken, Arc::new(LocalShell)));

        let orch = orchestrator(
            vec![broken, backend(vec![remote("vm-1", None)], 1.0)],
            AdminState::Started,
        );
        assert_eq!(started(&orch.tick_at(now(), Utc::now()).await), 1);

        let statuses = orch.backend_statuses().await;
        assert_eq!(statuses[0].api_status, ApiStatus::Error);
        assert_eq!(statuses[1].api_status, ApiStatus::Ok);
        assert_eq!(statuses[1].roster_size, 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn status_reports_configuration_changes() {
        let orch = orchestrator(vec![backend(vec![], 1.0)], AdminState::Started);
        orch.set_backoff_period(Duration::from_secs(42));
        orch.set_automated_mode(false);
        let status = orch.status().await;
        assert_eq!(status.backoff_period_secs, 42);
        assert!(!status.automated_mode);
        assert_eq!(status.admin.state, AdminState::Started);
        assert!(status.seconds_since_last_schedule.is_none());
    }
}
