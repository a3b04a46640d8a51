//! Tiered scheduler driving the reconciler across every configured destination.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use super::gate::{DeploymentGate, StaticGate};
use super::hot::HotSet;
use super::outcome::{PassSummary, RecordOutcome, SyncErrorKind};
use super::policy::{EntityPolicy, Route, SyncPolicy, Tier};
use super::reconciler::{PassOptions, Reconciler};
use super::snapshot_merge::SnapshotMerger;
use super::status::{EngineStatus, EntityStatus, RouteStatus, StatusBoard};
use crate::adapter::{SharedAdapter, SqlAdapter, TimeoutAdapter};
use crate::db::{ConflictFilter, ConflictLedger, CursorStore, Database, IdMap};
use crate::error::{Error, Result};
use crate::models::{ConflictEntry, Destination, Direction, EntityType};
use crate::storage::SnapshotArchive;
use crate::util::{now_ts, Timestamp};

/// Cadences and limits for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub critical_interval: Duration,
    pub high_interval: Duration,
    pub medium_interval: Duration,
    pub low_interval: Duration,
    pub on_demand_interval: Duration,
    pub hot_ttl: Duration,
    /// Upper bound on every adapter call
    pub call_timeout: Duration,
    /// Entity passes in flight per tier
    pub tier_concurrency: usize,
    pub snapshot_interval: Duration,
    pub snapshot_merge_interval: Duration,
    pub snapshot_retention: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            critical_interval: Duration::from_secs(120),
            high_interval: Duration::from_secs(300),
            medium_interval: Duration::from_secs(900),
            low_interval: Duration::from_secs(3600),
            on_demand_interval: Duration::from_secs(15),
            hot_ttl: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
            tier_concurrency: 1,
            snapshot_interval: Duration::from_secs(86_400),
            snapshot_merge_interval: Duration::from_secs(21_600),
            snapshot_retention: 7,
        }
    }
}

impl EngineSettings {
    /// Timer cadence for a timed tier.
    pub const fn tier_interval(&self, tier: Tier) -> Option<Duration> {
        match tier {
            Tier::Critical => Some(self.critical_interval),
            Tier::High => Some(self.high_interval),
            Tier::Medium => Some(self.medium_interval),
            Tier::Low => Some(self.low_interval),
            Tier::OnDemand | Tier::LocalOnly => None,
        }
    }
}

/// A route that produced no pass summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteFailure {
    pub entity_type: EntityType,
    pub direction: Direction,
    pub kind: SyncErrorKind,
    pub message: String,
}

/// Everything one tier tick (or one operator trigger) did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// `None` for operator-triggered cycles spanning tiers
    pub tier: Option<Tier>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub unreachable: Vec<Destination>,
    pub passes: Vec<PassSummary>,
    pub failures: Vec<RouteFailure>,
}

#[derive(Default)]
struct SnapshotClock {
    last_publish: Option<Instant>,
    last_merge: Option<Instant>,
}

fn is_due(last: Option<Instant>, every: Duration) -> bool {
    last.map_or(true, |last| last.elapsed() >= every)
}

struct EngineInner {
    policy: SyncPolicy,
    settings: EngineSettings,
    gate: Arc<dyn DeploymentGate>,
    local_db: Arc<Database>,
    local: SharedAdapter,
    adapters: BTreeMap<Destination, SharedAdapter>,
    reconciler: Reconciler,
    cursors: CursorStore,
    ledger: ConflictLedger,
    archive: Option<SnapshotArchive>,
    merger: Option<SnapshotMerger>,
    hot: HotSet,
    board: StatusBoard,
    permits: BTreeMap<Tier, Arc<Semaphore>>,
    cycles: Mutex<BTreeMap<(EntityType, Direction), u32>>,
    snapshot_clock: tokio::sync::Mutex<SnapshotClock>,
    shutdown: watch::Sender<bool>,
}

/// Builds a [`SyncEngine`] around the local database.
pub struct SyncEngineBuilder {
    local: Arc<Database>,
    external: Option<SharedAdapter>,
    backup: Option<SharedAdapter>,
    archive: Option<SnapshotArchive>,
    gate: Option<Arc<dyn DeploymentGate>>,
    policy: SyncPolicy,
    settings: EngineSettings,
}

impl SyncEngineBuilder {
    #[must_use]
    pub fn external(mut self, adapter: SharedAdapter) -> Self {
        self.external = Some(adapter);
        self
    }

    #[must_use]
    pub fn backup(mut self, adapter: SharedAdapter) -> Self {
        self.backup = Some(adapter);
        self
    }

    /// Snapshot archive used for publishing and merging database snapshots.
    #[must_use]
    pub fn snapshots(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    #[must_use]
    pub fn gate(mut self, gate: Arc<dyn DeploymentGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Validate the policy and wire the engine together.
    pub fn build(self) -> Result<SyncEngine> {
        self.policy.validate()?;
        if self.settings.tier_concurrency == 0 {
            return Err(Error::Config("tier concurrency must be at least 1".into()));
        }

        let timeout = self.settings.call_timeout;
        let bounded = |adapter: SharedAdapter| -> SharedAdapter {
            Arc::new(TimeoutAdapter::new(adapter, timeout))
        };

        let local = bounded(Arc::new(SqlAdapter::new(Destination::Local, self.local.clone())?));
        let mut adapters = BTreeMap::from([(Destination::Local, local.clone())]);
        if let Some(external) = self.external {
            adapters.insert(Destination::External, bounded(external));
        }
        if let Some(backup) = self.backup {
            adapters.insert(Destination::Backup, bounded(backup));
        }

        let configured: BTreeSet<Destination> = adapters.keys().copied().collect();
        let gate = self
            .gate
            .unwrap_or_else(|| -> Arc<dyn DeploymentGate> {
                Arc::new(StaticGate::new(configured, None))
            });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ledger = ConflictLedger::new(self.local.connect()?);
        let reconciler = Reconciler::new(ledger.clone(), IdMap::new(self.local.connect()?))
            .with_shutdown(shutdown_rx);
        let merger = self
            .archive
            .clone()
            .map(|archive| SnapshotMerger::new(archive, reconciler.clone()));

        let permits = [
            Tier::Critical,
            Tier::High,
            Tier::Medium,
            Tier::Low,
            Tier::OnDemand,
        ]
        .into_iter()
        .map(|tier| (tier, Arc::new(Semaphore::new(self.settings.tier_concurrency))))
        .collect();

        tracing::info!(
            mode = %gate.current_mode(),
            destinations = ?gate.active(),
            "Sync engine configured"
        );

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                hot: HotSet::new(self.settings.hot_ttl),
                cursors: CursorStore::new(self.local.connect()?),
                policy: self.policy,
                settings: self.settings,
                gate,
                local_db: self.local,
                local,
                adapters,
                reconciler,
                ledger,
                archive: self.archive,
                merger,
                board: StatusBoard::default(),
                permits,
                cycles: Mutex::new(BTreeMap::new()),
                snapshot_clock: tokio::sync::Mutex::new(SnapshotClock::default()),
                shutdown,
            }),
        })
    }
}

/// Multi-destination sync engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder(local: Arc<Database>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            local,
            external: None,
            backup: None,
            archive: None,
            gate: None,
            policy: SyncPolicy::default(),
            settings: EngineSettings::default(),
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.inner.policy
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Run the startup pass, then every tier loop, until [`SyncEngine::shutdown`].
    pub async fn run_until_shutdown(&self) {
        if let Err(error) = self.run_startup_pass().await {
            tracing::warn!("Startup pass aborted: {error}");
        }

        let mut tasks = JoinSet::new();
        for tier in Tier::TIMED {
            let engine = self.clone();
            tasks.spawn(async move { engine.tier_loop(tier).await });
        }
        let engine = self.clone();
        tasks.spawn(async move { engine.on_demand_loop().await });

        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                tracing::error!("Tier task ended abnormally: {error}");
            }
        }
        tracing::info!("Sync engine stopped");
    }

    async fn tier_loop(&self, tier: Tier) {
        let Some(every) = self.inner.settings.tier_interval(tier) else {
            return;
        };
        if self.inner.policy.for_tier(tier).next().is_none() {
            tracing::debug!(tier = %tier, "No entity types assigned; tier loop idle");
        }

        let mut shutdown = self.inner.shutdown.subscribe();
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if self.is_shutting_down() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if self.is_shutting_down() {
                break;
            }
            match self.run_tier_once(tier, false).await {
                Ok(report) => tracing::debug!(
                    tier = %tier,
                    passes = report.passes.len(),
                    failures = report.failures.len(),
                    "Tier tick finished"
                ),
                Err(Error::ShuttingDown) => break,
                Err(error) => tracing::warn!(tier = %tier, "Tier tick failed: {error}"),
            }
        }
    }

    async fn on_demand_loop(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if self.is_shutting_down() {
                break;
            }
            tokio::select! {
                () = self.inner.hot.marked() => {}
                () = tokio::time::sleep(self.inner.settings.on_demand_interval) => {}
                _ = shutdown.changed() => {}
            }
            if self.is_shutting_down() {
                break;
            }
            if let Err(error) = self.sweep_hot().await {
                tracing::warn!("On-demand sweep failed: {error}");
            }
        }
    }

    /// Run one tick of a timed tier.
    pub async fn run_tier_once(&self, tier: Tier, with_deletions: bool) -> Result<CycleReport> {
        self.ensure_running()?;
        if self.inner.settings.tier_interval(tier).is_none() {
            return Err(Error::InvalidInput(format!("{tier} is not a timed tier")));
        }
        let entities = self
            .inner
            .policy
            .for_tier(tier)
            .filter(|policy| policy.syncs())
            .cloned()
            .collect();
        Ok(self
            .inner
            .clone()
            .run_entities(Some(tier), entities, with_deletions)
            .await)
    }

    /// Force an immediate out-of-band pass for one entity type or all of them.
    pub async fn trigger(&self, entity: Option<EntityType>, with_deletions: bool) -> Result<CycleReport> {
        self.ensure_running()?;
        let entities = match entity {
            Some(entity) => {
                let policy = self
                    .inner
                    .policy
                    .get(entity)
                    .filter(|policy| policy.syncs())
                    .ok_or_else(|| Error::InvalidInput(format!("{entity} is not replicated")))?;
                vec![policy.clone()]
            }
            None => self
                .inner
                .policy
                .entities
                .iter()
                .filter(|policy| policy.syncs())
                .cloned()
                .collect(),
        };
        tracing::info!(entity = ?entity, with_deletions, "Manual sync triggered");
        Ok(self.inner.clone().run_entities(None, entities, with_deletions).await)
    }

    /// Pull startup-sync entity types into LOCAL from the most trusted
    /// reachable source (EXTERNAL, else BACKUP).
    pub async fn run_startup_pass(&self) -> Result<Vec<PassSummary>> {
        self.ensure_running()?;
        let inner = &self.inner;
        let active = inner.gate.active();
        let reachable = inner
            .ping(&active, &BTreeSet::from([Destination::External, Destination::Backup]))
            .await;

        let mut passes = Vec::new();
        for policy in inner.policy.entities.iter().filter(|p| p.startup_sync && p.syncs()) {
            let route = [Destination::External, Destination::Backup]
                .into_iter()
                .filter(|source| reachable.contains(source))
                .find_map(|source| {
                    policy
                        .routes
                        .iter()
                        .find(|route| route.source == source && route.target == Destination::Local)
                });
            let Some(route) = route else {
                tracing::info!(
                    entity = %policy.entity_type,
                    "No reachable source for startup sync; serving local data as-is"
                );
                continue;
            };
            match inner.run_route(policy, route, false).await {
                Some(Ok(summary)) => passes.push(summary),
                Some(Err(Error::ShuttingDown)) => return Err(Error::ShuttingDown),
                Some(Err(error)) => tracing::warn!(
                    entity = %policy.entity_type,
                    direction = %route.direction(),
                    "Startup pass failed: {error}"
                ),
                None => {}
            }
        }
        Ok(passes)
    }

    /// Reconcile every hot instance and its dependents on each of its routes.
    /// Cursors are left untouched.
    pub async fn sweep_hot(&self) -> Result<Vec<PassSummary>> {
        self.ensure_running()?;
        let inner = &self.inner;
        let hot = inner.hot.active();
        if hot.is_empty() {
            return Ok(Vec::new());
        }

        let active = inner.gate.active();
        let needed = hot
            .iter()
            .filter_map(|(entity, _)| inner.policy.get(*entity))
            .flat_map(|policy| policy.routes.iter())
            .flat_map(|route| [route.source, route.target])
            .collect();
        let reachable = inner.ping(&active, &needed).await;

        let mut summaries = BTreeMap::new();
        for (entity, key) in &hot {
            let Some(policy) = inner.policy.get(*entity).filter(|p| p.syncs()) else {
                continue;
            };
            inner
                .sweep_selection(policy, Selection::Key(key), &reachable, &mut summaries)
                .await?;

            for dependent in entity.dependents() {
                let Some(dependent_policy) = inner.policy.get(*dependent).filter(|p| p.syncs()) else {
                    continue;
                };
                let prefix = entity.dependent_key_prefix(key);
                inner
                    .sweep_selection(dependent_policy, Selection::Prefix(&prefix), &reachable, &mut summaries)
                    .await?;
            }
        }
        Ok(summaries.into_values().collect())
    }

    /// Mark an instance as recently accessed so the ON_DEMAND tier picks it up.
    pub fn mark_hot(&self, entity: EntityType, natural_key: &str) -> Result<()> {
        if !self.inner.policy.syncs(entity) {
            return Err(Error::InvalidInput(format!("{entity} is not replicated")));
        }
        entity.validate_natural_key(natural_key)?;
        self.inner.hot.mark(entity, natural_key);
        Ok(())
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let inner = &self.inner;
        let active = inner.gate.active();
        let pending = inner.ledger.pending_counts().await?;

        let mut entities = Vec::with_capacity(inner.policy.entities.len());
        for policy in &inner.policy.entities {
            let mut routes = Vec::with_capacity(policy.routes.len());
            for route in &policy.routes {
                let direction = route.direction();
                let mut status = inner.board.get(policy.entity_type, direction);
                if status.last_success_at.is_none() {
                    status.last_success_at = inner
                        .cursors
                        .get(policy.entity_type, direction)
                        .await?
                        .map(|cursor| cursor.last_successful_run_at);
                }
                routes.push(RouteStatus { direction, status });
            }

            let last_success_at = routes
                .iter()
                .map(|route| route.status.last_success_at)
                .collect::<Option<Vec<_>>>()
                .and_then(|times| times.into_iter().reduce(f64::min));
            let enabled = policy.syncs()
                && policy
                    .routes
                    .iter()
                    .any(|route| active.contains(&route.source) && active.contains(&route.target));

            entities.push(EntityStatus {
                entity_type: policy.entity_type,
                tier: policy.tier,
                enabled,
                last_success_at,
                pending_conflict_count: pending.get(&policy.entity_type).copied().unwrap_or(0),
                routes,
            });
        }

        Ok(EngineStatus {
            mode: inner.gate.current_mode(),
            active_destinations: active.into_iter().collect(),
            shutting_down: self.is_shutting_down(),
            hot_entries: inner.hot.len(),
            pending_recovered_keys: inner.merger.as_ref().map_or(0, SnapshotMerger::pending_len),
            entities,
        })
    }

    pub async fn conflicts(&self, filter: &ConflictFilter) -> Result<Vec<ConflictEntry>> {
        self.inner.ledger.list(filter).await
    }

    /// Mark a conflict resolved. The ledger is never resolved automatically.
    pub async fn resolve_conflict(&self, id: i64) -> Result<ConflictEntry> {
        self.inner.ledger.resolve(id).await
    }

    /// Stop starting new passes; in-flight record operations finish.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            tracing::info!("Sync engine shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

enum Selection<'a> {
    Key(&'a str),
    Prefix(&'a str),
}

type RouteResult = std::result::Result<PassSummary, RouteFailure>;

impl EngineInner {
    /// Ping every destination in `needed` that the gate has active.
    async fn ping(
        &self,
        active: &BTreeSet<Destination>,
        needed: &BTreeSet<Destination>,
    ) -> BTreeSet<Destination> {
        let mut reachable = BTreeSet::new();
        for destination in needed.iter().chain([&Destination::Local]) {
            if reachable.contains(destination) {
                continue;
            }
            if !active.contains(destination) {
                tracing::debug!(destination = %destination, "Destination disabled for this deployment");
                continue;
            }
            let Some(adapter) = self.adapters.get(destination) else {
                continue;
            };
            match adapter.ping().await {
                Ok(()) => {
                    reachable.insert(*destination);
                }
                Err(error) => tracing::warn!(
                    destination = %destination,
                    "Destination unreachable, skipping it this cycle: {error}"
                ),
            }
        }
        reachable
    }

    async fn permit(&self, tier: Tier) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.permits.get(&tier)?.clone();
        semaphore.acquire_owned().await.ok()
    }

    async fn run_entities(
        self: Arc<Self>,
        tier: Option<Tier>,
        entities: Vec<EntityPolicy>,
        with_deletions: bool,
    ) -> CycleReport {
        let started_at = now_ts();
        let active = self.gate.active();
        let needed: BTreeSet<Destination> = entities
            .iter()
            .flat_map(|policy| policy.routes.iter())
            .flat_map(|route| [route.source, route.target])
            .collect();
        let reachable = self.ping(&active, &needed).await;

        let mut tasks = JoinSet::new();
        for policy in entities {
            let inner = self.clone();
            let active = active.clone();
            let reachable = reachable.clone();
            tasks.spawn(async move {
                let Some(_permit) = inner.permit(policy.tier).await else {
                    return Vec::new();
                };
                inner
                    .sync_entity(&policy, &active, &reachable, with_deletions)
                    .await
            });
        }

        let mut passes = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(results) => {
                    for result in results {
                        match result {
                            Ok(summary) => passes.push(summary),
                            Err(failure) => failures.push(failure),
                        }
                    }
                }
                Err(error) => tracing::error!("Entity sync task ended abnormally: {error}"),
            }
        }
        passes.sort_by_key(|pass| (pass.entity_type, pass.direction));
        failures.sort_by_key(|failure| (failure.entity_type, failure.direction));

        let pulled_from_external = passes
            .iter()
            .any(|pass| pass.direction == Direction::new(Destination::External, Destination::Local));
        if tier == Some(Tier::Low) {
            self.maintain_snapshots(&reachable).await;
        }
        self.merge_snapshot_if_due(&active, &reachable, pulled_from_external)
            .await;

        CycleReport {
            tier,
            started_at,
            finished_at: now_ts(),
            unreachable: needed
                .iter()
                .filter(|destination| active.contains(destination) && !reachable.contains(destination))
                .copied()
                .collect(),
            passes,
            failures,
        }
    }

    async fn sync_entity(
        &self,
        policy: &EntityPolicy,
        active: &BTreeSet<Destination>,
        reachable: &BTreeSet<Destination>,
        with_deletions: bool,
    ) -> Vec<RouteResult> {
        let mut results = Vec::new();
        for route in &policy.routes {
            let direction = route.direction();
            if !active.contains(&route.source) || !active.contains(&route.target) {
                tracing::debug!(
                    entity = %policy.entity_type,
                    direction = %direction,
                    kind = ?SyncErrorKind::ConfigurationDisabled,
                    "Route disabled for this deployment"
                );
                continue;
            }
            if !reachable.contains(&route.source) || !reachable.contains(&route.target) {
                results.push(Err(RouteFailure {
                    entity_type: policy.entity_type,
                    direction,
                    kind: SyncErrorKind::AdapterUnreachable,
                    message: "destination failed its reachability check".into(),
                }));
                continue;
            }

            match self.run_route(policy, route, with_deletions).await {
                Some(Ok(summary)) => results.push(Ok(summary)),
                Some(Err(error)) => {
                    let shutting_down = matches!(error, Error::ShuttingDown);
                    results.push(Err(RouteFailure {
                        entity_type: policy.entity_type,
                        direction,
                        kind: SyncErrorKind::classify(&error),
                        message: error.to_string(),
                    }));
                    if shutting_down {
                        break;
                    }
                }
                None => {}
            }
        }
        results
    }

    /// One pass over a route, plus deletions when due. `None` if the pair
    /// was already running.
    async fn run_route(
        &self,
        policy: &EntityPolicy,
        route: &Route,
        with_deletions: bool,
    ) -> Option<Result<PassSummary>> {
        let entity = policy.entity_type;
        let direction = route.direction();
        if !self.board.try_begin(entity, direction, now_ts()) {
            tracing::debug!(entity = %entity, direction = %direction, "Pass already running; skipping");
            return None;
        }

        let result = self.run_route_pass(policy, route, with_deletions).await;
        self.board.finish(entity, direction, result.as_ref());
        if let Err(error) = &result {
            tracing::warn!(entity = %entity, direction = %direction, "Reconciler pass aborted: {error}");
        }
        Some(result)
    }

    async fn run_route_pass(
        &self,
        policy: &EntityPolicy,
        route: &Route,
        with_deletions: bool,
    ) -> Result<PassSummary> {
        let entity = policy.entity_type;
        let direction = route.direction();
        let (source, target) = self.route_adapters(route)?;

        let cursor = self.cursors.position(entity, direction).await?;
        let mut summary = self
            .reconciler
            .run_pass(
                source.as_ref(),
                target.as_ref(),
                entity,
                cursor,
                PassOptions::new(route.authoritative),
            )
            .await?;
        self.cursors
            .advance(entity, direction, summary.next_cursor())
            .await?;

        if self.deletions_due(entity, route, with_deletions) {
            match self
                .reconciler
                .propagate_deletions(source.as_ref(), target.as_ref(), entity, policy.deletion_mode)
                .await
            {
                Ok(deletions) => summary.deletions = Some(deletions),
                Err(error) => tracing::warn!(
                    entity = %entity,
                    direction = %direction,
                    "Deletion propagation aborted: {error}"
                ),
            }
        }
        Ok(summary)
    }

    fn route_adapters(&self, route: &Route) -> Result<(SharedAdapter, SharedAdapter)> {
        let adapter = |destination: Destination| {
            self.adapters
                .get(&destination)
                .cloned()
                .ok_or_else(|| Error::Config(format!("{destination} is not configured")))
        };
        Ok((adapter(route.source)?, adapter(route.target)?))
    }

    fn deletions_due(&self, entity: EntityType, route: &Route, requested: bool) -> bool {
        let every = route.deletions_every_cycles;
        if every == 0 {
            return false;
        }
        let mut cycles = self.cycles.lock().unwrap_or_else(PoisonError::into_inner);
        let count = cycles.entry((entity, route.direction())).or_insert(0);
        *count = count.wrapping_add(1);
        requested || *count % every == 0
    }

    async fn sweep_selection(
        &self,
        policy: &EntityPolicy,
        selection: Selection<'_>,
        reachable: &BTreeSet<Destination>,
        summaries: &mut BTreeMap<(EntityType, Direction), PassSummary>,
    ) -> Result<()> {
        let entity = policy.entity_type;
        for route in &policy.routes {
            if !reachable.contains(&route.source) || !reachable.contains(&route.target) {
                continue;
            }
            let direction = route.direction();
            let (source, target) = self.route_adapters(route)?;
            let records = match selection {
                Selection::Key(key) => source
                    .find_by_natural_key(entity, key)
                    .await
                    .map(|record| record.into_iter().collect::<Vec<_>>()),
                Selection::Prefix(prefix) => source.fetch_by_key_prefix(entity, prefix).await,
            };
            let records = match records {
                Ok(records) => records,
                Err(error) => {
                    tracing::warn!(entity = %entity, direction = %direction, "Hot fetch failed: {error}");
                    continue;
                }
            };

            let summary = summaries
                .entry((entity, direction))
                .or_insert_with(|| PassSummary::new(entity, direction, now_ts()));
            summary.fetched += records.len();
            for record in &records {
                let outcome = self
                    .reconciler
                    .reconcile_record(
                        source.as_ref(),
                        target.as_ref(),
                        entity,
                        record,
                        PassOptions::new(route.authoritative),
                    )
                    .await;
                if let RecordOutcome::Error(error) = &outcome {
                    if error.is_unreachable() {
                        tracing::warn!(entity = %entity, direction = %direction, "Hot sweep aborted: {error}");
                        break;
                    }
                }
                summary.record(record, outcome);
            }
            summary.finished_at = now_ts();
        }
        Ok(())
    }

    /// Publish and prune snapshots when the backup tier is reachable and due.
    async fn maintain_snapshots(&self, reachable: &BTreeSet<Destination>) {
        let Some(archive) = &self.archive else {
            return;
        };
        if !reachable.contains(&Destination::Backup) {
            return;
        }
        let Ok(mut clock) = self.snapshot_clock.try_lock() else {
            return;
        };
        if !is_due(clock.last_publish, self.settings.snapshot_interval) {
            return;
        }

        match archive.publish(&self.local_db).await {
            Ok(_) => {
                clock.last_publish = Some(Instant::now());
                match archive.prune(self.settings.snapshot_retention).await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::info!(pruned, "Pruned old snapshots"),
                    Err(error) => tracing::warn!("Snapshot pruning failed: {error}"),
                }
            }
            Err(error) => tracing::warn!("Snapshot publish failed: {error}"),
        }
    }

    /// Merge the newest snapshot into LOCAL when all three destinations are
    /// configured, then forward recovered keys to EXTERNAL when it is up.
    async fn merge_snapshot_if_due(
        &self,
        active: &BTreeSet<Destination>,
        reachable: &BTreeSet<Destination>,
        pulled_from_external: bool,
    ) {
        let Some(merger) = &self.merger else {
            return;
        };
        if Destination::ALL.iter().any(|destination| !active.contains(destination)) {
            return;
        }
        let external_up = reachable.contains(&Destination::External);
        let Ok(mut clock) = self.snapshot_clock.try_lock() else {
            return;
        };

        let merge_wanted = pulled_from_external || !external_up;
        if merge_wanted
            && reachable.contains(&Destination::Backup)
            && is_due(clock.last_merge, self.settings.snapshot_merge_interval)
        {
            let entities: Vec<EntityType> = self
                .policy
                .entities
                .iter()
                .filter(|policy| {
                    policy.syncs()
                        && policy.routes.iter().any(|route| {
                            route.source == Destination::Local && route.target == Destination::External
                        })
                })
                .map(|policy| policy.entity_type)
                .collect();
            match merger.merge_latest(self.local.as_ref(), &entities).await {
                Ok(_) => clock.last_merge = Some(Instant::now()),
                Err(error) => tracing::warn!("Snapshot merge failed: {error}"),
            }
        }

        if external_up && merger.pending_len() > 0 {
            let Some(external) = self.adapters.get(&Destination::External) else {
                return;
            };
            match merger
                .flush_forced(self.local.as_ref(), external.as_ref())
                .await
            {
                Ok(passes) => {
                    let applied: usize = passes.iter().map(|pass| pass.applied).sum();
                    tracing::info!(applied, "Forwarded recovered records to external store");
                }
                Err(error) => tracing::warn!("Forced external pass aborted: {error}"),
            }
        }
    }
}
