use crate::domain::availability::{AvailabilityResolver, WeeklyHours};
use crate::domain::blocked_slots::BlockedSlotStore;
use crate::domain::models::{
    AvailabilityConfig, BlockedSlot, OperatingHours, SlotKey, SlotOrigin, TimeSlot, WeekDay,
    validate_weekday, weekday_index,
};
use crate::domain::slot_state::{self, InteractionMode, SlotAction, SlotState};
use crate::domain::week_calendar::WeekCalendarBuilder;
use crate::infrastructure::config::VenueConfig;
use crate::infrastructure::error::{InfraError, poisoned};
use crate::infrastructure::event_index::EventIndex;
use crate::infrastructure::remote_client::AvailabilityRemote;
use crate::infrastructure::snapshot_cache::SnapshotCache;
use crate::infrastructure::sync_state_repository::SyncStateRepository;
use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep, timeout};
use tracing::{debug, info, warn};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const SNAPSHOT_KEY: &str = "state";
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

/// Everything the coordinator reconciles: one blocked slot, one weekday's
/// general hours, or one date's override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum SyncKey {
    Slot { key: SlotKey },
    General { weekday: u8 },
    Specific { date: NaiveDate },
}

impl SyncKey {
    pub fn slot(date: NaiveDate, hour: u8) -> Self {
        Self::Slot {
            key: SlotKey::new(date, hour),
        }
    }

    fn for_config(config: &AvailabilityConfig) -> Self {
        match config {
            AvailabilityConfig::General { weekday, .. } => Self::General { weekday: *weekday },
            AvailabilityConfig::Specific { date, .. } => Self::Specific { date: *date },
        }
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slot { key } => write!(f, "slot:{key}"),
            Self::General { weekday } => write!(f, "general:{weekday}"),
            Self::Specific { date } => write!(f, "specific:{date}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOp {
    Block,
    Unblock,
    SaveAvailability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "op", rename_all = "snake_case")]
pub enum KeyState {
    #[default]
    Unknown,
    Pending(PendingOp),
    Confirmed,
    RolledBack,
}

/// How a mutation ended once its remote call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome {
    Confirmed,
    /// A later action on the same key was issued first; this result was dropped.
    Superseded,
    /// The coordinator was shut down; nothing was applied.
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    Remote,
    Snapshot,
    /// Remote unreachable; the state already loaded this session was kept.
    Memory,
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoadReport {
    pub source: LoadSource,
    pub week_start: NaiveDate,
    pub blocked_count: usize,
    pub held_keys: usize,
    pub stale: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct VenueSnapshot {
    owner_id: String,
    saved_at: DateTime<Utc>,
    general: WeeklyHours,
    specific: BTreeMap<NaiveDate, BTreeSet<u8>>,
    blocked: Vec<BlockedSlot>,
}

struct IncomingState {
    general: WeeklyHours,
    specific: Vec<(NaiveDate, Option<BTreeSet<u8>>)>,
    blocked: Vec<BlockedSlot>,
}

#[derive(Debug, Default)]
struct KeyTracker {
    latest_issued: u64,
    state: KeyState,
}

enum Rollback {
    Slot(Option<BlockedSlot>),
    General {
        weekday: u8,
        hours: Option<BTreeSet<u8>>,
        configured: bool,
    },
    Specific {
        date: NaiveDate,
        hours: Option<BTreeSet<u8>>,
        configured: bool,
    },
}

enum Confirmation {
    Blocked(BlockedSlot),
    Applied,
}

struct PendingTicket {
    key: SyncKey,
    sequence: u64,
    rollback: Rollback,
}

struct LocalState {
    resolver: AvailabilityResolver,
    blocked: BlockedSlotStore,
    keys: HashMap<SyncKey, KeyTracker>,
    issued: u64,
    stale: bool,
    /// Set once remote or snapshot state has been installed.
    hydrated: bool,
    loaded_week: Option<NaiveDate>,
}

impl LocalState {
    fn key_state(&self, key: &SyncKey) -> KeyState {
        self.keys
            .get(key)
            .map(|tracker| tracker.state)
            .unwrap_or_default()
    }

    fn ensure_latest(&self, ticket: &PendingTicket) -> Result<(), InfraError> {
        let latest = self
            .keys
            .get(&ticket.key)
            .map(|tracker| tracker.latest_issued)
            .unwrap_or_default();
        if ticket.sequence < latest {
            return Err(InfraError::StaleWrite {
                key: ticket.key.to_string(),
                sequence: ticket.sequence,
                latest,
            });
        }
        Ok(())
    }

    fn mark(&mut self, key: SyncKey, state: KeyState) {
        self.keys.entry(key).or_default().state = state;
    }

    /// Keys whose local value must survive a load: still pending, or touched
    /// after the load started fetching.
    fn held_keys(&self, fetch_mark: u64) -> HashSet<SyncKey> {
        self.keys
            .iter()
            .filter(|(_, tracker)| {
                matches!(tracker.state, KeyState::Pending(_)) || tracker.latest_issued > fetch_mark
            })
            .map(|(key, _)| *key)
            .collect()
    }

    fn confirm(&mut self, confirmation: Confirmation) -> Result<(), InfraError> {
        if let Confirmation::Blocked(slot) = confirmation {
            self.blocked.upsert(slot)?;
        }
        Ok(())
    }

    fn roll_back(&mut self, key: SyncKey, rollback: Rollback) -> Result<(), InfraError> {
        match rollback {
            Rollback::Slot(previous) => {
                if let SyncKey::Slot { key } = key {
                    // Drop whatever the optimistic write left.
                    let _ = self.blocked.remove(key.date, key.hour);
                }
                if let Some(previous) = previous {
                    self.blocked.upsert(previous)?;
                }
            }
            Rollback::General {
                weekday,
                hours,
                configured,
            } => self.resolver.restore_general(weekday, hours, configured),
            Rollback::Specific {
                date,
                hours,
                configured,
            } => self.resolver.restore_specific(date, hours, configured),
        }
        Ok(())
    }

    fn merge_incoming(&mut self, incoming: IncomingState, held: &HashSet<SyncKey>) {
        let mut blocked: Vec<BlockedSlot> = incoming
            .blocked
            .into_iter()
            .filter(|slot| !held.contains(&SyncKey::Slot { key: slot.key() }))
            .collect();
        let mut general = incoming.general;
        let configured = self.resolver.is_configured();
        let mut held_specific = Vec::new();

        for key in held {
            match key {
                SyncKey::Slot { key } => {
                    if let Some(local) = self.blocked.get(key) {
                        blocked.push(local.clone());
                    }
                }
                SyncKey::General { weekday } => match self.resolver.general(*weekday) {
                    Some(hours) => {
                        general.insert(*weekday, hours.clone());
                    }
                    None => {
                        general.remove(weekday);
                    }
                },
                SyncKey::Specific { date } => {
                    held_specific.push((*date, self.resolver.specific(*date).cloned()));
                }
            }
        }

        self.blocked.replace_all(blocked);
        self.resolver.replace_general(general);
        for (date, hours) in incoming.specific {
            if !held.contains(&SyncKey::Specific { date }) {
                self.resolver.replace_specific(date, hours);
            }
        }
        for (date, hours) in held_specific {
            self.resolver.restore_specific(date, hours, configured);
        }
    }

    fn snapshot(&self, owner_id: &str, saved_at: DateTime<Utc>) -> VenueSnapshot {
        VenueSnapshot {
            owner_id: owner_id.to_string(),
            saved_at,
            general: self.resolver.general_hours().clone(),
            specific: self.resolver.specific_overrides().clone(),
            blocked: self
                .blocked
                .all()
                .into_iter()
                .filter(BlockedSlot::is_confirmed)
                .collect(),
        }
    }
}

/// Owns the in-memory resolver and blocked-slot store for one venue owner and
/// keeps them in step with the remote service.
///
/// Every mutation goes through one optimistic primitive: the local change is
/// applied immediately under a fresh per-key sequence number, then the remote
/// result either confirms it or rolls it back. Results for anything but the
/// latest sequence of a key are discarded.
pub struct SyncCoordinator<R, S, T>
where
    R: AvailabilityRemote + ?Sized,
    S: SnapshotCache + ?Sized,
    T: SyncStateRepository + ?Sized,
{
    owner_id: String,
    remote: Arc<R>,
    snapshots: Arc<S>,
    sync_state_repository: Arc<T>,
    calendar: WeekCalendarBuilder,
    remote_timeout: Duration,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
    alive: AtomicBool,
    state: Mutex<LocalState>,
}

impl<R, S, T> SyncCoordinator<R, S, T>
where
    R: AvailabilityRemote + ?Sized,
    S: SnapshotCache + ?Sized,
    T: SyncStateRepository + ?Sized,
{
    pub fn new(
        owner_id: impl Into<String>,
        operating_hours: OperatingHours,
        remote: Arc<R>,
        snapshots: Arc<S>,
        sync_state_repository: Arc<T>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            remote,
            snapshots,
            sync_state_repository,
            calendar: WeekCalendarBuilder::default(),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
            alive: AtomicBool::new(true),
            state: Mutex::new(LocalState {
                resolver: AvailabilityResolver::new(operating_hours),
                blocked: BlockedSlotStore::new(),
                keys: HashMap::new(),
                issued: 0,
                stale: false,
                hydrated: false,
                loaded_week: None,
            }),
        }
    }

    pub fn from_config(
        config: &VenueConfig,
        remote: Arc<R>,
        snapshots: Arc<S>,
        sync_state_repository: Arc<T>,
    ) -> Self {
        Self::new(
            config.owner_id.clone(),
            config.operating_hours,
            remote,
            snapshots,
            sync_state_repository,
        )
        .with_time_zone(config.time_zone)
        .with_remote_timeout(config.remote.timeout)
    }

    pub fn with_time_zone(mut self, time_zone: Tz) -> Self {
        self.calendar = WeekCalendarBuilder::new(time_zone);
        self
    }

    pub fn with_remote_timeout(mut self, remote_timeout: Duration) -> Self {
        self.remote_timeout = remote_timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stops applying remote results. In-flight calls still finish but report
    /// `Detached` and leave local state untouched.
    pub fn shutdown(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            info!(owner_id = %self.owner_id, "sync coordinator shut down");
        }
    }

    // ---- queries -------------------------------------------------------

    pub fn today(&self) -> NaiveDate {
        self.calendar.today((self.now_provider)())
    }

    pub fn week_days(&self, anchor: NaiveDate) -> [WeekDay; 7] {
        self.calendar.build_week(anchor, self.today())
    }

    pub fn current_week(&self) -> [WeekDay; 7] {
        self.calendar.current_week((self.now_provider)())
    }

    pub fn time_slots(&self) -> Result<Vec<TimeSlot>, InfraError> {
        let state = self.lock_state()?;
        Ok(WeekCalendarBuilder::time_slots(&state.resolver.operating_hours()))
    }

    pub fn resolve_availability(&self, weekday: u8, date: NaiveDate) -> Result<BTreeSet<u8>, InfraError> {
        validate_weekday(weekday)?;
        let state = self.lock_state()?;
        Ok(state.resolver.resolve_availability(weekday, date))
    }

    pub fn is_blocked(&self, date: NaiveDate, hour: u8) -> Result<bool, InfraError> {
        let state = self.lock_state()?;
        Ok(state.blocked.is_blocked(date, hour))
    }

    pub fn blocked_slot(&self, key: SlotKey) -> Result<Option<BlockedSlot>, InfraError> {
        let state = self.lock_state()?;
        Ok(state.blocked.get(&key).cloned())
    }

    pub fn blocked_slot_by_id(&self, id: &str) -> Result<Option<BlockedSlot>, InfraError> {
        let state = self.lock_state()?;
        Ok(state.blocked.get_by_id(id).cloned())
    }

    pub fn blocked_slots_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<BlockedSlot>, InfraError> {
        let state = self.lock_state()?;
        Ok(state.blocked.slots_between(start, end))
    }

    pub fn resolver(&self) -> Result<AvailabilityResolver, InfraError> {
        let state = self.lock_state()?;
        Ok(state.resolver.clone())
    }

    pub fn key_state(&self, key: &SyncKey) -> Result<KeyState, InfraError> {
        let state = self.lock_state()?;
        Ok(state.key_state(key))
    }

    pub fn is_stale(&self) -> Result<bool, InfraError> {
        let state = self.lock_state()?;
        Ok(state.stale)
    }

    pub fn loaded_week(&self) -> Result<Option<NaiveDate>, InfraError> {
        let state = self.lock_state()?;
        Ok(state.loaded_week)
    }

    /// When this owner's state was last pulled from the remote, if ever.
    pub fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, InfraError> {
        Ok(self
            .sync_state_repository
            .load()?
            .filter(|sync_state| sync_state.owner_id == self.owner_id)
            .map(|sync_state| sync_state.last_sync_time))
    }

    pub fn derive_slot_state<E>(&self, events: &E, date: NaiveDate, hour: u8) -> Result<SlotState, InfraError>
    where
        E: EventIndex + ?Sized,
    {
        let event = events.event_at(date, hour)?;
        let state = self.lock_state()?;
        Ok(slot_state::derive_slot_state(
            &state.resolver,
            &state.blocked,
            event,
            weekday_index(date),
            date,
            hour,
        ))
    }

    pub fn select_slot<E>(
        &self,
        events: &E,
        mode: InteractionMode,
        date: NaiveDate,
        hour: u8,
    ) -> Result<SlotAction, InfraError>
    where
        E: EventIndex + ?Sized,
    {
        let derived = self.derive_slot_state(events, date, hour)?;
        let state = self.lock_state()?;
        Ok(slot_state::select_slot(
            derived,
            &state.resolver,
            mode,
            weekday_index(date),
            date,
            hour,
        ))
    }

    // ---- load / re-sync -------------------------------------------------

    /// Pulls the remote state for the week containing `anchor`. On failure the
    /// last snapshot is installed and the state is marked stale.
    pub async fn load_week(&self, anchor: NaiveDate) -> Result<LoadReport, InfraError> {
        let week_start = WeekCalendarBuilder::week_start(anchor);
        let fetch_mark = self.begin_load(week_start)?;
        if !self.is_alive() {
            return Ok(Self::detached_report(week_start));
        }

        match self.fetch_remote(week_start).await {
            Ok(incoming) => self.apply_remote(week_start, fetch_mark, incoming),
            Err(error) => self.fall_back_to_snapshot(week_start, fetch_mark, error),
        }
    }

    /// Repeats the last load. Before any load this is the current week.
    pub async fn resync(&self) -> Result<LoadReport, InfraError> {
        let anchor = self.loaded_week()?.unwrap_or_else(|| self.today());
        self.load_week(anchor).await
    }

    fn begin_load(&self, week_start: NaiveDate) -> Result<u64, InfraError> {
        let mut state = self.lock_state()?;
        state.loaded_week = Some(week_start);
        Ok(state.issued)
    }

    fn detached_report(week_start: NaiveDate) -> LoadReport {
        LoadReport {
            source: LoadSource::Detached,
            week_start,
            blocked_count: 0,
            held_keys: 0,
            stale: false,
            last_synced_at: None,
        }
    }

    async fn fetch_remote(&self, week_start: NaiveDate) -> Result<IncomingState, InfraError> {
        let owner_id = self.owner_id.as_str();
        let general = self
            .with_retry("fetching general availability", || {
                self.remote.fetch_general_availability(owner_id)
            })
            .await?;

        let mut specific = Vec::with_capacity(7);
        for offset in 0..7 {
            let Some(date) = week_start.checked_add_days(Days::new(offset)) else {
                continue;
            };
            let hours = self
                .with_retry("fetching date availability", || {
                    self.remote.fetch_date_availability(owner_id, date)
                })
                .await?;
            specific.push((date, hours));
        }

        let blocked = self
            .with_retry("fetching blocked slots", || {
                self.remote.fetch_blocked_slots(owner_id, None)
            })
            .await?;

        Ok(IncomingState {
            general,
            specific,
            blocked,
        })
    }

    fn apply_remote(
        &self,
        week_start: NaiveDate,
        fetch_mark: u64,
        incoming: IncomingState,
    ) -> Result<LoadReport, InfraError> {
        let now = (self.now_provider)();
        let (report, snapshot) = {
            let mut state = self.lock_state()?;
            if !self.is_alive() {
                return Ok(Self::detached_report(week_start));
            }
            let held = state.held_keys(fetch_mark);
            state.merge_incoming(incoming, &held);
            state.stale = false;
            state.hydrated = true;
            let report = LoadReport {
                source: LoadSource::Remote,
                week_start,
                blocked_count: state.blocked.len(),
                held_keys: held.len(),
                stale: false,
                last_synced_at: Some(now),
            };
            (report, state.snapshot(&self.owner_id, now))
        };

        info!(
            owner_id = %self.owner_id,
            week_start = %week_start,
            blocked = report.blocked_count,
            held = report.held_keys,
            "loaded venue state from remote"
        );

        self.persist_snapshot(&snapshot);
        if let Err(error) = self.sync_state_repository.save(&self.owner_id, now) {
            warn!(owner_id = %self.owner_id, %error, "failed to record sync time");
        }
        Ok(report)
    }

    /// Keeps what this session already loaded, or installs the last snapshot
    /// on a cold start. Either way the state is marked stale.
    fn fall_back_to_snapshot(
        &self,
        week_start: NaiveDate,
        fetch_mark: u64,
        error: InfraError,
    ) -> Result<LoadReport, InfraError> {
        let last_synced_at = match self.last_synced_at() {
            Ok(last_synced_at) => last_synced_at,
            Err(read_error) => {
                warn!(owner_id = %self.owner_id, error = %read_error, "unreadable sync state");
                None
            }
        };

        {
            let mut state = self.lock_state()?;
            if !self.is_alive() {
                return Ok(Self::detached_report(week_start));
            }
            state.stale = true;
            if state.hydrated {
                warn!(owner_id = %self.owner_id, %error, "remote load failed; keeping loaded state");
                return Ok(Self::kept_report(&state, week_start, last_synced_at));
            }
        }

        warn!(owner_id = %self.owner_id, %error, "remote load failed; using local snapshot");
        let snapshot = match self.read_snapshot() {
            Ok(snapshot) => snapshot,
            Err(read_error) => {
                warn!(owner_id = %self.owner_id, error = %read_error, "unreadable venue snapshot");
                None
            }
        };
        let Some(snapshot) = snapshot else {
            return Err(error);
        };

        let mut state = self.lock_state()?;
        if !self.is_alive() {
            return Ok(Self::detached_report(week_start));
        }
        if state.hydrated {
            return Ok(Self::kept_report(&state, week_start, last_synced_at));
        }

        let held = state.held_keys(fetch_mark);
        state.merge_incoming(
            IncomingState {
                general: snapshot.general,
                specific: snapshot
                    .specific
                    .into_iter()
                    .map(|(date, hours)| (date, Some(hours)))
                    .collect(),
                blocked: snapshot.blocked,
            },
            &held,
        );
        state.hydrated = true;

        Ok(LoadReport {
            source: LoadSource::Snapshot,
            week_start,
            blocked_count: state.blocked.len(),
            held_keys: held.len(),
            stale: true,
            last_synced_at,
        })
    }

    fn kept_report(
        state: &LocalState,
        week_start: NaiveDate,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> LoadReport {
        LoadReport {
            source: LoadSource::Memory,
            week_start,
            blocked_count: state.blocked.len(),
            held_keys: 0,
            stale: true,
            last_synced_at,
        }
    }

    fn snapshot_namespace(&self) -> String {
        format!("venue:{}", self.owner_id)
    }

    fn write_snapshot(&self, snapshot: &VenueSnapshot) -> Result<(), InfraError> {
        let payload = serde_json::to_string(snapshot)?;
        self.snapshots
            .set(&self.snapshot_namespace(), SNAPSHOT_KEY, &payload)
    }

    fn persist_snapshot(&self, snapshot: &VenueSnapshot) {
        if let Err(error) = self.write_snapshot(snapshot) {
            warn!(owner_id = %self.owner_id, %error, "failed to write venue snapshot");
        }
    }

    fn read_snapshot(&self) -> Result<Option<VenueSnapshot>, InfraError> {
        let Some(payload) = self.snapshots.get(&self.snapshot_namespace(), SNAPSHOT_KEY)? else {
            return Ok(None);
        };
        let snapshot: VenueSnapshot = serde_json::from_str(&payload)?;
        if snapshot.owner_id != self.owner_id {
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    // ---- mutations ------------------------------------------------------

    pub async fn block(
        &self,
        date: NaiveDate,
        hour: u8,
        recurring: bool,
    ) -> Result<MutationOutcome, InfraError> {
        let key = SlotKey::new(date, hour);
        let Some(ticket) = self.begin(SyncKey::Slot { key }, PendingOp::Block, |state, sequence| {
            state.resolver.operating_hours().check_hour(hour)?;
            if state.blocked.is_blocked(date, hour) {
                return Err(InfraError::conflict(key));
            }
            let pending = BlockedSlot::new(
                format!("local-{sequence}"),
                date,
                hour,
                recurring,
                SlotOrigin::LocalPending,
            );
            state.blocked.add(pending)?;
            Ok(Rollback::Slot(None))
        })?
        else {
            return Ok(MutationOutcome::Detached);
        };

        let result = self
            .bounded(
                "blocking slot",
                self.remote.block_slot(&self.owner_id, date, hour, recurring),
            )
            .await;
        let created_id = result.as_ref().ok().map(|slot| slot.id.clone());
        let outcome = self.settle(ticket, result.map(Confirmation::Blocked))?;

        if outcome == MutationOutcome::Superseded {
            if let Some(created_id) = created_id {
                self.retract_superseded_block(key, &created_id).await;
            }
        }
        Ok(outcome)
    }

    pub async fn unblock(&self, date: NaiveDate, hour: u8) -> Result<MutationOutcome, InfraError> {
        let key = SlotKey::new(date, hour);
        let Some(ticket) = self.begin(SyncKey::Slot { key }, PendingOp::Unblock, |state, _| {
            let removed = state.blocked.remove(date, hour)?;
            Ok(Rollback::Slot(Some(removed)))
        })?
        else {
            return Ok(MutationOutcome::Detached);
        };

        let unconfirmed = Self::removes_unconfirmed_block(&ticket);
        let result = self
            .bounded(
                "unblocking slot",
                self.remote.unblock_slot(&self.owner_id, date, hour),
            )
            .await;
        let result = Self::forgive_unborn_block(result, unconfirmed);
        self.settle(ticket, result.map(|()| Confirmation::Applied))
    }

    pub async fn unblock_by_id(&self, id: &str) -> Result<MutationOutcome, InfraError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(InfraError::invalid_input("blocked slot id must not be empty"));
        }
        let key = self
            .blocked_slot_by_id(id)?
            .map(|slot| slot.key())
            .ok_or_else(|| InfraError::not_found(format!("id {id}")))?;

        let Some(ticket) = self.begin(SyncKey::Slot { key }, PendingOp::Unblock, |state, _| {
            let removed = state.blocked.remove_by_id(id)?;
            Ok(Rollback::Slot(Some(removed)))
        })?
        else {
            return Ok(MutationOutcome::Detached);
        };

        // A block that never reached the server has no server id to address.
        let unconfirmed = Self::removes_unconfirmed_block(&ticket);
        let result = if unconfirmed {
            let result = self
                .bounded(
                    "unblocking slot",
                    self.remote.unblock_slot(&self.owner_id, key.date, key.hour),
                )
                .await;
            Self::forgive_unborn_block(result, true)
        } else {
            self.bounded("unblocking slot by id", self.remote.unblock_by_id(id))
                .await
        };
        self.settle(ticket, result.map(|()| Confirmation::Applied))
    }

    pub async fn save_general(
        &self,
        weekday: u8,
        hours: BTreeSet<u8>,
    ) -> Result<MutationOutcome, InfraError> {
        self.save_availability(&AvailabilityConfig::General { weekday, hours })
            .await
    }

    pub async fn save_specific(
        &self,
        date: NaiveDate,
        weekday: u8,
        hours: BTreeSet<u8>,
    ) -> Result<MutationOutcome, InfraError> {
        self.save_availability(&AvailabilityConfig::Specific {
            date,
            weekday,
            hours,
        })
        .await
    }

    pub async fn save_availability(
        &self,
        config: &AvailabilityConfig,
    ) -> Result<MutationOutcome, InfraError> {
        let sync_key = SyncKey::for_config(config);
        let Some(ticket) = self.begin(sync_key, PendingOp::SaveAvailability, |state, _| {
            let configured = state.resolver.is_configured();
            let rollback = match config {
                AvailabilityConfig::General { weekday, .. } => Rollback::General {
                    weekday: *weekday,
                    hours: state.resolver.general(*weekday).cloned(),
                    configured,
                },
                AvailabilityConfig::Specific { date, .. } => Rollback::Specific {
                    date: *date,
                    hours: state.resolver.specific(*date).cloned(),
                    configured,
                },
            };
            state.resolver.apply(config)?;
            Ok(rollback)
        })?
        else {
            return Ok(MutationOutcome::Detached);
        };

        let result = self
            .bounded(
                "saving availability",
                self.remote.save_availability(&self.owner_id, config),
            )
            .await;
        self.settle(ticket, result.map(|()| Confirmation::Applied))
    }

    fn removes_unconfirmed_block(ticket: &PendingTicket) -> bool {
        matches!(
            &ticket.rollback,
            Rollback::Slot(Some(slot)) if !slot.is_confirmed()
        )
    }

    /// The server may not have created a still-pending block yet. Its own
    /// confirmation then arrives superseded and is retracted there.
    fn forgive_unborn_block(result: Result<(), InfraError>, unconfirmed: bool) -> Result<(), InfraError> {
        match result {
            Err(error) if unconfirmed && error.is_not_found() => {
                debug!(%error, "unblocked a block the server has not created yet");
                Ok(())
            }
            other => other,
        }
    }

    /// Applies an optimistic change under a fresh sequence number. `Ok(None)`
    /// means the coordinator is shut down and nothing was applied. Errors from
    /// `apply` leave state and key bookkeeping untouched.
    fn begin<F>(&self, key: SyncKey, op: PendingOp, apply: F) -> Result<Option<PendingTicket>, InfraError>
    where
        F: FnOnce(&mut LocalState, u64) -> Result<Rollback, InfraError>,
    {
        let mut state = self.lock_state()?;
        if !self.is_alive() {
            return Ok(None);
        }

        let sequence = state.issued + 1;
        let rollback = apply(&mut *state, sequence)?;
        state.issued = sequence;
        let tracker = state.keys.entry(key).or_default();
        tracker.latest_issued = sequence;
        tracker.state = KeyState::Pending(op);

        debug!(key = %key, sequence, ?op, "optimistic change applied");
        Ok(Some(PendingTicket {
            key,
            sequence,
            rollback,
        }))
    }

    /// Confirms or rolls back a ticket, unless a newer action on the same key
    /// was issued in the meantime.
    fn settle(
        &self,
        ticket: PendingTicket,
        result: Result<Confirmation, InfraError>,
    ) -> Result<MutationOutcome, InfraError> {
        let now = (self.now_provider)();
        let mut state = self.lock_state()?;
        if !self.is_alive() {
            debug!(key = %ticket.key, sequence = ticket.sequence, "result arrived after shutdown");
            return Ok(MutationOutcome::Detached);
        }
        if let Err(stale) = state.ensure_latest(&ticket) {
            debug!(error = %stale, "discarding superseded settlement");
            return Ok(MutationOutcome::Superseded);
        }

        match result {
            Ok(confirmation) => {
                state.confirm(confirmation)?;
                state.mark(ticket.key, KeyState::Confirmed);
                let snapshot = state
                    .hydrated
                    .then(|| state.snapshot(&self.owner_id, now));
                drop(state);

                debug!(key = %ticket.key, sequence = ticket.sequence, "remote confirmed change");
                if let Some(snapshot) = snapshot {
                    self.persist_snapshot(&snapshot);
                }
                Ok(MutationOutcome::Confirmed)
            }
            Err(error) => {
                state.roll_back(ticket.key, ticket.rollback)?;
                state.mark(ticket.key, KeyState::RolledBack);
                warn!(
                    key = %ticket.key,
                    sequence = ticket.sequence,
                    kind = error.kind(),
                    %error,
                    "remote rejected change; rolled back"
                );
                Err(error)
            }
        }
    }

    /// The server accepted a block the user has since undone locally. Remove
    /// it remotely so the next load does not bring it back.
    async fn retract_superseded_block(&self, key: SlotKey, remote_id: &str) {
        if self.block_still_wanted(key) {
            return;
        }
        match self
            .bounded("retracting superseded block", self.remote.unblock_by_id(remote_id))
            .await
        {
            Ok(()) => info!(key = %key, remote_id, "retracted superseded block"),
            Err(error) if error.is_not_found() => {
                debug!(key = %key, remote_id, "superseded block already gone");
            }
            Err(error) => {
                warn!(key = %key, remote_id, %error, "failed to retract superseded block");
            }
        }
    }

    fn block_still_wanted(&self, key: SlotKey) -> bool {
        match self.lock_state() {
            Ok(state) => {
                state.blocked.is_blocked(key.date, key.hour)
                    || matches!(
                        state.key_state(&SyncKey::Slot { key }),
                        KeyState::Pending(_)
                    )
            }
            Err(_) => true,
        }
    }

    // ---- plumbing -------------------------------------------------------

    fn lock_state(&self) -> Result<MutexGuard<'_, LocalState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| poisoned("venue state", error))
    }

    async fn bounded<F, V>(&self, action: &str, future: F) -> Result<V, InfraError>
    where
        F: Future<Output = Result<V, InfraError>>,
    {
        match timeout(self.remote_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(InfraError::NetworkUnavailable(format!(
                "{action} timed out after {}ms",
                self.remote_timeout.as_millis()
            ))),
        }
    }

    async fn with_retry<F, Fut, V>(&self, action: &str, mut call: F) -> Result<V, InfraError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V, InfraError>>,
    {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self.bounded(action, call()).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    debug!(action, attempt, delay_ms = delay, %error, "retrying remote call");
                    sleep(Duration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl<R, S, T> SyncCoordinator<R, S, T>
where
    R: AvailabilityRemote + ?Sized + 'static,
    S: SnapshotCache + ?Sized + 'static,
    T: SyncStateRepository + ?Sized + 'static,
{
    /// Re-runs the last load on a fixed interval until the coordinator is shut
    /// down or dropped. Failures are logged; the next tick tries again.
    pub fn spawn_periodic_resync(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if !coordinator.is_alive() {
                    break;
                }
                match coordinator.resync().await {
                    Ok(report) => debug!(
                        source = ?report.source,
                        stale = report.stale,
                        "periodic re-sync finished"
                    ),
                    Err(error) => warn!(%error, "periodic re-sync failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::event_index::InMemoryEventIndex;
    use crate::infrastructure::snapshot_cache::InMemorySnapshotCache;
    use crate::infrastructure::sync_state_repository::InMemorySyncStateRepository;
    use crate::domain::models::Event;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FakeFailure {
        Network,
        Server,
    }

    impl FakeFailure {
        fn error(self) -> InfraError {
            match self {
                Self::Network => InfraError::NetworkUnavailable("fake offline".to_string()),
                Self::Server => InfraError::Remote {
                    status: 500,
                    message: "fake failure".to_string(),
                },
            }
        }
    }

    /// Applies mutations to its own state as soon as they are called; gates only
    /// delay the response, like a server that answers slowly.
    #[derive(Default)]
    struct FakeRemote {
        general: Mutex<WeeklyHours>,
        overrides: Mutex<HashMap<NaiveDate, BTreeSet<u8>>>,
        blocked: Mutex<Vec<BlockedSlot>>,
        failure: Mutex<Option<FakeFailure>>,
        block_gate: Mutex<Option<oneshot::Receiver<()>>>,
        create_gate: Mutex<Option<oneshot::Receiver<()>>>,
        unblock_gate: Mutex<Option<oneshot::Receiver<()>>>,
        next_id: AtomicUsize,
        mutation_calls: AtomicUsize,
        retracted: Mutex<Vec<String>>,
    }

    impl FakeRemote {
        fn fail_with(&self, failure: Option<FakeFailure>) {
            *self.failure.lock().expect("failure lock") = failure;
        }

        fn check_failure(&self) -> Result<(), InfraError> {
            match *self.failure.lock().expect("failure lock") {
                Some(failure) => Err(failure.error()),
                None => Ok(()),
            }
        }

        fn gate_block(&self, gate: oneshot::Receiver<()>) {
            *self.block_gate.lock().expect("gate lock") = Some(gate);
        }

        /// Holds the block request before the server records anything.
        fn gate_creation(&self, gate: oneshot::Receiver<()>) {
            *self.create_gate.lock().expect("gate lock") = Some(gate);
        }

        fn gate_unblock(&self, gate: oneshot::Receiver<()>) {
            *self.unblock_gate.lock().expect("gate lock") = Some(gate);
        }

        fn seed_blocked(&self, slot: BlockedSlot) {
            self.blocked.lock().expect("blocked lock").push(slot);
        }

        fn remote_blocked(&self, date: NaiveDate, hour: u8) -> bool {
            self.blocked
                .lock()
                .expect("blocked lock")
                .iter()
                .any(|slot| slot.date == date && slot.hour == hour)
        }

        fn mutation_calls(&self) -> usize {
            self.mutation_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AvailabilityRemote for FakeRemote {
        async fn fetch_general_availability(&self, _owner_id: &str) -> Result<WeeklyHours, InfraError> {
            self.check_failure()?;
            Ok(self.general.lock().expect("general lock").clone())
        }

        async fn fetch_date_availability(
            &self,
            _owner_id: &str,
            date: NaiveDate,
        ) -> Result<Option<BTreeSet<u8>>, InfraError> {
            self.check_failure()?;
            Ok(self.overrides.lock().expect("overrides lock").get(&date).cloned())
        }

        async fn save_availability(
            &self,
            _owner_id: &str,
            config: &AvailabilityConfig,
        ) -> Result<(), InfraError> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            self.check_failure()?;
            match config {
                AvailabilityConfig::General { weekday, hours } => {
                    self.general
                        .lock()
                        .expect("general lock")
                        .insert(*weekday, hours.clone());
                }
                AvailabilityConfig::Specific { date, hours, .. } => {
                    self.overrides
                        .lock()
                        .expect("overrides lock")
                        .insert(*date, hours.clone());
                }
            }
            Ok(())
        }

        async fn fetch_blocked_slots(
            &self,
            _owner_id: &str,
            date: Option<NaiveDate>,
        ) -> Result<Vec<BlockedSlot>, InfraError> {
            self.check_failure()?;
            Ok(self
                .blocked
                .lock()
                .expect("blocked lock")
                .iter()
                .filter(|slot| date.is_none_or(|date| slot.date == date))
                .cloned()
                .collect())
        }

        async fn block_slot(
            &self,
            _owner_id: &str,
            date: NaiveDate,
            hour: u8,
            recurring: bool,
        ) -> Result<BlockedSlot, InfraError> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            self.check_failure()?;
            let create_gate = self.create_gate.lock().expect("gate lock").take();
            if let Some(gate) = create_gate {
                let _ = gate.await;
            }
            let created = {
                let mut blocked = self.blocked.lock().expect("blocked lock");
                if blocked.iter().any(|slot| slot.date == date && slot.hour == hour) {
                    return Err(InfraError::conflict(SlotKey::new(date, hour)));
                }
                let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                let created = BlockedSlot::new(id, date, hour, recurring, SlotOrigin::ServerConfirmed);
                blocked.push(created.clone());
                created
            };
            let gate = self.block_gate.lock().expect("gate lock").take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(created)
        }

        async fn unblock_slot(&self, _owner_id: &str, date: NaiveDate, hour: u8) -> Result<(), InfraError> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            self.check_failure()?;
            let removed = {
                let mut blocked = self.blocked.lock().expect("blocked lock");
                let before = blocked.len();
                blocked.retain(|slot| !(slot.date == date && slot.hour == hour));
                before != blocked.len()
            };
            let gate = self.unblock_gate.lock().expect("gate lock").take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if removed {
                Ok(())
            } else {
                Err(InfraError::not_found(SlotKey::new(date, hour).to_string()))
            }
        }

        async fn unblock_by_id(&self, id: &str) -> Result<(), InfraError> {
            self.mutation_calls.fetch_add(1, Ordering::SeqCst);
            self.check_failure()?;
            self.retracted.lock().expect("retracted lock").push(id.to_string());
            let mut blocked = self.blocked.lock().expect("blocked lock");
            let before = blocked.len();
            blocked.retain(|slot| slot.id != id);
            if before == blocked.len() {
                return Err(InfraError::not_found(format!("id {id}")));
            }
            Ok(())
        }
    }

    type TestCoordinator =
        SyncCoordinator<FakeRemote, InMemorySnapshotCache, InMemorySyncStateRepository>;

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-05-06T12:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn hours(values: &[u8]) -> BTreeSet<u8> {
        values.iter().copied().collect()
    }

    fn coordinator_with(
        remote: Arc<FakeRemote>,
        snapshots: Arc<InMemorySnapshotCache>,
    ) -> TestCoordinator {
        SyncCoordinator::new(
            "venue-1",
            OperatingHours::default(),
            remote,
            snapshots,
            Arc::new(InMemorySyncStateRepository::default()),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 0,
        })
        .with_now_provider(Arc::new(fixed_time))
    }

    fn coordinator(remote: Arc<FakeRemote>) -> TestCoordinator {
        coordinator_with(remote, Arc::new(InMemorySnapshotCache::default()))
    }

    async fn wait_for_key_state(coordinator: &TestCoordinator, key: SyncKey, expected: KeyState) {
        for _ in 0..1_000 {
            if coordinator.key_state(&key).expect("key state") == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("key {key} never reached {expected:?}");
    }

    #[tokio::test]
    async fn block_confirms_and_stays_on_its_exact_date() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = coordinator(remote.clone());

        let first = coordinator.block(date("2025-05-06"), 14, false).await.expect("block first");
        let second = coordinator.block(date("2025-05-13"), 14, false).await.expect("block second");
        assert_eq!(first, MutationOutcome::Confirmed);
        assert_eq!(second, MutationOutcome::Confirmed);

        let confirmed = coordinator
            .blocked_slot(SlotKey::new(date("2025-05-06"), 14))
            .expect("query")
            .expect("slot");
        assert_eq!(confirmed.origin, SlotOrigin::ServerConfirmed);
        assert!(confirmed.id.starts_with("srv-"));
        assert!(!coordinator.is_blocked(date("2025-05-20"), 14).expect("query"));

        coordinator.unblock(date("2025-05-06"), 14).await.expect("unblock");
        assert!(!coordinator.is_blocked(date("2025-05-06"), 14).expect("query"));
        assert!(coordinator.is_blocked(date("2025-05-13"), 14).expect("query"));
        assert!(remote.remote_blocked(date("2025-05-13"), 14));
    }

    #[tokio::test]
    async fn failed_block_rolls_back_with_retryable_error() {
        let remote = Arc::new(FakeRemote::default());
        remote.fail_with(Some(FakeFailure::Network));
        let coordinator = coordinator(remote);
        let key = SyncKey::slot(date("2025-05-06"), 14);

        let error = coordinator
            .block(date("2025-05-06"), 14, false)
            .await
            .expect_err("offline");
        assert!(error.is_retryable());
        assert!(!coordinator.is_blocked(date("2025-05-06"), 14).expect("query"));
        assert_eq!(coordinator.key_state(&key).expect("state"), KeyState::RolledBack);
    }

    #[tokio::test]
    async fn failed_unblock_restores_the_confirmed_record() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = coordinator(remote.clone());
        coordinator.block(date("2025-05-06"), 9, true).await.expect("block");
        let before = coordinator
            .blocked_slot(SlotKey::new(date("2025-05-06"), 9))
            .expect("query")
            .expect("slot");

        remote.fail_with(Some(FakeFailure::Server));
        let error = coordinator.unblock(date("2025-05-06"), 9).await.expect_err("server error");
        assert!(matches!(error, InfraError::Remote { status: 500, .. }));

        let after = coordinator
            .blocked_slot(SlotKey::new(date("2025-05-06"), 9))
            .expect("query")
            .expect("slot restored");
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn local_conflict_is_reported_without_remote_call() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = coordinator(remote.clone());
        coordinator.block(date("2025-05-06"), 14, false).await.expect("block");
        let calls = remote.mutation_calls();

        let error = coordinator
            .block(date("2025-05-06"), 14, false)
            .await
            .expect_err("conflict");
        assert!(error.is_conflict());
        assert_eq!(remote.mutation_calls(), calls);
        assert_eq!(
            coordinator
                .key_state(&SyncKey::slot(date("2025-05-06"), 14))
                .expect("state"),
            KeyState::Confirmed
        );
    }

    #[tokio::test]
    async fn remote_conflict_rolls_back_the_optimistic_block() {
        let remote = Arc::new(FakeRemote::default());
        remote.seed_blocked(BlockedSlot::new(
            "srv-existing",
            date("2025-05-06"),
            14,
            false,
            SlotOrigin::ServerConfirmed,
        ));
        let coordinator = coordinator(remote);

        let error = coordinator
            .block(date("2025-05-06"), 14, false)
            .await
            .expect_err("remote conflict");
        assert!(error.is_conflict());
        assert!(!coordinator.is_blocked(date("2025-05-06"), 14).expect("query"));
    }

    #[tokio::test]
    async fn unblocking_an_open_slot_is_not_found_and_idempotent() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = coordinator(remote.clone());
        coordinator.block(date("2025-05-13"), 14, false).await.expect("block");

        for _ in 0..2 {
            let error = coordinator
                .unblock(date("2025-05-06"), 14)
                .await
                .expect_err("not found");
            assert!(error.is_not_found());
            assert!(coordinator.is_blocked(date("2025-05-13"), 14).expect("query"));
        }
        assert_eq!(remote.mutation_calls(), 1);
    }

    #[tokio::test]
    async fn unblock_by_id_uses_server_id() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = coordinator(remote.clone());
        coordinator.block(date("2025-05-06"), 14, false).await.expect("block");
        let id = coordinator
            .blocked_slot(SlotKey::new(date("2025-05-06"), 14))
            .expect("query")
            .expect("slot")
            .id;

        let outcome = coordinator.unblock_by_id(&id).await.expect("unblock by id");
        assert_eq!(outcome, MutationOutcome::Confirmed);
        assert!(!remote.remote_blocked(date("2025-05-06"), 14));
        assert!(
            coordinator
                .unblock_by_id(&id)
                .await
                .expect_err("gone")
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn late_block_confirmation_cannot_resurrect_unblocked_slot() {
        let remote = Arc::new(FakeRemote::default());
        let (release_block, block_gate) = oneshot::channel();
        let (release_unblock, unblock_gate) = oneshot::channel();
        remote.gate_block(block_gate);
        remote.gate_unblock(unblock_gate);
        let coordinator = Arc::new(coordinator(remote.clone()));
        let day = date("2025-05-06");
        let key = SyncKey::slot(day, 14);

        let block_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.block(day, 14, false).await }
        });
        wait_for_key_state(&coordinator, key, KeyState::Pending(PendingOp::Block)).await;

        let unblock_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.unblock(day, 14).await }
        });
        wait_for_key_state(&coordinator, key, KeyState::Pending(PendingOp::Unblock)).await;
        assert!(!coordinator.is_blocked(day, 14).expect("query"));

        release_unblock.send(()).expect("release unblock");
        let unblocked = unblock_task.await.expect("join unblock").expect("unblock");
        assert_eq!(unblocked, MutationOutcome::Confirmed);

        release_block.send(()).expect("release block");
        let blocked = block_task.await.expect("join block").expect("block");
        assert_eq!(blocked, MutationOutcome::Superseded);

        assert!(!coordinator.is_blocked(day, 14).expect("query"));
        assert_eq!(coordinator.key_state(&key).expect("state"), KeyState::Confirmed);
        assert!(!remote.remote_blocked(day, 14));
    }

    #[tokio::test]
    async fn unblock_before_server_creates_block_wins() {
        let remote = Arc::new(FakeRemote::default());
        let (release_create, create_gate) = oneshot::channel();
        remote.gate_creation(create_gate);
        let coordinator = Arc::new(coordinator(remote.clone()));
        let day = date("2025-05-06");
        let key = SyncKey::slot(day, 14);

        let block_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.block(day, 14, false).await }
        });
        wait_for_key_state(&coordinator, key, KeyState::Pending(PendingOp::Block)).await;

        let unblocked = coordinator.unblock(day, 14).await.expect("unblock");
        assert_eq!(unblocked, MutationOutcome::Confirmed);
        assert!(!coordinator.is_blocked(day, 14).expect("query"));

        release_create.send(()).expect("release creation");
        assert_eq!(
            block_task.await.expect("join").expect("block"),
            MutationOutcome::Superseded
        );

        assert!(!coordinator.is_blocked(day, 14).expect("query"));
        assert!(!remote.remote_blocked(day, 14));
        assert_eq!(coordinator.key_state(&key).expect("state"), KeyState::Confirmed);
        assert_eq!(remote.retracted.lock().expect("retracted lock").len(), 1);
    }

    #[tokio::test]
    async fn superseded_block_on_rebooked_key_is_not_retracted() {
        let remote = Arc::new(FakeRemote::default());
        let (release_block, block_gate) = oneshot::channel();
        remote.gate_block(block_gate);
        let coordinator = Arc::new(coordinator(remote.clone()));
        let day = date("2025-05-06");
        let key = SyncKey::slot(day, 14);

        let block_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.block(day, 14, false).await }
        });
        wait_for_key_state(&coordinator, key, KeyState::Pending(PendingOp::Block)).await;

        // Unblock locally and re-block before the first confirmation arrives.
        coordinator.unblock(day, 14).await.expect("unblock");
        coordinator.block(day, 14, false).await.expect("block again");

        release_block.send(()).expect("release block");
        assert_eq!(
            block_task.await.expect("join").expect("block"),
            MutationOutcome::Superseded
        );
        assert!(coordinator.is_blocked(day, 14).expect("query"));
        assert!(remote.retracted.lock().expect("retracted lock").is_empty());
    }

    #[tokio::test]
    async fn results_after_shutdown_are_detached() {
        let remote = Arc::new(FakeRemote::default());
        let (release_block, block_gate) = oneshot::channel();
        remote.gate_block(block_gate);
        let coordinator = Arc::new(coordinator(remote));
        let day = date("2025-05-06");

        let block_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.block(day, 14, false).await }
        });
        wait_for_key_state(
            &coordinator,
            SyncKey::slot(day, 14),
            KeyState::Pending(PendingOp::Block),
        )
        .await;

        coordinator.shutdown();
        release_block.send(()).expect("release block");
        assert_eq!(
            block_task.await.expect("join").expect("block"),
            MutationOutcome::Detached
        );
        let pending = coordinator
            .blocked_slot(SlotKey::new(day, 14))
            .expect("query")
            .expect("pending slot left as is");
        assert_eq!(pending.origin, SlotOrigin::LocalPending);

        assert_eq!(
            coordinator.block(day, 15, false).await.expect("after shutdown"),
            MutationOutcome::Detached
        );
        assert!(!coordinator.is_blocked(day, 15).expect("query"));
    }

    #[tokio::test]
    async fn slow_remote_times_out_as_network_unavailable() {
        let remote = Arc::new(FakeRemote::default());
        let (_release_block, block_gate) = oneshot::channel::<()>();
        remote.gate_block(block_gate);
        let coordinator = coordinator(remote).with_remote_timeout(Duration::from_millis(50));

        let error = coordinator
            .block(date("2025-05-06"), 14, false)
            .await
            .expect_err("timeout");
        assert!(matches!(error, InfraError::NetworkUnavailable(_)));
        assert!(!coordinator.is_blocked(date("2025-05-06"), 14).expect("query"));
    }

    #[tokio::test]
    async fn load_merges_remote_state_and_writes_snapshot() {
        let remote = Arc::new(FakeRemote::default());
        remote
            .general
            .lock()
            .expect("general lock")
            .insert(1, hours(&[10, 11]));
        remote
            .overrides
            .lock()
            .expect("overrides lock")
            .insert(date("2025-05-05"), BTreeSet::new());
        for id in ["srv-a", "srv-b"] {
            remote.seed_blocked(BlockedSlot::new(
                id,
                date("2025-05-06"),
                14,
                false,
                SlotOrigin::ServerConfirmed,
            ));
        }
        let snapshots = Arc::new(InMemorySnapshotCache::default());
        let coordinator = coordinator_with(remote, snapshots.clone());

        let report = coordinator.load_week(date("2025-05-07")).await.expect("load");
        assert_eq!(report.source, LoadSource::Remote);
        assert_eq!(report.week_start, date("2025-05-05"));
        assert_eq!(report.blocked_count, 1);
        assert!(!coordinator.is_stale().expect("stale flag"));

        assert!(coordinator.resolve_availability(1, date("2025-05-05")).expect("resolve").is_empty());
        assert_eq!(
            coordinator.resolve_availability(1, date("2025-05-12")).expect("resolve"),
            hours(&[10, 11])
        );
        assert!(coordinator.resolve_availability(2, date("2025-05-06")).expect("resolve").is_empty());
        assert!(snapshots.get("venue:venue-1", "state").expect("snapshot").is_some());
    }

    #[tokio::test]
    async fn load_with_unconfigured_owner_keeps_bootstrap_hours() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = coordinator(remote);
        coordinator.load_week(date("2025-05-06")).await.expect("load");
        assert_eq!(
            coordinator.resolve_availability(2, date("2025-05-06")).expect("resolve").len(),
            15
        );
    }

    #[tokio::test]
    async fn offline_load_falls_back_to_snapshot_and_marks_stale() {
        let remote = Arc::new(FakeRemote::default());
        remote.seed_blocked(BlockedSlot::new(
            "srv-a",
            date("2025-05-06"),
            14,
            false,
            SlotOrigin::ServerConfirmed,
        ));
        let snapshots = Arc::new(InMemorySnapshotCache::default());
        coordinator_with(remote.clone(), snapshots.clone())
            .load_week(date("2025-05-06"))
            .await
            .expect("online load");

        remote.fail_with(Some(FakeFailure::Network));
        let restarted = coordinator_with(remote, snapshots);
        let report = restarted.load_week(date("2025-05-06")).await.expect("offline load");
        assert_eq!(report.source, LoadSource::Snapshot);
        assert!(report.stale);
        assert_eq!(report.last_synced_at, None);
        assert!(restarted.is_stale().expect("stale flag"));
        assert!(restarted.is_blocked(date("2025-05-06"), 14).expect("query"));
    }

    #[tokio::test]
    async fn offline_resync_keeps_changes_confirmed_since_last_load() {
        let remote = Arc::new(FakeRemote::default());
        let snapshots = Arc::new(InMemorySnapshotCache::default());
        let coordinator = coordinator_with(remote.clone(), snapshots.clone());
        let day = date("2025-05-06");

        coordinator.load_week(day).await.expect("online load");
        assert_eq!(
            coordinator.block(day, 14, false).await.expect("block"),
            MutationOutcome::Confirmed
        );
        assert_eq!(
            coordinator.save_general(2, hours(&[10])).await.expect("save general"),
            MutationOutcome::Confirmed
        );

        remote.fail_with(Some(FakeFailure::Network));
        let report = coordinator.resync().await.expect("offline resync");
        assert_eq!(report.source, LoadSource::Memory);
        assert!(report.stale);
        assert_eq!(report.blocked_count, 1);
        assert_eq!(report.last_synced_at, Some(fixed_time()));
        assert!(coordinator.is_stale().expect("stale flag"));
        assert!(coordinator.is_blocked(day, 14).expect("query"));
        assert_eq!(coordinator.resolve_availability(2, day).expect("resolve"), hours(&[10]));

        // The snapshot was rewritten after each confirmation.
        let restarted = coordinator_with(remote, snapshots);
        let report = restarted.load_week(day).await.expect("cold offline load");
        assert_eq!(report.source, LoadSource::Snapshot);
        assert!(restarted.is_blocked(day, 14).expect("query"));
        assert_eq!(restarted.resolve_availability(2, day).expect("resolve"), hours(&[10]));
    }

    #[tokio::test]
    async fn confirmations_before_any_load_leave_snapshot_alone() {
        let remote = Arc::new(FakeRemote::default());
        let snapshots = Arc::new(InMemorySnapshotCache::default());
        let coordinator = coordinator_with(remote, snapshots.clone());

        coordinator.block(date("2025-05-06"), 14, false).await.expect("block");
        assert!(snapshots.get("venue:venue-1", "state").expect("snapshot").is_none());
        assert_eq!(coordinator.last_synced_at().expect("sync time"), None);
    }

    #[tokio::test]
    async fn offline_load_without_snapshot_surfaces_error() {
        let remote = Arc::new(FakeRemote::default());
        remote.fail_with(Some(FakeFailure::Network));
        let coordinator = coordinator(remote);

        let error = coordinator.load_week(date("2025-05-06")).await.expect_err("offline");
        assert!(matches!(error, InfraError::NetworkUnavailable(_)));
        assert!(coordinator.is_stale().expect("stale flag"));
        assert_eq!(
            coordinator.resolve_availability(2, date("2025-05-06")).expect("resolve").len(),
            15
        );
    }

    #[tokio::test]
    async fn load_keeps_pending_local_value() {
        let remote = Arc::new(FakeRemote::default());
        let (release_block, block_gate) = oneshot::channel();
        remote.gate_block(block_gate);
        let coordinator = Arc::new(coordinator(remote));
        let day = date("2025-05-06");

        let block_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.block(day, 14, false).await }
        });
        wait_for_key_state(
            &coordinator,
            SyncKey::slot(day, 14),
            KeyState::Pending(PendingOp::Block),
        )
        .await;

        let report = coordinator.load_week(day).await.expect("load");
        assert_eq!(report.held_keys, 1);
        let during = coordinator
            .blocked_slot(SlotKey::new(day, 14))
            .expect("query")
            .expect("slot");
        assert_eq!(during.origin, SlotOrigin::LocalPending);

        release_block.send(()).expect("release");
        block_task.await.expect("join").expect("block");
        let after = coordinator
            .blocked_slot(SlotKey::new(day, 14))
            .expect("query")
            .expect("slot");
        assert_eq!(after.origin, SlotOrigin::ServerConfirmed);
    }

    #[tokio::test]
    async fn failed_first_availability_save_returns_to_bootstrap() {
        let remote = Arc::new(FakeRemote::default());
        remote.fail_with(Some(FakeFailure::Network));
        let coordinator = coordinator(remote.clone());

        coordinator
            .save_general(1, hours(&[10]))
            .await
            .expect_err("offline");
        assert_eq!(
            coordinator.resolve_availability(1, date("2025-05-05")).expect("resolve").len(),
            15
        );

        remote.fail_with(None);
        coordinator.save_general(1, hours(&[10])).await.expect("save general");
        coordinator
            .save_specific(date("2025-05-05"), 1, BTreeSet::new())
            .await
            .expect("save specific");
        assert!(coordinator.resolve_availability(1, date("2025-05-05")).expect("resolve").is_empty());
        assert_eq!(
            coordinator.resolve_availability(1, date("2025-05-12")).expect("resolve"),
            hours(&[10])
        );
        assert_eq!(
            coordinator
                .key_state(&SyncKey::Specific { date: date("2025-05-05") })
                .expect("state"),
            KeyState::Confirmed
        );
    }

    #[tokio::test]
    async fn derive_and_select_follow_precedence() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = coordinator(remote);
        let events = InMemoryEventIndex::default();
        events
            .upsert(Event {
                id: "e1".to_string(),
                title: "Birthday".to_string(),
                date: date("2025-05-06"),
                start_hour: 18,
                end_hour: 20,
            })
            .expect("event");
        coordinator.save_general(2, hours(&[10, 18])).await.expect("save");
        coordinator.block(date("2025-05-06"), 10, false).await.expect("block");

        let state = |hour| {
            coordinator
                .derive_slot_state(&events, date("2025-05-06"), hour)
                .expect("derive")
                .as_str()
        };
        assert_eq!(state(18), "occupied");
        assert_eq!(state(10), "blocked");
        assert_eq!(state(11), "unavailable");
        assert_eq!(
            coordinator
                .derive_slot_state(&events, date("2025-05-13"), 10)
                .expect("derive")
                .as_str(),
            "available"
        );

        let action = coordinator
            .select_slot(&events, InteractionMode::Booking, date("2025-05-06"), 10)
            .expect("select");
        assert!(matches!(action, SlotAction::OfferUnblock { .. }));
    }

    #[tokio::test]
    async fn periodic_resync_stops_after_shutdown() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = Arc::new(coordinator(remote.clone()));
        coordinator.load_week(date("2025-05-06")).await.expect("load");
        remote.seed_blocked(BlockedSlot::new(
            "srv-late",
            date("2025-05-07"),
            9,
            false,
            SlotOrigin::ServerConfirmed,
        ));

        let handle = coordinator.spawn_periodic_resync(Duration::from_millis(10));
        for _ in 0..200 {
            if coordinator.is_blocked(date("2025-05-07"), 9).expect("query") {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(coordinator.is_blocked(date("2025-05-07"), 9).expect("query"));

        coordinator.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("resync task ends")
            .expect("join");
    }

    proptest! {
        #[test]
        fn confirmed_blocks_never_leak_across_dates(
            week_offsets in proptest::collection::btree_set(0u64..20, 1..6),
            other_offset in 20u64..40,
            hour in 8u8..23,
        ) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let coordinator = coordinator(Arc::new(FakeRemote::default()));
                let base = date("2025-05-06");
                for offset in &week_offsets {
                    let day = base + Days::new(offset * 7);
                    coordinator.block(day, hour, false).await.expect("block");
                }

                for offset in &week_offsets {
                    let day = base + Days::new(offset * 7);
                    assert!(coordinator.is_blocked(day, hour).expect("query"));
                }
                let other = base + Days::new(other_offset * 7);
                assert!(!coordinator.is_blocked(other, hour).expect("query"));
            });
        }
    }
}
