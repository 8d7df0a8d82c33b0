use crate::application::bootstrap::{BootstrapResult, bootstrap_workspace, bootstrap_workspace_with_lookup};
use crate::application::sync_coordinator::{KeyState, LoadReport, MutationOutcome, SyncCoordinator, SyncKey};
use crate::domain::models::{
    BlockedSlot, SlotKey, TimeSlot, WeekDay, parse_iso_date, validate_weekday, weekday_index,
};
use crate::domain::slot_state::{InteractionMode, SlotAction, SlotState};
use crate::domain::week_calendar::WeekCalendarBuilder;
use crate::infrastructure::config::VenueConfig;
use crate::infrastructure::error::{InfraError, poisoned};
use crate::infrastructure::event_index::InMemoryEventIndex;
use crate::infrastructure::remote_client::{AvailabilityRemote, ReqwestAvailabilityRemote};
use crate::infrastructure::snapshot_cache::{SnapshotCache, SqliteSnapshotCache};
use crate::infrastructure::sync_state_repository::{SqliteSyncStateRepository, SyncStateRepository};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

pub type VenueCoordinator =
    SyncCoordinator<dyn AvailabilityRemote, dyn SnapshotCache, dyn SyncStateRepository>;

pub struct AppState {
    config: VenueConfig,
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    coordinator: Arc<VenueCoordinator>,
    events: Arc<InMemoryEventIndex>,
    resync_task: Mutex<Option<JoinHandle<()>>>,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let remote: Arc<dyn AvailabilityRemote> = Arc::new(ReqwestAvailabilityRemote::new(
            bootstrap.config.remote.base_url.clone(),
        ));
        Ok(Self::from_bootstrap(bootstrap, remote))
    }

    /// Same workspace layout, but with a caller-supplied remote and config
    /// lookup instead of HTTP and the process environment.
    pub fn with_remote<F>(
        workspace_root: PathBuf,
        remote: Arc<dyn AvailabilityRemote>,
        lookup: F,
    ) -> Result<Self, InfraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bootstrap = bootstrap_workspace_with_lookup(&workspace_root, lookup)?;
        Ok(Self::from_bootstrap(bootstrap, remote))
    }

    fn from_bootstrap(bootstrap: BootstrapResult, remote: Arc<dyn AvailabilityRemote>) -> Self {
        let snapshots: Arc<dyn SnapshotCache> =
            Arc::new(SqliteSnapshotCache::new(&bootstrap.database_path));
        let sync_state: Arc<dyn SyncStateRepository> =
            Arc::new(SqliteSyncStateRepository::new(&bootstrap.database_path));
        let coordinator: VenueCoordinator =
            SyncCoordinator::from_config(&bootstrap.config, remote, snapshots, sync_state);

        Self {
            config: bootstrap.config,
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            coordinator: Arc::new(coordinator),
            events: Arc::new(InMemoryEventIndex::default()),
            resync_task: Mutex::new(None),
            log_guard: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &VenueConfig {
        &self.config
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn coordinator(&self) -> &Arc<VenueCoordinator> {
        &self.coordinator
    }

    pub fn events(&self) -> &Arc<InMemoryEventIndex> {
        &self.events
    }

    /// Starts the background re-sync on the current tokio runtime. Calling it
    /// again replaces the previous task.
    pub fn start_periodic_resync(&self) -> Result<(), InfraError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(InfraError::InvalidConfig(
                "periodic re-sync needs a running tokio runtime".to_string(),
            ));
        }
        let handle = self
            .coordinator
            .spawn_periodic_resync(self.config.remote.resync_interval);
        let mut task = self
            .resync_task
            .lock()
            .map_err(|error| poisoned("resync task", error))?;
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        self.log_info(
            "start_periodic_resync",
            &format!(
                "interval_seconds={}",
                self.config.remote.resync_interval.as_secs()
            ),
        );
        Ok(())
    }

    /// Detaches the coordinator: in-flight remote results are ignored from now on.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        if let Ok(mut task) = self.resync_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        tracing::warn!(command, kind = error.kind(), %error, "command failed");
        self.log_error(command, &format!("{}: {error}", error.kind()));
        error.user_message()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MutationResponse {
    pub outcome: MutationOutcome,
    pub key_state: KeyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<BlockedSlot>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WeekResponse {
    pub days: Vec<WeekDay>,
    pub time_slots: Vec<TimeSlot>,
    pub stale: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

fn parse_date(value: &str, field_name: &str) -> Result<NaiveDate, InfraError> {
    Ok(parse_iso_date(value, field_name)?)
}

fn parse_optional_date(value: Option<String>, field_name: &str) -> Result<Option<NaiveDate>, InfraError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| parse_date(value, field_name))
        .transpose()
}

fn check_hour(hour: u8) -> Result<u8, InfraError> {
    if hour > 23 {
        return Err(InfraError::invalid_input(format!(
            "hour must be between 0 and 23, got {hour}"
        )));
    }
    Ok(hour)
}

fn slot_response(
    state: &AppState,
    outcome: MutationOutcome,
    key: SlotKey,
) -> Result<MutationResponse, InfraError> {
    let coordinator = state.coordinator();
    Ok(MutationResponse {
        outcome,
        key_state: coordinator.key_state(&SyncKey::Slot { key })?,
        slot: coordinator.blocked_slot(key)?,
    })
}

pub fn get_week_days_impl(state: &AppState, anchor: Option<String>) -> Result<WeekResponse, InfraError> {
    let coordinator = state.coordinator();
    let anchor = parse_optional_date(anchor, "anchor")?.unwrap_or_else(|| coordinator.today());
    Ok(WeekResponse {
        days: coordinator.week_days(anchor).to_vec(),
        time_slots: coordinator.time_slots()?,
        stale: coordinator.is_stale()?,
        last_synced_at: coordinator.last_synced_at()?,
    })
}

pub fn list_time_slots_impl(state: &AppState) -> Result<Vec<TimeSlot>, InfraError> {
    state.coordinator().time_slots()
}

pub fn resolve_availability_impl(
    state: &AppState,
    weekday: u8,
    date: String,
) -> Result<Vec<u8>, InfraError> {
    validate_weekday(weekday)?;
    let date = parse_date(&date, "date")?;
    let hours = state.coordinator().resolve_availability(weekday, date)?;
    Ok(hours.into_iter().collect())
}

pub fn is_blocked_impl(state: &AppState, date: String, hour: u8) -> Result<bool, InfraError> {
    let date = parse_date(&date, "date")?;
    state.coordinator().is_blocked(date, check_hour(hour)?)
}

pub fn derive_slot_state_impl(state: &AppState, date: String, hour: u8) -> Result<SlotState, InfraError> {
    let date = parse_date(&date, "date")?;
    state
        .coordinator()
        .derive_slot_state(state.events().as_ref(), date, check_hour(hour)?)
}

pub fn select_slot_impl(
    state: &AppState,
    date: String,
    hour: u8,
    mode: Option<InteractionMode>,
) -> Result<SlotAction, InfraError> {
    let date = parse_date(&date, "date")?;
    state.coordinator().select_slot(
        state.events().as_ref(),
        mode.unwrap_or_default(),
        date,
        check_hour(hour)?,
    )
}

pub async fn block_impl(
    state: &AppState,
    date: String,
    hour: u8,
    recurring: Option<bool>,
) -> Result<MutationResponse, InfraError> {
    let date = parse_date(&date, "date")?;
    let hour = check_hour(hour)?;
    let recurring = recurring.unwrap_or(false);

    let outcome = state.coordinator().block(date, hour, recurring).await?;
    let key = SlotKey::new(date, hour);
    state.log_info(
        "block",
        &format!("key={key} recurring={recurring} outcome={outcome:?}"),
    );
    slot_response(state, outcome, key)
}

/// Unblocks by server id when `id` is given, otherwise by `date` + `hour`.
pub async fn unblock_impl(
    state: &AppState,
    date: Option<String>,
    hour: Option<u8>,
    id: Option<String>,
) -> Result<MutationResponse, InfraError> {
    let coordinator = state.coordinator();
    let id = id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let (outcome, key) = match (id, date, hour) {
        (Some(id), _, _) => {
            let key = coordinator
                .blocked_slot_by_id(&id)?
                .map(|slot| slot.key())
                .ok_or_else(|| InfraError::not_found(format!("id {id}")))?;
            (coordinator.unblock_by_id(&id).await?, key)
        }
        (None, Some(date), Some(hour)) => {
            let date = parse_date(&date, "date")?;
            let hour = check_hour(hour)?;
            (coordinator.unblock(date, hour).await?, SlotKey::new(date, hour))
        }
        _ => {
            return Err(InfraError::invalid_input(
                "unblock needs either an id or a date and hour",
            ));
        }
    };

    state.log_info("unblock", &format!("key={key} outcome={outcome:?}"));
    slot_response(state, outcome, key)
}

pub async fn update_general_availability_impl(
    state: &AppState,
    weekday: u8,
    hours: Vec<u8>,
) -> Result<MutationResponse, InfraError> {
    validate_weekday(weekday)?;
    let hours: BTreeSet<u8> = hours.into_iter().collect();
    let coordinator = state.coordinator();

    let outcome = coordinator.save_general(weekday, hours.clone()).await?;
    state.log_info(
        "update_general_availability",
        &format!("weekday={weekday} hours={hours:?} outcome={outcome:?}"),
    );
    Ok(MutationResponse {
        outcome,
        key_state: coordinator.key_state(&SyncKey::General { weekday })?,
        slot: None,
    })
}

/// `weekday` defaults to the date's own weekday; a mismatch is rejected.
pub async fn update_specific_availability_impl(
    state: &AppState,
    date: String,
    weekday: Option<u8>,
    hours: Vec<u8>,
) -> Result<MutationResponse, InfraError> {
    let date = parse_date(&date, "date")?;
    let weekday = weekday.unwrap_or_else(|| weekday_index(date));
    let hours: BTreeSet<u8> = hours.into_iter().collect();
    let coordinator = state.coordinator();

    let outcome = coordinator.save_specific(date, weekday, hours.clone()).await?;
    state.log_info(
        "update_specific_availability",
        &format!("date={date} hours={hours:?} outcome={outcome:?}"),
    );
    Ok(MutationResponse {
        outcome,
        key_state: coordinator.key_state(&SyncKey::Specific { date })?,
        slot: None,
    })
}

pub async fn sync_venue_impl(state: &AppState, anchor: Option<String>) -> Result<LoadReport, InfraError> {
    let coordinator = state.coordinator();
    let report = match parse_optional_date(anchor, "anchor")? {
        Some(anchor) => coordinator.load_week(anchor).await?,
        None => coordinator.resync().await?,
    };
    state.log_info(
        "sync_venue",
        &format!(
            "week_start={} source={:?} blocked={} stale={}",
            report.week_start, report.source, report.blocked_count, report.stale
        ),
    );
    Ok(report)
}

/// Blocked slots in `[start, end]`. Without bounds, the week containing
/// `start` (or today).
pub fn list_blocked_slots_impl(
    state: &AppState,
    start: Option<String>,
    end: Option<String>,
) -> Result<Vec<BlockedSlot>, InfraError> {
    let coordinator = state.coordinator();
    let start = parse_optional_date(start, "start")?;
    let end = parse_optional_date(end, "end")?;

    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        (start, None) => {
            let week_start = WeekCalendarBuilder::week_start(start.unwrap_or_else(|| coordinator.today()));
            let week_end = week_start
                .checked_add_days(Days::new(6))
                .unwrap_or(NaiveDate::MAX);
            (week_start, week_end)
        }
        (None, Some(end)) => (end, end),
    };
    if end < start {
        return Err(InfraError::invalid_input("end must not be before start"));
    }
    coordinator.blocked_slots_between(start, end)
}
