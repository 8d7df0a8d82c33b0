pub mod application;
pub mod domain;
pub mod infrastructure;

use application::bootstrap::bootstrap_workspace;
use application::commands::{
    block_impl, derive_slot_state_impl, get_week_days_impl, is_blocked_impl,
    list_blocked_slots_impl, list_time_slots_impl, resolve_availability_impl, select_slot_impl,
    sync_venue_impl, unblock_impl, update_general_availability_impl,
    update_specific_availability_impl,
};
use domain::models::{BlockedSlot, TimeSlot};
use serde::Serialize;
use std::path::PathBuf;

pub use application::commands::{AppState, MutationResponse, WeekResponse};
pub use application::sync_coordinator::{
    KeyState, LoadReport, LoadSource, MutationOutcome, SyncCoordinator, SyncKey,
};
pub use domain::slot_state::{InteractionMode, SlotAction, SlotState};
pub use infrastructure::error::InfraError;

// UI-facing commands. Each maps errors to a user message after logging them.

#[derive(Debug, Serialize)]
pub struct BootstrapResponse {
    pub workspace_root: String,
    pub database_path: String,
    pub owner_id: String,
}

pub fn bootstrap(root: Option<String>) -> Result<BootstrapResponse, String> {
    let workspace_root = match root {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir().map_err(|error| error.to_string())?,
    };

    let result = bootstrap_workspace(&workspace_root).map_err(|error| error.to_string())?;
    Ok(BootstrapResponse {
        workspace_root: result.workspace_root.display().to_string(),
        database_path: result.database_path.display().to_string(),
        owner_id: result.config.owner_id,
    })
}

pub fn get_week_days(state: &AppState, anchor: Option<String>) -> Result<WeekResponse, String> {
    get_week_days_impl(state, anchor).map_err(|error| state.command_error("get_week_days", &error))
}

pub fn list_time_slots(state: &AppState) -> Result<Vec<TimeSlot>, String> {
    list_time_slots_impl(state).map_err(|error| state.command_error("list_time_slots", &error))
}

pub fn resolve_availability(state: &AppState, weekday: u8, date: String) -> Result<Vec<u8>, String> {
    resolve_availability_impl(state, weekday, date)
        .map_err(|error| state.command_error("resolve_availability", &error))
}

pub fn is_blocked(state: &AppState, date: String, hour: u8) -> Result<bool, String> {
    is_blocked_impl(state, date, hour).map_err(|error| state.command_error("is_blocked", &error))
}

pub fn derive_slot_state(state: &AppState, date: String, hour: u8) -> Result<SlotState, String> {
    derive_slot_state_impl(state, date, hour)
        .map_err(|error| state.command_error("derive_slot_state", &error))
}

pub fn select_slot(
    state: &AppState,
    date: String,
    hour: u8,
    mode: Option<InteractionMode>,
) -> Result<SlotAction, String> {
    select_slot_impl(state, date, hour, mode)
        .map_err(|error| state.command_error("select_slot", &error))
}

pub fn list_blocked_slots(
    state: &AppState,
    start: Option<String>,
    end: Option<String>,
) -> Result<Vec<BlockedSlot>, String> {
    list_blocked_slots_impl(state, start, end)
        .map_err(|error| state.command_error("list_blocked_slots", &error))
}

pub async fn block(
    state: &AppState,
    date: String,
    hour: u8,
    recurring: Option<bool>,
) -> Result<MutationResponse, String> {
    block_impl(state, date, hour, recurring)
        .await
        .map_err(|error| state.command_error("block", &error))
}

pub async fn unblock(
    state: &AppState,
    date: Option<String>,
    hour: Option<u8>,
    id: Option<String>,
) -> Result<MutationResponse, String> {
    unblock_impl(state, date, hour, id)
        .await
        .map_err(|error| state.command_error("unblock", &error))
}

pub async fn update_general_availability(
    state: &AppState,
    weekday: u8,
    hours: Vec<u8>,
) -> Result<MutationResponse, String> {
    update_general_availability_impl(state, weekday, hours)
        .await
        .map_err(|error| state.command_error("update_general_availability", &error))
}

pub async fn update_specific_availability(
    state: &AppState,
    date: String,
    weekday: Option<u8>,
    hours: Vec<u8>,
) -> Result<MutationResponse, String> {
    update_specific_availability_impl(state, date, weekday, hours)
        .await
        .map_err(|error| state.command_error("update_specific_availability", &error))
}

pub async fn sync_venue(state: &AppState, anchor: Option<String>) -> Result<LoadReport, String> {
    sync_venue_impl(state, anchor)
        .await
        .map_err(|error| state.command_error("sync_venue", &error))
}
