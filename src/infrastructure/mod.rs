pub mod config;
pub mod error;
pub mod event_index;
pub mod remote_client;
pub mod slot_mapper;
pub mod snapshot_cache;
pub mod storage;
pub mod sync_state_repository;
