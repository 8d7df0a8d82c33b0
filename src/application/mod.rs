pub mod bootstrap;
pub mod commands;
pub mod sync_coordinator;
