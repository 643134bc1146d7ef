// Library root: settings synchronization between the tournament dashboard and
// the broadcast overlay. The relay owns the authoritative settings; every
// client keeps an eventually consistent copy through a sync agent.

pub mod agent;
pub mod build;
pub mod config;
pub mod protocol;
pub mod relay;
pub mod settings;
pub mod store;
