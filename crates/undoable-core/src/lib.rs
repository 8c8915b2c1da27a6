pub mod action_log;
pub mod approvals;
pub mod cancellation;
pub mod chat_loop;
pub mod compaction;
pub mod drift;
pub mod event_bus;
pub mod instructions;
pub mod paths;
pub mod persist;
pub mod pipeline;
pub mod run_config;
pub mod runs;
pub mod sessions;
pub mod settings;
pub mod skills;

pub const DEFAULT_DAEMON_HOST: &str = "127.0.0.1";
pub const DEFAULT_DAEMON_PORT: u16 = 4477;

pub use action_log::*;
pub use approvals::*;
pub use cancellation::*;
pub use chat_loop::*;
pub use compaction::*;
pub use drift::*;
pub use event_bus::*;
pub use instructions::*;
pub use paths::*;
pub use persist::*;
pub use pipeline::*;
pub use run_config::*;
pub use runs::*;
pub use sessions::*;
pub use settings::*;
pub use skills::*;
