pub mod config;
pub mod worker;

pub use config::RelayConfig;
pub use worker::{RelayWorker, SubjectRouter, TickOutcome};
