//! Agentry scheduler — per-agency once/cron/interval dispatch with overlap
//! control, run history and instant retries.

mod service;
mod timing;

pub use service::{AgentSpawner, Scheduler};
pub use timing::{compute_next_run, parse_cron, parse_timezone};
