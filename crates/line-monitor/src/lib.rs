//! Production line monitor: polls PLCs, evaluates alarms and OEE, and serves
//! the dashboard UI over a line-delimited JSON gateway.

pub mod dashboard;
pub mod infra;
pub mod runtime;
pub mod simulation;
pub mod status;

pub use dashboard::{Dashboard, DashboardConfig};
pub use infra::station::{ConfigProvider, StationConfig, StationFile, StaticStation};
