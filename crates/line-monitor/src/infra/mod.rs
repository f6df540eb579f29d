pub mod alarm_history;
pub mod station;
