//! Station configuration: devices, tags, alarms and the OEE tag map.
//!
//! The station file is plain JSON. Tags may be hot-reloaded: the file's
//! modification time is polled and a change that is still the same one poll
//! later swaps a new tag generation into the pipeline.

use line_core::{
    AlarmCondition, AlarmDefinition, ConfigError, DataType, DeviceDescriptor, DeviceNo,
    OeeTagMap, ProtocolKind, Severity, TagDescriptor, TagPipeline, TagSet, TimeUnit,
};
use line_io::StopSignal;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StationError {
    #[error("failed to read station file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse station file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub devices: Vec<DeviceDescriptor>,
    #[serde(default)]
    pub tags: Vec<TagDescriptor>,
    #[serde(default)]
    pub alarms: Vec<AlarmDefinition>,
    #[serde(default)]
    pub oee: Option<OeeTagMap>,
    #[serde(default)]
    pub primary_device: Option<DeviceNo>,
}

impl StationConfig {
    /// Explicit primary device, else the first configured one, else 1.
    pub fn primary_device(&self) -> DeviceNo {
        self.primary_device
            .or_else(|| self.devices.first().map(|d| d.device_no))
            .unwrap_or(1)
    }

    /// Cross-reference checks on top of the per-list ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut devices = HashSet::new();
        for device in &self.devices {
            if !devices.insert(device.device_no) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device number {}",
                    device.device_no
                )));
            }
        }
        check_tag_devices(&self.tags, &devices)?;
        TagSet::new(0, self.tags.clone())?;

        let tags: HashSet<_> = self.tags.iter().map(|t| t.id).collect();
        for alarm in &self.alarms {
            if !tags.contains(&alarm.tag_id) {
                return Err(ConfigError::Invalid(format!(
                    "alarm {} watches unknown tag {}",
                    alarm.alarm_no, alarm.tag_id
                )));
            }
        }
        Ok(())
    }
}

fn check_tag_devices(tags: &[TagDescriptor], devices: &HashSet<DeviceNo>) -> Result<(), ConfigError> {
    match tags.iter().find(|t| !devices.contains(&t.device_no)) {
        Some(tag) => Err(ConfigError::Invalid(format!(
            "tag {} references unknown device {}",
            tag.id, tag.device_no
        ))),
        None => Ok(()),
    }
}

/// Source of device, tag and alarm definitions.
pub trait ConfigProvider: Send + Sync {
    fn station(&self) -> Result<StationConfig, StationError>;

    /// Changes whenever [`ConfigProvider::station`] may return new content.
    /// `None` means the configuration never changes.
    fn revision(&self) -> Option<SystemTime> {
        None
    }
}

/// Station read from a JSON file on every call.
#[derive(Debug, Clone)]
pub struct StationFile {
    path: PathBuf,
}

impl StationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for StationFile {
    fn station(&self) -> Result<StationConfig, StationError> {
        let text = fs::read_to_string(&self.path).map_err(|source| StationError::Io {
            path: self.path.clone(),
            source,
        })?;
        let station: StationConfig =
            serde_json::from_str(&text).map_err(|source| StationError::Parse {
                path: self.path.clone(),
                source,
            })?;
        station.validate()?;
        Ok(station)
    }

    fn revision(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

/// Fixed in-memory station.
#[derive(Debug, Clone)]
pub struct StaticStation(pub StationConfig);

impl ConfigProvider for StaticStation {
    fn station(&self) -> Result<StationConfig, StationError> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}

/// Register addresses of the built-in demo line.
pub mod demo {
    pub const OPERATING_TIME: u16 = 0;
    pub const DOWN_TIME: u16 = 2;
    pub const OK_COUNT: u16 = 4;
    pub const NG_COUNT: u16 = 6;
    pub const TOTAL_COUNT: u16 = 8;
    pub const IDEAL_CYCLE_TIME: u16 = 10;
    pub const LINE_SPEED: u16 = 100;
    /// Bit 0 running, bit 1 overload.
    pub const STATUS_WORD: u16 = 101;
    pub const TEMPERATURE: u16 = 102;
    pub const FAULT_CODE: u16 = 104;
    pub const PRODUCT_CODE: u16 = 110;
}

/// One simulated device with a small packaging line on it.
pub fn demo_station() -> StationConfig {
    let named = |tag: TagDescriptor, name: &str| TagDescriptor {
        name: name.to_string(),
        ..tag
    };
    let tags = vec![
        named(TagDescriptor::new(1, 1, demo::OPERATING_TIME, DataType::Int32), "Operating time"),
        named(TagDescriptor::new(2, 1, demo::DOWN_TIME, DataType::Int32), "Down time"),
        named(TagDescriptor::new(3, 1, demo::OK_COUNT, DataType::Int32), "Good parts"),
        named(TagDescriptor::new(4, 1, demo::NG_COUNT, DataType::Int32), "Rejected parts"),
        named(TagDescriptor::new(5, 1, demo::TOTAL_COUNT, DataType::Int32), "Total parts"),
        named(
            TagDescriptor::new(6, 1, demo::IDEAL_CYCLE_TIME, DataType::Float32),
            "Ideal cycle time",
        ),
        named(
            TagDescriptor::new(10, 1, demo::LINE_SPEED, DataType::Int16)
                .with_linear_scale(0.0, 100.0)
                .writable(),
            "Line speed %",
        ),
        named(
            TagDescriptor::new(11, 1, demo::STATUS_WORD, DataType::Bit)
                .with_bit(0)
                .writable(),
            "Running",
        ),
        named(
            TagDescriptor::new(12, 1, demo::STATUS_WORD, DataType::Bit).with_bit(1),
            "Overload",
        ),
        named(
            TagDescriptor::new(13, 1, demo::TEMPERATURE, DataType::Float32),
            "Motor temperature",
        ),
        named(TagDescriptor::new(14, 1, demo::FAULT_CODE, DataType::Int16), "Fault code"),
        named(
            TagDescriptor::new(20, 1, demo::PRODUCT_CODE, DataType::String)
                .with_length(4)
                .writable(),
            "Product code",
        ),
    ];
    let alarms = vec![
        AlarmDefinition::new(1, 12, AlarmCondition::Bit(1), "Motor overload")
            .with_severity(Severity::High),
        AlarmDefinition::new(2, 14, AlarmCondition::NonZero, "Line fault")
            .with_severity(Severity::Critical),
    ];
    StationConfig {
        devices: vec![DeviceDescriptor {
            device_no: 1,
            address: "127.0.0.1".to_string(),
            port: 502,
            protocol: ProtocolKind::Simulated,
            enabled: true,
            unit_id: 1,
        }],
        tags,
        alarms,
        oee: Some(OeeTagMap {
            device_no: 1,
            operating_time: 1,
            down_time: 2,
            ok_count: 3,
            ng_count: 4,
            total_count: 5,
            ideal_cycle_time: 6,
            time_unit: TimeUnit::Seconds,
        }),
        primary_device: Some(1),
    }
}

/// Poll `provider` every `period` and swap changed tag lists into `pipeline`.
///
/// A revision must be observed twice in a row before it is applied. A
/// station that fails to load or validate keeps the current generation.
pub async fn watch_tags(
    provider: Arc<dyn ConfigProvider>,
    pipeline: Arc<TagPipeline>,
    period: Duration,
    mut stop: StopSignal,
) {
    let mut applied = provider.revision();
    let mut pending: Option<Option<SystemTime>> = None;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.stopped() => break,
        }
        let current = provider.revision();
        if current == applied {
            pending = None;
            continue;
        }
        if pending != Some(current) {
            debug!(?current, "Station change detected, waiting for it to settle");
            pending = Some(current);
            continue;
        }
        pending = None;
        applied = current;
        reload_tags(provider.as_ref(), &pipeline);
    }
}

/// Load the station and swap its tags into `pipeline`. Returns the new generation.
pub fn reload_tags(provider: &dyn ConfigProvider, pipeline: &TagPipeline) -> Option<u64> {
    let station = match provider.station() {
        Ok(station) => station,
        Err(err) => {
            warn!(error = %err, "Station reload failed, keeping current tags");
            return None;
        }
    };
    let count = station.tags.len();
    match pipeline.update_tags(station.tags) {
        Ok(generation) => {
            info!(generation, tags = count, "Tag configuration reloaded");
            Some(generation)
        }
        Err(err) => {
            warn!(error = %err, "Rejected reloaded tags, keeping current tags");
            None
        }
    }
}
