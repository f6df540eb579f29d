use crate::pipeline::TagValues;
use crate::tags::{DeviceNo, TagId};
use serde::{Deserialize, Serialize};

/// Raw production figures for one OEE calculation. Times are in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OeeInputs {
    pub operating_time_s: f64,
    pub down_time_s: f64,
    pub ok_count: u64,
    pub ng_count: u64,
    pub total_count: u64,
    pub ideal_cycle_time_s: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OeeSnapshot {
    pub availability: f64,
    pub performance: f64,
    pub quality: f64,
    pub overall: f64,
    pub operating_time_s: f64,
    pub down_time_s: f64,
    pub ok_count: u64,
    pub ng_count: u64,
    pub total_count: u64,
}

/// Availability × Performance × Quality.
///
/// Ratios are not clamped: a line running faster than its ideal cycle time
/// reports Performance (and Overall) above 1.0.
pub fn calculate(inputs: &OeeInputs) -> OeeSnapshot {
    let planned = inputs.operating_time_s + inputs.down_time_s;
    let availability = ratio(inputs.operating_time_s, planned);
    let quality = ratio(inputs.ok_count as f64, inputs.total_count as f64);
    let performance = if inputs.operating_time_s == 0.0 || inputs.ideal_cycle_time_s == 0.0 {
        0.0
    } else {
        ratio(
            inputs.ideal_cycle_time_s * inputs.total_count as f64,
            inputs.operating_time_s,
        )
    };

    OeeSnapshot {
        availability,
        performance,
        quality,
        overall: availability * performance * quality,
        operating_time_s: inputs.operating_time_s,
        down_time_s: inputs.down_time_s,
        ok_count: inputs.ok_count,
        ng_count: inputs.ng_count,
        total_count: inputs.total_count,
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        0.0
    } else {
        numerator / denominator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    fn to_seconds(self, value: f64) -> f64 {
        match self {
            TimeUnit::Seconds => value,
            TimeUnit::Minutes => value * 60.0,
            TimeUnit::Hours => value * 3600.0,
        }
    }
}

/// Which tags of which device feed the OEE calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OeeTagMap {
    #[serde(default = "default_device")]
    pub device_no: DeviceNo,
    pub operating_time: TagId,
    pub down_time: TagId,
    pub ok_count: TagId,
    pub ng_count: TagId,
    pub total_count: TagId,
    pub ideal_cycle_time: TagId,
    /// Unit of the operating/down time tags.
    #[serde(default)]
    pub time_unit: TimeUnit,
}

fn default_device() -> DeviceNo {
    1
}

impl OeeTagMap {
    /// Missing or non-numeric tags count as zero.
    pub fn inputs_from(&self, values: &TagValues) -> OeeInputs {
        let number = |id: TagId| {
            values
                .get(&id)
                .and_then(|v| v.as_f64())
                .filter(|v| v.is_finite())
                .unwrap_or(0.0)
        };
        let count = |id: TagId| number(id).max(0.0).round() as u64;
        OeeInputs {
            operating_time_s: self.time_unit.to_seconds(number(self.operating_time)),
            down_time_s: self.time_unit.to_seconds(number(self.down_time)),
            ok_count: count(self.ok_count),
            ng_count: count(self.ng_count),
            total_count: count(self.total_count),
            ideal_cycle_time_s: number(self.ideal_cycle_time),
        }
    }

    pub fn calculate(&self, values: &TagValues) -> OeeSnapshot {
        calculate(&self.inputs_from(values))
    }
}
