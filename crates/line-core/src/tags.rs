use serde::{Deserialize, Serialize};
use std::fmt;

pub type DeviceNo = u16;
pub type TagId = u32;
pub type AlarmNo = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    #[default]
    ModbusTcp,
    Simulated,
}

/// One physical controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_no: DeviceNo,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: ProtocolKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Modbus unit identifier.
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_port() -> u16 {
    502
}

fn default_true() -> bool {
    true
}

fn default_unit_id() -> u8 {
    1
}

impl DeviceDescriptor {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bit,
    Int16,
    Int32,
    Float32,
    String,
}

impl DataType {
    /// Register count the type occupies when the tag does not say otherwise.
    pub fn natural_words(self) -> u16 {
        match self {
            DataType::Bit | DataType::Int16 | DataType::String => 1,
            DataType::Int32 | DataType::Float32 => 2,
        }
    }

    pub fn is_wide(self) -> bool {
        matches!(self, DataType::Int32 | DataType::Float32)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bit => "bit",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScaleAlgorithm {
    #[default]
    Raw,
    Linear,
}

/// A typed logical value mapped onto holding registers of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDescriptor {
    pub id: TagId,
    #[serde(default)]
    pub name: String,
    pub device_no: DeviceNo,
    pub address: u16,
    /// Registers read for this tag; 0 means the data type's natural width.
    #[serde(default)]
    pub length: u16,
    pub data_type: DataType,
    #[serde(default)]
    pub bit_index: u8,
    #[serde(default)]
    pub scale: ScaleAlgorithm,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub span: f64,
    #[serde(default)]
    pub writable: bool,
}

impl TagDescriptor {
    pub fn new(id: TagId, device_no: DeviceNo, address: u16, data_type: DataType) -> Self {
        Self {
            id,
            name: String::new(),
            device_no,
            address,
            length: 0,
            data_type,
            bit_index: 0,
            scale: ScaleAlgorithm::Raw,
            offset: 0.0,
            span: 0.0,
            writable: false,
        }
    }

    pub fn with_length(mut self, length: u16) -> Self {
        self.length = length;
        self
    }

    pub fn with_bit(mut self, bit_index: u8) -> Self {
        self.bit_index = bit_index;
        self
    }

    pub fn with_linear_scale(mut self, offset: f64, span: f64) -> Self {
        self.scale = ScaleAlgorithm::Linear;
        self.offset = offset;
        self.span = span;
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn effective_length(&self) -> u16 {
        if self.length == 0 {
            self.data_type.natural_words()
        } else {
            self.length
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// What makes an alarm's monitored tag count as "in alarm".
///
/// Configuration may carry a bit number (as a number or numeric string) or
/// anything else, which means "value is non-zero".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(from = "RawCondition")]
pub enum AlarmCondition {
    Bit(u8),
    #[default]
    NonZero,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCondition {
    Index(i64),
    Text(String),
    Missing(Option<()>),
}

impl From<RawCondition> for AlarmCondition {
    fn from(raw: RawCondition) -> Self {
        match raw {
            RawCondition::Index(n) => AlarmCondition::from_index(n),
            RawCondition::Text(s) => AlarmCondition::parse(&s),
            RawCondition::Missing(_) => AlarmCondition::NonZero,
        }
    }
}

impl AlarmCondition {
    pub fn parse(text: &str) -> Self {
        text.trim()
            .parse::<i64>()
            .map(Self::from_index)
            .unwrap_or(AlarmCondition::NonZero)
    }

    fn from_index(n: i64) -> Self {
        u8::try_from(n)
            .map(AlarmCondition::Bit)
            .unwrap_or(AlarmCondition::NonZero)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlarmDefinition {
    pub alarm_no: AlarmNo,
    pub tag_id: TagId,
    #[serde(default, alias = "bit")]
    pub condition: AlarmCondition,
    pub text: String,
    #[serde(default)]
    pub severity: Severity,
}

impl AlarmDefinition {
    pub fn new(alarm_no: AlarmNo, tag_id: TagId, condition: AlarmCondition, text: &str) -> Self {
        Self {
            alarm_no,
            tag_id,
            condition,
            text: text.to_string(),
            severity: Severity::default(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_length_falls_back_to_type_width() {
        let t = TagDescriptor::new(1, 1, 0, DataType::Float32);
        assert_eq!(t.effective_length(), 2);
        assert_eq!(t.with_length(4).effective_length(), 4);
    }

    #[test]
    fn alarm_condition_accepts_numbers_and_strings() {
        let def: AlarmDefinition =
            serde_json::from_str(r#"{"alarm_no":1,"tag_id":10,"bit":"3","text":"a"}"#).unwrap();
        assert_eq!(def.condition, AlarmCondition::Bit(3));

        let def: AlarmDefinition =
            serde_json::from_str(r#"{"alarm_no":1,"tag_id":10,"condition":7,"text":"a"}"#)
                .unwrap();
        assert_eq!(def.condition, AlarmCondition::Bit(7));

        let def: AlarmDefinition =
            serde_json::from_str(r#"{"alarm_no":1,"tag_id":10,"bit":"nz","text":"a"}"#).unwrap();
        assert_eq!(def.condition, AlarmCondition::NonZero);

        let def: AlarmDefinition =
            serde_json::from_str(r#"{"alarm_no":1,"tag_id":10,"text":"a"}"#).unwrap();
        assert_eq!(def.condition, AlarmCondition::NonZero);
    }

    #[test]
    fn tag_descriptor_defaults() {
        let tag: TagDescriptor = serde_json::from_str(
            r#"{"id":10,"device_no":1,"address":100,"data_type":"int16"}"#,
        )
        .unwrap();
        assert_eq!(tag.scale, ScaleAlgorithm::Raw);
        assert!(!tag.writable);
        assert_eq!(tag.effective_length(), 1);
    }
}
