pub mod alarm;
pub mod codec;
pub mod oee;
pub mod pipeline;
pub mod sync;
pub mod tags;
pub mod timebase;
pub mod value;

pub use alarm::{AlarmEngine, AlarmError, AlarmEvent, AlarmEventKind, AlarmInstance, AlarmListener};
pub use codec::{DecodeError, EncodeError, WritePayload};
pub use oee::{OeeInputs, OeeSnapshot, OeeTagMap, TimeUnit};
pub use pipeline::{ConfigError, RawRegisters, ReadSpan, TagPipeline, TagSet, TagSnapshot, TagValues};
pub use sync::SnapshotCache;
pub use tags::{
    AlarmCondition, AlarmDefinition, AlarmNo, DataType, DeviceDescriptor, DeviceNo, ProtocolKind,
    ScaleAlgorithm, Severity, TagDescriptor, TagId,
};
pub use timebase::TimeBase;
pub use value::DecodedValue;
