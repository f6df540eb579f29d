pub mod gateway;
pub mod hal_modbus;
pub mod hal_sim;
pub mod metrics;
pub mod plc_link;
pub mod protocol;
pub mod shutdown;

pub use gateway::{Gateway, GatewayBackend, GatewayConfig};
pub use hal_modbus::ModbusConnector;
pub use hal_sim::{SimConnector, SimulatedPlc};
pub use metrics::{init_metrics, serve_metrics};
pub use plc_link::{
    Connector, LinkConfig, LinkError, LinkState, PlcLink, PlcLinkManager, PollSink,
    RegisterClient, WriteError,
};
pub use protocol::{LineAccumulator, Parameters, ProtocolError, Request, RequestError, Response};
pub use shutdown::{stop_channel, StopSignal, StopTrigger};
