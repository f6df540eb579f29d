use crate::plc_link::{Connector, RegisterClient};
use async_trait::async_trait;
use line_core::DeviceDescriptor;
use std::io;
use tokio::net::lookup_host;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

/// Modbus TCP transport, one `Context` per connected device.
pub struct ModbusClient {
    ctx: Context,
}

#[async_trait]
impl RegisterClient for ModbusClient {
    async fn read_holding_registers(&mut self, start: u16, count: u16) -> io::Result<Vec<u16>> {
        self.ctx.read_holding_registers(start, count).await
    }

    async fn write_single_register(&mut self, address: u16, word: u16) -> io::Result<()> {
        self.ctx.write_single_register(address, word).await
    }

    async fn write_multiple_registers(&mut self, address: u16, words: &[u16]) -> io::Result<()> {
        self.ctx.write_multiple_registers(address, words).await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn connect(&self, device: &DeviceDescriptor) -> io::Result<Box<dyn RegisterClient>> {
        let endpoint = device.endpoint();
        let socket_addr = lookup_host(endpoint.as_str()).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for {endpoint}"),
            )
        })?;
        debug!(device_no = device.device_no, %socket_addr, "Resolved Modbus endpoint");

        let ctx = tcp::connect_slave(socket_addr, Slave(device.unit_id)).await?;
        info!(
            device_no = device.device_no,
            %socket_addr,
            unit_id = device.unit_id,
            "Connected to Modbus TCP"
        );
        Ok(Box::new(ModbusClient { ctx }))
    }
}
