//! Coil link: single-bit access to a Modbus device
//!
//! Supports Modbus TCP, Modbus RTU over a serial port, and an in-process
//! simulated coil bank.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{ConnectionConfig, DeviceConfig, DeviceType};
use crate::error::LinkError;

pub mod client;
pub mod memory;

pub use client::ModbusCoilLink;
pub use memory::MemoryCoilLink;

/// Synchronous-per-call access to single coils
///
/// No retries happen at this layer; every failure is returned as a
/// [`LinkError`] carrying the coil address.
#[async_trait]
pub trait CoilLink: Send + Sync {
    /// Read the current state of one coil
    async fn read_coil(&self, address: u16) -> Result<bool, LinkError>;

    /// Set the state of one coil
    async fn write_coil(&self, address: u16, value: bool) -> Result<(), LinkError>;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    /// Human readable peer, e.g. `10.3.200.10:502`
    fn target(&self) -> String;
}

/// Open the link described by the device configuration
pub async fn connect(config: &DeviceConfig) -> Result<Arc<dyn CoilLink>, LinkError> {
    let link: Arc<dyn CoilLink> = match (&config.device_type, &config.connection) {
        (DeviceType::Tcp, ConnectionConfig::Tcp(tcp)) => Arc::new(
            ModbusCoilLink::connect_tcp(&tcp.host, tcp.port, tcp.unit_id, config.timeout())
                .await?,
        ),
        (DeviceType::Rtu, ConnectionConfig::Rtu(rtu)) => {
            Arc::new(ModbusCoilLink::connect_rtu(rtu, config.timeout())?)
        }
        (DeviceType::Simulated, _) => {
            info!(
                "Using simulated coil bank with {} coils",
                config.coils.len()
            );
            Arc::new(MemoryCoilLink::with_coils(&config.coils))
        }
        (device_type, _) => {
            return Err(LinkError::connection(
                format!("{:?}", device_type),
                "connection settings do not match device type",
            ))
        }
    };

    Ok(link)
}
