//! Modbus client link for TCP and RTU devices

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use super::CoilLink;
use crate::config::RtuConnection;
use crate::error::LinkError;

/// Coil link over a tokio-modbus client context
///
/// The context sits behind one async mutex, so concurrent pulses share the
/// wire without interleaving requests.
pub struct ModbusCoilLink {
    target: String,
    timeout: Duration,
    context: Mutex<Option<Context>>,
    connected: AtomicBool,
}

impl ModbusCoilLink {
    /// Connect to a Modbus TCP server
    pub async fn connect_tcp(
        host: &str,
        port: u16,
        unit_id: u8,
        timeout: Duration,
    ) -> Result<Self, LinkError> {
        let target = format!("{}:{}", host, port);

        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| LinkError::connection(&target, e))?
            .next()
            .ok_or_else(|| LinkError::connection(&target, "address did not resolve"))?;

        info!("Connecting to Modbus TCP: {} (unit {})", addr, unit_id);

        let ctx = tokio::time::timeout(timeout, tcp::connect_slave(addr, Slave(unit_id)))
            .await
            .map_err(|_| LinkError::connection(&target, "connect timed out"))?
            .map_err(|e| LinkError::connection(&target, e))?;

        Ok(Self::from_context(target, ctx, timeout))
    }

    /// Open a serial port and attach a Modbus RTU client to it
    pub fn connect_rtu(rtu: &RtuConnection, timeout: Duration) -> Result<Self, LinkError> {
        let builder = serial_builder(rtu)?;
        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| LinkError::connection(&rtu.port, e))?;

        info!(
            "Opened Modbus RTU port {} at {} baud (unit {})",
            rtu.port, rtu.baud_rate, rtu.unit_id
        );

        let ctx = rtu::attach_slave(stream, Slave(rtu.unit_id));
        Ok(Self::from_context(rtu.port.clone(), ctx, timeout))
    }

    fn from_context(target: String, ctx: Context, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            context: Mutex::new(Some(ctx)),
            connected: AtomicBool::new(true),
        }
    }

    /// Classify a failed request; a dead session drops the context for good
    fn transport_error(
        &self,
        context: &mut Option<Context>,
        address: u16,
        err: tokio_modbus::Error,
    ) -> LinkError {
        match err {
            tokio_modbus::Error::Transport(e) if is_session_loss(&e) => {
                warn!("Lost Modbus session to {}: {}", self.target, e);
                self.connected.store(false, Ordering::SeqCst);
                context.take();
                LinkError::connection(&self.target, e)
            }
            other => LinkError::io(address, other),
        }
    }
}

fn is_session_loss(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

#[async_trait]
impl CoilLink for ModbusCoilLink {
    async fn read_coil(&self, address: u16) -> Result<bool, LinkError> {
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or(LinkError::Closed)?;

        let result = tokio::time::timeout(self.timeout, ctx.read_coils(address, 1)).await;
        let bits = match result {
            Err(_) => return Err(LinkError::io(address, "read timed out")),
            Ok(Err(e)) => return Err(self.transport_error(&mut guard, address, e)),
            Ok(Ok(Err(exception))) => {
                return Err(LinkError::io(
                    address,
                    format!("Modbus exception: {:?}", exception),
                ))
            }
            Ok(Ok(Ok(bits))) => bits,
        };

        let value = bits
            .first()
            .copied()
            .ok_or_else(|| LinkError::io(address, "empty coil response"))?;

        debug!("Read coil {} on {} = {}", address, self.target, value);
        Ok(value)
    }

    async fn write_coil(&self, address: u16, value: bool) -> Result<(), LinkError> {
        let mut guard = self.context.lock().await;
        let ctx = guard.as_mut().ok_or(LinkError::Closed)?;

        let result = tokio::time::timeout(self.timeout, ctx.write_single_coil(address, value)).await;
        match result {
            Err(_) => return Err(LinkError::io(address, "write timed out")),
            Ok(Err(e)) => return Err(self.transport_error(&mut guard, address, e)),
            Ok(Ok(Err(exception))) => {
                return Err(LinkError::io(
                    address,
                    format!("Modbus exception: {:?}", exception),
                ))
            }
            Ok(Ok(Ok(()))) => {}
        }

        debug!("Wrote coil {} on {} = {}", address, self.target, value);
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        let mut guard = self.context.lock().await;
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut ctx) = guard.take() {
            if let Err(e) = ctx.disconnect().await {
                warn!("Error while disconnecting from {}: {}", self.target, e);
            }
            info!("Closed Modbus link to {}", self.target);
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

/// Translate the serial settings into a port builder
fn serial_builder(rtu: &RtuConnection) -> Result<tokio_serial::SerialPortBuilder, LinkError> {
    let data_bits = match rtu.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(LinkError::connection(
                &rtu.port,
                format!("unsupported data bits {}", other),
            ))
        }
    };

    let stop_bits = match rtu.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => {
            return Err(LinkError::connection(
                &rtu.port,
                format!("unsupported stop bits {}", other),
            ))
        }
    };

    let parity = match rtu.parity.to_ascii_lowercase().as_str() {
        "none" => tokio_serial::Parity::None,
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        other => {
            return Err(LinkError::connection(
                &rtu.port,
                format!("unsupported parity '{}'", other),
            ))
        }
    };

    Ok(tokio_serial::new(&rtu.port, rtu.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity))
}
