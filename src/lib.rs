//! CoilPulse - Modbus Coil Pulse & Sequence Controller Library
//!
//! Press-and-hold and automated sequences for solenoid pushers wired to
//! Modbus coils, with an HTTP/WebSocket control surface

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod input;
pub mod link;
pub mod metrics;
pub mod mqtt;
pub mod panel;
