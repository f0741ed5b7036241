//! Validation of operator-supplied values
//!
//! Durations, coil address lists and button sequences come from request
//! bodies and configuration. Everything here rejects bad input before any
//! device interaction happens.

use std::time::Duration;

use crate::error::ControlError;

/// Convert a press duration in seconds; must be finite and strictly positive
pub fn press_duration(secs: f64) -> Result<Duration, ControlError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ControlError::validation(format!(
            "duration must be a positive number of seconds, got {}",
            secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ControlError::validation(format!("duration {} out of range: {}", secs, e)))
}

/// Convert a wait duration in seconds; zero is allowed
pub fn wait_duration(secs: f64) -> Result<Duration, ControlError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ControlError::validation(format!(
            "wait must be zero or a positive number of seconds, got {}",
            secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ControlError::validation(format!("wait {} out of range: {}", secs, e)))
}

/// Reject empty and duplicated address lists
pub fn validate_addresses(addresses: &[u16]) -> Result<(), ControlError> {
    if addresses.is_empty() {
        return Err(ControlError::validation("at least one coil address is required"));
    }
    for (i, address) in addresses.iter().enumerate() {
        if addresses[..i].contains(address) {
            return Err(ControlError::validation(format!(
                "coil address {} listed twice",
                address
            )));
        }
    }
    Ok(())
}

/// Reject empty sequences and steps outside `1..=coil_count`
pub fn validate_sequence(steps: &[usize], coil_count: usize) -> Result<(), ControlError> {
    if steps.is_empty() {
        return Err(ControlError::validation("sequence must contain at least one step"));
    }
    if let Some(bad) = steps.iter().find(|&&id| id == 0 || id > coil_count) {
        return Err(ControlError::validation(format!(
            "sequence step {} is outside 1..={}",
            bad, coil_count
        )));
    }
    Ok(())
}
