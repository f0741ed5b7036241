//! Notifications emitted by the controller

use serde::Serialize;

use super::CoilId;
use crate::error::{ControlError, ErrorKind};

/// State-change notifications for whatever renders the panel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControllerEvent {
    CoilStateChanged {
        coil: CoilId,
        state: bool,
    },
    Error {
        coil: Option<CoilId>,
        kind: ErrorKind,
        message: String,
    },
    SequenceStateChanged {
        running: bool,
    },
}

impl ControllerEvent {
    pub fn error(err: &ControlError) -> Self {
        ControllerEvent::Error {
            coil: err.coil(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = ControllerEvent::CoilStateChanged {
            coil: 2,
            state: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "coil_state_changed");
        assert_eq!(json["coil"], 2);
        assert_eq!(json["state"], true);

        let json =
            serde_json::to_value(ControllerEvent::SequenceStateChanged { running: false })
                .unwrap();
        assert_eq!(json["event"], "sequence_state_changed");
        assert_eq!(json["running"], false);
    }

    #[test]
    fn test_error_event_from_fault() {
        let err = ControlError::Fault {
            coil: 1,
            address: 8192,
            reason: "timeout".to_string(),
        };

        match ControllerEvent::error(&err) {
            ControllerEvent::Error {
                coil,
                kind,
                message,
            } => {
                assert_eq!(coil, Some(1));
                assert_eq!(kind, ErrorKind::Fault);
                assert!(message.contains("8192"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
