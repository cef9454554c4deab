use btwifi_proto::{Channel, CharacteristicRole, FrameError, ServiceKind};

use crate::session::SessionStatus;

/// Failure of the physical link or radio
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("link is closed")]
    Closed,
    #[error("bluetooth radio is not available")]
    RadioUnavailable,
    #[error("{0}")]
    Link(String),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("no provisioning device found")]
    NoDevice,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("{0} channel is not ready")]
    NotReady(Channel),
    #[error("{channel} channel is still waiting for a response to command {pending}")]
    BusyChannel { channel: Channel, pending: i32 },
    #[error("cannot {operation} while {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },
    #[error("required {0} service not found on remote device")]
    MissingService(ServiceKind),
    #[error("required characteristics {missing:?} not found on {service} service")]
    MissingCharacteristics {
        service: ServiceKind,
        missing: Vec<CharacteristicRole>,
    },
    #[error("client has stopped")]
    ClientClosed,
}

impl From<btleplug::Error> for SetupError {
    fn from(error: btleplug::Error) -> Self {
        SetupError::Transport(TransportError::Bluetooth(error))
    }
}
