//! btwifi wire protocol - GATT registry, message envelopes and framing
//!
//! Devices expose a handful of GATT services. Commands travel as compact JSON
//! objects terminated by a newline, split into 20 byte characteristic writes;
//! responses come back the same way as notifications and are reassembled per
//! channel before decoding.

pub mod channel;
pub mod codec;
pub mod reassembly;
pub mod registry;
pub mod wire;

pub use channel::{Channel, ChannelMap};
pub use codec::{chunk_frame, decode_response, encode_frame};
pub use reassembly::Reassembler;
pub use registry::{
    CharacteristicDescriptor, CharacteristicRole, Registry, ServiceDescriptor, ServiceKind,
};
pub use wire::{
    AccessPoint, CommandEnvelope, DeviceInformation, NetworkStatus, ResponseEnvelope,
    WifiCommand, WifiRequest, WifiResult, WirelessStatus,
};

/// Message terminator; a message is complete once a buffer ends with it
pub const TERMINATOR: u8 = b'\n';

/// Largest payload of a single characteristic write or notification
pub const MAX_CHUNK_LEN: usize = 20;

/// Sanity limit for a reassembled message
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Result code carried by every successful response
pub const RESULT_SUCCESS: i32 = 0;

/// Framing and decoding failures
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid message on {channel} channel: {source}")]
    Decode {
        channel: Channel,
        #[source]
        source: serde_json::Error,
    },
    #[error("message on {channel} channel exceeds {limit} bytes")]
    Oversized { channel: Channel, limit: usize },
}
