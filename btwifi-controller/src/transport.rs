//! Seams between the protocol engine and the Bluetooth stack
//!
//! Every method here only *issues* an operation and returns immediately. The
//! outcome arrives later as a [`TransportEvent`] or [`RadioEvent`] on the
//! client's event loop, so the engine itself never blocks.

use uuid::Uuid;

use crate::error::TransportError;
use crate::scanner::PeerHandle;

/// Identifies one physical connection attempt. Events from older links are stale.
pub type LinkId = u64;

/// Characteristic reported when a service's details have been discovered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    /// Value read during discovery (empty if the characteristic is not readable)
    pub value: Vec<u8>,
    pub descriptors: Vec<Uuid>,
}

impl DiscoveredCharacteristic {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, value: Vec::new(), descriptors: Vec::new() }
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error(String),
    ServicesDiscovered(Vec<Uuid>),
    ServiceDetails {
        service: Uuid,
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    ServiceDetailsFailed {
        service: Uuid,
        reason: String,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Connection to one peripheral, owned exclusively by the GATT session
pub trait GattTransport {
    /// Start connecting; any previous link is torn down first
    fn connect(&mut self, peer: &PeerHandle) -> Result<LinkId, TransportError>;

    fn disconnect(&mut self);

    fn discover_services(&mut self) -> Result<(), TransportError>;

    fn discover_details(&mut self, service: Uuid) -> Result<(), TransportError>;

    /// Queue one chunk; chunks are written strictly in the order they are queued
    fn write_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn write_descriptor(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioPower {
    Off,
    On,
}

/// One received advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    PowerChanged(RadioPower),
    Advertisement(Advertisement),
}

/// Scanning side of the local radio
pub trait ScanRadio {
    fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError>;

    fn stop_scan(&mut self);
}
