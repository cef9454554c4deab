//! Events published by the engine to its caller

use btwifi_proto::{
    AccessPoint, Channel, DeviceInformation, NetworkStatus, ServiceKind, WirelessStatus,
};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::scanner::PeerHandle;
use crate::service::DiscoveryStatus;
use crate::session::SessionStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum SetupEvent {
    DiscoveringChanged(bool),
    PeerFound(PeerHandle),
    /// Every peer seen during the finished cycle, for listeners that attached late
    ScanCycleFinished(Vec<PeerHandle>),
    StatusChanged(SessionStatus),
    ServiceChanged {
        service: ServiceKind,
        status: DiscoveryStatus,
    },
    DeviceInformation(DeviceInformation),
    NetworkStatus(NetworkStatus),
    NetworkingEnabled(bool),
    WirelessEnabled(bool),
    WirelessStatus(WirelessStatus),
    AccessPoints(Vec<AccessPoint>),
    CurrentConnection(Option<AccessPoint>),
    CommandCompleted {
        channel: Channel,
        command: i32,
        payload: Option<Value>,
    },
    CommandFailed {
        channel: Channel,
        command: i32,
        result: i32,
    },
    CommandTimedOut {
        channel: Channel,
        command: i32,
    },
    /// Something went wrong; details are only logged
    Error,
}

pub type EventSender = mpsc::UnboundedSender<SetupEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SetupEvent>;

pub(crate) fn emit(events: &EventSender, event: SetupEvent) {
    // nobody listening is not an error
    let _ = events.send(event);
}
