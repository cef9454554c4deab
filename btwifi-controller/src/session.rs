//! GATT session: connection lifecycle, service discovery and notification routing
//!
//! ```text
//! Disconnected -> ConnectingTransport -> DiscoveringServices -> ConnectedReady
//!        ^                 |                     |                    |
//!        +---- link lost / disconnect() ---------+--------------------+
//!                          +------ failure ------+---------> Error
//! ```
//!
//! The session owns the transport. Other components only ever see the
//! characteristic handles it hands out once a service is ready.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use btwifi_proto::registry::{CLIENT_CONFIGURATION_UUID, ENABLE_NOTIFICATIONS};
use btwifi_proto::{
    AccessPoint, Channel, CharacteristicRole, CommandEnvelope, DEFAULT_MAX_MESSAGE_LEN,
    DeviceInformation, MAX_CHUNK_LEN, NetworkStatus, Reassembler, Registry, ServiceKind,
    WifiCommand, WifiRequest, WirelessStatus, decode_response, wire,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::{Commander, Dispatcher, Outcome};
use crate::error::{SetupError, TransportError};
use crate::events::{EventSender, SetupEvent, emit};
use crate::models::AccessPoints;
use crate::scanner::PeerHandle;
use crate::service::{DiscoveryStatus, ServiceInput, ServiceState};
use crate::transport::{GattTransport, LinkId, RadioPower, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    ConnectingTransport,
    DiscoveringServices,
    ConnectedReady,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::ConnectingTransport => "connecting",
            SessionStatus::DiscoveringServices => "discovering services",
            SessionStatus::ConnectedReady => "connected",
            SessionStatus::Error => "in error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub max_chunk_len: usize,
    pub max_message_len: usize,
    pub command_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_chunk_len: MAX_CHUNK_LEN,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            command_timeout: None,
        }
    }
}

pub struct GattSession<T> {
    registry: Arc<Registry>,
    transport: T,
    status: SessionStatus,
    link: Option<LinkId>,
    services: Vec<ServiceState>,
    reassembler: Reassembler,
    dispatcher: Dispatcher,
    access_points: AccessPoints,
    device_information: DeviceInformation,
    events: EventSender,
}

impl<T: GattTransport> GattSession<T> {
    pub fn new(
        registry: Arc<Registry>,
        transport: T,
        options: SessionOptions,
        events: EventSender,
    ) -> Self {
        Self {
            registry,
            transport,
            status: SessionStatus::Disconnected,
            link: None,
            services: Vec::new(),
            reassembler: Reassembler::new(options.max_message_len),
            dispatcher: Dispatcher::new(options.command_timeout, options.max_chunk_len),
            access_points: AccessPoints::default(),
            device_information: DeviceInformation::default(),
            events,
        }
    }

    /// Start connecting to `peer`. Only allowed while disconnected or failed.
    pub fn connect(&mut self, peer: PeerHandle) -> Result<(), SetupError> {
        if !matches!(self.status, SessionStatus::Disconnected | SessionStatus::Error) {
            return Err(SetupError::InvalidState { operation: "connect", status: self.status });
        }

        self.teardown();
        self.access_points = AccessPoints::default();
        self.device_information = DeviceInformation::default();
        self.set_status(SessionStatus::Disconnected);

        info!(address = %peer.address, name = peer.display_name(), "connecting");
        self.set_status(SessionStatus::ConnectingTransport);
        match self.transport.connect(&peer) {
            Ok(link) => {
                self.link = Some(link);
                Ok(())
            }
            Err(error) => {
                warn!(%error, "failed to start connecting");
                self.fail();
                Err(error.into())
            }
        }
    }

    /// Explicit teardown; ends in `Disconnected`
    pub fn disconnect(&mut self) {
        if self.link.is_none() && self.status == SessionStatus::Disconnected {
            return;
        }
        info!("disconnecting");
        self.teardown();
        self.set_status(SessionStatus::Disconnected);
    }

    pub fn handle_transport_event(&mut self, link: LinkId, event: TransportEvent) {
        if self.link != Some(link) {
            debug!(link, ?event, "ignoring event from stale link");
            return;
        }

        match event {
            TransportEvent::Connected => {
                if self.status != SessionStatus::ConnectingTransport {
                    return;
                }
                info!("bluetooth connected");
                self.set_status(SessionStatus::DiscoveringServices);
                if let Err(error) = self.transport.discover_services() {
                    self.fail_transport(error);
                }
            }
            TransportEvent::Disconnected => {
                info!("bluetooth disconnected");
                self.link = None;
                self.reset_protocol_state();
                self.set_status(SessionStatus::Disconnected);
            }
            TransportEvent::Error(reason) => {
                warn!(%reason, "bluetooth error");
                self.fail();
            }
            TransportEvent::ServicesDiscovered(found) => {
                if self.status != SessionStatus::DiscoveringServices || !self.services.is_empty() {
                    return;
                }
                info!(services = found.len(), "service discovery finished");
                self.setup_services(&found);
            }
            TransportEvent::ServiceDetails { service, characteristics } => {
                self.advance_service(service, ServiceInput::DetailsDiscovered(characteristics));
            }
            TransportEvent::ServiceDetailsFailed { service, reason } => {
                warn!(%service, %reason, "service detail discovery failed");
                self.advance_service(service, ServiceInput::DetailsFailed);
            }
            TransportEvent::CharacteristicChanged { characteristic, value } => {
                self.on_characteristic_changed(characteristic, &value);
            }
        }
    }

    /// Losing radio power drops the link; reconnecting is up to the caller
    pub fn handle_radio_power(&mut self, power: RadioPower) {
        if power == RadioPower::Off && self.link.is_some() {
            warn!("bluetooth radio powered off, link lost");
            self.teardown();
            self.set_status(SessionStatus::Disconnected);
        }
    }

    /// Frame and queue a command on `channel`
    pub fn send(&mut self, channel: Channel, envelope: &CommandEnvelope) -> Result<(), SetupError> {
        let commander = self.commander(channel);
        let result =
            self.dispatcher.send(channel, envelope, commander, &mut self.transport, Instant::now());
        if let Err(SetupError::Transport(error)) = &result {
            warn!(%error, "failed to write command");
            self.fail();
        }
        result
    }

    pub fn request(&mut self, request: &WifiRequest) -> Result<(), SetupError> {
        self.send(Channel::Wifi, &request.to_envelope())
    }

    /// Expire commands that have waited too long for a response.
    ///
    /// A partial reply stays buffered: if the device is merely slow its tail
    /// still completes the message, which is then handled as unsolicited.
    pub fn poll_timeouts(&mut self, now: Instant) {
        for (channel, command) in self.dispatcher.expire(now) {
            warn!(%channel, command, "command timed out");
            emit(&self.events, SetupEvent::CommandTimedOut { channel, command });
        }
    }

    fn setup_services(&mut self, found: &[Uuid]) {
        let registry = Arc::clone(&self.registry);
        self.services = registry.services().map(ServiceState::new).collect();

        let mut transitions = Vec::new();
        for state in &mut self.services {
            let input = if found.contains(&state.uuid()) {
                ServiceInput::Found
            } else {
                ServiceInput::NotFound
            };
            if let Some(status) = state.advance(input, registry.service(state.kind())) {
                transitions.push((state.kind(), status));
            }
        }

        let missing = self
            .services
            .iter()
            .find(|s| s.is_mandatory() && s.status() == DiscoveryStatus::Unavailable)
            .map(ServiceState::kind);
        if let Some(kind) = missing {
            let error = SetupError::MissingService(kind);
            warn!(%error, "required services not found on remote device");
            self.fail();
            return;
        }

        for (kind, status) in transitions {
            if self.link.is_none() {
                return;
            }
            self.on_service_status(kind, status);
        }
    }

    fn advance_service(&mut self, uuid: Uuid, input: ServiceInput) {
        let Some(kind) = self.registry.service_kind(uuid) else {
            debug!(service = %uuid, "details for unknown service");
            return;
        };
        let registry = Arc::clone(&self.registry);
        let Some(state) = self.services.iter_mut().find(|s| s.kind() == kind) else {
            return;
        };
        if let Some(status) = state.advance(input, registry.service(kind)) {
            self.on_service_status(kind, status);
        }
    }

    /// Single dispatch point for every service transition
    fn on_service_status(&mut self, kind: ServiceKind, status: DiscoveryStatus) {
        debug!(service = %kind, ?status, "service state changed");
        emit(&self.events, SetupEvent::ServiceChanged { service: kind, status });

        match status {
            DiscoveryStatus::Pending => {}
            DiscoveryStatus::Discovering => {
                let uuid = self.registry.service(kind).uuid;
                if let Err(error) = self.transport.discover_details(uuid) {
                    self.fail_transport(error);
                }
            }
            DiscoveryStatus::Unavailable => {
                let Some(state) = self.service(kind) else {
                    return;
                };
                if !state.is_mandatory() {
                    info!(service = %kind, "optional service not available");
                    return;
                }
                let error = match state.missing() {
                    [] => SetupError::MissingService(kind),
                    missing => SetupError::MissingCharacteristics {
                        service: kind,
                        missing: missing.to_vec(),
                    },
                };
                warn!(%error, "required characteristics not found on remote device");
                self.fail();
            }
            DiscoveryStatus::Ready => {
                if let Err(error) = self.enable_notifications(kind) {
                    self.fail_transport(error);
                    return;
                }
                self.on_service_ready(kind);
            }
        }
    }

    fn enable_notifications(&mut self, kind: ServiceKind) -> Result<(), TransportError> {
        let registry = Arc::clone(&self.registry);
        let descriptor = registry.service(kind);
        let mut writes = Vec::new();
        if let Some(state) = self.service(kind) {
            for wanted in descriptor.notifying_characteristics() {
                let Some(found) = state.characteristic(wanted.role) else {
                    continue;
                };
                let descriptors = &found.descriptors;
                if !descriptors.is_empty() && !descriptors.contains(&CLIENT_CONFIGURATION_UUID) {
                    warn!(
                        characteristic = %found.uuid,
                        "no client configuration descriptor, notifications stay off"
                    );
                    continue;
                }
                writes.push(found.uuid);
            }
        }

        for characteristic in writes {
            debug!(service = %kind, %characteristic, "enabling notifications");
            self.transport.write_descriptor(
                descriptor.uuid,
                characteristic,
                CLIENT_CONFIGURATION_UUID,
                &ENABLE_NOTIFICATIONS,
            )?;
        }
        Ok(())
    }

    fn on_service_ready(&mut self, kind: ServiceKind) {
        let Some(state) = self.service(kind) else {
            return;
        };

        match kind {
            ServiceKind::DeviceInformation => {
                let info = DeviceInformation {
                    manufacturer: state.string_value(CharacteristicRole::Manufacturer),
                    model_number: state.string_value(CharacteristicRole::ModelNumber),
                    software_revision: state.string_value(CharacteristicRole::SoftwareRevision),
                    firmware_revision: state.string_value(CharacteristicRole::FirmwareRevision),
                    hardware_revision: state.string_value(CharacteristicRole::HardwareRevision),
                };
                info!(
                    manufacturer = %info.manufacturer,
                    model = %info.model_number,
                    "device information"
                );
                self.device_information = info.clone();
                emit(&self.events, SetupEvent::DeviceInformation(info));
            }
            ServiceKind::Network => {
                let status = NetworkStatus::from_value(state.value(CharacteristicRole::Status));
                let networking =
                    wire::decode_flag(state.value(CharacteristicRole::NetworkingEnabled));
                let wireless = wire::decode_flag(state.value(CharacteristicRole::WirelessEnabled));
                emit(&self.events, SetupEvent::NetworkStatus(status));
                emit(&self.events, SetupEvent::NetworkingEnabled(networking));
                emit(&self.events, SetupEvent::WirelessEnabled(wireless));
            }
            ServiceKind::Wifi => {
                let wireless = WirelessStatus::from_value(state.value(CharacteristicRole::Status));
                emit(&self.events, SetupEvent::WirelessStatus(wireless));
                if self.status == SessionStatus::DiscoveringServices {
                    self.set_status(SessionStatus::ConnectedReady);
                }
                if let Err(error) = self.request(&WifiRequest::GetNetworks) {
                    warn!(%error, "initial network listing not sent");
                }
            }
            ServiceKind::System => {
                debug!("system service ready");
            }
        }
    }

    fn on_characteristic_changed(&mut self, characteristic: Uuid, value: &[u8]) {
        match self.registry.lookup(characteristic) {
            Some((kind, CharacteristicRole::Response)) => match Channel::for_service(kind) {
                Some(channel) => self.on_response_chunk(channel, value),
                None => warn!(%characteristic, "response on a service without a channel"),
            },
            Some((ServiceKind::Network, CharacteristicRole::Status)) => {
                emit(&self.events, SetupEvent::NetworkStatus(NetworkStatus::from_value(value)));
            }
            Some((ServiceKind::Network, CharacteristicRole::NetworkingEnabled)) => {
                emit(&self.events, SetupEvent::NetworkingEnabled(wire::decode_flag(value)));
            }
            Some((ServiceKind::Network, CharacteristicRole::WirelessEnabled)) => {
                emit(&self.events, SetupEvent::WirelessEnabled(wire::decode_flag(value)));
            }
            Some((ServiceKind::Wifi, CharacteristicRole::Status)) => {
                emit(&self.events, SetupEvent::WirelessStatus(WirelessStatus::from_value(value)));
            }
            _ => warn!(%characteristic, "unhandled notification"),
        }
    }

    fn on_response_chunk(&mut self, channel: Channel, chunk: &[u8]) {
        let message = match self.reassembler.push(channel, chunk) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "dropping session");
                self.fail();
                return;
            }
        };

        let response = match decode_response(channel, &message) {
            Ok(response) => response,
            Err(error) => {
                let data = String::from_utf8_lossy(&message);
                warn!(%error, %data, "invalid json data received");
                self.fail();
                return;
            }
        };

        let outcome = self.dispatcher.handle_response(channel, response, &mut self.access_points);
        self.publish(outcome);
    }

    fn publish(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::AccessPoints { .. } => {
                emit(&self.events, SetupEvent::AccessPoints(self.access_points.to_vec()));
            }
            Outcome::CurrentConnection(access_point) => {
                emit(&self.events, SetupEvent::CurrentConnection(access_point));
            }
            Outcome::Completed { channel, command, payload } => {
                emit(&self.events, SetupEvent::CommandCompleted { channel, command, payload });
                if channel == Channel::Wifi && command == WifiCommand::Scan.code() {
                    if let Err(error) = self.request(&WifiRequest::GetNetworks) {
                        warn!(%error, "network listing after scan not sent");
                    }
                }
            }
            Outcome::Failed { channel, command, result } => {
                emit(&self.events, SetupEvent::CommandFailed { channel, command, result });
            }
        }
    }

    fn commander(&self, channel: Channel) -> Option<Commander> {
        let state = self.service(channel.service())?;
        let characteristic = state.characteristic(CharacteristicRole::Commander)?;
        Some(Commander { service: state.uuid(), characteristic: characteristic.uuid })
    }

    fn service(&self, kind: ServiceKind) -> Option<&ServiceState> {
        self.services.iter().find(|s| s.kind() == kind)
    }

    fn fail_transport(&mut self, error: TransportError) {
        warn!(%error, "transport failure");
        self.fail();
    }

    /// Drop the link and park in `Error` until the caller retries
    fn fail(&mut self) {
        self.teardown();
        self.set_status(SessionStatus::Error);
        emit(&self.events, SetupEvent::Error);
    }

    fn teardown(&mut self) {
        if self.link.take().is_some() {
            self.transport.disconnect();
        }
        self.reset_protocol_state();
    }

    fn reset_protocol_state(&mut self) {
        self.services.clear();
        self.reassembler.reset();
        self.dispatcher.reset();
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        debug!(from = %self.status, to = %status, "session status");
        self.status = status;
        emit(&self.events, SetupEvent::StatusChanged(status));
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn access_points(&self) -> &AccessPoints {
        &self.access_points
    }

    pub fn current_access_point(&self, ssid: &str) -> Option<&AccessPoint> {
        self.access_points.find(ssid)
    }

    pub fn device_information(&self) -> &DeviceInformation {
        &self.device_information
    }

    pub fn service_status(&self, kind: ServiceKind) -> Option<DiscoveryStatus> {
        self.service(kind).map(ServiceState::status)
    }

    pub fn pending(&self, channel: Channel) -> Option<i32> {
        self.dispatcher.pending(channel)
    }

    /// No partial message is buffered on any channel
    pub fn is_reassembly_idle(&self) -> bool {
        self.reassembler.is_idle()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use crate::models::ListModel;
    use crate::transport::DiscoveredCharacteristic;
    use btwifi_proto::registry::*;
    use btwifi_proto::{chunk_frame, encode_frame};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect(String),
        Disconnect,
        DiscoverServices,
        DiscoverDetails(Uuid),
        Write(Uuid, Vec<u8>),
        EnableNotify(Uuid),
    }

    #[derive(Default)]
    struct FakeTransport {
        next_link: LinkId,
        calls: Vec<Call>,
    }

    impl FakeTransport {
        fn commander_writes(&self, characteristic: Uuid) -> Vec<u8> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    Call::Write(uuid, value) if *uuid == characteristic => Some(value.clone()),
                    _ => None,
                })
                .flatten()
                .collect()
        }

        fn position(&self, call: &Call) -> Option<usize> {
            self.calls.iter().position(|c| c == call)
        }
    }

    impl GattTransport for FakeTransport {
        fn connect(&mut self, peer: &PeerHandle) -> Result<LinkId, TransportError> {
            self.next_link += 1;
            self.calls.push(Call::Connect(peer.address.clone()));
            Ok(self.next_link)
        }

        fn disconnect(&mut self) {
            self.calls.push(Call::Disconnect);
        }

        fn discover_services(&mut self) -> Result<(), TransportError> {
            self.calls.push(Call::DiscoverServices);
            Ok(())
        }

        fn discover_details(&mut self, service: Uuid) -> Result<(), TransportError> {
            self.calls.push(Call::DiscoverDetails(service));
            Ok(())
        }

        fn write_characteristic(
            &mut self,
            _service: Uuid,
            characteristic: Uuid,
            value: &[u8],
        ) -> Result<(), TransportError> {
            assert!(value.len() <= MAX_CHUNK_LEN);
            self.calls.push(Call::Write(characteristic, value.to_vec()));
            Ok(())
        }

        fn write_descriptor(
            &mut self,
            _service: Uuid,
            characteristic: Uuid,
            descriptor: Uuid,
            value: &[u8],
        ) -> Result<(), TransportError> {
            assert_eq!(descriptor, CLIENT_CONFIGURATION_UUID);
            assert_eq!(value, ENABLE_NOTIFICATIONS);
            self.calls.push(Call::EnableNotify(characteristic));
            Ok(())
        }
    }

    type Session = GattSession<FakeTransport>;

    fn session() -> (Session, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = SessionOptions {
            command_timeout: Some(Duration::from_secs(5)),
            ..SessionOptions::default()
        };
        let registry = Arc::new(Registry::standard());
        let session = GattSession::new(registry, FakeTransport::default(), options, tx);
        (session, rx)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<SetupEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn statuses(events: &[SetupEvent]) -> Vec<SessionStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                SetupEvent::StatusChanged(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn details(kind: ServiceKind) -> Vec<DiscoveredCharacteristic> {
        Registry::standard()
            .service(kind)
            .characteristics
            .iter()
            .map(|c| {
                let characteristic = DiscoveredCharacteristic::new(c.uuid)
                    .with_descriptor(CLIENT_CONFIGURATION_UUID);
                match c.role {
                    CharacteristicRole::Manufacturer => characteristic.with_value(&b"Acme"[..]),
                    CharacteristicRole::ModelNumber => characteristic.with_value(&b"Hub 2"[..]),
                    CharacteristicRole::Status if kind == ServiceKind::Network => {
                        characteristic.with_value([7])
                    }
                    CharacteristicRole::NetworkingEnabled => characteristic.with_value([1]),
                    _ => characteristic,
                }
            })
            .collect()
    }

    fn all_services() -> Vec<Uuid> {
        Registry::standard().services().map(|s| s.uuid).collect()
    }

    fn link(session: &Session) -> LinkId {
        session.transport().next_link
    }

    fn deliver(session: &mut Session, event: TransportEvent) {
        let link = link(session);
        session.handle_transport_event(link, event);
    }

    fn deliver_details(
        session: &mut Session,
        kind: ServiceKind,
        characteristics: Vec<DiscoveredCharacteristic>,
    ) {
        let service = Registry::standard().service(kind).uuid;
        deliver(session, TransportEvent::ServiceDetails { service, characteristics });
    }

    fn notify(session: &mut Session, characteristic: Uuid, message: &[u8]) {
        for chunk in chunk_frame(message, MAX_CHUNK_LEN) {
            let value = chunk.to_vec();
            deliver(session, TransportEvent::CharacteristicChanged { characteristic, value });
        }
    }

    fn ready_session() -> (Session, EventReceiver) {
        let (mut session, mut rx) = session();
        session.connect(PeerHandle::new("AA:BB:CC:DD:EE:FF")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        deliver(&mut session, TransportEvent::ServicesDiscovered(all_services()));
        for kind in ServiceKind::ALL {
            deliver_details(&mut session, kind, details(kind));
        }
        // answer the initial network listing
        notify(&mut session, WIFI_RESPONSE_UUID, b"{\"c\":0,\"r\":0,\"p\":[]}\n");
        drain(&mut rx);
        (session, rx)
    }

    #[test]
    fn handshake_reaches_ready_and_lists_networks() {
        let (mut session, mut rx) = session();
        session.connect(PeerHandle::new("AA:BB:CC:DD:EE:FF")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        deliver(&mut session, TransportEvent::ServicesDiscovered(all_services()));
        for kind in [ServiceKind::DeviceInformation, ServiceKind::Network, ServiceKind::System] {
            deliver_details(&mut session, kind, details(kind));
        }
        assert_eq!(session.status(), SessionStatus::DiscoveringServices);
        deliver_details(&mut session, ServiceKind::Wifi, details(ServiceKind::Wifi));

        let events = drain(&mut rx);
        assert_eq!(
            statuses(&events),
            vec![
                SessionStatus::ConnectingTransport,
                SessionStatus::DiscoveringServices,
                SessionStatus::ConnectedReady
            ]
        );
        assert!(events.contains(&SetupEvent::NetworkStatus(NetworkStatus::Global)));
        assert!(events.contains(&SetupEvent::NetworkingEnabled(true)));
        assert!(events.contains(&SetupEvent::WirelessEnabled(false)));
        assert_eq!(session.device_information().manufacturer, "Acme");

        let transport = session.transport();
        assert_eq!(transport.commander_writes(WIFI_COMMANDER_UUID), b"{\"c\":0}\n");
        let first_write = transport
            .calls
            .iter()
            .position(|c| matches!(c, Call::Write(..)))
            .unwrap();
        let notify_response = transport.position(&Call::EnableNotify(WIFI_RESPONSE_UUID)).unwrap();
        assert!(notify_response < first_write);
        assert!(transport.position(&Call::EnableNotify(WIFI_STATUS_UUID)).is_some());
        assert!(transport.position(&Call::EnableNotify(SYSTEM_RESPONSE_UUID)).is_some());
        assert!(transport.position(&Call::EnableNotify(NETWORK_STATUS_UUID)).is_some());
        assert_eq!(session.pending(Channel::Wifi), Some(0));
    }

    #[test]
    fn wifi_without_response_characteristic_is_fatal() {
        let (mut session, mut rx) = session();
        session.connect(PeerHandle::new("AA:01")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        deliver(&mut session, TransportEvent::ServicesDiscovered(all_services()));

        let mut wifi = details(ServiceKind::Wifi);
        wifi.retain(|c| c.uuid != WIFI_RESPONSE_UUID);
        deliver_details(&mut session, ServiceKind::Wifi, wifi);

        let events = drain(&mut rx);
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(!statuses(&events).contains(&SessionStatus::ConnectedReady));
        assert!(events.contains(&SetupEvent::Error));
        assert_eq!(session.transport().calls.last(), Some(&Call::Disconnect));

        // the dead link's late events change nothing
        deliver_details(&mut session, ServiceKind::Network, details(ServiceKind::Network));
        deliver(&mut session, TransportEvent::Disconnected);
        assert_eq!(session.status(), SessionStatus::Error);
    }

    #[test]
    fn failed_detail_discovery_of_a_mandatory_service_is_fatal() {
        let (mut session, mut rx) = session();
        session.connect(PeerHandle::new("AA:01")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        deliver(&mut session, TransportEvent::ServicesDiscovered(all_services()));
        deliver_details(&mut session, ServiceKind::Wifi, details(ServiceKind::Wifi));
        assert_eq!(session.status(), SessionStatus::ConnectedReady);

        let reason = "attribute read timed out".to_string();
        deliver(
            &mut session,
            TransportEvent::ServiceDetailsFailed { service: NETWORK_SERVICE_UUID, reason },
        );

        let events = drain(&mut rx);
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(events.contains(&SetupEvent::Error));
        assert!(events.contains(&SetupEvent::ServiceChanged {
            service: ServiceKind::Network,
            status: DiscoveryStatus::Unavailable,
        }));
        assert_eq!(session.transport().calls.last(), Some(&Call::Disconnect));
    }

    #[test]
    fn failed_detail_discovery_of_the_system_service_is_tolerated() {
        let (mut session, _rx) = session();
        session.connect(PeerHandle::new("AA:01")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        deliver(&mut session, TransportEvent::ServicesDiscovered(all_services()));
        let reason = "attribute read timed out".to_string();
        deliver(
            &mut session,
            TransportEvent::ServiceDetailsFailed { service: SYSTEM_SERVICE_UUID, reason },
        );
        deliver_details(&mut session, ServiceKind::Wifi, details(ServiceKind::Wifi));

        assert_eq!(session.status(), SessionStatus::ConnectedReady);
        assert_eq!(session.service_status(ServiceKind::System), Some(DiscoveryStatus::Unavailable));
    }

    #[test]
    fn missing_mandatory_service_aborts() {
        let (mut session, _rx) = session();
        session.connect(PeerHandle::new("AA:01")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        let found = vec![WIFI_SERVICE_UUID, DEVICE_INFORMATION_SERVICE_UUID];
        deliver(&mut session, TransportEvent::ServicesDiscovered(found));

        assert_eq!(session.status(), SessionStatus::Error);
        assert!(!session.transport().calls.iter().any(|c| matches!(c, Call::DiscoverDetails(_))));
    }

    #[test]
    fn optional_system_service_may_be_absent() {
        let (mut session, _rx) = session();
        session.connect(PeerHandle::new("AA:01")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        let found: Vec<_> =
            all_services().into_iter().filter(|s| *s != SYSTEM_SERVICE_UUID).collect();
        deliver(&mut session, TransportEvent::ServicesDiscovered(found));
        for kind in [ServiceKind::DeviceInformation, ServiceKind::Network, ServiceKind::Wifi] {
            deliver_details(&mut session, kind, details(kind));
        }

        assert_eq!(session.status(), SessionStatus::ConnectedReady);
        assert_eq!(session.service_status(ServiceKind::System), Some(DiscoveryStatus::Unavailable));
        let err = session.send(Channel::System, &CommandEnvelope::new(0)).unwrap_err();
        assert!(matches!(err, SetupError::NotReady(Channel::System)));
    }

    #[test]
    fn commands_before_wifi_is_ready_are_refused() {
        let (mut session, _rx) = session();
        session.connect(PeerHandle::new("AA:01")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        let err = session.request(&WifiRequest::Scan).unwrap_err();
        assert!(matches!(err, SetupError::NotReady(Channel::Wifi)));
    }

    #[test]
    fn link_loss_mid_handshake_disconnects() {
        let (mut session, mut rx) = session();
        session.connect(PeerHandle::new("AA:01")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        deliver(&mut session, TransportEvent::Disconnected);

        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(
            statuses(&drain(&mut rx)).last(),
            Some(&SessionStatus::Disconnected)
        );
    }

    #[test]
    fn connect_is_refused_while_a_session_is_active() {
        let (mut session, _rx) = ready_session();
        let err = session.connect(PeerHandle::new("AA:02")).unwrap_err();
        assert!(matches!(
            err,
            SetupError::InvalidState { status: SessionStatus::ConnectedReady, .. }
        ));
    }

    #[test]
    fn chunked_network_list_replaces_model() {
        let (mut session, mut rx) = ready_session();
        session.request(&WifiRequest::GetNetworks).unwrap();
        let first = json!({"c": 0, "r": 0, "p": [
            {"e": "alpha", "m": "aa:01", "s": 70, "p": true},
            {"e": "beta", "m": "aa:02", "s": 30, "p": false},
        ]});
        notify(&mut session, WIFI_RESPONSE_UUID, &encode_line(&first));
        assert_eq!(session.access_points().len(), 2);

        session.request(&WifiRequest::GetNetworks).unwrap();
        let second = json!({"c": 0, "r": 0, "p": [
            {"e": "gamma", "m": "aa:03", "s": 50, "p": true},
        ]});
        notify(&mut session, WIFI_RESPONSE_UUID, &encode_line(&second));
        assert_eq!(session.access_points().len(), 1);
        assert!(session.current_access_point("gamma").is_some());

        let published: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SetupEvent::AccessPoints(list) => Some(list.len()),
                _ => None,
            })
            .collect();
        assert_eq!(published, vec![2, 1]);
    }

    #[test]
    fn failed_command_keeps_session_connected() {
        let (mut session, mut rx) = ready_session();
        session
            .request(&WifiRequest::Connect { ssid: "home".into(), password: "wrong".into() })
            .unwrap();
        notify(&mut session, WIFI_RESPONSE_UUID, b"{\"c\":1,\"r\":2}\n");

        assert_eq!(session.status(), SessionStatus::ConnectedReady);
        assert!(drain(&mut rx).contains(&SetupEvent::CommandFailed {
            channel: Channel::Wifi,
            command: 1,
            result: 2
        }));
        assert_eq!(session.pending(Channel::Wifi), None);
    }

    #[test]
    fn successful_scan_is_followed_by_a_listing() {
        let (mut session, _rx) = ready_session();
        session.request(&WifiRequest::Scan).unwrap();
        notify(&mut session, WIFI_RESPONSE_UUID, b"{\"c\":4,\"r\":0}\n");
        assert_eq!(session.pending(Channel::Wifi), Some(WifiCommand::GetNetworks.code()));
    }

    #[test]
    fn malformed_message_drops_the_session() {
        let (mut session, mut rx) = ready_session();
        notify(&mut session, WIFI_RESPONSE_UUID, b"{\"c\":0,\"r\":\n");

        assert_eq!(session.status(), SessionStatus::Error);
        assert!(drain(&mut rx).contains(&SetupEvent::Error));
        assert_eq!(session.transport().calls.last(), Some(&Call::Disconnect));
    }

    #[test]
    fn disconnect_mid_message_leaves_no_buffer() {
        let (mut session, _rx) = ready_session();
        notify(&mut session, WIFI_RESPONSE_UUID, b"{\"c\":0,\"r\":0,\"p\":[{\"e\":");
        assert!(!session.is_reassembly_idle());

        session.disconnect();
        assert!(session.is_reassembly_idle());
        assert_eq!(session.pending(Channel::Wifi), None);
        assert_eq!(session.status(), SessionStatus::Disconnected);

        // the next connection starts with clean buffers
        session.connect(PeerHandle::new("AA:BB:CC:DD:EE:FF")).unwrap();
        deliver(&mut session, TransportEvent::Connected);
        deliver(&mut session, TransportEvent::ServicesDiscovered(all_services()));
        for kind in ServiceKind::ALL {
            deliver_details(&mut session, kind, details(kind));
        }
        notify(&mut session, WIFI_RESPONSE_UUID, b"{\"c\":0,\"r\":0,\"p\":[{\"e\":\"x\"}]}\n");
        assert_eq!(session.status(), SessionStatus::ConnectedReady);
        assert_eq!(session.access_points().len(), 1);
    }

    #[test]
    fn events_from_a_previous_link_are_ignored() {
        let (mut session, _rx) = ready_session();
        let old = link(&session);
        session.disconnect();
        session.connect(PeerHandle::new("AA:02")).unwrap();

        session.handle_transport_event(old, TransportEvent::Disconnected);
        assert_eq!(session.status(), SessionStatus::ConnectingTransport);
        session.handle_transport_event(old + 1, TransportEvent::Connected);
        assert_eq!(session.status(), SessionStatus::DiscoveringServices);
    }

    #[test]
    fn timed_out_command_frees_the_channel() {
        let (mut session, mut rx) = ready_session();
        session.request(&WifiRequest::GetConnection).unwrap();
        notify(&mut session, WIFI_RESPONSE_UUID, b"{\"c\":5,");

        session.poll_timeouts(Instant::now() + Duration::from_secs(6));
        assert_eq!(session.pending(Channel::Wifi), None);
        let timed_out = SetupEvent::CommandTimedOut { channel: Channel::Wifi, command: 5 };
        assert!(drain(&mut rx).contains(&timed_out));
        assert_eq!(session.status(), SessionStatus::ConnectedReady);
        session.request(&WifiRequest::Scan).unwrap();
    }

    #[test]
    fn slow_reply_completes_after_its_timeout() {
        let (mut session, mut rx) = ready_session();
        session.request(&WifiRequest::GetConnection).unwrap();
        let reply = encode_line(&json!({"c": 5, "r": 0, "p": {
            "e": "home", "m": "aa:01", "s": 60, "p": true, "i": "10.0.0.2",
        }}));
        let (head, tail) = reply.split_at(MAX_CHUNK_LEN);
        notify(&mut session, WIFI_RESPONSE_UUID, head);

        session.poll_timeouts(Instant::now() + Duration::from_secs(6));
        assert!(!session.is_reassembly_idle());
        notify(&mut session, WIFI_RESPONSE_UUID, tail);

        let events = drain(&mut rx);
        assert_eq!(session.status(), SessionStatus::ConnectedReady);
        assert!(!events.contains(&SetupEvent::Error));
        let connected = events.iter().find_map(|e| match e {
            SetupEvent::CurrentConnection(Some(ap)) => ap.host_address.as_deref(),
            _ => None,
        });
        assert_eq!(connected, Some("10.0.0.2"));
        assert!(session.is_reassembly_idle());
        assert_eq!(session.pending(Channel::Wifi), None);
    }

    #[test]
    fn status_notifications_are_decoded() {
        let (mut session, mut rx) = ready_session();
        deliver(
            &mut session,
            TransportEvent::CharacteristicChanged {
                characteristic: WIFI_STATUS_UUID,
                value: vec![10],
            },
        );
        deliver(
            &mut session,
            TransportEvent::CharacteristicChanged {
                characteristic: WIRELESS_ENABLED_UUID,
                value: vec![1],
            },
        );
        let events = drain(&mut rx);
        assert!(events.contains(&SetupEvent::WirelessStatus(WirelessStatus::Activated)));
        assert!(events.contains(&SetupEvent::WirelessEnabled(true)));
        assert!(session.is_reassembly_idle());
    }

    #[test]
    fn radio_power_loss_drops_the_link() {
        let (mut session, _rx) = ready_session();
        session.handle_radio_power(RadioPower::Off);
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(session.transport().calls.last(), Some(&Call::Disconnect));
    }

    fn encode_line(value: &serde_json::Value) -> Vec<u8> {
        let mut line = serde_json::to_vec(value).unwrap();
        line.push(b'\n');
        line
    }

    #[test]
    fn outbound_frames_match_the_codec() {
        let (mut session, _rx) = ready_session();
        let before = session.transport().commander_writes(WIFI_COMMANDER_UUID).len();
        let request = WifiRequest::Connect { ssid: "home".into(), password: "pw".into() };
        session.request(&request).unwrap();
        let written = session.transport().commander_writes(WIFI_COMMANDER_UUID);
        assert_eq!(&written[before..], encode_frame(&request.to_envelope()).unwrap().as_slice());
    }
}
