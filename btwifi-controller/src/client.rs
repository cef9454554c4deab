//! The client event loop
//!
//! All engine state lives on one task. Callers talk to it through a
//! [`ClientHandle`]; Bluetooth outcomes, radio events and the housekeeping
//! tick are multiplexed into the same loop, so no state is ever shared.

use std::sync::Arc;
use std::time::{Duration, Instant};

use btwifi_proto::{Channel, CommandEnvelope, Registry, WifiRequest};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::ble::{self, BleLink, BleRadio};
use crate::config::SetupConfig;
use crate::error::SetupError;
use crate::events::{EventReceiver, EventSender};
use crate::scanner::{PeerHandle, Scanner};
use crate::session::GattSession;
use crate::transport::{GattTransport, LinkId, RadioEvent, RadioPower, ScanRadio, TransportEvent};

type Reply = oneshot::Sender<Result<(), SetupError>>;

#[derive(Debug)]
enum ClientRequest {
    StartScan,
    StopScan,
    Connect { peer: PeerHandle, reply: Reply },
    Disconnect,
    Send { channel: Channel, envelope: CommandEnvelope, reply: Reply },
    Shutdown,
}

/// Cheap, cloneable front door to a running [`Client`]
#[derive(Debug, Clone)]
pub struct ClientHandle {
    requests: mpsc::UnboundedSender<ClientRequest>,
}

impl ClientHandle {
    pub fn start_scan(&self) -> Result<(), SetupError> {
        self.post(ClientRequest::StartScan)
    }

    pub fn stop_scan(&self) -> Result<(), SetupError> {
        self.post(ClientRequest::StopScan)
    }

    /// Resolves once the connection attempt has started, not when it is ready
    pub async fn connect(&self, peer: PeerHandle) -> Result<(), SetupError> {
        let (reply, result) = oneshot::channel();
        self.post(ClientRequest::Connect { peer, reply })?;
        result.await.map_err(|_| SetupError::ClientClosed)?
    }

    pub fn disconnect(&self) -> Result<(), SetupError> {
        self.post(ClientRequest::Disconnect)
    }

    /// Resolves once the command is written; the answer arrives as an event
    pub async fn send(
        &self,
        channel: Channel,
        envelope: CommandEnvelope,
    ) -> Result<(), SetupError> {
        let (reply, result) = oneshot::channel();
        self.post(ClientRequest::Send { channel, envelope, reply })?;
        result.await.map_err(|_| SetupError::ClientClosed)?
    }

    pub async fn request(&self, request: WifiRequest) -> Result<(), SetupError> {
        self.send(Channel::Wifi, request.to_envelope()).await
    }

    pub fn shutdown(&self) {
        let _ = self.requests.send(ClientRequest::Shutdown);
    }

    fn post(&self, request: ClientRequest) -> Result<(), SetupError> {
        self.requests.send(request).map_err(|_| SetupError::ClientClosed)
    }
}

pub struct Client<T, R> {
    scanner: Scanner<R>,
    session: GattSession<T>,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
    link_events: mpsc::UnboundedReceiver<(LinkId, TransportEvent)>,
    radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    tick: Duration,
}

impl<T: GattTransport, R: ScanRadio> Client<T, R> {
    pub fn new(
        config: &SetupConfig,
        transport: T,
        radio: R,
        power: RadioPower,
        link_events: mpsc::UnboundedReceiver<(LinkId, TransportEvent)>,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        events: EventSender,
    ) -> (Self, ClientHandle) {
        let registry = Arc::new(Registry::standard());
        let scanner = Scanner::new(
            Arc::clone(&registry),
            radio,
            power,
            config.scan_cycle(),
            config.continuous_scan,
            events.clone(),
        );
        let session = GattSession::new(registry, transport, config.session_options(), events);
        let (requests, receiver) = mpsc::unbounded_channel();
        let client = Self {
            scanner,
            session,
            requests: receiver,
            link_events,
            radio_events,
            tick: config.tick(),
        };
        (client, ClientHandle { requests })
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    None | Some(ClientRequest::Shutdown) => break,
                    Some(request) => self.handle_request(request),
                },
                Some((link, event)) = self.link_events.recv() => {
                    self.session.handle_transport_event(link, event);
                }
                Some(event) = self.radio_events.recv() => match event {
                    RadioEvent::PowerChanged(power) => {
                        self.scanner.on_power_changed(power);
                        self.session.handle_radio_power(power);
                    }
                    RadioEvent::Advertisement(advertisement) => {
                        self.scanner.on_advertisement(advertisement);
                    }
                },
                _ = tick.tick() => {
                    let now = Instant::now();
                    self.scanner.poll(now);
                    self.session.poll_timeouts(now);
                }
            }
        }

        info!("client stopping");
        self.scanner.stop_scan();
        self.session.disconnect();
    }

    fn handle_request(&mut self, request: ClientRequest) {
        debug!(?request, "client request");
        match request {
            ClientRequest::StartScan => self.scanner.start_scan(),
            ClientRequest::StopScan => self.scanner.stop_scan(),
            ClientRequest::Connect { peer, reply } => {
                // connecting and scanning share the radio
                self.scanner.stop_scan();
                let _ = reply.send(self.session.connect(peer));
            }
            ClientRequest::Disconnect => self.session.disconnect(),
            ClientRequest::Send { channel, envelope, reply } => {
                let _ = reply.send(self.session.send(channel, &envelope));
            }
            ClientRequest::Shutdown => {}
        }
    }
}

impl Client<BleLink, BleRadio> {
    /// Client on the configured Bluetooth adapter, plus the event stream
    pub async fn bluetooth(
        config: &SetupConfig,
    ) -> Result<(Self, ClientHandle, EventReceiver), SetupError> {
        let adapter = ble::get_adapter(config.adapter.as_deref()).await?;
        let power = ble::radio_power(&adapter).await;
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (radio_tx, radio_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let transport = BleLink::new(adapter.clone(), link_tx);
        let radio = BleRadio::spawn(adapter, radio_tx);
        let (client, handle) =
            Client::new(config, transport, radio, power, link_rx, radio_rx, events_tx);
        Ok((client, handle, events_rx))
    }
}
