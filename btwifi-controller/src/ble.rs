//! btleplug backed radio and link
//!
//! Both halves run a driver task per resource and talk to the engine through
//! channels. The engine-facing types only queue requests, so every trait
//! method returns without awaiting the Bluetooth stack.

use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use btwifi_proto::registry::{CLIENT_CONFIGURATION_UUID, ENABLE_NOTIFICATIONS};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SetupError, TransportError};
use crate::scanner::PeerHandle;
use crate::transport::{
    Advertisement, DiscoveredCharacteristic, GattTransport, LinkId, RadioEvent, RadioPower,
    ScanRadio, TransportEvent,
};

pub type LinkEventSender = mpsc::UnboundedSender<(LinkId, TransportEvent)>;
pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;

/// Get a Bluetooth adapter, the first one whose name contains `filter` if given
pub async fn get_adapter(filter: Option<&str>) -> Result<Adapter, SetupError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    for adapter in adapters {
        let info = adapter.adapter_info().await.unwrap_or_default();
        match filter {
            Some(pattern) if !info.contains(pattern) => {
                debug!(adapter = %info, "skipping adapter");
            }
            _ => {
                info!(adapter = %info, "using bluetooth adapter");
                return Ok(adapter);
            }
        }
    }
    Err(SetupError::NoAdapter)
}

/// Current power state; adapters that cannot tell are assumed to be on
pub async fn radio_power(adapter: &Adapter) -> RadioPower {
    match adapter.adapter_state().await {
        Ok(CentralState::PoweredOff) => RadioPower::Off,
        Ok(_) => RadioPower::On,
        Err(error) => {
            debug!(%error, "adapter state unknown");
            RadioPower::On
        }
    }
}

#[derive(Debug)]
enum RadioCommand {
    Start(Uuid),
    Stop,
}

/// Scanning half of the adapter
pub struct BleRadio {
    commands: mpsc::UnboundedSender<RadioCommand>,
}

impl BleRadio {
    /// Spawn the radio driver; advertisements and power changes go to `events`
    pub fn spawn(adapter: Adapter, events: RadioEventSender) -> Self {
        let (commands, requests) = mpsc::unbounded_channel();
        tokio::spawn(drive_radio(adapter, requests, events));
        Self { commands }
    }
}

impl ScanRadio for BleRadio {
    fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError> {
        self.commands
            .send(RadioCommand::Start(service))
            .map_err(|_| TransportError::RadioUnavailable)
    }

    fn stop_scan(&mut self) {
        let _ = self.commands.send(RadioCommand::Stop);
    }
}

async fn drive_radio(
    adapter: Adapter,
    mut commands: mpsc::UnboundedReceiver<RadioCommand>,
    events: RadioEventSender,
) {
    let mut central = match adapter.events().await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, "cannot listen to adapter events");
            return;
        }
    };

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None => break,
                Some(RadioCommand::Start(service)) => {
                    let filter = ScanFilter { services: vec![service] };
                    if let Err(error) = adapter.start_scan(filter).await {
                        warn!(%error, "failed to start scan");
                    }
                }
                Some(RadioCommand::Stop) => {
                    if let Err(error) = adapter.stop_scan().await {
                        debug!(%error, "failed to stop scan cleanly");
                    }
                }
            },
            Some(event) = central.next() => match event {
                CentralEvent::StateUpdate(state) => {
                    let power = match state {
                        CentralState::PoweredOff => RadioPower::Off,
                        _ => RadioPower::On,
                    };
                    let _ = events.send(RadioEvent::PowerChanged(power));
                }
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ServicesAdvertisement { id, .. } => {
                    if let Some(advertisement) = advertisement(&adapter, &id).await {
                        let _ = events.send(RadioEvent::Advertisement(advertisement));
                    }
                }
                _ => {}
            },
        }
    }

    let _ = adapter.stop_scan().await;
}

async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    Some(Advertisement {
        address: properties.address.to_string(),
        name: properties.local_name,
        rssi: properties.rssi,
        services: properties.services,
    })
}

#[derive(Debug)]
enum LinkRequest {
    DiscoverServices,
    DiscoverDetails(Uuid),
    Write {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteDescriptor {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Disconnect,
}

/// Connection half of the adapter; one driver task per link
pub struct BleLink {
    adapter: Adapter,
    events: LinkEventSender,
    next_link: LinkId,
    requests: Option<mpsc::UnboundedSender<LinkRequest>>,
}

impl BleLink {
    pub fn new(adapter: Adapter, events: LinkEventSender) -> Self {
        Self {
            adapter,
            events,
            next_link: 0,
            requests: None,
        }
    }

    fn queue(&self, request: LinkRequest) -> Result<(), TransportError> {
        let requests = self.requests.as_ref().ok_or(TransportError::Closed)?;
        requests.send(request).map_err(|_| TransportError::Closed)
    }
}

impl GattTransport for BleLink {
    fn connect(&mut self, peer: &PeerHandle) -> Result<LinkId, TransportError> {
        self.disconnect();
        self.next_link += 1;
        let link = self.next_link;
        let (requests, receiver) = mpsc::unbounded_channel();
        self.requests = Some(requests);
        tokio::spawn(drive_link(
            self.adapter.clone(),
            peer.address.clone(),
            link,
            receiver,
            self.events.clone(),
        ));
        Ok(link)
    }

    fn disconnect(&mut self) {
        if let Some(requests) = self.requests.take() {
            let _ = requests.send(LinkRequest::Disconnect);
        }
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        self.queue(LinkRequest::DiscoverServices)
    }

    fn discover_details(&mut self, service: Uuid) -> Result<(), TransportError> {
        self.queue(LinkRequest::DiscoverDetails(service))
    }

    fn write_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.queue(LinkRequest::Write {
            service,
            characteristic,
            value: value.to_vec(),
        })
    }

    fn write_descriptor(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.queue(LinkRequest::WriteDescriptor {
            service,
            characteristic,
            descriptor,
            value: value.to_vec(),
        })
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Peripheral, TransportError> {
    for peripheral in adapter.peripherals().await? {
        if peripheral.address().to_string() == address {
            return Ok(peripheral);
        }
    }
    Err(TransportError::Link(format!("device {address} is no longer known to the adapter")))
}

async fn drive_link(
    adapter: Adapter,
    address: String,
    link: LinkId,
    mut requests: mpsc::UnboundedReceiver<LinkRequest>,
    events: LinkEventSender,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send((link, event));
    };

    let peripheral = match find_peripheral(&adapter, &address).await {
        Ok(peripheral) => peripheral,
        Err(error) => {
            emit(TransportEvent::Error(error.to_string()));
            return;
        }
    };
    if let Err(error) = peripheral.connect().await {
        emit(TransportEvent::Error(format!("connect failed: {error}")));
        return;
    }
    emit(TransportEvent::Connected);

    let streams = tokio::try_join!(peripheral.notifications(), adapter.events());
    let (mut notifications, mut central) = match streams {
        Ok(streams) => streams,
        Err(error) => {
            emit(TransportEvent::Error(error.to_string()));
            let _ = peripheral.disconnect().await;
            return;
        }
    };
    let id = peripheral.id();

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                None | Some(LinkRequest::Disconnect) => break,
                Some(request) => {
                    if let Err(error) = perform(&peripheral, request, &emit).await {
                        emit(TransportEvent::Error(error.to_string()));
                    }
                }
            },
            Some(notification) = notifications.next() => {
                emit(TransportEvent::CharacteristicChanged {
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
            Some(event) = central.next() => {
                if matches!(event, CentralEvent::DeviceDisconnected(ref gone) if *gone == id) {
                    emit(TransportEvent::Disconnected);
                    return;
                }
            }
        }
    }

    debug!(link, "closing link");
    if let Err(error) = peripheral.disconnect().await {
        debug!(%error, "failed to disconnect cleanly");
    }
}

async fn perform(
    peripheral: &Peripheral,
    request: LinkRequest,
    emit: &impl Fn(TransportEvent),
) -> Result<(), TransportError> {
    match request {
        LinkRequest::DiscoverServices => {
            peripheral.discover_services().await?;
            let services = peripheral.services().iter().map(|s| s.uuid).collect();
            emit(TransportEvent::ServicesDiscovered(services));
        }
        LinkRequest::DiscoverDetails(service) => {
            let Some(found) = peripheral.services().into_iter().find(|s| s.uuid == service) else {
                emit(TransportEvent::ServiceDetailsFailed {
                    service,
                    reason: "service not present".to_string(),
                });
                return Ok(());
            };
            let mut characteristics = Vec::new();
            for characteristic in &found.characteristics {
                characteristics.push(describe(peripheral, characteristic).await);
            }
            emit(TransportEvent::ServiceDetails { service, characteristics });
        }
        LinkRequest::Write { service, characteristic, value } => {
            let target = characteristic_of(peripheral, service, characteristic)?;
            peripheral.write(&target, &value, WriteType::WithResponse).await?;
        }
        LinkRequest::WriteDescriptor { service, characteristic, descriptor, value } => {
            let target = characteristic_of(peripheral, service, characteristic)?;
            if descriptor == CLIENT_CONFIGURATION_UUID && value == ENABLE_NOTIFICATIONS {
                peripheral.subscribe(&target).await?;
            } else {
                let found = target
                    .descriptors
                    .iter()
                    .find(|d| d.uuid == descriptor)
                    .ok_or_else(|| {
                        TransportError::Link(format!("descriptor {descriptor} not found"))
                    })?;
                peripheral.write_descriptor(found, &value).await?;
            }
        }
        LinkRequest::Disconnect => {}
    }
    Ok(())
}

async fn describe(
    peripheral: &Peripheral,
    characteristic: &Characteristic,
) -> DiscoveredCharacteristic {
    let mut discovered = DiscoveredCharacteristic::new(characteristic.uuid);
    if characteristic.properties.contains(CharPropFlags::READ) {
        match peripheral.read(characteristic).await {
            Ok(value) => discovered = discovered.with_value(value),
            Err(error) => debug!(uuid = %characteristic.uuid, %error, "initial read failed"),
        }
    }
    for descriptor in &characteristic.descriptors {
        discovered = discovered.with_descriptor(descriptor.uuid);
    }
    discovered
}

fn characteristic_of(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic && c.service_uuid == service)
        .ok_or_else(|| TransportError::Link(format!("characteristic {characteristic} not found")))
}
