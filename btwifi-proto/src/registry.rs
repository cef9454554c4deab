//! GATT service and characteristic identifiers for btwifi devices
//!
//! The registry is plain data. It is built once (usually with
//! [`Registry::standard`]) and handed to the scanner and session, which never
//! mutate it.

use std::fmt;

use uuid::Uuid;

/// Advertised identifier of provisioning-capable devices (scan filter)
pub const PROVISIONING_SERVICE_UUID: Uuid = Uuid::from_u128(0x997936b5_d2cd_4c57_b41b_c6048320cd2b);

/// Client Characteristic Configuration descriptor (0x2902)
pub const CLIENT_CONFIGURATION_UUID: Uuid = bluetooth_uuid(0x2902);

/// Value written to the client configuration descriptor to enable notifications
pub const ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

// Standard device information service (0x180a)
pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid = bluetooth_uuid(0x180a);
pub const MODEL_NUMBER_UUID: Uuid = bluetooth_uuid(0x2a24);
pub const FIRMWARE_REVISION_UUID: Uuid = bluetooth_uuid(0x2a26);
pub const HARDWARE_REVISION_UUID: Uuid = bluetooth_uuid(0x2a27);
pub const SOFTWARE_REVISION_UUID: Uuid = bluetooth_uuid(0x2a28);
pub const MANUFACTURER_NAME_UUID: Uuid = bluetooth_uuid(0x2a29);

// Network service
pub const NETWORK_SERVICE_UUID: Uuid = Uuid::from_u128(0xef6d6610_b8af_49e0_9eca_ab343513641c);
pub const NETWORK_STATUS_UUID: Uuid = Uuid::from_u128(0xef6d6611_b8af_49e0_9eca_ab343513641c);
pub const NETWORK_COMMANDER_UUID: Uuid = Uuid::from_u128(0xef6d6612_b8af_49e0_9eca_ab343513641c);
pub const NETWORK_RESPONSE_UUID: Uuid = Uuid::from_u128(0xef6d6613_b8af_49e0_9eca_ab343513641c);
pub const NETWORKING_ENABLED_UUID: Uuid = Uuid::from_u128(0xef6d6614_b8af_49e0_9eca_ab343513641c);
pub const WIRELESS_ENABLED_UUID: Uuid = Uuid::from_u128(0xef6d6615_b8af_49e0_9eca_ab343513641c);

// Wifi service
pub const WIFI_SERVICE_UUID: Uuid = Uuid::from_u128(0xe081fec0_f757_4449_b9c9_bfa83133f7fc);
pub const WIFI_COMMANDER_UUID: Uuid = Uuid::from_u128(0xe081fec1_f757_4449_b9c9_bfa83133f7fc);
pub const WIFI_RESPONSE_UUID: Uuid = Uuid::from_u128(0xe081fec2_f757_4449_b9c9_bfa83133f7fc);
pub const WIFI_STATUS_UUID: Uuid = Uuid::from_u128(0xe081fec3_f757_4449_b9c9_bfa83133f7fc);

// System service (optional)
pub const SYSTEM_SERVICE_UUID: Uuid = Uuid::from_u128(0xe081fed0_f757_4449_b9c9_bfa83133f7fc);
pub const SYSTEM_COMMANDER_UUID: Uuid = Uuid::from_u128(0xe081fed1_f757_4449_b9c9_bfa83133f7fc);
pub const SYSTEM_RESPONSE_UUID: Uuid = Uuid::from_u128(0xe081fed2_f757_4449_b9c9_bfa83133f7fc);

/// Expand a 16-bit SIG assigned number onto the Bluetooth base UUID
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Logical services the session works with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    DeviceInformation,
    Network,
    Wifi,
    System,
}

impl ServiceKind {
    pub const COUNT: usize = 4;
    pub const ALL: [ServiceKind; ServiceKind::COUNT] = [
        ServiceKind::DeviceInformation,
        ServiceKind::Network,
        ServiceKind::Wifi,
        ServiceKind::System,
    ];

    pub fn index(self) -> usize {
        match self {
            ServiceKind::DeviceInformation => 0,
            ServiceKind::Network => 1,
            ServiceKind::Wifi => 2,
            ServiceKind::System => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::DeviceInformation => "device-info",
            ServiceKind::Network => "network",
            ServiceKind::Wifi => "wifi",
            ServiceKind::System => "system",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a characteristic is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CharacteristicRole {
    /// Raw status value (network or wireless state), notifiable
    Status,
    /// Write-only endpoint for framed commands
    Commander,
    /// Notifiable endpoint carrying framed responses
    Response,
    NetworkingEnabled,
    WirelessEnabled,
    Manufacturer,
    ModelNumber,
    SoftwareRevision,
    FirmwareRevision,
    HardwareRevision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub role: CharacteristicRole,
    pub uuid: Uuid,
    /// Service is unusable without it
    pub required: bool,
    /// Notifications are enabled once the service is ready
    pub notify: bool,
}

impl CharacteristicDescriptor {
    pub const fn required(role: CharacteristicRole, uuid: Uuid) -> Self {
        Self { role, uuid, required: true, notify: false }
    }

    pub const fn optional(role: CharacteristicRole, uuid: Uuid) -> Self {
        Self { role, uuid, required: false, notify: false }
    }

    pub const fn notifying(mut self) -> Self {
        self.notify = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub kind: ServiceKind,
    pub uuid: Uuid,
    /// Session aborts if the service or one of its required characteristics is absent
    pub mandatory: bool,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn characteristic(&self, role: CharacteristicRole) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.role == role)
    }

    pub fn required_characteristics(&self) -> impl Iterator<Item = &CharacteristicDescriptor> {
        self.characteristics.iter().filter(|c| c.required)
    }

    pub fn notifying_characteristics(&self) -> impl Iterator<Item = &CharacteristicDescriptor> {
        self.characteristics.iter().filter(|c| c.notify)
    }
}

/// Immutable table of every service the client knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    advertised_service: Uuid,
    services: [ServiceDescriptor; ServiceKind::COUNT],
}

impl Registry {
    /// Build a registry; `services` must be given in [`ServiceKind::ALL`] order
    pub fn new(
        advertised_service: Uuid,
        services: [ServiceDescriptor; ServiceKind::COUNT],
    ) -> Self {
        debug_assert!(
            services
                .iter()
                .zip(ServiceKind::ALL)
                .all(|(descriptor, kind)| descriptor.kind == kind),
            "service descriptors out of order"
        );
        Self { advertised_service, services }
    }

    /// Identifiers used by btwifi device firmware
    pub fn standard() -> Self {
        use CharacteristicRole::*;

        Self::new(
            PROVISIONING_SERVICE_UUID,
            [
                ServiceDescriptor {
                    kind: ServiceKind::DeviceInformation,
                    uuid: DEVICE_INFORMATION_SERVICE_UUID,
                    mandatory: true,
                    characteristics: [
                        (Manufacturer, MANUFACTURER_NAME_UUID),
                        (ModelNumber, MODEL_NUMBER_UUID),
                        (SoftwareRevision, SOFTWARE_REVISION_UUID),
                        (FirmwareRevision, FIRMWARE_REVISION_UUID),
                        (HardwareRevision, HARDWARE_REVISION_UUID),
                    ]
                    .into_iter()
                    .map(|(role, uuid)| CharacteristicDescriptor::optional(role, uuid))
                    .collect(),
                },
                ServiceDescriptor {
                    kind: ServiceKind::Network,
                    uuid: NETWORK_SERVICE_UUID,
                    mandatory: true,
                    characteristics: vec![
                        CharacteristicDescriptor::required(Status, NETWORK_STATUS_UUID).notifying(),
                        CharacteristicDescriptor::required(
                            NetworkingEnabled,
                            NETWORKING_ENABLED_UUID,
                        )
                        .notifying(),
                        CharacteristicDescriptor::required(WirelessEnabled, WIRELESS_ENABLED_UUID)
                            .notifying(),
                        // no command set is defined for the network channel
                        CharacteristicDescriptor::optional(Commander, NETWORK_COMMANDER_UUID),
                        CharacteristicDescriptor::optional(Response, NETWORK_RESPONSE_UUID),
                    ],
                },
                ServiceDescriptor {
                    kind: ServiceKind::Wifi,
                    uuid: WIFI_SERVICE_UUID,
                    mandatory: true,
                    characteristics: vec![
                        CharacteristicDescriptor::required(Commander, WIFI_COMMANDER_UUID),
                        CharacteristicDescriptor::required(Response, WIFI_RESPONSE_UUID)
                            .notifying(),
                        CharacteristicDescriptor::required(Status, WIFI_STATUS_UUID).notifying(),
                    ],
                },
                ServiceDescriptor {
                    kind: ServiceKind::System,
                    uuid: SYSTEM_SERVICE_UUID,
                    mandatory: false,
                    characteristics: vec![
                        CharacteristicDescriptor::required(Commander, SYSTEM_COMMANDER_UUID),
                        CharacteristicDescriptor::required(Response, SYSTEM_RESPONSE_UUID)
                            .notifying(),
                    ],
                },
            ],
        )
    }

    pub fn advertised_service(&self) -> Uuid {
        self.advertised_service
    }

    pub fn service(&self, kind: ServiceKind) -> &ServiceDescriptor {
        &self.services[kind.index()]
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    pub fn service_kind(&self, uuid: Uuid) -> Option<ServiceKind> {
        self.services.iter().find(|s| s.uuid == uuid).map(|s| s.kind)
    }

    pub fn characteristic(
        &self,
        kind: ServiceKind,
        role: CharacteristicRole,
    ) -> Option<&CharacteristicDescriptor> {
        self.service(kind).characteristic(role)
    }

    /// Find which service and role a characteristic identifier belongs to
    pub fn lookup(&self, characteristic: Uuid) -> Option<(ServiceKind, CharacteristicRole)> {
        self.services.iter().find_map(|service| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == characteristic)
                .map(|c| (service.kind, c.role))
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}
