//! Discovery state machine of a single GATT service

use std::collections::BTreeMap;

use btwifi_proto::{CharacteristicRole, ServiceDescriptor, ServiceKind};
use uuid::Uuid;

use crate::transport::DiscoveredCharacteristic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    Pending,
    Discovering,
    Ready,
    Unavailable,
}

/// Inputs that drive a service through discovery
#[derive(Debug)]
pub enum ServiceInput {
    /// Service is present on the peripheral
    Found,
    /// Service is absent from the peripheral
    NotFound,
    DetailsDiscovered(Vec<DiscoveredCharacteristic>),
    DetailsFailed,
}

#[derive(Debug, Clone)]
pub struct ServiceState {
    kind: ServiceKind,
    uuid: Uuid,
    mandatory: bool,
    status: DiscoveryStatus,
    characteristics: BTreeMap<CharacteristicRole, DiscoveredCharacteristic>,
    missing: Vec<CharacteristicRole>,
}

impl ServiceState {
    pub fn new(descriptor: &ServiceDescriptor) -> Self {
        Self {
            kind: descriptor.kind,
            uuid: descriptor.uuid,
            mandatory: descriptor.mandatory,
            status: DiscoveryStatus::Pending,
            characteristics: BTreeMap::new(),
            missing: Vec::new(),
        }
    }

    /// Apply an input; returns the new status if it changed.
    ///
    /// A service only becomes `Ready` once every required characteristic of
    /// `descriptor` has been seen.
    pub fn advance(
        &mut self,
        input: ServiceInput,
        descriptor: &ServiceDescriptor,
    ) -> Option<DiscoveryStatus> {
        let next = match (self.status, input) {
            (DiscoveryStatus::Pending, ServiceInput::Found) => DiscoveryStatus::Discovering,
            (DiscoveryStatus::Pending, ServiceInput::NotFound) => DiscoveryStatus::Unavailable,
            (DiscoveryStatus::Discovering, ServiceInput::DetailsDiscovered(found)) => {
                self.collect(found, descriptor)
            }
            (DiscoveryStatus::Discovering, ServiceInput::DetailsFailed) => {
                DiscoveryStatus::Unavailable
            }
            _ => return None,
        };
        self.status = next;
        Some(next)
    }

    fn collect(
        &mut self,
        found: Vec<DiscoveredCharacteristic>,
        descriptor: &ServiceDescriptor,
    ) -> DiscoveryStatus {
        for characteristic in found {
            let known = descriptor.characteristics.iter().find(|c| c.uuid == characteristic.uuid);
            if let Some(known) = known {
                self.characteristics.insert(known.role, characteristic);
            }
        }
        self.missing = descriptor
            .required_characteristics()
            .filter(|c| !self.characteristics.contains_key(&c.role))
            .map(|c| c.role)
            .collect();

        if self.missing.is_empty() {
            DiscoveryStatus::Ready
        } else {
            DiscoveryStatus::Unavailable
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == DiscoveryStatus::Ready
    }

    /// Required characteristics that were not found
    pub fn missing(&self) -> &[CharacteristicRole] {
        &self.missing
    }

    /// Handle of a characteristic, only handed out once the service is ready
    pub fn characteristic(&self, role: CharacteristicRole) -> Option<&DiscoveredCharacteristic> {
        if !self.is_ready() {
            return None;
        }
        self.characteristics.get(&role)
    }

    /// Value read during discovery, empty if unknown
    pub fn value(&self, role: CharacteristicRole) -> &[u8] {
        self.characteristic(role).map(|c| c.value.as_slice()).unwrap_or_default()
    }

    pub fn string_value(&self, role: CharacteristicRole) -> String {
        String::from_utf8_lossy(self.value(role)).into_owned()
    }
}
