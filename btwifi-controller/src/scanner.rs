//! Discovery of provisioning-capable peripherals
//!
//! Scanning runs in cycles. A peer is reported at most once per cycle; when a
//! cycle ends every peer seen during it is replayed and, if the scan is still
//! wanted, the next cycle starts. A scan requested while the radio is off is
//! remembered and starts as soon as power comes back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use btwifi_proto::Registry;
use tracing::{debug, info, warn};

use crate::events::{EventSender, SetupEvent, emit};
use crate::models::DiscoveredPeers;
use crate::transport::{Advertisement, RadioPower, ScanRadio};

/// A discovered candidate device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub discovered_at: SystemTime,
}

impl PeerHandle {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: None,
            discovered_at: SystemTime::now(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

pub struct Scanner<R> {
    registry: Arc<Registry>,
    radio: R,
    power: RadioPower,
    /// Scan requested by the caller and not stopped since
    enabled: bool,
    discovering: bool,
    continuous: bool,
    cycle_len: Duration,
    cycle_deadline: Option<Instant>,
    seen_this_cycle: HashSet<String>,
    peers: DiscoveredPeers,
    events: EventSender,
}

impl<R: ScanRadio> Scanner<R> {
    pub fn new(
        registry: Arc<Registry>,
        radio: R,
        power: RadioPower,
        cycle_len: Duration,
        continuous: bool,
        events: EventSender,
    ) -> Self {
        Self {
            registry,
            radio,
            power,
            enabled: false,
            discovering: false,
            continuous,
            cycle_len,
            cycle_deadline: None,
            seen_this_cycle: HashSet::new(),
            peers: DiscoveredPeers::default(),
            events,
        }
    }

    pub fn start_scan(&mut self) {
        self.enabled = true;
        if self.power == RadioPower::Off {
            warn!("bluetooth radio is off, scan will start when it is powered on");
            return;
        }
        if self.discovering {
            return;
        }
        self.begin_cycle();
    }

    pub fn stop_scan(&mut self) {
        self.enabled = false;
        if self.discovering {
            self.radio.stop_scan();
        }
        self.cycle_deadline = None;
        self.set_discovering(false);
    }

    pub fn on_power_changed(&mut self, power: RadioPower) {
        if self.power == power {
            return;
        }
        debug!(?power, "radio power changed");
        self.power = power;

        match power {
            RadioPower::Off => {
                // the radio has stopped scanning on its own
                self.cycle_deadline = None;
                self.set_discovering(false);
            }
            RadioPower::On => {
                if self.enabled && !self.discovering {
                    info!("bluetooth available again, resuming scan");
                    self.begin_cycle();
                }
            }
        }
    }

    pub fn on_advertisement(&mut self, advertisement: Advertisement) {
        if !self.discovering {
            return;
        }
        if !advertisement.services.contains(&self.registry.advertised_service()) {
            return;
        }

        let peer = PeerHandle {
            address: advertisement.address,
            name: advertisement.name,
            rssi: advertisement.rssi,
            discovered_at: SystemTime::now(),
        };
        if self.peers.upsert(peer.clone()) {
            debug!(address = %peer.address, name = peer.display_name(), "new provisioning peer");
        }
        if self.seen_this_cycle.insert(peer.address.clone()) {
            emit(&self.events, SetupEvent::PeerFound(peer));
        }
    }

    /// End the cycle if its time is up
    pub fn poll(&mut self, now: Instant) {
        if self.cycle_deadline.is_some_and(|deadline| now >= deadline) {
            self.finish_cycle();
        }
    }

    pub fn finish_cycle(&mut self) {
        if !self.discovering {
            return;
        }
        debug!(peers = self.seen_this_cycle.len(), "scan cycle finished");
        self.radio.stop_scan();
        self.cycle_deadline = None;
        self.set_discovering(false);

        let found: Vec<_> = self
            .peers
            .iter()
            .filter(|p| self.seen_this_cycle.contains(&p.address))
            .cloned()
            .collect();
        emit(&self.events, SetupEvent::ScanCycleFinished(found));

        if !self.continuous {
            self.enabled = false;
            return;
        }
        if self.enabled {
            if self.power == RadioPower::Off {
                warn!("not restarting scan, bluetooth radio is off");
                return;
            }
            debug!("restarting scan");
            self.begin_cycle();
        }
    }

    fn begin_cycle(&mut self) {
        self.seen_this_cycle.clear();
        let service = self.registry.advertised_service();
        if let Err(error) = self.radio.start_scan(service) {
            warn!(%error, "failed to start scan");
            return;
        }
        info!(%service, "scanning for provisioning service");
        self.cycle_deadline = Instant::now().checked_add(self.cycle_len);
        if self.cycle_deadline.is_none() {
            warn!(
                cycle = ?self.cycle_len,
                "scan cycle too long to schedule, scanning until stopped"
            );
        }
        self.set_discovering(true);
    }

    fn set_discovering(&mut self, discovering: bool) {
        if self.discovering == discovering {
            return;
        }
        self.discovering = discovering;
        emit(&self.events, SetupEvent::DiscoveringChanged(discovering));
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn peers(&self) -> &DiscoveredPeers {
        &self.peers
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }
}
