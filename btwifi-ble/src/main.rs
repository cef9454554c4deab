//! BLE WiFi provisioning tool for btwifi devices
//!
//! Scans for provisioning peripherals, lists the networks they can see and
//! sends WiFi credentials to them.

use std::time::Duration;

use btwifi_controller::{
    Client, ClientHandle, DiscoveredPeers, EventReceiver, ListModel, PeerHandle, SessionStatus,
    SetupConfig, SetupError, SetupEvent,
};
use btwifi_proto::{
    AccessPoint, DeviceInformation, NetworkStatus, WifiCommand, WifiRequest, WifiResult,
    WirelessStatus,
};
use clap::{Parser, Subcommand};
use tokio::time::{Instant, timeout_at};
use tracing::debug;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(name = "btwifi")]
#[command(about = "BLE WiFi provisioning tool for btwifi devices")]
struct Cli {
    /// Log protocol details
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Bluetooth adapter to use (substring of its name)
    #[arg(long, global = true)]
    adapter: Option<String>,
    /// Seconds to wait for the device and its answers
    #[arg(short, long, global = true, default_value = "30")]
    wait: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for provisioning devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
    /// List the WiFi networks a device can see
    Networks {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// Ask the device to rescan first
        #[arg(long)]
        rescan: bool,
    },
    /// Send WiFi credentials to a device
    Connect {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, default_value = "wifi_credentials.txt")]
        file: String,
        /// The network does not broadcast its SSID
        #[arg(long)]
        hidden: bool,
    },
    /// Make a device leave its current WiFi network
    DisconnectWifi {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Show device information and connection state
    Info {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = SetupConfig::load()?;
    if cli.adapter.is_some() {
        config.adapter = cli.adapter.clone();
    }
    // every command looks for devices during one scan cycle only
    config.continuous_scan = false;
    if let Commands::Scan { duration } = cli.command {
        config.scan_cycle_secs = duration;
    }

    let (client, handle, events) = Client::bluetooth(&config).await?;
    let task = tokio::spawn(client.run());
    let mut tool = Tool {
        handle,
        events,
        wait: Duration::from_secs(cli.wait),
    };

    let result = match cli.command {
        Commands::Scan { .. } => tool.scan().await,
        Commands::Networks { device, rescan } => tool.networks(device.as_deref(), rescan).await,
        Commands::Connect { device, file, hidden } => {
            let (ssid, password) = read_wifi_credentials(&file)?;
            tool.connect_wifi(device.as_deref(), ssid, password, hidden).await
        }
        Commands::DisconnectWifi { device } => tool.disconnect_wifi(device.as_deref()).await,
        Commands::Info { device } => tool.info(device.as_deref()).await,
    };

    tool.handle.shutdown();
    let _ = task.await;
    result
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn read_wifi_credentials(file: &str) -> Result<(String, String), BoxError> {
    debug!(file, "reading credentials");
    let content = std::fs::read_to_string(file)?;
    let mut lines = content.lines();
    let ssid = lines.next().ok_or("Missing SSID in credentials file")?.trim().to_string();
    let password = lines.next().unwrap_or_default().trim().to_string();
    Ok((ssid, password))
}

fn print_access_points(list: &[AccessPoint]) {
    println!("\nFound {} networks:", list.len());
    for ap in list {
        let lock = if ap.protected { " [protected]" } else { "" };
        println!("  {} ({}) signal: {}%{}", ap.ssid, ap.mac_address, ap.signal_strength, lock);
    }
}

/// What a freshly opened session has reported
struct Opened {
    peer: PeerHandle,
    access_points: Vec<AccessPoint>,
    device: Option<DeviceInformation>,
    network: Option<NetworkStatus>,
    wireless: Option<WirelessStatus>,
}

struct Tool {
    handle: ClientHandle,
    events: EventReceiver,
    wait: Duration,
}

impl Tool {
    async fn next_event(&mut self, deadline: Instant) -> Result<SetupEvent, BoxError> {
        match timeout_at(deadline, self.events.recv()).await {
            Ok(Some(SetupEvent::Error)) => {
                Err("device session failed (run with --verbose for details)".into())
            }
            Ok(Some(SetupEvent::StatusChanged(SessionStatus::Disconnected))) => {
                Err("device disconnected".into())
            }
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err("client stopped".into()),
            Err(_) => Err("timed out waiting for the device".into()),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.wait
    }

    async fn scan(&mut self) -> Result<(), BoxError> {
        println!("Scanning for provisioning devices...");
        self.handle.start_scan()?;
        loop {
            match self.events.recv().await {
                Some(SetupEvent::PeerFound(peer)) => {
                    let rssi =
                        peer.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "N/A".to_string());
                    println!("  {} ({}) RSSI: {}", peer.display_name(), peer.address, rssi);
                }
                Some(SetupEvent::ScanCycleFinished(peers)) => {
                    println!("\nFound {} devices", peers.len());
                    return Ok(());
                }
                Some(_) => {}
                None => return Err("client stopped".into()),
            }
        }
    }

    /// Find a device, connect and wait for the first network listing
    async fn open(&mut self, target: Option<&str>) -> Result<Opened, BoxError> {
        let deadline = self.deadline();
        println!("Scanning for provisioning devices...");
        self.handle.start_scan()?;

        let mut seen = DiscoveredPeers::default();
        let peer = loop {
            match self.next_event(deadline).await? {
                SetupEvent::PeerFound(peer) => {
                    seen.upsert(peer);
                    if let Some(peer) = pick_device(&seen, target) {
                        break peer.clone();
                    }
                }
                SetupEvent::ScanCycleFinished(_) => return Err(SetupError::NoDevice.into()),
                _ => {}
            }
        };
        println!("Found device: {} ({})", peer.display_name(), peer.address);

        println!("Connecting...");
        self.handle.connect(peer.clone()).await?;
        let mut opened = Opened {
            peer,
            access_points: Vec::new(),
            device: None,
            network: None,
            wireless: None,
        };
        loop {
            match self.next_event(deadline).await? {
                SetupEvent::StatusChanged(SessionStatus::ConnectedReady) => println!("Connected!"),
                SetupEvent::DeviceInformation(info) => opened.device = Some(info),
                SetupEvent::NetworkStatus(status) => opened.network = Some(status),
                SetupEvent::WirelessStatus(status) => opened.wireless = Some(status),
                SetupEvent::AccessPoints(list) => {
                    opened.access_points = list;
                    return Ok(opened);
                }
                SetupEvent::CommandFailed { command, result, .. }
                    if command == WifiCommand::GetNetworks.code() =>
                {
                    let reason = WifiResult::from_code(result);
                    return Err(format!("device cannot list networks: {reason}").into());
                }
                SetupEvent::CommandTimedOut { .. } => return Err("device did not answer".into()),
                _ => {}
            }
        }
    }

    /// Send `request` and wait for its completion
    async fn run_command(&mut self, request: WifiRequest) -> Result<SetupEvent, BoxError> {
        let command = request.command().code();
        self.handle.request(request).await?;
        let deadline = self.deadline();
        loop {
            match self.next_event(deadline).await? {
                SetupEvent::CommandFailed { command: failed, result, .. } if failed == command => {
                    return Err(format!("command failed: {}", WifiResult::from_code(result)).into());
                }
                SetupEvent::CommandTimedOut { command: expired, .. } if expired == command => {
                    return Err("device did not answer".into());
                }
                event @ SetupEvent::CommandCompleted { command: done, .. } if done == command => {
                    return Ok(event);
                }
                event @ (SetupEvent::AccessPoints(_) | SetupEvent::CurrentConnection(_)) => {
                    return Ok(event);
                }
                _ => {}
            }
        }
    }

    async fn networks(&mut self, target: Option<&str>, rescan: bool) -> Result<(), BoxError> {
        let mut list = self.open(target).await?.access_points;
        if rescan {
            println!("Rescanning...");
            self.run_command(WifiRequest::Scan).await?;
            // a successful scan is followed by a fresh listing
            let deadline = self.deadline();
            list = loop {
                if let SetupEvent::AccessPoints(list) = self.next_event(deadline).await? {
                    break list;
                }
            };
        }
        print_access_points(&list);
        Ok(())
    }

    async fn connect_wifi(
        &mut self,
        target: Option<&str>,
        ssid: String,
        password: String,
        hidden: bool,
    ) -> Result<(), BoxError> {
        let list = self.open(target).await?.access_points;
        if !hidden && !list.iter().any(|ap| ap.ssid == ssid) {
            println!("Warning: {ssid} is not in the device's network list");
        }

        println!("Sending WiFi credentials...");
        println!("  SSID: {ssid}");
        let request = if hidden {
            WifiRequest::ConnectHidden { ssid, password }
        } else {
            WifiRequest::Connect { ssid, password }
        };
        self.run_command(request).await?;
        println!("WiFi credentials accepted! Device is connecting.");
        Ok(())
    }

    async fn disconnect_wifi(&mut self, target: Option<&str>) -> Result<(), BoxError> {
        self.open(target).await?;
        self.run_command(WifiRequest::Disconnect).await?;
        println!("Device disconnected from WiFi.");
        Ok(())
    }

    async fn info(&mut self, target: Option<&str>) -> Result<(), BoxError> {
        let Opened { peer, device, network, wireless, .. } = self.open(target).await?;

        println!("Device: {} ({})", peer.display_name(), peer.address);
        if let Some(info) = device {
            println!("  Manufacturer: {}", info.manufacturer);
            println!("  Model:        {}", info.model_number);
            println!("  Software:     {}", info.software_revision);
            println!("  Firmware:     {}", info.firmware_revision);
            println!("  Hardware:     {}", info.hardware_revision);
        }
        if let Some(status) = network {
            println!("  Network:      {status:?}");
        }
        if let Some(status) = wireless {
            println!("  Wireless:     {status:?}");
        }

        match self.run_command(WifiRequest::GetConnection).await? {
            SetupEvent::CurrentConnection(Some(ap)) => {
                let address = ap.host_address.as_deref().unwrap_or("no address");
                println!("  Connected to: {} ({address})", ap.ssid);
            }
            _ => println!("  Not connected to any WiFi network"),
        }
        Ok(())
    }
}

/// `target` is matched against name or address; without one any device will do
fn pick_device<'a>(seen: &'a DiscoveredPeers, target: Option<&str>) -> Option<&'a PeerHandle> {
    match target {
        Some(pattern) => seen.matching(pattern),
        None => seen.get(0),
    }
}
