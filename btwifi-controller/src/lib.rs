//! btwifi controller
//!
//! Engine for provisioning WiFi on headless devices over Bluetooth LE: finds
//! provisioning peripherals, drives the GATT session and exchanges framed JSON
//! commands with them.
//!
//! # Example
//!
//! ```ignore
//! use btwifi_controller::{Client, SetupConfig, SetupEvent};
//! use btwifi_proto::WifiRequest;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SetupConfig::load()?;
//!     let (client, handle, mut events) = Client::bluetooth(&config).await?;
//!     tokio::spawn(client.run());
//!
//!     handle.start_scan()?;
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SetupEvent::PeerFound(peer) => handle.connect(peer).await?,
//!             SetupEvent::AccessPoints(list) => {
//!                 for ap in &list {
//!                     println!("{} ({})", ap.ssid, ap.signal_strength);
//!                 }
//!                 handle.request(WifiRequest::Scan).await?;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod models;
pub mod scanner;
pub mod service;
pub mod session;
pub mod transport;

pub use client::{Client, ClientHandle};
pub use config::{ConfigError, SetupConfig};
pub use error::{SetupError, TransportError};
pub use events::{EventReceiver, SetupEvent};
pub use models::{AccessPoints, DiscoveredPeers, ListModel};
pub use scanner::{PeerHandle, Scanner};
pub use service::DiscoveryStatus;
pub use session::{GattSession, SessionOptions, SessionStatus};
