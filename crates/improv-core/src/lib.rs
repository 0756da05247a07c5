//! # Improv Core Library
//!
//! Protocol engine for provisioning devices with Improv Wi-Fi over a serial
//! link.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Incremental framing of a byte stream shared with firmware log output
//! - Packet encoding and checksum validation
//! - RPC correlation with one outstanding call, including streamed results
//! - A device session: detection, info, Wi-Fi scan and provisioning
//!
//! ## Example
//!
//! ```rust,ignore
//! use improv_core::protocol::{serial::open_port, Connection, ConnectionConfig};
//!
//! let transport = open_port("/dev/ttyUSB0", None)?;
//! let mut session = Connection::new(transport, ConnectionConfig::default());
//!
//! let info = session.initialize(None).await?;
//! println!("{} {} on {}", info.firmware, info.version, info.chip_family);
//!
//! for network in session.scan().await? {
//!     println!("{:>4} dBm  {}", network.rssi, network.name);
//! }
//! let url = session.provision("Home", "secret", None).await?;
//! session.close().await;
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        ChecksumScheme, Connection, ConnectionConfig, ConnectionState, DeviceInfo, DeviceState,
        ErrorCode, NetworkEntry, ProtocolError, SessionEvent, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
