//! Host side of the badge control channel
//!
//! Talks to the MCH2022 badge over its USB bridge (bulk endpoints of the
//! vendor interface) or over a plain UART. Two command families share the
//! link:
//!
//! - a structured request/response family, where every request carries an
//!   opcode and a message id and the reply echoes both;
//! - a token family, where a 4-byte ASCII tag selects the command and the
//!   badge answers with a stream of 4-byte status tokens, optionally
//!   interleaved with length-prefixed records (directory entries, apps).
//!
//! Outbound data is framed by [codec], paced onto the wire by
//! [ChunkedSender] and replies are reassembled from arbitrarily fragmented
//! reads by the accumulators in [accumulator]. [Dispatcher] ties these
//! together and keeps exactly one request in flight.
//!
//! # Example
//!
//! ```no_run
//! use badgelink::{Badge, LinkConfig, UsbTransport};
//!
//! let mut usb = UsbTransport::open(None, None)?;
//! usb.boot_webusb()?;
//! let mut badge = Badge::new(usb, LinkConfig::default());
//! let listing = badge.get_dir("/internal")?;
//! for file in &listing.files {
//!     println!("{file}");
//! }
//! # Ok::<(), badgelink::ProtocolError>(())
//! ```

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub(crate) const DEFAULT_READ_SIZE: usize = 128;

pub(crate) const WEBUSB_CHUNK_SIZE: usize = 512;
pub(crate) const WEBUSB_CHUNK_DELAY: Duration = Duration::from_millis(10);
pub(crate) const PACKET_CHUNK_SIZE: usize = 1024 * 2;
pub(crate) const FPGA_CHUNK_SIZE: usize = 1024 * 2;
pub(crate) const FPGA_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// USB vendor id of the badge
pub const BADGE_VID: u16 = 0x16d0;
/// USB product id of the badge
pub const BADGE_PID: u16 = 0x0f9a;
/// Baud rate used by the UART loader and the USB bridge
pub const UART_BAUD_RATE: u32 = 921600;

pub mod accumulator;
pub mod codec;
mod badge;
mod config;
mod dispatcher;
mod error;
mod fpga;
mod sender;
pub mod transport;

use std::time::Duration;

// Re-exports
pub use accumulator::{
    Accumulate, AppEntry, DirectoryEntry, EntryKind, PacketAccumulator,
    Progress, Record, ResponseAccumulator, ResponseStatus, TokenReply,
};
pub use badge::{Badge, DirListing};
pub use codec::{
    Binding, Command, Frame, Opcode, Packet, PacketHeader, Request, Tag,
    TokenCommand,
};
pub use config::LinkConfig;
pub use dispatcher::{Dispatcher, Reply};
pub use error::{CorrelationKey, ErrorKind, IntegrityFault, ProtocolError};
pub use fpga::FpgaLoader;
pub use sender::ChunkedSender;
pub use transport::{BridgeMode, SerialTransport, Transport, UsbTransport};
