//! A pure Rust iSCSI initiator engine
//!
//! This library implements the initiator side of the iSCSI session protocol:
//! login negotiation (with optional CHAP), CmdSN windowing, PDU queueing with
//! partial reads and writes over a non-blocking socket, dispatch of target
//! replies, per-PDU timeouts and transparent session reconnection.
//!
//! The engine never blocks and never spawns threads. The caller's event loop
//! asks [`IscsiContext::which_events`] what to wait for, waits on
//! [`IscsiContext::get_fd`], and hands the readiness to
//! [`IscsiContext::service`]. Every queued operation reports back through its
//! callback exactly once. The `*_sync` wrappers run that loop for you.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_initiator::{IscsiContext, IscsiUrl, ScsiCommand};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = IscsiUrl::parse("iscsi://192.168.1.10/iqn.2024-01.com.example:disk1/0")?;
//! let mut ctx = IscsiContext::from_url("iqn.2024-01.com.example:initiator", &url)?;
//! ctx.full_connect_sync(&url.portal, url.lun)?;
//!
//! let result = ctx.scsi_command_sync(url.lun, ScsiCommand::read10(0, 1, 512))?;
//! println!("read {} bytes, status 0x{:02x}", result.data_in.len(), result.status);
//!
//! ctx.logout_sync()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
mod connect;
pub mod context;
pub mod discovery;
pub mod error;
pub mod login;
mod nop;
pub mod pdu;
pub mod reconnect;
pub mod scsi;
pub mod session;
mod sync;
pub mod task_mgmt;
mod timeout;
pub mod transport;
pub mod url;

#[cfg(test)]
mod testing;

pub use auth::ChapCredentials;
pub use context::{CommandCallback, CommandData, CommandStatus, ContextBuilder, IscsiContext};
pub use discovery::{DiscoveryAddress, DiscoveryPortal};
pub use error::{IscsiError, IscsiResult};
pub use reconnect::ReconnectPolicy;
pub use scsi::{DataDirection, ScsiCommand, ScsiTaskResult, SenseData, TaskRef};
pub use session::{DigestType, HeaderDigestPreference, SessionType};
pub use task_mgmt::TaskMgmtFunction;
pub use transport::{Interest, Readiness, TcpOptions, TcpTransport, Transport};
pub use url::IscsiUrl;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
