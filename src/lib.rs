//! File transfer across a one-directional ("data diode") serial link.
//!
//! The `diode` crate implements both ends of a UART file-transfer protocol:
//! a sender that watches a source tree and transmits new files, and a
//! receiver that stages arriving files, verifies their MD5, and promotes
//! them to an output tree for a downstream uploader.
//!
//! Framing is sentinel-based (`<<READY>>`, `<<FILE>>`, `<<ENDFNAME>>`,
//! `<<EOF>>\n`, `<<DONE>>`) over a raw 8N1 byte stream, with the RTS/CTS
//! and DTR/DSR modem lines repurposed as out-of-band signaling for phase
//! transitions and the final success/failure verdict. Hardware RTS/CTS
//! flow control is enabled only for the bulk-data phase so the same lines
//! stay free for signaling everywhere else.
//!
//! # Example
//! Run the sending side against a tree of files to publish:
//!
//! ```no_run
//! # fn example() -> diode::Result<()> {
//! use diode::{DaemonBuilder, SenderLayout};
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! let daemon = DaemonBuilder::new()
//!     .with_port("/dev/ttyAMA0")
//!     .sending(SenderLayout::under("/srv/diode", "/var/cache/diode"))
//!     .build()?;
//! daemon.run(&Arc::new(AtomicBool::new(false)))?;
//! # Ok(())
//! # }
//! ```
//!
//! The receiving side is symmetric, via [`DaemonBuilder::receiving`].
use std::path::{Path, PathBuf};
use std::str::Utf8Error;
use std::time::Duration;

use thiserror::Error;

pub mod builder;
pub mod config;
pub mod daemon;
pub mod frame;
pub mod fsops;
pub mod hash;
pub mod receiver;
pub mod sender;
pub mod transport;

pub use builder::DaemonBuilder;
pub use config::{Pacing, Phase, PortProfile, ReceiverLayout, SenderLayout, Timeouts, Verdict};
pub use daemon::{ReceiverDaemon, SenderDaemon};

/// Errors for both transfer state machines and the supervisory loops.
///
/// Serial-port trouble surfaces as [`Error::Io`] and makes the
/// supervisors reopen the port; trouble with local files surfaces as
/// [`Error::Storage`] and only ends the transfer at hand.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("filesystem error at {}: {}", path.display(), source)]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("timed out in {phase} after {waited:?}")]
    Timeout { phase: Phase, waited: Duration },
    #[error("out of sync in {phase}: reserved marker {marker} in stream")]
    OutOfSync { phase: Phase, marker: &'static str },
    #[error("reserved marker {marker} in outgoing {what}")]
    ReservedPayload { what: &'static str, marker: &'static str },
    #[error("unusable file name {0:?}")]
    BadName(String),
    #[error("{0}")]
    Bound(String),
    #[error("hash mismatch: local {local}, remote {remote}")]
    HashMismatch { local: String, remote: String },
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
}

impl Error {
    pub(crate) fn storage(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Storage { path: path.as_ref().to_path_buf(), source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
