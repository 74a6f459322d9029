// Contains types fixing the link parameters, directory layouts, and the
// timeout/pacing tables of the transfer protocol.
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const BAUD_BOUNDS: RangeInclusive<u32> = 9_600..=1_000_000;

/// Line rate both ends are provisioned for. 8 data bits, no parity, one
/// stop bit, no XON/XOFF.
pub const DEFAULT_BAUD: u32 = 921_600;

/// Bulk-phase read size on the sending side. Chosen for the CPU/throughput
/// knee of the reference platform at 921600 baud.
pub(crate) const CHUNK_SIZE: usize = 1536;

/// MD5 digests travel as 32 lowercase hex characters.
pub(crate) const HASH_HEX_LEN: usize = 32;

/// Names that are never transferred and are deleted at discovery.
pub const IGNORED_FILES: &[&str] = &["Thumbs.db"];

/// Suffix of a staging file while its bytes are still arriving.
pub(crate) const PART_SUFFIX: &str = ".part";

/// Suffix demoted staging files keep for forensic inspection.
pub(crate) const CORRUPT_SUFFIX: &str = ".000";

/// Serial port identity and rate, validated against [`BAUD_BOUNDS`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProfile {
    pub path: String,
    pub baud: u32,
}

impl PortProfile {
    pub fn new(path: impl Into<String>, baud: u32) -> crate::Result<Self> {
        if !BAUD_BOUNDS.contains(&baud) {
            return Err(crate::Error::Bound(format!(
                "baud out of range {}-{}: {}",
                BAUD_BOUNDS.start(),
                BAUD_BOUNDS.end(),
                baud
            )));
        }
        Ok(Self { path: path.into(), baud })
    }
}

/// Directory layout on the sending host. Files are discovered under
/// `incoming`, copied to `cache` for the duration of a transfer, and end
/// up under `transferred` or `failed` with their subfolder preserved.
#[derive(Debug, Clone)]
pub struct SenderLayout {
    pub incoming: PathBuf,
    pub transferred: PathBuf,
    pub failed: PathBuf,
    pub cache: PathBuf,
}

impl SenderLayout {
    /// The conventional layout: `incoming/`, `transferred/`, and `failed/`
    /// side by side under one root, with a cache tree elsewhere.
    pub fn under(root: impl AsRef<Path>, cache: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            incoming: root.join("incoming"),
            transferred: root.join("transferred"),
            failed: root.join("failed"),
            cache: cache.as_ref().to_path_buf(),
        }
    }
}

/// Directory layout on the receiving host. Arriving files are written
/// under `staging` with a [`PART_SUFFIX`] and promoted into `output` once
/// their hash checks out.
#[derive(Debug, Clone)]
pub struct ReceiverLayout {
    pub staging: PathBuf,
    pub output: PathBuf,
}

impl ReceiverLayout {
    pub fn new(staging: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            staging: staging.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
        }
    }
}

/// Protocol phase, for timeout diagnostics and log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Phase {
    #[display("idle")]
    Idle,
    #[display("announce")]
    Announce,
    #[display("ready handshake")]
    Ready,
    #[display("file-name handshake")]
    FileAck,
    #[display("file-name exchange")]
    Name,
    #[display("bulk data")]
    Bulk,
    #[display("done barrier")]
    Done,
    #[display("hash exchange")]
    Hash,
    #[display("verdict")]
    Verdict,
}

/// Outcome of one file transfer as observed by either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Verdict {
    #[display("delivered")]
    Delivered,
    #[display("failed")]
    Failed,
}

/// Bounded waits for every protocol phase. Defaults reproduce the
/// deployed values; tests shrink them to keep the suite fast.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Attempts and spacing while repeating `<<READY>>` for CTS high.
    pub ready_retries: u32,
    pub ready_interval: Duration,
    /// Attempts and spacing while repeating `<<FILE>>` for CTS low.
    pub file_ack_retries: u32,
    pub file_ack_interval: Duration,
    /// Attempts and spacing while repeating `<<DONE>>` for CTS high.
    pub done_retries: u32,
    pub done_interval: Duration,
    /// Continuous CTS deassertion tolerated during bulk send.
    pub cts_stall: Duration,
    /// Silence tolerated while the file name is arriving.
    pub name_stall: Duration,
    /// Silence tolerated during bulk receive.
    pub data_stall: Duration,
    /// Wait for the full 32-byte hash.
    pub hash_wait: Duration,
    /// Receiver-side cap on the `<<FILE>>` and `<<DONE>>` waits.
    pub handshake_stall: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready_retries: 5,
            ready_interval: Duration::from_secs(6),
            file_ack_retries: 5,
            file_ack_interval: Duration::from_secs(3),
            done_retries: 5,
            done_interval: Duration::from_secs(2),
            cts_stall: Duration::from_secs(20),
            name_stall: Duration::from_secs(20),
            data_stall: Duration::from_secs(15),
            hash_wait: Duration::from_secs(10),
            handshake_stall: Duration::from_secs(20),
        }
    }
}

/// Sleep intervals of the cooperative polling loops. As with [`Timeouts`],
/// defaults are the deployed values.
#[derive(Debug, Clone)]
pub struct Pacing {
    /// Gap between sentinel reads while in a handshake wait.
    pub handshake_poll: Duration,
    /// Gap between line-state polls inside a retry window.
    pub line_poll: Duration,
    /// Bulk-receive sleep when nothing is buffered.
    pub idle_gap: Duration,
    /// Bulk-receive sleep after a successful read. Smooths driver
    /// interaction; measurably raises throughput.
    pub active_gap: Duration,
    /// Sender sleep between bulk chunks.
    pub chunk_gap: Duration,
    /// Pause before `<<EOF>>` so the peer drains its buffer.
    pub drain_pause: Duration,
    /// Settle time between bulk end and the done barrier.
    pub settle: Duration,
    /// Poll interval for the post-hash DSR transition.
    pub verdict_poll: Duration,
    /// Rest between sender scan passes.
    pub scan_rest: Duration,
    /// Rest after a completed receive.
    pub receive_rest: Duration,
    /// Rest after a supervised error before the loop resumes.
    pub error_rest: Duration,
    /// Rest between port-open attempts.
    pub reopen_rest: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            handshake_poll: Duration::from_secs(1),
            line_poll: Duration::from_millis(100),
            idle_gap: Duration::from_millis(50),
            active_gap: Duration::from_millis(1),
            chunk_gap: Duration::from_millis(10),
            drain_pause: Duration::from_secs(2),
            settle: Duration::from_secs(1),
            verdict_poll: Duration::from_millis(500),
            scan_rest: Duration::from_secs(15),
            receive_rest: Duration::from_secs(5),
            error_rest: Duration::from_secs(5),
            reopen_rest: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_outside_bounds_is_rejected() {
        assert!(PortProfile::new("/dev/ttyUSB0", 2_000_000).is_err());
        assert!(PortProfile::new("/dev/ttyUSB0", 921_600).is_ok());
    }

    #[test]
    fn sender_layout_under_root() {
        let l = SenderLayout::under("/srv/diode", "/var/cache/diode");
        assert_eq!(l.incoming, Path::new("/srv/diode/incoming"));
        assert_eq!(l.transferred, Path::new("/srv/diode/transferred"));
        assert_eq!(l.failed, Path::new("/srv/diode/failed"));
        assert_eq!(l.cache, Path::new("/var/cache/diode"));
    }
}
