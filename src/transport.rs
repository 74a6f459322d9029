/* Abstraction for the wire-level semantics */

use std::thread;
use std::time::{Duration, Instant};

use crate::Result;

pub mod port;
pub use port::PortLink;

/// One end of the serial link as the state machines consume it: chunked
/// byte I/O, the two outbound control lines, the two inbound lines, and
/// the bulk-phase flow-control toggle.
///
/// Line meanings change per phase; the state machines read them through
/// the named predicates below rather than by line name. Hardware RTS/CTS
/// flow control is engaged only between the end of the name exchange and
/// the `EOF` marker, so that the same lines carry handshake and verdict
/// signaling everywhere else.
pub trait SerialLink {
    /// Reads whatever the driver has buffered, up to `buf.len()` bytes.
    /// `Ok(0)` means nothing is pending right now.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    fn set_rts(&mut self, level: bool) -> Result<()>;

    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// CTS as seen on this side: the peer's RTS.
    fn cts(&mut self) -> Result<bool>;

    /// DSR as seen on this side: the peer's DTR.
    fn dsr(&mut self) -> Result<bool>;

    /// Engage or release hardware RTS/CTS flow control for the bulk phase.
    fn set_bulk_flow(&mut self, enabled: bool) -> Result<()>;

    fn discard_input(&mut self) -> Result<()>;

    /// The peer has raised its attention line.
    fn peer_ready(&mut self) -> Result<bool> {
        self.cts()
    }

    /// The peer has finished its hash check; the verdict is now on CTS.
    fn peer_check_done(&mut self) -> Result<bool> {
        Ok(!self.dsr()?)
    }
}

/// Polls `pred` every `poll` until it holds or `limit` elapses. The one
/// suspension primitive behind every bounded wait in the protocol.
pub(crate) fn poll_until<F>(limit: Duration, poll: Duration, mut pred: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    let start = Instant::now();
    loop {
        if pred()? {
            return Ok(true);
        }
        if start.elapsed() >= limit {
            return Ok(false);
        }
        thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_until_reports_success() {
        let mut hits = 0;
        let ok = poll_until(Duration::from_secs(1), Duration::from_millis(1), || {
            hits += 1;
            Ok(hits >= 3)
        })
        .unwrap();
        assert!(ok);
        assert_eq!(hits, 3);
    }

    #[test]
    fn poll_until_expires() {
        let start = Instant::now();
        let ok = poll_until(
            Duration::from_millis(20),
            Duration::from_millis(5),
            || Ok(false),
        )
        .unwrap();
        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
