//! The per-file sending state machine: announce, handshake, bulk data
//! with CTS gating, hash exchange, and the control-line verdict read.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Pacing, Phase, Timeouts, Verdict, CHUNK_SIZE};
use crate::transport::{poll_until, SerialLink};
use crate::{frame, hash, Error, Result};

/// Drives one end of the link through complete file transfers. Owns the
/// link for its lifetime; the supervisory loop rebuilds it after port
/// failures.
#[derive(Debug)]
pub struct SenderContext<L: SerialLink> {
    link: L,
    timeouts: Timeouts,
    pacing: Pacing,
}

impl<L: SerialLink> SenderContext<L> {
    pub fn new(link: L) -> Self {
        Self::with_tuning(link, Timeouts::default(), Pacing::default())
    }

    pub fn with_tuning(link: L, timeouts: Timeouts, pacing: Pacing) -> Self {
        Self { link, timeouts, pacing }
    }

    /// Idle-scan housekeeping: keep RTS up so the peer sees a live
    /// sender, keep DTR down, and emit the keepalive line.
    pub fn idle_tick(&mut self) -> Result<()> {
        self.link.set_rts(true)?;
        self.link.set_dtr(false)?;
        self.link.write_all(frame::ALIVE)
    }

    /// Best-effort informational message; the receiver logs these.
    pub fn send_update(&mut self, message: &str) {
        let line = format!("SERVER UPDATE: {message}\n");
        if let Err(e) = self.link.write_all(line.as_bytes()) {
            log::warn!("could not send update message {message:?}: {e}");
        }
    }

    /// Lower both lines; called on the way out of a clean shutdown.
    pub fn quiesce(&mut self) {
        let _ = self.link.set_rts(false);
        let _ = self.link.set_dtr(false);
    }

    /// Transfers one file. `wire_name` is the `subfolder/base` path the
    /// receiver will write to; `payload` is the local (cache) copy read
    /// for both bytes and hash. Returns the receiver's verdict.
    pub fn send_file(
        &mut self,
        wire_name: &str,
        payload: &Path,
        shutdown: &AtomicBool,
    ) -> Result<Verdict> {
        if let Some(marker) = frame::reserved_in_value(wire_name.as_bytes()) {
            return Err(Error::ReservedPayload { what: "file name", marker });
        }
        let size = std::fs::metadata(payload)
            .map_err(|e| Error::storage(payload, e))?
            .len();
        let digest = hash::file_md5(payload)?;
        let base = wire_name.rsplit('/').next().unwrap_or(wire_name);
        let started = Instant::now();

        // Human-readable heads-up; the receiver discards it.
        self.link.write_all(format!("{base} {size}\n").as_bytes())?;

        self.repeat_until_cts(
            frame::READY,
            true,
            self.timeouts.ready_retries,
            self.timeouts.ready_interval,
            Phase::Ready,
            shutdown,
        )?;
        self.repeat_until_cts(
            frame::FILE,
            false,
            self.timeouts.file_ack_retries,
            self.timeouts.file_ack_interval,
            Phase::FileAck,
            shutdown,
        )?;

        let mut framed = wire_name.as_bytes().to_vec();
        framed.extend_from_slice(frame::END_NAME);
        self.link.write_all(&framed)?;
        log::info!("file request acknowledged - transferring {wire_name:?}");

        self.link.set_bulk_flow(true)?;
        let streamed = self.stream_payload(payload, size, shutdown);
        let released = self.link.set_bulk_flow(false);
        let (chunks, bytes) = streamed?;
        released?;
        log::info!("sent {bytes} of {size} bytes in {chunks} chunks");
        if bytes != size {
            log::warn!("payload size changed mid-transfer: read {bytes}, expected {size}");
        }
        thread::sleep(self.pacing.settle);

        self.repeat_until_cts(
            frame::DONE,
            true,
            self.timeouts.done_retries,
            self.timeouts.done_interval,
            Phase::Done,
            shutdown,
        )?;
        // The CTS poll returns early; hold the hash back so it cannot
        // land in the same read as the barrier marker.
        thread::sleep(self.pacing.drain_pause);
        self.link.write_all(digest.as_bytes())?;
        log::info!("sent hash {digest}");

        let verdict = self.read_verdict(shutdown)?;
        match verdict {
            Verdict::Delivered => log::info!(
                "receiver confirmed {wire_name:?} ({bytes} bytes in {:?})",
                started.elapsed()
            ),
            Verdict::Failed => log::error!("receiver reported {wire_name:?} corrupted"),
        }
        Ok(verdict)
    }

    /// Writes `marker` once per attempt window until CTS reaches `want`.
    fn repeat_until_cts(
        &mut self,
        marker: &'static [u8],
        want: bool,
        retries: u32,
        interval: Duration,
        phase: Phase,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        for attempt in 1..=retries {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
            self.link.write_all(marker)?;
            log::info!(
                "{phase}: waiting for CTS {} (attempt {attempt} of {retries})",
                if want { "high" } else { "low" }
            );
            let link = &mut self.link;
            let reached = poll_until(interval, self.pacing.line_poll, || {
                if shutdown.load(Ordering::Relaxed) {
                    return Err(Error::Interrupted);
                }
                link.cts().map(|cts| cts == want)
            })?;
            if reached {
                return Ok(());
            }
        }
        log::error!("{phase}: CTS timeout after {retries} attempts of {interval:?}");
        Err(Error::Timeout { phase, waited: interval * retries })
    }

    /// The bulk phase: fixed-size chunks gated on CTS, then the EOF
    /// marker once the payload is exhausted.
    fn stream_payload(
        &mut self,
        payload: &Path,
        size: u64,
        shutdown: &AtomicBool,
    ) -> Result<(u64, u64)> {
        let mut file = File::open(payload).map_err(|e| Error::storage(payload, e))?;
        let mut chunk = [0u8; CHUNK_SIZE];
        let mut chunks = 0u64;
        let mut bytes = 0u64;
        let mut stalled: Option<Instant> = None;
        let status_every = (1_000_000 / CHUNK_SIZE) as u64;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
            if !self.link.peer_ready()? {
                // Keep RTS up so the peer can see we are trying to send.
                self.link.set_rts(true)?;
                let since = *stalled.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.timeouts.cts_stall {
                    return Err(Error::Timeout {
                        phase: Phase::Bulk,
                        waited: self.timeouts.cts_stall,
                    });
                }
                thread::sleep(self.pacing.chunk_gap);
                continue;
            }
            stalled = None;

            let n = fill_chunk(&mut file, &mut chunk).map_err(|e| Error::storage(payload, e))?;
            if n == 0 {
                thread::sleep(self.pacing.drain_pause);
                log::info!("end of file - writing EOF");
                self.link.write_all(frame::EOF)?;
                return Ok((chunks, bytes));
            }
            let data = &chunk[..n];
            if let Some(marker) = frame::reserved_in_chunk(data) {
                return Err(Error::ReservedPayload { what: "file data", marker });
            }
            self.link.write_all(data)?;
            chunks += 1;
            bytes += n as u64;
            if chunks % status_every == 0 {
                log::info!(
                    "{chunks} chunks, {bytes} bytes sent ({}%)",
                    bytes * 100 / size.max(1)
                );
            }
            thread::sleep(self.pacing.chunk_gap);
        }
    }

    /// Waits out the peer's hash check (DSR falling), then reads the
    /// verdict off CTS.
    fn read_verdict(&mut self, shutdown: &AtomicBool) -> Result<Verdict> {
        log::info!("waiting for hash check to finish (DSR low)");
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
            if self.link.peer_check_done()? {
                break;
            }
            thread::sleep(self.pacing.verdict_poll);
        }
        if self.link.cts()? {
            Ok(Verdict::Delivered)
        } else {
            Ok(Verdict::Failed)
        }
    }
}

/// Reads until `chunk` is full or the file ends.
fn fill_chunk(file: &mut File, chunk: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < chunk.len() {
        let n = file.read(&mut chunk[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
