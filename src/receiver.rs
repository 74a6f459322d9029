//! The per-file receiving state machine: idle wait, name exchange, bulk
//! receive with in-band EOF scanning, hash comparison, and the
//! control-line verdict signal.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};

use crate::config::{Pacing, Phase, ReceiverLayout, Timeouts, Verdict, HASH_HEX_LEN};
use crate::frame::{self, BulkEvent, EofScanner, LineClass};
use crate::fsops::{self, CreateHook};
use crate::transport::SerialLink;
use crate::{hash, Error, Result};

const READ_BUF: usize = 4096;

/// What one completed exchange produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Path relative to the output root.
    pub relative: PathBuf,
    pub verdict: Verdict,
    pub bytes: u64,
}

/// Drives the receiving end of the link. One call to
/// [`ReceiverContext::receive_one`] handles exactly one file, idle wait
/// included, and leaves the line state back at idle.
pub struct ReceiverContext<L: SerialLink> {
    link: L,
    layout: ReceiverLayout,
    timeouts: Timeouts,
    pacing: Pacing,
    post_create: Option<CreateHook>,
    last_alive: Option<Instant>,
}

impl<L: SerialLink> ReceiverContext<L> {
    pub fn new(link: L, layout: ReceiverLayout) -> Self {
        Self::with_tuning(link, layout, Timeouts::default(), Pacing::default())
    }

    pub fn with_tuning(link: L, layout: ReceiverLayout, timeouts: Timeouts, pacing: Pacing) -> Self {
        Self {
            link,
            layout,
            timeouts,
            pacing,
            post_create: None,
            last_alive: None,
        }
    }

    /// Installs the hook invoked on every file and directory created
    /// under the staging and output roots.
    pub fn on_create(mut self, hook: CreateHook) -> Self {
        self.post_create = Some(hook);
        self
    }

    /// When the sender's keepalive was last heard.
    pub fn last_alive(&self) -> Option<Instant> {
        self.last_alive
    }

    /// Lower both lines; called on the way out of a clean shutdown.
    pub fn quiesce(&mut self) {
        let _ = self.link.set_rts(false);
        let _ = self.link.set_dtr(false);
    }

    /// Waits for a sender, receives one file, verifies it, signals the
    /// verdict, and disposes of the staged bytes.
    pub fn receive_one(&mut self, shutdown: &AtomicBool) -> Result<Delivery> {
        self.link.set_rts(false)?;
        self.link.set_dtr(false)?;
        thread::sleep(self.pacing.settle);
        log::info!("waiting for file");

        self.await_marker(frame::READY, None, Phase::Idle, shutdown)?;
        self.link.set_rts(true)?;

        self.await_marker(
            frame::FILE,
            Some(self.timeouts.handshake_stall),
            Phase::FileAck,
            shutdown,
        )?;
        self.link.set_rts(false)?;

        let relative = self.read_name(shutdown)?;
        let started = Instant::now();
        log::info!("receiving {}", relative.display());

        let staging = fsops::staging_path(&self.layout, &relative);
        if let Some(dir) = staging.parent() {
            fsops::ensure_dir(dir, &self.post_create)?;
        }
        // Truncates any stale partial file from an aborted run.
        let file = File::create(&staging).map_err(|e| Error::storage(&staging, e))?;
        log::info!("writing to {}", staging.display());

        self.link.set_bulk_flow(true)?;
        self.link.set_rts(true)?;
        let drained = self.drain_bulk(file, &staging, started, shutdown);
        let released = self.link.set_bulk_flow(false);
        let (bytes, chunks) = match drained.and_then(|v| released.map(|()| v)) {
            Ok(v) => v,
            Err(e) => {
                // Keep the partial file, renamed, for inspection.
                let _ = fsops::demote(&staging, &self.post_create);
                return Err(e);
            }
        };
        log::info!("file received: {bytes} bytes in {chunks} chunks");

        self.link.set_rts(true)?;
        let finish = self.finish_exchange(&staging, shutdown);
        match finish {
            Ok(verdict) => {
                let dispose = match verdict {
                    Verdict::Delivered => fsops::promote(
                        &self.layout,
                        &staging,
                        &relative,
                        &self.post_create,
                    )
                    .map(|_| ()),
                    Verdict::Failed => fsops::demote(&staging, &self.post_create).map(|_| ()),
                };
                if let Err(e) = dispose {
                    log::error!("could not dispose of {}: {}", staging.display(), e);
                }
                let secs = started.elapsed().as_secs_f64();
                log::info!(
                    "transfer finished: {bytes} bytes in {secs:.1}s ({:.0} KB/s), {verdict}",
                    bytes as f64 / 1024.0 / secs.max(f64::EPSILON)
                );
                Ok(Delivery { relative, verdict, bytes })
            }
            Err(e) => {
                let _ = fsops::demote(&staging, &self.post_create);
                Err(e)
            }
        }
    }

    /// The done barrier, hash exchange, comparison, and line signaling.
    fn finish_exchange(&mut self, staging: &Path, shutdown: &AtomicBool) -> Result<Verdict> {
        self.await_marker(
            frame::DONE,
            Some(self.timeouts.handshake_stall),
            Phase::Done,
            shutdown,
        )?;

        // Must be high before the hash can arrive: the sender waits for
        // the falling edge, and lines float high on a closed port.
        self.link.set_dtr(true)?;
        let remote = self.read_hash(shutdown)?;

        self.link.set_rts(false)?;
        let local = hash::file_md5(staging)?;
        let verdict = if local == remote {
            log::info!("hashes match ({local})");
            Verdict::Delivered
        } else {
            log::warn!("hash mismatch: local {local}, remote {remote}");
            Verdict::Failed
        };
        self.link.set_rts(verdict == Verdict::Delivered)?;
        self.link.set_dtr(false)?;
        Ok(verdict)
    }

    /// Phase-boundary wait: accumulate reads until the buffer is exactly
    /// `expected`. Complete lines arriving meanwhile are informational
    /// traffic; chatter that stops growing and is not a prefix of the
    /// marker is logged and discarded; any reserved marker that is not
    /// the expected one aborts the transfer.
    fn await_marker(
        &mut self,
        expected: &'static [u8],
        limit: Option<Duration>,
        phase: Phase,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(256);
        let mut scratch = [0u8; 256];
        let start = Instant::now();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
            let n = self.link.read_available(&mut scratch)?;
            if n > 0 {
                buf.put_slice(&scratch[..n]);
            }

            while let Some(line) = take_line(&mut buf) {
                match frame::classify_line(&line) {
                    LineClass::Alive => {
                        self.last_alive = Some(Instant::now());
                        log::debug!("sender alive");
                    }
                    LineClass::Update => {
                        log::info!("{}", String::from_utf8_lossy(&line).trim_end());
                    }
                    LineClass::Reserved(marker) => {
                        return Err(Error::OutOfSync { phase, marker });
                    }
                    LineClass::Noise => {
                        log::debug!("discarding line {:?}", String::from_utf8_lossy(&line));
                    }
                }
            }

            if buf.as_ref() == expected {
                log::info!("{phase}: marker received");
                return Ok(());
            }
            if !buf.is_empty() && !expected.starts_with(buf.as_ref()) {
                if let Some(marker) = frame::reserved_in_value(buf.as_ref()) {
                    return Err(Error::OutOfSync { phase, marker });
                }
                if n == 0 {
                    // Unterminated chatter that has stopped growing.
                    if buf.starts_with(frame::UPDATE_PREFIX) {
                        log::info!("{}", String::from_utf8_lossy(buf.as_ref()));
                    } else {
                        log::debug!("discarding {:?}", String::from_utf8_lossy(buf.as_ref()));
                    }
                    buf.clear();
                }
            }

            if let Some(limit) = limit {
                if start.elapsed() >= limit {
                    return Err(Error::Timeout { phase, waited: limit });
                }
            }
            thread::sleep(if n > 0 { self.pacing.idle_gap } else { self.pacing.handshake_poll });
        }
    }

    /// Reads the transmitted name up to its end marker and validates it
    /// as a plain relative path.
    fn read_name(&mut self, shutdown: &AtomicBool) -> Result<PathBuf> {
        let mut buf = BytesMut::with_capacity(256);
        let mut scratch = [0u8; 256];
        let mut quiet = Instant::now();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
            let n = self.link.read_available(&mut scratch)?;
            if n == 0 {
                if quiet.elapsed() >= self.timeouts.name_stall {
                    return Err(Error::Timeout {
                        phase: Phase::Name,
                        waited: self.timeouts.name_stall,
                    });
                }
                thread::sleep(self.pacing.handshake_poll);
                continue;
            }
            quiet = Instant::now();
            buf.put_slice(&scratch[..n]);

            if let Some(idx) = frame::find(&buf, frame::END_NAME) {
                let tail = buf.len() - idx - frame::END_NAME.len();
                if tail > 0 {
                    log::warn!("{tail} unexpected bytes after the name marker");
                }
                let raw = &buf[..idx];
                if let Some(marker) = frame::reserved_in_value(raw) {
                    return Err(Error::OutOfSync { phase: Phase::Name, marker });
                }
                let name = std::str::from_utf8(raw)?.trim_end_matches('\0');
                log::info!("file name received: {name:?}");
                return fsops::sanitize_relative(name);
            }
            if let Some(marker) = frame::reserved_in_value(&buf) {
                return Err(Error::OutOfSync { phase: Phase::Name, marker });
            }
            thread::sleep(self.pacing.idle_gap);
        }
    }

    /// The bulk phase: read everything that arrives, run it through the
    /// EOF scanner, and write the file bytes out, until the terminal
    /// marker or a stall.
    fn drain_bulk(
        &mut self,
        file: File,
        staging: &Path,
        started: Instant,
        shutdown: &AtomicBool,
    ) -> Result<(u64, u64)> {
        let mut out = BufWriter::new(file);
        let mut scanner = EofScanner::new();
        let mut scratch = vec![0u8; READ_BUF];
        let mut writable = Vec::with_capacity(READ_BUF + 16);
        let mut bytes = 0u64;
        let mut chunks = 0u64;
        let mut quiet = Instant::now();
        let mut reported = 0u64;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
            let n = self.link.read_available(&mut scratch)?;
            if n == 0 {
                if quiet.elapsed() >= self.timeouts.data_stall {
                    return Err(Error::Timeout {
                        phase: Phase::Bulk,
                        waited: self.timeouts.data_stall,
                    });
                }
                thread::sleep(self.pacing.idle_gap);
                continue;
            }
            quiet = Instant::now();
            chunks += 1;

            writable.clear();
            let event = scanner.feed(&scratch[..n], &mut writable)?;
            out.write_all(&writable)
                .map_err(|e| Error::storage(staging, e))?;
            bytes += writable.len() as u64;

            if bytes - reported >= 1_000_000 {
                reported = bytes;
                let secs = started.elapsed().as_secs_f64();
                log::info!(
                    "{bytes} bytes received in {secs:.1}s ({:.0} KB/s, {chunks} chunks)",
                    bytes as f64 / 1024.0 / secs.max(f64::EPSILON)
                );
            }

            match event {
                BulkEvent::Finished => {
                    out.flush().map_err(|e| Error::storage(staging, e))?;
                    return Ok((bytes, chunks));
                }
                BulkEvent::MidStreamEof => {
                    log::warn!("EOF marker mid-stream; the file will fail verification");
                }
                BulkEvent::Progress => {}
            }
            thread::sleep(self.pacing.active_gap);
        }
    }

    /// Accumulates the 32 hex characters of the peer's digest.
    fn read_hash(&mut self, shutdown: &AtomicBool) -> Result<String> {
        let mut buf = BytesMut::with_capacity(64);
        let mut scratch = [0u8; 64];
        let start = Instant::now();
        while buf.len() < HASH_HEX_LEN {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
            let n = self.link.read_available(&mut scratch)?;
            if n > 0 {
                buf.put_slice(&scratch[..n]);
                continue;
            }
            if start.elapsed() >= self.timeouts.hash_wait {
                return Err(Error::Timeout {
                    phase: Phase::Hash,
                    waited: self.timeouts.hash_wait,
                });
            }
            thread::sleep(self.pacing.handshake_poll);
        }
        if buf.len() > HASH_HEX_LEN {
            log::warn!(
                "{} bytes buffered for a {HASH_HEX_LEN}-character hash",
                buf.len()
            );
        }
        let hex = std::str::from_utf8(&buf[..HASH_HEX_LEN])?
            .trim_end_matches('\0')
            .to_owned();
        Ok(hex)
    }
}

/// Splits the first complete LF-terminated line off the front of `buf`.
fn take_line(buf: &mut BytesMut) -> Option<BytesMut> {
    let idx = buf.iter().position(|&b| b == b'\n')?;
    Some(buf.split_to(idx + 1))
}
