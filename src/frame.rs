/* The framing vocabulary: fixed byte markers and their detection rules. */

use crate::config::Phase;
use crate::{Error, Result};

/// Requests the receiver's attention; answered by CTS going high.
pub const READY: &[u8] = b"<<READY>>";
/// Announces that the file name follows; answered by CTS going low.
pub const FILE: &[u8] = b"<<FILE>>";
/// Terminates the file name.
pub const END_NAME: &[u8] = b"<<ENDFNAME>>";
/// Terminates the bulk data. The trailing LF is part of the marker.
pub const EOF: &[u8] = b"<<EOF>>\n";
/// Pre-hash barrier; answered by CTS going high.
pub const DONE: &[u8] = b"<<DONE>>";
/// Keepalive emitted by an idle sender.
pub const ALIVE: &[u8] = b"Server Alive\n";
/// Prefix of informational messages from the sender.
pub const UPDATE_PREFIX: &[u8] = b"SERVER UPDATE";

/// Markers whose appearance inside bulk data means the peers have lost
/// framing. `EOF` is handled separately by the in-band scanner.
const CHUNK_RESERVED: &[(&[u8], &str)] =
    &[(READY, "READY"), (FILE, "FILE"), (DONE, "DONE")];

/// Markers that may never appear inside a transmitted value (file name,
/// hash) or in received non-bulk traffic.
const VALUE_RESERVED: &[(&[u8], &str)] = &[
    (READY, "READY"),
    (FILE, "FILE"),
    (END_NAME, "ENDFNAME"),
    (EOF, "EOF"),
    (DONE, "DONE"),
];

/// The longest marker, minus one: how many bytes the in-band scanner must
/// hold back so a marker straddling two reads is still seen whole.
const HOLDBACK: usize = READY.len() - 1;

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

/// First bulk-reserved marker present in `data`, if any.
pub(crate) fn reserved_in_chunk(data: &[u8]) -> Option<&'static str> {
    CHUNK_RESERVED
        .iter()
        .find(|(m, _)| contains(data, m))
        .map(|(_, name)| *name)
}

/// First value-reserved marker present in `data`, if any.
pub(crate) fn reserved_in_value(data: &[u8]) -> Option<&'static str> {
    VALUE_RESERVED
        .iter()
        .find(|(m, _)| contains(data, m))
        .map(|(_, name)| *name)
}

/// What a complete line of non-bulk traffic turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineClass {
    /// The sender's keepalive.
    Alive,
    /// A `SERVER UPDATE` informational message.
    Update,
    /// A framing marker where none belongs.
    Reserved(&'static str),
    /// Anything else, e.g. the announce line. Logged and discarded.
    Noise,
}

pub(crate) fn classify_line(line: &[u8]) -> LineClass {
    if line == ALIVE {
        LineClass::Alive
    } else if line.starts_with(UPDATE_PREFIX) {
        LineClass::Update
    } else if let Some(marker) = reserved_in_value(line) {
        LineClass::Reserved(marker)
    } else {
        LineClass::Noise
    }
}

/// What one scanner feed produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BulkEvent {
    /// Plain data; keep reading.
    Progress,
    /// An `EOF` marker surfaced mid-stream. Its bytes are dropped, which
    /// guarantees the staged file fails verification; keep reading.
    MidStreamEof,
    /// The terminal `EOF` was consumed; the file is complete.
    Finished,
}

/// Carry-over scanner for the bulk phase. Feeds arbitrary read chunks,
/// emits the file bytes, and detects `EOF` and out-of-sync markers even
/// when they straddle a read boundary: the last [`HOLDBACK`] bytes of
/// every feed are retained until the next one resolves them.
#[derive(Debug, Default)]
pub(crate) struct EofScanner {
    tail: Vec<u8>,
    finished: bool,
}

impl EofScanner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Scans `chunk`, appending writable file bytes to `out`.
    pub(crate) fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<BulkEvent> {
        debug_assert!(!self.finished);
        self.tail.extend_from_slice(chunk);

        if let Some(marker) = reserved_in_chunk(&self.tail) {
            return Err(Error::OutOfSync { phase: Phase::Bulk, marker });
        }

        let mut event = BulkEvent::Progress;
        while let Some(idx) = find(&self.tail, EOF) {
            if idx + EOF.len() == self.tail.len() {
                out.extend_from_slice(&self.tail[..idx]);
                self.tail.clear();
                self.finished = true;
                return Ok(BulkEvent::Finished);
            }
            // A marker in the middle of the stream. Consume it and go on;
            // the hash comparison is what reports the damage.
            out.extend_from_slice(&self.tail[..idx]);
            self.tail.drain(..idx + EOF.len());
            event = BulkEvent::MidStreamEof;
        }

        let cut = self.tail.len().saturating_sub(HOLDBACK);
        out.extend_from_slice(&self.tail[..cut]);
        self.tail.drain(..cut);
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_informational_lines() {
        assert_eq!(classify_line(b"Server Alive\n"), LineClass::Alive);
        assert_eq!(
            classify_line(b"SERVER UPDATE: Startup - serial port opened\n"),
            LineClass::Update
        );
        assert_eq!(classify_line(b"a.bin 1024\n"), LineClass::Noise);
        assert_eq!(
            classify_line(b"junk<<READY>>\n"),
            LineClass::Reserved("READY")
        );
    }

    #[test]
    fn near_marker_is_not_reserved() {
        assert_eq!(reserved_in_value(b"<<EO>>"), None);
        assert_eq!(reserved_in_value(b"<READY>"), None);
        assert_eq!(reserved_in_chunk(b"x<<DONE>y"), None);
    }

    #[test]
    fn scanner_strips_terminal_eof() {
        let mut s = EofScanner::new();
        let mut out = Vec::new();
        assert_eq!(
            s.feed(b"hello world<<EOF>>\n", &mut out).unwrap(),
            BulkEvent::Finished
        );
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn scanner_handles_empty_payload() {
        let mut s = EofScanner::new();
        let mut out = Vec::new();
        assert_eq!(s.feed(b"<<EOF>>\n", &mut out).unwrap(), BulkEvent::Finished);
        assert!(out.is_empty());
    }

    #[test]
    fn scanner_detects_eof_straddling_reads() {
        let mut s = EofScanner::new();
        let mut out = Vec::new();
        assert_eq!(s.feed(b"data<<EO", &mut out).unwrap(), BulkEvent::Progress);
        assert_eq!(s.feed(b"F>>\n", &mut out).unwrap(), BulkEvent::Finished);
        assert_eq!(out, b"data");
    }

    #[test]
    fn scanner_drops_mid_stream_eof_and_continues() {
        let mut s = EofScanner::new();
        let mut out = Vec::new();
        assert_eq!(
            s.feed(b"abc<<EOF>>\ndef", &mut out).unwrap(),
            BulkEvent::MidStreamEof
        );
        assert_eq!(s.feed(b"ghi<<EOF>>\n", &mut out).unwrap(), BulkEvent::Finished);
        assert_eq!(out, b"abcdefghi");
    }

    #[test]
    fn scanner_aborts_on_reserved_marker() {
        let mut s = EofScanner::new();
        let mut out = Vec::new();
        let err = s.feed(b"abc<<READY>>def", &mut out).unwrap_err();
        assert!(matches!(err, Error::OutOfSync { marker: "READY", .. }));
    }

    #[test]
    fn scanner_aborts_on_marker_straddling_reads() {
        let mut s = EofScanner::new();
        let mut out = Vec::new();
        assert_eq!(s.feed(b"abc<<DO", &mut out).unwrap(), BulkEvent::Progress);
        let err = s.feed(b"NE>>def", &mut out).unwrap_err();
        assert!(matches!(err, Error::OutOfSync { marker: "DONE", .. }));
    }

    #[test]
    fn scanner_passes_near_markers_through() {
        let mut s = EofScanner::new();
        let mut out = Vec::new();
        assert_eq!(s.feed(b"<<EO>>", &mut out).unwrap(), BulkEvent::Progress);
        assert_eq!(s.feed(b"<<EOF>>\n", &mut out).unwrap(), BulkEvent::Finished);
        assert_eq!(out, b"<<EO>>");
    }
}
