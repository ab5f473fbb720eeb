//! Line reassembly for child process output.
//!
//! Pipes deliver bytes in whatever chunks the OS hands out. A
//! [`LineReassembler`] buffers those chunks and emits complete
//! `\n`-terminated lines, so the emitted sequence depends only on the
//! concatenated bytes and never on where the chunk boundaries fell.
//!
//! ```text
//! Idle --feed--> Running --finish--> Draining --> Done
//!                   |
//!                   +--fail--> Failed
//! ```
//!
//! Lines are split on raw bytes before UTF-8 decoding, so a multi-byte
//! character cut across two chunks decodes intact. `\r` is kept.

use bytes::{Buf, BytesMut};

/// Line terminator.
const NEWLINE: u8 = b'\n';

/// Lifecycle of one output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblerState {
    /// No bytes seen yet.
    Idle,
    /// Accepting chunks.
    Running,
    /// Stream ended, residue being flushed.
    Draining,
    /// Stream ended cleanly; nothing more will be emitted.
    Done,
    /// Stream failed; residue was flushed as a partial line.
    Failed,
}

impl ReassemblerState {
    /// True once no further lines can be emitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Incremental line splitter for one process stream.
#[derive(Debug)]
pub struct LineReassembler {
    buf: BytesMut,
    state: ReassemblerState,
}

impl LineReassembler {
    /// Create an idle reassembler with an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: ReassemblerState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> ReassemblerState {
        self.state
    }

    /// Number of buffered bytes not yet emitted.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed one chunk and return every line it completed, in order.
    ///
    /// Chunks fed after the stream ended are dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        match self.state {
            ReassemblerState::Idle => self.state = ReassemblerState::Running,
            ReassemblerState::Running => {}
            state => {
                log::warn!(
                    "[Reassembler] Dropping {} bytes fed in {:?} state",
                    chunk.len(),
                    state
                );
                return Vec::new();
            }
        }

        // Only the new bytes can contain a terminator we have not seen yet.
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);
        if !chunk.contains(&NEWLINE) {
            return Vec::new();
        }

        let mut lines = Vec::new();
        let mut search = scan_from;
        while let Some(offset) = self.buf[search..].iter().position(|&b| b == NEWLINE) {
            let end = search + offset;
            let line = self.buf.split_to(end);
            self.buf.advance(1);
            lines.push(String::from_utf8_lossy(&line).into_owned());
            search = 0;
        }
        lines
    }

    /// End the stream normally, returning the unterminated residue if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = ReassemblerState::Draining;
        let residue = self.take_residue();
        self.state = ReassemblerState::Done;
        residue
    }

    /// End the stream after a read error, returning the partial residue if any.
    pub fn fail(&mut self) -> Option<String> {
        if self.state.is_terminal() {
            return None;
        }
        let residue = self.take_residue();
        self.state = ReassemblerState::Failed;
        residue
    }

    fn take_residue(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

impl Default for LineReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&[u8]]) -> Vec<String> {
        let mut r = LineReassembler::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(r.feed(chunk));
        }
        lines.extend(r.finish());
        lines
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let lines = run(&[b"li", b"ne1\nline2\nli", b"ne3"]);
        assert_eq!(lines, vec!["line1", "line2", "line3"]);
    }

    #[test]
    fn test_trailing_newline_emits_no_empty_line() {
        assert_eq!(run(&[b"a\nb\n"]), vec!["a", "b"]);
    }

    #[test]
    fn test_blank_lines_are_preserved() {
        assert_eq!(run(&[b"a\n\n", b"\nb"]), vec!["a", "", "", "b"]);
    }

    #[test]
    fn test_carriage_return_is_kept() {
        assert_eq!(run(&[b"dos\r\nline"]), vec!["dos\r", "line"]);
    }

    #[test]
    fn test_empty_stream_emits_nothing() {
        assert!(run(&[]).is_empty());
        assert!(run(&[b"", b""]).is_empty());
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let text = "größe → 3\n".as_bytes();
        // Split in the middle of the two-byte 'ö'.
        let lines = run(&[&text[..3], &text[3..]]);
        assert_eq!(lines, vec!["größe → 3"]);
    }

    #[test]
    fn test_every_partition_yields_same_lines() {
        let stream: &[u8] = b"alpha\nbeta\n\ngamma\r\ndelta";
        let expected = run(&[stream]);
        assert_eq!(expected, vec!["alpha", "beta", "", "gamma\r", "delta"]);

        // Every way of cutting the stream into up to three chunks.
        for i in 0..=stream.len() {
            for j in i..=stream.len() {
                let lines = run(&[&stream[..i], &stream[i..j], &stream[j..]]);
                assert_eq!(lines, expected, "cut at {i}, {j}");
            }
        }

        // Byte at a time.
        let bytes: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(run(&bytes), expected);

        // Rejoining reconstructs the stream.
        assert_eq!(expected.join("\n").as_bytes(), stream);
    }

    #[test]
    fn test_state_transitions() {
        let mut r = LineReassembler::new();
        assert_eq!(r.state(), ReassemblerState::Idle);

        r.feed(b"partial");
        assert_eq!(r.state(), ReassemblerState::Running);
        assert_eq!(r.pending(), 7);

        assert_eq!(r.finish(), Some("partial".to_string()));
        assert_eq!(r.state(), ReassemblerState::Done);

        // Nothing more after Done.
        assert!(r.feed(b"late\n").is_empty());
        assert_eq!(r.finish(), None);
    }

    #[test]
    fn test_fail_flushes_partial_line() {
        let mut r = LineReassembler::new();
        assert_eq!(r.feed(b"ok\nhalf"), vec!["ok"]);
        assert_eq!(r.fail(), Some("half".to_string()));
        assert_eq!(r.state(), ReassemblerState::Failed);
        assert!(r.feed(b"more\n").is_empty());
    }

    #[test]
    fn test_finish_on_idle_is_done() {
        let mut r = LineReassembler::new();
        assert_eq!(r.finish(), None);
        assert_eq!(r.state(), ReassemblerState::Done);
    }
}
