/// Classifies raw PTY output into structured chunks without consuming the
/// raw stream: callers feed the same bytes they forward, and get back text
/// runs, escape sequences, and completed lines. Malformed UTF-8 is decoded
/// with replacement characters; a malformed or truncated escape sequence is
/// flushed as-is rather than aborting the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputChunk {
    /// A run of printable output, possibly a partial line.
    Text(String),
    /// One complete escape sequence (CSI, OSC, or a two-byte escape).
    Control(Vec<u8>),
    /// A completed line of text, control sequences stripped, no trailing
    /// newline or carriage return.
    Line(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParseState {
    Ground,
    Escape,
    Csi,
    Osc,
    /// OSC terminated by ESC, waiting for the `\` of the ST.
    OscEsc,
}

/// Incremental control-sequence splitter.
///
/// Hand-rolled byte state machine rather than a full VT emulator: the
/// engine only needs chunk boundaries, not screen state. Sequences split
/// across `push` calls are buffered until complete.
pub struct StreamProcessor {
    state: ParseState,
    pending_escape: Vec<u8>,
    pending_text: Vec<u8>,
    line: String,
}

impl StreamProcessor {
    pub fn new() -> Self {
        Self {
            state: ParseState::Ground,
            pending_escape: Vec::new(),
            pending_text: Vec::new(),
            line: String::new(),
        }
    }

    /// Feed raw bytes, returning the chunks completed by this input.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();

        for &byte in bytes {
            match self.state {
                ParseState::Ground => match byte {
                    0x1b => {
                        self.flush_text(&mut chunks);
                        self.pending_escape.push(byte);
                        self.state = ParseState::Escape;
                    }
                    b'\n' => {
                        self.flush_text(&mut chunks);
                        let line = std::mem::take(&mut self.line);
                        chunks.push(OutputChunk::Line(
                            line.strip_suffix('\r').unwrap_or(&line).to_string(),
                        ));
                    }
                    _ => self.pending_text.push(byte),
                },
                ParseState::Escape => {
                    self.pending_escape.push(byte);
                    match byte {
                        b'[' => self.state = ParseState::Csi,
                        b']' => self.state = ParseState::Osc,
                        // Two-byte escape (RIS, DECSC, charset selection, ...).
                        _ => self.finish_escape(&mut chunks),
                    }
                }
                ParseState::Csi => {
                    self.pending_escape.push(byte);
                    // Parameter/intermediate bytes are 0x20-0x3f; the final
                    // byte of a CSI sequence is 0x40-0x7e.
                    if (0x40..=0x7e).contains(&byte) {
                        self.finish_escape(&mut chunks);
                    } else if !(0x20..=0x3f).contains(&byte) {
                        // Malformed: flush what we have and reprocess nothing.
                        self.finish_escape(&mut chunks);
                    }
                }
                ParseState::Osc => {
                    self.pending_escape.push(byte);
                    match byte {
                        0x07 => self.finish_escape(&mut chunks),
                        0x1b => self.state = ParseState::OscEsc,
                        _ => {}
                    }
                }
                ParseState::OscEsc => {
                    self.pending_escape.push(byte);
                    self.finish_escape(&mut chunks);
                }
            }
        }

        self.flush_text(&mut chunks);
        chunks
    }

    /// Flush any buffered partial escape sequence (stream end).
    pub fn finish(&mut self) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        if !self.pending_escape.is_empty() {
            self.finish_escape(&mut chunks);
        }
        self.flush_text(&mut chunks);
        if !self.line.is_empty() {
            chunks.push(OutputChunk::Line(std::mem::take(&mut self.line)));
        }
        chunks
    }

    fn flush_text(&mut self, chunks: &mut Vec<OutputChunk>) {
        if self.pending_text.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.pending_text).to_string();
        self.line.push_str(&text);
        chunks.push(OutputChunk::Text(text));
        self.pending_text.clear();
    }

    fn finish_escape(&mut self, chunks: &mut Vec<OutputChunk>) {
        chunks.push(OutputChunk::Control(std::mem::take(&mut self.pending_escape)));
        self.state = ParseState::Ground;
    }
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_becomes_text_and_line_chunks() {
        let mut p = StreamProcessor::new();
        let chunks = p.push(b"hello\n");
        assert_eq!(
            chunks,
            vec![
                OutputChunk::Text("hello".to_string()),
                OutputChunk::Line("hello".to_string()),
            ]
        );
    }

    #[test]
    fn csi_sequence_is_isolated() {
        let mut p = StreamProcessor::new();
        let chunks = p.push(b"a\x1b[31mb");
        assert_eq!(
            chunks,
            vec![
                OutputChunk::Text("a".to_string()),
                OutputChunk::Control(b"\x1b[31m".to_vec()),
                OutputChunk::Text("b".to_string()),
            ]
        );
    }

    #[test]
    fn escape_split_across_pushes_is_buffered() {
        let mut p = StreamProcessor::new();
        assert_eq!(p.push(b"\x1b["), vec![]);
        assert_eq!(
            p.push(b"2J"),
            vec![OutputChunk::Control(b"\x1b[2J".to_vec())]
        );
    }

    #[test]
    fn osc_title_sequence_with_bel_terminator() {
        let mut p = StreamProcessor::new();
        let chunks = p.push(b"\x1b]0;title\x07rest");
        assert_eq!(
            chunks,
            vec![
                OutputChunk::Control(b"\x1b]0;title\x07".to_vec()),
                OutputChunk::Text("rest".to_string()),
            ]
        );
    }

    #[test]
    fn crlf_line_endings_are_normalized() {
        let mut p = StreamProcessor::new();
        let chunks = p.push(b"one\r\ntwo\r\n");
        let lines: Vec<_> = chunks
            .iter()
            .filter_map(|c| match c {
                OutputChunk::Line(l) => Some(l.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut p = StreamProcessor::new();
        let chunks = p.push(&[b'a', 0xff, 0xfe, b'b', b'\n']);
        match &chunks[0] {
            OutputChunk::Text(text) => {
                assert!(text.starts_with('a'));
                assert!(text.contains('\u{FFFD}'));
                assert!(text.ends_with('b'));
            }
            other => panic!("expected text chunk, got {other:?}"),
        }
    }

    #[test]
    fn finish_flushes_truncated_escape() {
        let mut p = StreamProcessor::new();
        assert_eq!(p.push(b"\x1b[1;"), vec![]);
        let chunks = p.finish();
        assert_eq!(chunks, vec![OutputChunk::Control(b"\x1b[1;".to_vec())]);
    }

    #[test]
    fn lines_accumulate_across_control_sequences() {
        let mut p = StreamProcessor::new();
        let mut chunks = p.push(b"red:\x1b[31m stop\x1b[0m\n");
        let line = chunks
            .drain(..)
            .find_map(|c| match c {
                OutputChunk::Line(l) => Some(l),
                _ => None,
            })
            .unwrap();
        assert_eq!(line, "red: stop");
    }
}
