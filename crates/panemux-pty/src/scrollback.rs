use std::collections::VecDeque;

/// Bounded ring of decoded output lines, retained per pane for capture.
///
/// The ring holds at most `max_lines` complete lines plus the current
/// partial line; the oldest lines are evicted first. Bytes are decoded
/// lossily so malformed sequences never poison the buffer.
pub struct Scrollback {
    lines: VecDeque<String>,
    partial: String,
    max_lines: usize,
}

impl Scrollback {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: String::new(),
            max_lines: max_lines.max(1),
        }
    }

    /// Append a raw chunk, splitting completed lines into the ring.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        for ch in text.chars() {
            match ch {
                '\n' => {
                    let line = std::mem::take(&mut self.partial);
                    self.push_line(line.strip_suffix('\r').unwrap_or(&line).to_string());
                }
                _ => self.partial.push(ch),
            }
        }
    }

    fn push_line(&mut self, line: String) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Last `max_lines` lines, oldest first, including the partial line.
    pub fn tail(&self, max_lines: usize) -> Vec<String> {
        let mut all: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            all.push(self.partial.clone());
        }
        let skip = all.len().saturating_sub(max_lines);
        all.split_off(skip)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_and_keeps_partial_tail() {
        let mut sb = Scrollback::new(100);
        sb.push_bytes(b"one\ntwo\npar");
        assert_eq!(sb.tail(10), vec!["one", "two", "par"]);
        sb.push_bytes(b"tial\n");
        assert_eq!(sb.tail(10), vec!["one", "two", "partial"]);
    }

    #[test]
    fn ring_evicts_oldest_lines() {
        let mut sb = Scrollback::new(3);
        sb.push_bytes(b"1\n2\n3\n4\n5\n");
        assert_eq!(sb.tail(10), vec!["3", "4", "5"]);
        assert_eq!(sb.len(), 3);
    }

    #[test]
    fn tail_truncates_from_the_back() {
        let mut sb = Scrollback::new(100);
        sb.push_bytes(b"a\nb\nc\nd\n");
        assert_eq!(sb.tail(2), vec!["c", "d"]);
        assert_eq!(sb.tail(0), Vec::<String>::new());
    }

    #[test]
    fn crlf_is_stripped() {
        let mut sb = Scrollback::new(100);
        sb.push_bytes(b"windows\r\nline\r\n");
        assert_eq!(sb.tail(10), vec!["windows", "line"]);
    }

    #[test]
    fn invalid_utf8_decodes_with_replacement() {
        let mut sb = Scrollback::new(100);
        sb.push_bytes(&[0xff, b'x', b'\n']);
        let tail = sb.tail(1);
        assert!(tail[0].contains('\u{FFFD}'));
    }
}
