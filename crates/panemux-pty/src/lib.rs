// Terminal I/O engine
//
// Owns one spawned process and its PTY per pane, and provides byte-level
// bidirectional streaming with flow control: a blocking reader thread feeds
// a bounded channel (the pane's finite output stream), a writer thread
// drains a bounded input queue, and a scrollback ring retains the tail of
// the raw output for capture. Control-sequence interpretation is limited to
// chunk classification; rendering is a consumer concern.

mod process;
mod scrollback;
mod stream;
mod transcript;

pub use process::{PtyCommand, PtyProcess};
pub use scrollback::Scrollback;
pub use stream::{OutputChunk, StreamProcessor};
pub use transcript::TranscriptLogger;

/// Read buffer size for the PTY reader thread.
pub(crate) const READ_BUF_SIZE: usize = 4096;
