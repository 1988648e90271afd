// Backend abstraction
//
// One capability set, multiple strategies: the manager talks to a
// `TerminalBackend` trait object and never branches on the concrete kind.
// Three adapters ship here: tmux (external multiplexer), local (in-process
// PTY engine), and mock (deterministic in-memory, for hermetic tests).

mod backend;
mod local;
mod mock;
mod tmux;

pub use backend::{
    create_backend, BackendKind, BackendSessionInfo, CreatedPane, CreatedSession, PaneSpec,
    TerminalBackend,
};
pub use local::PtyLocalBackend;
pub use mock::MockBackend;
pub use tmux::TmuxBackend;
