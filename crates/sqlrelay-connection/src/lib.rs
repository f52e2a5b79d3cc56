//! SQL Relay connection daemon
//!
//! A connection daemon owns one authenticated backend session and a fixed
//! pool of cursors. Its life is a loop: announce availability through the
//! rendezvous, take a hand-off from the listener, run the client protocol
//! until the session ends, sanitize the backend session, announce again.

pub mod cursor;
pub mod daemon;
pub mod handoff;
pub mod session;
pub mod stats;
pub mod temp_tables;

pub use cursor::{Cursor, CursorPool, CursorState};
pub use daemon::{Daemon, DaemonOptions};
pub use session::{Controller, ControllerSettings, SessionOutcome};
pub use stats::StatsSink;
