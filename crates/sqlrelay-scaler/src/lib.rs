//! SQL Relay scaler and launcher
//!
//! The scaler keeps the daemon fleet between the configured minimum and
//! maximum: it spawns daemons when clients queue up and reaps the dead.
//! The launcher (`sqlr-start`) brings up a whole instance: listener,
//! initial daemons apportioned by connect-string metric, then the
//! scaler.

pub mod scaler;
pub mod start;

pub use scaler::Scaler;
