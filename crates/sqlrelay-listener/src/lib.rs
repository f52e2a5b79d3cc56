//! SQL Relay listener
//!
//! A single process accepting client sockets and dispatching each to an
//! idle connection daemon through the rendezvous. The listener holds no
//! per-session state: it forks a bounded child per accepted client for
//! the hand-off step and forgets the client the moment the descriptor is
//! passed (or the proxy relay ends).

pub mod ip_filter;
pub mod listener;
pub mod proxy;

pub use ip_filter::IpFilter;
pub use listener::Listener;
