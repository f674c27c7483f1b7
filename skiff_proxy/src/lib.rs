//! Skiff edge proxy.
//!
//! A single per-host daemon that owns ports 80/443, routes by hostname to
//! containers on project networks, terminates TLS with ACME-issued
//! certificates, and persists every routing mutation to an atomic JSON
//! journal. The deploy engine drives it through the CLI verbs in
//! [`control`], executed inside the container.

pub mod acme;
pub mod control;
pub mod server;
pub mod state;
pub mod tls;

pub use control::{Command, ProxyContext, Response};
pub use server::RunOptions;
pub use state::{ProxyState, StateJournal};
pub use tls::CertStore;
