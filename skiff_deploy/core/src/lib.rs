//! Skiff deployment engine.
//!
//! Declarative, agentless deployment for small fleets of container hosts:
//! one config file drives host preparation, image distribution, blue/green
//! app deploys, in-place service replacement, and the per-host edge proxy
//! that terminates TLS and routes by hostname.
//!
//! The pieces compose bottom-up: a [`session::HostSession`] executes commands
//! on one host; [`runtime`] builds container CLI commands; [`fingerprint`]
//! and [`plan`] decide whether anything must change; [`deploy`] executes the
//! blue/green or stop/start transition; [`proxy`] programs the edge;
//! [`deployment::Deployment`] drives it all across hosts.

pub mod config;
pub use config::{Config, Workload, WorkloadKind};

pub mod secrets;
pub use secrets::SecretStore;

pub mod session;
pub use session::{CommandError, HostSession};

pub mod runtime;
pub use runtime::ContainerRuntime;

pub mod fingerprint;
pub use fingerprint::Fingerprint;

pub mod plan;
pub use plan::{Decision, RedeployReason};

pub mod image;

pub mod deploy;

pub mod proxy;
pub use proxy::ProxyController;

pub mod deployment;
pub use deployment::{DeployOptions, Deployment, RunReport};

pub mod progress;
pub use progress::ProgressTracker;

pub mod util;
