//! Aegis Agent: endpoint security agent.
//!
//! Modular structure:
//! - [`collectors`]: process, network, registry and enforcement collectors
//! - [`queue`]: event hand-off between collectors and delivery
//! - [`policy`]: blacklisted processes and protected registry keys
//! - [`node`]: host identity, registration and heartbeat
//! - [`uplink`]: HTTP client for the management server
//! - [`agent`]: orchestrator running the collectors and loops
//! - [`logging`]: structured logging setup

pub mod agent;
pub mod collectors;
pub mod config;
pub mod event;
pub mod logging;
pub mod node;
pub mod policy;
pub mod queue;
pub mod shutdown;
pub mod uplink;

pub use agent::{Agent, AgentError, DeliveryReport};
pub use collectors::{Collector, CollectorError, CollectorKind, ScheduledCollector};
pub use config::AgentConfig;
pub use event::{NodeIdentity, SecurityEvent, Severity};
pub use logging::StructuredLogger;
pub use node::{NodeError, NodeManager, RegistrationState};
pub use policy::PolicyStore;
pub use queue::EventQueue;
pub use shutdown::ShutdownSignal;
pub use uplink::{ApiClient, ApiError, HttpApiClient};
