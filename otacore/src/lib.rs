//! OtaCore - decision core for an over-the-air update client.
//!
//! This library negotiates with an update server over a request/response
//! protocol, decides whether an available update may be downloaded and
//! applied now, tracks multi-URL download progress and failure history
//! durably across restarts and reboots, and enforces staged-rollout and
//! anti-rollback policy.
//!
//! # Architecture
//!
//! ```text
//! UpdateOrchestrator (attempt state machine)
//!         │
//!         ├── UpdateChecker (request build, deferral policy)
//!         │       └── protocol (request assembly, response parsing)
//!         │
//!         ├── PayloadState (durable failover/backoff bookkeeping)
//!         │       └── PrefStore (typed key-value persistence)
//!         │
//!         └── collaborators (HttpClient, Clock, BootControl,
//!             DevicePolicy, ConnectionMonitor, MetricsReporter)
//! ```
//!
//! The heavy lifting of payload download, verification, and application is
//! delegated to a `PayloadInstaller` collaborator; this crate owns only the
//! decision logic around it.

pub mod boot;
pub mod checker;
pub mod clock;
pub mod download;
pub mod errors;
pub mod http;
pub mod metrics;
pub mod orchestrator;
pub mod payload_state;
pub mod policy;
pub mod prefs;
pub mod protocol;

pub use checker::{CheckDecision, CheckError, CheckOutcome, UpdateChecker};
pub use errors::ErrorCode;
pub use orchestrator::{InstallPlan, PayloadInstaller, UpdateOrchestrator, UpdateStatus};
pub use payload_state::PayloadState;
pub use protocol::response::Response;
