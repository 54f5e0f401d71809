//! Upstream Call Routing
//!
//! ```text
//! DispatchRequest ("provider,model")
//!          |
//!          v
//! +--------------------+
//! | RequestDispatcher  |  <-- parse target, one catalog policy lookup
//! +---------+----------+
//!           |
//!           v
//! +--------------------+
//! |  KeyRotationGate   |  <-- lease a credential under its ceiling
//! +---------+----------+
//!           |
//!           v
//! +--------------------+
//! | TransformPipeline  |  <-- provider wire format, upstream I/O
//! +--------------------+
//! ```

pub mod catalog;
pub mod dispatcher;
pub mod gate;

pub use catalog::{CredentialSpec, Enablement, ProviderCatalog, ProviderConfig, Secret, StaticCatalog};
pub use dispatcher::{
    DispatchOutcome, DispatchRequest, DispatcherConfig, ModelTarget, RequestDispatcher,
};
pub use gate::{
    AcquirePolicy, CredentialLease, GateConfig, KeyRotationGate, PoolStats, SlotSnapshot,
};
