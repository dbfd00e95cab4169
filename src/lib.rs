//! Service-registry client for RPC providers and consumers.
//!
//! Providers announce themselves as ephemeral nodes under
//! `/<namespace>/<service>/<category>`; consumers watch those paths and get
//! typed add/remove notifications.  Sessions are supervised, and everything
//! registered or subscribed is replayed after a session expiry.

pub mod config;
pub mod coordination;
pub mod error;
pub mod health;
pub mod metadata;
pub mod metrics;
pub mod registry;
pub mod url;

pub use error::{RegistryError, Result};
pub use registry::{EventKind, Registry, ServiceEvent, SessionState, Subscription};
pub use url::{Category, ServiceUrl};
