//! Bridging core for handing eSIM activation codes to the operating system.
//!
//! The pieces are wired together by [`machine::Provisioner`]: it owns the
//! attempt state, writes the pending code into the shared
//! [`store::ActivationCodeStore`], and reports every step on the
//! [`bus::EventBus`]. The OS pulls the code back through
//! [`endpoint::ProvisioningEndpoint`], and page scripts reach the provisioner
//! through [`bridge::SyncBridge`].

pub mod bridge;
pub mod bus;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod fault;
pub mod machine;
pub mod page;
pub mod platform;
pub mod store;
pub mod strategy;

pub use bus::{EventBus, Subscription};
pub use config::EsimConfig;
pub use error::{MethodError, PlatformError};
pub use event::{Event, EventKind};
pub use machine::{AttemptState, Provisioner};
pub use store::{ActivationCode, ActivationCodeStore};
