//! OAuth2 client application management.
//!
//! Registration, lookup, update and removal of client applications, and the
//! origin templating applied to first-party callbacks.

pub mod callback;
pub mod registry;

pub use callback::FirstPartyApp;
pub use registry::{ClientRegistry, TenantPurge};
