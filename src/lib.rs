//! OIDC client application registry library crate.
//!
//! Stores OAuth2/OIDC client applications per tenant together with their OIDC
//! properties, and validates OIDC access tokens against the registered clients.

pub mod config;
pub mod errors;
pub mod oauth;
pub mod storage;
