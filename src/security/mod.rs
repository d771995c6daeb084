//! Security Module
//!
//! Static credentials for the two authentication mechanisms: gateway
//! username/password (AUTH) and instance shared key (NAUTH).

mod auth;

pub use auth::{Credentials, SharedKey};
