//! REST API client module for the STEMIC platform.
//!
//! This module provides the `ApiClient` for the authentication endpoints:
//! the credential exchanges that issue bearer tokens and the refresh
//! exchange used by the session manager.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
