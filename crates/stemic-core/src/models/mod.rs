//! Data models for the STEMIC authentication API.
//!
//! These types mirror the JSON bodies exchanged with the `/auth` endpoints.
//! Field aliases cover both the camelCase and snake_case spellings the
//! server has used.

pub mod user;

pub use user::{RegisterRequest, TokenPair, UserProfile};
