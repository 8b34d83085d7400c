//! REST API client module for the vocabulary server.
//!
//! This module provides the `ApiClient`, the single point of egress for
//! every API call. It attaches the bearer token from a `CredentialProvider`
//! and classifies every failure into an `ApiError`. On 401/403 it asks the
//! `InvalidationNotifier` to end the session instead of touching session
//! state itself.

pub mod client;
pub mod endpoints;
pub mod error;

pub use client::{ApiClient, CredentialProvider, InvalidationNotifier};
pub use error::ApiError;
