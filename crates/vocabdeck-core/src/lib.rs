//! Core library for vocabdeck, a vocabulary flashcard client.
//!
//! The interesting part is the session lifecycle:
//!
//! - [`api::ApiClient`] is the single point of egress. It attaches the
//!   stored bearer token and classifies every failure into an
//!   [`api::ApiError`]. On 401/403 it purges the stored credential and
//!   emits [`events::AuthEvent::SessionExpired`].
//! - [`events::EventBus`] carries that signal out of the HTTP layer.
//! - [`auth::SessionManager`] owns the session, restores it at startup,
//!   and clears it when the signal arrives.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vocabdeck_core::{ApiClient, Config, EventBus, LoginRequest, MemoryStore, SessionManager};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::default();
//! let session = SessionManager::start(
//!     ApiClient::new(&config)?,
//!     Arc::new(MemoryStore::new()),
//!     EventBus::new(),
//!     Arc::new(|| println!("Please log in again")),
//! )
//! .await;
//!
//! session.login(&LoginRequest::new("alice", "secret")).await?;
//! let page = session.api().fetch_vocabulary(0, 20).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod events;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use auth::{
    CredentialStore, FileStore, KeyringStore, LoginNavigator, MemoryStore, SessionError,
    SessionManager, SessionState, StoreError,
};
pub use config::{Config, CredentialBackend};
pub use events::{AuthEvent, EventBus};
pub use models::{AuthResponse, LoginRequest, Page, RegisterRequest, User, Vocabulary, VocabularyRequest};
