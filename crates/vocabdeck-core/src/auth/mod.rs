//! Authentication module owning the session lifecycle.
//!
//! This module provides:
//! - `CredentialStore`: persisted storage for the token and user record
//! - `SessionManager`: the single owner of session state; restores it at
//!   startup, performs login/register/logout, and reacts to
//!   `SessionExpired` events raised by the HTTP layer
//! - `StoredCredentials`: the capability the `ApiClient` uses to read the
//!   token and to end the session on 401/403

pub mod credentials;
pub mod session;

pub use credentials::{
    CredentialStore, FileStore, KeyringStore, MemoryStore, StoreError, StoreOp, SESSION_KEYS,
    TOKEN_KEY, USER_KEY,
};
pub use session::{LoginNavigator, Session, SessionError, SessionManager, SessionState, StoredCredentials};
