//! Session ownership: restore at startup, login/register/logout, and
//! forced logout when the HTTP layer reports an invalidated credential.
//!
//! State machine:
//!
//! ```text
//!   Unknown ──restore──▶ Anonymous ◀──logout / SessionExpired──┐
//!      │                     │                                  │
//!      └──────restore───────▶│──login / register──▶ Authenticated
//! ```
//!
//! Every transition replaces the whole state; token and user are never
//! set or cleared independently.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, ApiError, CredentialProvider, InvalidationNotifier};
use crate::events::{AuthEvent, EventBus, Subscription};
use crate::models::{AuthResponse, LoginRequest, RegisterRequest, User};

use super::credentials::{CredentialStore, StoreError, SESSION_KEYS, TOKEN_KEY, USER_KEY};

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user: User,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Startup, before the stored credential has been read.
    #[default]
    Unknown,
    Anonymous,
    Authenticated(Session),
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, SessionState::Unknown)
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.session().map(|s| &s.user)
    }

    pub fn token(&self) -> Option<&str> {
        self.session().map(|s| s.token.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// The API call failed; the classified error is passed through unchanged.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The server accepted the credentials but they could not be persisted.
    /// Nothing was kept, in storage or in memory.
    #[error("Failed to save session: {0}")]
    Storage(#[from] StoreError),
}

/// The one UI side effect this subsystem performs: sending the user back
/// to a login surface.
pub trait LoginNavigator: Send + Sync {
    fn navigate_to_login(&self);
}

impl<F> LoginNavigator for F
where
    F: Fn() + Send + Sync,
{
    fn navigate_to_login(&self) {
        self()
    }
}

// ============================================================================
// HTTP capability
// ============================================================================

/// Gives the `ApiClient` read access to the stored token and a way to end
/// the session, without the client knowing about `SessionManager`.
pub struct StoredCredentials {
    store: Arc<dyn CredentialStore>,
    events: EventBus,
}

impl StoredCredentials {
    pub fn new(store: Arc<dyn CredentialStore>, events: EventBus) -> Self {
        Self { store, events }
    }
}

#[async_trait]
impl CredentialProvider for StoredCredentials {
    async fn bearer_token(&self) -> anyhow::Result<Option<String>> {
        Ok(self.store.get(TOKEN_KEY).await?)
    }
}

#[async_trait]
impl InvalidationNotifier for StoredCredentials {
    /// Purge both keys, then emit `SessionExpired` once.
    async fn session_invalidated(&self) {
        if let Err(e) = self.store.remove_many(&SESSION_KEYS).await {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        self.events.emit(AuthEvent::SessionExpired);
    }
}

// ============================================================================
// Session manager
// ============================================================================

/// State shared with the `SessionExpired` handler.
struct Shared {
    state: watch::Sender<SessionState>,
    /// Bumped on every clear and every new session, so a restore that raced
    /// with either does not overwrite it.
    epoch: AtomicU64,
    navigator: Arc<dyn LoginNavigator>,
}

impl Shared {
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn set(&self, state: SessionState) -> SessionState {
        self.state.send_replace(state)
    }

    fn clear(&self) -> SessionState {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set(SessionState::Anonymous)
    }

    fn establish(&self, session: Session) -> SessionState {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set(SessionState::Authenticated(session))
    }

    /// Apply a restore result unless a clear happened since `epoch` was read.
    fn restore(&self, epoch: u64, state: SessionState) -> SessionState {
        let mut applied = None;
        self.state.send_if_modified(|current| {
            if self.epoch() != epoch {
                return false;
            }
            let changed = *current != state;
            *current = state.clone();
            applied = Some(state.clone());
            changed
        });
        applied.unwrap_or_else(|| self.state.borrow().clone())
    }

    fn expire(&self) {
        let previous = self.clear();
        if previous.is_authenticated() {
            info!("Session expired, returning to login");
            self.navigator.navigate_to_login();
        } else {
            debug!("Session expired event with no active session");
        }
    }
}

/// One stored key as read at startup. Empty strings count as missing.
enum Slot {
    Missing,
    Present(String),
    Unreadable,
}

/// What the store held at startup.
enum Stored {
    Empty,
    Valid(Session),
    /// Partial, unparseable or unreadable; purged.
    Invalid,
}

/// Sole owner of the canonical session.
///
/// Subscribes to `SessionExpired` on construction and unsubscribes on drop.
/// `login`, `register` and `logout` wait for the startup restore first.
pub struct SessionManager {
    api: ApiClient,
    store: Arc<dyn CredentialStore>,
    events: EventBus,
    shared: Arc<Shared>,
    subscription: Subscription,
    restored: OnceCell<()>,
    /// Held by restore, establish and logout while they touch the store.
    /// The expiry handler cannot take it and relies on the epoch instead.
    store_lock: Mutex<()>,
}

impl SessionManager {
    /// Wire `api` to this session's credentials and subscribe to
    /// `SessionExpired`. The state stays `Unknown` until `restore` runs.
    pub fn new(
        api: ApiClient,
        store: Arc<dyn CredentialStore>,
        events: EventBus,
        navigator: Arc<dyn LoginNavigator>,
    ) -> Self {
        let credentials = Arc::new(StoredCredentials::new(store.clone(), events.clone()));
        let api = api.with_session(credentials);

        let (state, _) = watch::channel(SessionState::Unknown);
        let shared = Arc::new(Shared {
            state,
            epoch: AtomicU64::new(0),
            navigator,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let subscription = events.subscribe(AuthEvent::SessionExpired, move || {
            if let Some(shared) = weak.upgrade() {
                shared.expire();
            }
        });

        Self {
            api,
            store,
            events,
            shared,
            subscription,
            restored: OnceCell::new(),
            store_lock: Mutex::new(()),
        }
    }

    /// Construct and restore in one step.
    pub async fn start(
        api: ApiClient,
        store: Arc<dyn CredentialStore>,
        events: EventBus,
        navigator: Arc<dyn LoginNavigator>,
    ) -> Self {
        let manager = Self::new(api, store, events, navigator);
        manager.restore().await;
        manager
    }

    /// The client every other API call should go through.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.state.borrow().is_authenticated()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.borrow().is_loading()
    }

    pub fn user(&self) -> Option<User> {
        self.shared.state.borrow().user().cloned()
    }

    pub fn token(&self) -> Option<String> {
        self.shared.state.borrow().token().map(str::to_string)
    }

    /// Rebuild in-memory state from the credential store. Never touches the
    /// network. Partial or unparseable stored data is purged and yields
    /// `Anonymous`.
    pub async fn restore(&self) -> SessionState {
        let state = self.load_from_store().await;
        let _ = self.restored.set(());
        state
    }

    async fn ensure_restored(&self) {
        self.restored
            .get_or_init(|| async {
                self.load_from_store().await;
            })
            .await;
    }

    async fn read(&self, key: &str) -> Slot {
        match self.store.get(key).await {
            Ok(Some(value)) if !value.is_empty() => Slot::Present(value),
            Ok(_) => Slot::Missing,
            Err(e) => {
                error!(key, error = %e, "Failed to read stored credential");
                Slot::Unreadable
            }
        }
    }

    async fn read_stored(&self) -> Stored {
        let token = self.read(TOKEN_KEY).await;
        let user = self.read(USER_KEY).await;

        match (token, user) {
            (Slot::Missing, Slot::Missing) => Stored::Empty,
            (Slot::Present(token), Slot::Present(user_json)) => match serde_json::from_str::<User>(&user_json) {
                Ok(user) => Stored::Valid(Session { token, user }),
                Err(e) => {
                    warn!(error = %e, "Stored user record is unparseable");
                    Stored::Invalid
                }
            },
            (token, user) => {
                warn!(
                    has_token = matches!(token, Slot::Present(_)),
                    has_user = matches!(user, Slot::Present(_)),
                    "Stored session is incomplete"
                );
                Stored::Invalid
            }
        }
    }

    async fn load_from_store(&self) -> SessionState {
        let _guard = self.store_lock.lock().await;
        let epoch = self.shared.epoch();

        let state = match self.read_stored().await {
            Stored::Valid(session) => {
                debug!(username = %session.user.username, "Session restored");
                SessionState::Authenticated(session)
            }
            Stored::Empty => {
                debug!("No stored session");
                SessionState::Anonymous
            }
            Stored::Invalid => {
                if let Err(e) = self.store.remove_many(&SESSION_KEYS).await {
                    warn!(error = %e, "Failed to purge invalid stored session");
                }
                SessionState::Anonymous
            }
        };

        self.shared.restore(epoch, state)
    }

    pub async fn login(&self, credentials: &LoginRequest) -> Result<User, SessionError> {
        self.ensure_restored().await;
        let response = self.api.login(credentials).await.map_err(|e| {
            error!(username = %credentials.username, error = %e, "Login failed");
            e
        })?;
        self.establish(response).await
    }

    pub async fn register(&self, data: &RegisterRequest) -> Result<User, SessionError> {
        self.ensure_restored().await;
        let response = self.api.register(data).await.map_err(|e| {
            error!(username = %data.username, error = %e, "Registration failed");
            e
        })?;
        self.establish(response).await
    }

    /// Persist both halves, then publish the new state. On a storage
    /// failure both keys are rolled back and the state is left unchanged.
    async fn establish(&self, response: AuthResponse) -> Result<User, SessionError> {
        let session = Session {
            token: response.access_token,
            user: response.user,
        };

        let _guard = self.store_lock.lock().await;
        if let Err(e) = self.persist(&session).await {
            warn!(error = %e, "Failed to persist session, rolling back");
            if let Err(e) = self.store.remove_many(&SESSION_KEYS).await {
                warn!(error = %e, "Failed to roll back partial session");
            }
            return Err(e.into());
        }

        let user = session.user.clone();
        self.shared.establish(session);
        info!(username = %user.username, "Session established");
        Ok(user)
    }

    async fn persist(&self, session: &Session) -> Result<(), StoreError> {
        let user_json = serde_json::to_string(&session.user)?;
        self.store.set(TOKEN_KEY, &session.token).await?;
        self.store.set(USER_KEY, &user_json).await?;
        Ok(())
    }

    /// Clear persisted and in-memory credentials and go to the login surface.
    /// Storage failures are logged; logout always completes.
    pub async fn logout(&self) {
        self.ensure_restored().await;
        {
            let _guard = self.store_lock.lock().await;
            if let Err(e) = self.store.remove_many(&SESSION_KEYS).await {
                warn!(error = %e, "Failed to clear stored credentials on logout");
            }
            self.clear_session();
        }
        self.shared.navigator.navigate_to_login();
        info!("Logged out");
    }

    /// Drop the in-memory session. Persisted credentials are left to the caller.
    pub fn clear_session(&self) {
        self.shared.clear();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.events.unsubscribe(self.subscription);
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &*self.shared.state.borrow())
            .field("base_url", &self.api.base_url())
            .finish()
    }
}
