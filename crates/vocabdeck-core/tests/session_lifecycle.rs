use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vocabdeck_core::api::error::GENERIC_ERROR_MESSAGE;
use vocabdeck_core::auth::{StoreOp, TOKEN_KEY, USER_KEY};
use vocabdeck_core::{
    ApiClient, ApiError, AuthEvent, Config, CredentialStore, EventBus, LoginRequest, MemoryStore,
    RegisterRequest, SessionError, SessionManager, SessionState, User, VocabularyRequest,
};

fn alice() -> User {
    User {
        id: 1,
        first_name: "Alice".to_string(),
        last_name: "Liddell".to_string(),
        username: "alice".to_string(),
        email: "alice@example.com".to_string(),
    }
}

fn auth_body(token: &str) -> serde_json::Value {
    json!({
        "accessToken": token,
        "tokenType": "Bearer",
        "expiresIn": 3600,
        "user": {
            "id": 1,
            "firstName": "Alice",
            "lastName": "Liddell",
            "username": "alice",
            "email": "alice@example.com"
        }
    })
}

fn vocab_body(id: i64, word: &str) -> serde_json::Value {
    json!({
        "id": id,
        "word": word,
        "definition": "a definition",
        "example": "an example",
        "createdAt": "2024-05-01T10:15:30",
        "updatedAt": "2024-05-01T10:15:30"
    })
}

fn seeded_store(token: &str) -> MemoryStore {
    MemoryStore::with_entries([
        (TOKEN_KEY, token.to_string()),
        (USER_KEY, serde_json::to_string(&alice()).unwrap()),
    ])
}

/// Token and user are either both stored or both absent.
fn assert_consistent(store: &MemoryStore) {
    assert_eq!(
        store.contains(TOKEN_KEY),
        store.contains(USER_KEY),
        "store holds exactly one of token/user"
    );
}

struct Fixture {
    server: MockServer,
    store: Arc<MemoryStore>,
    events: EventBus,
    expired: Arc<AtomicUsize>,
    navigations: Arc<AtomicUsize>,
    session: SessionManager,
}

impl Fixture {
    async fn start(store: MemoryStore) -> Self {
        let server = MockServer::start().await;
        let base_url = server.uri();
        Self::with_base_url(server, &base_url, store).await
    }

    async fn with_base_url(server: MockServer, base_url: &str, store: MemoryStore) -> Self {
        let config = Config {
            api_base_url: base_url.to_string(),
            ..Config::default()
        };
        let api = ApiClient::new(&config)
            .unwrap()
            .with_initial_backoff(Duration::from_millis(5));

        let store = Arc::new(store);
        let events = EventBus::new();

        let expired = Arc::new(AtomicUsize::new(0));
        let counter = expired.clone();
        events.subscribe(AuthEvent::SessionExpired, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let navigations = Arc::new(AtomicUsize::new(0));
        let counter = navigations.clone();
        let session = SessionManager::start(
            api,
            store.clone(),
            events.clone(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        Self {
            server,
            store,
            events,
            expired,
            navigations,
            session,
        }
    }

    fn expired(&self) -> usize {
        self.expired.load(Ordering::SeqCst)
    }

    fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Login / register / logout
// ============================================================================

#[tokio::test]
async fn login_establishes_and_persists_session() {
    let f = Fixture::start(MemoryStore::new()).await;
    assert_eq!(f.session.state(), SessionState::Anonymous);

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({"username": "alice", "password": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok1")))
        .expect(1)
        .mount(&f.server)
        .await;

    let user = f
        .session
        .login(&LoginRequest::new("alice", "secret"))
        .await
        .unwrap();

    assert_eq!(user, alice());
    assert!(f.session.is_authenticated());
    assert_eq!(f.session.token().as_deref(), Some("tok1"));
    assert_eq!(f.store.value(TOKEN_KEY).as_deref(), Some("tok1"));
    let stored_user: User = serde_json::from_str(&f.store.value(USER_KEY).unwrap()).unwrap();
    assert_eq!(stored_user, alice());
}

#[tokio::test]
async fn login_accepts_data_envelope() {
    let f = Fixture::start(MemoryStore::new()).await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": auth_body("wrapped") })))
        .mount(&f.server)
        .await;

    f.session
        .login(&LoginRequest::new("alice", "secret"))
        .await
        .unwrap();
    assert_eq!(f.session.token().as_deref(), Some("wrapped"));
}

#[tokio::test]
async fn register_sends_camel_case_body() {
    let f = Fixture::start(MemoryStore::new()).await;

    Mock::given(method("POST"))
        .and(path("/api/auth/register"))
        .and(body_json(json!({
            "firstName": "Alice",
            "lastName": "Liddell",
            "username": "alice",
            "email": "alice@example.com",
            "password": "secret"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(auth_body("tok-reg")))
        .expect(1)
        .mount(&f.server)
        .await;

    let data = RegisterRequest {
        first_name: "Alice".to_string(),
        last_name: "Liddell".to_string(),
        username: "alice".to_string(),
        email: "alice@example.com".to_string(),
        password: "secret".to_string(),
    };
    f.session.register(&data).await.unwrap();

    assert!(f.session.is_authenticated());
    assert_eq!(f.store.value(TOKEN_KEY).as_deref(), Some("tok-reg"));
}

#[tokio::test]
async fn failed_login_leaves_state_unchanged_and_error_unmodified() {
    let f = Fixture::start(MemoryStore::new()).await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "Username is required"})))
        .mount(&f.server)
        .await;

    let err = f
        .session
        .login(&LoginRequest::new("", "secret"))
        .await
        .unwrap_err();

    match err {
        SessionError::Api(ApiError::Request { status, message }) => {
            assert_eq!(status, 400);
            assert_eq!(message, "Username is required");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(f.session.state(), SessionState::Anonymous);
    assert!(f.store.is_empty());
}

#[tokio::test]
async fn bad_credentials_do_not_navigate() {
    let f = Fixture::start(MemoryStore::new()).await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Bad credentials"})))
        .mount(&f.server)
        .await;

    let err = f
        .session
        .login(&LoginRequest::new("alice", "wrong"))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Api(ApiError::Authentication(ref m)) if m == "Bad credentials"));
    assert_eq!(f.session.state(), SessionState::Anonymous);
    assert_eq!(f.expired(), 1);
    assert_eq!(f.navigations(), 0);
}

#[tokio::test]
async fn session_writes_are_all_or_nothing() {
    let f = Fixture::start(MemoryStore::new()).await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({"username": "alice", "password": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok1")))
        .mount(&f.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({"username": "alice", "password": "wrong"})))
        .respond_with(ResponseTemplate::new(401))
        .mount(&f.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("tok2")))
        .mount(&f.server)
        .await;

    let good = LoginRequest::new("alice", "secret");
    let bad = LoginRequest::new("alice", "wrong");
    let register = RegisterRequest {
        first_name: "Alice".to_string(),
        last_name: "Liddell".to_string(),
        username: "alice".to_string(),
        email: "alice@example.com".to_string(),
        password: "secret".to_string(),
    };

    f.session.login(&good).await.unwrap();
    assert_consistent(&f.store);
    f.session.logout().await;
    assert_consistent(&f.store);
    f.session.register(&register).await.unwrap();
    assert_consistent(&f.store);
    let _ = f.session.login(&bad).await;
    assert_consistent(&f.store);
    f.session.login(&good).await.unwrap();
    assert_consistent(&f.store);
    assert_eq!(f.store.value(TOKEN_KEY).as_deref(), Some("tok1"));

    // Second half of the write fails: both halves are rolled back
    f.session.logout().await;
    f.store.fail_key(StoreOp::Set, USER_KEY);
    let err = f.session.login(&good).await.unwrap_err();
    assert!(matches!(err, SessionError::Storage(_)));
    assert_consistent(&f.store);
    assert!(f.store.is_empty());
    assert_eq!(f.session.state(), SessionState::Anonymous);
}

#[tokio::test]
async fn logout_clears_and_navigates() {
    let f = Fixture::start(seeded_store("tok1")).await;
    assert!(f.session.is_authenticated());

    f.session.logout().await;

    assert_eq!(f.session.state(), SessionState::Anonymous);
    assert!(f.store.is_empty());
    assert_eq!(f.navigations(), 1);
    // Logout is local; the invalidation signal is reserved for the server
    assert_eq!(f.expired(), 0);
}

#[tokio::test]
async fn login_before_restore_purges_stale_partial_state_first() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_body("fresh")))
        .mount(&server)
        .await;

    let config = Config {
        api_base_url: server.uri(),
        ..Config::default()
    };
    let store = Arc::new(MemoryStore::with_entries([(TOKEN_KEY, "stray")]));
    let session = SessionManager::new(
        ApiClient::new(&config).unwrap(),
        store.clone(),
        EventBus::new(),
        Arc::new(|| {}),
    );
    assert!(session.is_loading());

    session
        .login(&LoginRequest::new("alice", "secret"))
        .await
        .unwrap();

    assert!(session.is_authenticated());
    assert_eq!(store.value(TOKEN_KEY).as_deref(), Some("fresh"));
    assert!(store.contains(USER_KEY));
}

// ============================================================================
// Restore
// ============================================================================

#[tokio::test]
async fn restore_twice_is_stable_and_offline() {
    let f = Fixture::start(seeded_store("tok1")).await;

    let first = f.session.state();
    let second = f.session.restore().await;

    assert!(first.is_authenticated());
    assert_eq!(first, second);
    assert_eq!(second.token(), Some("tok1"));
    assert!(f.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn restore_rejects_token_without_user() {
    let f = Fixture::start(MemoryStore::with_entries([(TOKEN_KEY, "stray")])).await;

    assert_eq!(f.session.state(), SessionState::Anonymous);
    assert!(!f.store.contains(TOKEN_KEY));
}

#[tokio::test]
async fn restore_rejects_unparseable_user() {
    let store = MemoryStore::with_entries([(TOKEN_KEY, "tok1"), (USER_KEY, "[1, 2")]);
    let f = Fixture::start(store).await;

    assert_eq!(f.session.state(), SessionState::Anonymous);
    assert!(f.store.is_empty());
}

// ============================================================================
// Request interception
// ============================================================================

#[tokio::test]
async fn bearer_token_attached_when_held() {
    let f = Fixture::start(seeded_store("tok1")).await;

    Mock::given(method("GET"))
        .and(path("/api/vocabulary/5"))
        .and(header("Authorization", "Bearer tok1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vocab_body(5, "ephemeral")))
        .expect(1)
        .mount(&f.server)
        .await;

    let vocab = f.session.api().fetch_vocabulary_item(5).await.unwrap();
    assert_eq!(vocab.word, "ephemeral");
}

#[tokio::test]
async fn anonymous_requests_carry_no_authorization() {
    let f = Fixture::start(MemoryStore::new()).await;

    Mock::given(method("GET"))
        .and(path("/api/vocabulary/5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vocab_body(5, "ephemeral")))
        .mount(&f.server)
        .await;

    f.session.api().fetch_vocabulary_item(5).await.unwrap();

    let requests = f.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn unreadable_store_degrades_to_unauthenticated() {
    let f = Fixture::start(seeded_store("tok1")).await;
    f.store.fail(StoreOp::Get);

    Mock::given(method("GET"))
        .and(path("/api/vocabulary/5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vocab_body(5, "ephemeral")))
        .mount(&f.server)
        .await;

    f.session.api().fetch_vocabulary_item(5).await.unwrap();

    let requests = f.server.received_requests().await.unwrap();
    assert!(!requests[0].headers.contains_key("authorization"));
}

// ============================================================================
// Response interception
// ============================================================================

#[tokio::test]
async fn unauthorized_response_ends_session() {
    let f = Fixture::start(seeded_store("tok1")).await;

    Mock::given(method("GET"))
        .and(path("/api/vocabulary"))
        .and(query_param("page", "0"))
        .and(query_param("size", "20"))
        .and(header("Authorization", "Bearer tok1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Token expired"})))
        .expect(1)
        .mount(&f.server)
        .await;

    let err = f.session.api().fetch_vocabulary(0, 20).await.unwrap_err();

    assert_eq!(err, ApiError::Authentication("Token expired".to_string()));
    assert!(f.store.is_empty());
    assert_eq!(f.expired(), 1);
    assert_eq!(f.session.state(), SessionState::Anonymous);
    assert_eq!(f.navigations(), 1);
}

#[tokio::test]
async fn unauthorized_and_forbidden_converge() {
    let f = Fixture::start(seeded_store("tok1")).await;

    Mock::given(method("GET"))
        .and(path("/api/vocabulary/1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/vocabulary/2"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&f.server)
        .await;

    let err = f.session.api().fetch_vocabulary_item(1).await.unwrap_err();
    assert!(matches!(err, ApiError::Authentication(_)));
    assert!(f.store.is_empty());
    assert_eq!(f.expired(), 1);
    assert_eq!(f.session.state(), SessionState::Anonymous);

    // Hold a token again
    f.store.set(TOKEN_KEY, "tok2").await.unwrap();
    f.store
        .set(USER_KEY, &serde_json::to_string(&alice()).unwrap())
        .await
        .unwrap();
    assert!(f.session.restore().await.is_authenticated());

    let err = f.session.api().fetch_vocabulary_item(2).await.unwrap_err();
    assert!(matches!(err, ApiError::Permission(_)));
    assert!(f.store.is_empty());
    assert_eq!(f.expired(), 2);
    assert_eq!(f.session.state(), SessionState::Anonymous);
    assert_eq!(f.navigations(), 2);
}

#[tokio::test]
async fn other_errors_leave_session_alone() {
    let f = Fixture::start(seeded_store("tok1")).await;

    Mock::given(method("POST"))
        .and(path("/api/vocabulary"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "Bad Request"})))
        .mount(&f.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/vocabulary/3"))
        .respond_with(ResponseTemplate::new(500).set_body_string("stack trace"))
        .mount(&f.server)
        .await;

    let err = f
        .session
        .api()
        .create_vocabulary(&VocabularyRequest::new(""))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ApiError::Request {
            status: 400,
            message: "Bad Request".to_string()
        }
    );

    let err = f.session.api().delete_vocabulary(3).await.unwrap_err();
    assert_eq!(err.to_string(), GENERIC_ERROR_MESSAGE);

    assert_eq!(f.store.len(), 2);
    assert_eq!(f.expired(), 0);
    assert!(f.session.is_authenticated());
}

#[tokio::test]
async fn network_failure_leaves_session_alone() {
    let server = MockServer::start().await;
    // Nothing listens on port 1
    let f = Fixture::with_base_url(server, "http://127.0.0.1:1", seeded_store("tok1")).await;

    let err = f.session.api().fetch_vocabulary(0, 20).await.unwrap_err();

    assert_eq!(err, ApiError::Network);
    assert_eq!(err.to_string(), "Network error. Please check your connection.");
    assert_eq!(f.store.len(), 2);
    assert_eq!(f.expired(), 0);
    assert!(f.session.is_authenticated());
}

#[tokio::test]
async fn undecodable_success_body_is_unexpected() {
    let f = Fixture::start(seeded_store("tok1")).await;

    Mock::given(method("GET"))
        .and(path("/api/vocabulary/8"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&f.server)
        .await;

    let err = f.session.api().fetch_vocabulary_item(8).await.unwrap_err();
    assert_eq!(err, ApiError::Unexpected);
    assert!(f.session.is_authenticated());
}

#[tokio::test]
async fn rate_limited_requests_are_retried() {
    let f = Fixture::start(seeded_store("tok1")).await;

    Mock::given(method("GET"))
        .and(path("/api/vocabulary/4"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/vocabulary/4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vocab_body(4, "gloaming")))
        .expect(1)
        .mount(&f.server)
        .await;

    let vocab = f.session.api().fetch_vocabulary_item(4).await.unwrap();
    assert_eq!(vocab.word, "gloaming");
}

#[tokio::test]
async fn rate_limit_gives_up_after_max_retries() {
    let f = Fixture::start(seeded_store("tok1")).await;

    Mock::given(method("GET"))
        .and(path("/api/vocabulary/4"))
        .respond_with(ResponseTemplate::new(429))
        .expect(4)
        .mount(&f.server)
        .await;

    let err = f.session.api().fetch_vocabulary_item(4).await.unwrap_err();
    assert_eq!(
        err,
        ApiError::Request {
            status: 429,
            message: GENERIC_ERROR_MESSAGE.to_string()
        }
    );
}

// ============================================================================
// Vocabulary pass-through
// ============================================================================

#[tokio::test]
async fn vocabulary_crud_round_trip() {
    let f = Fixture::start(seeded_store("tok1")).await;

    Mock::given(method("GET"))
        .and(path("/api/vocabulary"))
        .and(query_param("page", "1"))
        .and(query_param("size", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [vocab_body(3, "ephemeral"), vocab_body(4, "gloaming")],
            "totalPages": 3,
            "totalElements": 5,
            "size": 2,
            "number": 1,
            "first": false,
            "last": false,
            "empty": false
        })))
        .mount(&f.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/vocabulary"))
        .and(body_json(json!({"word": "petrichor", "definition": "smell of rain"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(vocab_body(9, "petrichor")))
        .expect(1)
        .mount(&f.server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/vocabulary/9"))
        .and(body_json(json!({"word": "petrichor", "example": "after the storm"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(vocab_body(9, "petrichor")))
        .expect(1)
        .mount(&f.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/vocabulary/9"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&f.server)
        .await;

    let api = f.session.api();

    let page = api.fetch_vocabulary(1, 2).await.unwrap();
    assert_eq!(page.content.len(), 2);
    assert_eq!(page.number, 1);
    assert_eq!(page.total_elements, 5);

    let created = api
        .create_vocabulary(&VocabularyRequest::new("petrichor").with_definition("smell of rain"))
        .await
        .unwrap();
    assert_eq!(created.id, 9);

    api.update_vocabulary(9, &VocabularyRequest::new("petrichor").with_example("after the storm"))
        .await
        .unwrap();
    api.delete_vocabulary(9).await.unwrap();
}

#[tokio::test]
async fn dropped_session_manager_stops_listening() {
    let f = Fixture::start(seeded_store("tok1")).await;
    // The fixture's own counter plus the manager's handler
    assert_eq!(f.events.handler_count(AuthEvent::SessionExpired), 2);

    let events = f.events.clone();
    drop(f);
    assert_eq!(events.handler_count(AuthEvent::SessionExpired), 1);
}
