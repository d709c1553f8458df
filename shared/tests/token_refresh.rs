use async_trait::async_trait;
use medalert_shared::api::ApiError;
use medalert_shared::capabilities::{
    HttpHeaders, HttpRequest, HttpResponse, HttpResult, HttpTransport, MemoryKv,
};
use medalert_shared::session::SESSION_KEYS;
use medalert_shared::{CoreConfig, MedAlertCore};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Auth server that accepts exactly one access token at a time and rotates
/// it on refresh.
struct AuthServer {
    valid_access: Mutex<String>,
    valid_refresh: Mutex<String>,
    refresh_calls: AtomicUsize,
    report_calls: AtomicUsize,
    reject_everything: AtomicBool,
}

impl AuthServer {
    fn new() -> Self {
        Self {
            valid_access: Mutex::new("access-1".into()),
            valid_refresh: Mutex::new("refresh-1".into()),
            refresh_calls: AtomicUsize::new(0),
            report_calls: AtomicUsize::new(0),
            reject_everything: AtomicBool::new(false),
        }
    }

    /// Simulates the server-side expiry of the current access token.
    fn expire_access_token(&self) {
        *self.valid_access.lock().unwrap() = "expired".into();
    }
}

fn reply(status: u16, body: Value, request: &HttpRequest) -> HttpResult {
    Ok(HttpResponse::new(
        status,
        HttpHeaders::new(),
        serde_json::to_vec(&body).unwrap(),
        request.request_id().to_string(),
    ))
}

#[async_trait]
impl HttpTransport for AuthServer {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let path = request.url().path();
        let body: Value = request
            .body()
            .map(|b| serde_json::from_slice(b).unwrap())
            .unwrap_or(Value::Null);

        match path.as_str() {
            "/api/auth/login" => {
                let access = self.valid_access.lock().unwrap().clone();
                let refresh = self.valid_refresh.lock().unwrap().clone();
                reply(
                    200,
                    json!({"accessToken": access, "refreshToken": refresh, "user": {"id": "u1"}}),
                    &request,
                )
            }
            "/api/auth/refresh" => {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                let presented = body["refreshToken"].as_str().unwrap_or_default();
                let mut refresh = self.valid_refresh.lock().unwrap();
                if presented != *refresh {
                    return reply(401, json!({"message": "invalid refresh token"}), &request);
                }
                let generation = self.refresh_calls.load(Ordering::SeqCst) + 1;
                let access = format!("access-{generation}");
                *refresh = format!("refresh-{generation}");
                *self.valid_access.lock().unwrap() = access.clone();
                reply(
                    200,
                    json!({"data": {"accessToken": access, "refreshToken": refresh.clone()}}),
                    &request,
                )
            }
            _ => {
                self.report_calls.fetch_add(1, Ordering::SeqCst);
                let expected = format!("Bearer {}", self.valid_access.lock().unwrap());
                let authorized = request.headers().get("Authorization") == Some(expected.as_str());
                if authorized && !self.reject_everything.load(Ordering::SeqCst) {
                    reply(200, json!({"data": [{"_id": "r1", "status": "pending"}]}), &request)
                } else {
                    reply(401, json!({"message": "jwt expired"}), &request)
                }
            }
        }
    }
}

async fn signed_in() -> (
    Arc<AuthServer>,
    Arc<MemoryKv>,
    MedAlertCore<AuthServer, MemoryKv>,
) {
    let server = Arc::new(AuthServer::new());
    let kv = Arc::new(MemoryKv::new());
    let core = MedAlertCore::new(CoreConfig::default(), Arc::clone(&server), Arc::clone(&kv)).unwrap();
    core.login("ama@example.com", "secret").await.unwrap();
    (server, kv, core)
}

#[tokio::test]
async fn expired_token_is_refreshed_once_and_request_retried() {
    let (server, kv, core) = signed_in().await;

    // 1. Server expires the token; the next call refreshes transparently.
    server.expire_access_token();
    let reports = core.client().list_reports().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.report_calls.load(Ordering::SeqCst), 2);

    // 2. Rotated tokens are persisted and used from then on.
    assert_eq!(kv.raw_get("authToken").await, Some(b"access-2".to_vec()));
    assert_eq!(kv.raw_get("refreshToken").await, Some(b"refresh-2".to_vec()));
    core.client().list_reports().await.unwrap();
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_401_tears_down_the_session_without_another_refresh() {
    let (server, kv, core) = signed_in().await;
    server.reject_everything.store(true, Ordering::SeqCst);

    let err = core.client().list_reports().await.unwrap_err();

    assert!(matches!(err, ApiError::Unauthorized { .. }));
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.report_calls.load(Ordering::SeqCst), 2);
    for key in SESSION_KEYS {
        assert!(kv.raw_get(key).await.is_none(), "{key} should be cleared");
    }
    assert!(!core.session().is_authenticated());

    // A later call goes out unauthenticated and does not try to refresh.
    let err = core.client().list_reports().await.unwrap_err();
    assert!(matches!(err, ApiError::SessionExpired { .. }));
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn revoked_refresh_token_ends_session() {
    let (server, kv, core) = signed_in().await;
    server.expire_access_token();
    *server.valid_refresh.lock().unwrap() = "revoked".into();

    let err = core.client().get_profile().await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(kv.is_empty().await);
}

#[tokio::test]
async fn session_state_notifies_subscribers_on_teardown() {
    let (server, _kv, core) = signed_in().await;
    let mut watcher = core.session().subscribe();
    assert!(watcher.borrow_and_update().is_some());

    server.reject_everything.store(true, Ordering::SeqCst);
    let _ = core.client().list_reports().await;

    watcher.changed().await.unwrap();
    assert!(watcher.borrow().is_none());
}
