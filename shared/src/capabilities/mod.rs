mod http;
mod kv;

#[cfg(feature = "network")]
mod network;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS,
};
pub use self::kv::{
    KeyNamespace, KeyValueBackend, KvError, KvKey, KvOperation, KvOutput, KvResult, MemoryKv,
    StorageErrorCode, APP_TAG,
};

#[cfg(feature = "network")]
pub use self::network::ReqwestTransport;

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKv;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! Failure-injectable capabilities for exercising the layers above.

    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Wraps a [`MemoryKv`], counting writes and failing on demand.
    #[derive(Default)]
    pub struct FailableKv {
        inner: MemoryKv,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        writes: AtomicUsize,
    }

    impl FailableKv {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn inner(&self) -> &MemoryKv {
            &self.inner
        }

        pub fn set_fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        /// Writes attempted, including ones that were made to fail.
        pub fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeyValueBackend for FailableKv {
        async fn execute(&self, operation: KvOperation) -> KvResult {
            if operation.is_write() {
                self.writes.fetch_add(1, Ordering::SeqCst);
                if self.fail_writes.load(Ordering::SeqCst) {
                    return Err(KvError::storage(StorageErrorCode::IoError, "Injected write failure"));
                }
            } else if self.fail_reads.load(Ordering::SeqCst) {
                return Err(KvError::storage(StorageErrorCode::IoError, "Injected read failure"));
            }
            self.inner.execute(operation).await
        }
    }

    /// Replays canned responses in order and records every request.
    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<HttpResult>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_json(&self, status: u16, body: serde_json::Value) {
            let body = serde_json::to_vec(&body).unwrap_or_default();
            self.push(Ok(HttpResponse::new(
                status,
                HttpHeaders::new(),
                body,
                "scripted".to_string(),
            )));
        }

        pub fn push_error(&self, error: HttpError) {
            self.push(Err(error));
        }

        pub fn push(&self, result: HttpResult) {
            if let Ok(mut responses) = self.responses.lock() {
                responses.push_back(result);
            }
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().map(|r| r.clone()).unwrap_or_default()
        }

        pub fn paths(&self) -> Vec<String> {
            self.requests().iter().map(|r| r.url().path()).collect()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            let request_id = request.request_id().to_string();
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            let next = self.responses.lock().ok().and_then(|mut r| r.pop_front());
            next.unwrap_or_else(|| {
                Err(HttpError::ConnectionError {
                    host: "scripted".into(),
                    message: format!("no scripted response for {request_id}"),
                })
            })
        }
    }
}
