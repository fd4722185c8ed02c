use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use studiosync_flags::config::DEFAULT_TEST_CONFIG;
use studiosync_flags::evaluation_cache::EvaluationCacheManager;
use studiosync_flags::flag_store::SharedFlagStore;
use studiosync_flags::router::router;
use studiosync_flags::test_utils::MemoryFlagStore;

pub struct ServerHandle {
    pub addr: SocketAddr,
    /// Shares state with the running server; tests seed and inspect through it.
    pub store: MemoryFlagStore,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    /// Serves the full router over an in-memory store on an ephemeral port.
    /// No database is involved; the store double runs the same validation as
    /// the Postgres one.
    pub async fn for_memory_store() -> ServerHandle {
        let store = MemoryFlagStore::new();
        let shared: SharedFlagStore = Arc::new(store.clone());
        let evaluation_cache = Arc::new(EvaluationCacheManager::new(shared.clone(), None, None));
        let app = router(shared, evaluation_cache, DEFAULT_TEST_CONFIG.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { notify.notified().await })
                .await
                .unwrap()
        });
        ServerHandle {
            addr,
            store,
            shutdown,
        }
    }

    /// GET with an arbitrary header set, for exercising identity validation.
    pub async fn send_request(&self, path_and_query: &str, headers: &[(&str, &str)]) -> reqwest::Response {
        let client = reqwest::Client::new();
        let mut request = client.get(format!("http://{:?}{}", self.addr, path_and_query));
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        request.send().await.expect("failed to send request")
    }

    pub async fn send_active_request(&self, subject_id: &str, role: &str) -> reqwest::Response {
        self.send_request(
            "/flags/active",
            &[("X-Subject-Id", subject_id), ("X-Subject-Role", role)],
        )
        .await
    }

    /// `query` is appended verbatim, e.g. `"?key=dark_mode"` or `""`.
    pub async fn send_check_request(
        &self,
        query: &str,
        subject_id: &str,
        role: &str,
    ) -> reqwest::Response {
        self.send_request(
            &format!("/flags/check{}", query),
            &[("X-Subject-Id", subject_id), ("X-Subject-Role", role)],
        )
        .await
    }

    pub async fn admin_get(&self, path: &str) -> reqwest::Response {
        let client = reqwest::Client::new();
        client
            .get(format!("http://{:?}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn admin_post<T: Into<reqwest::Body>>(&self, path: &str, body: T) -> reqwest::Response {
        let client = reqwest::Client::new();
        client
            .post(format!("http://{:?}{}", self.addr, path))
            .body(body)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn admin_put<T: Into<reqwest::Body>>(&self, path: &str, body: T) -> reqwest::Response {
        let client = reqwest::Client::new();
        client
            .put(format!("http://{:?}{}", self.addr, path))
            .body(body)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn admin_delete(&self, path: &str) -> reqwest::Response {
        let client = reqwest::Client::new();
        client
            .delete(format!("http://{:?}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}

/// Seeds a flag through the admin API and returns the created body.
pub async fn create_flag(server: &ServerHandle, body: Value) -> Value {
    let res = server.admin_post("/admin/flags", body.to_string()).await;
    assert_eq!(
        reqwest::StatusCode::CREATED,
        res.status(),
        "flag creation failed"
    );
    res.json().await.expect("failed to parse response")
}

/// Seeds an override through the admin API and returns the created body.
pub async fn create_override(server: &ServerHandle, body: Value) -> Value {
    let res = server.admin_post("/admin/overrides", body.to_string()).await;
    assert_eq!(
        reqwest::StatusCode::CREATED,
        res.status(),
        "override creation failed"
    );
    res.json().await.expect("failed to parse response")
}
