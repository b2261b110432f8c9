//! Backend handler scenarios: proxying reads and writes through data
//! agents, resource release on every exit path, and the two-phase
//! import flow. The backend runs as a real axum server; the data agent
//! on the far side is a scripted HTTP server.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use k8s_openapi::api::batch::v1::Job;

use knit_internal::{
    cluster::{Cluster, DataAgentHandle, JobPhase},
    domain::{
        data::DataAgent,
        plan::PseudoPlanName,
        run::KnitRunStatus,
        tag::{Tag, TagSet},
    },
    errors::KnitError,
    handlers::{BackendState, backend_router},
    keychain::{HmacKeyProvider, KeyProvider},
    store::{memory::MemoryStore, DataStore, GarbageStore, RunStore},
};

// --- the scripted data agent ------------------------------------------

#[derive(Clone)]
struct AgentScript {
    status: StatusCode,
    headers: Vec<(&'static str, &'static str)>,
    body: &'static [u8],
    trailers: Vec<(&'static str, &'static str)>,
}

impl AgentScript {
    fn ok_with_trailer() -> Self {
        Self {
            status: StatusCode::OK,
            headers: vec![
                ("content-type", "text/plain"),
                ("x-some-header-for-test", "aaa"),
                ("x-some-header-for-test", "bbb"),
            ],
            body: b"quick brown fox jumps over a lazy dog",
            trailers: vec![("example-trailer", "example trailer payload")],
        }
    }

    fn rejection() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            headers: vec![("content-type", "application/json")],
            body: br#"{"message": "fake error."}"#,
            trailers: vec![],
        }
    }
}

struct SeenRequest {
    headers: HeaderMap,
    body: Bytes,
    trailers: Option<HeaderMap>,
}

#[derive(Clone)]
struct FakeAgentState {
    script: AgentScript,
    seen: Arc<Mutex<Option<SeenRequest>>>,
}

async fn fake_agent_handler(State(st): State<FakeAgentState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let collected = body.collect().await.expect("collect request");
    *st.seen.lock().expect("lock") = Some(SeenRequest {
        headers: parts.headers,
        trailers: collected.trailers().cloned(),
        body: collected.to_bytes(),
    });

    let mut builder = Response::builder().status(st.script.status);
    for (name, value) in &st.script.headers {
        builder = builder.header(*name, *value);
    }
    let body = if st.script.trailers.is_empty() {
        Body::from(st.script.body)
    } else {
        let mut trailer_map = HeaderMap::new();
        for (name, value) in &st.script.trailers {
            trailer_map.append(
                axum::http::HeaderName::from_static(name),
                value.parse().expect("trailer value"),
            );
        }
        Body::new(
            Full::new(Bytes::from_static(st.script.body)).with_trailers(async move {
                Some(Ok::<_, std::convert::Infallible>(trailer_map))
            }),
        )
    };
    builder.body(body).expect("response")
}

async fn start_fake_agent(script: AgentScript) -> (SocketAddr, Arc<Mutex<Option<SeenRequest>>>) {
    let seen = Arc::new(Mutex::new(None));
    let state = FakeAgentState {
        script,
        seen: seen.clone(),
    };
    let app = axum::Router::new()
        .fallback(fake_agent_handler)
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, seen)
}

/// A server that reads a little and slams the connection shut.
async fn start_disconnecting_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut buffer = [0u8; 256];
                let _ = socket.read(&mut buffer).await;
                // drop the socket: reset mid-request
            });
        }
    });
    addr
}

// --- the scripted cluster ---------------------------------------------

struct HandlerCluster {
    agent_target: Mutex<Option<SocketAddr>>,
    broken_handles: Mutex<bool>,
    spawn_error: Mutex<Option<KnitError>>,
    spawned: AtomicUsize,
    closed: Arc<AtomicUsize>,
    pvc_bound: Mutex<Result<bool, KnitError>>,
}

impl HandlerCluster {
    fn new() -> Self {
        Self {
            agent_target: Mutex::new(None),
            broken_handles: Mutex::new(false),
            spawn_error: Mutex::new(None),
            spawned: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            pvc_bound: Mutex::new(Ok(true)),
        }
    }

    fn targeting(addr: SocketAddr) -> Self {
        let cluster = Self::new();
        *cluster.agent_target.lock().expect("lock") = Some(addr);
        cluster
    }
}

struct FakeHandle {
    url: Option<http::Uri>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl DataAgentHandle for FakeHandle {
    fn url(&self) -> Result<http::Uri, KnitError> {
        self.url
            .clone()
            .ok_or_else(|| KnitError::internal("agent has no address"))
    }

    async fn close(&self) -> Result<(), KnitError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Cluster for HandlerCluster {
    async fn submit_worker(&self, _job: &Job) -> Result<(), KnitError> {
        unreachable!("handlers never submit jobs")
    }
    async fn worker_status(&self, _name: &str) -> Result<JobPhase, KnitError> {
        unreachable!("handlers never observe jobs")
    }
    async fn delete_worker(&self, _name: &str) -> Result<(), KnitError> {
        unreachable!("handlers never delete jobs")
    }
    async fn ensure_pvc(&self, _volume_ref: &str) -> Result<(), KnitError> {
        Ok(())
    }
    async fn pvc_is_bound(&self, _volume_ref: &str) -> Result<bool, KnitError> {
        match &*self.pvc_bound.lock().expect("lock") {
            Ok(bound) => Ok(*bound),
            Err(KnitError::Missing(what)) => Err(KnitError::missing(what.clone())),
            Err(e) => Err(KnitError::internal(e.to_string())),
        }
    }
    async fn delete_pvc(&self, _volume_ref: &str) -> Result<(), KnitError> {
        Ok(())
    }

    async fn spawn_data_agent(
        &self,
        _agent: &DataAgent,
        _deadline: DateTime<Utc>,
    ) -> Result<Box<dyn DataAgentHandle>, KnitError> {
        if let Some(e) = self.spawn_error.lock().expect("lock").take() {
            return Err(e);
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let url = if *self.broken_handles.lock().expect("lock") {
            None
        } else {
            let addr = self
                .agent_target
                .lock()
                .expect("lock")
                .expect("agent target configured");
            Some(format!("http://{addr}/").parse().expect("uri"))
        };
        Ok(Box::new(FakeHandle {
            url,
            closed: self.closed.clone(),
        }))
    }
}

// --- scaffolding -------------------------------------------------------

struct Backend {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    cluster: Arc<HandlerCluster>,
    keys: Arc<HmacKeyProvider>,
}

async fn start_backend(cluster: HandlerCluster) -> Backend {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(MemoryStore::new());
    let cluster = Arc::new(cluster);
    let keys = Arc::new(HmacKeyProvider::new(
        "test-key",
        b"0123456789abcdef0123456789abcdef".to_vec(),
    ));
    let mut state = BackendState::new(
        store.clone(),
        store.clone(),
        cluster.clone(),
        keys.clone(),
    );
    state.agent_lease = Duration::from_secs(60);
    state.spawn_timeout = Duration::from_secs(5);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = backend_router(Arc::new(state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    Backend {
        addr,
        store,
        cluster,
        keys,
    }
}

fn client() -> Client<HttpConnector, Body> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn seed_done_data(backend: &Backend, tags: &[Tag]) -> String {
    let runs: Arc<dyn RunStore> = backend.store.clone();
    let data: Arc<dyn DataStore> = backend.store.clone();
    let run_id = runs
        .new_pseudo(PseudoPlanName::Uploaded, Duration::ZERO)
        .await
        .expect("pseudo");
    let run = runs.get(&[run_id.clone()]).await.expect("get")[&run_id].clone();
    let knit_id = run.outputs[0].knit_data_body.knit_id.clone();
    data.add_tags(&knit_id, TagSet::new(tags.iter().cloned()))
        .await
        .expect("tags");
    runs.set_status(&run_id, KnitRunStatus::Completing)
        .await
        .expect("completing");
    runs.finish(&run_id).await.expect("finish");
    knit_id
}

async fn agent_records_gone(backend: &Backend) -> bool {
    let data: Arc<dyn DataStore> = backend.store.clone();
    data.expired_agents(Utc::now() + chrono::Duration::days(1))
        .await
        .expect("expired agents")
        .is_empty()
}

/// Give spawned teardown tasks a moment to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn body_with_trailer(payload: &'static [u8]) -> Body {
    let mut trailers = HeaderMap::new();
    trailers.insert(
        axum::http::HeaderName::from_static("x-usersending-trailer"),
        "trailer-value".parse().expect("value"),
    );
    Body::new(
        Full::new(Bytes::from_static(payload))
            .with_trailers(async move { Some(Ok::<_, std::convert::Infallible>(trailers)) }),
    )
}

// --- GET ---------------------------------------------------------------

#[tokio::test]
async fn test_get_proxies_response_headers_body_and_trailers() {
    let (agent_addr, seen) = start_fake_agent(AgentScript::ok_with_trailer()).await;
    let backend = start_backend(HandlerCluster::targeting(agent_addr)).await;
    let knit_id = seed_done_data(&backend, &[]).await;

    let req = http::Request::builder()
        .method("GET")
        .uri(format!("http://{}/api/backends/data/{knit_id}", backend.addr))
        .header("x-user-custom-header", "aaaa")
        .body(Body::empty())
        .expect("request");
    let resp = client().request(req).await.expect("response");

    assert_eq!(resp.status(), StatusCode::OK);
    let (parts, body) = resp.into_parts();
    assert_eq!(
        parts
            .headers
            .get_all("x-some-header-for-test")
            .iter()
            .count(),
        2,
    );
    let collected = body.collect().await.expect("collect");
    let trailers = collected.trailers().cloned();
    assert_eq!(
        collected.to_bytes(),
        Bytes::from_static(b"quick brown fox jumps over a lazy dog"),
    );
    assert_eq!(
        trailers
            .as_ref()
            .and_then(|t| t.get("example-trailer"))
            .map(|v| v.as_bytes()),
        Some(&b"example trailer payload"[..]),
    );

    // the agent saw the custom header and an empty body
    let seen = seen.lock().expect("lock");
    let seen = seen.as_ref().expect("agent was called");
    assert_eq!(
        seen.headers.get("x-user-custom-header").map(|v| v.as_bytes()),
        Some(&b"aaaa"[..]),
    );
    assert!(seen.body.is_empty());
    drop(seen);

    assert_eq!(backend.cluster.spawned.load(Ordering::SeqCst), 1);
    settle().await;
    assert_eq!(backend.cluster.closed.load(Ordering::SeqCst), 1);
    assert!(agent_records_gone(&backend).await);
}

#[tokio::test]
async fn test_get_missing_data_is_404_without_spawn() {
    let backend = start_backend(HandlerCluster::new()).await;

    let req = http::Request::builder()
        .method("GET")
        .uri(format!(
            "http://{}/api/backends/data/no-such-knit-id",
            backend.addr
        ))
        .body(Body::empty())
        .expect("request");
    let resp = client().request(req).await.expect("response");

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(backend.cluster.spawned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_get_broken_agent_is_500_and_released() {
    let backend = start_backend(HandlerCluster::new()).await;
    *backend.cluster.broken_handles.lock().expect("lock") = true;
    let knit_id = seed_done_data(&backend, &[]).await;

    let req = http::Request::builder()
        .method("GET")
        .uri(format!("http://{}/api/backends/data/{knit_id}", backend.addr))
        .body(Body::empty())
        .expect("request");
    let resp = client().request(req).await.expect("response");

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    settle().await;
    assert_eq!(backend.cluster.closed.load(Ordering::SeqCst), 1);
    assert!(agent_records_gone(&backend).await);
}

// --- POST --------------------------------------------------------------

#[tokio::test]
async fn test_post_upload_creates_done_data() {
    let (agent_addr, seen) = start_fake_agent(AgentScript::ok_with_trailer()).await;
    let backend = start_backend(HandlerCluster::targeting(agent_addr)).await;

    let req = http::Request::builder()
        .method("POST")
        .uri(format!("http://{}/api/backends/data/", backend.addr))
        .header("content-type", "example/test-data")
        .header("x-custom-header", "header-value")
        .body(body_with_trailer(b"arbitary byte stream..."))
        .expect("request");
    let resp = client().request(req).await.expect("response");

    assert_eq!(resp.status(), StatusCode::OK);
    let payload = resp
        .into_body()
        .collect()
        .await
        .expect("collect")
        .to_bytes();
    let detail: serde_json::Value = serde_json::from_slice(&payload).expect("json");

    assert_eq!(detail.pointer("/upstream/run/plan/name"), Some(&"uploaded".into()));
    assert_eq!(detail.pointer("/upstream/run/status"), Some(&"done".into()));
    assert_eq!(detail.pointer("/upstream/mountpoint/path"), Some(&"/out".into()));
    let knit_id = detail
        .get("knitId")
        .and_then(|v| v.as_str())
        .expect("knitId")
        .to_string();
    let tags = detail.get("tags").and_then(|v| v.as_array()).expect("tags");
    assert!(tags.iter().any(|t| t.get("key") == Some(&"knit#id".into())));

    // the upload reached the agent intact
    let seen = seen.lock().expect("lock");
    let seen = seen.as_ref().expect("agent was called");
    assert_eq!(seen.body, Bytes::from_static(b"arbitary byte stream..."));
    assert_eq!(
        seen.headers.get("x-custom-header").map(|v| v.as_bytes()),
        Some(&b"header-value"[..]),
    );
    assert_eq!(
        seen.headers.get("content-type").map(|v| v.as_bytes()),
        Some(&b"example/test-data"[..]),
    );
    assert_eq!(
        seen.trailers
            .as_ref()
            .and_then(|t| t.get("x-usersending-trailer"))
            .map(|v| v.as_bytes()),
        Some(&b"trailer-value"[..]),
    );
    drop(seen);

    // the run went Completing -> Done and the data is queryable
    let runs: Arc<dyn RunStore> = backend.store.clone();
    let run_id = detail
        .pointer("/upstream/run/runId")
        .and_then(|v| v.as_str())
        .expect("runId")
        .to_string();
    assert_eq!(
        runs.get(&[run_id.clone()]).await.expect("get")[&run_id]
            .run_body
            .status,
        KnitRunStatus::Done,
    );
    let data: Arc<dyn DataStore> = backend.store.clone();
    assert!(data
        .find(&TagSet::new([Tag::new("knit#id", knit_id)]))
        .await
        .expect("find")
        .len()
        == 1);

    settle().await;
    assert_eq!(backend.cluster.closed.load(Ordering::SeqCst), 1);
    assert!(agent_records_gone(&backend).await);
}

/// Failure paths leave exactly one tombstoned volume behind: the pseudo
/// run's output, invalidated when the run aborted.
async fn assert_upload_was_aborted(backend: &Backend) {
    let garbage: Arc<dyn GarbageStore> = backend.store.clone();
    let popped = garbage
        .pop(Box::new(|_| Box::pin(async { Ok(()) })))
        .await
        .expect("pop");
    assert!(popped, "aborted upload must tombstone its volume");
}

#[tokio::test]
async fn test_post_proxies_agent_rejection_and_aborts() {
    let (agent_addr, _) = start_fake_agent(AgentScript::rejection()).await;
    let backend = start_backend(HandlerCluster::targeting(agent_addr)).await;

    let req = http::Request::builder()
        .method("POST")
        .uri(format!("http://{}/api/backends/data/", backend.addr))
        .body(Body::from("rejected payload"))
        .expect("request");
    let resp = client().request(req).await.expect("response");

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let payload = resp
        .into_body()
        .collect()
        .await
        .expect("collect")
        .to_bytes();
    assert_eq!(payload, Bytes::from_static(br#"{"message": "fake error."}"#));

    settle().await;
    assert_eq!(backend.cluster.closed.load(Ordering::SeqCst), 1);
    assert!(agent_records_gone(&backend).await);
    assert_upload_was_aborted(&backend).await;
}

#[tokio::test]
async fn test_post_spawn_conflict_is_503_and_aborts() {
    let backend = start_backend(HandlerCluster::new()).await;
    *backend.cluster.spawn_error.lock().expect("lock") =
        Some(KnitError::conflict("service name taken"));

    let req = http::Request::builder()
        .method("POST")
        .uri(format!("http://{}/api/backends/data/", backend.addr))
        .body(Body::from("n/a"))
        .expect("request");
    let resp = client().request(req).await.expect("response");

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(agent_records_gone(&backend).await);
    assert_upload_was_aborted(&backend).await;
}

#[tokio::test]
async fn test_post_broken_agent_is_500_and_aborts() {
    let backend = start_backend(HandlerCluster::new()).await;
    *backend.cluster.broken_handles.lock().expect("lock") = true;

    let req = http::Request::builder()
        .method("POST")
        .uri(format!("http://{}/api/backends/data/", backend.addr))
        .body(Body::from("n/a"))
        .expect("request");
    let resp = client().request(req).await.expect("response");

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    settle().await;
    assert_eq!(backend.cluster.closed.load(Ordering::SeqCst), 1);
    assert!(agent_records_gone(&backend).await);
    assert_upload_was_aborted(&backend).await;
}

#[tokio::test]
async fn test_post_midstream_disconnect_is_500_and_aborts() {
    let agent_addr = start_disconnecting_server().await;
    let backend = start_backend(HandlerCluster::targeting(agent_addr)).await;

    // a body that never finishes: the agent hangs up first
    let stream = futures::stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"msg1,")),
        Ok(Bytes::from_static(b"msg2,")),
    ])
    .chain(futures::stream::pending());
    let req = http::Request::builder()
        .method("POST")
        .uri(format!("http://{}/api/backends/data/", backend.addr))
        .body(Body::from_stream(stream))
        .expect("request");
    let resp = client().request(req).await.expect("response");

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    settle().await;
    assert_eq!(backend.cluster.closed.load(Ordering::SeqCst), 1);
    assert!(agent_records_gone(&backend).await);
    assert_upload_was_aborted(&backend).await;
}

// --- import ------------------------------------------------------------

async fn begin_import(backend: &Backend) -> String {
    let req = http::Request::builder()
        .method("POST")
        .uri(format!(
            "http://{}/api/backends/data/import/begin",
            backend.addr
        ))
        .body(Body::empty())
        .expect("request");
    let resp = client().request(req).await.expect("response");

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").map(|v| v.as_bytes()),
        Some(&b"application/jwt"[..]),
    );
    let token = resp
        .into_body()
        .collect()
        .await
        .expect("collect")
        .to_bytes();
    String::from_utf8(token.to_vec()).expect("token utf8")
}

async fn end_import(backend: &Backend, content_type: &str, body: Body) -> http::Response<hyper::body::Incoming> {
    let req = http::Request::builder()
        .method("POST")
        .uri(format!(
            "http://{}/api/backends/data/import/end",
            backend.addr
        ))
        .header("content-type", content_type)
        .body(body)
        .expect("request");
    client().request(req).await.expect("response")
}

#[tokio::test]
async fn test_import_begin_issues_a_verifiable_token() {
    let backend = start_backend(HandlerCluster::new()).await;
    let token = begin_import(&backend).await;

    let claim = backend
        .keys
        .keychain()
        .await
        .expect("keychain")
        .verify(&token)
        .expect("verify");
    assert!(!claim.jti.is_empty());
    assert!(!claim.sub.is_empty());

    // the run exists, waiting for the volume to land
    let runs: Arc<dyn RunStore> = backend.store.clone();
    let run = runs.get(&[claim.run_id.clone()]).await.expect("get")[&claim.run_id].clone();
    assert_eq!(run.run_body.status, KnitRunStatus::Running);
    assert_eq!(run.outputs.len(), 1);
    assert_eq!(run.outputs[0].knit_data_body.knit_id, claim.knit_id);
    assert_eq!(run.outputs[0].knit_data_body.volume_ref, claim.sub);
}

#[tokio::test]
async fn test_import_end_finishes_the_run() {
    let backend = start_backend(HandlerCluster::new()).await;
    let token = begin_import(&backend).await;

    let resp = end_import(&backend, "application/jwt", Body::from(token.clone())).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let payload = resp
        .into_body()
        .collect()
        .await
        .expect("collect")
        .to_bytes();
    let detail: serde_json::Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(
        detail.pointer("/upstream/run/plan/name"),
        Some(&"imported".into()),
    );
    assert_eq!(detail.pointer("/upstream/run/status"), Some(&"done".into()));

    // finishing again conflicts: the run is terminal now
    let resp = end_import(&backend, "application/jwt", Body::from(token)).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_import_end_rejects_bad_requests() {
    let backend = start_backend(HandlerCluster::new()).await;
    let token = begin_import(&backend).await;

    // wrong content type
    let resp = end_import(&backend, "text/plain", Body::from(token.clone())).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // no body
    let resp = end_import(&backend, "application/jwt", Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // forged token
    let resp = end_import(&backend, "application/jwt", Body::from("not-a-jwt")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // volume not bound yet
    *backend.cluster.pvc_bound.lock().expect("lock") = Ok(false);
    let resp = end_import(&backend, "application/jwt", Body::from(token.clone())).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // volume missing entirely
    *backend.cluster.pvc_bound.lock().expect("lock") =
        Err(KnitError::missing("pvc test-volume-ref"));
    let resp = end_import(&backend, "application/jwt", Body::from(token.clone())).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // none of the failures finished the run
    let claim = backend
        .keys
        .keychain()
        .await
        .expect("keychain")
        .verify(&token)
        .expect("verify");
    let runs: Arc<dyn RunStore> = backend.store.clone();
    assert_eq!(
        runs.get(&[claim.run_id.clone()]).await.expect("get")[&claim.run_id]
            .run_body
            .status,
        KnitRunStatus::Running,
    );
}
