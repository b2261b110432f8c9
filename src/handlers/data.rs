//! Data ingress and egress handlers.
//!
//! Reads and writes of data bodies go through short-lived data-agent
//! sidecars: the handler registers an agent record, has the cluster
//! spawn the sidecar against the data's PVC, and reverse-proxies the
//! client's bytes to it. Hop-by-hop headers are stripped; everything
//! else, including trailers, passes through verbatim.
//!
//! Agents are request-scoped resources: every exit path, including
//! mid-stream disconnects and streamed responses, releases the sidecar
//! and its store record exactly once via [`AgentGuard`].

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::{
    cluster::DataAgentHandle,
    domain::{
        data::DataAgentMode,
        plan::PseudoPlanName,
        run::{KnitRunStatus, Run},
    },
    errors::KnitError,
    handlers::{ApiError, BackendState, binding},
    keychain::DataImportClaim,
};

type ProxyClient = Client<HttpConnector, Body>;

/// `GET /api/backends/data/{knit_id}` — stream a data body out through a
/// read agent.
pub async fn get_data(
    State(state): State<Arc<BackendState>>,
    Path(knit_id): Path<String>,
    req: Request,
) -> Result<Response, ApiError> {
    let agent = state
        .data
        .new_agent(&knit_id, DataAgentMode::Read, state.agent_lease)
        .await
        .map_err(|e| match e {
            KnitError::Missing(_) => ApiError::new(StatusCode::NOT_FOUND, e),
            other => ApiError::internal(other),
        })?;

    let deadline = Utc::now() + chrono_interval(state.spawn_timeout);
    let handle = match state.cluster.spawn_data_agent(&agent, deadline).await {
        Ok(handle) => handle,
        Err(e) => {
            let _ = state.data.remove_agent(&agent.name).await;
            return Err(match e {
                KnitError::DeadlineExceeded(_) => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e),
                other => ApiError::internal(other),
            });
        }
    };
    let mut guard = AgentGuard::new(agent.name.clone(), state.clone(), handle);

    match proxy(&guard, req).await {
        Ok(resp) => Ok(guard.stream_response(resp)),
        Err(e) => {
            guard.release().await;
            Err(ApiError::internal(e))
        }
    }
}

/// `POST /api/backends/data/` — create an `uploaded` pseudo run and
/// stream the client's bytes into its output through a write agent.
pub async fn post_data(
    State(state): State<Arc<BackendState>>,
    req: Request,
) -> Result<Response, ApiError> {
    let run_id = state
        .runs
        .new_pseudo(PseudoPlanName::Uploaded, state.agent_lease)
        .await
        .map_err(ApiError::internal)?;

    match upload(&state, &run_id, req).await {
        Ok(response) => Ok(response),
        Err(failure) => {
            abort_run(&state, &run_id).await;
            Err(failure)
        }
    }
}

/// The upload path after the pseudo run exists. Any error bubbles to
/// [`post_data`], which drives the run to `Aborting`.
async fn upload(
    state: &Arc<BackendState>,
    run_id: &str,
    req: Request,
) -> Result<Response, ApiError> {
    let run = fetch_run(state, run_id).await?;
    let output = single_output(&run)?;

    let agent = state
        .data
        .new_agent(&output, DataAgentMode::Write, state.agent_lease)
        .await
        .map_err(|e| match e {
            KnitError::Conflict(_) => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e),
            other => ApiError::internal(other),
        })?;

    let deadline = Utc::now() + chrono_interval(state.spawn_timeout);
    let handle = match state.cluster.spawn_data_agent(&agent, deadline).await {
        Ok(handle) => handle,
        Err(e) => {
            let _ = state.data.remove_agent(&agent.name).await;
            return Err(match e {
                KnitError::Conflict(_) | KnitError::DeadlineExceeded(_) => {
                    ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e)
                }
                other => ApiError::internal(other),
            });
        }
    };
    let mut guard = AgentGuard::new(agent.name.clone(), state.clone(), handle);

    let resp = match proxy(&guard, req).await {
        Ok(resp) => resp,
        Err(e) => {
            guard.release().await;
            return Err(ApiError::internal(e));
        }
    };

    if !resp.status().is_success() {
        // the agent rejected the upload; its response is the answer,
        // and the run is torn down around it
        abort_run(state, run_id).await;
        return Ok(guard.stream_response(resp));
    }
    guard.release().await;

    state
        .runs
        .set_status(run_id, KnitRunStatus::Completing)
        .await
        .map_err(ApiError::internal)?;
    state
        .runs
        .finish(run_id)
        .await
        .map_err(ApiError::internal)?;

    let detail = fetch_detail(state, &output).await?;
    Ok(axum::Json(detail).into_response())
}

/// `POST /api/backends/data/import/begin` — create an `imported` pseudo
/// run and hand out the signed token naming its output volume.
pub async fn import_begin(
    State(state): State<Arc<BackendState>>,
) -> Result<Response, ApiError> {
    let run_id = state
        .runs
        .new_pseudo(PseudoPlanName::Imported, state.agent_lease)
        .await
        .map_err(ApiError::internal)?;

    let run = fetch_run(&state, &run_id).await?;
    if run.outputs.len() != 1 {
        return Err(ApiError::internal(KnitError::internal(format!(
            "pseudo run {run_id} must have exactly one output"
        ))));
    }
    let output = &run.outputs[0].knit_data_body;

    let key = state.keys.provide().await.map_err(ApiError::internal)?;
    let claim = DataImportClaim::new(
        run_id,
        output.knit_id.clone(),
        output.volume_ref.clone(),
        chrono_interval(state.import_token_ttl),
    );
    let token = key.sign(&claim).map_err(ApiError::internal)?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/jwt")],
        token,
    )
        .into_response())
}

/// `POST /api/backends/data/import/end` — verify the token, check the
/// volume landed, and finish the import run.
pub async fn import_end(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/jwt") {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            KnitError::bad_request("content type must be application/jwt"),
        ));
    }
    if body.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            KnitError::bad_request("request has no token"),
        ));
    }
    let token = std::str::from_utf8(&body).map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            KnitError::bad_request("token is not valid UTF-8"),
        )
    })?;

    let keychain = state.keys.keychain().await.map_err(ApiError::internal)?;
    let claim = keychain
        .verify(token)
        .map_err(|e| ApiError::new(StatusCode::UNAUTHORIZED, e))?;

    match state.cluster.pvc_is_bound(&claim.sub).await {
        Ok(true) => {}
        Ok(false) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                KnitError::bad_request(format!("volume {} is not bound", claim.sub)),
            ));
        }
        Err(KnitError::Missing(_)) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                KnitError::bad_request(format!("volume {} does not exist", claim.sub)),
            ));
        }
        Err(e) => return Err(ApiError::internal(e)),
    }

    state
        .runs
        .set_status(&claim.run_id, KnitRunStatus::Completing)
        .await
        .map_err(|e| match e {
            KnitError::InvalidRunStateChanging { .. } | KnitError::Missing(_) => {
                ApiError::new(StatusCode::CONFLICT, e)
            }
            other => ApiError::internal(other),
        })?;
    state
        .runs
        .finish(&claim.run_id)
        .await
        .map_err(|e| match e {
            KnitError::InvalidRunStateChanging { .. } => ApiError::new(StatusCode::CONFLICT, e),
            other => ApiError::internal(other),
        })?;

    let detail = fetch_detail(&state, &claim.knit_id).await?;
    Ok(axum::Json(detail).into_response())
}

async fn fetch_run(state: &Arc<BackendState>, run_id: &str) -> Result<Run, ApiError> {
    let mut runs = state
        .runs
        .get(&[run_id.to_string()])
        .await
        .map_err(ApiError::internal)?;
    runs.remove(run_id).ok_or_else(|| {
        ApiError::internal(KnitError::internal(format!(
            "run {run_id} vanished after creation"
        )))
    })
}

fn single_output(run: &Run) -> Result<String, ApiError> {
    match run.outputs.as_slice() {
        [only] => Ok(only.knit_data_body.knit_id.clone()),
        outputs => Err(ApiError::internal(KnitError::internal(format!(
            "run {} must have exactly one output, has {}",
            run.run_body.id,
            outputs.len()
        )))),
    }
}

async fn fetch_detail(
    state: &Arc<BackendState>,
    knit_id: &str,
) -> Result<binding::DataDetail, ApiError> {
    let mut found = state
        .data
        .get(&[knit_id.to_string()])
        .await
        .map_err(ApiError::internal)?;
    let data = found.remove(knit_id).ok_or_else(|| {
        ApiError::internal(KnitError::missing(format!("data {knit_id}")))
    })?;
    Ok(binding::compose_detail(&data))
}

/// Drive the run to `Aborting` and finish it; failures here are logged,
/// not surfaced, as the response already carries the original error.
async fn abort_run(state: &Arc<BackendState>, run_id: &str) {
    if let Err(e) = state.runs.set_status(run_id, KnitRunStatus::Aborting).await {
        tracing::warn!(run_id, error = %e, "could not abort run");
        return;
    }
    if let Err(e) = state.runs.finish(run_id).await {
        tracing::warn!(run_id, error = %e, "could not finish aborted run");
    }
}

fn chrono_interval(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Headers that must not cross a proxy hop (RFC 9110 §7.6.1), plus the
/// ones the proxy re-derives itself.
fn strip_proxy_headers(headers: &mut axum::http::HeaderMap) {
    const HOP_BY_HOP: [&str; 9] = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "host",
    ];
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    // the proxied body is re-framed by the client
    headers.remove(header::CONTENT_LENGTH);
}

/// Forward the request to the agent's byte API and return the sidecar's
/// response as-is (headers filtered, body untouched).
async fn proxy(guard: &AgentGuard, req: Request) -> Result<hyper::Response<Incoming>, KnitError> {
    let target = guard.handle.as_ref().map(|h| h.url()).transpose()?;
    let target = target.ok_or_else(|| KnitError::internal("data agent already released"))?;

    let (mut parts, body) = req.into_parts();
    strip_proxy_headers(&mut parts.headers);

    let mut builder = hyper::Request::builder().method(parts.method).uri(target);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    let outbound = builder
        .body(body)
        .map_err(|e| KnitError::internal(format!("cannot build proxied request: {e}")))?;

    let client: ProxyClient = Client::builder(TokioExecutor::new()).build_http();
    client
        .request(outbound)
        .await
        .map_err(|e| KnitError::internal(format!("data agent request failed: {e}")))
}

/// Request-scoped ownership of one spawned data agent. Release closes
/// the sidecar and drops the agent record exactly once; dropping an
/// unreleased guard (client gone, stream finished or broken) cleans up
/// in the background.
struct AgentGuard {
    name: String,
    state: Arc<BackendState>,
    handle: Option<Box<dyn DataAgentHandle>>,
    released: bool,
}

impl AgentGuard {
    fn new(name: String, state: Arc<BackendState>, handle: Box<dyn DataAgentHandle>) -> Self {
        Self {
            name,
            state,
            handle: Some(handle),
            released: false,
        }
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.close().await {
                tracing::warn!(agent = %self.name, error = %e, "data agent close failed");
            }
        }
        if let Err(e) = self.state.data.remove_agent(&self.name).await {
            tracing::warn!(agent = %self.name, error = %e, "could not remove agent record");
        }
    }

    /// Turn the sidecar's response into the client's response, keeping
    /// this guard alive until the body (trailers included) has been
    /// streamed out.
    fn stream_response(mut self, resp: hyper::Response<Incoming>) -> Response {
        let (mut parts, incoming) = resp.into_parts();
        strip_proxy_headers(&mut parts.headers);
        let body = Body::new(GuardedBody {
            inner: incoming,
            _guard: self.detach(),
        });
        Response::from_parts(parts, body)
    }

    /// Hand the cleanup duty to a value that can ride inside a body.
    fn detach(&mut self) -> DetachedGuard {
        self.released = true;
        DetachedGuard {
            name: std::mem::take(&mut self.name),
            state: self.state.clone(),
            handle: self.handle.take(),
        }
    }
}

impl Drop for AgentGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let detached = self.detach();
        drop(detached);
    }
}

/// The owned tail of an [`AgentGuard`]; cleans up from `Drop` on a
/// background task.
struct DetachedGuard {
    name: String,
    state: Arc<BackendState>,
    handle: Option<Box<dyn DataAgentHandle>>,
}

impl Drop for DetachedGuard {
    fn drop(&mut self) {
        let name = std::mem::take(&mut self.name);
        let state = self.state.clone();
        let handle = self.handle.take();
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(agent = %name, "no runtime to release data agent on");
            return;
        };
        rt.spawn(async move {
            if let Some(handle) = handle {
                if let Err(e) = handle.close().await {
                    tracing::warn!(agent = %name, error = %e, "data agent close failed");
                }
            }
            if let Err(e) = state.data.remove_agent(&name).await {
                tracing::warn!(agent = %name, error = %e, "could not remove agent record");
            }
        });
    }
}

/// A response body that keeps the agent guard alive until it is fully
/// streamed (or dropped on disconnect).
struct GuardedBody {
    inner: Incoming,
    _guard: DetachedGuard,
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
