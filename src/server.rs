use std::{
    collections::BTreeMap,
    convert::Infallible,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_util::{rt::TokioIo, server::conn::auto::Builder as ConnectionBuilder};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::Instrument as _;

use crate::{
    client::{UpstreamClient, UpstreamRequest},
    config::{ApiConfig, Config},
    storage::{MockRequest, MockResponse, Store, filter_headers},
};

/// Response headers retained when recording an upstream exchange. The
/// whitelist drops `content-encoding` with everything else: the body is
/// stored decompressed.
const RECORDED_RESPONSE_HEADERS: &[&str] = &[
    "accept",
    "content-type",
    "content-length",
    "date",
    "apitoken",
    "set-cookie",
];

/// Operating mode, fixed for the lifetime of a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Replay stored responses; never contacts the upstream.
    Serve,
    /// Proxy to the upstream and record each successful exchange.
    Update,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serve => "serve",
            Self::Update => "update",
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ServerState {
    mode: Mode,
    store: Store,
    client: UpstreamClient,
    api: ApiConfig,
    /// Fixed session timestamp stamped onto forwarded and recorded `date`
    /// headers, so a replayed fixture set shares one coherent clock.
    session_date: String,
}

pub async fn serve(config: &Config, mode: Mode) -> anyhow::Result<ServerHandle> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port))
        .await
        .with_context(|| format!("bind 127.0.0.1:{}", config.port))?;
    let listen_addr = listener.local_addr().context("get local_addr")?;

    let state = Arc::new(ServerState {
        mode,
        store: Store::from_config(config, listen_addr.port()),
        client: UpstreamClient::new()?,
        api: config.api.clone(),
        session_date: http_date_now(),
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service =
                            service_fn(move |req| mock_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(hyper_util::rt::TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

async fn mock_handler(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let span = tracing::info_span!(
        "mock.request",
        mode = state.mode.as_str(),
        method = %req.method(),
        url = %req.uri(),
    );
    handle_request(req, state).instrument(span).await
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let method = parts.method.to_string();
    let url = parts
        .uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or("/")
        .to_owned();

    // The request is dispatched only once the full body has arrived.
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("failed to read request body: {err}");
            return Ok(simple_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            ));
        }
    };

    let headers = header_map_to_btree(&parts.headers);
    let origin = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("origin"))
        .map(|(_, value)| value.clone());
    let request = MockRequest {
        method,
        url,
        headers,
        body: String::from_utf8_lossy(&body_bytes).into_owned(),
    };

    let response = match state.mode {
        Mode::Serve => state.store.get_response(request).await,
        Mode::Update => update_exchange(state.as_ref(), request).await,
    };

    Ok(write_mock_response(response, origin.as_deref()))
}

/// Update-mode exchange: forward to the configured upstream, record the
/// filtered pair on success, and always hand a response back.
async fn update_exchange(state: &ServerState, request: MockRequest) -> MockResponse {
    // The upstream host differs from the client application's, so the
    // inbound host header is dropped; the session date pins the clock.
    let mut forward_headers = request.headers.clone();
    forward_headers.retain(|name, _| !name.eq_ignore_ascii_case("host"));
    forward_headers.insert("date".to_owned(), state.session_date.clone());

    let upstream_request = UpstreamRequest {
        method: request.method.clone(),
        scheme: state.api.protocol.scheme().to_owned(),
        hostname: state.api.hostname.clone(),
        port: state.api.port,
        path: complete_path(&request.url, state.api.base.as_deref()),
        headers: forward_headers.clone(),
        body: request.body.clone(),
    };

    match state.client.request(upstream_request).await {
        Ok(upstream) => {
            let mut headers = filter_headers(&upstream.headers, RECORDED_RESPONSE_HEADERS);
            headers.insert("content-length".to_owned(), upstream.body.len().to_string());
            headers.insert("date".to_owned(), state.session_date.clone());
            let response = MockResponse {
                status: upstream.status,
                headers,
                body: upstream.body,
            };

            let recorded_request = MockRequest {
                headers: forward_headers,
                ..request
            };
            state
                .store
                .spawn_save(recorded_request, response.clone());
            response
        }
        Err(err) => {
            tracing::warn!(
                method = %request.method,
                url = %request.url,
                "upstream request failed: {err:#}"
            );
            upstream_error_response(&err)
        }
    }
}

/// Synthesized response for an upstream network failure. Not retried and
/// not persisted.
fn upstream_error_response(err: &anyhow::Error) -> MockResponse {
    let body = serde_json::json!({
        "message": "An error occurred",
        "error": format!("{err:#}"),
    });
    MockResponse {
        status: 400,
        headers: BTreeMap::from([("content-type".to_owned(), "application/json".to_owned())]),
        body: body.to_string(),
    }
}

fn complete_path(url: &str, base: Option<&str>) -> String {
    match base {
        Some(base) => format!("{base}{url}"),
        None => url.to_owned(),
    }
}

/// Static CORS headers appended to every outbound response. They are not
/// persisted with fixtures; headers already present on the response win.
fn merge_cors_headers(headers: &mut BTreeMap<String, String>, origin: Option<&str>) {
    let cors = [
        ("access-control-allow-credentials", "true".to_owned()),
        (
            "access-control-allow-origin",
            origin.unwrap_or("*").to_owned(),
        ),
        (
            "access-control-allow-headers",
            "Content-Type, Authorization, apitoken, Origin, X-Requested-With".to_owned(),
        ),
        (
            "access-control-allow-methods",
            "GET, POST, OPTIONS, PUT, PATCH, DELETE".to_owned(),
        ),
        ("access-control-max-age", "1728000".to_owned()),
    ];
    for (name, value) in cors {
        headers.entry(name.to_owned()).or_insert(value);
    }
}

fn write_mock_response(mut mock: MockResponse, origin: Option<&str>) -> Response<Full<Bytes>> {
    merge_cors_headers(&mut mock.headers, origin);

    let mut response = Response::new(Full::new(Bytes::from(mock.body)));
    *response.status_mut() =
        StatusCode::from_u16(mock.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &mock.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(header = name.as_str(), "skipping invalid stored header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            tracing::debug!(header = %name, "skipping invalid stored header value");
            continue;
        };
        response.headers_mut().insert(name, value);
    }
    response
}

fn simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

fn header_map_to_btree(headers: &hyper::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
        })
        .collect()
}

fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
