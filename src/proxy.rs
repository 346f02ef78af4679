//! Inbound gRPC front end.
//!
//! Accepts unary gRPC calls over h2c, runs them through the [`Engine`] and
//! either answers with the injected status or forwards the call to the
//! backend. Message payloads are never decoded.

use crate::client::{self, HttpClient, DEFAULT_BACKEND_TIMEOUT};
use crate::engine::{ConfigSource, Engine};
use crate::frame::{CallContext, Frame, Metadata};
use crate::status::{Code, Status};
use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::Router;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const REFLECTION_SERVICES: [&str; 2] = [
    "grpc.reflection.v1.ServerReflection",
    "grpc.reflection.v1alpha.ServerReflection",
];

/// Transport headers that are regenerated on forward and never exposed as
/// call metadata.
const TRANSPORT_HEADERS: [&str; 8] = [
    "content-type",
    "content-length",
    "te",
    "host",
    "connection",
    "grpc-timeout",
    "grpc-encoding",
    "grpc-accept-encoding",
];

/// Headers copied from the inbound request to the backend request as-is.
const PASSTHROUGH_HEADERS: [&str; 4] = ["content-type", "te", "grpc-encoding", "grpc-accept-encoding"];

/// Shared state of the proxy handler.
pub struct ProxyState {
    engine: Arc<Engine>,
    source: Arc<dyn ConfigSource>,
    client: HttpClient,
    backend_timeout: Duration,
}

impl ProxyState {
    pub fn new(engine: Arc<Engine>, source: Arc<dyn ConfigSource>) -> Self {
        Self {
            engine,
            source,
            client: client::http2_client(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }
}

/// Router with the proxy handler on every path.
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<ProxyState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(address = ?listener.local_addr().ok(), "Chaos proxy listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn handle(State(state): State<Arc<ProxyState>>, req: Request<Body>) -> Response {
    let Some((service, method)) = parse_path(req.uri().path()) else {
        return http_error(StatusCode::BAD_REQUEST, "malformed gRPC path");
    };
    let (service, method) = (service.to_string(), method.to_string());

    if REFLECTION_SERVICES.contains(&service.as_str()) {
        return http_error(StatusCode::NOT_IMPLEMENTED, "server reflection is not supported");
    }
    if !is_grpc(req.headers()) {
        return status_response(&Status::new(
            Code::Unimplemented,
            "content-type must be application/grpc",
        ));
    }

    let mut context = CallContext::new();
    if let Some(timeout) = req
        .headers()
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
    {
        context = context.with_deadline(Instant::now() + timeout);
    }

    let mut frame = Frame::new(service, method)
        .with_metadata(metadata_from_headers(req.headers()))
        .with_context(context);

    if let Err(e) = state.engine.process(&mut frame).await {
        let status = Status::from(&e);
        debug!(method = %frame.full_method(), error = %e, code = %status.code, "Call rejected");
        return status_response(&status);
    }

    forward(&state, req, &frame).await
}

/// Send the call to the backend with the frame's (possibly rewritten) metadata.
async fn forward(state: &ProxyState, req: Request<Body>, frame: &Frame) -> Response {
    let Some(config) = state.source.current() else {
        return status_response(&Status::new(Code::Unavailable, "no backend configured"));
    };

    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let uri: Uri = match format!("http://{}{}", config.backend.address, path).parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(backend = %config.backend.address, error = %e, "Invalid backend address");
            return status_response(&Status::new(Code::Internal, "invalid backend address"));
        }
    };

    let mut outbound = Request::new(body);
    *outbound.method_mut() = Method::POST;
    *outbound.uri_mut() = uri;
    let headers = outbound.headers_mut();
    for name in PASSTHROUGH_HEADERS {
        for value in parts.headers.get_all(name) {
            headers.append(name, value.clone());
        }
    }
    client::metadata_to_headers(&frame.metadata, headers);

    let mut timeout = state.backend_timeout;
    if let Some(deadline) = frame.context.deadline() {
        timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
    }
    if let Some(value) = format_grpc_timeout(timeout) {
        headers.insert("grpc-timeout", value);
    }

    match tokio::time::timeout(timeout, state.client.request(outbound)).await {
        Ok(Ok(resp)) => resp.map(Body::new),
        Ok(Err(e)) => {
            warn!(backend = %config.backend.address, error = %e, "Backend call failed");
            status_response(&Status::new(Code::Unavailable, format!("backend unavailable: {}", e)))
        }
        Err(_) => status_response(&Status::new(Code::DeadlineExceeded, "backend timed out")),
    }
}

/// Split `/<service>/<method>`.
pub fn parse_path(path: &str) -> Option<(&str, &str)> {
    let (service, method) = path.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

fn is_grpc(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/grpc"))
}

/// Parse a `grpc-timeout` value: up to 8 digits and a unit (H M S m u n).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(n * 3600)),
        "M" => Some(Duration::from_secs(n * 60)),
        "S" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_millis(n)),
        "u" => Some(Duration::from_micros(n)),
        "n" => Some(Duration::from_nanos(n)),
        _ => None,
    }
}

fn format_grpc_timeout(timeout: Duration) -> Option<HeaderValue> {
    let millis = timeout.as_millis().clamp(1, 99_999_999);
    HeaderValue::from_str(&format!("{}m", millis)).ok()
}

/// Call metadata from request headers, minus transport headers.
pub fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    headers
        .iter()
        .filter(|(name, _)| !TRANSPORT_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .collect()
}

/// Trailers-only gRPC response carrying `status`.
pub fn status_response(status: &Status) -> Response {
    let mut resp = Response::new(Body::empty());
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert("grpc-status", HeaderValue::from(status.code.as_i32()));
    if !status.message.is_empty() {
        if let Ok(message) = HeaderValue::from_str(&urlencoding::encode(&status.message)) {
            headers.insert("grpc-message", message);
        }
    }
    resp
}

fn http_error(code: StatusCode, message: &'static str) -> Response {
    let mut resp = Response::new(Body::from(message));
    *resp.status_mut() = code;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionSpec, CodeAction, HeaderAction, HeaderValueSpec, MatchSpec, ProxyConfig, RuleSpec};
    use crate::injector::Registry;
    use crate::loader::ConfigLoader;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("/pkg.Svc/Method"), Some(("pkg.Svc", "Method")));
        assert_eq!(parse_path("/pkg.Svc/"), None);
        assert_eq!(parse_path("//Method"), None);
        assert_eq!(parse_path("pkg.Svc/Method"), None);
        assert_eq!(parse_path("/a/b/c"), None);
        assert_eq!(parse_path("/"), None);
    }

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_grpc_timeout("2S"), Some(Duration::from_secs(2)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("5u"), Some(Duration::from_micros(5)));
        assert_eq!(parse_grpc_timeout("123456789S"), None);
        assert_eq!(parse_grpc_timeout("10x"), None);
        assert_eq!(parse_grpc_timeout("m"), None);
        assert_eq!(parse_grpc_timeout("-1S"), None);
    }

    #[test]
    fn test_status_response() {
        let resp = status_response(&Status::new(Code::NotFound, "no matching rule for this method"));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["grpc-status"], "5");
        assert_eq!(
            resp.headers()["grpc-message"],
            "no%20matching%20rule%20for%20this%20method"
        );
    }

    #[test]
    fn test_metadata_skips_transport_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("x-user", HeaderValue::from_static("alice"));
        headers.append("x-multi", HeaderValue::from_static("1"));
        headers.append("x-multi", HeaderValue::from_static("2"));

        let md = metadata_from_headers(&headers);
        assert_eq!(md.get("x-user"), Some("alice"));
        assert_eq!(md.get_all("x-multi"), vec!["1", "2"]);
        assert!(!md.contains_key("content-type"));
        assert!(!md.contains_key("te"));
    }

    /// Backend that echoes `x-injected` back as `x-seen` with an OK status.
    async fn echo_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let app = Router::new().fallback(|headers: HeaderMap| async move {
            let mut resp = status_response(&Status::new(Code::Ok, ""));
            if let Some(v) = headers.get("x-injected") {
                resp.headers_mut().insert("x-seen", v.clone());
            }
            resp
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn start_proxy(rules: Vec<RuleSpec>) -> String {
        let backend = echo_backend().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut config = ProxyConfig::default();
        config.listener.address = addr.clone();
        config.backend.address = backend;
        config.rules = rules;

        let loader = Arc::new(ConfigLoader::empty());
        loader.store(config);
        let engine = Arc::new(Engine::new(loader.clone(), Arc::new(Registry::with_builtins())).unwrap());
        let state = Arc::new(ProxyState::new(engine, loader).with_backend_timeout(Duration::from_secs(5)));
        tokio::spawn(async move {
            serve(listener, state, std::future::pending()).await.unwrap();
        });
        addr
    }

    async fn call(addr: &str, path: &str) -> http::Response<hyper::body::Incoming> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}{}", addr, path))
            .header(CONTENT_TYPE, "application/grpc")
            .header("te", "trailers")
            .body(Body::from(vec![0u8; 5]))
            .unwrap();
        client::http2_client().request(req).await.unwrap()
    }

    fn rule(name: &str, service: &str, action: ActionSpec) -> RuleSpec {
        RuleSpec {
            name: name.to_string(),
            matcher: MatchSpec {
                service: service.to_string(),
                method_regex: None,
            },
            action,
            disabled: false,
        }
    }

    #[tokio::test]
    async fn test_unmatched_call_is_not_found() {
        let proxy = start_proxy(vec![]).await;
        let resp = call(&proxy, "/pkg.Svc/Do").await;
        assert_eq!(resp.headers()["grpc-status"], "5");
    }

    #[tokio::test]
    async fn test_injected_status() {
        let action = ActionSpec {
            code: Some(CodeAction {
                code: "PERMISSION_DENIED".to_string(),
                message: "nope".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let proxy = start_proxy(vec![rule("deny", "pkg.Svc", action)]).await;
        let resp = call(&proxy, "/pkg.Svc/Do").await;
        assert_eq!(resp.headers()["grpc-status"], "7");
        assert_eq!(resp.headers()["grpc-message"], "nope");
    }

    #[tokio::test]
    async fn test_forward_with_rewritten_metadata() {
        let mut headers = BTreeMap::new();
        headers.insert("x-injected".to_string(), HeaderValueSpec::Literal("yes".to_string()));
        let action = ActionSpec {
            header: Some(HeaderAction {
                headers,
                ..Default::default()
            }),
            ..Default::default()
        };
        let proxy = start_proxy(vec![rule("tag", "pkg.Svc", action)]).await;

        let resp = call(&proxy, "/pkg.Svc/Do").await;
        assert_eq!(resp.headers()["grpc-status"], "0");
        assert_eq!(resp.headers()["x-seen"], "yes");
    }

    #[tokio::test]
    async fn test_reflection_rejected() {
        let proxy = start_proxy(vec![]).await;
        let resp = call(
            &proxy,
            "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
