//! Outbound HTTP/2 (h2c) clients: backend forwarding and spammer replays.

use crate::error::ChaosError;
use crate::frame::Metadata;
use crate::injector::ReplaySender;
use crate::status::{Code, Status};
use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, TE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Upper bound on a forwarded or replayed call.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(50);

/// Length-prefixed gRPC message with an empty payload.
const EMPTY_MESSAGE: [u8; 5] = [0; 5];

pub type HttpClient = Client<HttpConnector, Body>;

/// Plaintext HTTP/2 client with prior knowledge.
pub fn http2_client() -> HttpClient {
    Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build_http()
}

/// Copy metadata into `headers`, skipping entries that are not valid HTTP.
pub(crate) fn metadata_to_headers(metadata: &Metadata, headers: &mut HeaderMap) {
    for (key, value) in metadata.iter() {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(key, "Dropping metadata entry that is not a valid header"),
        }
    }
}

/// Read `grpc-status` / `grpc-message` from a header or trailer block.
pub(crate) fn grpc_status(headers: &HeaderMap) -> Option<Status> {
    let code = headers
        .get("grpc-status")?
        .to_str()
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()?;
    let message = headers
        .get("grpc-message")
        .and_then(|v| v.to_str().ok())
        .map(|m| {
            urlencoding::decode(m)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| m.to_string())
        })
        .unwrap_or_default();
    Some(Status::new(Code::from_i32(code), message))
}

/// Issues spammer replays as unary calls with an empty request message.
#[derive(Debug, Clone)]
pub struct GrpcReplayClient {
    client: HttpClient,
    timeout: Duration,
}

impl Default for GrpcReplayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcReplayClient {
    pub fn new() -> Self {
        Self {
            client: http2_client(),
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_request(
        target: &str,
        service: &str,
        method: &str,
        metadata: &Metadata,
    ) -> Result<Request<Body>, ChaosError> {
        let mut req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}/{}/{}", target, service, method))
            .header(CONTENT_TYPE, "application/grpc")
            .header(TE, "trailers")
            .body(Body::from(Bytes::from_static(&EMPTY_MESSAGE)))
            .map_err(|e| ChaosError::Transport(format!("invalid replay request: {}", e)))?;
        metadata_to_headers(metadata, req.headers_mut());
        Ok(req)
    }
}

#[async_trait]
impl ReplaySender for GrpcReplayClient {
    async fn send(
        &self,
        target: &str,
        service: &str,
        method: &str,
        metadata: Metadata,
    ) -> Result<(), ChaosError> {
        let req = Self::build_request(target, service, method, &metadata)?;

        let exchange = async {
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| ChaosError::Transport(e.to_string()))?;

            // Trailers-only responses carry the status in the headers.
            if let Some(status) = grpc_status(resp.headers()) {
                return Ok(status);
            }
            let collected = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ChaosError::Transport(e.to_string()))?;
            collected
                .trailers()
                .and_then(grpc_status)
                .ok_or_else(|| ChaosError::Transport("response has no grpc-status".to_string()))
        };

        let status = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ChaosError::Transport("replay timed out".to_string()))??;

        if status.code == Code::Ok {
            Ok(())
        } else {
            Err(status.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Response;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn grpc_backend(status: i32) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let app = Router::new().fallback(move || async move {
            let mut resp = Response::new(Body::empty());
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
            resp.headers_mut()
                .insert("grpc-status", HeaderValue::from(status));
            resp.headers_mut()
                .insert("grpc-message", HeaderValue::from_static("went%20away"));
            resp
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_grpc_status_parsing() {
        let mut headers = HeaderMap::new();
        assert!(grpc_status(&headers).is_none());

        headers.insert("grpc-status", HeaderValue::from_static("14"));
        headers.insert("grpc-message", HeaderValue::from_static("chaos%20disconnect"));
        let status = grpc_status(&headers).unwrap();
        assert_eq!(status.code, Code::Unavailable);
        assert_eq!(status.message, "chaos disconnect");
    }

    #[test]
    fn test_replay_request() {
        let md: Metadata = [("x-spammer-request", "1"), ("x-user", "u1"), ("bad key", "v")]
            .into_iter()
            .collect();
        let req = GrpcReplayClient::build_request("127.0.0.1:50051", "pkg.Svc", "Do", &md).unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().to_string(), "http://127.0.0.1:50051/pkg.Svc/Do");
        assert_eq!(req.headers()[CONTENT_TYPE], "application/grpc");
        assert_eq!(req.headers()["x-spammer-request"], "1");
        assert_eq!(req.headers()["x-user"], "u1");
        assert!(!req.headers().contains_key("bad key"));
    }

    #[tokio::test]
    async fn test_replay_ok() {
        let addr = grpc_backend(0).await;
        let client = GrpcReplayClient::new().with_timeout(Duration::from_secs(5));
        tokio_test::assert_ok!(client.send(&addr, "svc", "m", Metadata::new()).await);
    }

    #[tokio::test]
    async fn test_replay_error_status() {
        let addr = grpc_backend(14).await;
        let client = GrpcReplayClient::new().with_timeout(Duration::from_secs(5));
        match client.send(&addr, "svc", "m", Metadata::new()).await {
            Err(ChaosError::Status(status)) => {
                assert_eq!(status.code, Code::Unavailable);
                assert_eq!(status.message, "went away");
            }
            other => panic!("Expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replay_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = GrpcReplayClient::new().with_timeout(Duration::from_secs(5));
        let err = client.send(&addr, "svc", "m", Metadata::new()).await;
        assert!(matches!(err, Err(ChaosError::Transport(_))));
    }
}
