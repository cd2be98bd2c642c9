/// Overlay Messaging Module
///
/// HTTP-semantic request/response between peers on the metadata overlay.
/// Frames are 8-byte big-endian length prefixes followed by UTF-8 JSON of
/// an `OverlayMessage`; anything over 16 MiB is refused. Role services
/// (validator, client) register handlers on a method + path router, so
/// they get URL-like semantics without opening any TCP port.
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{AsyncRead, AsyncWrite};
use libp2p::{request_response, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;

use crate::error::{ZapError, ZapResult};
use crate::wire;

/// Protocol id for overlay messaging on the metadata host
pub const OVERLAY_PROTOCOL: &str = "/filezap/1.0.0";

/// Hard cap on a single overlay frame
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Message type carrying a `ServiceRequest` payload
pub const MSG_VALIDATOR_REQUEST: &str = "validator_request";
/// Message type carrying a `ServiceResponse` payload
pub const MSG_VALIDATOR_RESPONSE: &str = "validator_response";

/// Envelope exchanged on `/filezap/1.0.0`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverlayMessage {
    pub from_id: String,
    pub to_id: String,
    pub msg_type: String,
    pub payload: Vec<u8>,
    pub is_lan: bool,
}

/// HTTP-like request payload of a `validator_request`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// HTTP-like response payload of a `validator_response`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl ServiceResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::ok(body),
            Err(e) => Self::error(500, &format!("response encoding failed: {}", e)),
        }
    }

    pub fn error(status_code: u16, message: &str) -> Self {
        Self {
            status_code,
            body: message.as_bytes().to_vec(),
        }
    }

    pub fn not_found() -> Self {
        Self::error(404, "not found")
    }
}

impl OverlayMessage {
    pub fn request(from: &str, to: &str, req: &ServiceRequest) -> ZapResult<Self> {
        Ok(Self {
            from_id: from.to_string(),
            to_id: to.to_string(),
            msg_type: MSG_VALIDATOR_REQUEST.to_string(),
            payload: serde_json::to_vec(req)?,
            is_lan: false,
        })
    }

    pub fn response(from: &str, to: &str, rsp: &ServiceResponse) -> ZapResult<Self> {
        Ok(Self {
            from_id: from.to_string(),
            to_id: to.to_string(),
            msg_type: MSG_VALIDATOR_RESPONSE.to_string(),
            payload: serde_json::to_vec(rsp)?,
            is_lan: false,
        })
    }

    /// Decode the payload as a `ServiceRequest`.
    pub fn service_request(&self) -> ZapResult<ServiceRequest> {
        if self.msg_type != MSG_VALIDATOR_REQUEST {
            return Err(ZapError::Protocol(format!(
                "unexpected message type {:?}",
                self.msg_type
            )));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the payload as a `ServiceResponse`.
    pub fn service_response(&self) -> ZapResult<ServiceResponse> {
        if self.msg_type != MSG_VALIDATOR_RESPONSE {
            return Err(ZapError::Protocol(format!(
                "unexpected message type {:?}",
                self.msg_type
            )));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode into the wire frame payload, enforcing the frame cap.
    pub fn encode(&self) -> ZapResult<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ZapError::FrameTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> ZapResult<Self> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ZapError::FrameTooLarge(bytes.len()));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// request-response codec framing overlay messages
#[derive(Debug, Clone, Default)]
pub struct OverlayCodec;

#[async_trait]
impl request_response::Codec for OverlayCodec {
    type Protocol = StreamProtocol;
    type Request = OverlayMessage;
    type Response = OverlayMessage;

    async fn read_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let payload = wire::read_frame(io, MAX_FRAME_BYTES as u64).await?;
        OverlayMessage::decode(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let payload = wire::read_frame(io, MAX_FRAME_BYTES as u64).await?;
        OverlayMessage::decode(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let payload = req
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        wire::write_frame(io, &payload).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        rsp: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let payload = rsp
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        wire::write_frame(io, &payload).await
    }
}

// ===== ROUTING =====

/// Request context handed to a route handler
#[derive(Debug, Clone)]
pub struct RouteContext {
    /// Peer id of the requester
    pub peer: String,
    pub method: String,
    pub path: String,
    /// Values captured by `{name}` pattern segments
    pub params: HashMap<String, String>,
    pub body: Vec<u8>,
}

type Handler = Arc<dyn Fn(RouteContext) -> BoxFuture<'static, ServiceResponse> + Send + Sync>;

#[derive(Clone)]
enum Segment {
    Literal(String),
    Capture(String),
}

struct Route {
    method: String,
    segments: Vec<Segment>,
    has_captures: bool,
    handler: Handler,
}

/// Dispatch table keyed by method and path pattern.
///
/// Patterns are `/`-separated; a `{name}` segment captures the
/// corresponding path segment into the context. Exact routes win over
/// patterned routes; within each class the first registration wins.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn parse_pattern(pattern: &str) -> (Vec<Segment>, bool) {
    let mut has_captures = false;
    let segments = split_path(pattern)
        .into_iter()
        .map(|s| {
            if s.starts_with('{') && s.ends_with('}') && s.len() > 2 {
                has_captures = true;
                Segment::Capture(s[1..s.len() - 1].to_string())
            } else {
                Segment::Literal(s.to_string())
            }
        })
        .collect();
    (segments, has_captures)
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a handler for a method and path pattern.
    pub fn register<F, Fut>(&mut self, method: &str, pattern: &str, handler: F)
    where
        F: Fn(RouteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResponse> + Send + 'static,
    {
        let (segments, has_captures) = parse_pattern(pattern);
        let handler: Handler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.routes.push(Route {
            method: method.to_ascii_uppercase(),
            segments,
            has_captures,
            handler,
        });
    }

    fn matches(route: &Route, parts: &[&str]) -> Option<HashMap<String, String>> {
        if route.segments.len() != parts.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in route.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Capture(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }

    /// Route a request to the first matching handler.
    ///
    /// A path that matches a route under a different method yields 405; a
    /// path matching nothing yields 404.
    pub async fn dispatch(
        &self,
        peer: &str,
        method: &str,
        path: &str,
        body: Vec<u8>,
    ) -> ServiceResponse {
        let method = method.to_ascii_uppercase();
        let parts = split_path(path);
        let mut path_matched = false;

        // Exact routes first, then patterned, each in registration order.
        for patterned in [false, true] {
            for route in self.routes.iter().filter(|r| r.has_captures == patterned) {
                if let Some(params) = Self::matches(route, &parts) {
                    if route.method != method {
                        path_matched = true;
                        continue;
                    }
                    let ctx = RouteContext {
                        peer: peer.to_string(),
                        method: method.clone(),
                        path: path.to_string(),
                        params,
                        body,
                    };
                    return (route.handler)(ctx).await;
                }
            }
        }

        if path_matched {
            ServiceResponse::error(405, "method not allowed")
        } else {
            ServiceResponse::not_found()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exact_match_wins_over_pattern() {
        let mut router = Router::new();
        router.register("GET", "/files/{name}", |_| async {
            ServiceResponse::error(500, "pattern")
        });
        router.register("GET", "/files/index", |_| async {
            ServiceResponse::ok(b"exact".to_vec())
        });
        let rsp = router.dispatch("p1", "GET", "/files/index", vec![]).await;
        assert_eq!(rsp.body, b"exact");
    }

    #[tokio::test]
    async fn captures_are_extracted() {
        let mut router = Router::new();
        router.register("GET", "/files/{name}", |ctx: RouteContext| async move {
            ServiceResponse::ok(ctx.params["name"].as_bytes().to_vec())
        });
        let rsp = router.dispatch("p1", "get", "/files/report.zap", vec![]).await;
        assert_eq!(rsp.status_code, 200);
        assert_eq!(rsp.body, b"report.zap");
    }

    #[tokio::test]
    async fn wrong_method_is_405_and_unknown_path_404() {
        let mut router = Router::new();
        router.register("POST", "/chunks/{hash}", |_| async {
            ServiceResponse::ok(vec![])
        });
        let rsp = router.dispatch("p1", "GET", "/chunks/abc", vec![]).await;
        assert_eq!(rsp.status_code, 405);
        let rsp = router.dispatch("p1", "GET", "/nope", vec![]).await;
        assert_eq!(rsp.status_code, 404);
    }

    #[tokio::test]
    async fn first_registration_wins_ties() {
        let mut router = Router::new();
        router.register("GET", "/a/{x}", |_| async { ServiceResponse::ok(b"one".to_vec()) });
        router.register("GET", "/a/{y}", |_| async { ServiceResponse::ok(b"two".to_vec()) });
        let rsp = router.dispatch("p1", "GET", "/a/z", vec![]).await;
        assert_eq!(rsp.body, b"one");
    }

    #[test]
    fn frame_cap_enforced() {
        let msg = OverlayMessage {
            from_id: "a".into(),
            to_id: "b".into(),
            msg_type: MSG_VALIDATOR_REQUEST.into(),
            payload: vec![0u8; MAX_FRAME_BYTES],
            is_lan: false,
        };
        assert!(matches!(msg.encode(), Err(ZapError::FrameTooLarge(_))));
    }

    #[test]
    fn envelope_round_trip() {
        let req = ServiceRequest {
            method: "GET".into(),
            path: "/status".into(),
            body: vec![],
        };
        let msg = OverlayMessage::request("from", "to", &req).unwrap();
        let decoded = OverlayMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.service_request().unwrap(), req);
        assert!(decoded.service_response().is_err());
    }
}
