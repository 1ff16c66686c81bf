//! Dispatch module - routing decoded frames to handlers.
//!
//! The [`Dispatcher`] is a state machine over the frame kind: probes are
//! answered directly, requests are routed by action name through the
//! [`ActionRegistry`], replies pass through untouched for the client role,
//! and unknown kinds are answered with an ERROR frame instead of crashing
//! the connection.

mod registry;

pub use registry::{Action, ActionContext, ActionRegistry, ActionResult, TypedAction};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::codec::JsonCodec;
use crate::error::Result;
use crate::protocol::{Frame, FrameKind};
use crate::server::EngineStats;

/// Envelope of a REQUEST payload.
#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    action: String,
    #[serde(default)]
    params: Value,
}

/// Routes decoded frames to handlers and produces replies.
///
/// Stateless apart from the shared counters; all per-connection state lives
/// with the connection that owns the frames.
pub struct Dispatcher {
    registry: ActionRegistry,
    ctx: ActionContext,
}

impl Dispatcher {
    /// Create a dispatcher with the reference actions and fresh counters.
    pub fn new() -> Self {
        Self::with_stats(Arc::new(EngineStats::default()))
    }

    /// Create a dispatcher with the reference actions over shared counters.
    pub fn with_stats(stats: Arc<EngineStats>) -> Self {
        Self {
            registry: ActionRegistry::with_builtins(),
            ctx: ActionContext::new(stats),
        }
    }

    /// Create a dispatcher over a caller-built registry.
    pub fn with_registry(registry: ActionRegistry, stats: Arc<EngineStats>) -> Self {
        Self {
            registry,
            ctx: ActionContext::new(stats),
        }
    }

    /// Route one frame, returning at most one reply frame.
    ///
    /// PING yields a PONG; REQUEST yields a RESPONSE (application errors
    /// travel in the response payload); PONG/RESPONSE/ERROR yield nothing
    /// here — on the client role they resolve pending continuations before
    /// ever reaching a dispatcher. An unknown kind byte yields an ERROR
    /// frame.
    pub fn dispatch(&self, frame: &Frame) -> Result<Option<Frame>> {
        match frame.kind() {
            Some(FrameKind::Ping) => self.answer_ping(frame).map(Some),
            Some(FrameKind::Request) => self.answer_request(frame).map(Some),
            Some(FrameKind::Pong) | Some(FrameKind::Response) => {
                debug!(kind = frame.kind_byte, "reply frame outside client role");
                Ok(None)
            }
            Some(FrameKind::Error) => {
                warn!(payload = %String::from_utf8_lossy(frame.payload()), "peer error frame");
                Ok(None)
            }
            None => {
                warn!(kind = frame.kind_byte, "unknown frame kind");
                let payload = JsonCodec::encode(&json!({
                    "error": format!("unknown frame type 0x{:02X}", frame.kind_byte),
                }))?;
                Ok(Some(Frame::new(FrameKind::Error, payload.into())))
            }
        }
    }

    /// Build a PONG echoing the probe's fields plus a server timestamp.
    fn answer_ping(&self, frame: &Frame) -> Result<Frame> {
        // Anything that is not a JSON object is treated as an empty one;
        // a malformed probe payload is an application concern.
        let mut fields: Map<String, Value> = serde_json::from_slice(frame.payload())
            .ok()
            .and_then(|v: Value| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();

        fields.insert("timestamp".into(), json!(unix_millis()));

        let payload = JsonCodec::encode(&Value::Object(fields))?;
        Ok(Frame::new(FrameKind::Pong, payload.into()))
    }

    /// Route a REQUEST by action name and wrap the outcome in a RESPONSE.
    fn answer_request(&self, frame: &Frame) -> Result<Frame> {
        let body = match serde_json::from_slice::<RequestEnvelope>(frame.payload()) {
            Err(e) => json!({"error": format!("invalid request payload: {e}")}),
            Ok(envelope) => {
                match self.registry.run(&envelope.action, envelope.params, &self.ctx) {
                    None => {
                        json!({"error": format!("unknown action: {}", envelope.action)})
                    }
                    Some(Err(message)) => json!({"error": message}),
                    Some(Ok(result)) => {
                        self.ctx.stats.requests_handled.fetch_add(1, Ordering::Relaxed);
                        json!({"result": result})
                    }
                }
            }
        };

        let payload = JsonCodec::encode(&body)?;
        Ok(Frame::new(FrameKind::Response, payload.into()))
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(body: Value) -> Frame {
        Frame::new(
            FrameKind::Request,
            JsonCodec::encode(&body).unwrap().into(),
        )
    }

    fn response_body(reply: &Frame) -> Value {
        assert_eq!(reply.kind(), Some(FrameKind::Response));
        JsonCodec::decode(reply.payload()).unwrap()
    }

    #[test]
    fn ping_yields_pong_with_merged_fields() {
        let dispatcher = Dispatcher::new();
        let ping = Frame::new(
            FrameKind::Ping,
            JsonCodec::encode(&json!({"seq": 3})).unwrap().into(),
        );

        let pong = dispatcher.dispatch(&ping).unwrap().unwrap();
        assert_eq!(pong.kind(), Some(FrameKind::Pong));

        let body: Value = JsonCodec::decode(pong.payload()).unwrap();
        assert_eq!(body["seq"], json!(3));
        assert!(body["timestamp"].is_u64());
    }

    #[test]
    fn ping_with_non_object_payload_still_answers() {
        let dispatcher = Dispatcher::new();
        let ping = Frame::new(FrameKind::Ping, Bytes::from_static(b"not json"));

        let pong = dispatcher.dispatch(&ping).unwrap().unwrap();
        let body: Value = JsonCodec::decode(pong.payload()).unwrap();
        assert!(body["timestamp"].is_u64());
    }

    #[test]
    fn request_routes_to_action() {
        let dispatcher = Dispatcher::new();
        let req = request(json!({"action": "uppercase", "params": {"text": "abc"}}));

        let reply = dispatcher.dispatch(&req).unwrap().unwrap();
        assert_eq!(response_body(&reply), json!({"result": "ABC"}));
    }

    #[test]
    fn unknown_action_is_in_band_error() {
        let dispatcher = Dispatcher::new();
        let req = request(json!({"action": "frobnicate"}));

        let reply = dispatcher.dispatch(&req).unwrap().unwrap();
        let body = response_body(&reply);
        assert_eq!(body["error"], json!("unknown action: frobnicate"));
    }

    #[test]
    fn malformed_request_payload_is_in_band_error() {
        let dispatcher = Dispatcher::new();
        let req = Frame::new(FrameKind::Request, Bytes::from_static(b"{broken"));

        let reply = dispatcher.dispatch(&req).unwrap().unwrap();
        let body = response_body(&reply);
        assert!(body["error"].as_str().unwrap().contains("invalid request payload"));
    }

    #[test]
    fn unknown_kind_yields_error_frame() {
        let dispatcher = Dispatcher::new();
        let mystery = Frame::from_raw(0x42, Bytes::new());

        let reply = dispatcher.dispatch(&mystery).unwrap().unwrap();
        assert_eq!(reply.kind(), Some(FrameKind::Error));

        let body: Value = JsonCodec::decode(reply.payload()).unwrap();
        assert_eq!(body["error"], json!("unknown frame type 0x42"));
    }

    #[test]
    fn reply_kinds_produce_no_auto_reply() {
        let dispatcher = Dispatcher::new();

        for kind in [FrameKind::Pong, FrameKind::Response, FrameKind::Error] {
            let frame = Frame::new(kind, Bytes::from_static(b"{}"));
            assert!(dispatcher.dispatch(&frame).unwrap().is_none());
        }
    }

    #[test]
    fn requests_handled_counts_only_successes() {
        let dispatcher = Dispatcher::new();

        dispatcher
            .dispatch(&request(json!({"action": "echo", "params": 1})))
            .unwrap();
        dispatcher
            .dispatch(&request(json!({"action": "missing"})))
            .unwrap();

        assert_eq!(
            dispatcher.ctx.stats.requests_handled.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn uppercase_scenario_through_chunked_reassembly() {
        use crate::protocol::{encode_frame, FrameBuffer};

        // REQUEST fed in 3-byte chunks, dispatched, and the RESPONSE
        // re-encoded and decoded back to the same structure.
        let wire = encode_frame(
            FrameKind::Request,
            &JsonCodec::encode(&json!({"action": "uppercase", "params": {"text": "abc"}}))
                .unwrap(),
        );

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(3) {
            frames.extend(buffer.push(chunk).unwrap());
        }
        assert_eq!(frames.len(), 1);

        let dispatcher = Dispatcher::new();
        let reply = dispatcher.dispatch(&frames[0]).unwrap().unwrap();
        assert_eq!(response_body(&reply), json!({"result": "ABC"}));

        let reencoded = reply.encode();
        let decoded = FrameBuffer::new().push(&reencoded).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].kind(), Some(FrameKind::Response));
        assert_eq!(
            JsonCodec::decode::<Value>(decoded[0].payload()).unwrap(),
            json!({"result": "ABC"})
        );
    }
}
