//! Wire protocol: the message envelope, control payloads and framing.
//!
//! Every link carries a sequence of frames, each a 4-byte big-endian length
//! prefix followed by one JSON-encoded [`RpcMessage`]:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! A message is one of three kinds, decided by which fields are set:
//! a request (`command`), a response (`resid`) or a cancel (`cancel` + `reqid`).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::LinkConfig;
use crate::{MeshError, Result};

/// Control command names. These are handled by routers, never by leaves.
pub mod command {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const AUTHENTICATE_TOKEN: &str = "authenticatetoken";
    pub const AUTHENTICATE_TOKEN_VERIFY: &str = "authenticatetokenverify";
    pub const SET_PEER_INFO: &str = "setpeerinfo";
    pub const ROUTE_ANNOUNCE: &str = "routeannounce";
    pub const ROUTE_UNANNOUNCE: &str = "routeunannounce";
    pub const WAIT_FOR_ROUTE: &str = "waitforroute";

    /// All reserved control commands.
    pub const CONTROL_COMMANDS: &[&str] = &[
        AUTHENTICATE,
        AUTHENTICATE_TOKEN,
        AUTHENTICATE_TOKEN_VERIFY,
        SET_PEER_INFO,
        ROUTE_ANNOUNCE,
        ROUTE_UNANNOUNCE,
        WAIT_FOR_ROUTE,
    ];

    /// Commands an unauthenticated link may send.
    pub const UNTRUSTED_ALLOWED: &[&str] = &[
        AUTHENTICATE,
        AUTHENTICATE_TOKEN,
        AUTHENTICATE_TOKEN_VERIFY,
        SET_PEER_INFO,
        ROUTE_ANNOUNCE,
        ROUTE_UNANNOUNCE,
    ];

    pub fn is_control(command: &str) -> bool {
        CONTROL_COMMANDS.contains(&command)
    }

    pub fn allowed_untrusted(command: &str) -> bool {
        UNTRUSTED_ALLOWED.contains(&command)
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i32,
    pub message: String,
}

impl RpcErrorBody {
    pub fn into_error(self) -> MeshError {
        MeshError::from_wire(self.code, self.message)
    }
}

impl From<&MeshError> for RpcErrorBody {
    fn from(err: &MeshError) -> Self {
        Self {
            code: err.to_rpc_error_code(),
            message: err.wire_message(),
        }
    }
}

/// The envelope every link carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resid: Option<String>,
    /// Caller's timeout in milliseconds, advisory for the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// More responses follow for this resid.
    #[serde(default, skip_serializing_if = "is_false")]
    pub cont: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Kind of an [`RpcMessage`], derived from its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Cancel,
}

impl RpcMessage {
    /// Build a request. A request without `reqid` expects no response.
    pub fn request(
        command: impl Into<String>,
        data: Option<serde_json::Value>,
        reqid: Option<String>,
        route: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            command: Some(command.into()),
            reqid,
            route,
            timeout: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            data,
            ..Default::default()
        }
    }

    /// Build a response. `cont` marks an intermediate stream item.
    pub fn response(resid: impl Into<String>, data: Option<serde_json::Value>, cont: bool) -> Self {
        Self {
            resid: Some(resid.into()),
            data,
            cont,
            ..Default::default()
        }
    }

    /// Build a final error response.
    pub fn error_response(resid: impl Into<String>, err: &MeshError) -> Self {
        Self {
            resid: Some(resid.into()),
            error: Some(err.into()),
            ..Default::default()
        }
    }

    /// Build a final response from a handler result.
    pub fn from_result(resid: impl Into<String>, result: Result<serde_json::Value>) -> Self {
        match result {
            Ok(value) => Self::response(resid, Some(value), false),
            Err(err) => Self::error_response(resid, &err),
        }
    }

    pub fn cancel(reqid: impl Into<String>, route: Option<String>) -> Self {
        Self {
            reqid: Some(reqid.into()),
            route,
            cancel: true,
            ..Default::default()
        }
    }

    /// Classify this message, rejecting field combinations no peer should send.
    pub fn kind(&self) -> Result<MessageKind> {
        if self.cancel {
            if self.reqid.is_none() {
                return Err(MeshError::protocol("cancel without reqid"));
            }
            return Ok(MessageKind::Cancel);
        }
        match (&self.command, &self.resid) {
            (Some(command), None) if !command.is_empty() => Ok(MessageKind::Request),
            (Some(_), None) => Err(MeshError::protocol("request with empty command")),
            (None, Some(_)) => Ok(MessageKind::Response),
            (Some(_), Some(_)) => Err(MeshError::protocol("message has both command and resid")),
            (None, None) => Err(MeshError::protocol("message has neither command nor resid")),
        }
    }

    /// Whether this is the last response for its resid.
    pub fn is_final(&self) -> bool {
        !self.cont || self.error.is_some()
    }

    /// Turn a response into the caller-facing result.
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self.error {
            Some(err) => Err(err.into_error()),
            None => Ok(self.data.unwrap_or(serde_json::Value::Null)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate one frame payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let msg: RpcMessage = serde_json::from_slice(bytes)
            .map_err(|e| MeshError::protocol(format!("malformed message: {}", e)))?;
        msg.kind()?;
        Ok(msg)
    }
}

/// Identity claims a peer presents when it authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcContext {
    #[serde(rename = "routeid", default, skip_serializing_if = "String::is_empty")]
    pub route_id: String,
    #[serde(rename = "sockname", default, skip_serializing_if = "String::is_empty")]
    pub sock_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn: Option<String>,
    #[serde(rename = "blockid", default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(rename = "isrouter", default, skip_serializing_if = "is_false")]
    pub is_router: bool,
}

impl RpcContext {
    pub fn leaf(route_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            ..Default::default()
        }
    }

    pub fn router() -> Self {
        Self {
            is_router: true,
            ..Default::default()
        }
    }

    pub fn with_sock_name(mut self, sock_name: impl Into<String>) -> Self {
        self.sock_name = sock_name.into();
        self
    }

    pub fn with_block_id(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }
}

/// Payload of `authenticatetoken` and `authenticatetokenverify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateTokenData {
    pub token: String,
}

/// Result of an authentication command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateRtnData {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(rename = "initscripttext", default, skip_serializing_if = "String::is_empty")]
    pub init_script_text: String,
    #[serde(rename = "rpccontext", default, skip_serializing_if = "Option::is_none")]
    pub rpc_context: Option<RpcContext>,
}

/// Payload of `waitforroute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForRouteData {
    #[serde(rename = "routeid")]
    pub route_id: String,
    #[serde(rename = "waitms")]
    pub wait_ms: u64,
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RpcOpts {
    /// Destination route. `None` addresses the router's default route.
    pub route: Option<String>,
    /// Overrides [`LinkConfig::DEFAULT_CALL_TIMEOUT`] for calls; bounds the
    /// whole stream for stream calls.
    pub timeout: Option<Duration>,
    /// Send without a reqid and never wait for a response.
    pub no_response: bool,
}

impl RpcOpts {
    pub fn to(route: impl Into<String>) -> Self {
        Self {
            route: Some(route.into()),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(timeout_ms))
    }

    pub fn no_response(mut self) -> Self {
        self.no_response = true;
        self
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the link).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > LinkConfig::MAX_FRAME_SIZE {
        return Err(MeshError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            LinkConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > LinkConfig::MAX_FRAME_SIZE {
        return Err(MeshError::protocol(format!(
            "outgoing frame size {} exceeds maximum {}",
            payload.len(),
            LinkConfig::MAX_FRAME_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_omits_unset_fields() {
        let msg = RpcMessage::request("ping", None, Some("r1".into()), None, None);
        let text = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert_eq!(text, r#"{"command":"ping","reqid":"r1"}"#);
    }

    #[test]
    fn test_message_kinds() {
        let req = RpcMessage::request("ping", None, None, None, None);
        assert_eq!(req.kind().unwrap(), MessageKind::Request);

        let resp = RpcMessage::response("r1", Some(json!(1)), true);
        assert_eq!(resp.kind().unwrap(), MessageKind::Response);
        assert!(!resp.is_final());

        let cancel = RpcMessage::cancel("r1", None);
        assert_eq!(cancel.kind().unwrap(), MessageKind::Cancel);

        let bad = RpcMessage {
            command: Some("x".into()),
            resid: Some("r1".into()),
            ..Default::default()
        };
        assert!(matches!(bad.kind(), Err(MeshError::Protocol { .. })));
        assert!(RpcMessage::default().kind().is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            RpcMessage::decode(b"not json"),
            Err(MeshError::Protocol { .. })
        ));
        assert!(RpcMessage::decode(br#"{"cont":true}"#).is_err());
    }

    #[test]
    fn test_error_response_round_trips_kind() {
        let msg = RpcMessage::error_response("r9", &MeshError::routing("route not found: x"));
        assert!(msg.is_final());
        let decoded = RpcMessage::decode(&msg.encode().unwrap()).unwrap();
        let err = decoded.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Routing error: route not found: x");
    }

    #[test]
    fn test_rpc_context_wire_names() {
        let ctx = RpcContext::leaf("proc:1").with_block_id("b1");
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value, json!({"routeid": "proc:1", "blockid": "b1"}));

        let parsed: RpcContext = serde_json::from_value(json!({"isrouter": true})).unwrap();
        assert_eq!(parsed, RpcContext::router());
    }

    #[test]
    fn test_control_command_sets() {
        assert!(command::is_control("waitforroute"));
        assert!(!command::allowed_untrusted("waitforroute"));
        assert!(command::allowed_untrusted("authenticate"));
        assert!(!command::is_control("ping"));
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let payload = b"hello, world";
        let mut buf = Vec::new();
        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await.unwrap();
        assert_eq!(result, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_oversized_rejected() {
        let len = (LinkConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut cursor = std::io::Cursor::new(len.to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(MeshError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_frame_truncated_payload_is_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(MeshError::Io { .. })
        ));
    }
}
