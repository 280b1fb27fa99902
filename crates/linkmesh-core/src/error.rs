//! Error types for the mesh.
//!
//! Every failure a caller can observe falls into one of five kinds:
//! authentication, routing, protocol, timeout and transport. The remaining
//! variants cover local plumbing (JSON, IO, configuration) and errors that
//! arrived over the wire with a code we do not recognise.

use thiserror::Error;

/// Main error type for linkmesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Bad or missing credentials, or a command rejected by the link firewall.
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    /// No route, a route conflict, or a forwarding loop.
    #[error("Routing error: {message}")]
    Routing { message: String },

    /// Malformed message, unknown command or an unexpected response shape.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Timeout: {message}")]
    Timeout { message: String },

    /// The link closed or failed while a request was outstanding.
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// An error received from a peer whose code has no local mapping.
    #[error("Remote error ({code}): {message}")]
    Remote { code: i32, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for linkmesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

impl MeshError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Map this error to a JSON-RPC style error code.
    ///
    /// Standard codes:
    /// - -32700: Parse error
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Mesh codes (-32010 to -32019):
    /// - -32010: Authentication
    /// - -32011: Routing
    /// - -32012: Protocol
    /// - -32013: Timeout
    /// - -32014: Transport
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            MeshError::Json { .. } => -32700,
            MeshError::InvalidParams { .. } => -32602,
            MeshError::Authentication { .. } => -32010,
            MeshError::Routing { .. } => -32011,
            MeshError::Protocol { .. } => -32012,
            MeshError::Timeout { .. } => -32013,
            MeshError::Transport { .. } => -32014,
            MeshError::Remote { code, .. } => *code,
            MeshError::Config { .. } | MeshError::Io { .. } | MeshError::Other(_) => -32603,
        }
    }

    /// Message carried on the wire. The kind travels in the code, so the
    /// display prefix is left off to avoid doubling it on the far side.
    pub fn wire_message(&self) -> String {
        match self {
            MeshError::Authentication { message }
            | MeshError::Routing { message }
            | MeshError::Protocol { message }
            | MeshError::Timeout { message }
            | MeshError::Transport { message }
            | MeshError::InvalidParams { message }
            | MeshError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a wire code and message.
    pub fn from_wire(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            -32602 => MeshError::InvalidParams { message },
            -32010 => MeshError::Authentication { message },
            -32011 => MeshError::Routing { message },
            -32012 => MeshError::Protocol { message },
            -32013 => MeshError::Timeout { message },
            -32014 => MeshError::Transport { message },
            code => MeshError::Remote { code, message },
        }
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::routing("route not found: proc:abc");
        assert_eq!(err.to_string(), "Routing error: route not found: proc:abc");

        let err = MeshError::Remote {
            code: 7,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "Remote error (7): boom");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(MeshError::auth("x").to_rpc_error_code(), -32010);
        assert_eq!(MeshError::routing("x").to_rpc_error_code(), -32011);
        assert_eq!(MeshError::protocol("x").to_rpc_error_code(), -32012);
        assert_eq!(MeshError::timeout("x").to_rpc_error_code(), -32013);
        assert_eq!(MeshError::transport("x").to_rpc_error_code(), -32014);
        assert_eq!(MeshError::invalid_params("x").to_rpc_error_code(), -32602);
        assert_eq!(MeshError::Other("x".into()).to_rpc_error_code(), -32603);
    }

    #[test]
    fn test_wire_mapping_keeps_kind_and_message() {
        let original = MeshError::auth("no token entry found");
        let rebuilt = MeshError::from_wire(original.to_rpc_error_code(), original.wire_message());
        assert!(matches!(rebuilt, MeshError::Authentication { .. }));
        assert_eq!(rebuilt.to_string(), original.to_string());

        let unknown = MeshError::from_wire(-1, "custom");
        assert!(matches!(unknown, MeshError::Remote { code: -1, .. }));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: MeshError = io_err.into();
        assert!(matches!(err, MeshError::Io { .. }));
        assert_eq!(err.to_rpc_error_code(), -32603);
    }
}
