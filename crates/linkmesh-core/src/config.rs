//! Centralized configuration constants.
//!
//! Runtime choices (root or sub-router, signing key, default route) are made
//! on [`crate::router::RouterBuilder`]; the values here are fixed limits.

use std::time::Duration;

/// Link framing and endpoint call configuration.
pub struct LinkConfig;

impl LinkConfig {
    /// Slots in each bounded per-direction message channel.
    pub const CHANNEL_SIZE: usize = 32;

    /// Largest frame accepted from a peer (16MB).
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Timeout applied to a call when the caller gives none.
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

    /// Timeout for dialing a unix socket.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Buffer size of an in-process duplex pipe.
    pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;

    /// How long an abandoned call waits for room to send its cancel.
    pub const CANCEL_SEND_TIMEOUT: Duration = Duration::from_secs(1);
}

/// Authentication configuration.
pub struct AuthConfig;

impl AuthConfig {
    /// How long a token swap entry stays claimable.
    pub const TOKEN_SWAP_EXPIRY: Duration = Duration::from_secs(5 * 60);

    /// Lifetime of minted client tokens.
    pub const JWT_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    pub const JWT_ISSUER: &'static str = "linkmesh";

    /// Random signing key length in bytes.
    pub const AUTH_KEY_LEN: usize = 32;

    pub const JWT_ENV_VAR: &'static str = "LINKMESH_JWT";
    pub const SWAP_TOKEN_ENV_VAR: &'static str = "LINKMESH_SWAPTOKEN";
    pub const AUTH_KEY_ENV_VAR: &'static str = "LINKMESH_AUTH_KEY";
}

/// Router configuration.
pub struct RouterConfig;

impl RouterConfig {
    /// Cap on simultaneously registered links accepted from a listener.
    pub const MAX_CONNECTIONS: usize = 256;

    /// Timeout for calls the router makes itself (upstream auth, announces, token verify).
    pub const CONTROL_CALL_TIMEOUT: Duration = Duration::from_secs(5);

    /// How often the root drops swap entries nobody redeemed.
    pub const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_limits() {
        assert_eq!(LinkConfig::CHANNEL_SIZE, 32);
        assert!(LinkConfig::PIPE_BUFFER_SIZE < LinkConfig::MAX_FRAME_SIZE);
    }

    #[test]
    fn test_swap_expiry_is_five_minutes() {
        assert_eq!(AuthConfig::TOKEN_SWAP_EXPIRY, Duration::from_secs(300));
    }
}
