//! Single-use token swap.
//!
//! The root mints an entry, hands the packed [`SwapToken`] to a process it
//! launches, and the process trades it once for its identity and environment.
//! Entries expire after [`AuthConfig::TOKEN_SWAP_EXPIRY`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::AuthConfig;
use crate::protocol::{AuthenticateRtnData, RpcContext};
use crate::{MeshError, Result};

#[derive(Debug, Clone)]
pub struct TokenSwapEntry {
    pub token: String,
    pub rpc_context: Option<RpcContext>,
    pub env: HashMap<String, String>,
    pub init_script_text: String,
    pub expires_at: Instant,
}

impl TokenSwapEntry {
    pub fn new(rpc_context: RpcContext) -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            rpc_context: Some(rpc_context),
            env: HashMap::new(),
            init_script_text: String::new(),
            expires_at: Instant::now() + AuthConfig::TOKEN_SWAP_EXPIRY,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_init_script(mut self, script: impl Into<String>) -> Self {
        self.init_script_text = script.into();
        self
    }

    pub fn with_expiry(mut self, expires_in: Duration) -> Self {
        self.expires_at = Instant::now() + expires_in;
        self
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// The token a launched process receives.
    pub fn swap_token(&self, sock_name: impl Into<String>) -> SwapToken {
        SwapToken {
            token: self.token.clone(),
            sock_name: sock_name.into(),
            rpc_context: self.rpc_context.clone(),
        }
    }

    pub fn into_rtn_data(self) -> AuthenticateRtnData {
        AuthenticateRtnData {
            env: self.env,
            init_script_text: self.init_script_text,
            rpc_context: self.rpc_context,
        }
    }
}

/// What a launched process gets: the token, where to dial, and who it will be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapToken {
    pub token: String,
    #[serde(rename = "sockname")]
    pub sock_name: String,
    #[serde(rename = "rpccontext", default, skip_serializing_if = "Option::is_none")]
    pub rpc_context: Option<RpcContext>,
}

impl SwapToken {
    /// Pack into a single env-var-safe string.
    pub fn pack(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn unpack(packed: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(packed.trim())
            .map_err(|e| MeshError::auth(format!("invalid swap token: {}", e)))?;
        serde_json::from_slice(&bytes).map_err(|e| MeshError::auth(format!("invalid swap token: {}", e)))
    }
}

/// Outstanding swap entries, consumed at most once.
#[derive(Debug, Default)]
pub struct TokenSwapStore {
    entries: Mutex<HashMap<String, TokenSwapEntry>>,
}

impl TokenSwapStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TokenSwapEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a new entry. Expired entries are dropped first so tokens that
    /// are never redeemed do not pile up.
    pub fn add(&self, entry: TokenSwapEntry) -> Result<()> {
        if entry.token.is_empty() {
            return Err(MeshError::invalid_params("swap token cannot be empty"));
        }
        let mut entries = self.lock();
        let swept = retain_live(&mut entries);
        if swept > 0 {
            debug!("Dropped {} expired swap entries", swept);
        }
        if entries.contains_key(&entry.token) {
            return Err(MeshError::invalid_params("swap token already registered"));
        }
        entries.insert(entry.token.clone(), entry);
        Ok(())
    }

    /// Remove and return the entry for `token`. Expired entries are removed
    /// and reported as missing.
    pub fn get_and_remove(&self, token: &str) -> Option<TokenSwapEntry> {
        let entry = self.lock().remove(token)?;
        if entry.is_expired() {
            debug!("Swap token expired before use");
            return None;
        }
        Some(entry)
    }

    /// Drop expired entries, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        retain_live(&mut self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn retain_live(entries: &mut HashMap<String, TokenSwapEntry>) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired());
    before - entries.len()
}
