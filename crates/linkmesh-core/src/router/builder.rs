//! Builder for [`Router`].
//!
//! # Example
//!
//! ```rust,ignore
//! use linkmesh::{JwtSigner, Router};
//!
//! let (signer, key) = JwtSigner::generate();
//! let root = Router::builder().signer(signer).build()?;
//!
//! let sub = Router::builder()
//!     .sub_router()
//!     .signer(JwtSigner::new(&key))
//!     .build()?;
//! ```

use std::sync::Arc;

use super::Router;
use crate::auth::{JwtSigner, TokenSwapStore};
use crate::route::{is_control_route, DEFAULT_ROUTE};
use crate::{MeshError, Result};

/// Builder for creating a [`Router`].
pub struct RouterBuilder {
    is_root: bool,
    default_route: String,
    signer: Option<JwtSigner>,
    token_store: Option<Arc<TokenSwapStore>>,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    /// Start with a root router serving the default route.
    pub fn new() -> Self {
        Self {
            is_root: true,
            default_route: DEFAULT_ROUTE.to_string(),
            signer: None,
            token_store: None,
        }
    }

    /// Build a sub-router that escalates unknown routes upstream.
    pub fn sub_router(mut self) -> Self {
        self.is_root = false;
        self
    }

    pub fn root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Route that receives requests sent without one.
    pub fn default_route(mut self, route_id: impl Into<String>) -> Self {
        self.default_route = route_id.into();
        self
    }

    /// Key used to validate client tokens on `authenticate`.
    pub fn signer(mut self, signer: JwtSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Share a swap store with the code that launches processes.
    pub fn token_store(mut self, store: Arc<TokenSwapStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn build(self) -> Result<Router> {
        if self.default_route.is_empty() {
            return Err(MeshError::config("default route cannot be empty"));
        }
        if is_control_route(&self.default_route) {
            return Err(MeshError::config(format!(
                "default route cannot be the control route {}",
                self.default_route
            )));
        }
        Ok(Router::from_parts(
            self.is_root,
            self.default_route,
            self.signer,
            self.token_store.unwrap_or_default(),
        ))
    }
}
