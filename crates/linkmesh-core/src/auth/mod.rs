//! Authentication: client tokens, the single-use token swap, and the rules a
//! presented identity must satisfy.

mod jwt;
mod token_swap;

pub use jwt::{
    extract_unverified_claims, extract_unverified_rpc_context, extract_unverified_socket_name,
    JwtSigner, MeshClaims,
};
pub use token_swap::{SwapToken, TokenSwapEntry, TokenSwapStore};

use crate::protocol::RpcContext;
use crate::{MeshError, Result};

/// Check an authenticated identity. A router identity has no route; a leaf
/// identity must name exactly the route it will be bound to.
///
/// Returns the route to bind, or `None` for a router.
pub fn validate_rpc_context(ctx: Option<&RpcContext>) -> Result<Option<&str>> {
    let ctx = ctx.ok_or_else(|| MeshError::auth("no context found in token"))?;
    if ctx.is_router {
        if !ctx.route_id.is_empty() {
            return Err(MeshError::auth("invalid context, router cannot have a routeid"));
        }
        return Ok(None);
    }
    if ctx.route_id.is_empty() {
        return Err(MeshError::auth("invalid context, must have a routeid"));
    }
    Ok(Some(&ctx.route_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_context_names_route() {
        let ctx = RpcContext::leaf("proc:1");
        assert_eq!(validate_rpc_context(Some(&ctx)).unwrap(), Some("proc:1"));
    }

    #[test]
    fn test_router_context_has_no_route() {
        assert_eq!(validate_rpc_context(Some(&RpcContext::router())).unwrap(), None);

        let mut bad = RpcContext::router();
        bad.route_id = "proc:1".into();
        let err = validate_rpc_context(Some(&bad)).unwrap_err();
        assert!(err.to_string().contains("router cannot have a routeid"));
    }

    #[test]
    fn test_missing_or_empty_context_rejected() {
        assert!(validate_rpc_context(None).is_err());
        let err = validate_rpc_context(Some(&RpcContext::default())).unwrap_err();
        assert!(err.to_string().contains("must have a routeid"));
    }
}
