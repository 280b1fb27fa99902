//! Client side of the mesh: dialing a router and the control commands an
//! endpoint sends to it.
//!
//! A process joins the mesh one of three ways:
//! - in-process, registered as a trusted leaf ([`connect_local`]);
//! - over the router's socket with a signed token ([`setup_with_jwt`]);
//! - over the router's socket with a single-use swap token ([`setup_with_swap_token`]).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::auth::{extract_unverified_rpc_context, extract_unverified_socket_name, SwapToken};
use crate::config::{AuthConfig, LinkConfig};
use crate::endpoint::Endpoint;
use crate::protocol::{
    command, AuthenticateRtnData, AuthenticateTokenData, RpcContext, RpcOpts, WaitForRouteData,
};
use crate::registry::CommandRegistry;
use crate::route::CONTROL_ROUTE;
use crate::router::Router;
use crate::transport::{pipe, spawn_stream};
use crate::{MeshError, Result};

/// Dial a router's unix socket. The link starts untrusted.
pub async fn connect_unix(
    path: impl AsRef<Path>,
    context: RpcContext,
    registry: Arc<CommandRegistry>,
    name: &str,
) -> Result<Endpoint> {
    let path = path.as_ref();
    let stream = tokio::time::timeout(LinkConfig::CONNECT_TIMEOUT, UnixStream::connect(path))
        .await
        .map_err(|_| {
            MeshError::timeout(format!(
                "connecting to {} took longer than {}ms",
                path.display(),
                LinkConfig::CONNECT_TIMEOUT.as_millis()
            ))
        })?
        .map_err(|e| MeshError::transport(format!("cannot connect to {}: {}", path.display(), e)))?;

    debug!("Connected to mesh socket {}", path.display());
    let transport = spawn_stream(stream, path.display().to_string());
    Ok(Endpoint::new(transport, context, registry, name))
}

/// Attach an in-process endpoint to `router` on `route_id`, skipping
/// authentication.
pub fn connect_local(
    router: &Router,
    route_id: &str,
    registry: Arc<CommandRegistry>,
) -> Result<Endpoint> {
    let (router_side, endpoint_side) = pipe(&format!("local:{}", route_id), route_id);
    router.register_trusted_leaf(router_side, route_id)?;
    Ok(Endpoint::new(
        endpoint_side,
        RpcContext::leaf(route_id),
        registry,
        route_id,
    ))
}

/// Dial the socket named in `jwt` and authenticate with it.
pub async fn setup_with_jwt(jwt: &str, registry: Arc<CommandRegistry>) -> Result<Endpoint> {
    let sock_name = extract_unverified_socket_name(jwt)?;
    let context = extract_unverified_rpc_context(jwt)?;
    let name = context.route_id.clone();
    let endpoint = connect_unix(&sock_name, context, registry, &name).await?;
    if let Err(e) = endpoint.authenticate(jwt).await {
        endpoint.close();
        return Err(e);
    }
    info!("Joined mesh at {} as {}", sock_name, name);
    Ok(endpoint)
}

/// Unpack a swap token, dial its socket and trade the token for an identity.
pub async fn setup_with_swap_token(
    packed: &str,
    registry: Arc<CommandRegistry>,
) -> Result<(Endpoint, AuthenticateRtnData)> {
    let swap = SwapToken::unpack(packed)?;
    let context = swap.rpc_context.clone().unwrap_or_default();
    let name = if context.route_id.is_empty() {
        "swap-client".to_string()
    } else {
        context.route_id.clone()
    };
    let endpoint = connect_unix(&swap.sock_name, context, registry, &name).await?;
    match endpoint.authenticate_token(&swap.token).await {
        Ok(rtn) => {
            if let Some(ctx) = &rtn.rpc_context {
                endpoint.set_rpc_context(ctx.clone());
            }
            info!("Joined mesh at {} via token swap", swap.sock_name);
            Ok((endpoint, rtn))
        }
        Err(e) => {
            endpoint.close();
            Err(e)
        }
    }
}

/// Join the mesh with whatever credential the launching process left in the
/// environment. A swap token wins over a JWT.
pub async fn setup_from_env(
    registry: Arc<CommandRegistry>,
) -> Result<(Endpoint, Option<AuthenticateRtnData>)> {
    if let Some(packed) = non_empty_env(AuthConfig::SWAP_TOKEN_ENV_VAR) {
        let (endpoint, rtn) = setup_with_swap_token(&packed, registry).await?;
        return Ok((endpoint, Some(rtn)));
    }
    if let Some(jwt) = non_empty_env(AuthConfig::JWT_ENV_VAR) {
        return Ok((setup_with_jwt(&jwt, registry).await?, None));
    }
    Err(MeshError::config(format!(
        "neither {} nor {} is set",
        AuthConfig::SWAP_TOKEN_ENV_VAR,
        AuthConfig::JWT_ENV_VAR
    )))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn control_opts() -> RpcOpts {
    RpcOpts::to(CONTROL_ROUTE)
}

impl Endpoint {
    /// Present a signed token to the router this endpoint is linked to.
    pub async fn authenticate(&self, jwt: &str) -> Result<AuthenticateRtnData> {
        self.call_as(command::AUTHENTICATE, jwt, &control_opts()).await
    }

    /// Trade a single-use swap token for an identity and environment.
    pub async fn authenticate_token(&self, token: &str) -> Result<AuthenticateRtnData> {
        let data = AuthenticateTokenData {
            token: token.to_string(),
        };
        self.call_as(command::AUTHENTICATE_TOKEN, data, &control_opts())
            .await
    }

    pub async fn set_peer_info(&self, peer_info: &str) -> Result<()> {
        self.call(command::SET_PEER_INFO, peer_info, &control_opts())
            .await
            .map(|_| ())
    }

    /// Ask the router to wait until `route_id` is bound. The call itself is
    /// given room beyond `wait` so the router answers before we give up.
    pub async fn wait_for_route(&self, route_id: &str, wait: Duration) -> Result<bool> {
        let data = WaitForRouteData {
            route_id: route_id.to_string(),
            wait_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
        };
        let opts =
            control_opts().with_timeout(wait.saturating_add(LinkConfig::DEFAULT_CALL_TIMEOUT));
        let value = self.call(command::WAIT_FOR_ROUTE, data, &opts).await?;
        Ok(matches!(value, Value::Bool(true)))
    }
}
