//! Handlers for commands addressed to a router's control route.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{LinkId, LinkKind, Router};
use crate::auth::validate_rpc_context;
use crate::config::RouterConfig;
use crate::protocol::{
    command, AuthenticateRtnData, AuthenticateTokenData, RpcMessage, WaitForRouteData,
};
use crate::route::CONTROL_ROOT_ROUTE;
use crate::{MeshError, Result};

fn decode<T: DeserializeOwned>(command: &str, msg: &RpcMessage) -> Result<T> {
    let data = msg.data.clone().unwrap_or(Value::Null);
    serde_json::from_value(data)
        .map_err(|e| MeshError::invalid_params(format!("{}: {}", command, e)))
}

pub(super) async fn handle_control(router: &Router, ingress: LinkId, msg: &RpcMessage) -> Result<Value> {
    let name = msg.command.as_deref().unwrap_or_default();
    match name {
        command::AUTHENTICATE => {
            let jwt: String = decode(name, msg)?;
            Ok(serde_json::to_value(authenticate(router, ingress, &jwt)?)?)
        }
        command::AUTHENTICATE_TOKEN => {
            let data: AuthenticateTokenData = decode(name, msg)?;
            Ok(serde_json::to_value(authenticate_token(router, ingress, &data).await?)?)
        }
        command::AUTHENTICATE_TOKEN_VERIFY => {
            let data: AuthenticateTokenData = decode(name, msg)?;
            Ok(serde_json::to_value(verify_token(router, &data)?)?)
        }
        command::SET_PEER_INFO => {
            let peer_info: String = decode(name, msg)?;
            if router.link_kind(ingress) == Some(LinkKind::Untrusted) {
                return Err(MeshError::auth("setpeerinfo requires an authenticated link"));
            }
            router.set_peer_info(ingress, peer_info)?;
            Ok(Value::Null)
        }
        command::ROUTE_ANNOUNCE => {
            let source = announced_route(router, ingress, name, msg)?;
            router.bind_route(ingress, source, false)?;
            Ok(Value::Null)
        }
        command::ROUTE_UNANNOUNCE => {
            let source = announced_route(router, ingress, name, msg)?;
            router.unbind_route(ingress, source);
            Ok(Value::Null)
        }
        command::WAIT_FOR_ROUTE => {
            let data: WaitForRouteData = decode(name, msg)?;
            let bound = router
                .wait_for_register(&data.route_id, Duration::from_millis(data.wait_ms))
                .await;
            Ok(Value::Bool(bound))
        }
        other => Err(MeshError::protocol(format!("unknown control command: {}", other))),
    }
}

/// Route carried by an announce. Only peer routers may announce.
fn announced_route<'a>(
    router: &Router,
    ingress: LinkId,
    command: &str,
    msg: &'a RpcMessage,
) -> Result<&'a str> {
    if router.link_kind(ingress) != Some(LinkKind::Router) {
        return Err(MeshError::auth(format!("{} requires a router link", command)));
    }
    msg.source
        .as_deref()
        .filter(|source| !source.is_empty())
        .ok_or_else(|| MeshError::invalid_params(format!("{} requires a source", command)))
}

fn authenticate(router: &Router, ingress: LinkId, jwt: &str) -> Result<AuthenticateRtnData> {
    if jwt.is_empty() {
        return Err(MeshError::auth("no token provided"));
    }
    router.ensure_untrusted(ingress)?;
    let signer = router
        .signer()
        .ok_or_else(|| MeshError::auth("router has no signing key"))?;
    let ctx = signer.validate(jwt)?;
    let route_id = validate_rpc_context(Some(&ctx))?;
    router.authenticate_link(ingress, route_id)?;
    Ok(AuthenticateRtnData {
        rpc_context: Some(ctx),
        ..Default::default()
    })
}

async fn authenticate_token(
    router: &Router,
    ingress: LinkId,
    data: &AuthenticateTokenData,
) -> Result<AuthenticateRtnData> {
    if data.token.is_empty() {
        return Err(MeshError::invalid_params("no token provided"));
    }
    // Checked before the token is consumed.
    router.ensure_untrusted(ingress)?;
    let rtn = if router.is_root() {
        verify_token(router, data)?
    } else {
        let value = router
            .call_route(
                CONTROL_ROOT_ROUTE,
                command::AUTHENTICATE_TOKEN_VERIFY,
                Some(serde_json::to_value(data)?),
                RouterConfig::CONTROL_CALL_TIMEOUT,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| {
            MeshError::protocol(format!("unexpected token verify response: {}", e))
        })?
    };
    let route_id = leaf_route(&rtn)?;
    router.authenticate_link(ingress, Some(&route_id))?;
    Ok(rtn)
}

/// Consume a swap entry. Only the root holds entries.
fn verify_token(router: &Router, data: &AuthenticateTokenData) -> Result<AuthenticateRtnData> {
    if !router.is_root() {
        return Err(MeshError::routing(
            "authenticatetokenverify can only be called on the root router",
        ));
    }
    let entry = router
        .token_store()
        .get_and_remove(&data.token)
        .ok_or_else(|| MeshError::auth("no token entry found"))?;
    let rtn = entry.into_rtn_data();
    leaf_route(&rtn)?;
    Ok(rtn)
}

fn leaf_route(rtn: &AuthenticateRtnData) -> Result<String> {
    match validate_rpc_context(rtn.rpc_context.as_ref())? {
        Some(route_id) => Ok(route_id.to_string()),
        None => Err(MeshError::auth("cannot auth router via token")),
    }
}
