//! Commands served by the router daemon's built-in "server" leaf.

use std::collections::HashMap;
use std::sync::Arc;

use linkmesh::route::{is_control_route, make_random_proc_route_id};
use linkmesh::{CommandRegistry, MeshError, RequestContext, Router, RpcContext, TokenSwapEntry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct IssueTokenRequest {
    /// Route the new client will own. A random proc route when omitted.
    #[serde(rename = "routeid", default)]
    pub route_id: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(rename = "initscripttext", default)]
    pub init_script_text: String,
}

#[derive(Debug, Serialize)]
pub struct IssuedToken {
    #[serde(rename = "routeid")]
    pub route_id: String,
    pub token: String,
}

/// Build the registry for the daemon's own leaf. `sock_name` is baked into
/// issued credentials so clients know where to dial.
pub fn daemon_registry(router: Router, sock_name: String) -> linkmesh::Result<Arc<CommandRegistry>> {
    let status_router = router.clone();
    let jwt_router = router.clone();
    let jwt_sock = sock_name.clone();
    let swap_router = router;
    let swap_sock = sock_name;

    CommandRegistry::builder()
        .call("ping", |ctx: RequestContext, _: Value| async move {
            Ok(json!({ "pong": true, "source": ctx.source }))
        })
        .call("meshstatus", move |_ctx, _: Value| {
            let router = status_router.clone();
            async move { Ok(router.snapshot()) }
        })
        .call("issuejwt", move |ctx, req: IssueTokenRequest| {
            let router = jwt_router.clone();
            let sock = jwt_sock.clone();
            async move { issue_jwt(&router, &sock, &ctx, req) }
        })
        .call("issueswaptoken", move |ctx, req: IssueTokenRequest| {
            let router = swap_router.clone();
            let sock = swap_sock.clone();
            async move { issue_swap_token(&router, &sock, &ctx, req) }
        })
        .build()
}

/// Route a new credential is minted for. Only fresh routes qualify: not the
/// default route, not a control route, not one a link already owns.
fn issuable_route(router: &Router, requested: Option<String>) -> linkmesh::Result<String> {
    let Some(route_id) = requested else {
        return Ok(make_random_proc_route_id());
    };
    if route_id.is_empty() {
        return Err(MeshError::invalid_params("routeid must not be empty"));
    }
    if route_id == router.default_route() || is_control_route(&route_id) {
        return Err(MeshError::invalid_params(format!(
            "cannot issue credentials for reserved route {}",
            route_id
        )));
    }
    if router.link_for_route(&route_id).is_some() {
        return Err(MeshError::routing(format!("route {} is already bound", route_id)));
    }
    Ok(route_id)
}

fn issue_jwt(
    router: &Router,
    sock_name: &str,
    ctx: &RequestContext,
    req: IssueTokenRequest,
) -> linkmesh::Result<IssuedToken> {
    let signer = router
        .signer()
        .ok_or_else(|| MeshError::config("router has no signing key"))?;
    let route_id = issuable_route(router, req.route_id)?;
    let token = signer.make_client_token(&RpcContext::leaf(&route_id).with_sock_name(sock_name))?;
    info!(
        "Issued JWT for {} to {}",
        route_id,
        ctx.source.as_deref().unwrap_or("unknown")
    );
    Ok(IssuedToken { route_id, token })
}

fn issue_swap_token(
    router: &Router,
    sock_name: &str,
    ctx: &RequestContext,
    req: IssueTokenRequest,
) -> linkmesh::Result<IssuedToken> {
    if !router.is_root() {
        return Err(MeshError::routing("swap tokens can only be issued by the root router"));
    }
    let route_id = issuable_route(router, req.route_id)?;
    let mut entry = TokenSwapEntry::new(RpcContext::leaf(&route_id).with_sock_name(sock_name))
        .with_init_script(req.init_script_text);
    for (key, value) in req.env {
        entry = entry.with_env(key, value);
    }
    let token = entry.swap_token(sock_name).pack()?;
    router.token_store().add(entry)?;
    info!(
        "Issued swap token for {} to {}",
        route_id,
        ctx.source.as_deref().unwrap_or("unknown")
    );
    Ok(IssuedToken { route_id, token })
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkmesh::{connect_local, JwtSigner, RpcOpts, SwapToken};

    fn daemon(router: &Router) -> linkmesh::Endpoint {
        let registry = daemon_registry(router.clone(), "/tmp/mesh.sock".into()).unwrap();
        connect_local(router, "server", registry).unwrap()
    }

    #[tokio::test]
    async fn test_ping_reports_caller() {
        let router = Router::builder().build().unwrap();
        let _daemon = daemon(&router);
        let client = connect_local(&router, "proc:pinger", CommandRegistry::empty()).unwrap();

        let reply = client.call("ping", Value::Null, &RpcOpts::default()).await.unwrap();
        assert_eq!(reply, json!({ "pong": true, "source": "proc:pinger" }));
    }

    #[tokio::test]
    async fn test_meshstatus_lists_routes() {
        let router = Router::builder().build().unwrap();
        let _daemon = daemon(&router);
        let client = connect_local(&router, "proc:viewer", CommandRegistry::empty()).unwrap();

        let status = client
            .call("meshstatus", Value::Null, &RpcOpts::default())
            .await
            .unwrap();
        assert_eq!(status["is_root"], json!(true));
        assert!(status["routes"].get("server").is_some());
        assert!(status["routes"].get("proc:viewer").is_some());
    }

    #[tokio::test]
    async fn test_issued_jwt_validates() {
        let (signer, _) = JwtSigner::generate();
        let router = Router::builder().signer(signer.clone()).build().unwrap();
        let _daemon = daemon(&router);
        let client = connect_local(&router, "proc:launcher", CommandRegistry::empty()).unwrap();

        let reply = client
            .call("issuejwt", json!({ "routeid": "proc:child" }), &RpcOpts::default())
            .await
            .unwrap();
        let ctx = signer.validate(reply["token"].as_str().unwrap()).unwrap();
        assert_eq!(ctx.route_id, "proc:child");
        assert_eq!(ctx.sock_name, "/tmp/mesh.sock");
    }

    #[tokio::test]
    async fn test_issuejwt_without_key_fails() {
        let router = Router::builder().build().unwrap();
        let _daemon = daemon(&router);
        let client = connect_local(&router, "proc:launcher", CommandRegistry::empty()).unwrap();

        let err = client
            .call("issuejwt", json!({}), &RpcOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Config { .. }));
    }

    #[tokio::test]
    async fn test_issued_swap_token_is_stored() {
        let router = Router::builder().build().unwrap();
        let _daemon = daemon(&router);
        let client = connect_local(&router, "proc:launcher", CommandRegistry::empty()).unwrap();

        let reply = client
            .call(
                "issueswaptoken",
                json!({ "env": { "MODE": "child" } }),
                &RpcOpts::default(),
            )
            .await
            .unwrap();
        let swap = SwapToken::unpack(reply["token"].as_str().unwrap()).unwrap();
        assert_eq!(swap.sock_name, "/tmp/mesh.sock");
        assert!(reply["routeid"].as_str().unwrap().starts_with("proc:"));

        let entry = router.token_store().get_and_remove(&swap.token).unwrap();
        assert_eq!(entry.env.get("MODE").map(String::as_str), Some("child"));
    }

    #[tokio::test]
    async fn test_credentials_refused_for_reserved_routes() {
        let (signer, _) = JwtSigner::generate();
        let router = Router::builder().signer(signer).build().unwrap();
        let _daemon = daemon(&router);
        let client = connect_local(&router, "proc:launcher", CommandRegistry::empty()).unwrap();

        for route in ["server", "$control", "$control:root"] {
            for command in ["issuejwt", "issueswaptoken"] {
                let err = client
                    .call(command, json!({ "routeid": route }), &RpcOpts::default())
                    .await
                    .unwrap_err();
                assert!(matches!(err, MeshError::InvalidParams { .. }), "{} {}", command, route);
            }
        }
        assert!(router.token_store().is_empty());
    }

    #[tokio::test]
    async fn test_credentials_refused_for_live_routes() {
        let (signer, _) = JwtSigner::generate();
        let router = Router::builder().signer(signer).build().unwrap();
        let _daemon = daemon(&router);
        let _owner = connect_local(&router, "proc:owner", CommandRegistry::empty()).unwrap();
        let client = connect_local(&router, "proc:launcher", CommandRegistry::empty()).unwrap();

        let err = client
            .call("issuejwt", json!({ "routeid": "proc:owner" }), &RpcOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Routing { .. }));

        let err = client
            .call("issueswaptoken", json!({ "routeid": "proc:launcher" }), &RpcOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Routing { .. }));
        assert!(router.token_store().is_empty());
    }
}
