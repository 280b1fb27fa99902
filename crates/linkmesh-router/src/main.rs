//! linkmesh router daemon.
//!
//! Runs a root router, or a sub-router attached to an upstream router's
//! socket, and serves the mesh on a unix domain socket.

mod handlers;

use anyhow::{bail, Context, Result};
use clap::Parser;
use linkmesh::config::{AuthConfig, RouterConfig};
use linkmesh::route::make_random_proc_route_id;
use linkmesh::{connect_local, spawn_stream, JwtSigner, MeshServer, Router};
use std::path::PathBuf;
use tokio::net::UnixStream;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "linkmesh-router")]
#[command(about = "Router daemon for the linkmesh RPC mesh")]
struct Args {
    /// Socket path to serve the mesh on
    #[arg(short, long)]
    socket: PathBuf,

    /// Upstream router socket; makes this a sub-router
    #[arg(long)]
    upstream: Option<PathBuf>,

    /// Hex signing key shared by every router in the mesh
    #[arg(long, env = AuthConfig::AUTH_KEY_ENV_VAR)]
    auth_key: Option<String>,

    /// Router token presented to the upstream router
    #[arg(long, env = AuthConfig::JWT_ENV_VAR)]
    upstream_jwt: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let signer = match &args.auth_key {
        Some(key) => JwtSigner::from_hex(key).context("invalid auth key")?,
        None if args.upstream.is_some() => {
            bail!("a sub-router needs the mesh auth key ({})", AuthConfig::AUTH_KEY_ENV_VAR)
        }
        None => {
            let (signer, key) = JwtSigner::generate();
            // Read by whoever launches sub-routers and clients.
            println!("{}={}", AuthConfig::AUTH_KEY_ENV_VAR, hex::encode(key));
            signer
        }
    };

    let mut builder = Router::builder().signer(signer.clone());
    if args.upstream.is_some() {
        builder = builder.sub_router();
    }
    let router = builder.build()?;

    if let Some(upstream) = &args.upstream {
        let jwt = match &args.upstream_jwt {
            Some(jwt) => jwt.clone(),
            None => signer.make_client_token(&linkmesh::RpcContext::router())?,
        };
        let stream = UnixStream::connect(upstream)
            .await
            .with_context(|| format!("cannot reach upstream {}", upstream.display()))?;
        let transport = spawn_stream(stream, upstream.display().to_string());
        router
            .connect_upstream(transport, &jwt)
            .await
            .context("upstream rejected this router")?;
        info!("Attached to upstream {}", upstream.display());
    }

    // Swap tokens live only on the root.
    let _sweeper = router
        .is_root()
        .then(|| router.spawn_token_sweeper(RouterConfig::TOKEN_SWEEP_INTERVAL));

    let mut server = MeshServer::start_unix(router.clone(), &args.socket).await?;
    let registry = handlers::daemon_registry(
        router.clone(),
        args.socket.to_string_lossy().into_owned(),
    )?;
    // A sub-router must not shadow the root's default route.
    let daemon_route = if router.is_root() {
        router.default_route().to_string()
    } else {
        make_random_proc_route_id()
    };
    let _daemon = connect_local(&router, &daemon_route, registry)?;
    info!("Daemon commands served on route {}", daemon_route);

    // Intentional stdout for the launching process
    println!("MESH_SOCKET={}", server.path().display());
    info!(
        "{} router serving on {}",
        if router.is_root() { "Root" } else { "Sub" },
        server.path().display()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    server.shutdown();
    router.shutdown();

    Ok(())
}
