//! # linkmesh
//!
//! A multiplexed RPC mesh. Processes hold [`Endpoint`]s connected over
//! framed links to [`Router`]s. Routers form a tree: a root router plus any
//! number of sub-routers, each escalating routes it does not know to its
//! parent.
//!
//! ## Example
//!
//! ```rust,ignore
//! use linkmesh::{connect_local, CommandRegistry, Router, RpcOpts};
//!
//! #[tokio::main]
//! async fn main() -> linkmesh::Result<()> {
//!     let router = Router::builder().build()?;
//!
//!     let registry = CommandRegistry::builder()
//!         .call("echo", |_ctx, text: String| async move { Ok(text) })
//!         .build()?;
//!     let _server = connect_local(&router, "server", registry)?;
//!
//!     let client = connect_local(&router, "proc:client", CommandRegistry::empty())?;
//!     let reply: String = client.call_as("echo", "hi", &RpcOpts::default()).await?;
//!     assert_eq!(reply, "hi");
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod route;
pub mod router;
pub mod server;
pub mod transport;
pub mod wait;

pub use auth::{JwtSigner, SwapToken, TokenSwapEntry, TokenSwapStore};
pub use client::{
    connect_local, connect_unix, setup_from_env, setup_with_jwt, setup_with_swap_token,
};
pub use endpoint::{collect_stream, Endpoint, ResponseStream};
pub use error::{MeshError, Result};
pub use protocol::{AuthenticateRtnData, RpcContext, RpcMessage, RpcOpts};
pub use registry::{CommandRegistry, CommandShape, RequestContext};
pub use router::{LinkId, LinkKind, RouteDecision, Router, RouterBuilder, RouterSnapshot};
pub use server::{MeshServer, MeshServerHandle};
pub use transport::{pipe, spawn_stream, Transport};
