//! Command registry for incoming requests.
//!
//! Each command has a name, a shape (single response or response stream)
//! and a typed handler. Handlers take serde-deserialized input and produce
//! serde-serializable output; the registry erases both to JSON values.
//!
//! ```rust,ignore
//! let registry = CommandRegistry::builder()
//!     .call("echo", |_ctx, text: String| async move { Ok(text) })
//!     .stream("count", |_ctx, n: u32| {
//!         let (tx, rx) = tokio::sync::mpsc::channel(4);
//!         tokio::spawn(async move {
//!             for i in 0..n {
//!                 if tx.send(Ok(i)).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!         rx
//!     })
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::endpoint::Endpoint;
use crate::protocol::command;
use crate::{MeshError, Result};

/// What a handler sees about the request it is serving.
#[derive(Clone)]
pub struct RequestContext {
    pub command: String,
    /// Route of the caller as stamped by the router, if any.
    pub source: Option<String>,
    pub reqid: Option<String>,
    endpoint: Endpoint,
}

impl RequestContext {
    pub(crate) fn new(
        command: String,
        source: Option<String>,
        reqid: Option<String>,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            command,
            source,
            reqid,
            endpoint,
        }
    }

    /// The endpoint serving this request, for calls back into the mesh.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the caller expects a response.
    pub fn expects_response(&self) -> bool {
        self.reqid.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandShape {
    Call,
    ResponseStream,
}

type CallFn = dyn Fn(RequestContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;
type StreamFn = dyn Fn(RequestContext, Value) -> Result<BoxStream<'static, Result<Value>>> + Send + Sync;

#[derive(Clone)]
pub(crate) enum Handler {
    Call(Arc<CallFn>),
    Stream(Arc<StreamFn>),
}

/// A registered command.
#[derive(Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub shape: CommandShape,
    pub input_type: &'static str,
    pub output_type: &'static str,
    pub(crate) handler: Handler,
}

impl std::fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("input_type", &self.input_type)
            .field("output_type", &self.output_type)
            .finish()
    }
}

/// Immutable set of commands an endpoint serves.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandDescriptor>,
}

impl CommandRegistry {
    pub fn builder() -> CommandRegistryBuilder {
        CommandRegistryBuilder::default()
    }

    /// A registry that serves nothing. Endpoints that only make calls use this.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

fn decode_input<I: DeserializeOwned>(command: &str, data: Value) -> Result<I> {
    serde_json::from_value(data)
        .map_err(|e| MeshError::invalid_params(format!("{}: {}", command, e)))
}

/// Builder for [`CommandRegistry`].
#[derive(Default)]
pub struct CommandRegistryBuilder {
    commands: Vec<CommandDescriptor>,
}

impl CommandRegistryBuilder {
    /// Register a single-response command.
    pub fn call<I, O, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(RequestContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Arc<CallFn> = Arc::new(move |ctx: RequestContext, data: Value| {
            let handler = handler.clone();
            async move {
                let input: I = decode_input(&ctx.command, data)?;
                let output = handler.as_ref()(ctx, input).await?;
                Ok::<Value, MeshError>(serde_json::to_value(output)?)
            }
            .boxed()
        });
        self.commands.push(CommandDescriptor {
            name: name.to_string(),
            shape: CommandShape::Call,
            input_type: std::any::type_name::<I>(),
            output_type: std::any::type_name::<O>(),
            handler: Handler::Call(erased),
        });
        self
    }

    /// Register a response-stream command. The handler returns the receiving
    /// end of a channel; the stream ends when the handler drops the sender.
    pub fn stream<I, O, F>(mut self, name: &str, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(RequestContext, I) -> mpsc::Receiver<Result<O>> + Send + Sync + 'static,
    {
        let erased: Arc<StreamFn> = Arc::new(move |ctx: RequestContext, data: Value| {
            let input: I = decode_input(&ctx.command, data)?;
            let rx = handler(ctx, input);
            let items = futures::stream::unfold(rx, |mut rx| async move {
                let item = rx.recv().await?;
                let item = item.and_then(|output| Ok(serde_json::to_value(output)?));
                Some((item, rx))
            });
            let items: BoxStream<'static, Result<Value>> = items.boxed();
            Ok::<_, MeshError>(items)
        });
        self.commands.push(CommandDescriptor {
            name: name.to_string(),
            shape: CommandShape::ResponseStream,
            input_type: std::any::type_name::<I>(),
            output_type: std::any::type_name::<O>(),
            handler: Handler::Stream(erased),
        });
        self
    }

    /// Validate names and freeze the registry.
    pub fn build(self) -> Result<Arc<CommandRegistry>> {
        let mut commands = HashMap::with_capacity(self.commands.len());
        for descriptor in self.commands {
            if descriptor.name.is_empty() {
                return Err(MeshError::config("command name cannot be empty"));
            }
            if command::is_control(&descriptor.name) {
                return Err(MeshError::config(format!(
                    "command name '{}' is reserved for routers",
                    descriptor.name
                )));
            }
            if commands.contains_key(&descriptor.name) {
                return Err(MeshError::config(format!(
                    "command '{}' registered twice",
                    descriptor.name
                )));
            }
            commands.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Arc::new(CommandRegistry { commands }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_ctx: RequestContext, _input: ()) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_duplicate_command_rejected() {
        let result = CommandRegistry::builder()
            .call("ping", noop)
            .call("ping", noop)
            .build();
        assert!(matches!(result, Err(MeshError::Config { .. })));
    }

    #[test]
    fn test_control_name_rejected() {
        let result = CommandRegistry::builder().call("authenticate", noop).build();
        assert!(matches!(result, Err(MeshError::Config { .. })));
    }

    #[test]
    fn test_descriptors_record_shape() {
        let registry = CommandRegistry::builder()
            .call("ping", noop)
            .stream("ticks", |_ctx, _n: u32| {
                let (_tx, rx) = mpsc::channel::<Result<u32>>(1);
                rx
            })
            .build()
            .unwrap();

        assert_eq!(registry.names(), vec!["ping", "ticks"]);
        assert_eq!(registry.get("ping").unwrap().shape, CommandShape::Call);
        let ticks = registry.get("ticks").unwrap();
        assert_eq!(ticks.shape, CommandShape::ResponseStream);
        assert_eq!(ticks.input_type, "u32");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_decode_input_maps_to_invalid_params() {
        let err = decode_input::<u32>("count", serde_json::json!("nope")).unwrap_err();
        assert!(matches!(err, MeshError::InvalidParams { .. }));
    }
}
