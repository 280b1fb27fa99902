//! Endpoints: the RPC surface on one end of a link.
//!
//! An endpoint multiplexes concurrent calls over its link by reqid. Outgoing
//! requests park a response channel in the pending table; the run loop
//! routes each response to its channel and drops the entry on the final
//! one. Incoming requests are served by handlers from the endpoint's
//! [`CommandRegistry`], each in its own task so a slow handler never stalls
//! the link.
//!
//! When the link dies every pending caller gets a transport error and every
//! running handler is aborted.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

use crate::config::LinkConfig;
use crate::protocol::{MessageKind, RpcContext, RpcMessage, RpcOpts};
use crate::registry::{CommandRegistry, Handler, RequestContext};
use crate::transport::{LinkCloser, Transport};
use crate::{MeshError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn to_data<T: Serialize>(data: T) -> Result<Option<Value>> {
    match serde_json::to_value(data)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

struct EndpointInner {
    name: String,
    context: RwLock<RpcContext>,
    outbound: mpsc::Sender<RpcMessage>,
    closer: LinkCloser,
    registry: Arc<CommandRegistry>,
    // Unbounded so the run loop never waits on one caller; backpressure
    // stays on the link channel.
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<RpcMessage>>>,
    running: Mutex<HashMap<String, AbortHandle>>,
    closed: AtomicBool,
}

impl EndpointInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn send(&self, msg: RpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::transport(format!("link {} is closed", self.name)));
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| MeshError::transport(format!("link {} is closed", self.name)))
    }

    fn register_pending(&self, reqid: &str) -> Result<mpsc::UnboundedReceiver<RpcMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pending = lock(&self.pending);
        // Checked under the lock so shutdown cannot miss this entry.
        if self.is_closed() {
            return Err(MeshError::transport(format!("link {} is closed", self.name)));
        }
        pending.insert(reqid.to_string(), tx);
        Ok(rx)
    }

    fn remove_pending(&self, reqid: &str) {
        lock(&self.pending).remove(reqid);
    }

    /// Stop waiting on `reqid` and ask the far side to stop working on it.
    fn abandon(&self, reqid: &str, route: Option<String>) {
        self.remove_pending(reqid);
        let cancel = RpcMessage::cancel(reqid, route);
        match self.outbound.try_send(cancel) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cancel)) => {
                // Runs from Drop too, which may be outside a runtime.
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    debug!("{}: cancel for {} dropped, link busy", self.name, reqid);
                    return;
                };
                let outbound = self.outbound.clone();
                runtime.spawn(async move {
                    let _ = tokio::time::timeout(
                        LinkConfig::CANCEL_SEND_TIMEOUT,
                        outbound.send(cancel),
                    )
                    .await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("{}: cancel for {} not sent, link closed", self.name, reqid);
            }
        }
    }

    fn deliver_response(&self, msg: RpcMessage) {
        let Some(resid) = msg.resid.clone() else {
            return;
        };
        let sender = {
            let mut pending = lock(&self.pending);
            if msg.is_final() {
                pending.remove(&resid)
            } else {
                pending.get(&resid).cloned()
            }
        };
        match sender {
            // A dropped receiver means the caller gave up; nothing to do.
            Some(sender) => {
                let _ = sender.send(msg);
            }
            None => debug!("{}: dropping response for unknown request {}", self.name, resid),
        }
    }

    fn cancel_running(&self, reqid: &str) {
        if let Some(handle) = lock(&self.running).remove(reqid) {
            debug!("{}: cancelling handler for {}", self.name, reqid);
            handle.abort();
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        let running: Vec<_> = lock(&self.running).drain().collect();
        if !pending.is_empty() || !running.is_empty() {
            debug!(
                "{}: link closed with {} pending calls and {} running handlers",
                self.name,
                pending.len(),
                running.len()
            );
        }
        for (_, handle) in running {
            handle.abort();
        }
        self.closer.close();
    }
}

/// One end of a link with call, stream and dispatch capabilities.
///
/// Cloning is cheap; all clones share the same link.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Endpoint {
    /// Take ownership of a link and start serving it.
    pub fn new(
        transport: Transport,
        context: RpcContext,
        registry: Arc<CommandRegistry>,
        name: impl Into<String>,
    ) -> Self {
        let Transport {
            outbound,
            inbound,
            closer,
            ..
        } = transport;
        let inner = Arc::new(EndpointInner {
            name: name.into(),
            context: RwLock::new(context),
            outbound,
            closer,
            registry,
            pending: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(Self::run(inner.clone(), inbound));
        Self { inner }
    }

    async fn run(inner: Arc<EndpointInner>, mut inbound: mpsc::Receiver<RpcMessage>) {
        while let Some(msg) = inbound.recv().await {
            match msg.kind() {
                Ok(MessageKind::Response) => inner.deliver_response(msg),
                Ok(MessageKind::Request) => Self::dispatch_request(&inner, msg),
                Ok(MessageKind::Cancel) => {
                    if let Some(reqid) = msg.reqid.as_deref() {
                        inner.cancel_running(reqid);
                    }
                }
                Err(e) => {
                    warn!("{}: closing link: {}", inner.name, e);
                    break;
                }
            }
        }
        inner.shutdown();
    }

    fn dispatch_request(inner: &Arc<EndpointInner>, msg: RpcMessage) {
        let command = msg.command.clone().unwrap_or_default();
        let reqid = msg.reqid.clone();

        let Some(descriptor) = inner.registry.get(&command) else {
            warn!("{}: no handler for command {}", inner.name, command);
            if let Some(reqid) = reqid {
                let err = MeshError::protocol(format!("unknown command: {}", command));
                let inner = inner.clone();
                tokio::spawn(async move {
                    let _ = inner.send(RpcMessage::error_response(reqid, &err)).await;
                });
            }
            return;
        };

        let handler = descriptor.handler.clone();
        let endpoint = Endpoint {
            inner: inner.clone(),
        };
        let ctx = RequestContext::new(command, msg.source, reqid.clone(), endpoint);
        let data = msg.data.unwrap_or(Value::Null);
        let task_inner = inner.clone();
        let task_reqid = reqid.clone();

        // Holding the lock across spawn keeps a fast handler from removing
        // its entry before it has been inserted.
        let mut running = lock(&inner.running);
        let task = tokio::spawn(async move {
            serve_request(&task_inner, handler, ctx, data, task_reqid.as_deref()).await;
            if let Some(reqid) = task_reqid {
                lock(&task_inner.running).remove(&reqid);
            }
        });
        if let Some(reqid) = reqid {
            running.insert(reqid, task.abort_handle());
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn rpc_context(&self) -> RpcContext {
        self.inner
            .context
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_rpc_context(&self, context: RpcContext) {
        *self
            .inner
            .context
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = context;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed() || self.inner.closer.is_closed()
    }

    /// Close the link. Pending calls fail with a transport error.
    pub fn close(&self) {
        self.inner.closer.close();
    }

    /// Resolves once the link is gone.
    pub async fn closed(&self) {
        self.inner.closer.closed().await;
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Send a request and wait for its single response.
    ///
    /// With `opts.no_response` set this only enqueues the message and
    /// returns `Value::Null`.
    pub async fn call<T: Serialize>(&self, command: &str, data: T, opts: &RpcOpts) -> Result<Value> {
        if opts.no_response {
            self.send_no_response(command, data, opts)?;
            return Ok(Value::Null);
        }

        let timeout = opts.timeout.unwrap_or(LinkConfig::DEFAULT_CALL_TIMEOUT);
        let reqid = new_request_id();
        let mut rx = self.inner.register_pending(&reqid)?;
        let msg = match to_data(data) {
            Ok(data) => RpcMessage::request(
                command,
                data,
                Some(reqid.clone()),
                opts.route.clone(),
                Some(timeout),
            ),
            Err(e) => {
                self.inner.remove_pending(&reqid);
                return Err(e);
            }
        };

        let exchange = async {
            self.inner.send(msg).await?;
            loop {
                match rx.recv().await {
                    Some(resp) if !resp.is_final() => {
                        debug!("{}: ignoring stream item for call {}", self.inner.name, command);
                    }
                    Some(resp) => return resp.into_result(),
                    None => {
                        return Err(MeshError::transport(format!(
                            "link {} closed before {} completed",
                            self.inner.name, command
                        )))
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => {
                self.inner.remove_pending(&reqid);
                result
            }
            Err(_) => {
                self.inner.abandon(&reqid, opts.route.clone());
                Err(MeshError::timeout(format!(
                    "{} did not complete within {}ms",
                    command,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// [`Endpoint::call`] with a typed response.
    pub async fn call_as<T: Serialize, R: DeserializeOwned>(
        &self,
        command: &str,
        data: T,
        opts: &RpcOpts,
    ) -> Result<R> {
        let value = self.call(command, data, opts).await?;
        serde_json::from_value(value)
            .map_err(|e| MeshError::protocol(format!("unexpected {} response: {}", command, e)))
    }

    /// Send a request whose responses arrive as a stream.
    ///
    /// The stream yields each item, then ends. Any failure (remote error,
    /// link loss, deadline) is yielded once as the final item.
    pub async fn stream_call<T: Serialize>(
        &self,
        command: &str,
        data: T,
        opts: &RpcOpts,
    ) -> ResponseStream {
        let reqid = new_request_id();
        // A timeout too large to represent means no deadline.
        let deadline = opts
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout))
            .map(|at| Box::pin(tokio::time::sleep_until(at)));
        let mut stream = ResponseStream {
            reqid: reqid.clone(),
            command: command.to_string(),
            route: opts.route.clone(),
            rx: None,
            inner: self.inner.clone(),
            deadline,
            pending_error: None,
            done: false,
        };

        let rx = match self.inner.register_pending(&reqid) {
            Ok(rx) => rx,
            Err(e) => {
                stream.pending_error = Some(e);
                return stream;
            }
        };
        stream.rx = Some(rx);

        let msg = match to_data(data) {
            Ok(data) => RpcMessage::request(
                command,
                data,
                Some(reqid),
                opts.route.clone(),
                opts.timeout,
            ),
            Err(e) => {
                stream.pending_error = Some(e);
                return stream;
            }
        };
        if let Err(e) = self.inner.send(msg).await {
            stream.pending_error = Some(e);
        }
        stream
    }

    /// Fire-and-forget. Drops the message with a warning when the link is
    /// backed up instead of waiting for room.
    pub fn send_no_response<T: Serialize>(&self, command: &str, data: T, opts: &RpcOpts) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::transport(format!("link {} is closed", self.inner.name)));
        }
        let msg = RpcMessage::request(command, to_data(data)?, None, opts.route.clone(), None);
        match self.inner.outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{}: link backed up, dropping {}", self.inner.name, command);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MeshError::transport(format!(
                "link {} is closed",
                self.inner.name
            ))),
        }
    }
}

async fn serve_request(
    inner: &EndpointInner,
    handler: Handler,
    ctx: RequestContext,
    data: Value,
    reqid: Option<&str>,
) {
    match handler {
        Handler::Call(handler) => {
            let result = handler(ctx, data).await;
            match reqid {
                Some(reqid) => {
                    let _ = inner.send(RpcMessage::from_result(reqid, result)).await;
                }
                None => {
                    if let Err(e) = result {
                        debug!("{}: no-response handler failed: {}", inner.name, e);
                    }
                }
            }
        }
        Handler::Stream(handler) => {
            let mut items = match handler(ctx, data) {
                Ok(items) => items,
                Err(e) => {
                    if let Some(reqid) = reqid {
                        let _ = inner.send(RpcMessage::error_response(reqid, &e)).await;
                    }
                    return;
                }
            };
            while let Some(item) = items.next().await {
                let Some(reqid) = reqid else {
                    continue;
                };
                let msg = match item {
                    Ok(value) => RpcMessage::response(reqid, Some(value), true),
                    Err(e) => {
                        let _ = inner.send(RpcMessage::error_response(reqid, &e)).await;
                        return;
                    }
                };
                if inner.send(msg).await.is_err() {
                    return;
                }
            }
            if let Some(reqid) = reqid {
                let _ = inner.send(RpcMessage::response(reqid, None, false)).await;
            }
        }
    }
}

/// Responses of a [`Endpoint::stream_call`].
///
/// Dropping the stream before it ends cancels the request.
pub struct ResponseStream {
    reqid: String,
    command: String,
    route: Option<String>,
    rx: Option<mpsc::UnboundedReceiver<RpcMessage>>,
    inner: Arc<EndpointInner>,
    deadline: Option<Pin<Box<Sleep>>>,
    pending_error: Option<MeshError>,
    done: bool,
}

impl ResponseStream {
    pub fn reqid(&self) -> &str {
        &self.reqid
    }

    fn finish(&mut self) {
        self.done = true;
        self.inner.remove_pending(&self.reqid);
    }
}

impl Stream for ResponseStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(err) = this.pending_error.take() {
            this.finish();
            return Poll::Ready(Some(Err(err)));
        }
        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.done = true;
                this.inner.abandon(&this.reqid, this.route.clone());
                return Poll::Ready(Some(Err(MeshError::timeout(format!(
                    "stream {} exceeded its deadline",
                    this.command
                )))));
            }
        }
        let Some(rx) = this.rx.as_mut() else {
            this.finish();
            return Poll::Ready(None);
        };

        match rx.poll_recv(cx) {
            Poll::Ready(Some(msg)) => {
                if !msg.is_final() {
                    return Poll::Ready(Some(Ok(msg.data.unwrap_or(Value::Null))));
                }
                this.finish();
                match msg.into_result() {
                    Err(e) => Poll::Ready(Some(Err(e))),
                    Ok(Value::Null) => Poll::Ready(None),
                    Ok(value) => Poll::Ready(Some(Ok(value))),
                }
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(Some(Err(MeshError::transport(format!(
                    "link closed during stream {}",
                    this.command
                )))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.done && self.rx.is_some() {
            self.inner.abandon(&self.reqid, self.route.clone());
        }
    }
}

/// Collect a stream into its items, stopping at the first error.
pub async fn collect_stream(mut stream: ResponseStream) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item?);
    }
    Ok(items)
}
