//! Routers: switch messages between links by route.
//!
//! A router owns a set of links, each with a trust level, and a route table
//! mapping route ids to links. Requests are delivered to the link that owns
//! their route, escalated to the upstream router when the route is unknown,
//! or handled locally when addressed to the control route. Responses travel
//! back along the forwarding table keyed by reqid.
//!
//! All router state sits behind one mutex that is never held across an
//! await. A link's messages are handled in order by a single task.

mod builder;
mod control;

pub use builder::RouterBuilder;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::auth::{JwtSigner, TokenSwapStore};
use crate::config::RouterConfig;
use crate::endpoint::new_request_id;
use crate::protocol::{command, MessageKind, RpcMessage};
use crate::route::{CONTROL_ROOT_ROUTE, CONTROL_ROUTE};
use crate::transport::{LinkCloser, Transport};
use crate::wait::RouteWaiters;
use crate::{MeshError, Result};

pub type LinkId = u64;

/// Trust level of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// May only authenticate.
    Untrusted,
    /// An authenticated endpoint; its requests are stamped with its route.
    Leaf,
    /// A peer router; may announce routes and set its own sources.
    Router,
}

/// Where a request goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Addressed to this router's control route.
    Local,
    /// Delivered to the link that owns the route.
    Forward(LinkId),
    /// Unknown here; sent to the upstream router.
    Escalate(LinkId),
    NotFound,
}

/// Read-only view of one link.
#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    pub id: LinkId,
    pub kind: LinkKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_info: Option<String>,
    pub routes: Vec<String>,
}

/// Read-only view of the whole router.
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    pub is_root: bool,
    pub links: Vec<LinkInfo>,
    pub routes: BTreeMap<String, LinkId>,
    pub in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<LinkId>,
}

struct LinkEntry {
    name: String,
    kind: LinkKind,
    peer_info: Option<String>,
    /// Route asserted when the link authenticated; stamped as the source of
    /// its requests.
    identity: Option<String>,
    outbound: mpsc::Sender<RpcMessage>,
    closer: LinkCloser,
    routes: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy)]
struct ForwardEntry {
    ingress: LinkId,
    egress: LinkId,
}

struct Originated {
    link: LinkId,
    tx: oneshot::Sender<RpcMessage>,
}

#[derive(Default)]
struct RouterState {
    links: HashMap<LinkId, LinkEntry>,
    routes: HashMap<String, LinkId>,
    forwards: HashMap<String, ForwardEntry>,
    originated: HashMap<String, Originated>,
    upstream: Option<LinkId>,
}

#[derive(Debug)]
enum Announcement {
    Bind(String),
    Unbind(String),
}

struct RouterInner {
    is_root: bool,
    default_route: String,
    signer: Option<JwtSigner>,
    token_store: Arc<TokenSwapStore>,
    state: Mutex<RouterState>,
    waiters: RouteWaiters,
    next_link_id: AtomicU64,
    announcer: Mutex<Option<mpsc::UnboundedSender<Announcement>>>,
}

enum ResponseTarget {
    Link(mpsc::Sender<RpcMessage>),
    Originated(oneshot::Sender<RpcMessage>),
    Drop,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A root or sub-router. Cloning is cheap; clones share one router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("is_root", &self.inner.is_root)
            .field("default_route", &self.inner.default_route)
            .finish()
    }
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    fn from_parts(
        is_root: bool,
        default_route: String,
        signer: Option<JwtSigner>,
        token_store: Arc<TokenSwapStore>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                is_root,
                default_route,
                signer,
                token_store,
                state: Mutex::new(RouterState::default()),
                waiters: RouteWaiters::new(),
                next_link_id: AtomicU64::new(0),
                announcer: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        lock(&self.inner.state)
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_root
    }

    pub fn default_route(&self) -> &str {
        &self.inner.default_route
    }

    pub fn signer(&self) -> Option<&JwtSigner> {
        self.inner.signer.as_ref()
    }

    /// Swap entries this router hands out. Only consulted on the root.
    pub fn token_store(&self) -> &Arc<TokenSwapStore> {
        &self.inner.token_store
    }

    // ========================================
    // Link lifecycle
    // ========================================

    /// Adopt a link and start reading from it.
    pub fn register_link(&self, transport: Transport, kind: LinkKind) -> LinkId {
        let Transport {
            outbound,
            inbound,
            closer,
            peer,
        } = transport;
        let id = self.inner.next_link_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Registered link {} ({}) as {:?}", id, peer, kind);
        self.state().links.insert(
            id,
            LinkEntry {
                name: peer,
                kind,
                peer_info: None,
                identity: None,
                outbound,
                closer,
                routes: BTreeSet::new(),
            },
        );
        let router = self.clone();
        tokio::spawn(async move { router.serve_link(id, inbound).await });
        id
    }

    /// Register an in-process endpoint that skips authentication.
    pub fn register_trusted_leaf(&self, transport: Transport, route_id: &str) -> Result<LinkId> {
        let id = self.register_link(transport, LinkKind::Leaf);
        if let Some(entry) = self.state().links.get_mut(&id) {
            entry.identity = Some(route_id.to_string());
        }
        if let Err(e) = self.bind_route(id, route_id, true) {
            self.close_link(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Close the link that owns `route_id`, if any.
    pub fn unregister_trusted_leaf(&self, route_id: &str) {
        if let Some(id) = self.link_for_route(route_id) {
            self.close_link(id);
        }
    }

    /// Close a link. Its routes are unbound once its reader notices.
    pub fn close_link(&self, id: LinkId) {
        if let Some(link) = self.state().links.get(&id) {
            link.closer.close();
        }
    }

    /// Periodically drop swap entries nobody redeemed. The task ends once the
    /// router is dropped.
    pub fn spawn_token_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<RouterInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let swept = inner.token_store.sweep_expired();
                if swept > 0 {
                    debug!("Swept {} expired swap tokens", swept);
                }
            }
        })
    }

    /// Close every link.
    pub fn shutdown(&self) {
        let closers: Vec<LinkCloser> = self
            .state()
            .links
            .values()
            .map(|link| link.closer.clone())
            .collect();
        info!("Router shutting down {} links", closers.len());
        for closer in closers {
            closer.close();
        }
    }

    async fn serve_link(self, id: LinkId, mut inbound: mpsc::Receiver<RpcMessage>) {
        while let Some(msg) = inbound.recv().await {
            self.handle_message(id, msg).await;
        }
        self.unregister_link(id).await;
    }

    async fn unregister_link(&self, id: LinkId) {
        let (entry, unbound, orphaned, cancels) = {
            let mut state = self.state();
            let Some(entry) = state.links.remove(&id) else {
                return;
            };

            let mut unbound = Vec::new();
            for route in &entry.routes {
                if state.routes.get(route) == Some(&id) {
                    state.routes.remove(route);
                    unbound.push(route.clone());
                }
            }

            let mut orphaned = Vec::new();
            let mut cancels = Vec::new();
            for (reqid, fwd) in std::mem::take(&mut state.forwards) {
                if fwd.egress == id {
                    if let Some(link) = state.links.get(&fwd.ingress) {
                        orphaned.push((reqid, link.outbound.clone()));
                    }
                } else if fwd.ingress == id {
                    if let Some(link) = state.links.get(&fwd.egress) {
                        cancels.push((reqid, link.outbound.clone()));
                    }
                } else {
                    state.forwards.insert(reqid, fwd);
                }
            }

            // Dropping the senders fails the router's own waiting calls.
            state.originated.retain(|_, pending| pending.link != id);
            if state.upstream == Some(id) {
                state.upstream = None;
            }
            (entry, unbound, orphaned, cancels)
        };

        entry.closer.close();
        if entry.kind == LinkKind::Untrusted {
            debug!("Link {} ({}) closed", id, entry.name);
        } else {
            info!("Link {} ({}) closed, unbound {:?}", id, entry.name, unbound);
        }

        for route in unbound {
            self.queue_announcement(Announcement::Unbind(route));
        }
        for (reqid, outbound) in cancels {
            let _ = outbound.try_send(RpcMessage::cancel(reqid, None));
        }
        let err = MeshError::transport(format!("link {} closed before responding", entry.name));
        for (reqid, outbound) in orphaned {
            let _ = outbound.send(RpcMessage::error_response(reqid, &err)).await;
        }
    }

    // ========================================
    // Route table
    // ========================================

    /// Bind `route_id` to `link`. With `replace` unset, a route already owned
    /// by another live link is a conflict.
    pub fn bind_route(&self, link: LinkId, route_id: &str, replace: bool) -> Result<()> {
        if route_id.is_empty() {
            return Err(MeshError::routing("cannot bind an empty route"));
        }
        {
            let mut state = self.state();
            if !state.links.contains_key(&link) {
                return Err(MeshError::routing(format!("no link {}", link)));
            }
            if let Some(&owner) = state.routes.get(route_id) {
                if owner != link {
                    if !replace && state.links.contains_key(&owner) {
                        return Err(MeshError::routing(format!(
                            "route {} already bound to link {}",
                            route_id, owner
                        )));
                    }
                    if let Some(previous) = state.links.get_mut(&owner) {
                        previous.routes.remove(route_id);
                    }
                }
            }
            state.routes.insert(route_id.to_string(), link);
            if let Some(entry) = state.links.get_mut(&link) {
                entry.routes.insert(route_id.to_string());
            }
        }
        info!("Bound route {} to link {}", route_id, link);
        self.inner.waiters.notify(route_id);
        self.queue_announcement(Announcement::Bind(route_id.to_string()));
        Ok(())
    }

    /// Unbind `route_id` if `link` still owns it. A stale unbind is a no-op.
    pub fn unbind_route(&self, link: LinkId, route_id: &str) -> bool {
        {
            let mut state = self.state();
            if state.routes.get(route_id) != Some(&link) {
                debug!("Ignoring stale unbind of {} by link {}", route_id, link);
                return false;
            }
            state.routes.remove(route_id);
            if let Some(entry) = state.links.get_mut(&link) {
                entry.routes.remove(route_id);
            }
        }
        info!("Unbound route {} from link {}", route_id, link);
        self.queue_announcement(Announcement::Unbind(route_id.to_string()));
        true
    }

    pub fn trust_link(&self, link: LinkId, kind: LinkKind) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .links
            .get_mut(&link)
            .ok_or_else(|| MeshError::routing(format!("no link {}", link)))?;
        if entry.kind != kind {
            debug!("Link {} trust {:?} -> {:?}", link, entry.kind, kind);
            entry.kind = kind;
        }
        Ok(())
    }

    /// Fail unless `link` is still untrusted. A link authenticates once.
    pub(crate) fn ensure_untrusted(&self, link: LinkId) -> Result<()> {
        match self.link_kind(link) {
            Some(LinkKind::Untrusted) => Ok(()),
            Some(_) => Err(MeshError::auth("link is already authenticated")),
            None => Err(MeshError::routing(format!("no link {}", link))),
        }
    }

    /// Promote an untrusted link and fix its identity: a leaf with its route,
    /// or a router when `route_id` is `None`. A leaf's route displaces any
    /// previous owner.
    pub(crate) fn authenticate_link(&self, link: LinkId, route_id: Option<&str>) -> Result<()> {
        {
            let mut state = self.state();
            let entry = state
                .links
                .get_mut(&link)
                .ok_or_else(|| MeshError::routing(format!("no link {}", link)))?;
            if entry.kind != LinkKind::Untrusted {
                return Err(MeshError::auth("link is already authenticated"));
            }
            entry.kind = match route_id {
                Some(_) => LinkKind::Leaf,
                None => LinkKind::Router,
            };
            entry.identity = route_id.map(str::to_string);
        }
        match route_id {
            Some(route_id) => {
                self.bind_route(link, route_id, true)?;
                info!("Link {} authenticated as {}", link, route_id);
            }
            None => info!("Link {} authenticated as router", link),
        }
        Ok(())
    }

    pub fn set_peer_info(&self, link: LinkId, peer_info: impl Into<String>) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .links
            .get_mut(&link)
            .ok_or_else(|| MeshError::routing(format!("no link {}", link)))?;
        entry.peer_info = Some(peer_info.into());
        Ok(())
    }

    pub fn link_for_route(&self, route_id: &str) -> Option<LinkId> {
        self.state().routes.get(route_id).copied()
    }

    pub fn link_kind(&self, link: LinkId) -> Option<LinkKind> {
        self.state().links.get(&link).map(|entry| entry.kind)
    }

    pub fn peer_info(&self, link: LinkId) -> Option<String> {
        self.state()
            .links
            .get(&link)
            .and_then(|entry| entry.peer_info.clone())
    }

    pub fn link_count(&self) -> usize {
        self.state().links.len()
    }

    /// Requests forwarded but not yet finally answered.
    pub fn in_flight(&self) -> usize {
        self.state().forwards.len()
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        let state = self.state();
        let mut links: Vec<LinkInfo> = state
            .links
            .iter()
            .map(|(id, entry)| LinkInfo {
                id: *id,
                kind: entry.kind,
                name: entry.name.clone(),
                peer_info: entry.peer_info.clone(),
                routes: entry.routes.iter().cloned().collect(),
            })
            .collect();
        links.sort_by_key(|link| link.id);
        RouterSnapshot {
            is_root: self.is_root(),
            links,
            routes: state.routes.iter().map(|(r, l)| (r.clone(), *l)).collect(),
            in_flight: state.forwards.len(),
            upstream: state.upstream,
        }
    }

    /// Wait until `route_id` is bound or `timeout` passes.
    pub async fn wait_for_register(&self, route_id: &str, timeout: Duration) -> bool {
        self.inner
            .waiters
            .wait_until(route_id, timeout, || {
                self.state().routes.contains_key(route_id)
            })
            .await
    }

    /// Decide where a message goes.
    pub fn route(&self, msg: &RpcMessage) -> RouteDecision {
        self.resolve(msg.route.as_deref().unwrap_or(""))
    }

    /// Decide where a route goes. An empty route means the default route.
    pub fn resolve(&self, route_id: &str) -> RouteDecision {
        if route_id == CONTROL_ROUTE || (self.is_root() && route_id == CONTROL_ROOT_ROUTE) {
            return RouteDecision::Local;
        }
        let target = if route_id.is_empty() {
            self.default_route()
        } else {
            route_id
        };
        let state = self.state();
        if let Some(&link) = state.routes.get(target) {
            return RouteDecision::Forward(link);
        }
        match state.upstream {
            Some(upstream) if !self.is_root() => RouteDecision::Escalate(upstream),
            _ => RouteDecision::NotFound,
        }
    }

    // ========================================
    // Message handling
    // ========================================

    async fn handle_message(&self, ingress: LinkId, msg: RpcMessage) {
        match msg.kind() {
            Ok(MessageKind::Request) => self.handle_request(ingress, msg).await,
            Ok(MessageKind::Response) => self.handle_response(ingress, msg).await,
            Ok(MessageKind::Cancel) => self.handle_cancel(ingress, msg),
            Err(e) => {
                warn!("Closing link {}: {}", ingress, e);
                self.close_link(ingress);
            }
        }
    }

    async fn handle_request(&self, ingress: LinkId, mut msg: RpcMessage) {
        let command = msg.command.clone().unwrap_or_default();
        let (kind, identity) = {
            let state = self.state();
            let Some(link) = state.links.get(&ingress) else {
                return;
            };
            (link.kind, link.identity.clone())
        };

        let decision = self.route(&msg);
        match kind {
            LinkKind::Untrusted => {
                if !command::allowed_untrusted(&command) || decision != RouteDecision::Local {
                    warn!("Rejected {} from unauthenticated link {}", command, ingress);
                    let err = MeshError::auth(format!(
                        "link not authenticated, cannot send {}",
                        command
                    ));
                    self.reply_error(ingress, &msg, err).await;
                    return;
                }
                msg.source = None;
            }
            LinkKind::Leaf => msg.source = identity,
            LinkKind::Router => {}
        }

        match decision {
            RouteDecision::Local => self.spawn_control(ingress, msg),
            RouteDecision::Forward(egress) | RouteDecision::Escalate(egress) if egress == ingress => {
                let err = MeshError::routing(format!(
                    "routing loop for {}",
                    msg.route.as_deref().unwrap_or(self.default_route())
                ));
                self.reply_error(ingress, &msg, err).await;
            }
            RouteDecision::Forward(egress) | RouteDecision::Escalate(egress) => {
                self.forward(ingress, egress, msg).await
            }
            RouteDecision::NotFound => {
                let err = MeshError::routing(format!(
                    "route not found: {}",
                    msg.route.as_deref().unwrap_or(self.default_route())
                ));
                self.reply_error(ingress, &msg, err).await;
            }
        }
    }

    async fn forward(&self, ingress: LinkId, egress: LinkId, msg: RpcMessage) {
        let reqid = msg.reqid.clone();
        let outbound = {
            let mut state = self.state();
            let outbound = state.links.get(&egress).map(|link| link.outbound.clone());
            match (&outbound, &reqid) {
                (Some(_), Some(reqid)) if state.forwards.contains_key(reqid) => Err(
                    MeshError::protocol(format!("duplicate reqid {}", reqid)),
                ),
                (Some(outbound), Some(reqid)) => {
                    state
                        .forwards
                        .insert(reqid.clone(), ForwardEntry { ingress, egress });
                    Ok(outbound.clone())
                }
                (Some(outbound), None) => Ok(outbound.clone()),
                (None, _) => Err(MeshError::transport(format!("link {} is gone", egress))),
            }
        };

        let outbound = match outbound {
            Ok(outbound) => outbound,
            Err(err) => {
                self.reply_error(ingress, &msg, err).await;
                return;
            }
        };

        if let (Some(reqid), Some(timeout_ms)) = (&reqid, msg.timeout) {
            self.expire_forward_after(
                reqid.clone(),
                ForwardEntry { ingress, egress },
                Duration::from_millis(timeout_ms),
            );
        }

        let fallback = msg.clone();
        if outbound.send(msg).await.is_err() {
            // The link may already have failed this request on its way out.
            let still_pending = reqid
                .as_ref()
                .map(|reqid| self.state().forwards.remove(reqid).is_some())
                .unwrap_or(false);
            if still_pending {
                let err = MeshError::transport(format!("link {} closed", egress));
                self.reply_error(ingress, &fallback, err).await;
            }
        }
    }

    /// Drop a forwarding entry once the caller's own deadline has passed,
    /// in case its cancel never arrives. The callee is told to stop.
    fn expire_forward_after(&self, reqid: String, fwd: ForwardEntry, timeout: Duration) {
        let weak: Weak<RouterInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let router = Router { inner };
            let outbound = {
                let mut state = router.state();
                match state.forwards.get(&reqid) {
                    Some(entry) if entry.ingress == fwd.ingress && entry.egress == fwd.egress => {
                        state.forwards.remove(&reqid);
                        state.links.get(&fwd.egress).map(|link| link.outbound.clone())
                    }
                    _ => return,
                }
            };
            debug!("Forward {} expired unanswered", reqid);
            if let Some(outbound) = outbound {
                let _ = outbound.try_send(RpcMessage::cancel(reqid, None));
            }
        });
    }

    async fn handle_response(&self, ingress: LinkId, msg: RpcMessage) {
        let Some(resid) = msg.resid.clone() else {
            return;
        };
        let target = {
            let mut state = self.state();
            match state.forwards.get(&resid).copied() {
                Some(fwd) if fwd.egress == ingress => {
                    if msg.is_final() {
                        state.forwards.remove(&resid);
                    }
                    state
                        .links
                        .get(&fwd.ingress)
                        .map_or(ResponseTarget::Drop, |link| {
                            ResponseTarget::Link(link.outbound.clone())
                        })
                }
                Some(_) => {
                    warn!("Link {} answered request {} it was never sent", ingress, resid);
                    ResponseTarget::Drop
                }
                None => {
                    let ours = msg.is_final()
                        && state
                            .originated
                            .get(&resid)
                            .is_some_and(|pending| pending.link == ingress);
                    match state.originated.remove(&resid) {
                        Some(pending) if ours => ResponseTarget::Originated(pending.tx),
                        Some(pending) => {
                            state.originated.insert(resid.clone(), pending);
                            ResponseTarget::Drop
                        }
                        None => ResponseTarget::Drop,
                    }
                }
            }
        };

        match target {
            ResponseTarget::Link(outbound) => {
                let _ = outbound.send(msg).await;
            }
            ResponseTarget::Originated(tx) => {
                let _ = tx.send(msg);
            }
            ResponseTarget::Drop => {
                debug!("Dropping response {} from link {}", resid, ingress);
            }
        }
    }

    fn handle_cancel(&self, ingress: LinkId, msg: RpcMessage) {
        let Some(reqid) = msg.reqid.clone() else {
            return;
        };
        let outbound = {
            let mut state = self.state();
            match state.forwards.get(&reqid).copied() {
                Some(fwd) if fwd.ingress == ingress => {
                    state.forwards.remove(&reqid);
                    state.links.get(&fwd.egress).map(|link| link.outbound.clone())
                }
                _ => None,
            }
        };
        if let Some(outbound) = outbound {
            debug!("Forwarding cancel for {}", reqid);
            let _ = outbound.try_send(msg);
        }
    }

    fn spawn_control(&self, ingress: LinkId, msg: RpcMessage) {
        let router = self.clone();
        tokio::spawn(async move {
            let result = control::handle_control(&router, ingress, &msg).await;
            if let Err(e) = &result {
                debug!(
                    "Control {} from link {} failed: {}",
                    msg.command.as_deref().unwrap_or_default(),
                    ingress,
                    e
                );
            }
            if let Some(reqid) = msg.reqid {
                router
                    .send_to_link(ingress, RpcMessage::from_result(reqid, result))
                    .await;
            }
        });
    }

    async fn reply_error(&self, link: LinkId, request: &RpcMessage, err: MeshError) {
        match &request.reqid {
            Some(reqid) => {
                self.send_to_link(link, RpcMessage::error_response(reqid.clone(), &err))
                    .await
            }
            None => debug!("Dropping no-response request: {}", err),
        }
    }

    async fn send_to_link(&self, link: LinkId, msg: RpcMessage) {
        let outbound = self
            .state()
            .links
            .get(&link)
            .map(|entry| entry.outbound.clone());
        if let Some(outbound) = outbound {
            let _ = outbound.send(msg).await;
        }
    }

    // ========================================
    // Router-originated calls and the upstream link
    // ========================================

    /// Send a request on a specific link and wait for its response.
    pub async fn call_link(
        &self,
        link: LinkId,
        command: &str,
        data: Option<Value>,
        route_id: &str,
        source: Option<String>,
        timeout: Duration,
    ) -> Result<Value> {
        let reqid = new_request_id();
        let (tx, rx) = oneshot::channel();
        let outbound = {
            let mut state = self.state();
            let outbound = state
                .links
                .get(&link)
                .map(|entry| entry.outbound.clone())
                .ok_or_else(|| MeshError::transport(format!("link {} is gone", link)))?;
            state
                .originated
                .insert(reqid.clone(), Originated { link, tx });
            outbound
        };

        let mut msg = RpcMessage::request(
            command,
            data,
            Some(reqid.clone()),
            Some(route_id.to_string()),
            Some(timeout),
        );
        msg.source = source;

        let exchange = async {
            outbound
                .send(msg)
                .await
                .map_err(|_| MeshError::transport(format!("link {} closed", link)))?;
            rx.await
                .map_err(|_| MeshError::transport(format!("link {} closed before responding", link)))?
                .into_result()
        };
        let result = tokio::time::timeout(timeout, exchange).await;
        self.state().originated.remove(&reqid);
        match result {
            Ok(result) => result,
            Err(_) => Err(MeshError::timeout(format!(
                "{} on link {} did not complete within {}ms",
                command,
                link,
                timeout.as_millis()
            ))),
        }
    }

    /// Send a request resolved through the route table.
    pub async fn call_route(
        &self,
        route_id: &str,
        command: &str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        match self.resolve(route_id) {
            RouteDecision::Forward(link) | RouteDecision::Escalate(link) => {
                self.call_link(link, command, data, route_id, None, timeout)
                    .await
            }
            RouteDecision::Local => Err(MeshError::routing(format!(
                "{} is handled by this router",
                route_id
            ))),
            RouteDecision::NotFound => Err(MeshError::routing(format!(
                "route not found: {}",
                route_id
            ))),
        }
    }

    /// Attach this sub-router to its parent, authenticate with a router
    /// token, and announce every route bound here.
    pub async fn connect_upstream(&self, transport: Transport, jwt: &str) -> Result<LinkId> {
        if self.is_root() {
            return Err(MeshError::config("the root router has no upstream"));
        }
        let peer = transport.peer.clone();
        let link = self.register_link(transport, LinkKind::Router);
        self.state().upstream = Some(link);

        let auth = self
            .call_link(
                link,
                command::AUTHENTICATE,
                Some(Value::String(jwt.to_string())),
                CONTROL_ROUTE,
                None,
                RouterConfig::CONTROL_CALL_TIMEOUT,
            )
            .await;
        if let Err(e) = auth {
            warn!("Upstream {} rejected authentication: {}", peer, e);
            self.close_link(link);
            return Err(e);
        }

        self.ensure_announcer();
        let routes: Vec<String> = self.state().routes.keys().cloned().collect();
        info!(
            "Connected upstream {} as link {}, announcing {} routes",
            peer,
            link,
            routes.len()
        );
        for route in routes {
            self.queue_announcement(Announcement::Bind(route));
        }
        Ok(link)
    }

    pub fn upstream(&self) -> Option<LinkId> {
        self.state().upstream
    }

    fn queue_announcement(&self, announcement: Announcement) {
        if self.is_root() {
            return;
        }
        if let Some(tx) = lock(&self.inner.announcer).as_ref() {
            let _ = tx.send(announcement);
        }
    }

    fn ensure_announcer(&self) {
        let mut slot = lock(&self.inner.announcer);
        if slot.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        let weak: Weak<RouterInner> = Arc::downgrade(&self.inner);
        // One task so announcements for a route reach the parent in order.
        tokio::spawn(async move {
            while let Some(announcement) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Router { inner }.send_announcement(announcement).await;
            }
        });
    }

    async fn send_announcement(&self, announcement: Announcement) {
        let Some(upstream) = self.upstream() else {
            return;
        };
        let (command, route_id) = match &announcement {
            Announcement::Bind(route) => (command::ROUTE_ANNOUNCE, route),
            Announcement::Unbind(route) => (command::ROUTE_UNANNOUNCE, route),
        };
        let result = self
            .call_link(
                upstream,
                command,
                None,
                CONTROL_ROUTE,
                Some(route_id.clone()),
                RouterConfig::CONTROL_CALL_TIMEOUT,
            )
            .await;
        if let Err(e) = result {
            warn!("Upstream {} of {} failed: {}", command, route_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenSwapEntry;
    use crate::protocol::RpcContext;
    use crate::transport::pipe;

    fn root() -> Router {
        Router::builder().build().unwrap()
    }

    /// A raw peer: the far end of a link registered with the router.
    fn attach(router: &Router, kind: LinkKind) -> (LinkId, Transport) {
        let (near, far) = pipe("router-side", "peer");
        (router.register_link(near, kind), far)
    }

    fn attach_leaf(router: &Router, route_id: &str) -> (LinkId, Transport) {
        let (near, far) = pipe("router-side", route_id);
        (router.register_trusted_leaf(near, route_id).unwrap(), far)
    }

    #[tokio::test]
    async fn test_bind_conflict_and_replace() {
        let router = root();
        let (a, _pa) = attach(&router, LinkKind::Leaf);
        let (b, _pb) = attach(&router, LinkKind::Leaf);

        router.bind_route(a, "proc:1", false).unwrap();
        assert!(matches!(
            router.bind_route(b, "proc:1", false),
            Err(MeshError::Routing { .. })
        ));
        assert_eq!(router.link_for_route("proc:1"), Some(a));

        router.bind_route(b, "proc:1", true).unwrap();
        assert_eq!(router.link_for_route("proc:1"), Some(b));
        assert!(router.snapshot().links[0].routes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_sweeper_drops_unredeemed_entries() {
        let router = root();
        let sweeper = router.spawn_token_sweeper(Duration::from_secs(60));
        let entry =
            TokenSwapEntry::new(RpcContext::leaf("proc:late")).with_expiry(Duration::from_secs(30));
        router.token_store().add(entry).unwrap();
        assert_eq!(router.token_store().len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(router.token_store().is_empty());

        drop(router);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test]
    async fn test_stale_unbind_is_noop() {
        let router = root();
        let (a, _pa) = attach(&router, LinkKind::Leaf);
        let (b, _pb) = attach(&router, LinkKind::Leaf);

        router.bind_route(a, "proc:1", false).unwrap();
        router.bind_route(b, "proc:1", true).unwrap();
        assert!(!router.unbind_route(a, "proc:1"));
        assert_eq!(router.link_for_route("proc:1"), Some(b));
        assert!(router.unbind_route(b, "proc:1"));
        assert_eq!(router.link_for_route("proc:1"), None);
    }

    #[tokio::test]
    async fn test_route_decisions() {
        let router = root();
        let (a, _pa) = attach(&router, LinkKind::Leaf);
        let (s, _ps) = attach(&router, LinkKind::Leaf);
        router.bind_route(a, "proc:1", false).unwrap();
        router.bind_route(s, "server", false).unwrap();

        assert_eq!(router.resolve("$control"), RouteDecision::Local);
        assert_eq!(router.resolve("$control:root"), RouteDecision::Local);
        assert_eq!(router.resolve("proc:1"), RouteDecision::Forward(a));
        assert_eq!(router.resolve(""), RouteDecision::Forward(s));
        assert_eq!(router.resolve("proc:2"), RouteDecision::NotFound);
    }

    #[tokio::test]
    async fn test_sub_router_escalates_unknown_routes() {
        let sub = Router::builder().sub_router().build().unwrap();
        assert_eq!(sub.resolve("proc:2"), RouteDecision::NotFound);
        let (up, _peer) = attach(&sub, LinkKind::Router);
        sub.state().upstream = Some(up);
        assert_eq!(sub.resolve("proc:2"), RouteDecision::Escalate(up));
        assert_eq!(sub.resolve("$control:root"), RouteDecision::Escalate(up));
        assert_eq!(sub.resolve("$control"), RouteDecision::Local);
    }

    #[tokio::test]
    async fn test_untrusted_link_cannot_send_business_commands() {
        let router = root();
        let (a, mut pa) = attach(&router, LinkKind::Leaf);
        router.bind_route(a, "proc:1", false).unwrap();
        let (_u, mut pu) = attach(&router, LinkKind::Untrusted);

        let req = RpcMessage::request("ping", None, Some("r1".into()), Some("proc:1".into()), None);
        pu.outbound.send(req).await.unwrap();

        let resp = pu.inbound.recv().await.unwrap();
        assert_eq!(resp.resid.as_deref(), Some("r1"));
        assert!(matches!(
            resp.into_result(),
            Err(MeshError::Authentication { .. })
        ));
        assert!(pa.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forward_stamps_leaf_source_and_returns_response() {
        let router = root();
        let (a, mut pa) = attach_leaf(&router, "proc:a");
        let (_b, mut pb) = attach_leaf(&router, "proc:b");
        // Extra routes never change who the leaf is.
        router.bind_route(a, "a:extra", false).unwrap();

        let mut req = RpcMessage::request("hello", None, Some("r1".into()), Some("proc:b".into()), None);
        req.source = Some("spoofed".into());
        pa.outbound.send(req).await.unwrap();

        let delivered = pb.inbound.recv().await.unwrap();
        assert_eq!(delivered.source.as_deref(), Some("proc:a"));
        assert_eq!(router.in_flight(), 1);

        pb.outbound
            .send(RpcMessage::response("r1", Some(Value::from(7)), false))
            .await
            .unwrap();
        let resp = pa.inbound.recv().await.unwrap();
        assert_eq!(resp.into_result().unwrap(), Value::from(7));
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_route_fails_immediately() {
        let router = root();
        let (_a, mut pa) = attach(&router, LinkKind::Leaf);
        let req = RpcMessage::request("x", None, Some("r1".into()), Some("proc:nope".into()), None);
        pa.outbound.send(req).await.unwrap();
        let err = pa.inbound.recv().await.unwrap().into_result().unwrap_err();
        assert_eq!(err.to_string(), "Routing error: route not found: proc:nope");
    }

    #[tokio::test]
    async fn test_egress_death_fails_forwarded_request() {
        let router = root();
        let (a, mut pa) = attach(&router, LinkKind::Leaf);
        let (b, mut pb) = attach(&router, LinkKind::Leaf);
        router.bind_route(a, "proc:a", false).unwrap();
        router.bind_route(b, "proc:b", false).unwrap();

        let req = RpcMessage::request("slow", None, Some("r1".into()), Some("proc:b".into()), None);
        pa.outbound.send(req).await.unwrap();
        pb.inbound.recv().await.unwrap();
        pb.closer.close();

        let err = pa.inbound.recv().await.unwrap().into_result().unwrap_err();
        assert!(matches!(err, MeshError::Transport { .. }));
        assert_eq!(router.in_flight(), 0);
        assert_eq!(router.link_for_route("proc:b"), None);
    }

    #[tokio::test]
    async fn test_cancel_follows_forwarding_entry() {
        let router = root();
        let (a, mut pa) = attach(&router, LinkKind::Leaf);
        let (b, mut pb) = attach(&router, LinkKind::Leaf);
        router.bind_route(a, "proc:a", false).unwrap();
        router.bind_route(b, "proc:b", false).unwrap();

        let req = RpcMessage::request("slow", None, Some("r1".into()), Some("proc:b".into()), None);
        pa.outbound.send(req).await.unwrap();
        pb.inbound.recv().await.unwrap();

        pa.outbound
            .send(RpcMessage::cancel("r1", Some("proc:b".into())))
            .await
            .unwrap();
        let cancel = pb.inbound.recv().await.unwrap();
        assert!(cancel.cancel);
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_forward_expires_after_deadline() {
        let router = root();
        let (_a, mut pa) = attach_leaf(&router, "proc:a");
        let (_b, mut pb) = attach_leaf(&router, "proc:b");

        let req = RpcMessage::request(
            "hang",
            None,
            Some("r1".into()),
            Some("proc:b".into()),
            Some(Duration::from_millis(100)),
        );
        pa.outbound.send(req).await.unwrap();
        pb.inbound.recv().await.unwrap();
        assert_eq!(router.in_flight(), 1);

        // The caller never sends a cancel and the callee never answers.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(router.in_flight(), 0);
        let cancel = pb.inbound.recv().await.unwrap();
        assert!(cancel.cancel);
        assert_eq!(cancel.reqid.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_trusting_a_link_lifts_the_firewall() {
        let router = root();
        let (_a, mut pa) = attach_leaf(&router, "proc:a");
        let (u, mut pu) = attach(&router, LinkKind::Untrusted);

        router.trust_link(u, LinkKind::Router).unwrap();
        assert_eq!(router.link_kind(u), Some(LinkKind::Router));

        let mut req = RpcMessage::request("ping", None, Some("r1".into()), Some("proc:a".into()), None);
        req.source = Some("proc:child".into());
        pu.outbound.send(req).await.unwrap();
        let delivered = pa.inbound.recv().await.unwrap();
        assert_eq!(delivered.source.as_deref(), Some("proc:child"));
        assert!(router.trust_link(999, LinkKind::Leaf).is_err());
    }

    #[tokio::test]
    async fn test_link_authenticates_once() {
        let router = root();
        let (u, _pu) = attach(&router, LinkKind::Untrusted);
        router.authenticate_link(u, Some("proc:a")).unwrap();
        assert_eq!(router.link_kind(u), Some(LinkKind::Leaf));

        assert!(matches!(
            router.authenticate_link(u, None),
            Err(MeshError::Authentication { .. })
        ));
        assert!(router.ensure_untrusted(u).is_err());
        assert_eq!(router.link_kind(u), Some(LinkKind::Leaf));
        assert_eq!(router.link_for_route("proc:a"), Some(u));
    }

    #[tokio::test]
    async fn test_wait_for_register_sees_later_bind() {
        let router = root();
        let (a, _pa) = attach(&router, LinkKind::Leaf);
        let waiter = tokio::spawn({
            let router = router.clone();
            async move { router.wait_for_register("proc:late", Duration::from_secs(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.bind_route(a, "proc:late", false).unwrap();
        assert!(waiter.await.unwrap());
    }
}
