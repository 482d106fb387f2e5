//! The subscription multiplexer.
//!
//! Coalesces any number of logical subscribers onto at most one upstream
//! subscription per descriptor. The first subscriber for a descriptor opens
//! the upstream session (dial + one subscribe call); later subscribers just
//! join its token list. The last token to leave removes the entry and
//! destroys the upstream session.
//!
//! One exclusive lock covers the whole descriptor map. Subscribe holds it
//! across the upstream round trip, so all membership mutations are fully
//! serialized, even for unrelated descriptors. Coarse, but it makes the
//! reference-counting trivially consistent.

use crate::{
    channel::{ChannelConnector, RequestHandler, RpcChannel},
    error::SubscribeError,
    id::fresh_id,
    responder::Responder,
    types::Request,
};
use async_trait::async_trait;
use core::fmt;
use serde_json::value::RawValue;
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};
use tokio::{select, sync::RwLock};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, info_span, Span};

/// Pure function deriving the sharing key from subscription parameters.
///
/// Two parameter sets that should share one upstream subscription must map
/// to the same descriptor.
pub type DescriptorFn = Arc<dyn Fn(&RawValue) -> String + Send + Sync>;

/// Receiver for upstream-pushed notifications.
///
/// The multiplexer forwards every backend-pushed request here together with
/// a freshly minted per-delivery id, then acknowledges the push upstream
/// regardless of what the sink does with it. Fanning the payload out to
/// whichever client connections still hold subscriber tokens is the sink's
/// concern.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Receive one upstream push.
    async fn notify(&self, request: Request, delivery_id: &str);
}

/// Configuration for a [`SubscriptionMux`].
pub struct MuxConfig {
    /// Dispatch each upstream push on its own task.
    pub async_dispatch: bool,
    /// Dials new upstream connections.
    pub connector: Arc<dyn ChannelConnector>,
    /// Upstream method name called once per descriptor to subscribe.
    pub subscribe_method: String,
    /// Derives the descriptor from subscription parameters.
    pub descriptor: DescriptorFn,
    /// Receives upstream pushes.
    pub notifications: Arc<dyn NotificationSink>,
}

impl fmt::Debug for MuxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxConfig")
            .field("async_dispatch", &self.async_dispatch)
            .field("subscribe_method", &self.subscribe_method)
            .finish_non_exhaustive()
    }
}

struct MuxEntry {
    session: Arc<UpstreamSession>,
    tokens: Vec<String>,
}

/// Maps descriptors to their single live upstream session and its
/// subscriber tokens.
pub struct SubscriptionMux {
    config: MuxConfig,
    entries: RwLock<HashMap<String, MuxEntry>>,
    span: Span,
}

impl SubscriptionMux {
    /// Create a multiplexer with no live subscriptions.
    pub fn new(config: MuxConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            span: info_span!("mux"),
        }
    }

    /// Subscribe with `params`.
    ///
    /// Returns the derived descriptor and a fresh unsubscribe token. The
    /// first subscriber for a descriptor pays for opening the upstream
    /// session; if the dial or the upstream subscribe call fails, nothing
    /// is registered and the error is returned.
    pub async fn subscribe(
        &self,
        params: Box<RawValue>,
    ) -> Result<(String, String), SubscribeError> {
        let descriptor = (self.config.descriptor)(&params);
        let mut entries = self.entries.write().await;

        let entry = match entries.entry(descriptor.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let session =
                    UpstreamSession::open(&self.config, descriptor.clone(), params).await?;
                vacant.insert(MuxEntry {
                    session,
                    tokens: Vec::new(),
                })
            }
        };

        let token = fresh_id();
        entry.tokens.push(token.clone());
        info!(
            parent: &self.span,
            %descriptor,
            subscribers = entry.tokens.len(),
            "subscriber added"
        );
        Ok((descriptor, token))
    }

    /// Remove `token` from `descriptor`'s subscriber list.
    ///
    /// Unknown descriptors and tokens are silent no-ops. Removing the last
    /// token removes the entry and destroys the upstream session.
    pub async fn unsubscribe(&self, descriptor: &str, token: &str) {
        let mut entries = self.entries.write().await;
        self.release(&mut entries, descriptor, token).await;
    }

    /// Remove `token` from every live descriptor, in one pass under the
    /// lock. Used when a client connection terminates and must release all
    /// of its memberships.
    pub async fn unsubscribe_all(&self, token: &str) {
        let mut entries = self.entries.write().await;
        let descriptors: Vec<String> = entries.keys().cloned().collect();
        for descriptor in descriptors {
            self.release(&mut entries, &descriptor, token).await;
        }
    }

    /// Snapshot of the current subscriber tokens for `descriptor`; empty
    /// when the descriptor has no live session.
    pub async fn subscribers(&self, descriptor: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .get(descriptor)
            .map(|entry| entry.tokens.clone())
            .unwrap_or_default()
    }

    async fn release(&self, entries: &mut HashMap<String, MuxEntry>, descriptor: &str, token: &str) {
        let Some(entry) = entries.get_mut(descriptor) else {
            return;
        };
        entry.tokens.retain(|t| t != token);
        debug!(
            parent: &self.span,
            %descriptor,
            subscribers = entry.tokens.len(),
            "subscriber removed"
        );
        if entry.tokens.is_empty() {
            info!(parent: &self.span, %descriptor, "last subscriber left; destroying upstream session");
            if let Some(entry) = entries.remove(descriptor) {
                entry.session.destroy().await;
            }
        }
    }
}

impl fmt::Debug for SubscriptionMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionMux").finish_non_exhaustive()
    }
}

/// The single live upstream channel serving one descriptor.
///
/// Exists exactly while its descriptor has subscribers, with one
/// deliberate exception: when the upstream side disconnects, the session
/// destroys itself but stays in the multiplexer's map until the next
/// membership operation touches its descriptor. Lookups finding such an
/// entry see a dead session. Deliberate; see DESIGN.md before "fixing" it.
pub struct UpstreamSession {
    descriptor: String,
    async_dispatch: bool,
    notifications: Arc<dyn NotificationSink>,
    channel: OnceLock<Arc<dyn RpcChannel>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    destroyed: AtomicBool,
    span: Span,
}

impl UpstreamSession {
    /// Dial the backend, register the session as the channel's request
    /// handler, and issue the one upstream subscribe call for this
    /// descriptor. Any failure tears the partial session down and nothing
    /// is registered.
    async fn open(
        config: &MuxConfig,
        descriptor: String,
        params: Box<RawValue>,
    ) -> Result<Arc<Self>, SubscribeError> {
        let span = info_span!("upstream", descriptor = %descriptor);
        let session = Arc::new(Self {
            descriptor,
            async_dispatch: config.async_dispatch,
            notifications: Arc::clone(&config.notifications),
            channel: OnceLock::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            destroyed: AtomicBool::new(false),
            span,
        });

        let handler: Arc<dyn RequestHandler> = Arc::clone(&session) as _;
        let channel = config
            .connector
            .connect(handler)
            .await
            .map_err(SubscribeError::Connect)?;
        let _ = session.channel.set(Arc::clone(&channel));

        debug!(parent: &session.span, method = %config.subscribe_method, "issuing upstream subscribe call");
        if let Err(err) = channel.call(&config.subscribe_method, params).await {
            session.destroy().await;
            return Err(SubscribeError::Call(err));
        }

        // Watch for upstream disconnect or cancellation; either destroys
        // the session in place.
        let watcher = Arc::clone(&session);
        session.tasks.spawn(async move {
            select! {
                _ = watcher.cancel.cancelled() => {}
                _ = channel.closed() => {
                    debug!(parent: &watcher.span, "upstream channel disconnected");
                }
            }
            watcher.destroy().await;
        });

        Ok(session)
    }

    /// The descriptor this session serves.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Whether this session has been destroyed (upstream disconnect or
    /// last-subscriber release).
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Cancel the session's context and close the upstream channel.
    /// Idempotent; errors are logged and swallowed.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(parent: &self.span, "destroying upstream session");
        self.cancel.cancel();
        if let Some(channel) = self.channel.get() {
            if let Err(err) = channel.close().await {
                debug!(parent: &self.span, %err, "error closing upstream channel");
            }
        }
        info!(parent: &self.span, "upstream session destroyed");
    }

    /// Forward one upstream push to the notification sink, then
    /// acknowledge it upstream.
    async fn deliver(&self, channel: Arc<dyn RpcChannel>, request: Request) {
        let delivery_id = fresh_id();
        let responder = Responder::new(channel, request.clone(), delivery_id.clone());
        self.notifications.notify(request, &delivery_id).await;
        if let Err(err) = responder.reply("ok").await {
            debug!(parent: &self.span, %err, "failed to acknowledge upstream push");
        }
        responder.finalize().await;
    }
}

#[async_trait]
impl RequestHandler for UpstreamSession {
    async fn handle_request(self: Arc<Self>, channel: Arc<dyn RpcChannel>, request: Request) {
        if self.async_dispatch {
            let session = Arc::clone(&self);
            self.tasks.spawn(async move {
                session.deliver(channel, request).await;
            });
        } else {
            self.deliver(channel, request).await;
        }
    }
}

impl fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("descriptor", &self.descriptor)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
