#![allow(dead_code)]

//! Shared test support: in-memory channel mocks standing in for the wire
//! codec collaborator, plus a minimal recording application.

pub mod codec;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use submux::{
    async_trait, AppSession, ChannelConnector, ChannelError, ChannelFactory, ErrorPayload,
    RawValue, Request, RequestHandler, RpcChannel, RpcContext, SessionError, SessionFactory,
    SessionHandle,
};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Build a raw JSON value from a literal.
pub fn raw(json: &str) -> Box<RawValue> {
    RawValue::from_string(json.to_owned()).unwrap()
}

/// Build an inbound request with a numeric id.
pub fn request(id: u64, method: &str, params: &str) -> Request {
    Request {
        id: raw(&id.to_string()),
        method: method.to_owned(),
        params: raw(params),
    }
}

/// In-memory [`RpcChannel`] that records everything sent through it.
pub struct MockChannel {
    calls: Mutex<Vec<(String, String)>>,
    results: Mutex<Vec<(String, String)>>,
    errors: Mutex<Vec<(String, ErrorPayload)>>,
    fail_calls: AtomicBool,
    closes: AtomicUsize,
    closed: CancellationToken,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            fail_calls: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        })
    }

    /// Make every subsequent outbound call fail.
    pub fn fail_calls(&self) {
        self.fail_calls.store(true, Ordering::SeqCst);
    }

    /// Simulate a peer disconnect.
    pub fn trigger_disconnect(&self) {
        self.closed.cancel();
    }

    /// How many times `close` has been invoked.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn recorded_calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn recorded_results(&self) -> Vec<(String, String)> {
        self.results.lock().unwrap().clone()
    }

    pub fn recorded_errors(&self) -> Vec<(String, ErrorPayload)> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcChannel for MockChannel {
    async fn call(
        &self,
        method: &str,
        params: Box<RawValue>,
    ) -> Result<Box<RawValue>, ChannelError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_owned(), params.get().to_owned()));
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        Ok(raw("\"ok\""))
    }

    async fn reply(&self, id: &RawValue, result: Box<RawValue>) -> Result<(), ChannelError> {
        self.results
            .lock()
            .unwrap()
            .push((id.get().to_owned(), result.get().to_owned()));
        Ok(())
    }

    async fn reply_error(&self, id: &RawValue, error: ErrorPayload) -> Result<(), ChannelError> {
        self.errors
            .lock()
            .unwrap()
            .push((id.get().to_owned(), error));
        Ok(())
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

/// [`ChannelFactory`] handing out [`MockChannel`]s and retaining the
/// registered handlers so tests can inject inbound requests.
pub struct MockBindFactory {
    bound: Mutex<Vec<(Arc<MockChannel>, Arc<dyn RequestHandler>)>>,
}

impl MockBindFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bound: Mutex::new(Vec::new()),
        })
    }

    /// Wait for the next channel to be bound.
    pub async fn wait_bound(&self) -> (Arc<MockChannel>, Arc<dyn RequestHandler>) {
        for _ in 0..200 {
            if let Some((channel, handler)) = self.bound.lock().unwrap().last() {
                return (Arc::clone(channel), Arc::clone(handler));
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("no channel was bound");
    }
}

impl ChannelFactory for MockBindFactory {
    fn bind(
        &self,
        _io: submux::BoxedIo,
        handler: Arc<dyn RequestHandler>,
    ) -> Arc<dyn RpcChannel> {
        let channel = MockChannel::new();
        self.bound
            .lock()
            .unwrap()
            .push((Arc::clone(&channel), handler));
        channel
    }
}

/// [`ChannelConnector`] handing out [`MockChannel`]s, with switchable
/// failure modes for the dial and the first call.
pub struct MockConnector {
    connects: AtomicUsize,
    fail_connect: AtomicBool,
    fail_calls: AtomicBool,
    channels: Mutex<Vec<(Arc<MockChannel>, Arc<dyn RequestHandler>)>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            fail_calls: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Refuse subsequent dials.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Hand out channels whose outbound calls fail.
    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    /// The `index`-th upstream channel and its registered handler.
    pub fn channel(&self, index: usize) -> (Arc<MockChannel>, Arc<dyn RequestHandler>) {
        let channels = self.channels.lock().unwrap();
        let (channel, handler) = &channels[index];
        (Arc::clone(channel), Arc::clone(handler))
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(
        &self,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn RpcChannel>, ChannelError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let channel = MockChannel::new();
        if self.fail_calls.load(Ordering::SeqCst) {
            channel.fail_calls();
        }
        self.channels
            .lock()
            .unwrap()
            .push((Arc::clone(&channel), handler));
        Ok(channel)
    }
}

/// Minimal application: answers `ping`, adds `add` params, errors on
/// `fail`, and stays silent on anything else so the responder backstop is
/// exercised.
pub struct TestApp {
    destroys: Arc<AtomicUsize>,
}

#[async_trait]
impl AppSession for TestApp {
    async fn rpc_handle(&self, cx: RpcContext) {
        match cx.request.method.as_str() {
            "ping" => {
                let _ = cx.responder.reply("pong").await;
            }
            "add" => {
                if let Some((a, b)) = cx.responder.parse_params::<(u64, u64)>().await {
                    let _ = cx.responder.reply(a + b).await;
                }
            }
            "fail" => {
                let _ = cx.responder.log_reply_error(400, "requested failure").await;
            }
            _ => {}
        }
    }

    async fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

/// Session factory producing [`TestApp`]s and counting their destroys.
pub struct TestFactory {
    pub destroys: Arc<AtomicUsize>,
}

impl TestFactory {
    pub fn new() -> (Arc<dyn SessionFactory>, Arc<AtomicUsize>) {
        let destroys = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                destroys: Arc::clone(&destroys),
            }),
            destroys,
        )
    }
}

#[async_trait]
impl SessionFactory for TestFactory {
    async fn create_session(
        &self,
        _handle: SessionHandle,
    ) -> Result<Box<dyn AppSession>, SessionError> {
        Ok(Box::new(TestApp {
            destroys: Arc::clone(&self.destroys),
        }))
    }
}

/// Factory that refuses every session.
pub struct RefusingFactory;

#[async_trait]
impl SessionFactory for RefusingFactory {
    async fn create_session(
        &self,
        _handle: SessionHandle,
    ) -> Result<Box<dyn AppSession>, SessionError> {
        Err(SessionError::rejected(std::io::Error::other(
            "session limit reached",
        )))
    }
}
