//! Newline-delimited JSON codec: the stand-in for the wire-level framing
//! collaborator in socket-level tests.
//!
//! Frames are one JSON object per line. Objects carrying a `method` are
//! requests; everything else is a reply correlated by numeric `id`.

use serde_json::{json, value::to_raw_value, Value};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use submux::{
    async_trait, BoxedIo, ChannelError, ChannelFactory, ErrorPayload, RawValue, Request,
    RequestHandler, RpcChannel,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
    time::{sleep, Duration},
};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

type ReplySender = oneshot::Sender<Result<Box<RawValue>, ErrorPayload>>;

/// One bound line-codec channel.
pub struct LineChannel {
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, ReplySender>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl LineChannel {
    fn spawn(io: BoxedIo, handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        let (read, write) = tokio::io::split(io);
        let (outbound, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });
        tokio::spawn(write_loop(write, rx, channel.closed.clone()));
        tokio::spawn(read_loop(read, Arc::clone(&channel), handler));
        channel
    }
}

async fn write_loop(
    mut write: WriteHalf<BoxedIo>,
    mut rx: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    loop {
        select! {
            _ = closed.cancelled() => break,
            line = rx.recv() => {
                let Some(mut line) = line else { break };
                line.push('\n');
                if write.write_all(line.as_bytes()).await.is_err() {
                    closed.cancel();
                    break;
                }
                let _ = write.flush().await;
            }
        }
    }
}

async fn read_loop(
    read: ReadHalf<BoxedIo>,
    channel: Arc<LineChannel>,
    handler: Arc<dyn RequestHandler>,
) {
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = select! {
            _ = channel.closed.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) if !line.trim().is_empty() => line,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        };
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if let Some(method) = msg.get("method").and_then(Value::as_str) {
            let request = Request {
                id: to_raw_value(msg.get("id").unwrap_or(&Value::Null)).unwrap(),
                method: method.to_owned(),
                params: to_raw_value(msg.get("params").unwrap_or(&Value::Null)).unwrap(),
            };
            let peer: Arc<dyn RpcChannel> = Arc::clone(&channel) as _;
            Arc::clone(&handler).handle_request(peer, request).await;
        } else if let Some(id) = msg.get("id").and_then(Value::as_u64) {
            let sender = channel.pending.lock().unwrap().remove(&id);
            if let Some(sender) = sender {
                let outcome = match msg.get("error") {
                    Some(error) => Err(serde_json::from_value::<ErrorPayload>(error.clone())
                        .unwrap_or_else(|_| ErrorPayload::new(-1, "malformed error"))),
                    None => Ok(to_raw_value(msg.get("result").unwrap_or(&Value::Null)).unwrap()),
                };
                let _ = sender.send(outcome);
            }
        }
    }
    channel.closed.cancel();
}

#[async_trait]
impl RpcChannel for LineChannel {
    async fn call(
        &self,
        method: &str,
        params: Box<RawValue>,
    ) -> Result<Box<RawValue>, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        let line = format!(
            r#"{{"id":{id},"method":{},"params":{}}}"#,
            serde_json::to_string(method).unwrap(),
            params.get()
        );
        self.outbound.send(line).map_err(|_| ChannelError::Closed)?;
        select! {
            _ = self.closed.cancelled() => Err(ChannelError::Closed),
            reply = rx => match reply {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(payload)) => Err(ChannelError::Rpc(payload)),
                Err(_) => Err(ChannelError::Closed),
            }
        }
    }

    async fn reply(&self, id: &RawValue, result: Box<RawValue>) -> Result<(), ChannelError> {
        let line = format!(r#"{{"id":{},"result":{}}}"#, id.get(), result.get());
        self.outbound.send(line).map_err(|_| ChannelError::Closed)
    }

    async fn reply_error(&self, id: &RawValue, error: ErrorPayload) -> Result<(), ChannelError> {
        let line = format!(
            r#"{{"id":{},"error":{}}}"#,
            id.get(),
            serde_json::to_string(&error).unwrap()
        );
        self.outbound.send(line).map_err(|_| ChannelError::Closed)
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.closed.cancel();
        Ok(())
    }
}

/// [`ChannelFactory`] for the line codec.
pub struct LineCodec;

impl ChannelFactory for LineCodec {
    fn bind(&self, io: BoxedIo, handler: Arc<dyn RequestHandler>) -> Arc<dyn RpcChannel> {
        LineChannel::spawn(io, handler) as _
    }
}

/// Test client speaking the line codec over a raw TCP stream.
pub struct TcpLineClient {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    write: tokio::net::tcp::OwnedWriteHalf,
    next_id: u64,
}

impl TcpLineClient {
    /// Connect, retrying while the server comes up.
    pub async fn connect(addr: &str) -> Self {
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(addr).await {
                let (read, write) = stream.into_split();
                return Self {
                    lines: BufReader::new(read).lines(),
                    write,
                    next_id: 0,
                };
            }
            sleep(Duration::from_millis(100)).await;
        }
        panic!("server never came up at {addr}");
    }

    /// Issue a call and wait for its reply.
    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let line = json!({ "id": id, "method": method, "params": params }).to_string() + "\n";
        self.write.write_all(line.as_bytes()).await.unwrap();
        loop {
            let line = self.lines.next_line().await.unwrap().expect("connection closed");
            let msg: Value = serde_json::from_str(&line).unwrap();
            if msg.get("id").and_then(Value::as_u64) == Some(id) {
                return msg;
            }
        }
    }
}

/// Test client speaking the line codec over a web-socket connection.
pub struct WsLineClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    queued: VecDeque<Value>,
    next_id: u64,
}

impl WsLineClient {
    /// Connect, retrying while the server comes up.
    pub async fn connect(url: &str) -> Self {
        for _ in 0..50 {
            if let Ok((socket, _)) = connect_async(url).await {
                return Self {
                    socket,
                    queued: VecDeque::new(),
                    next_id: 0,
                };
            }
            sleep(Duration::from_millis(100)).await;
        }
        panic!("server never came up at {url}");
    }

    /// Issue a call and wait for its reply.
    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        use futures_util::{SinkExt, StreamExt};

        let id = self.next_id;
        self.next_id += 1;
        let line = json!({ "id": id, "method": method, "params": params }).to_string() + "\n";
        self.socket.send(Message::text(line)).await.unwrap();
        loop {
            if let Some(pos) = self
                .queued
                .iter()
                .position(|msg| msg.get("id").and_then(Value::as_u64) == Some(id))
            {
                return self.queued.remove(pos).unwrap();
            }
            let payload = match self.socket.next().await.expect("connection closed").unwrap() {
                Message::Binary(payload) => payload,
                Message::Text(payload) => payload.as_bytes().to_vec().into(),
                _ => continue,
            };
            for line in std::str::from_utf8(&payload).unwrap().lines() {
                if !line.trim().is_empty() {
                    self.queued.push_back(serde_json::from_str(line).unwrap());
                }
            }
        }
    }
}
