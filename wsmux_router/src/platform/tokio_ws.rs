//! Platform adapter for tokio-tungstenite: accepts upgrades on a
//! [`TcpListener`], runs the authenticate hook during the handshake,
//! and drives a sequential per-connection read loop into
//! [`Router::dispatch`].

use {
    super::{AuthenticateFn, ConnData, ReadyState, Socket},
    crate::{error::SocketError, router::Router},
    futures_util::{stream::SplitSink, SinkExt, StreamExt},
    std::{
        sync::{
            atomic::{AtomicU8, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        net::{TcpListener, TcpStream},
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            Notify,
        },
        time::{Instant, MissedTickBehavior},
    },
    tokio_tungstenite::{
        accept_hdr_async,
        tungstenite::{
            handshake::server::{ErrorResponse, Request, Response},
            protocol::{frame::coding::CloseCode, CloseFrame},
            Message,
        },
        WebSocketStream,
    },
    wsmux_rpc::{
        domain::Topic,
        error::{CLOSE_NORMAL, CLOSE_POLICY},
    },
};

/// Outbound buffer level below which `wait_drained` resolves.
const DRAIN_THRESHOLD_BYTES: usize = 64 * 1024;

/// Ping cadence used when no heartbeat is configured; the tick is
/// ignored in that case.
const IDLE_TICK: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Initialization failed: {0}")]
    Init(crate::error::BoxError),
}

enum Outbound {
    Frame(Message),
    Close { code: u16, reason: String },
}

/// [`Socket`] implementation over the write half of a tungstenite
/// stream. Sends enqueue on an unbounded channel; a writer task owns
/// the sink. The transport has no native topics, so `subscribe` and
/// `unsubscribe` are no-ops and fan-out is owned by the pub/sub
/// adapter index.
pub struct TokioSocket {
    tx: UnboundedSender<Outbound>,
    state: AtomicU8,
    buffered: AtomicUsize,
    drained: Notify,
}

impl TokioSocket {
    fn new(tx: UnboundedSender<Outbound>) -> Self {
        Self {
            tx,
            state: AtomicU8::new(ReadyState::Open as u8),
            buffered: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn set_state(&self, state: ReadyState) {
        self.state.store(state as u8, Ordering::Release);
        self.drained.notify_waiters();
    }

    fn enqueue(&self, message: Message) -> Result<(), SocketError> {
        self.tx
            .send(Outbound::Frame(message))
            .map_err(|_| SocketError::ConnectionClosed)
    }
}

#[async_trait::async_trait]
impl Socket for TokioSocket {
    fn send(&self, frame: String) -> Result<(), SocketError> {
        if self.ready_state() != ReadyState::Open {
            return Err(SocketError::ConnectionClosed);
        }

        self.buffered.fetch_add(frame.len(), Ordering::AcqRel);

        let result = self.enqueue(Message::Text(frame));
        if result.is_err() {
            self.drained.notify_waiters();
        }

        result
    }

    fn close(&self, code: u16, reason: &str) -> Result<(), SocketError> {
        self.set_state(ReadyState::Closing);

        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            })
            .map_err(|_| SocketError::ConnectionClosed)
    }

    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::Acquire) {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    async fn subscribe(&self, _topic: &Topic) -> Result<(), SocketError> {
        Ok(())
    }

    async fn unsubscribe(&self, _topic: &Topic) -> Result<(), SocketError> {
        Ok(())
    }

    async fn wait_drained(&self) -> Result<(), SocketError> {
        loop {
            let notified = self.drained.notified();

            if self.buffered.load(Ordering::Acquire) <= DRAIN_THRESHOLD_BYTES {
                return Ok(());
            }

            if self.ready_state() == ReadyState::Closed {
                return Err(SocketError::ConnectionClosed);
            }

            notified.await;
        }
    }
}

async fn write_loop(
    mut rx: UnboundedReceiver<Outbound>,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    socket: Arc<TokioSocket>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(message) => {
                let text_len = match &message {
                    Message::Text(text) => text.len(),
                    _ => 0,
                };

                let result = sink.send(message).await;

                if text_len > 0 {
                    socket.buffered.fetch_sub(text_len, Ordering::AcqRel);
                    socket.drained.notify_waiters();
                }

                if let Err(err) = result {
                    tracing::debug!(error = %err, "websocket write failed");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                sink.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })))
                .await
                .ok();
                break;
            }
        }
    }

    socket.set_state(ReadyState::Closed);
}

/// Accepts connections forever, spawning one task per connection.
pub async fn serve(
    router: Arc<Router>,
    listener: TcpListener,
    authenticate: Option<AuthenticateFn>,
) -> Result<(), PlatformError> {
    router.init().await.map_err(PlatformError::Init)?;

    loop {
        let (stream, peer) = listener.accept().await?;
        let router = router.clone();
        let authenticate = authenticate.clone();

        tokio::spawn(async move {
            if let Err(err) = handle_connection(router, stream, authenticate).await {
                tracing::debug!(%peer, error = %err, "connection terminated");
            }
        });
    }
}

/// Upgrades one TCP stream and runs its connection to completion.
pub async fn handle_connection(
    router: Arc<Router>,
    stream: TcpStream,
    authenticate: Option<AuthenticateFn>,
) -> Result<(), PlatformError> {
    router.init().await.map_err(PlatformError::Init)?;

    let mut auth_data = ConnData::new();
    let mut protocol: Option<String> = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        protocol = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_owned());

        // Echo the first offered subprotocol back.
        if let Some(protocol) = &protocol {
            if let Ok(value) = protocol.parse() {
                response
                    .headers_mut()
                    .append("Sec-WebSocket-Protocol", value);
            }
        }

        if let Some(authenticate) = &authenticate {
            match authenticate(request) {
                Ok(data) => auth_data = data,
                Err(rejection) => {
                    let mut response = ErrorResponse::new(Some(rejection.reason.clone()));
                    *response.status_mut() = http::StatusCode::from_u16(rejection.status)
                        .unwrap_or(http::StatusCode::UNAUTHORIZED);
                    return Err(response);
                }
            }
        }

        Ok(response)
    };

    let ws = accept_hdr_async(stream, callback).await?;
    let (sink, mut ws_rx) = ws.split();

    let (tx, rx) = mpsc::unbounded_channel();
    let socket = Arc::new(TokioSocket::new(tx));
    tokio::spawn(write_loop(rx, sink, socket.clone()));

    let connection = router.open_connection(socket.clone(), protocol, auth_data);

    let heartbeat = router.heartbeat().cloned();
    let mut ping = tokio::time::interval(
        heartbeat
            .as_ref()
            .map(|heartbeat| heartbeat.interval)
            .unwrap_or(IDLE_TICK),
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_pong = Instant::now();
    let mut close_code = CLOSE_NORMAL;
    let mut close_reason = String::new();

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                // The router serializes per connection by being
                // awaited frame-by-frame here.
                Some(Ok(Message::Text(text))) => router.dispatch(&connection, &text).await,

                // tungstenite queues the pong reply itself.
                Some(Ok(Message::Ping(_))) => {}

                Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),

                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        close_code = frame.code.into();
                        close_reason = frame.reason.into_owned();
                    }
                    break;
                }

                Some(Ok(_)) => {}

                Some(Err(err)) => {
                    tracing::debug!(error = %err, "websocket read failed");
                    break;
                }

                None => break,
            },

            _ = ping.tick() => {
                let Some(heartbeat) = &heartbeat else { continue };

                if last_pong.elapsed() > heartbeat.timeout {
                    if let Some(on_stale) = &heartbeat.on_stale {
                        on_stale(&connection.record());
                    }

                    socket.close(CLOSE_POLICY, "stale connection").ok();
                } else {
                    socket.enqueue(Message::Ping(Vec::new())).ok();
                }
            }
        }
    }

    socket.close(close_code, &close_reason).ok();
    socket.set_state(ReadyState::Closed);
    router.connection_closed(&connection, close_code, &close_reason).await;

    Ok(())
}
