//! The per-message handle passed to middleware and handlers.
//!
//! A context lives for the duration of one dispatch. It carries the
//! sanitized inbound meta, the validated payload, and the emission
//! methods. The terminal-once invariant is enforced here: the first
//! `reply` or `error` on an RPC context commits, and every later
//! terminal or progress call is a silent no-op.

use {
    crate::{
        error::EmitError,
        platform::{ConnData, Connection, Socket},
        pubsub::{PublishOptions, PublishResult},
        router::Router,
        topics::TopicsManager,
    },
    chrono::{DateTime, Utc},
    http::Extensions,
    parking_lot::{Mutex, MutexGuard},
    serde::Serialize,
    serde_json::Value,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tokio_util::sync::CancellationToken,
    wsmux_rpc::{
        domain::{ClientId, CorrelationId, MessageType, Topic},
        envelope::{Envelope, Meta},
        error::{ErrorCode, ErrorPayload},
        schema::{issues_to_details, MessageSchema, RpcSchema},
    },
};

/// What an emission should wait for before resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    /// The socket's outbound buffer has drained below the adapter's
    /// threshold.
    Drain,

    /// Client acknowledgement. Not supported by the core.
    Ack,
}

/// Options accepted by every emission method.
#[derive(Clone, Default)]
pub struct EmitOptions {
    /// User meta merged onto the frame. Reserved keys are stripped
    /// before the merge.
    pub meta: Option<Meta>,

    /// Pre-commit abort: if already cancelled when the call runs, the
    /// emission becomes a no-op. Post-commit cancellation is ignored.
    pub signal: Option<CancellationToken>,

    pub wait_for: Option<WaitFor>,

    /// Progress only: skip the send if fewer than this many
    /// milliseconds have passed since the last progress frame.
    pub throttle_ms: Option<u64>,
}

struct ContextInner {
    router: Arc<Router>,
    connection: Connection,
    message_type: MessageType,
    meta: Meta,
    payload: Option<Value>,
    received_at: DateTime<Utc>,
    correlation_id: Option<CorrelationId>,
    rpc: Option<RpcSchema>,
    terminal: AtomicBool,
    last_progress: Mutex<Option<Instant>>,
    extensions: Mutex<Extensions>,
}

/// The per-message handle. Cheap to clone; all clones share the same
/// terminal state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        router: Arc<Router>,
        connection: Connection,
        message_type: MessageType,
        meta: Meta,
        payload: Option<Value>,
        received_at: DateTime<Utc>,
        correlation_id: Option<CorrelationId>,
        rpc: Option<RpcSchema>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                router,
                connection,
                message_type,
                meta,
                payload,
                received_at,
                correlation_id,
                rpc,
                terminal: AtomicBool::new(false),
                last_progress: Mutex::new(None),
                extensions: Mutex::new(Extensions::new()),
            }),
        }
    }

    /// The opaque transport handle.
    pub fn socket(&self) -> &Arc<dyn Socket> {
        self.inner.connection.socket()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn message_type(&self) -> &MessageType {
        &self.inner.message_type
    }

    pub fn client_id(&self) -> &ClientId {
        self.inner.connection.client_id()
    }

    /// Snapshot of the connection data.
    pub fn data(&self) -> Arc<ConnData> {
        self.inner.connection.data()
    }

    /// Shallow-merges `patch` into the connection data (copy-on-write;
    /// handlers racing on other messages keep a consistent snapshot).
    pub fn assign_data(&self, patch: ConnData) {
        self.inner.connection.assign_data(patch);
    }

    /// Authoritative server receive time. `meta.timestamp`, when a
    /// client supplied one, is untrusted.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.inner.received_at
    }

    /// Sanitized inbound meta: server stamps applied, reserved client
    /// keys stripped.
    pub fn meta(&self) -> &Meta {
        &self.inner.meta
    }

    /// The validated payload, present iff the schema defines one.
    pub fn payload(&self) -> Option<&Value> {
        self.inner.payload.as_ref()
    }

    /// Deserializes the validated payload into a concrete type.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.inner.payload.clone().unwrap_or(Value::Null))
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.inner.correlation_id.as_ref()
    }

    pub fn is_rpc(&self) -> bool {
        self.inner.rpc.is_some()
    }

    /// Whether a terminal (`reply` or `error`) has committed.
    pub fn terminal_sent(&self) -> bool {
        self.inner.terminal.load(Ordering::Acquire)
    }

    pub fn topics(&self) -> &TopicsManager {
        self.inner.connection.topics()
    }

    /// Plugin slot.
    pub fn extensions(&self) -> MutexGuard<'_, Extensions> {
        self.inner.extensions.lock()
    }

    /// Fire-and-forget egress of a typed message. Available on both
    /// event and RPC contexts, and unaffected by the terminal guard.
    pub async fn send<P: Serialize>(
        &self,
        schema: &MessageSchema,
        payload: P,
        opts: EmitOptions,
    ) -> Result<(), EmitError> {
        if matches!(opts.wait_for, Some(WaitFor::Ack)) {
            return Err(EmitError::AckUnsupported);
        }
        if is_aborted(&opts) {
            return Ok(());
        }

        let value = serde_json::to_value(payload)?;
        let value = match schema.payload() {
            Some(validator) => Some(
                validator
                    .safe_parse(&value)
                    .map_err(EmitError::OutboundValidation)?,
            ),
            None => non_null(value),
        };

        let mut meta = opts.meta.clone().unwrap_or_default();
        meta.sanitize_user(schema.message_type());
        meta.set_timestamp(Utc::now().timestamp_millis());

        self.emit(Envelope::new(schema.message_type().clone(), meta, value), &opts)
            .await
    }

    /// Emits the bound response. Terminal: the first `reply` or
    /// `error` wins and later calls are no-ops.
    pub async fn reply<P: Serialize>(
        &self,
        payload: P,
        opts: EmitOptions,
    ) -> Result<(), EmitError> {
        let Some(rpc) = self.inner.rpc.clone() else {
            return Err(EmitError::NotRpc);
        };
        if matches!(opts.wait_for, Some(WaitFor::Ack)) {
            return Err(EmitError::AckUnsupported);
        }
        if is_aborted(&opts) {
            return Ok(());
        }
        if self.terminal_sent() {
            return Ok(());
        }

        let value = serde_json::to_value(payload)?;
        let value = match rpc.response() {
            Some(validator) => match validator.safe_parse(&value) {
                Ok(parsed) => Some(parsed),
                Err(issues) => return self.collapse_outbound_validation(issues, &opts).await,
            },
            None => non_null(value),
        };

        if self.inner.terminal.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.emit(self.rpc_frame(&rpc, value, opts.meta.clone()), &opts)
            .await
    }

    /// Non-terminal progress frame for an RPC. May be called any
    /// number of times before the terminal.
    pub async fn progress<P: Serialize>(
        &self,
        payload: P,
        opts: EmitOptions,
    ) -> Result<(), EmitError> {
        let Some(rpc) = self.inner.rpc.clone() else {
            return Err(EmitError::NotRpc);
        };
        if matches!(opts.wait_for, Some(WaitFor::Ack)) {
            return Err(EmitError::AckUnsupported);
        }
        if is_aborted(&opts) {
            return Ok(());
        }
        if self.terminal_sent() {
            return Ok(());
        }

        {
            let mut last = self.inner.last_progress.lock();

            if let (Some(throttle_ms), Some(previous)) = (opts.throttle_ms, *last) {
                if previous.elapsed() < Duration::from_millis(throttle_ms) {
                    return Ok(());
                }
            }

            *last = Some(Instant::now());
        }

        let value = serde_json::to_value(payload)?;
        let value = match rpc.response() {
            Some(validator) => match validator.safe_parse(&value) {
                Ok(parsed) => Some(parsed),
                Err(issues) => return self.collapse_outbound_validation(issues, &opts).await,
            },
            None => non_null(value),
        };

        self.emit(self.rpc_frame(&rpc, value, opts.meta.clone()), &opts)
            .await
    }

    /// Emits an error frame. Terminal on RPC contexts; on event
    /// contexts it is an out-of-band frame and may be emitted more
    /// than once.
    pub async fn error(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        details: Option<Value>,
        opts: EmitOptions,
    ) -> Result<(), EmitError> {
        if matches!(opts.wait_for, Some(WaitFor::Ack)) {
            return Err(EmitError::AckUnsupported);
        }
        if is_aborted(&opts) {
            return Ok(());
        }
        if self.inner.rpc.is_some() && self.inner.terminal.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut payload = ErrorPayload::new(code, message);
        if let Some(details) = details {
            payload = payload.with_details(details);
        }

        self.emit(
            Envelope::error(payload, self.inner.correlation_id.as_ref()),
            &opts,
        )
        .await
    }

    /// Publishes to a topic through the attached pub/sub adapter.
    pub async fn publish<P: Serialize>(
        &self,
        topic: impl Into<Topic>,
        schema: &MessageSchema,
        payload: P,
        opts: PublishOptions,
    ) -> PublishResult {
        self.inner
            .router
            .publish(topic.into(), schema, payload, opts)
            .await
    }

    fn rpc_frame(&self, rpc: &RpcSchema, payload: Option<Value>, meta: Option<Meta>) -> Envelope {
        let mut meta = meta.unwrap_or_default();
        meta.sanitize_user(rpc.response_type());
        meta.set_timestamp(Utc::now().timestamp_millis());

        // Reserved: the server's copy of the inbound correlation id
        // always wins over user meta.
        if let Some(correlation_id) = &self.inner.correlation_id {
            meta.set_correlation_id(correlation_id);
        }

        Envelope::new(rpc.response_type().clone(), meta, payload)
    }

    /// A reply or progress payload failed egress validation: the
    /// terminal collapses to an `OUTBOUND_VALIDATION_ERROR` frame with
    /// the same correlation id.
    async fn collapse_outbound_validation(
        &self,
        issues: Vec<wsmux_rpc::schema::Issue>,
        opts: &EmitOptions,
    ) -> Result<(), EmitError> {
        if !self.inner.terminal.swap(true, Ordering::AcqRel) {
            let payload = ErrorPayload::new(
                ErrorCode::OutboundValidationError,
                "Response payload failed validation",
            )
            .with_details(issues_to_details(&issues));

            self.emit(
                Envelope::error(payload, self.inner.correlation_id.as_ref()),
                opts,
            )
            .await
            .ok();
        }

        Err(EmitError::OutboundValidation(issues))
    }

    async fn emit(&self, envelope: Envelope, opts: &EmitOptions) -> Result<(), EmitError> {
        let frame = envelope.encode()?;
        self.inner.connection.socket().send(frame)?;

        if matches!(opts.wait_for, Some(WaitFor::Drain)) {
            tokio::select! {
                result = self.inner.connection.socket().wait_drained() => {
                    result.map_err(EmitError::from)
                }
                _ = self.inner.connection.closed().cancelled() => Err(EmitError::Aborted),
            }
        } else {
            Ok(())
        }
    }
}

fn is_aborted(opts: &EmitOptions) -> bool {
    opts.signal
        .as_ref()
        .map_or(false, CancellationToken::is_cancelled)
}

fn non_null(value: Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}
