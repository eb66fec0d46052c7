//! Message registration and dispatch.
//!
//! The router owns the handler registry (keyed by the message type
//! string, each entry tagged event or RPC), the middleware chain, the
//! lifecycle hooks and the limit policy. Platform adapters feed it one
//! frame at a time per connection; everything the wire sees back goes
//! through here or through the per-message [`Context`].

use {
    crate::{
        context::{Context, EmitOptions},
        error::{BoxError, PublishError, RegistryError},
        limits::{LimitExceeded, Limits, OnExceeded},
        platform::{ConnData, Connection, ConnectionRecord, ConnectionRegistry, Heartbeat, Socket},
        pubsub::{LocalDelivery, PubSubAdapter, PublishEnvelope, PublishOptions, PublishResult},
        topics::{TopicsManager, TransportSink},
    },
    chrono::Utc,
    serde::Serialize,
    std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
    wsmux_rpc::{
        domain::{ClientId, CorrelationId, MessageType, Topic},
        envelope::{sniff_correlation_id, Envelope},
        error::{ErrorCode, ErrorPayload},
        schema::{issues_to_details, MessageSchema, RpcSchema},
    },
};

/// What a middleware tells the chain to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop the chain without running the handler. The middleware is
    /// expected to have emitted whatever the client should see.
    Halt,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// A registered message handler. Errors surface as `INTERNAL`.
pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;

pub type MiddlewareFuture = Pin<Box<dyn Future<Output = Result<Flow, BoxError>> + Send>>;

/// A middleware step. Runs before the handler; errors surface as
/// `INTERNAL`.
pub type Middleware = Arc<dyn Fn(Context) -> MiddlewareFuture + Send + Sync>;

enum Registration {
    Event { schema: MessageSchema, handler: Handler },
    Rpc { schema: RpcSchema, handler: Handler },
}

impl Registration {
    fn request_schema(&self) -> &MessageSchema {
        match self {
            Self::Event { schema, .. } => schema,
            Self::Rpc { schema, .. } => schema.request(),
        }
    }

    fn rpc_schema(&self) -> Option<&RpcSchema> {
        match self {
            Self::Event { .. } => None,
            Self::Rpc { schema, .. } => Some(schema),
        }
    }

    fn handler(&self) -> &Handler {
        match self {
            Self::Event { handler, .. } | Self::Rpc { handler, .. } => handler,
        }
    }
}

/// Lifecycle and observation hooks. All sync; none may block.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_open: Option<Arc<dyn Fn(&ConnectionRecord) + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(&ConnectionRecord, u16, &str) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&ConnectionRecord, &BoxError) + Send + Sync>>,
    pub on_limit_exceeded: Option<Arc<dyn Fn(&LimitExceeded) + Send + Sync>>,
}

/// The message router. Build it mutably (register handlers, attach
/// config), then wrap it in an [`Arc`] and hand it to a platform
/// adapter.
pub struct Router {
    registry: HashMap<MessageType, Registration>,
    global_middleware: Vec<Middleware>,
    type_middleware: HashMap<MessageType, Vec<Middleware>>,
    hooks: Hooks,
    limits: Limits,
    heartbeat: Option<Heartbeat>,
    warn_incomplete_rpc: bool,
    pubsub: Option<Arc<dyn PubSubAdapter>>,
    pubsub_started: AtomicBool,
    connections: Arc<ConnectionRegistry>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            registry: HashMap::new(),
            global_middleware: Vec::new(),
            type_middleware: HashMap::new(),
            hooks: Hooks::default(),
            limits: Limits::default(),
            heartbeat: None,
            warn_incomplete_rpc: true,
            pubsub: None,
            pubsub_started: AtomicBool::new(false),
            connections: Arc::new(ConnectionRegistry::default()),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Attaches a pub/sub adapter, mounting `publish` on the router
    /// and on every context.
    pub fn with_pubsub(mut self, adapter: Arc<dyn PubSubAdapter>) -> Self {
        self.pubsub = Some(adapter);
        self
    }

    /// Default `true`: log a diagnostic when an RPC handler finishes
    /// without emitting a terminal.
    pub fn warn_incomplete_rpc(mut self, enabled: bool) -> Self {
        self.warn_incomplete_rpc = enabled;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn heartbeat(&self) -> Option<&Heartbeat> {
        self.heartbeat.as_ref()
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Registers a fire-and-forget handler for one message type.
    pub fn on<F, Fut>(&mut self, schema: MessageSchema, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let message_type = schema.message_type().clone();
        self.insert(
            message_type,
            Registration::Event {
                schema,
                handler: wrap(handler),
            },
        )
    }

    /// Registers an RPC handler; the schema carries the bound response
    /// type.
    pub fn rpc<F, Fut>(&mut self, schema: RpcSchema, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let message_type = schema.request().message_type().clone();
        self.insert(
            message_type,
            Registration::Rpc {
                schema,
                handler: wrap(handler),
            },
        )
    }

    /// Appends a global middleware. Global middleware runs before
    /// per-type middleware, both in registration order.
    pub fn use_middleware<F, Fut>(&mut self, middleware: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow, BoxError>> + Send + 'static,
    {
        self.global_middleware.push(wrap_middleware(middleware));
    }

    /// Appends a middleware that only runs for the schema's message
    /// type.
    pub fn use_for<F, Fut>(&mut self, schema: &MessageSchema, middleware: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Flow, BoxError>> + Send + 'static,
    {
        self.type_middleware
            .entry(schema.message_type().clone())
            .or_default()
            .push(wrap_middleware(middleware));
    }

    /// Imports another router's handlers and middleware. A handler
    /// registered on both sides for the same type is an error, and
    /// nothing is imported.
    pub fn merge(&mut self, other: Router) -> Result<(), RegistryError> {
        for message_type in other.registry.keys() {
            if self.registry.contains_key(message_type) {
                return Err(RegistryError::DuplicateType(message_type.clone()));
            }
        }

        self.registry.extend(other.registry);
        self.global_middleware.extend(other.global_middleware);
        for (message_type, middleware) in other.type_middleware {
            self.type_middleware
                .entry(message_type)
                .or_default()
                .extend(middleware);
        }

        Ok(())
    }

    /// One-time init: hands the pub/sub adapter its local-delivery
    /// callback (distributed adapters begin consuming here). Platform
    /// adapters call this before serving; idempotent.
    pub async fn init(self: &Arc<Self>) -> Result<(), BoxError> {
        let Some(pubsub) = &self.pubsub else {
            return Ok(());
        };

        if self.pubsub_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let registry = self.connections.clone();
        let deliver: LocalDelivery = Arc::new(move |envelope| deliver_locally(&registry, envelope));

        pubsub.start(deliver).await
    }

    /// Registers a freshly upgraded connection. The returned handle is
    /// what the platform adapter passes to [`Router::dispatch`].
    pub fn open_connection(
        self: &Arc<Self>,
        socket: Arc<dyn Socket>,
        protocol: Option<String>,
        data: ConnData,
    ) -> Connection {
        let client_id = ClientId::generate();
        let sink = Arc::new(TransportSink::new(socket.clone(), self.pubsub.clone()));
        let topics = TopicsManager::new(
            client_id,
            self.limits.topic_policy.clone(),
            self.limits.max_topics_per_connection,
            sink,
        );

        let connection = Connection::new(socket, protocol, data, topics);
        self.connections.insert(connection.clone());

        if let Some(hook) = &self.hooks.on_open {
            hook(&connection.record());
        }

        tracing::debug!(client_id = %connection.client_id(), "connection opened");

        connection
    }

    /// Close callback: cancels pending waits, tears the topic set down
    /// best-effort, removes the connection and fires `on_close`.
    pub async fn connection_closed(&self, connection: &Connection, code: u16, reason: &str) {
        connection.closed().cancel();
        connection.topics().teardown().await;
        self.connections.remove(connection.client_id());

        if let Some(hook) = &self.hooks.on_close {
            hook(&connection.record(), code, reason);
        }

        tracing::debug!(
            client_id = %connection.client_id(),
            code,
            reason,
            "connection closed"
        );
    }

    /// Dispatches one inbound frame on behalf of a connection.
    ///
    /// Platform adapters must await this frame-by-frame per
    /// connection: handler invocation order equals wire order, and a
    /// suspended handler pauses only its own connection's intake.
    pub async fn dispatch(self: &Arc<Self>, connection: &Connection, raw: &str) {
        let observed = raw.len();
        if observed > self.limits.max_payload_bytes {
            self.handle_payload_limit(connection, raw, observed);
            return;
        }

        let mut envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                let correlation_id = sniff_correlation_id(raw);
                self.emit_error(
                    connection,
                    ErrorPayload::new(
                        ErrorCode::InvalidArgument,
                        format!("Failed to decode envelope: {err}"),
                    ),
                    correlation_id.as_ref(),
                );
                return;
            }
        };

        let message_type = envelope.message_type.clone();
        let correlation_id = envelope.meta.correlation_id();
        let received_at = Utc::now();

        envelope.meta.sanitize_inbound(&message_type);
        envelope.meta.set_client_id(connection.client_id());
        envelope.meta.set_received_at(received_at.timestamp_millis());

        let Some(registration) = self.registry.get(&message_type) else {
            self.emit_error(
                connection,
                ErrorPayload::new(
                    ErrorCode::UnsupportedMessageType,
                    format!("No handler registered for message type: {message_type}"),
                ),
                correlation_id.as_ref(),
            );
            return;
        };

        let schema = registration.request_schema();

        if let Some(validator) = schema.meta() {
            let meta_value = serde_json::to_value(&envelope.meta).unwrap_or_default();
            if let Err(issues) = validator.safe_parse(&meta_value) {
                self.emit_error(
                    connection,
                    ErrorPayload::new(ErrorCode::InvalidArgument, "Meta failed validation")
                        .with_details(issues_to_details(&issues)),
                    correlation_id.as_ref(),
                );
                return;
            }
        }

        let payload = match (schema.payload(), envelope.payload.take()) {
            (Some(validator), value) => {
                match validator.safe_parse(&value.unwrap_or(serde_json::Value::Null)) {
                    Ok(parsed) if parsed.is_null() => None,
                    Ok(parsed) => Some(parsed),
                    Err(issues) => {
                        self.emit_error(
                            connection,
                            ErrorPayload::new(
                                ErrorCode::InvalidArgument,
                                "Payload failed validation",
                            )
                            .with_details(issues_to_details(&issues)),
                            correlation_id.as_ref(),
                        );
                        return;
                    }
                }
            }
            (None, Some(_)) => {
                self.emit_error(
                    connection,
                    ErrorPayload::new(
                        ErrorCode::InvalidArgument,
                        format!("Message type {message_type} does not declare a payload"),
                    ),
                    correlation_id.as_ref(),
                );
                return;
            }
            (None, None) => None,
        };

        let ctx = Context::new(
            self.clone(),
            connection.clone(),
            message_type.clone(),
            envelope.meta,
            payload,
            received_at,
            correlation_id.clone(),
            registration.rpc_schema().cloned(),
        );

        let chain: Vec<Middleware> = self
            .global_middleware
            .iter()
            .chain(self.type_middleware.get(&message_type).into_iter().flatten())
            .cloned()
            .collect();

        for middleware in chain {
            match middleware(ctx.clone()).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => return,
                Err(err) => {
                    self.surface_internal(&ctx, connection, err).await;
                    return;
                }
            }
        }

        if let Err(err) = (registration.handler())(ctx.clone()).await {
            self.surface_internal(&ctx, connection, err).await;
            return;
        }

        if registration.rpc_schema().is_some() && !ctx.terminal_sent() && self.warn_incomplete_rpc {
            tracing::warn!(
                message_type = %message_type,
                correlation_id = ?correlation_id,
                "RPC handler finished without reply or error; \
                 use warn_incomplete_rpc(false) to silence"
            );
        }
    }

    /// Publishes to a topic. Payload-blind unless the schema carries a
    /// validator; this is the only validation point on the publish
    /// path.
    pub async fn publish<P: Serialize>(
        &self,
        topic: impl Into<Topic>,
        schema: &MessageSchema,
        payload: P,
        opts: PublishOptions,
    ) -> PublishResult {
        if opts.exclude_self {
            return Err(PublishError::ExcludeSelfUnsupported);
        }

        let Some(pubsub) = &self.pubsub else {
            return Err(PublishError::NoAdapter);
        };

        if opts
            .signal
            .as_ref()
            .map_or(false, tokio_util::sync::CancellationToken::is_cancelled)
        {
            return Err(PublishError::Aborted);
        }

        let value = serde_json::to_value(payload)?;
        let value = match schema.payload() {
            Some(validator) => Some(
                validator
                    .safe_parse(&value)
                    .map_err(PublishError::Validation)?,
            ),
            None => {
                if value.is_null() {
                    None
                } else {
                    Some(value)
                }
            }
        };

        let mut meta = opts.meta.unwrap_or_default();
        meta.sanitize_user(schema.message_type());
        meta.set_timestamp(Utc::now().timestamp_millis());

        pubsub
            .publish(PublishEnvelope {
                topic: topic.into(),
                message_type: schema.message_type().clone(),
                payload: value,
                meta,
                partition_key: opts.partition_key,
                exclude_client_id: opts.exclude_client_id,
            })
            .await
    }

    fn handle_payload_limit(&self, connection: &Connection, raw: &str, observed: usize) {
        let correlation_id = sniff_correlation_id(raw);
        let info = LimitExceeded {
            client_id: connection.client_id().clone(),
            observed,
            limit: self.limits.max_payload_bytes,
            correlation_id: correlation_id.clone(),
        };

        // The limit hook fires for every policy; on_error never does.
        if let Some(hook) = &self.hooks.on_limit_exceeded {
            hook(&info);
        }

        match self.limits.on_exceeded {
            OnExceeded::Send => {
                self.emit_error(
                    connection,
                    ErrorPayload::new(
                        ErrorCode::ResourceExhausted,
                        "Payload exceeds the configured limit",
                    )
                    .with_details(info.details()),
                    correlation_id.as_ref(),
                );
            }
            OnExceeded::Close => {
                connection
                    .socket()
                    .close(self.limits.close_code, "RESOURCE_EXHAUSTED")
                    .ok();
            }
            OnExceeded::Custom => {}
        }
    }

    async fn surface_internal(&self, ctx: &Context, connection: &Connection, err: BoxError) {
        tracing::error!(
            client_id = %connection.client_id(),
            message_type = %ctx.message_type(),
            error = %err,
            "dispatch failed"
        );

        // RPC-aware and terminal-guarded: if the handler already
        // replied, nothing further reaches the wire.
        ctx.error(
            ErrorCode::Internal,
            "Internal error",
            None,
            EmitOptions::default(),
        )
        .await
        .ok();

        if let Some(hook) = &self.hooks.on_error {
            hook(&connection.record(), &err);
        }
    }

    fn emit_error(
        &self,
        connection: &Connection,
        payload: ErrorPayload,
        correlation_id: Option<&CorrelationId>,
    ) {
        let envelope = Envelope::error(payload, correlation_id);

        match envelope.encode() {
            Ok(frame) => {
                connection.socket().send(frame).ok();
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize error frame");
            }
        }
    }

    fn insert(
        &mut self,
        message_type: MessageType,
        registration: Registration,
    ) -> Result<(), RegistryError> {
        match self.registry.entry(message_type) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                Err(RegistryError::DuplicateType(entry.key().clone()))
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(registration);
                Ok(())
            }
        }
    }
}

fn wrap<F, Fut>(handler: F) -> Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| -> HandlerFuture { Box::pin(handler(ctx)) })
}

fn wrap_middleware<F, Fut>(middleware: F) -> Middleware
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Flow, BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| -> MiddlewareFuture { Box::pin(middleware(ctx)) })
}

/// Fans one publish envelope out to the locally-subscribed
/// connections, honoring the `exclude_client_id` filter. Internal
/// envelope fields never reach the wire: the egress frame is rebuilt
/// from type, meta and payload only.
fn deliver_locally(registry: &ConnectionRegistry, envelope: &PublishEnvelope) -> usize {
    let frame = match Envelope::new(
        envelope.message_type.clone(),
        envelope.meta.clone(),
        envelope.payload.clone(),
    )
    .encode()
    {
        Ok(frame) => frame,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize publish envelope");
            return 0;
        }
    };

    let mut matched = 0;

    for connection in registry.snapshot() {
        if envelope.exclude_client_id.as_ref() == Some(connection.client_id()) {
            continue;
        }

        if !connection.topics().contains(&envelope.topic) {
            continue;
        }

        if connection.socket().send(frame.clone()).is_ok() {
            matched += 1;
        }
    }

    matched
}
