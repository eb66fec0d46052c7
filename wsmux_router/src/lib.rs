//! Schema-validated WebSocket message router.
//!
//! Inbound frames are parsed into `{type, meta, payload?}` envelopes,
//! dispatched to typed handlers through a middleware chain, and
//! answered through a per-message [`Context`] that enforces the
//! one-terminal-per-RPC invariant. Topic subscriptions and publish
//! fan-out go through narrow adapter seams so transports and brokers
//! stay pluggable.

pub use wsmux_rpc as rpc;

pub mod context;
pub mod error;
pub mod limits;
pub mod platform;
pub mod pubsub;
pub mod ratelimit;
pub mod router;
pub mod topics;

pub use {
    context::{Context, EmitOptions, WaitFor},
    error::{BoxError, EmitError, PublishError, RegistryError, SocketError, TopicError},
    limits::{LimitExceeded, Limits, OnExceeded, DEFAULT_MAX_PAYLOAD_BYTES},
    platform::{
        AuthRejection, AuthenticateFn, ConnData, Connection, ConnectionRecord, ConnectionRegistry,
        Heartbeat, ReadyState, Socket,
    },
    pubsub::{
        memory::MemoryPubSub, Capability, LocalDelivery, PubSubAdapter, PublishEnvelope,
        PublishOptions, PublishReceipt, PublishResult,
    },
    ratelimit::{rate_limit, Decision, RateLimiter, TokenBucket, TokenBucketPolicy},
    router::{Flow, Handler, Hooks, Middleware, Router},
    topics::{SinkError, SubscriptionSink, TopicsManager},
};
