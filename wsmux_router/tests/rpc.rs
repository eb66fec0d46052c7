mod support;

use {
    std::sync::Arc,
    support::{harness, ping_pong, text_schema},
    wsmux_router::{
        context::{EmitOptions, WaitFor},
        error::EmitError,
    },
    wsmux_rpc::{
        error::ErrorCode,
        schema::{MessageSchema, RpcSchema},
    },
};

#[tokio::test]
async fn reply_then_error_emits_one_frame() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .rpc(ping_pong(), |ctx| async move {
                ctx.reply(serde_json::json!({ "text": "done" }), EmitOptions::default())
                    .await?;
                ctx.error(ErrorCode::Internal, "too late", None, EmitOptions::default())
                    .await?;
                ctx.reply(serde_json::json!({ "text": "again" }), EmitOptions::default())
                    .await?;
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(
            &connection,
            r#"{"type":"PING","meta":{"correlationId":"t1"},"payload":{"text":"x"}}"#,
        )
        .await;

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "PONG");
    assert_eq!(frames[0]["payload"]["text"], "done");
}

#[tokio::test]
async fn error_then_reply_emits_one_error_frame() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .rpc(ping_pong(), |ctx| async move {
                ctx.error(
                    ErrorCode::NotFound,
                    "no such thing",
                    None,
                    EmitOptions::default(),
                )
                .await?;
                ctx.reply(serde_json::json!({ "text": "late" }), EmitOptions::default())
                    .await?;
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(
            &connection,
            r#"{"type":"PING","meta":{"correlationId":"t2"},"payload":{"text":"x"}}"#,
        )
        .await;

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "RPC_ERROR");
    assert_eq!(frames[0]["meta"]["correlationId"], "t2");
    assert_eq!(frames[0]["payload"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn progress_frames_precede_the_terminal() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .rpc(ping_pong(), |ctx| async move {
                ctx.progress(serde_json::json!({ "text": "1/2" }), EmitOptions::default())
                    .await?;
                ctx.progress(serde_json::json!({ "text": "2/2" }), EmitOptions::default())
                    .await?;
                ctx.reply(serde_json::json!({ "text": "done" }), EmitOptions::default())
                    .await?;
                // Ignored: the terminal has committed.
                ctx.progress(serde_json::json!({ "text": "3/2" }), EmitOptions::default())
                    .await?;
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(
            &connection,
            r#"{"type":"PING","meta":{"correlationId":"p1"},"payload":{"text":"x"}}"#,
        )
        .await;

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 3);

    for frame in &frames {
        assert_eq!(frame["type"], "PONG");
        assert_eq!(frame["meta"]["correlationId"], "p1");
    }

    assert_eq!(frames[0]["payload"]["text"], "1/2");
    assert_eq!(frames[1]["payload"]["text"], "2/2");
    assert_eq!(frames[2]["payload"]["text"], "done");
}

#[tokio::test]
async fn progress_throttling_skips_rapid_frames() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .rpc(ping_pong(), |ctx| async move {
                let opts = EmitOptions {
                    throttle_ms: Some(10_000),
                    ..EmitOptions::default()
                };

                ctx.progress(serde_json::json!({ "text": "first" }), opts.clone())
                    .await?;
                ctx.progress(serde_json::json!({ "text": "throttled" }), opts)
                    .await?;
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(
            &connection,
            r#"{"type":"PING","meta":{"correlationId":"p2"},"payload":{"text":"x"}}"#,
        )
        .await;

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["payload"]["text"], "first");
}

#[tokio::test]
async fn invalid_reply_collapses_to_outbound_validation_error() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .rpc(ping_pong(), |ctx| async move {
                let result = ctx
                    .reply(serde_json::json!({ "wrong": true }), EmitOptions::default())
                    .await;
                assert!(matches!(result, Err(EmitError::OutboundValidation(_))));

                // The terminal is spent; a correct reply is now a no-op.
                ctx.reply(serde_json::json!({ "text": "ok" }), EmitOptions::default())
                    .await?;
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(
            &connection,
            r#"{"type":"PING","meta":{"correlationId":"v1"},"payload":{"text":"x"}}"#,
        )
        .await;

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "RPC_ERROR");
    assert_eq!(frames[0]["meta"]["correlationId"], "v1");
    assert_eq!(frames[0]["payload"]["code"], "OUTBOUND_VALIDATION_ERROR");
}

#[tokio::test]
async fn reply_on_event_context_is_rejected() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .on(MessageSchema::new("EVT"), |ctx| async move {
                let result = ctx
                    .reply(serde_json::json!({ "text": "nope" }), EmitOptions::default())
                    .await;
                assert!(matches!(result, Err(EmitError::NotRpc)));
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(&connection, r#"{"type":"EVT","meta":{}}"#)
        .await;

    assert!(socket.frames().is_empty());
}

#[tokio::test]
async fn event_context_errors_are_not_terminal_guarded() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .on(MessageSchema::new("EVT"), |ctx| async move {
                ctx.error(ErrorCode::NotFound, "first", None, EmitOptions::default())
                    .await?;
                ctx.error(ErrorCode::NotFound, "second", None, EmitOptions::default())
                    .await?;
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(&connection, r#"{"type":"EVT","meta":{}}"#)
        .await;

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["type"], "ERROR");
    assert_eq!(frames[1]["type"], "ERROR");
}

#[tokio::test]
async fn send_is_unaffected_by_the_terminal_guard() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .rpc(ping_pong(), |ctx| async move {
                ctx.reply(serde_json::json!({ "text": "done" }), EmitOptions::default())
                    .await?;
                ctx.send(
                    &text_schema("ASIDE"),
                    serde_json::json!({ "text": "still flows" }),
                    EmitOptions::default(),
                )
                .await?;
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(
            &connection,
            r#"{"type":"PING","meta":{"correlationId":"s1"},"payload":{"text":"x"}}"#,
        )
        .await;

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["type"], "PONG");
    assert_eq!(frames[1]["type"], "ASIDE");
    // Fire-and-forget frames carry no correlation id.
    assert!(frames[1]["meta"].get("correlationId").is_none());
}

#[tokio::test]
async fn aborted_signal_makes_emission_a_noop() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .rpc(ping_pong(), |ctx| async move {
                let signal = tokio_util::sync::CancellationToken::new();
                signal.cancel();

                ctx.reply(
                    serde_json::json!({ "text": "aborted" }),
                    EmitOptions {
                        signal: Some(signal),
                        ..EmitOptions::default()
                    },
                )
                .await?;

                // The abort happened pre-commit, so the terminal is
                // still available.
                ctx.reply(serde_json::json!({ "text": "real" }), EmitOptions::default())
                    .await?;
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(
            &connection,
            r#"{"type":"PING","meta":{"correlationId":"a1"},"payload":{"text":"x"}}"#,
        )
        .await;

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["payload"]["text"], "real");
}

#[tokio::test]
async fn ack_waits_are_rejected() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .rpc(ping_pong(), |ctx| async move {
                let result = ctx
                    .reply(
                        serde_json::json!({ "text": "x" }),
                        EmitOptions {
                            wait_for: Some(WaitFor::Ack),
                            ..EmitOptions::default()
                        },
                    )
                    .await;
                assert!(matches!(result, Err(EmitError::AckUnsupported)));
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(
            &connection,
            r#"{"type":"PING","meta":{"correlationId":"k1"},"payload":{"text":"x"}}"#,
        )
        .await;

    assert!(socket.frames().is_empty());
}

#[tokio::test]
async fn user_meta_cannot_override_correlation() {
    let (router, connection, socket) = harness(|mut router| {
        router
            .rpc(ping_pong(), |ctx| async move {
                let mut meta = wsmux_rpc::envelope::Meta::new();
                meta.insert("correlationId", "forged".into());
                meta.insert("trace", "keep".into());

                ctx.reply(
                    serde_json::json!({ "text": "done" }),
                    EmitOptions {
                        meta: Some(meta),
                        ..EmitOptions::default()
                    },
                )
                .await?;
                Ok(())
            })
            .unwrap();
        router
    })
    .await;

    router
        .dispatch(
            &connection,
            r#"{"type":"PING","meta":{"correlationId":"real"},"payload":{"text":"x"}}"#,
        )
        .await;

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["meta"]["correlationId"], "real");
    assert_eq!(frames[0]["meta"]["trace"], "keep");
}

#[tokio::test]
async fn rpc_without_correlation_still_runs() {
    let ran = Arc::new(parking_lot::Mutex::new(false));

    let (router, connection, socket) = harness({
        let ran = ran.clone();
        move |mut router| {
            router
                .rpc(
                    RpcSchema::new(MessageSchema::new("FIRE"), "FIRE_DONE"),
                    move |ctx| {
                        let ran = ran.clone();
                        async move {
                            *ran.lock() = true;
                            ctx.reply(serde_json::Value::Null, EmitOptions::default())
                                .await?;
                            Ok(())
                        }
                    },
                )
                .unwrap();
            router
        }
    })
    .await;

    router
        .dispatch(&connection, r#"{"type":"FIRE","meta":{}}"#)
        .await;

    assert!(*ran.lock());

    let frames = socket.frame_values();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "FIRE_DONE");
    assert!(frames[0]["meta"].get("correlationId").is_none());
}
