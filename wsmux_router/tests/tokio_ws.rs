#![cfg(feature = "tokio-ws")]

//! Loopback test driving the tokio-tungstenite platform adapter with a
//! real client connection.

mod support;

use {
    futures_util::{SinkExt, StreamExt},
    std::sync::Arc,
    support::ping_pong,
    tokio::net::TcpListener,
    tokio_tungstenite::{connect_async, tungstenite::Message},
    wsmux_router::{
        context::EmitOptions,
        platform::{tokio_ws, AuthenticateFn, ConnData},
        router::Router,
    },
};

async fn spawn_server(router: Router, authenticate: Option<AuthenticateFn>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Arc::new(router);

    tokio::spawn(async move {
        tokio_ws::serve(router, listener, authenticate).await.ok();
    });

    format!("ws://{addr}")
}

fn ping_pong_router() -> Router {
    let mut router = Router::new();
    router
        .rpc(ping_pong(), |ctx| async move {
            let text = ctx
                .payload()
                .and_then(|payload| payload.get("text"))
                .and_then(|text| text.as_str())
                .unwrap_or_default()
                .to_owned();

            ctx.reply(
                serde_json::json!({ "text": format!("pong:{text}") }),
                EmitOptions::default(),
            )
            .await?;
            Ok(())
        })
        .unwrap();
    router
}

#[tokio::test]
async fn rpc_round_trip_over_a_real_socket() {
    let url = spawn_server(ping_pong_router(), None).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    ws.send(Message::Text(
        r#"{"type":"PING","meta":{"correlationId":"c1"},"payload":{"text":"hi"}}"#.to_owned(),
    ))
    .await
    .unwrap();

    let response = ws.next().await.unwrap().unwrap();
    let frame: serde_json::Value = serde_json::from_str(response.to_text().unwrap()).unwrap();

    assert_eq!(frame["type"], "PONG");
    assert_eq!(frame["meta"]["correlationId"], "c1");
    assert_eq!(frame["payload"]["text"], "pong:hi");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn unknown_type_over_a_real_socket() {
    let url = spawn_server(Router::new(), None).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    ws.send(Message::Text(r#"{"type":"NOPE","meta":{}}"#.to_owned()))
        .await
        .unwrap();

    let response = ws.next().await.unwrap().unwrap();
    let frame: serde_json::Value = serde_json::from_str(response.to_text().unwrap()).unwrap();

    assert_eq!(frame["type"], "ERROR");
    assert_eq!(frame["payload"]["code"], "UNSUPPORTED_MESSAGE_TYPE");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn authenticate_data_seeds_the_connection() {
    let mut router = Router::new();
    router
        .on(
            wsmux_rpc::schema::MessageSchema::new("WHO"),
            |ctx| async move {
                let role = ctx
                    .data()
                    .get("role")
                    .and_then(|role| role.as_str())
                    .unwrap_or_default()
                    .to_owned();

                let schema = wsmux_rpc::schema::MessageSchema::new("ROLE");
                ctx.send(
                    &schema,
                    serde_json::json!({ "text": role }),
                    EmitOptions::default(),
                )
                .await?;
                Ok(())
            },
        )
        .unwrap();

    let authenticate: AuthenticateFn = Arc::new(|_request| {
        let mut data = ConnData::new();
        data.insert("role".to_owned(), "admin".into());
        Ok(data)
    });

    let url = spawn_server(router, Some(authenticate)).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    ws.send(Message::Text(r#"{"type":"WHO","meta":{}}"#.to_owned()))
        .await
        .unwrap();

    let response = ws.next().await.unwrap().unwrap();
    let frame: serde_json::Value = serde_json::from_str(response.to_text().unwrap()).unwrap();

    assert_eq!(frame["type"], "ROLE");
    assert_eq!(frame["payload"]["text"], "admin");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn rejected_upgrade_never_connects() {
    let authenticate: AuthenticateFn =
        Arc::new(|_request| Err(wsmux_router::platform::AuthRejection::new(401, "no token")));

    let url = spawn_server(Router::new(), Some(authenticate)).await;

    assert!(connect_async(url.as_str()).await.is_err());
}
