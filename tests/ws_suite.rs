mod common;

use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use graphql_ws_relay::{
    Client, ClientConfig, Error, QueryConfig, Server, ServerConfig, SubscriptionConfig,
};
use serde_json::{Map, Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        handshake::server::{Request, Response},
        http::HeaderValue,
    },
};

use common::{TestSchema, new_server, serve_ws};

const WAIT: Duration = Duration::from_secs(5);

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr) -> Client {
    Client::connect(ClientConfig::new(addr.to_string(), "/graphql"))
        .await
        .unwrap()
}

async fn raw_connect(addr: SocketAddr) -> RawSocket {
    let mut request = format!("ws://{addr}/graphql").into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("graphql-ws"),
    );
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

async fn send_json(ws: &mut RawSocket, value: Value) {
    ws.send(tungstenite::Message::text(value.to_string()))
        .await
        .unwrap();
}

async fn recv_json(ws: &mut RawSocket) -> Value {
    loop {
        let message = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let tungstenite::Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_query_happy_path() -> Result<()> {
    let schema = TestSchema::new(json!({"version": "1.0"}));
    let addr = serve_ws(new_server(schema.clone())).await;
    let client = connect(addr).await;

    let result = timeout(
        WAIT,
        client.query(QueryConfig {
            query: "{ version }".into(),
            ..QueryConfig::default()
        }),
    )
    .await??;
    assert_eq!(result.data, json!({"version": "1.0"}));
    assert!(result.errors.is_empty());
    assert_eq!(schema.calls(), 1);

    timeout(WAIT, client.shutdown()).await??;
    Ok(())
}

#[tokio::test]
async fn test_connect_on_a_caller_supplied_stream() -> Result<()> {
    let schema = TestSchema::new(json!({"version": "2.0"}));
    let addr = serve_ws(new_server(schema)).await;

    let stream = TcpStream::connect(addr).await?;
    let client =
        Client::connect_on(ClientConfig::new(addr.to_string(), "/graphql"), stream).await?;

    let result = timeout(
        WAIT,
        client.query(QueryConfig {
            query: "{ version }".into(),
            ..QueryConfig::default()
        }),
    )
    .await??;
    assert_eq!(result.data, json!({"version": "2.0"}));

    timeout(WAIT, client.shutdown()).await??;
    Ok(())
}

#[tokio::test]
async fn test_wrong_operation_kind_is_rejected_client_side() -> Result<()> {
    let schema = TestSchema::new(json!({}));
    let addr = serve_ws(new_server(schema.clone())).await;
    let client = connect(addr).await;

    let err = client
        .query(QueryConfig {
            query: "subscription { total }".into(),
            ..QueryConfig::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
    // nothing reached the executor
    assert_eq!(schema.calls(), 0);

    timeout(WAIT, client.shutdown()).await??;
    Ok(())
}

#[tokio::test]
async fn test_subscription_reexecutes_on_overlapping_publish() -> Result<()> {
    let schema = TestSchema::new(json!({"listBuckets": {"edges": []}}));
    let server = new_server(schema.clone());
    let addr = serve_ws(server.clone()).await;
    let client = connect(addr).await;

    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let sub = client.subscription(SubscriptionConfig {
        query: "subscription { listBuckets { edges { node { name } } } }".into(),
        variables: Map::new(),
        operation_name: None,
        data_callback: Box::new(move |payload| {
            let _ = data_tx.send(payload);
        }),
        error_callback: Box::new(move |error| {
            let _ = error_tx.send(error);
        }),
    })?;

    let first = timeout(WAIT, data_rx.recv()).await?.unwrap();
    assert_eq!(first.data, json!({"listBuckets": {"edges": []}}));
    sleep(Duration::from_millis(100)).await;

    // a publish that overlaps the subscribed field set triggers a re-execute
    schema.set_data(json!({"listBuckets": {"edges": [{"node": {"name": "a"}}]}}));
    let update = server.schema_index().update_from_object("Bucket")?;
    server.publish(&update);
    let second = timeout(WAIT, data_rx.recv()).await?.unwrap();
    assert_eq!(
        second.data,
        json!({"listBuckets": {"edges": [{"node": {"name": "a"}}]}}),
    );
    assert_eq!(schema.calls(), 2);

    // a publish producing an identical result executes but is not delivered
    server.publish(&update);
    sleep(Duration::from_millis(300)).await;
    assert!(data_rx.try_recv().is_err());
    assert_eq!(schema.calls(), 3);

    // a non-overlapping publish does not even execute
    server.publish(&server.schema_index().new_update(["total"])?);
    sleep(Duration::from_millis(200)).await;
    assert!(data_rx.try_recv().is_err());
    assert_eq!(schema.calls(), 3);

    sub.stop();
    timeout(WAIT, sub.wait_until_finished()).await??;
    assert!(error_rx.try_recv().is_err());
    timeout(WAIT, client.shutdown()).await??;
    Ok(())
}

#[tokio::test]
async fn test_polling_reexecutes_without_a_publish() -> Result<()> {
    let schema = TestSchema::new(json!({"listBuckets": {"edges": []}}));
    let mut config = ServerConfig::new(schema.clone());
    config.polling_interval = Duration::from_millis(100);
    let server = Server::new(config).unwrap();
    let addr = serve_ws(server).await;
    let client = connect(addr).await;

    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    let sub = client.subscription(SubscriptionConfig {
        query: "subscription { listBuckets { edges { node { name } } } }".into(),
        variables: Map::new(),
        operation_name: None,
        data_callback: Box::new(move |payload| {
            let _ = data_tx.send(payload);
        }),
        error_callback: Box::new(|_| {}),
    })?;
    timeout(WAIT, data_rx.recv()).await?.unwrap();

    // no publish at all: the poll interval picks the change up by itself
    schema.set_data(json!({"listBuckets": {"edges": [{"node": {"name": "polled"}}]}}));
    let second = timeout(WAIT, data_rx.recv()).await?.unwrap();
    assert_eq!(
        second.data,
        json!({"listBuckets": {"edges": [{"node": {"name": "polled"}}]}}),
    );

    sub.stop();
    timeout(WAIT, sub.wait_until_finished()).await??;
    timeout(WAIT, client.shutdown()).await??;
    Ok(())
}

#[tokio::test]
async fn test_stop_race_delivers_nothing_after_wait_returns() -> Result<()> {
    let schema = TestSchema::new(json!({"listBuckets": {"edges": []}}));
    let server = new_server(schema.clone());
    let addr = serve_ws(server.clone()).await;
    let client = connect(addr).await;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let sub = client.subscription(SubscriptionConfig {
        query: "subscription { listBuckets { edges { node { name } } } }".into(),
        variables: Map::new(),
        operation_name: None,
        data_callback: Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        error_callback: Box::new(|_| {}),
    })?;

    timeout(WAIT, async {
        while received.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    sleep(Duration::from_millis(100)).await;

    // keep publishing fresh results while the stop goes through
    let update = server.schema_index().update_from_object("Bucket")?;
    let publisher = tokio::spawn({
        let server = server.clone();
        let schema = schema.clone();
        let update = update.clone();
        async move {
            for i in 0..50 {
                schema.set_data(
                    json!({"listBuckets": {"edges": [{"node": {"name": format!("bucket-{i}")}}]}}),
                );
                server.publish(&update);
                sleep(Duration::from_millis(5)).await;
            }
        }
    });

    sleep(Duration::from_millis(50)).await;
    sub.stop();
    timeout(WAIT, sub.wait_until_finished()).await??;
    let settled = received.load(Ordering::SeqCst);

    let _ = publisher.await;
    schema.set_data(json!({"listBuckets": {"edges": [{"node": {"name": "after"}}]}}));
    server.publish(&update);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(received.load(Ordering::SeqCst), settled);

    timeout(WAIT, client.shutdown()).await??;
    Ok(())
}

#[tokio::test]
async fn test_graceful_shutdown() -> Result<()> {
    let schema = TestSchema::new(json!({"listBuckets": {"edges": []}}));
    let addr = serve_ws(new_server(schema)).await;
    let client = connect(addr).await;

    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    let sub = client.subscription(SubscriptionConfig {
        query: "subscription { listBuckets { edges { node { name } } } }".into(),
        variables: Map::new(),
        operation_name: None,
        data_callback: Box::new(move |payload| {
            let _ = data_tx.send(payload);
        }),
        error_callback: Box::new(|_| {}),
    })?;
    timeout(WAIT, data_rx.recv()).await?.unwrap();

    timeout(WAIT, client.shutdown()).await??;

    // the subscription was completed during shutdown
    timeout(WAIT, sub.wait_until_finished()).await??;

    // and the client no longer accepts work
    assert!(matches!(
        client
            .query(QueryConfig {
                query: "{ version }".into(),
                ..QueryConfig::default()
            })
            .await,
        Err(Error::AlreadyShutdown),
    ));
    assert!(matches!(client.shutdown().await, Err(Error::AlreadyShutdown)));
    Ok(())
}

#[tokio::test]
async fn test_keep_alive_starvation_is_fatal() -> Result<()> {
    let addr = starving_keep_alive_server().await;
    let mut config = ClientConfig::new(addr.to_string(), "/graphql");
    config.read_timeout = Duration::from_millis(300);
    let client = Client::connect(config).await?;

    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    let sub = client.subscription(SubscriptionConfig {
        query: "subscription { total }".into(),
        variables: Map::new(),
        operation_name: None,
        data_callback: Box::new(move |payload| {
            let _ = data_tx.send(payload);
        }),
        error_callback: Box::new(|_| {}),
    })?;

    let err = timeout(WAIT, sub.wait_until_finished()).await?.unwrap_err();
    assert!(
        matches!(&err, Error::Transport(message) if message.contains("read deadline exceeded")),
        "{err}",
    );
    assert!(data_rx.try_recv().is_err());

    // future calls surface the recorded error
    let err = client
        .query(QueryConfig {
            query: "{ version }".into(),
            ..QueryConfig::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_client_rejects_missing_subprotocol() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // accept the upgrade without echoing the requested sub-protocol
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |_request: &Request, response: Response| Ok(response),
        )
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    });

    let err = Client::connect(ClientConfig::new(addr.to_string(), "/graphql"))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::Transport(message) if message.contains("subprotocol")),
        "{err}",
    );
    Ok(())
}

#[tokio::test]
async fn test_start_with_extensions_is_rejected_operation_scoped() {
    let schema = TestSchema::new(json!({}));
    let addr = serve_ws(new_server(schema)).await;
    let mut ws = raw_connect(addr).await;

    send_json(&mut ws, json!({"type": "connection_init", "payload": {}})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "connection_ack"}));

    send_json(
        &mut ws,
        json!({"type": "start", "id": "op1", "payload": {
            "query": "subscription { listBuckets { edges { node { name } } } }",
            "extensions": {"persisted": true},
        }}),
    )
    .await;
    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["id"], "op1");
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "complete", "id": "op1"}),
    );

    // the connection survives and still serves operations
    send_json(
        &mut ws,
        json!({"type": "start", "id": "op2", "payload": {"query": "{ version }"}}),
    )
    .await;
    let data = recv_json(&mut ws).await;
    assert_eq!(data["type"], "data");
    assert_eq!(data["id"], "op2");
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "complete", "id": "op2"}),
    );
}

#[tokio::test]
async fn test_unparseable_query_is_rejected_operation_scoped() {
    let schema = TestSchema::new(json!({}));
    let addr = serve_ws(new_server(schema)).await;
    let mut ws = raw_connect(addr).await;

    send_json(&mut ws, json!({"type": "connection_init"})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "connection_ack"}));

    send_json(
        &mut ws,
        json!({"type": "start", "id": "q1", "payload": {"query": "not graphql"}}),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["type"], "error");
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"type": "complete", "id": "q1"}),
    );
}

#[tokio::test]
async fn test_unsupported_message_type_draws_connection_error() {
    let schema = TestSchema::new(json!({}));
    let addr = serve_ws(new_server(schema)).await;
    let mut ws = raw_connect(addr).await;

    send_json(&mut ws, json!({"type": "connection_init"})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "connection_ack"}));

    send_json(&mut ws, json!({"type": "bogus"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "connection_error");

    // the connection was not closed
    send_json(
        &mut ws,
        json!({"type": "start", "id": "q1", "payload": {"query": "{ version }"}}),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["type"], "data");
}

#[tokio::test]
async fn test_first_message_must_be_connection_init() {
    let schema = TestSchema::new(json!({}));
    let addr = serve_ws(new_server(schema)).await;
    let mut ws = raw_connect(addr).await;

    send_json(
        &mut ws,
        json!({"type": "start", "id": "q1", "payload": {"query": "{ version }"}}),
    )
    .await;

    // the server closes without ever acknowledging
    let saw_ack = timeout(WAIT, async {
        let mut saw_ack = false;
        while let Some(Ok(message)) = ws.next().await {
            match message {
                tungstenite::Message::Text(text) => {
                    if text.as_str().contains("connection_ack") {
                        saw_ack = true;
                    }
                }
                tungstenite::Message::Close(_) => break,
                _ => {}
            }
        }
        saw_ack
    })
    .await
    .unwrap();
    assert!(!saw_ack);
}

#[tokio::test]
async fn test_server_drops_connections_without_the_subprotocol() {
    let schema = TestSchema::new(json!({}));
    let addr = serve_ws(new_server(schema)).await;

    let request = format!("ws://{addr}/graphql").into_client_request().unwrap();
    let (mut ws, response) = connect_async(request).await.unwrap();
    assert!(response.headers().get("Sec-WebSocket-Protocol").is_none());

    // the server may already have dropped the socket; the send is best-effort
    let _ = ws
        .send(tungstenite::Message::text(
            json!({"type": "connection_init"}).to_string(),
        ))
        .await;
    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) => break true,
                Some(Ok(tungstenite::Message::Close(_))) => break true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}

async fn starving_keep_alive_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |_request: &Request, mut response: Response| {
                response.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static("graphql-ws"),
                );
                Ok(response)
            },
        )
        .await
        .unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if let tungstenite::Message::Text(text) = message {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["type"] == "connection_init" {
                    ws.send(tungstenite::Message::text(r#"{"type":"connection_ack"}"#))
                        .await
                        .unwrap();
                    ws.send(tungstenite::Message::text(r#"{"type":"ka"}"#))
                        .await
                        .unwrap();
                    // starve the client: never write again
                    sleep(Duration::from_secs(30)).await;
                    return;
                }
            }
        }
    });
    addr
}
