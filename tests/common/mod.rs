#![allow(dead_code, reason = "not every suite uses every helper")]

use std::net::SocketAddr;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use axum::{Router, extract::ws::WebSocketUpgrade, routing::get};
use graphql_parser::schema::Document;
use graphql_ws_relay::{DataPayload, Schema, Server, ServerConfig, StartPayload, StdLogger};
use serde_json::Value;
use tokio::net::TcpListener;

pub const SDL: &str = r#"
    schema {
        query: Query
        subscription: Subscription
    }

    type Query {
        version: String
    }

    type Subscription {
        listBuckets: BucketConnection
        total: Int
    }

    type BucketConnection {
        edges: [BucketEdge]
    }

    type BucketEdge {
        node: Bucket
    }

    type Bucket {
        name: String
    }
"#;

/// A stand-in GraphQL engine: every execution returns the current contents
/// of `data` and bumps the call counter.
pub struct TestSchema {
    document: Document<'static, String>,
    data: Mutex<Value>,
    calls: AtomicUsize,
}

impl TestSchema {
    pub fn new(data: Value) -> Arc<Self> {
        Self::with_sdl(SDL, data)
    }

    pub fn with_sdl(sdl: &'static str, data: Value) -> Arc<Self> {
        Arc::new(Self {
            document: graphql_parser::parse_schema::<String>(sdl).unwrap(),
            data: Mutex::new(data),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_data(&self, data: Value) {
        *self.data.lock().unwrap() = data;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Schema for TestSchema {
    fn document(&self) -> &Document<'static, String> {
        &self.document
    }

    async fn execute(&self, _payload: &StartPayload) -> DataPayload {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // suspend like a real engine would, so racing stops and publishes
        // actually interleave with in-flight executions
        tokio::task::yield_now().await;
        DataPayload {
            data: self.data.lock().unwrap().clone(),
            errors: vec![],
        }
    }
}

pub fn new_server(schema: Arc<TestSchema>) -> Server {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = ServerConfig::new(schema);
    config.logger = Some(Arc::new(StdLogger));
    Server::new(config).unwrap()
}

/// Binds an ephemeral port and serves the websocket endpoint at `/graphql`.
pub async fn serve_ws(server: Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route(
        "/graphql",
        get(move |ws: WebSocketUpgrade| {
            let server = server.clone();
            async move { server.upgrade(ws) }
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
