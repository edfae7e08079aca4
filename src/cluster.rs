use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body,
    extract::Request,
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::{
    error::Error,
    log::{Log, Logger},
    schema::{SchemaIndex, Update},
};

/// Something that can dispatch updates to local subscribers and expose the
/// schema those updates are built against. [`Server`] implements this.
///
/// [`Server`]: crate::Server
pub trait Publisher: Send + Sync + 'static {
    /// Dispatches the update to subscribers.
    fn publish(&self, update: &Update);

    /// The analysed schema updates must align with.
    fn schema_index(&self) -> Arc<SchemaIndex>;
}

/// Another node in the cluster that can be told about an update.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Delivers the update to the peer.
    async fn notify(&self, update: &Update) -> Result<(), Error>;
}

/// The source of the current peer list. An implementation backed by service
/// discovery can refresh the list between publishes.
pub trait Peers: Send + Sync {
    /// Every peer that should hear about published updates.
    fn peers(&self) -> Vec<Arc<dyn Peer>>;
}

/// A fixed peer list.
pub struct StaticPeers(pub Vec<Arc<dyn Peer>>);

impl Peers for StaticPeers {
    fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.0.clone()
    }
}

/// Notifies a peer by POSTing the update's JSON form to its notification
/// endpoint.
pub struct HttpPeer {
    /// The HTTP client to send with; share one across peers.
    pub http: reqwest::Client,

    /// Full URL of the peer's notification endpoint.
    pub url: String,

    /// Extra headers, typically carrying authentication.
    pub header: Option<reqwest::header::HeaderMap>,
}

#[async_trait]
impl Peer for HttpPeer {
    async fn notify(&self, update: &Update) -> Result<(), Error> {
        let mut request = self.http.post(&self.url);
        if let Some(header) = &self.header {
            request = request.headers(header.clone());
        }
        let response = request
            .json(update)
            .send()
            .await
            .map_err(|error| Error::Transport(format!("failed to notify peer: {error}")))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::Transport(format!(
                "peer responded to notification with non-200 status code: {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Settings for [`Cluster::new`].
pub struct ClusterConfig {
    /// The local publisher the cluster wraps.
    pub publisher: Arc<dyn Publisher>,

    /// Where peer notifications go.
    pub peers: Arc<dyn Peers>,

    /// Troubleshooting sink. `None` discards all logs.
    pub logger: Option<Arc<dyn Logger>>,
}

/// Fans published updates out to peer nodes over HTTP and accepts theirs, so
/// a horizontally scaled service stays consistent.
///
/// Peer notification is fire-and-forget: a failed delivery is logged and
/// never retried. Deployments that need at-least-once delivery should put a
/// durable queue behind their [`Peers`] implementation.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    core: Arc<dyn Publisher>,
    peers: Arc<dyn Peers>,
    log: Log,
    max_payload_length: usize,
}

impl Cluster {
    /// Wraps a publisher. The serialized length of an all-false update of the
    /// local schema, times 1024, becomes the acceptance bound for incoming
    /// notification bodies.
    pub fn new(config: ClusterConfig) -> Result<Self, Error> {
        let empty = config
            .publisher
            .schema_index()
            .new_update(std::iter::empty::<&str>())?;
        let encoded = serde_json::to_vec(&empty).map_err(|error| {
            Error::Protocol(format!("failed to estimate maximum update payload size: {error}"))
        })?;
        Ok(Self {
            inner: Arc::new(ClusterInner {
                core: config.publisher,
                peers: config.peers,
                log: Log::new(config.logger),
                max_payload_length: 1024 * encoded.len(),
            }),
        })
    }

    /// Dispatches the update locally and notifies every peer, all
    /// concurrently. Must be called within a Tokio runtime.
    pub fn publish(&self, update: &Update) {
        self.inner.log.info("Publishing update to cluster");

        let core = self.inner.core.clone();
        let local = update.clone();
        tokio::spawn(async move {
            core.publish(&local);
        });

        for peer in self.inner.peers.peers() {
            let update = update.clone();
            let log = self.inner.log.clone();
            tokio::spawn(async move {
                log.info("Pushing update to a peer");
                match peer.notify(&update).await {
                    Ok(()) => log.info("Pushed an update to a peer"),
                    Err(error) => log.error(&error.to_string()),
                }
            });
        }
    }

    /// Serves the peer notification endpoint.
    ///
    /// Expects a `POST` with an `application/json` body that decodes into an
    /// update of the local schema; anything else draws a terse 4xx. Accepted
    /// updates are republished locally only — a cluster never re-forwards
    /// updates it received from a peer.
    ///
    /// ```ignore
    /// let app = Router::new().route(
    ///     "/cluster",
    ///     any(move |request: Request| async move { cluster.handle_notification(request).await }),
    /// );
    /// ```
    pub async fn handle_notification(&self, request: Request) -> Response {
        if request.method() != Method::POST {
            return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
        }
        if request.uri().query().is_some() {
            return (StatusCode::BAD_REQUEST, "unacceptable url query parameters").into_response();
        }
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        if content_type != Some("application/json") {
            return (
                StatusCode::BAD_REQUEST,
                "'Content-Type' header must be set to 'application/json'",
            )
                .into_response();
        }

        let payload = match body::to_bytes(request.into_body(), self.inner.max_payload_length).await
        {
            Ok(payload) => payload,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    "request payload rejected for being oversize",
                )
                    .into_response();
            }
        };
        if payload.is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                "'Content-Length' header must be set and cannot be zero",
            )
                .into_response();
        }

        let update = match self.inner.core.schema_index().update_from_json(&payload) {
            Ok(update) => update,
            Err(error) => return (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
        };

        self.inner.log.info("Received update from a peer");
        let core = self.inner.core.clone();
        tokio::spawn(async move {
            core.publish(&update);
        });
        StatusCode::OK.into_response()
    }
}
