//! HTTP client for the control endpoint.

use std::time::Duration;

use bf_core::{ConnectResponse, FarmStatus, ScaleReport};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Response envelope shared by every control operation.
#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default = "Option::default")]
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

/// Bound on one request, from connecting to the last body byte.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one control endpoint, e.g. `http://10.0.0.1:8080`.
#[derive(Debug, Clone)]
pub struct ControlClient {
    authority: String,
    base_path: String,
    request_timeout: Duration,
}

impl ControlClient {
    pub fn new(endpoint: &str) -> ClientResult<Self> {
        let uri: http::Uri = endpoint
            .parse()
            .map_err(|_| ClientError::InvalidEndpoint(endpoint.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(ClientError::UnsupportedScheme(other.to_string())),
            None => return Err(ClientError::InvalidEndpoint(endpoint.to_string())),
        }
        let Some(authority) = uri.authority() else {
            return Err(ClientError::InvalidEndpoint(endpoint.to_string()));
        };
        let authority = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        Ok(Self {
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn status(&self) -> ClientResult<FarmStatus> {
        self.get("/status").await
    }

    pub async fn connect(
        &self,
        worker_count: Option<u32>,
        force_update: bool,
    ) -> ClientResult<ConnectResponse> {
        let path = match worker_count {
            Some(n) => format!("/connect?up={n}&force_update={force_update}"),
            None => format!("/connect?force_update={force_update}"),
        };
        self.get(&path).await
    }

    pub async fn down(&self, worker_count: u32) -> ClientResult<ScaleReport> {
        self.get(&format!("/down?to={worker_count}")).await
    }

    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> ClientResult<T> {
        tokio::time::timeout(self.request_timeout, self.send(path_and_query))
            .await
            .map_err(|_| ClientError::TimedOut(self.request_timeout))?
    }

    async fn send<T: DeserializeOwned>(&self, path_and_query: &str) -> ClientResult<T> {
        let uri = format!("http://{}{}{}", self.authority, self.base_path, path_and_query);
        let stream = tokio::net::TcpStream::connect(&self.authority).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "control connection closed");
            }
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &self.authority)
            .header("user-agent", concat!("bazel-bf/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();
        debug!(%uri, %status, bytes = body.len(), "control response");

        let envelope: Envelope<T> = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ClientError::Remote {
                    status: status.as_u16(),
                    message: String::from_utf8_lossy(&body).into_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        match (envelope.success, envelope.data) {
            (true, Some(data)) => Ok(data),
            (_, _) => Err(ClientError::Remote {
                status: status.as_u16(),
                message: envelope
                    .error
                    .unwrap_or_else(|| "response carried no data".to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use bf_core::{FarmConfig, ReconcileOutcome, StackBackend, StackRequest};
    use buildfarm_api::{ApiState, build_router};
    use buildfarm_reconcile::StackTemplate;
    use buildfarm_state::StateStore;

    use super::*;

    #[test]
    fn endpoint_parsing() {
        let client = ControlClient::new("http://10.0.0.1:8080/prod/").unwrap();
        assert_eq!(client.authority, "10.0.0.1:8080");
        assert_eq!(client.base_path, "/prod");

        let client = ControlClient::new("http://farm.local").unwrap();
        assert_eq!(client.authority, "farm.local:80");
        assert_eq!(client.base_path, "");

        assert!(matches!(
            ControlClient::new("https://farm.local"),
            Err(ClientError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ControlClient::new("farm.local"),
            Err(ClientError::InvalidEndpoint(_))
        ));
    }

    async fn serve() -> (StateStore, ControlClient) {
        let store = StateStore::open_in_memory().unwrap();
        let mut params = BTreeMap::new();
        params.insert("ServerStack".to_string(), "server".to_string());
        params.insert("WorkersStack".to_string(), "workers".to_string());
        store
            .create_stack(&StackRequest::plain("infra", StackTemplate::Infra.body(), params))
            .unwrap();
        store.settle().unwrap();

        let config = FarmConfig::from_json(
            r#"{
                "region": "eu-west-1",
                "stacks": {"infra": "infra", "server": "server", "workers": "workers"},
                "server_image": "server_image",
                "worker_image": "worker_image",
                "awslogs_region": "eu-west-1",
                "awslogs_group": "buildfarm",
                "crosstool_top": "@toolchains//:toolchain",
                "cluster": "infra-cluster"
            }"#,
        )
        .unwrap();
        let router = build_router(ApiState::new(Arc::new(store.clone()), config));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (store, ControlClient::new(&format!("http://{addr}")).unwrap())
    }

    #[tokio::test]
    async fn status_and_connect_over_http() {
        let (store, client) = serve().await;

        let status = client.status().await.unwrap();
        assert_eq!(status.server_ip, None);

        let response = client.connect(Some(3), false).await.unwrap();
        assert_eq!(response.status.server_status, ReconcileOutcome::Creating);
        assert!(store.describe_stack("server").unwrap().is_some());
    }

    #[tokio::test]
    async fn remote_errors_carry_the_message() {
        let (_store, client) = serve().await;
        let err = client.get::<ScaleReport>("/down?to=x").await.unwrap_err();
        match err {
            ClientError::Remote { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "invalid 'to' parameter: expected an integer");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = ControlClient::new(&format!("http://{addr}"))
            .unwrap()
            .with_request_timeout(Duration::from_millis(50));
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, ClientError::TimedOut(t) if t == Duration::from_millis(50)));
    }
}
