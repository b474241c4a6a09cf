//! Coordinator API over HTTP.
//!
//! JSON requests with a bearer token from the [`TokenCache`]. A `401` drops
//! the cached token and the request is sent once more with a fresh one.

use std::sync::Arc;

use nerd_auth::TokenCache;
use nerd_protocol::constants::{dataset_path, datasets_path};
use nerd_protocol::{
    CreateDatasetRequest, CreateDatasetResponse, Dataset, HeartbeatResponse,
    UploadSuccessResponse,
};
use nerd_transfer::TransferError;
use nerd_transfer::coordinator::{Coordinator, CoordinatorFuture};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::ClientError;

/// Characters escaped in a path segment; unreserved ones stay readable.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Empty JSON object sent as the body of action endpoints.
#[derive(Serialize)]
struct Empty {}

/// Coordinator client.
pub struct HttpCoordinator {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenCache>,
}

impl HttpCoordinator {
    pub fn new(base_url: impl Into<String>, tokens: Arc<TokenCache>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    pub async fn create_dataset(
        &self,
        project_id: &str,
        tag: Option<&str>,
    ) -> Result<CreateDatasetResponse, ClientError> {
        let body = CreateDatasetRequest {
            tag: tag.map(str::to_string),
        };
        self.send(Method::POST, &datasets_path(&segment(project_id)), Some(&body))
            .await
    }

    pub async fn describe_dataset(
        &self,
        project_id: &str,
        dataset_id: &str,
    ) -> Result<Dataset, ClientError> {
        self.send::<Empty, _>(Method::GET, &dataset_url(project_id, dataset_id), None)
            .await
    }

    pub async fn send_upload_heartbeat(
        &self,
        project_id: &str,
        dataset_id: &str,
    ) -> Result<HeartbeatResponse, ClientError> {
        let path = format!("{}/heartbeats", dataset_url(project_id, dataset_id));
        self.send(Method::POST, &path, Some(&Empty {})).await
    }

    pub async fn send_upload_success(
        &self,
        project_id: &str,
        dataset_id: &str,
    ) -> Result<UploadSuccessResponse, ClientError> {
        let path = format!("{}/success", dataset_url(project_id, dataset_id));
        self.send(Method::POST, &path, Some(&Empty {})).await
    }

    async fn send<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut refreshed = false;
        loop {
            let token = self.tokens.get().await?;
            let mut req = self.http.request(method.clone(), &url).bearer_auth(&token);
            if let Some(body) = body {
                req = req.json(body);
            }
            let resp = req.send().await?;
            let status = resp.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                debug!(%url, "token rejected, refreshing");
                self.tokens.invalidate().await;
                refreshed = true;
                continue;
            }
            if status.as_u16() >= 400 {
                let body = resp.text().await.unwrap_or_default();
                return Err(ClientError::from_response(status.as_u16(), &body));
            }

            let bytes = resp.bytes().await?;
            debug!(%method, %url, status = status.as_u16(), "coordinator call");
            let bytes: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
            return Ok(serde_json::from_slice(bytes)?);
        }
    }
}

fn segment(s: &str) -> String {
    utf8_percent_encode(s, SEGMENT).to_string()
}

fn dataset_url(project_id: &str, dataset_id: &str) -> String {
    dataset_path(&segment(project_id), &segment(dataset_id))
}

impl Coordinator for HttpCoordinator {
    fn create_dataset<'a>(
        &'a self,
        project_id: &'a str,
        tag: Option<&'a str>,
    ) -> CoordinatorFuture<'a, CreateDatasetResponse> {
        Box::pin(async move {
            HttpCoordinator::create_dataset(self, project_id, tag)
                .await
                .map_err(TransferError::coordinator)
        })
    }

    fn describe_dataset<'a>(
        &'a self,
        project_id: &'a str,
        dataset_id: &'a str,
    ) -> CoordinatorFuture<'a, Dataset> {
        Box::pin(async move {
            HttpCoordinator::describe_dataset(self, project_id, dataset_id)
                .await
                .map_err(TransferError::coordinator)
        })
    }

    fn send_upload_heartbeat<'a>(
        &'a self,
        project_id: &'a str,
        dataset_id: &'a str,
    ) -> CoordinatorFuture<'a, HeartbeatResponse> {
        Box::pin(async move {
            HttpCoordinator::send_upload_heartbeat(self, project_id, dataset_id)
                .await
                .map_err(TransferError::coordinator)
        })
    }

    fn send_upload_success<'a>(
        &'a self,
        project_id: &'a str,
        dataset_id: &'a str,
    ) -> CoordinatorFuture<'a, ()> {
        Box::pin(async move {
            HttpCoordinator::send_upload_success(self, project_id, dataset_id)
                .await
                .map(|_| ())
                .map_err(TransferError::coordinator)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nerd_auth::StaticProvider;
    use nerd_protocol::UploadStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// A request as seen by the mock server.
    #[derive(Debug)]
    pub(crate) struct Seen {
        pub(crate) head: String,
        pub(crate) body: String,
    }

    impl Seen {
        pub(crate) fn request_line(&self) -> &str {
            self.head.lines().next().unwrap_or_default()
        }

        pub(crate) fn header(&self, name: &str) -> Option<&str> {
            self.head.lines().skip(1).find_map(|line| {
                let (k, v) = line.split_once(':')?;
                k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
            })
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Seen {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let seen = Seen {
            head,
            body: String::new(),
        };
        let len: usize = seen
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while buf.len() < head_end + len {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed before sending body");
            buf.extend_from_slice(&chunk[..n]);
        }
        Seen {
            body: String::from_utf8_lossy(&buf[head_end..head_end + len]).into_owned(),
            ..seen
        }
    }

    /// Serves one connection per canned `(status, body)` response, in order,
    /// and returns what each request looked like.
    pub(crate) async fn serve(
        responses: Vec<(u16, String)>,
    ) -> (String, JoinHandle<Vec<Seen>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                seen.push(read_request(&mut stream).await);
                let resp = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(resp.as_bytes()).await.unwrap();
                let _ = stream.shutdown().await;
            }
            seen
        });
        (url, handle)
    }

    pub(crate) fn tokens(token: &str) -> Arc<TokenCache> {
        Arc::new(TokenCache::new(Arc::new(StaticProvider::new(token))))
    }

    pub(crate) fn dataset_json(status: &str) -> String {
        format!(
            r#"{{"project_id":"p 1","dataset_id":"ds-1","bucket":"b","dataset_root":"p/ds-1","project_root":"p","upload_expire":1700000000,"upload_status":"{status}"}}"#
        )
    }

    #[tokio::test]
    async fn create_sends_tag_and_bearer_token() {
        let body = dataset_json("CREATED").replace('}', r#","heartbeat_interval":15}"#);
        let (url, server) = serve(vec![(201, body)]).await;

        let coord = HttpCoordinator::new(format!("{url}/"), tokens("tok")).unwrap();
        let created = coord.create_dataset("p 1", Some("v1")).await.unwrap();

        assert_eq!(created.dataset.dataset_id, "ds-1");
        assert_eq!(created.heartbeat_interval().as_secs(), 15);

        let seen = server.await.unwrap();
        assert_eq!(seen[0].request_line(), "POST /projects/p%201/datasets HTTP/1.1");
        assert_eq!(seen[0].header("authorization"), Some("Bearer tok"));
        assert_eq!(seen[0].body, r#"{"tag":"v1"}"#);
    }

    #[tokio::test]
    async fn describe_and_actions_hit_dataset_paths() {
        let (url, server) = serve(vec![
            (200, dataset_json("UPLOADING")),
            (200, r#"{"has_expired":true}"#.to_string()),
            (200, String::new()),
        ])
        .await;
        let coord = HttpCoordinator::new(url, tokens("tok")).unwrap();

        let ds = coord.describe_dataset("p", "ds-1").await.unwrap();
        assert_eq!(ds.upload_status, UploadStatus::Uploading);
        assert!(coord.send_upload_heartbeat("p", "ds-1").await.unwrap().has_expired);
        coord.send_upload_success("p", "ds-1").await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen[0].request_line(), "GET /projects/p/datasets/ds-1 HTTP/1.1");
        assert_eq!(
            seen[1].request_line(),
            "POST /projects/p/datasets/ds-1/heartbeats HTTP/1.1"
        );
        assert_eq!(
            seen[2].request_line(),
            "POST /projects/p/datasets/ds-1/success HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn error_status_is_decoded() {
        let (url, server) = serve(vec![(
            404,
            r#"{"message":"dataset not found","retry":false}"#.to_string(),
        )])
        .await;
        let coord = HttpCoordinator::new(url, tokens("tok")).unwrap();

        let err = coord.describe_dataset("p", "gone").await.unwrap_err();
        match err {
            ClientError::Http {
                status_code,
                message,
                ..
            } => {
                assert_eq!(status_code, 404);
                assert_eq!(message, "dataset not found");
            }
            other => panic!("unexpected: {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_is_retried_once() {
        let (url, server) = serve(vec![
            (401, r#"{"message":"token expired"}"#.to_string()),
            (401, r#"{"message":"token expired"}"#.to_string()),
        ])
        .await;
        let coord = HttpCoordinator::new(url, tokens("tok")).unwrap();

        let err = coord.describe_dataset("p", "d").await.unwrap_err();
        assert!(matches!(err, ClientError::Http { status_code: 401, .. }));
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn trait_errors_wrap_client_errors() {
        let busy = r#"{"message":"busy","retry":true}"#.to_string();
        let (url, server) = serve(vec![(503, busy)]).await;
        let coord = HttpCoordinator::new(url, tokens("tok")).unwrap();
        let coord: &dyn Coordinator = &coord;

        let err = coord.send_upload_heartbeat("p", "d").await.unwrap_err();
        let TransferError::Coordinator(source) = err else {
            panic!("unexpected: {err:?}");
        };
        let client = source.downcast_ref::<ClientError>().unwrap();
        assert!(client.is_retryable());
        server.await.unwrap();
    }
}
