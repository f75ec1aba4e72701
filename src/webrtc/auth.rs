//! Director authentication
//!
//! Exchanges a publishing token and stream name for a short-lived JWT and
//! the signaling endpoint to connect to.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::signaling::{DirectorRequest, DirectorResponse};
use crate::error::{PublisherError, Result};

/// Signaling endpoint granted by the director
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishEndpoint {
    pub jwt: String,
    pub ws_url: String,
}

/// Publish authorization service
#[async_trait]
pub trait DirectorClient: Send + Sync {
    /// Authorize publishing `stream_name`
    ///
    /// Rejections return [`PublisherError::Auth`] with the HTTP status and body.
    async fn authenticate(&self, url: &str, stream_name: &str, token: &str) -> Result<PublishEndpoint>;
}

/// HTTP director client
pub struct HttpDirectorClient {
    client: reqwest::Client,
}

impl HttpDirectorClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpDirectorClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectorClient for HttpDirectorClient {
    async fn authenticate(&self, url: &str, stream_name: &str, token: &str) -> Result<PublishEndpoint> {
        debug!("Director request for stream '{}' to {}", stream_name, url);
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&DirectorRequest {
                stream_name: stream_name.to_string(),
            })
            .send()
            .await
            .map_err(|e| PublisherError::Transport(format!("director request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PublisherError::Transport(format!("director response unreadable: {}", e)))?;

        if status != 200 {
            warn!("Director rejected publish ({}): {}", status, body);
            return Err(PublisherError::Auth { status, message: body });
        }

        let endpoint = parse_director_body(&body)?;
        info!("Director granted endpoint {}", endpoint.ws_url);
        Ok(endpoint)
    }
}

/// Extract the JWT and first signaling URL from a 200 body
pub fn parse_director_body(body: &str) -> Result<PublishEndpoint> {
    let response: DirectorResponse = serde_json::from_str(body)?;
    let ws_url = response
        .data
        .urls
        .into_iter()
        .next()
        .ok_or_else(|| PublisherError::Signaling("director returned no signaling urls".to_string()))?;
    Ok(PublishEndpoint {
        jwt: response.data.jwt,
        ws_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Request as seen by the director
    struct CapturedRequest {
        head: String,
        body: serde_json::Value,
    }

    /// Serve one HTTP response on localhost; yields the request it received
    async fn director(status: u16, body: &'static str) -> (String, oneshot::Receiver<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/director/publish", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let head_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .map(|v| v.trim().parse::<usize>().unwrap())
                .unwrap_or(0);
            while buf.len() < head_end + length {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending body");
                buf.extend_from_slice(&chunk[..n]);
            }
            let request_body = serde_json::from_slice(&buf[head_end..head_end + length]).unwrap();

            let response = format!(
                "HTTP/1.1 {} Director\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            let _ = tx.send(CapturedRequest {
                head,
                body: request_body,
            });
        });
        (url, rx)
    }

    #[tokio::test]
    async fn test_http_grant() {
        let (url, request) = director(200, r#"{"data":{"jwt":"abc","urls":["wss://x/y"]}}"#).await;
        let endpoint = HttpDirectorClient::new()
            .authenticate(&url, "scene", "pub-token")
            .await
            .unwrap();
        assert_eq!(
            endpoint,
            PublishEndpoint {
                jwt: "abc".to_string(),
                ws_url: "wss://x/y".to_string(),
            }
        );

        let request = request.await.unwrap();
        assert!(request.head.starts_with("post /api/director/publish http/1.1"));
        assert!(request.head.contains("authorization: bearer pub-token"));
        assert!(request.head.contains("content-type: application/json"));
        assert_eq!(request.body, serde_json::json!({ "streamName": "scene" }));
    }

    #[tokio::test]
    async fn test_http_rejection_keeps_status_and_body() {
        let (url, request) = director(403, "denied").await;
        let err = HttpDirectorClient::new()
            .authenticate(&url, "scene", "wrong")
            .await
            .unwrap_err();
        match err {
            PublisherError::Auth { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "denied");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(request.await.unwrap().head.contains("authorization: bearer wrong"));
    }

    #[tokio::test]
    async fn test_http_unreachable_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/publish", listener.local_addr().unwrap());
        drop(listener);
        let err = HttpDirectorClient::new()
            .authenticate(&url, "scene", "pub-token")
            .await
            .unwrap_err();
        assert!(matches!(err, PublisherError::Transport(_)));
    }

    #[test]
    fn test_first_url_used() {
        let endpoint =
            parse_director_body(r#"{"data":{"jwt":"abc","urls":["wss://x/y","wss://other"]}}"#).unwrap();
        assert_eq!(
            endpoint,
            PublishEndpoint {
                jwt: "abc".to_string(),
                ws_url: "wss://x/y".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_urls() {
        assert!(matches!(
            parse_director_body(r#"{"data":{"jwt":"abc","urls":[]}}"#),
            Err(PublisherError::Signaling(_))
        ));
        assert!(matches!(
            parse_director_body(r#"{"data":{}}"#),
            Err(PublisherError::Json(_))
        ));
    }
}
