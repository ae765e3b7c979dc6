use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::platform::{
    CreateSandboxRequest, CreatedSandbox, ExecFrame, ExecOutput, ExecRequest, ExecStream,
    FileEntry, PlatformError, SandboxAuth, SandboxPlatform,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_ID_HEADER: &str = "x-janus-request-id";

/// REST client for the external sandbox platform.
#[derive(Debug, Clone)]
pub struct HttpSandboxPlatform {
    client: Client,
    base_url: Url,
    service_token: Option<String>,
}

#[derive(Serialize)]
struct ExecBody<'a> {
    #[serde(flatten)]
    request: &'a ExecRequest,
    stream: bool,
}

#[derive(Serialize)]
struct ExposePortBody {
    port: u16,
}

#[derive(Deserialize)]
struct ExposePortResponse {
    url: String,
}

#[derive(Deserialize)]
struct FileListResponse {
    #[serde(default)]
    files: Vec<FileEntry>,
}

impl HttpSandboxPlatform {
    pub fn new(base_url: &str, service_token: Option<String>) -> Result<Self, PlatformError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| PlatformError::InvalidResponse(format!("invalid base url: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| PlatformError::Unreachable(format!("failed to build client: {err}")))?;
        Ok(Self {
            client,
            base_url,
            service_token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, PlatformError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PlatformError::InvalidResponse("base url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authed(&self, builder: RequestBuilder, auth: &SandboxAuth) -> RequestBuilder {
        builder
            .bearer_auth(&auth.bearer)
            .header(REQUEST_ID_HEADER, &auth.request_id)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, PlatformError> {
        let response = builder
            .send()
            .await
            .map_err(|err| PlatformError::Unreachable(err.to_string()))?;
        let status = response.status();
        debug!(status = %status, url = %response.url(), "sandbox platform response");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(PlatformError::NotFound(body));
        }
        Err(PlatformError::Status {
            status: status.as_u16(),
            message: body,
        })
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, PlatformError> {
        response
            .json::<T>()
            .await
            .map_err(|err| PlatformError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl SandboxPlatform for HttpSandboxPlatform {
    async fn create(
        &self,
        auth: &SandboxAuth,
        request: &CreateSandboxRequest,
    ) -> Result<CreatedSandbox, PlatformError> {
        let url = self.endpoint(&["sandboxes"])?;
        let response = self
            .send(self.authed(self.client.post(url), auth).json(request))
            .await?;
        Self::json(response).await
    }

    async fn exec(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, PlatformError> {
        let url = self.endpoint(&["sandboxes", sandbox_id, "exec"])?;
        let body = ExecBody {
            request,
            stream: false,
        };
        let response = self
            .send(self.authed(self.client.post(url), auth).json(&body))
            .await?;
        Self::json(response).await
    }

    async fn exec_stream(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecStream, PlatformError> {
        let url = self.endpoint(&["sandboxes", sandbox_id, "exec"])?;
        let body = ExecBody {
            request,
            stream: true,
        };
        let response = self
            .send(self.authed(self.client.post(url), auth).json(&body))
            .await?;
        Ok(frame_stream(response))
    }

    async fn kill_exec(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        exec_id: &str,
    ) -> Result<(), PlatformError> {
        let url = self.endpoint(&["sandboxes", sandbox_id, "exec", exec_id, "kill"])?;
        self.send(self.authed(self.client.post(url), auth)).await?;
        Ok(())
    }

    async fn write_file(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), PlatformError> {
        let mut url = self.endpoint(&["sandboxes", sandbox_id, "files"])?;
        url.query_pairs_mut().append_pair("path", path);
        let builder = self
            .authed(self.client.put(url), auth)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(contents.to_vec());
        self.send(builder).await?;
        Ok(())
    }

    async fn read_file(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<u8>, PlatformError> {
        let mut url = self.endpoint(&["sandboxes", sandbox_id, "files"])?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.send(self.authed(self.client.get(url), auth)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| PlatformError::Unreachable(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn list_files(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        dir: &str,
    ) -> Result<Vec<FileEntry>, PlatformError> {
        let mut url = self.endpoint(&["sandboxes", sandbox_id, "files", "list"])?;
        url.query_pairs_mut().append_pair("dir", dir);
        let response = self.send(self.authed(self.client.get(url), auth)).await?;
        let listing: FileListResponse = Self::json(response).await?;
        Ok(listing.files)
    }

    async fn expose_port(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        port: u16,
    ) -> Result<String, PlatformError> {
        let url = self.endpoint(&["sandboxes", sandbox_id, "ports"])?;
        let response = self
            .send(
                self.authed(self.client.post(url), auth)
                    .json(&ExposePortBody { port }),
            )
            .await?;
        let exposed: ExposePortResponse = Self::json(response).await?;
        Ok(exposed.url)
    }

    async fn terminate(&self, auth: &SandboxAuth, sandbox_id: &str) -> Result<(), PlatformError> {
        let url = self.endpoint(&["sandboxes", sandbox_id, "terminate"])?;
        self.send(self.authed(self.client.post(url), auth)).await?;
        Ok(())
    }

    async fn health(&self) -> Result<(), PlatformError> {
        let url = self.endpoint(&["health"])?;
        let mut builder = self.client.get(url).timeout(CONNECT_TIMEOUT);
        if let Some(token) = &self.service_token {
            builder = builder.bearer_auth(token);
        }
        self.send(builder).await?;
        Ok(())
    }
}

/// Splits a chunked JSON-lines body into exec frames.
fn frame_stream(response: Response) -> ExecStream {
    let bytes = response.bytes_stream().boxed();
    let frames = futures::stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        |(mut bytes, mut buf, mut eof)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_frame(&line) {
                        Some(frame) => return Some((frame, (bytes, buf, eof))),
                        None => continue,
                    }
                }
                if eof {
                    let rest = std::mem::take(&mut buf);
                    return parse_frame(&rest).map(|frame| (frame, (bytes, buf, eof)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(err)) => {
                        let err = PlatformError::Unreachable(err.to_string());
                        return Some((Err(err), (bytes, buf, true)));
                    }
                    None => eof = true,
                }
            }
        },
    );
    Box::pin(frames)
}

fn parse_frame(line: &[u8]) -> Option<Result<ExecFrame, PlatformError>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<ExecFrame>(text).map_err(|err| {
        PlatformError::InvalidResponse(format!("bad exec frame `{text}`: {err}"))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth() -> SandboxAuth {
        SandboxAuth::new("scoped-token", "req-1")
    }

    #[tokio::test]
    async fn create_sends_scoped_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .and(header("authorization", "Bearer scoped-token"))
            .and(header("x-janus-request-id", "req-1"))
            .and(body_json(serde_json::json!({"ttl_seconds": 600, "expose_ports": [8080]})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "sb-1",
                "public_url": "https://sb-1.sandbox.test"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let platform = HttpSandboxPlatform::new(&server.uri(), None).expect("client");
        let created = platform
            .create(
                &auth(),
                &CreateSandboxRequest {
                    ttl_seconds: 600,
                    expose_ports: vec![8080],
                    parent_id: None,
                },
            )
            .await
            .expect("create");
        assert_eq!(created.id, "sb-1");
        assert_eq!(created.public_url.as_deref(), Some("https://sb-1.sandbox.test"));
    }

    #[tokio::test]
    async fn create_failure_carries_upstream_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .respond_with(ResponseTemplate::new(503).set_body_string("no capacity"))
            .mount(&server)
            .await;

        let platform = HttpSandboxPlatform::new(&server.uri(), None).expect("client");
        let err = platform
            .create(
                &auth(),
                &CreateSandboxRequest {
                    ttl_seconds: 60,
                    expose_ports: Vec::new(),
                    parent_id: None,
                },
            )
            .await
            .expect_err("should fail");
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("no capacity"));
    }

    #[tokio::test]
    async fn exec_stream_yields_frames_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"type\":\"stdout\",\"line\":\"hello\"}\n",
            "\n",
            "{\"type\":\"stderr\",\"line\":\"warn\"}\n",
            "{\"type\":\"exit\",\"code\":0}"
        );
        Mock::given(method("POST"))
            .and(path("/sandboxes/sb-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let platform = HttpSandboxPlatform::new(&server.uri(), None).expect("client");
        let frames: Vec<ExecFrame> = platform
            .exec_stream(&auth(), "sb-1", &ExecRequest::new(vec!["agent".to_string()]))
            .await
            .expect("stream")
            .try_collect()
            .await
            .expect("frames");
        assert_eq!(
            frames,
            vec![
                ExecFrame::Stdout {
                    line: "hello".to_string()
                },
                ExecFrame::Stderr {
                    line: "warn".to_string()
                },
                ExecFrame::Exit { code: Some(0) },
            ]
        );
    }

    #[tokio::test]
    async fn file_endpoints_use_query_paths() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandboxes/sb-1/files"))
            .and(query_param("path", "/workspace/artifacts/cat.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, 0x50, 0x4e, 0x47]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sandboxes/sb-1/files/list"))
            .and(query_param("dir", "/workspace/artifacts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [{"path": "/workspace/artifacts/cat.png", "size_bytes": 4}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sandboxes/sb-1/files"))
            .and(query_param("path", "/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let platform = HttpSandboxPlatform::new(&server.uri(), None).expect("client");
        let bytes = platform
            .read_file(&auth(), "sb-1", "/workspace/artifacts/cat.png")
            .await
            .expect("read");
        assert_eq!(bytes, vec![0x89, 0x50, 0x4e, 0x47]);

        let listing = platform
            .list_files(&auth(), "sb-1", "/workspace/artifacts")
            .await
            .expect("list");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].size_bytes, 4);

        let missing = platform.read_file(&auth(), "sb-1", "/missing").await;
        assert!(matches!(missing, Err(PlatformError::NotFound(_))));
    }

    #[tokio::test]
    async fn base_path_is_preserved() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/health"))
            .and(header("authorization", "Bearer service"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let platform =
            HttpSandboxPlatform::new(&format!("{}/api/v2", server.uri()), Some("service".to_string()))
                .expect("client");
        platform.health().await.expect("healthy");
    }
}
