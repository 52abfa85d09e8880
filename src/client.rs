//! Session handles for sandboxes behind the sandbox service API.

use crate::api::{
    CommandResult, CreateSandboxRequest, ExecRequest, FileContent, HealthStatus, PreviewLink,
    SandboxInfo,
};
use crate::config::{Credential, Settings};
use crate::error::{Error, Result};
use crate::shell;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Slack added on top of a command timeout before the HTTP call gives up.
const REQUEST_GRACE: Duration = Duration::from_secs(15);

/// Per-command options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Operations available on one sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Run a shell command and capture its exit status and output.
    async fn exec(&self, command: &str, options: &ExecOptions) -> Result<CommandResult>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Externally reachable URL for a port inside the sandbox.
    async fn preview_url(&self, port: u16) -> Result<String>;

    /// Home directory of the sandbox user.
    async fn home_dir(&self) -> Result<String> {
        fetch_home(self).await
    }
}

async fn fetch_home<S: Sandbox + ?Sized>(sandbox: &S) -> Result<String> {
    let result = sandbox.exec(shell::REMOTE_HOME, &ExecOptions::default()).await?;
    let home = result.output.trim().to_string();
    if !result.success() || home.is_empty() {
        return Err(Error::Decode(format!(
            "could not determine home directory (exit {})",
            result.exit_code
        )));
    }
    Ok(home)
}

/// Expand a leading `~` so the path can be used with the file API.
pub async fn resolve_path(sandbox: &dyn Sandbox, path: &str) -> Result<String> {
    if path == "~" {
        return sandbox.home_dir().await;
    }
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = sandbox.home_dir().await?;
            Ok(format!("{}/{}", home.trim_end_matches('/'), rest))
        }
        None => Ok(path.to_string()),
    }
}

/// Client for the sandbox service itself (not bound to one sandbox).
#[derive(Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    base: Url,
    api_key: Option<Credential>,
}

impl ServiceClient {
    pub fn new(api_url: &str, api_key: Option<Credential>) -> Result<Self> {
        let base = Url::parse(api_url)
            .map_err(|err| Error::Config(format!("invalid API URL '{api_url}': {err}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("API URL '{api_url}' cannot be a base")));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base,
            api_key,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key.expose()))
                .map_err(|_| Error::Config("API key is not a valid header value".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<String> {
        debug!(%method, %url, "sandbox service request");
        let mut request = self
            .http
            .request(method, url)
            .headers(self.headers()?)
            .timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                Error::Timeout(timeout)
            } else {
                Error::Http(err)
            }
        })?;
        let status = response.status();
        let text = response.text().await?;
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(text));
        }
        if !status.is_success() {
            return Err(Error::Api { status, body: text });
        }
        Ok(text)
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<T> {
        let text = self.send(method, url, body, timeout).await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn create_sandbox(&self, labels: HashMap<String, String>) -> Result<SandboxInfo> {
        let request = CreateSandboxRequest { labels };
        let info: SandboxInfo = self
            .send_json(
                Method::POST,
                self.endpoint(&["sandboxes"]),
                Some(&request),
                CONNECT_TIMEOUT + REQUEST_GRACE,
            )
            .await?;
        info!(sandbox = %info.id, "created sandbox");
        Ok(info)
    }

    pub async fn sandbox_info(&self, id: &str) -> Result<SandboxInfo> {
        self.send_json::<(), _>(
            Method::GET,
            self.endpoint(&["sandboxes", id]),
            None,
            CONNECT_TIMEOUT + REQUEST_GRACE,
        )
        .await
        .map_err(|err| match err {
            Error::NotFound(_) => Error::NotFound(id.to_string()),
            other => other,
        })
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        self.send_json::<(), _>(
            Method::GET,
            self.endpoint(&["health"]),
            None,
            CONNECT_TIMEOUT + REQUEST_GRACE,
        )
        .await
    }

    pub async fn list_sandboxes(&self) -> Result<Vec<SandboxInfo>> {
        self.send_json::<(), _>(
            Method::GET,
            self.endpoint(&["sandboxes"]),
            None,
            CONNECT_TIMEOUT + REQUEST_GRACE,
        )
        .await
    }

    /// Delete a sandbox. Its files are removed and its processes killed.
    pub async fn delete_sandbox(&self, id: &str) -> Result<()> {
        self.send::<()>(
            Method::DELETE,
            self.endpoint(&["sandboxes", id]),
            None,
            CONNECT_TIMEOUT + REQUEST_GRACE,
        )
        .await
        .map_err(|err| match err {
            Error::NotFound(_) => Error::NotFound(id.to_string()),
            other => other,
        })?;
        info!(sandbox = %id, "deleted sandbox");
        Ok(())
    }

    /// Open a session handle, confirming the sandbox exists first.
    pub async fn connect(&self, id: &str, exec_timeout: Duration) -> Result<RemoteSandbox> {
        let info = self.sandbox_info(id).await?;
        info!(sandbox = %info.id, state = %info.state, "session established");
        Ok(RemoteSandbox {
            service: self.clone(),
            info,
            exec_timeout,
            home: OnceCell::new(),
        })
    }
}

/// Session handle for one sandbox.
pub struct RemoteSandbox {
    service: ServiceClient,
    info: SandboxInfo,
    exec_timeout: Duration,
    home: OnceCell<String>,
}

impl RemoteSandbox {
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let service = ServiceClient::new(&settings.api_url, settings.api_key.clone())?;
        service
            .connect(&settings.sandbox_id, settings.exec_timeout)
            .await
    }

    pub fn info(&self) -> &SandboxInfo {
        &self.info
    }

    fn url(&self, tail: &[&str]) -> Url {
        let mut segments = vec!["sandboxes", self.info.id.as_str()];
        segments.extend_from_slice(tail);
        self.service.endpoint(&segments)
    }

    fn file_timeout(&self) -> Duration {
        self.exec_timeout + REQUEST_GRACE
    }
}

#[async_trait]
impl Sandbox for RemoteSandbox {
    fn id(&self) -> &str {
        &self.info.id
    }

    async fn exec(&self, command: &str, options: &ExecOptions) -> Result<CommandResult> {
        let timeout = options.timeout.unwrap_or(self.exec_timeout);
        let request = ExecRequest {
            command: command.to_string(),
            cwd: options.cwd.clone(),
            env: options.env.clone(),
            timeout_secs: Some(timeout.as_secs().max(1)),
        };
        debug!(sandbox = %self.info.id, command, "exec");
        let result: CommandResult = self
            .service
            .send_json(
                Method::POST,
                self.url(&["exec"]),
                Some(&request),
                timeout + REQUEST_GRACE,
            )
            .await?;
        debug!(exit_code = result.exit_code, output_len = result.output.len(), "exec finished");
        Ok(result)
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let body = FileContent {
            path: path.to_string(),
            content_base64: STANDARD.encode(content),
        };
        self.service
            .send(Method::PUT, self.url(&["files"]), Some(&body), self.file_timeout())
            .await?;
        info!(sandbox = %self.info.id, path, bytes = content.len(), "uploaded file");
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut url = self.url(&["files"]);
        url.query_pairs_mut().append_pair("path", path);
        let file: FileContent = self
            .service
            .send_json::<(), _>(Method::GET, url, None, self.file_timeout())
            .await?;
        Ok(STANDARD.decode(file.content_base64)?)
    }

    async fn preview_url(&self, port: u16) -> Result<String> {
        let port_segment = port.to_string();
        let link: PreviewLink = self
            .service
            .send_json::<(), _>(
                Method::GET,
                self.url(&["ports", &port_segment, "preview"]),
                None,
                CONNECT_TIMEOUT + REQUEST_GRACE,
            )
            .await?;
        Ok(link.url)
    }

    async fn home_dir(&self) -> Result<String> {
        self.home
            .get_or_try_init(|| fetch_home(self))
            .await
            .cloned()
    }
}
