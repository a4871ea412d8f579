//! Typed REST sub-clients for the control plane.
//!
//! All sub-clients share one authenticated client configuration; they are
//! handed out by [`crate::ServerProxy`] factory methods.

use std::path::PathBuf;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::error::ProxyError;
use fluxrun_core::config::ServerProxyConfig;
use fluxrun_core::job::{JobRecord, JobStatus};

/// Kind of program an application record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationType {
    Python,
    Shell,
    LinuxBinary,
    WindowsBinary,
    Unknown,
}

impl std::fmt::Display for ApplicationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ApplicationType::Python => "PYTHON",
            ApplicationType::Shell => "SHELL",
            ApplicationType::LinuxBinary => "LINUX_BINARY",
            ApplicationType::WindowsBinary => "WINDOWS_BINARY",
            ApplicationType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Application metadata served by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub id: Uuid,
    pub name: String,
    pub application_type: ApplicationType,
}

/// Metadata of a job resource (input file or uploaded log).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Uuid,
    pub filename: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Partial update of a job record; only the set fields are sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn working_directory(path: PathBuf) -> Self {
        Self {
            working_directory: Some(path),
            ..Self::default()
        }
    }

    pub fn exit_code(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct RegistrationRequest {
    id: Uuid,
    token: Uuid,
    name: String,
}

/// What the control plane returns on registration. The server may assign a
/// canonical name and a fresh token, which callers should adopt.
#[derive(Debug, Default, Deserialize)]
pub struct RunnerRegistration {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub token: Option<Uuid>,
}

/// Shared authenticated client state behind every sub-client.
#[derive(Clone)]
pub(crate) struct ApiContext {
    pub(crate) http: reqwest::Client,
    pub(crate) base: Url,
    pub(crate) id: Uuid,
    pub(crate) token: Uuid,
}

impl ApiContext {
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProxyError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| ProxyError::InvalidEndpoint(segments.join("/")))?;
            path.pop_if_empty();
            path.extend(segments.iter().copied());
        }
        Ok(url)
    }

    pub(crate) fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", self.token),
            )
            .header("id", self.id.to_string())
            .header("token", self.token.to_string())
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ProxyError> {
        let url = self.endpoint(segments)?;
        let response = self.request(Method::GET, url).send().await?;
        let bytes = check(response).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_bytes(&self, segments: &[&str]) -> Result<Vec<u8>, ProxyError> {
        let url = self.endpoint(segments)?;
        let response = self.request(Method::GET, url).send().await?;
        Ok(check(response).await?.bytes().await?.to_vec())
    }
}

/// Turn a non-2xx response into [`ProxyError::Status`], keeping the body.
pub(crate) async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProxyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProxyError::Status { status, body })
}

/// One-shot registration used by the installer, before any proxy exists.
pub async fn register_runner(
    config: &ServerProxyConfig,
) -> Result<RunnerRegistration, ProxyError> {
    let http = reqwest::Client::builder()
        .timeout(crate::proxy::DEFAULT_REQUEST_TIMEOUT)
        .build()?;
    let mut base = config.api_url.clone();
    base.set_port(Some(config.api_port))
        .map_err(|()| ProxyError::InvalidEndpoint(config.api_url.to_string()))?;
    let ctx = ApiContext {
        http,
        base,
        id: config.id,
        token: config.token,
    };
    RunnerApi::new(ctx).register(&config.name).await
}

/// Runner registration endpoints.
pub struct RunnerApi {
    ctx: ApiContext,
}

impl RunnerApi {
    pub(crate) fn new(ctx: ApiContext) -> Self {
        Self { ctx }
    }

    /// Register this runner with the control plane.
    pub async fn register(&self, name: &str) -> Result<RunnerRegistration, ProxyError> {
        let url = self.ctx.endpoint(&["runner_manager", "runner_register"])?;
        let request = RegistrationRequest {
            id: self.ctx.id,
            token: self.ctx.token,
            name: name.to_string(),
        };
        let response = self
            .ctx
            .request(Method::POST, url)
            .json(&request)
            .send()
            .await?;
        let bytes = check(response).await?.bytes().await?;
        if bytes.is_empty() {
            return Ok(RunnerRegistration::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Job endpoints.
pub struct JobApi {
    ctx: ApiContext,
}

impl JobApi {
    pub(crate) fn new(ctx: ApiContext) -> Self {
        Self { ctx }
    }

    /// All jobs currently assigned to this runner.
    pub async fn list_for_runner(&self) -> Result<Vec<JobRecord>, ProxyError> {
        self.ctx
            .get_json(&["job_manager", "runner_jobs", &self.ctx.id.to_string()])
            .await
    }

    /// Partial-update a job record.
    ///
    /// Addressed exactly like the queued job PATCHes: the runner id is the
    /// final path segment, so both paths hit one canonical endpoint.
    pub async fn update(&self, job_id: Uuid, patch: &JobPatch) -> Result<Value, ProxyError> {
        let url = self.ctx.endpoint(&[
            "job_manager",
            "job",
            &job_id.to_string(),
            &self.ctx.id.to_string(),
        ])?;
        let response = self
            .ctx
            .request(Method::PATCH, url)
            .json(patch)
            .send()
            .await?;
        let bytes = check(response).await?.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Application endpoints.
pub struct ApplicationApi {
    ctx: ApiContext,
}

impl ApplicationApi {
    pub(crate) fn new(ctx: ApiContext) -> Self {
        Self { ctx }
    }

    pub async fn retrieve(&self, application_id: Uuid) -> Result<ApplicationInfo, ProxyError> {
        self.ctx
            .get_json(&[
                "application_manager",
                "application",
                &application_id.to_string(),
            ])
            .await
    }

    /// The application's program, as raw bytes.
    pub async fn program(&self, application_id: Uuid) -> Result<Vec<u8>, ProxyError> {
        self.ctx
            .get_bytes(&[
                "application_manager",
                "application",
                &application_id.to_string(),
                "program",
            ])
            .await
    }
}

/// Job resource endpoints (inputs and uploaded results).
pub struct ResourceApi {
    ctx: ApiContext,
}

impl ResourceApi {
    pub(crate) fn new(ctx: ApiContext) -> Self {
        Self { ctx }
    }

    pub async fn retrieve(&self, resource_id: Uuid) -> Result<ResourceInfo, ProxyError> {
        self.ctx
            .get_json(&["job_manager", "resource", &resource_id.to_string()])
            .await
    }

    /// The resource's payload, as raw bytes.
    pub async fn download(&self, resource_id: Uuid) -> Result<Vec<u8>, ProxyError> {
        self.ctx
            .get_bytes(&[
                "job_manager",
                "resource",
                &resource_id.to_string(),
                "download",
            ])
            .await
    }
}
