use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Clone, Debug)]
pub struct JobConfig {
    base_url: Url,
}

impl JobConfig {
    pub fn new(jobs_base_url: impl AsRef<str>) -> Result<Self, ProvisionError> {
        let mut base = jobs_base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(ProvisionError::InvalidConfig(
                "jobs base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        // Url::join treats a base without a trailing slash as a file.
        if !base.ends_with('/') {
            base.push('/');
        }
        let parsed = Url::parse(&base)
            .map_err(|err| ProvisionError::InvalidConfig(format!("invalid jobs url: {err}")))?;
        Ok(Self { base_url: parsed })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}

/// One-time credential authorizing exactly one execution. Consumed by
/// the `execute` frame and never persisted.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct JobCredential {
    pub job_id: String,
    pub job_token: String,
    pub expires_at: String,
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid jobs endpoint configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{message}")]
    Server {
        status: StatusCode,
        message: String,
    },
    #[error("invalid response from job service: {0}")]
    InvalidResponse(String),
}

/// Requests single-use job credentials from the job-creation endpoint.
/// No internal retry; a failed provision ends the execution attempt.
#[derive(Clone)]
pub struct JobBroker {
    config: Arc<JobConfig>,
    backend: Arc<dyn JobBackend>,
}

impl JobBroker {
    pub fn new(config: JobConfig) -> Result<Self, ProvisionError> {
        let backend = Arc::new(ReqwestJobBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    pub fn with_backend(config: JobConfig, backend: Arc<dyn JobBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub async fn create_job(&self) -> Result<JobCredential, ProvisionError> {
        let credential = self.backend.create_job(self.config.base_url()).await?;
        for (field, value) in [
            ("job_id", &credential.job_id),
            ("job_token", &credential.job_token),
            ("expires_at", &credential.expires_at),
        ] {
            if value.trim().is_empty() {
                return Err(ProvisionError::InvalidResponse(format!(
                    "response is missing {field}"
                )));
            }
        }
        tracing::debug!(
            target: "runbox::session",
            job_id = %credential.job_id,
            expires_at = %credential.expires_at,
            "job created"
        );
        Ok(credential)
    }
}

#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn create_job(&self, base_url: &Url) -> Result<JobCredential, ProvisionError>;
}

struct ReqwestJobBackend {
    client: reqwest::Client,
}

impl ReqwestJobBackend {
    fn new() -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl JobBackend for ReqwestJobBackend {
    async fn create_job(&self, base_url: &Url) -> Result<JobCredential, ProvisionError> {
        let endpoint = base_url.join("api/jobs/create").map_err(|err| {
            ProvisionError::InvalidConfig(format!("invalid job-creation endpoint: {err}"))
        })?;
        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|body| body.detail.or(body.message))
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("failed to create job")
                        .to_string()
                });
            return Err(ProvisionError::Server { status, message });
        }
        response
            .json::<JobCredential>()
            .await
            .map_err(|err| ProvisionError::InvalidResponse(err.to_string()))
    }
}
