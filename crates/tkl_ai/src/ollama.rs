use std::time::Duration;

use tkl_core::error::AppError;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
}

impl OllamaClient {
    /// Create a client for Ollama. This is strictly limited to `127.0.0.1`.
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let base_url = base_url.trim_end_matches('/').to_string();

        // Binding constraint: local-only via 127.0.0.1. Anything after the
        // host must be a bare port.
        let rest = base_url.strip_prefix("http://127.0.0.1");
        let ok = match rest {
            Some("") => true,
            Some(rest) => match rest.strip_prefix(':') {
                Some(port) => matches!(port.parse::<u32>(), Ok(p) if (1..=65535).contains(&p)),
                None => false,
            },
            None => false,
        };
        if !ok {
            return Err(AppError::new(
                "AI_REMOTE_NOT_ALLOWED",
                "Ollama base URL must be localhost (127.0.0.1)",
            )
            .with_details(format!("base_url={base_url}")));
        }

        Ok(Self { base_url })
    }

    /// Base URL from `TKL_OLLAMA_URL`, falling back to the default port.
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("TKL_OLLAMA_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::new(&url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health_check(&self) -> Result<(), AppError> {
        let url = format!("{}/api/tags", self.base_url);
        match ureq::get(&url).timeout(Duration::from_millis(800)).call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, _)) => Err(AppError::new(
                "AI_OLLAMA_UNHEALTHY",
                "Ollama answered the health check with an error",
            )
            .with_details(format!("status={status}"))),
            Err(e) => Err(AppError::new(
                "AI_OLLAMA_UNREACHABLE",
                "Failed to reach Ollama on 127.0.0.1",
            )
            .with_details(e.to_string())
            .with_retryable(true)),
        }
    }

    /// POST a JSON body to an Ollama endpoint and hand back the 2xx response.
    /// A status error becomes a plain failure with the code; a transport
    /// error is marked retryable.
    pub(crate) fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
        timeout: Duration,
        code: &'static str,
        what: &str,
    ) -> Result<ureq::Response, AppError> {
        let url = format!("{}{}", self.base_url, path);
        match ureq::post(&url).timeout(timeout).send_json(body) {
            Ok(r) => Ok(r),
            Err(ureq::Error::Status(status, _)) => {
                Err(AppError::new(code, format!("Ollama rejected the {what} request"))
                    .with_details(format!("status={status}")))
            }
            Err(e) => Err(
                AppError::new(code, format!("Failed to call the {what} endpoint"))
                    .with_details(e.to_string())
                    .with_retryable(true),
            ),
        }
    }
}
