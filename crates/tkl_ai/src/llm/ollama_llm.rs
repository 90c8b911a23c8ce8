use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tkl_core::error::AppError;

use super::Llm;
use crate::ollama::OllamaClient;

// Extraction prompts carry a whole episode; small local models take a while.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct OllamaLlm {
    client: OllamaClient,
}

impl OllamaLlm {
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl Llm for OllamaLlm {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, AppError> {
        let body = json!({ "model": model, "prompt": prompt, "stream": false });
        let resp = self.client.post_json(
            "/api/generate",
            body,
            GENERATE_TIMEOUT,
            "AI_GENERATE_FAILED",
            "generate",
        )?;

        let parsed: GenerateResponse = resp.into_json().map_err(|e| {
            AppError::new("AI_GENERATE_FAILED", "Failed to decode generate response")
                .with_details(e.to_string())
        })?;
        if parsed.response.trim().is_empty() {
            return Err(AppError::new(
                "AI_GENERATE_FAILED",
                "Generate returned an empty reply",
            ));
        }
        Ok(parsed.response)
    }
}
