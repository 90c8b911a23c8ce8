use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tkl_core::error::AppError;

use super::Embedder;
use crate::ollama::OllamaClient;

const MAX_INPUT_BYTES: usize = 12_000;
const EMBED_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: OllamaClient,
}

impl OllamaEmbedder {
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

/// Chunking keeps inputs small, but cap the request size anyway. The cut
/// backs up to a character boundary.
fn cap_input(input: &str) -> &str {
    if input.len() <= MAX_INPUT_BYTES {
        return input;
    }
    let mut cut = MAX_INPUT_BYTES;
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    &input[..cut]
}

impl Embedder for OllamaEmbedder {
    fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, AppError> {
        let body = json!({ "model": model, "prompt": cap_input(input) });
        let resp = self.client.post_json(
            "/api/embeddings",
            body,
            EMBED_TIMEOUT,
            "AI_EMBED_FAILED",
            "embeddings",
        )?;

        let parsed: EmbeddingsResponse = resp.into_json().map_err(|e| {
            AppError::new("AI_EMBED_FAILED", "Failed to decode embeddings response")
                .with_details(e.to_string())
        })?;
        if parsed.embedding.is_empty() {
            return Err(AppError::new(
                "AI_EMBED_FAILED",
                "Embeddings response was empty",
            ));
        }
        Ok(parsed.embedding)
    }
}
