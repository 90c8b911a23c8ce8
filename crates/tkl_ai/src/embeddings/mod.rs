use tkl_core::error::AppError;

/// Turns text into a fixed-width vector for the similarity index.
pub trait Embedder {
    fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>, AppError>;
}

pub mod ollama_embed;
