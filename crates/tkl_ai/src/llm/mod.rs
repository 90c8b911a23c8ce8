use tkl_core::error::AppError;

pub const DEFAULT_LLM_MODEL: &str = "llama3.1";

/// Single-shot text completion against a local model.
pub trait Llm {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, AppError>;
}

pub mod ollama_llm;
