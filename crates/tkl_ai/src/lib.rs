pub mod embeddings;
pub mod extract;
pub mod index;
pub mod llm;
pub mod ollama;
pub mod retrieve;

#[cfg(test)]
mod tests {
    use super::ollama::{OllamaClient, DEFAULT_BASE_URL};

    #[test]
    fn base_url_must_be_loopback() {
        assert!(OllamaClient::new(DEFAULT_BASE_URL).is_ok());
        assert!(OllamaClient::new("http://127.0.0.1").is_ok());
        // A trailing slash is stripped before validation.
        assert_eq!(
            OllamaClient::new("http://127.0.0.1:11434/")
                .unwrap()
                .base_url(),
            "http://127.0.0.1:11434"
        );

        for url in [
            "http://localhost:11434",
            "http://0.0.0.0:11434",
            "http://[::1]:11434",
            "http://192.168.1.4:11434",
            "https://example.com",
        ] {
            let err = OllamaClient::new(url).unwrap_err();
            assert_eq!(err.code, "AI_REMOTE_NOT_ALLOWED", "{url}");
        }
    }

    #[test]
    fn base_url_rejects_lookalikes_and_bad_ports() {
        // Hosts that merely start with the loopback address.
        assert!(OllamaClient::new("http://127.0.0.1.evil.com:11434").is_err());
        assert!(OllamaClient::new("http://127.0.0.1@evil.com:11434").is_err());
        // Only a bare, in-range port may follow the host.
        assert!(OllamaClient::new("http://127.0.0.1:").is_err());
        assert!(OllamaClient::new("http://127.0.0.1:0").is_err());
        assert!(OllamaClient::new("http://127.0.0.1:99999").is_err());
        assert!(OllamaClient::new("http://127.0.0.1:11434/api").is_err());
    }
}
