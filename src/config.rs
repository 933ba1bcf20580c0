use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://ayugpt.db?mode=rwc";
const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DEBOUNCE_MS: u64 = 1000;

/// Runtime settings, read from the environment (and `.env` in development).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub ollama_base_url: String,
    pub model: String,
    pub port: u16,
    pub persist_debounce: Duration,
    /// Share token to import on startup instead of loading saved sessions.
    pub shared_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            ollama_base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            port: DEFAULT_PORT,
            persist_debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            shared_token: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            ollama_base_url: get("OLLAMA_API_BASE_URL").unwrap_or(defaults.ollama_base_url),
            model: get("AYUGPT_MODEL").unwrap_or(defaults.model),
            port: get("PORT").and_then(|p| p.parse().ok()).unwrap_or(defaults.port),
            persist_debounce: get("AYUGPT_PERSIST_DEBOUNCE_MS")
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.persist_debounce),
            shared_token: get("AYUGPT_SHARED_TOKEN").filter(|t| !t.trim().is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.persist_debounce, Duration::from_secs(1));
        assert!(config.shared_token.is_none());
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PORT", "not-a-port"),
            ("AYUGPT_PERSIST_DEBOUNCE_MS", "250"),
            ("AYUGPT_MODEL", "qwen2.5"),
            ("AYUGPT_SHARED_TOKEN", "  "),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.persist_debounce, Duration::from_millis(250));
        assert_eq!(config.model, "qwen2.5");
        assert!(config.shared_token.is_none());
    }
}
