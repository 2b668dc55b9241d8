//! Process configuration from environment variables, mirrored by the
//! binary's CLI flags.

use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub allowed_origins: Vec<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("./data"),
            allowed_origins: vec!["*".to_string()],
            openai_api_key: None,
            openai_base_url: None,
            anthropic_api_key: None,
            gemini_api_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(port) = non_empty_env("PORT") {
            config.port = port
                .parse()
                .map_err(|_| format!("invalid PORT: {port}"))?;
        }
        if let Some(data_dir) = non_empty_env("DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(origins) = non_empty_env("CORS_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }

        config.openai_api_key = non_empty_env("OPENAI_API_KEY");
        config.openai_base_url =
            non_empty_env("OPENAI_API_URL").or_else(|| non_empty_env("OPENAI_URL"));
        config.anthropic_api_key = non_empty_env("ANTHROPIC_API_KEY");
        config.gemini_api_key = non_empty_env("GEMINI_API_KEY");

        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("satchel.db")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.allowed_origins, vec!["*"]);
        assert!(config.database_path().ends_with("satchel.db"));
    }
}
