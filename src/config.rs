// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// The single origin allowed by CORS (the frontend).
    pub frontend_origin: String,
    /// Credential for the chat-completion provider. Unset disables tutoring help.
    pub openai_api_key: Option<String>,
    /// Base URL of the OpenAI-compatible API.
    pub openai_base_url: String,
    /// Model used for tutoring answers.
    pub openai_model: String,
    /// Whether to run in local mode (no auth, no rate limiting, file-backed progress).
    pub local_mode: bool,
    /// Progress file used by the local store.
    pub progress_file: PathBuf,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:mathlingo.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 4000)
    /// - `FRONTEND_URL` - CORS origin (default: `http://localhost:5173`)
    /// - `OPENAI_API_KEY` - provider credential (no default)
    /// - `OPENAI_BASE_URL` - provider base URL (default: `https://api.openai.com/v1`)
    /// - `OPENAI_MODEL` - provider model (default: `gpt-4o-mini`)
    /// - `MATHLINGO_LOCAL_MODE` - Set to `true` to enable local mode
    /// - `PROGRESS_FILE` - local progress file (default: `mathlingo-progress.json`)
    ///
    /// CLI flags:
    /// - `--local` - Enable local mode (same as `MATHLINGO_LOCAL_MODE=true`)
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:mathlingo.db?mode=rwc".to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(4000);

        let frontend_origin = std::env::var("FRONTEND_URL")
            .unwrap_or_else(|_| "http://localhost:5173".to_string());

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let openai_base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let openai_model =
            std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let local_mode = args.contains(&"--local".to_string())
            || std::env::var("MATHLINGO_LOCAL_MODE")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false);

        let progress_file = std::env::var("PROGRESS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("mathlingo-progress.json"));

        Config {
            database_url,
            port,
            frontend_origin,
            openai_api_key,
            openai_base_url,
            openai_model,
            local_mode,
            progress_file,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

/// Global flag indicating local mode is active.
/// This is set once at startup and read by auth extractors and the rate limiter.
static LOCAL_MODE: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

/// Set the local mode flag (called once at startup).
pub fn set_local_mode(enabled: bool) {
    LOCAL_MODE.store(enabled, std::sync::atomic::Ordering::Relaxed);
}

/// Check if local mode is active.
pub fn is_local_mode() -> bool {
    LOCAL_MODE.load(std::sync::atomic::Ordering::Relaxed)
}

/// Learner identity used when running in local mode.
pub const LOCAL_LEARNER_ID: &str = "local";
pub const LOCAL_EMAIL: &str = "local@mathlingo";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_value() {
        let args: Vec<String> = ["mathlingo-backend", "--port", "8080", "--local"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            Config::parse_cli_value(&args, "--port"),
            Some("8080".to_string())
        );
        assert_eq!(Config::parse_cli_value(&args, "--missing"), None);
        // Flag in last position has no value
        assert_eq!(Config::parse_cli_value(&args, "--local"), None);
    }
}
