use anyhow::Result;
use std::collections::HashMap;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub custom_domain: String,
    /// "development" relaxes CSP, allows dev loopback origins and unsafe-eval.
    pub node_env: String,
    pub data_dir: String,
    pub jwt_secret: String,

    // Inference
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub model: String,

    // Agent tuning
    pub max_phases: u32,
    pub fast_smart_fixes: bool,
    pub sandbox_bootstrap_timeout_s: u64,

    // Global rate limit
    pub rate_limit_requests: u32,
    pub rate_limit_period_s: i64,
    pub rate_limit_burst: u32,

    // External services
    pub screenshot_api_url: String,
    pub github_api_url: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            host: get_str("HOST", &dotenv, "127.0.0.1"),
            port: get_u16("PORT", &dotenv, 3000),
            custom_domain: get_str("CUSTOM_DOMAIN", &dotenv, ""),
            node_env: get_str("NODE_ENV", &dotenv, "production"),
            data_dir: get_str("DATA_DIR", &dotenv, "data"),
            jwt_secret: get_str("JWT_SECRET", &dotenv, "vibesdk-dev-secret"),
            llm_base_url: get_str("LLM_BASE_URL", &dotenv, "http://localhost:11434/v1"),
            llm_api_key: get_str("LLM_API_KEY", &dotenv, ""),
            model: get_str("MODEL", &dotenv, "claude-sonnet-4-6"),
            max_phases: get_u32("MAX_PHASES", &dotenv, 12),
            fast_smart_fixes: get_bool("FAST_SMART_FIXES", &dotenv, true),
            sandbox_bootstrap_timeout_s: get_u64("SANDBOX_BOOTSTRAP_TIMEOUT_S", &dotenv, 300),
            rate_limit_requests: get_u32("RATE_LIMIT_REQUESTS", &dotenv, 100),
            rate_limit_period_s: get_i64("RATE_LIMIT_PERIOD_S", &dotenv, 60),
            rate_limit_burst: get_u32("RATE_LIMIT_BURST", &dotenv, 0),
            screenshot_api_url: get_str("SCREENSHOT_API_URL", &dotenv, ""),
            github_api_url: get_str("GITHUB_API_URL", &dotenv, "https://api.github.com"),
        })
    }

    pub fn is_development(&self) -> bool {
        self.node_env == "development"
    }
}
