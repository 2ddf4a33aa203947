use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Process-wide settings. Built once in `main` and passed to each component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub planner_api_key: Option<String>,
    pub planner_base_url: String,
    pub planner_model: String,
    pub proxy_list_path: PathBuf,
    pub proxy_cooldown: Duration,
    pub captcha_provider: String,
    pub captcha_api_key: Option<String>,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub log_level: String,
    pub page_timeout: Duration,
    pub max_concurrency: usize,
    pub export_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub server_port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_concurrency: usize = parse_or(&get, "MAX_CONCURRENCY", 4)?;
        let cooldown_secs: f64 = parse_or(&get, "PROXY_COOLDOWN_SECS", 10.0)?;
        let proxy_cooldown = Duration::try_from_secs_f64(cooldown_secs)
            .map_err(|e| anyhow::anyhow!("invalid PROXY_COOLDOWN_SECS={cooldown_secs}: {e}"))?;
        if max_concurrency == 0 {
            bail!("MAX_CONCURRENCY must be at least 1");
        }

        Ok(Self {
            planner_api_key: get("PLANNER_API_KEY"),
            planner_base_url: get("PLANNER_BASE_URL")
                .unwrap_or_else(|| "https://api.deepseek.com/v1".to_string()),
            planner_model: get("PLANNER_MODEL").unwrap_or_else(|| "deepseek-chat".to_string()),
            proxy_list_path: get("PROXY_LIST_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./proxies.txt")),
            proxy_cooldown,
            captcha_provider: get("CAPTCHA_PROVIDER")
                .unwrap_or_else(|| "twocaptcha".to_string())
                .to_lowercase(),
            captcha_api_key: get("CAPTCHA_API_KEY"),
            headless: parse_bool(&get, "HEADLESS", true)?,
            chrome_path: get("CHROME_PATH").map(PathBuf::from),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            page_timeout: Duration::from_millis(parse_or(&get, "PAGE_TIMEOUT", 30_000)?),
            max_concurrency,
            export_dir: get("EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./exports")),
            ledger_path: get("LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_ledger_path),
            server_port: parse_or(&get, "SERVER_PORT", 3000)?,
        })
    }

    /// Addresses listed in the proxy file. A missing file means no pool.
    pub fn proxy_list(&self) -> Result<Vec<String>> {
        read_proxy_list(&self.proxy_list_path)
    }
}

pub fn read_proxy_list(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading proxy list {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

fn default_ledger_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("harvest-rpa").join("ledger.json"))
        .unwrap_or_else(|| PathBuf::from("./ledger.json"))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => bail!("invalid {key}={v}: expected a boolean"),
    }
}
