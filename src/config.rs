use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::pool::types::{AccountConfig, PoolSettings};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8087;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;

const DEFAULT_COOLDOWN_SECONDS: u64 = 60;
const DEFAULT_SHORT_WAIT_SECONDS: u64 = 120;
const DEFAULT_TOKEN_TTL_SECONDS: u64 = 3300;

pub const DEFAULT_OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const DEFAULT_OAUTH_CLIENT_SECRET: &str = "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";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub timeout_ms: u64,
    pub proxy: String,

    pub debug: String,

    pub oauth_client_id: String,
    pub oauth_client_secret: String,

    pub fallback_mode: bool,
    pub fallback_models: HashMap<String, String>,

    pub pool: PoolConfig,
}

/// 账号池描述：账号列表 + 调度策略参数 + 初始轮换指针。
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub accounts: Vec<AccountConfig>,
    pub settings: PoolSettings,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,

    #[serde(alias = "OAUTH_CLIENT_ID")]
    oauth_client_id: Option<String>,
    #[serde(alias = "OAUTH_CLIENT_SECRET")]
    oauth_client_secret: Option<String>,

    #[serde(alias = "ACCOUNTS_JSON")]
    accounts_json: Option<String>,
    #[serde(alias = "ACCOUNTS_FILE")]
    accounts_file: Option<String>,

    // 单账号退化配置：未提供账号池 JSON 时生效。
    #[serde(alias = "REFRESH_TOKEN")]
    refresh_token: Option<String>,
    #[serde(alias = "API_KEY")]
    api_key: Option<String>,
    #[serde(alias = "EMAIL")]
    email: Option<String>,
    #[serde(alias = "PROJECT_ID")]
    project_id: Option<String>,

    #[serde(alias = "FALLBACK_MODE")]
    fallback_mode: Option<String>,
    #[serde(alias = "FALLBACK_MODELS")]
    fallback_models: Option<String>,

    #[serde(alias = "COOLDOWN_SECONDS")]
    cooldown_seconds: Option<u64>,
    #[serde(alias = "SHORT_WAIT_SECONDS")]
    short_wait_seconds: Option<u64>,
    #[serde(alias = "TOKEN_TTL_SECONDS")]
    token_ttl_seconds: Option<u64>,
    #[serde(alias = "INITIAL_INDEX")]
    initial_index: Option<usize>,
}

/// ACCOUNTS_JSON / ACCOUNTS_FILE 的顶层结构。
/// 策略参数可以内嵌在 blob 里，也可以用环境变量覆盖（env 优先）。
#[derive(Debug, Deserialize)]
struct AccountsBlob {
    accounts: Vec<AccountConfig>,
    #[serde(default)]
    cooldown_seconds: Option<u64>,
    #[serde(default)]
    short_wait_seconds: Option<u64>,
    #[serde(default)]
    token_ttl_seconds: Option<u64>,
    #[serde(default)]
    initial_index: Option<usize>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let blob = load_accounts_blob(&raw)?;

        let accounts = match &blob {
            Some(b) => b.accounts.clone(),
            None => single_account_from_env(&raw),
        };

        let pick = |env_v: Option<u64>, blob_v: Option<u64>, default: u64| {
            env_v.or(blob_v).unwrap_or(default)
        };
        let settings = PoolSettings {
            cooldown_seconds: pick(
                raw.cooldown_seconds,
                blob.as_ref().and_then(|b| b.cooldown_seconds),
                DEFAULT_COOLDOWN_SECONDS,
            ),
            short_wait_seconds: pick(
                raw.short_wait_seconds,
                blob.as_ref().and_then(|b| b.short_wait_seconds),
                DEFAULT_SHORT_WAIT_SECONDS,
            ),
            token_ttl_seconds: pick(
                raw.token_ttl_seconds,
                blob.as_ref().and_then(|b| b.token_ttl_seconds),
                DEFAULT_TOKEN_TTL_SECONDS,
            ),
            initial_index: raw
                .initial_index
                .or(blob.as_ref().and_then(|b| b.initial_index))
                .unwrap_or(0),
        };

        Ok(Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            oauth_client_id: raw.oauth_client_id.unwrap_or_default(),
            oauth_client_secret: raw.oauth_client_secret.unwrap_or_default(),
            fallback_mode: parse_bool(raw.fallback_mode.as_deref()),
            fallback_models: parse_fallback_models(raw.fallback_models.as_deref()),
            pool: PoolConfig { accounts, settings },
        })
    }

    pub fn effective_oauth_client_id(&self) -> &str {
        let v = self.oauth_client_id.trim();
        if v.is_empty() { DEFAULT_OAUTH_CLIENT_ID } else { v }
    }

    pub fn effective_oauth_client_secret(&self) -> &str {
        let v = self.oauth_client_secret.trim();
        if v.is_empty() {
            DEFAULT_OAUTH_CLIENT_SECRET
        } else {
            v
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

fn load_accounts_blob(raw: &RawEnv) -> anyhow::Result<Option<AccountsBlob>> {
    let text = if let Some(inline) = raw.accounts_json.as_deref()
        && !inline.trim().is_empty()
    {
        inline.to_string()
    } else if let Some(path) = raw.accounts_file.as_deref()
        && !path.trim().is_empty()
    {
        std::fs::read_to_string(path.trim())
            .map_err(|e| anyhow::anyhow!("读取账号池文件 {path} 失败: {e}"))?
    } else {
        return Ok(None);
    };

    // 未知 source / 结构错误在启动期一次性拒绝，而不是运行期逐处容错。
    let blob = sonic_rs::from_str::<AccountsBlob>(&text)
        .map_err(|e| anyhow::anyhow!("账号池配置解析失败: {e}"))?;
    if blob.accounts.is_empty() {
        anyhow::bail!("账号池配置不包含任何账号");
    }
    Ok(Some(blob))
}

fn single_account_from_env(raw: &RawEnv) -> Vec<AccountConfig> {
    let email = raw
        .email
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "default@local".to_string());
    let project_id = raw.project_id.clone().filter(|s| !s.trim().is_empty());

    if let Some(rt) = raw.refresh_token.as_deref()
        && !rt.trim().is_empty()
    {
        return vec![AccountConfig::Oauth {
            email,
            refresh_token: rt.trim().to_string(),
            project_id,
        }];
    }
    if let Some(key) = raw.api_key.as_deref()
        && !key.trim().is_empty()
    {
        return vec![AccountConfig::Manual {
            email,
            api_key: key.trim().to_string(),
            project_id,
        }];
    }
    Vec::new()
}

fn parse_bool(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

/// FALLBACK_MODELS 形如 "model-a=model-b,model-c=model-d"。
fn parse_fallback_models(value: Option<&str>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(value) = value else {
        return out;
    };
    for pair in value.split(',') {
        let Some((from, to)) = pair.split_once('=') else {
            continue;
        };
        let (from, to) = (from.trim(), to.trim());
        if !from.is_empty() && !to.is_empty() {
            out.insert(from.to_string(), to.to_string());
        }
    }
    out
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let mut raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            raw = &raw[1..raw.len() - 1];
            return Some((key.to_string(), raw.to_string()));
        }
    }

    raw = strip_inline_comment(raw);
    Some((key.to_string(), raw.trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_blob_parses_tagged_union() {
        let text = r#"{
            "accounts": [
                {"source": "oauth", "email": "a@x.com", "refresh_token": "rt-1"},
                {"source": "manual", "email": "b@x.com", "api_key": "sk-1", "project_id": "p-1"}
            ],
            "cooldown_seconds": 90,
            "initial_index": 1
        }"#;
        let blob = sonic_rs::from_str::<AccountsBlob>(text).unwrap();
        assert_eq!(blob.accounts.len(), 2);
        assert_eq!(blob.cooldown_seconds, Some(90));
        assert_eq!(blob.initial_index, Some(1));
        match &blob.accounts[0] {
            AccountConfig::Oauth { email, refresh_token, .. } => {
                assert_eq!(email, "a@x.com");
                assert_eq!(refresh_token, "rt-1");
            }
            other => panic!("意外的账号类型: {other:?}"),
        }
    }

    #[test]
    fn unknown_account_source_is_rejected() {
        let text = r#"{"accounts": [{"source": "magic", "email": "a@x.com"}]}"#;
        assert!(sonic_rs::from_str::<AccountsBlob>(text).is_err());
    }

    #[test]
    fn fallback_models_parse_pairs() {
        let map = parse_fallback_models(Some("big=small, other=tiny,broken"));
        assert_eq!(map.get("big").map(String::as_str), Some("small"));
        assert_eq!(map.get("other").map(String::as_str), Some("tiny"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn dotenv_line_parsing() {
        assert_eq!(
            parse_dotenv_line("PORT=8087 # 端口"),
            Some(("PORT".to_string(), "8087".to_string()))
        );
        assert_eq!(
            parse_dotenv_line(r#"export PROXY="http://127.0.0.1:7890""#),
            Some(("PROXY".to_string(), "http://127.0.0.1:7890".to_string()))
        );
        assert_eq!(parse_dotenv_line("# comment"), None);
    }
}
