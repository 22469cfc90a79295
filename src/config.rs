#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_EXTRACTOR: &str = "yt-dlp";

/// Everything the backend needs at startup, resolved from CLI overrides, the
/// process environment and the `.env` file, in that order.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: IpAddr,
    pub port: u16,
    pub extractor: PathBuf,
    pub blocklist: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    /// Applies to metadata and playlist calls only, never to streams.
    pub extractor_timeout: Option<Duration>,
    pub max_concurrent: Option<usize>,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub extractor: Option<PathBuf>,
    pub blocklist: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let host = match overrides.host {
        Some(host) => host,
        None => {
            let raw = lookup_value("AQUASEAL_HOST", file_vars, &env_lookup)
                .unwrap_or_else(|| DEFAULT_HOST.to_string());
            raw.parse::<IpAddr>()
                .with_context(|| format!("AQUASEAL_HOST is not an IP address: {raw}"))?
        }
    };
    let port = match overrides.port {
        Some(port) => port,
        None => match lookup_value("AQUASEAL_PORT", file_vars, &env_lookup)
            .or_else(|| lookup_value("PORT", file_vars, &env_lookup))
        {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("port must be between 0 and 65535, got {raw}"))?,
            None => DEFAULT_PORT,
        },
    };
    let extractor = overrides
        .extractor
        .or_else(|| lookup_value("YT_DLP_BIN", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTRACTOR));
    let blocklist = overrides
        .blocklist
        .or_else(|| lookup_value("AQUASEAL_BLOCKLIST", file_vars, &env_lookup).map(PathBuf::from));
    let www_root = overrides
        .www_root
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup).map(PathBuf::from));

    let extractor_timeout =
        match lookup_value("AQUASEAL_EXTRACTOR_TIMEOUT_SECS", file_vars, &env_lookup) {
            Some(raw) => {
                let secs = raw
                    .parse::<u64>()
                    .map_err(|_| anyhow!("AQUASEAL_EXTRACTOR_TIMEOUT_SECS must be whole seconds"))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };
    let max_concurrent = match lookup_value("AQUASEAL_MAX_CONCURRENT", file_vars, &env_lookup) {
        Some(raw) => {
            let limit = raw
                .parse::<usize>()
                .map_err(|_| anyhow!("AQUASEAL_MAX_CONCURRENT must be a positive integer"))?;
            (limit > 0).then_some(limit)
        }
        None => None,
    };
    let allowed_origins = lookup_value("ALLOWED_ORIGINS", file_vars, &env_lookup)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(RuntimeConfig {
        host,
        port,
        extractor,
        blocklist,
        www_root,
        extractor_timeout,
        max_concurrent,
        allowed_origins,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Process environment first, then the env file. Blank values count as
/// unset.
fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let non_blank = |value: String| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    env_lookup(key)
        .and_then(non_blank)
        .or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
