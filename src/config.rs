use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::upload::UploadLimits;

const DEFAULT_ENV_PREFIX: &str = "POSTDECK";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default = "default_api_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: String::new(),
            timeout: default_api_timeout(),
        }
    }
}

fn default_base_url() -> String {
    crate::api::DEFAULT_BASE_URL.to_string()
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default = "default_page_size")]
    pub content_page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            content_page_size: default_page_size(),
        }
    }
}

fn default_cache_ttl() -> Duration {
    crate::cache::DEFAULT_TTL
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthConfig {
    #[serde(default)]
    pub trusted_origins: Vec<String>,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_oauth_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_popup_width")]
    pub popup_width: u32,
    #[serde(default = "default_popup_height")]
    pub popup_height: u32,
    #[serde(default = "default_callback_addr")]
    pub callback_addr: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            trusted_origins: Vec::new(),
            poll_interval: default_poll_interval(),
            timeout: default_oauth_timeout(),
            popup_width: default_popup_width(),
            popup_height: default_popup_height(),
            callback_addr: default_callback_addr(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_oauth_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_popup_width() -> u32 {
    500
}

fn default_popup_height() -> u32 {
    600
}

fn default_callback_addr() -> String {
    "127.0.0.1:0".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadConfig {
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    #[serde(default = "default_max_video_bytes")]
    pub max_video_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            max_video_bytes: default_max_video_bytes(),
        }
    }
}

impl UploadConfig {
    pub fn limits(&self) -> UploadLimits {
        UploadLimits {
            max_image_bytes: self.max_image_bytes,
            max_video_bytes: self.max_video_bytes,
        }
    }
}

fn default_max_image_bytes() -> u64 {
    UploadLimits::default().max_image_bytes
}

fn default_max_video_bytes() -> u64 {
    UploadLimits::default().max_video_bytes
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            cfg = read_config_file(path)?;
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            cfg = read_config_file(&default_path)?;
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.api.timeout = duration;
            }
        }
        "cache.ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.cache.ttl = duration;
            }
        }
        "cache.content_page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.cache.content_page_size = parsed;
            }
        }
        "oauth.trusted_origins" => {
            cfg.oauth.trusted_origins = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "oauth.poll_interval" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.oauth.poll_interval = duration;
            }
        }
        "oauth.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.oauth.timeout = duration;
            }
        }
        "oauth.callback_addr" => cfg.oauth.callback_addr = value,
        "upload.max_image_bytes" => {
            if let Ok(parsed) = value.parse::<u64>() {
                cfg.upload.max_image_bytes = parsed;
            }
        }
        "upload.max_video_bytes" => {
            if let Ok(parsed) = value.parse::<u64>() {
                cfg.upload.max_video_bytes = parsed;
            }
        }
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("postdeck").join("config.yaml"))
}
