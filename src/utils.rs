use std::path::{Path, PathBuf};
use std::{env, fs};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use tracing::{info, warn, Level};

use crate::error::StartupError;
use crate::gemini::DEFAULT_BASE_URL;

/// Candidate locations of the env file holding the API credential.
pub const ENV_FILES: [&str; 2] = [".env.local", "../.env.local"];

const DEFAULT_MODEL_PATH: &str = "../ml_models/vit_model_version_one.pth";
const DEFAULT_CLASS_NAMES_PATH: &str = "../ml_models/class_names.json";

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub model_path: PathBuf,
    pub class_names_path: PathBuf,
    pub model_url: Option<String>,
    pub class_names_url: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub log_level: Level,
}

impl Settings {
    pub fn from_env() -> Result<Self, StartupError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] but reads through `lookup`, so tests need
    /// not touch the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StartupError> {
        let body_limit_mb: usize = parse_or(&lookup, "BODY_LIMIT_MB", 10)?;
        let body_limit_bytes = body_limit_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            StartupError::Configuration(format!("BODY_LIMIT_MB {} is too large", body_limit_mb))
        })?;
        let log_level = match lookup("LOG_LEVEL") {
            Some(raw) => raw.parse::<Level>().map_err(|_| {
                StartupError::Configuration(format!("LOG_LEVEL `{}` is not a tracing level", raw))
            })?,
            None => Level::INFO,
        };

        Ok(Self {
            port: parse_or(&lookup, "PORT", 8000)?,
            body_limit_bytes,
            model_path: lookup("MODEL_PATH")
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.into())
                .into(),
            class_names_path: lookup("CLASS_NAMES_PATH")
                .unwrap_or_else(|| DEFAULT_CLASS_NAMES_PATH.into())
                .into(),
            model_url: lookup("MODEL_URL"),
            class_names_url: lookup("CLASS_NAMES_URL"),
            gemini_api_key: lookup("GEMINI_API_KEY"),
            gemini_base_url: lookup("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            log_level,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, StartupError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| StartupError::Configuration(format!("{} must be a valid number, got `{}`", key, raw))),
        None => Ok(default),
    }
}

/// Loads the first env file that exists and reports which one. Runs before
/// logging is set up, so the caller logs the outcome.
pub fn load_env_file() -> Result<Option<PathBuf>, StartupError> {
    for candidate in ENV_FILES {
        let path = Path::new(candidate);
        if path.exists() {
            dotenvy::from_path(path).map_err(|e| {
                StartupError::Configuration(format!("cannot parse {}: {}", path.display(), e))
            })?;
            return Ok(Some(path.to_path_buf()));
        }
    }
    Ok(None)
}

async fn download_file(url: &str, path: &Path) -> Result<(), StartupError> {
    info!("Downloading {} from {}", path.display(), url);
    let download_err = |e: reqwest::Error| {
        StartupError::Configuration(format!("failed to download {}: {}", url, e))
    };

    let mut header_map = HeaderMap::new();
    if let Ok(token) = env::var("GITHUB_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| StartupError::Configuration("Invalid GITHUB_TOKEN format".into()))?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let response = reqwest::Client::new()
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(download_err)?;

    if !response.status().is_success() {
        return Err(StartupError::Configuration(format!(
            "failed to download {}: {}",
            url,
            response.status()
        )));
    }

    let bytes = response.bytes().await.map_err(download_err)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            StartupError::Configuration(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }
    fs::write(path, bytes)
        .map_err(|e| StartupError::Configuration(format!("cannot write {}: {}", path.display(), e)))
}

/// Fetches the class file and checkpoint when missing and a URL is configured.
/// Without a URL a missing file is left for the loaders to report.
pub async fn ensure_files_exist(settings: &Settings) -> Result<(), StartupError> {
    info!("Checking model artifacts...");
    let artifacts = [
        (&settings.class_names_path, &settings.class_names_url),
        (&settings.model_path, &settings.model_url),
    ];
    for (path, url) in artifacts {
        if path.exists() {
            continue;
        }
        match url {
            Some(url) => download_file(url, path).await?,
            None => warn!("{} is missing and no download URL is set", path.display()),
        }
    }
    Ok(())
}
