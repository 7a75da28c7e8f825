use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use toml_edit::DocumentMut;

use crate::encode::{DEFAULT_JPEG_QUALITY, DEFAULT_MAX_WIDTH, EncodeOptions};
use crate::validate::DEFAULT_MAX_UPLOAD_BYTES;

/// Default on-disk config filename
pub const DEFAULT_CONFIG_PATH: &str = "photoalbum.toml";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8001";
pub const DEFAULT_STORAGE_ROOT: &str = "uploads";
/// Overrides `storage.root` when set.
pub const STORAGE_ROOT_ENV: &str = "PHOTOALBUM_STORAGE_ROOT";

/// Strongly typed representation of the configuration file.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    pub server: Option<Server>,
    pub logging: Option<Logging>,
    pub storage: Option<Storage>,
    pub images: Option<ImageLimits>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub bind_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub filter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Storage {
    /// Upload root; photos live under `<root>/photos`.
    pub root: Option<PathBuf>,
    /// Catalog JSON file. Defaults to `<root>/catalog.json`.
    pub catalog: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ImageLimits {
    pub max_upload_bytes: Option<u64>,
    /// Stored photos wider than this are downscaled (aspect preserved).
    pub max_width: Option<u32>,
    pub jpeg_quality: Option<u8>,
}

pub struct ConfigManager;

impl ConfigManager {
    /// Load the config file. A missing file yields the all-defaults config.
    pub async fn load(path: Option<PathBuf>) -> Result<Config> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let text = if fs::try_exists(&path).await.unwrap_or(false) {
            fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading config file {}", path.display()))?
        } else {
            String::new()
        };
        Self::parse(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Config> {
        let doc = text.parse::<DocumentMut>()?;
        let typed: Config = toml_edit::de::from_document(doc)?;
        Ok(typed)
    }
}

/// Everything the running process needs, resolved once at start-up and
/// shared read-only.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_address: String,
    pub log_filter: Option<String>,
    pub storage_root: PathBuf,
    pub catalog_path: PathBuf,
    pub max_upload_bytes: u64,
    pub encode: EncodeOptions,
}

impl Settings {
    pub fn from_env(cfg: &Config) -> Self {
        Self::resolve(cfg, std::env::var_os(STORAGE_ROOT_ENV).map(PathBuf::from))
    }

    pub fn resolve(cfg: &Config, root_override: Option<PathBuf>) -> Self {
        let storage = cfg.storage.clone().unwrap_or_default();
        let images = cfg.images.clone().unwrap_or_default();
        let storage_root = root_override
            .or(storage.root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
        let catalog_path = storage
            .catalog
            .unwrap_or_else(|| storage_root.join("catalog.json"));
        Self {
            bind_address: cfg
                .server
                .as_ref()
                .and_then(|s| s.bind_address.clone())
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            log_filter: cfg.logging.as_ref().and_then(|l| l.filter.clone()),
            storage_root,
            catalog_path,
            max_upload_bytes: images.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            encode: EncodeOptions {
                max_width: Some(images.max_width.unwrap_or(DEFAULT_MAX_WIDTH)),
                jpeg_quality: images
                    .jpeg_quality
                    .unwrap_or(DEFAULT_JPEG_QUALITY)
                    .clamp(1, 100),
            },
        }
    }

    /// Defaults rooted at `root`.
    #[cfg(test)]
    pub fn for_root(root: &std::path::Path) -> Self {
        Self::resolve(&Config::default(), Some(root.to_path_buf()))
    }

    pub fn photos_dir(&self) -> PathBuf {
        self.storage_root.join("photos")
    }
}
