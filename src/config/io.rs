use std::env::current_exe;
use std::path::{Path, PathBuf};
use std::str;
use directories_next::ProjectDirs;
use log::{debug, info, warn};
use tokio::fs;

use crate::config::types::Config;
use crate::error::ConfigError;

// creates a path to a json file with the same name as the executable, next to it
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // F:\embre-agent.exe => F:\embre-agent.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to embre-agent.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("app", "ecig", "embre-agent").map(|dirs| {
        dirs.config_dir().join("embre-agent.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        match std::fs::metadata(&path) {
            Ok(attr) => {
                if attr.is_file() {
                    return Ok(path);
                }
            },
            Err(err) => {
                debug!("Could not read metadata of: {}; Using local path instead. ({:?})", path.to_string_lossy(), err);
            },
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

#[derive(Debug, Clone)]
pub struct ConfigIO {
    path: PathBuf,
}

impl ConfigIO {
    pub fn new() -> Result<Self, ConfigError> {
        let path = get_config_path()?;
        info!("Using config file {}", path.to_string_lossy());
        Ok(ConfigIO { path })
    }

    pub fn at(path: &Path) -> Self {
        ConfigIO { path: path.to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        debug!("Reading config file");
        let content = fs::read(&self.path).await?;

        if content.is_empty() {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    /// Like [`ConfigIO::read`], but a missing file means the defaults.
    pub async fn read_or_default(&self) -> Result<Config, ConfigError> {
        match self.read().await {
            Err(err) if err.is_file_not_found_error() => {
                // this is probably the first start
                info!("Config file not found, using defaults");
                Ok(Config::default())
            },
            result => result,
        }
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        info!("Saving config");

        if let Some(directory) = self.path.parent() {
            fs::create_dir_all(directory).await?;
        }

        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content.as_bytes()).await?;
        Ok(())
    }
}
