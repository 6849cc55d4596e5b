//! On-disk configuration file
//!
//! A single JSON document holds both the relay configuration and the
//! channel catalog. Values are stored as the operator entered them;
//! populated defaults are never written back.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::Config;
use crate::catalog::ChannelGroup;
use crate::error::Result;

/// Default file name, looked up in the working directory first and then
/// next to the executable
pub const DEFAULT_CONFIG_FILE: &str = "myiptv.json";

/// Persisted document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub config: Config,

    #[serde(default)]
    pub channel_groups: Vec<ChannelGroup>,
}

/// Serialized access to the configuration file
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    document: Mutex<ConfigDocument>,
}

impl ConfigFile {
    /// Resolve the file location
    ///
    /// An explicit path is used as is. Otherwise `myiptv.json` in the working
    /// directory wins over one beside the executable.
    pub fn locate(explicit: Option<PathBuf>) -> PathBuf {
        if let Some(path) = explicit {
            return path;
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            return local;
        }

        match std::env::current_exe() {
            Ok(exe) => {
                let beside = exe
                    .parent()
                    .map(|dir| dir.join(DEFAULT_CONFIG_FILE))
                    .unwrap_or_else(|| local.clone());
                if beside.is_file() {
                    beside
                } else {
                    local
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to get executable path");
                local
            }
        }
    }

    /// Load the file, falling back to defaults when missing or malformed
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let document = match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<ConfigDocument>(&data) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "Failed to decode configuration file"
                    );
                    ConfigDocument::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to open configuration file, using defaults"
                );
                ConfigDocument::default()
            }
        };

        Self {
            path,
            document: Mutex::new(document),
        }
    }

    /// File location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the loaded document
    pub async fn document(&self) -> ConfigDocument {
        self.document.lock().await.clone()
    }

    /// Persist a new configuration, keeping the stored catalog
    pub async fn save_config(&self, config: Config) -> Result<()> {
        let mut doc = self.document.lock().await;
        let mut next = doc.clone();
        next.config = config;
        self.write(&next).await?;
        *doc = next;
        Ok(())
    }

    /// Persist a new catalog, keeping the stored configuration
    pub async fn save_channel_groups(&self, groups: Vec<ChannelGroup>) -> Result<()> {
        let mut doc = self.document.lock().await;
        let mut next = doc.clone();
        next.channel_groups = groups;
        self.write(&next).await?;
        *doc = next;
        Ok(())
    }

    async fn write(&self, doc: &ConfigDocument) -> Result<()> {
        let data = serde_json::to_vec_pretty(doc)?;
        if let Err(e) = tokio::fs::write(&self.path, data).await {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Failed to write configuration file"
            );
            return Err(e.into());
        }
        Ok(())
    }
}
