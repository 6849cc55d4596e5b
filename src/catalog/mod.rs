//! Channel catalog
//!
//! The catalog is an ordered list of channel groups. Readers take a cheap
//! snapshot (`Arc`) and never observe a half-applied update: `replace`
//! validates the whole input first and then swaps the snapshot pointer.

pub mod playlist;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;

pub use playlist::{render, PlaylistFormat};

/// A channel and its ordered fallback sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Stable identifier, unique within the group (e.g. "CCTV-1")
    pub name: String,

    /// Human readable name, falls back to `name` when empty
    #[serde(default, deserialize_with = "null_as_default")]
    pub display_name: String,

    /// Logo URL
    #[serde(default, deserialize_with = "null_as_default")]
    pub logo: String,

    /// Hidden channels are left out of exported playlists
    #[serde(default, deserialize_with = "null_as_default")]
    pub hide: bool,

    /// Candidate sources, first one preferred. Entries starting with
    /// `http` are external URLs, anything else is a multicast `ip:port`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub sources: Vec<String>,
}

impl Channel {
    /// Create a visible channel with the given sources
    pub fn new(name: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            name: name.into(),
            display_name: String::new(),
            logo: String::new(),
            hide: false,
            sources,
        }
    }

    /// Name to show to viewers
    pub fn title(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }

    /// Whether the channel is exported to players
    pub fn is_playable(&self) -> bool {
        !self.hide && !self.sources.is_empty()
    }
}

/// A named, ordered group of channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub name: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub channels: Vec<Channel>,
}

impl ChannelGroup {
    pub fn new(name: impl Into<String>, channels: Vec<Channel>) -> Self {
        Self {
            name: name.into(),
            channels,
        }
    }
}

/// Treat an explicit JSON `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Process-wide channel catalog
#[derive(Debug, Default)]
pub struct ChannelCatalog {
    snapshot: RwLock<Arc<Vec<ChannelGroup>>>,
}

impl ChannelCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog from already persisted groups
    ///
    /// Invalid input is rejected the same way `replace` rejects it.
    pub fn with_groups(groups: Vec<ChannelGroup>) -> Result<Self, ValidationError> {
        Self::validate(&groups)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(groups)),
        })
    }

    /// Current catalog snapshot
    pub fn list(&self) -> Arc<Vec<ChannelGroup>> {
        Arc::clone(&self.snapshot.read())
    }

    /// Replace the whole catalog
    ///
    /// On error the previous catalog stays in place.
    pub fn replace(&self, groups: Vec<ChannelGroup>) -> Result<(), ValidationError> {
        Self::validate(&groups)?;

        let group_count = groups.len();
        let channel_count: usize = groups.iter().map(|g| g.channels.len()).sum();
        *self.snapshot.write() = Arc::new(groups);

        tracing::info!(
            groups = group_count,
            channels = channel_count,
            "Channel catalog replaced"
        );
        Ok(())
    }

    /// Check group and channel names, stopping at the first conflict
    pub fn validate(groups: &[ChannelGroup]) -> Result<(), ValidationError> {
        let mut group_names = HashSet::with_capacity(groups.len());

        for (gi, group) in groups.iter().enumerate() {
            if group.name.is_empty() {
                return Err(ValidationError::EmptyGroupName(gi));
            }
            if !group_names.insert(group.name.as_str()) {
                return Err(ValidationError::DuplicateGroup(group.name.clone()));
            }

            let mut channel_names = HashSet::with_capacity(group.channels.len());
            for (ci, channel) in group.channels.iter().enumerate() {
                if channel.name.is_empty() {
                    return Err(ValidationError::EmptyChannelName {
                        group: group.name.clone(),
                        index: ci,
                    });
                }
                if !channel_names.insert(channel.name.as_str()) {
                    return Err(ValidationError::DuplicateChannel {
                        group: group.name.clone(),
                        channel: channel.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Find a channel by name, searching groups in display order
    pub fn find_channel(&self, name: &str) -> Option<Channel> {
        self.list()
            .iter()
            .flat_map(|g| g.channels.iter())
            .find(|c| c.name == name)
            .cloned()
    }
}
