//! Playlist export for IPTV players
//!
//! Two formats are supported: extended M3U and the plain text "DIYP"
//! format (`group,#genre#` headers followed by `name,url` lines).

use std::fmt::Write;
use std::str::FromStr;

use super::ChannelGroup;

/// Playlist output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistFormat {
    M3u,
    Text,
}

impl PlaylistFormat {
    /// MIME type of the rendered playlist
    pub fn content_type(&self) -> &'static str {
        match self {
            PlaylistFormat::M3u => "application/x-mpegURL;charset=UTF-8",
            PlaylistFormat::Text => "text/plain;charset=UTF-8",
        }
    }
}

impl FromStr for PlaylistFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "m3u" | "m3u8" => Ok(PlaylistFormat::M3u),
            "" | "txt" | "text" => Ok(PlaylistFormat::Text),
            other => Err(format!("unsupported playlist format: {}", other)),
        }
    }
}

/// URL a player should open for `source`
///
/// External HTTP sources are passed through; multicast sources are routed
/// through this server's relay endpoint.
pub fn source_url(server_addr: &str, source: &str) -> String {
    if source.to_ascii_lowercase().starts_with("http") {
        source.to_string()
    } else {
        format!("http://{}/iptv/relay/{}", server_addr, source)
    }
}

/// Render the catalog as a playlist
pub fn render(groups: &[ChannelGroup], server_addr: &str, format: PlaylistFormat) -> String {
    match format {
        PlaylistFormat::M3u => render_m3u(groups, server_addr),
        PlaylistFormat::Text => render_text(groups, server_addr),
    }
}

fn render_m3u(groups: &[ChannelGroup], server_addr: &str) -> String {
    let mut out = String::from("#EXTM3U\n");
    let mut id = 1;

    for group in groups {
        for ch in group.channels.iter().filter(|c| c.is_playable()) {
            let _ = writeln!(
                out,
                r#"#EXTINF:-1 tvg-id="{}" tvg-name="{}" tvg-logo="{}" group-title="{}",{}"#,
                id,
                ch.name,
                ch.logo,
                group.name,
                ch.title()
            );
            let _ = writeln!(out, "{}", source_url(server_addr, &ch.sources[0]));
            id += 1;
        }
    }

    out
}

fn render_text(groups: &[ChannelGroup], server_addr: &str) -> String {
    let mut out = String::new();

    for group in groups {
        let _ = writeln!(out, "{},#genre#", group.name);
        for ch in group.channels.iter().filter(|c| c.is_playable()) {
            for src in &ch.sources {
                let _ = writeln!(out, "{},{}", ch.name, source_url(server_addr, src));
            }
        }
        out.push('\n');
    }

    out
}
