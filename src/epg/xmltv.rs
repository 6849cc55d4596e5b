//! XMLTV guide provider
//!
//! Downloads the whole guide from the configured URL, keeps the parsed
//! document for a while and answers per-channel fetches from it. A failed
//! download is remembered too, so a broken upstream is hit once per
//! retry window rather than once per channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{day_bounds, EpgProvider, Programme, DEFAULT_FAILURE_TTL, DEFAULT_TTL};
use crate::config::ConfigStore;
use crate::error::{Error, Result};

/// Timestamp layout used by XMLTV `start`/`stop` attributes
const XMLTV_TIME_FORMAT: &str = "%Y%m%d%H%M%S %z";

/// Programmes per channel display name
pub type Guide = HashMap<String, Vec<Programme>>;

#[derive(Debug)]
enum Outcome {
    Guide(Arc<Guide>),
    Failed(String),
}

#[derive(Debug)]
struct Download {
    url: String,
    generation: u64,
    fetched: Instant,
    outcome: Outcome,
}

/// Fetches an XMLTV document over HTTP
pub struct XmltvProvider {
    client: reqwest::Client,
    config: Arc<ConfigStore>,
    max_age: Duration,
    retry_after: Duration,
    generation: AtomicU64,
    download: Mutex<Option<Download>>,
}

impl XmltvProvider {
    pub fn new(client: reqwest::Client, config: Arc<ConfigStore>) -> Self {
        Self {
            client,
            config,
            max_age: DEFAULT_TTL,
            retry_after: DEFAULT_FAILURE_TTL,
            generation: AtomicU64::new(0),
            download: Mutex::new(None),
        }
    }

    /// Set how long a downloaded guide is reused
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set how long a failed download is reported without retrying
    pub fn retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// The parsed guide, downloading it when missing or stale
    async fn guide(&self) -> Result<Arc<Guide>> {
        let url = self.config.get().epg_url.clone();
        let generation = self.generation.load(Ordering::Acquire);

        let mut download = self.download.lock().await;
        if let Some(current) = download.as_ref() {
            if current.url == url && current.generation == generation {
                let age = current.fetched.elapsed();
                match &current.outcome {
                    Outcome::Guide(guide) if age < self.max_age => {
                        return Ok(Arc::clone(guide));
                    }
                    Outcome::Failed(reason) if age < self.retry_after => {
                        return Err(Error::GuideUnavailable(reason.clone()));
                    }
                    _ => {}
                }
            }
        }

        let (outcome, result) = match self.download(&url).await {
            Ok(guide) => {
                let guide = Arc::new(guide);
                (Outcome::Guide(Arc::clone(&guide)), Ok(guide))
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "XMLTV download failed");
                (Outcome::Failed(e.to_string()), Err(e))
            }
        };
        *download = Some(Download {
            url,
            generation,
            fetched: Instant::now(),
            outcome,
        });
        result
    }

    async fn download(&self, url: &str) -> Result<Guide> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::UpstreamStatus(response.status().as_u16()));
        }
        let body = response.bytes().await?;

        let cutoff = day_bounds(Local::now().date_naive(), &Local)
            .map(|(start, _)| start)
            .unwrap_or_else(Utc::now);

        let guide = tokio::task::spawn_blocking(move || parse(&body, cutoff))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        tracing::info!(
            url = %url,
            channels = guide.len(),
            programmes = guide.values().map(Vec::len).sum::<usize>(),
            "XMLTV guide downloaded"
        );

        Ok(guide)
    }
}

#[async_trait]
impl EpgProvider for XmltvProvider {
    async fn fetch(&self, channel: &str) -> Result<Vec<Programme>> {
        let guide = self.guide().await?;
        Ok(guide.get(channel).cloned().unwrap_or_default())
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    DisplayName,
    Title,
    Desc,
}

#[derive(Debug, Default)]
struct PendingProgramme {
    channel: String,
    start: String,
    stop: String,
    title: String,
    desc: String,
}

impl PendingProgramme {
    fn finish(self) -> Option<(String, Programme)> {
        let start = parse_time(&self.start)?;
        let end = parse_time(&self.stop)?;
        Some((
            self.channel,
            Programme {
                start,
                end,
                title: self.title,
                desc: self.desc,
            },
        ))
    }
}

fn parse_time(s: &str) -> Option<DateTime<FixedOffset>> {
    match DateTime::parse_from_str(s.trim(), XMLTV_TIME_FORMAT) {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::debug!(time = %s, error = %e, "Unparseable XMLTV timestamp");
            None
        }
    }
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    let attr = element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)?;
    match attr.unescape_value() {
        Ok(value) => Some(value.into_owned()),
        Err(e) => {
            tracing::debug!(error = %e, "Unreadable XMLTV attribute");
            Some(String::from_utf8_lossy(&attr.value).into_owned())
        }
    }
}

/// Parse an XMLTV document into programmes per channel display name
///
/// Programmes are keyed by the first `display-name` of their channel, or
/// by the channel id when the document does not name it. Programmes that
/// ended before `cutoff` are dropped. A malformed element is skipped and
/// parsing resumes after it; whatever was read before an unrecoverable
/// error is kept.
pub fn parse(xml: &[u8], cutoff: DateTime<Utc>) -> Guide {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut names: HashMap<String, String> = HashMap::new();
    let mut by_id: HashMap<String, Vec<Programme>> = HashMap::new();

    let mut channel_id: Option<String> = None;
    let mut pending: Option<PendingProgramme> = None;
    let mut field = Field::None;
    let mut skipped = 0usize;
    let mut last_error_at = None;
    let mut buf = Vec::new();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(
                    position = reader.error_position(),
                    error = %e,
                    "Skipping malformed XMLTV element"
                );
                if pending.take().is_some() {
                    skipped += 1;
                }
                field = Field::None;
                // The reader made no progress since the last error.
                let at = reader.buffer_position();
                if last_error_at == Some(at) {
                    break;
                }
                last_error_at = Some(at);
                buf.clear();
                continue;
            }
        };

        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"channel" => channel_id = attribute(&e, b"id"),
                b"display-name" if channel_id.is_some() => field = Field::DisplayName,
                b"programme" => {
                    pending = Some(PendingProgramme {
                        channel: attribute(&e, b"channel").unwrap_or_default(),
                        start: attribute(&e, b"start").unwrap_or_default(),
                        stop: attribute(&e, b"stop").unwrap_or_default(),
                        ..Default::default()
                    })
                }
                b"title" if pending.is_some() => field = Field::Title,
                b"desc" if pending.is_some() => field = Field::Desc,
                _ => {}
            },
            Event::Text(t) => {
                let text = match t.unescape() {
                    Ok(text) => text.into_owned(),
                    Err(_) => String::from_utf8_lossy(&t).into_owned(),
                };
                append_text(field, &text, channel_id.as_deref(), &mut names, pending.as_mut());
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c).into_owned();
                append_text(field, &text, channel_id.as_deref(), &mut names, pending.as_mut());
            }
            Event::End(e) => match e.name().as_ref() {
                b"channel" => channel_id = None,
                b"display-name" | b"title" | b"desc" => field = Field::None,
                b"programme" => {
                    let finished = pending.take().and_then(PendingProgramme::finish);
                    if let Some((id, programme)) = finished {
                        if programme.end.with_timezone(&Utc) >= cutoff {
                            by_id.entry(id).or_default().push(programme);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if skipped > 0 {
        tracing::warn!(skipped, "Malformed XMLTV programmes skipped");
    }

    by_id
        .into_iter()
        .map(|(id, programmes)| {
            let name = names.get(&id).cloned().unwrap_or(id);
            (name, programmes)
        })
        .collect()
}

fn append_text(
    field: Field,
    text: &str,
    channel_id: Option<&str>,
    names: &mut HashMap<String, String>,
    pending: Option<&mut PendingProgramme>,
) {
    match (field, pending) {
        (Field::DisplayName, _) => {
            if let Some(id) = channel_id {
                names.entry(id.to_string()).or_insert_with(|| text.to_string());
            }
        }
        (Field::Title, Some(p)) => p.title.push_str(text),
        (Field::Desc, Some(p)) => p.desc.push_str(text),
        _ => {}
    }
}
