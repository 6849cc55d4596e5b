//! Electronic program guide
//!
//! [`EpgCache`] memoizes listings per channel in front of an
//! [`EpgProvider`]. Guide data is best effort: a provider failure yields
//! an empty listing, never an error.

pub mod xmltv;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Result;

pub use xmltv::XmltvProvider;

/// Default lifetime of a cached listing
pub const DEFAULT_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Lifetime of the empty listing cached after a provider failure
pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(60);

/// One programme of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Programme {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub title: String,
    pub desc: String,
}

impl Programme {
    /// Whether the programme overlaps `[from, to)`
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start.with_timezone(&Utc) < to && self.end.with_timezone(&Utc) > from
    }
}

/// Upstream source of programme listings
#[async_trait]
pub trait EpgProvider: Send + Sync {
    /// Listings for `channel`, in guide order
    async fn fetch(&self, channel: &str) -> Result<Vec<Programme>>;

    /// Forget anything the provider memoized itself
    fn invalidate(&self) {}
}

#[derive(Debug)]
struct CacheEntry {
    programmes: Arc<Vec<Programme>>,
    expires: Instant,
}

type Slot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Per-channel TTL cache of programme listings
///
/// Concurrent misses for one channel wait on the same slot, so the
/// provider sees a single fetch. Expired slots nobody is using are pruned
/// whenever a new channel is added, so the map only holds live listings.
pub struct EpgCache {
    provider: Arc<dyn EpgProvider>,
    ttl: Duration,
    failure_ttl: Duration,
    slots: parking_lot::Mutex<HashMap<String, Slot>>,
}

impl EpgCache {
    pub fn new(provider: Arc<dyn EpgProvider>) -> Self {
        Self {
            provider,
            ttl: DEFAULT_TTL,
            failure_ttl: DEFAULT_FAILURE_TTL,
            slots: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Set the lifetime of a successful fetch
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the lifetime of a failed fetch
    pub fn failure_ttl(mut self, ttl: Duration) -> Self {
        self.failure_ttl = ttl;
        self
    }

    /// Listings for `channel`, fetched on miss or expiry
    pub async fn get(&self, channel: &str) -> Arc<Vec<Programme>> {
        let slot = self.slot(channel);

        let mut entry = slot.lock().await;
        if let Some(cached) = entry.as_ref() {
            if Instant::now() < cached.expires {
                return Arc::clone(&cached.programmes);
            }
        }

        let (programmes, ttl) = match self.provider.fetch(channel).await {
            Ok(programmes) => {
                tracing::info!(
                    channel = %channel,
                    programmes = programmes.len(),
                    "EPG refreshed"
                );
                (programmes, self.ttl)
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "EPG fetch failed");
                (Vec::new(), self.failure_ttl)
            }
        };

        let programmes = Arc::new(programmes);
        *entry = Some(CacheEntry {
            programmes: Arc::clone(&programmes),
            expires: Instant::now() + ttl,
        });
        programmes
    }

    fn slot(&self, channel: &str) -> Slot {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(channel) {
            return Arc::clone(slot);
        }

        let now = Instant::now();
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot
                    .try_lock()
                    .map_or(true, |entry| entry.as_ref().is_some_and(|e| now < e.expires))
        });
        Arc::clone(slots.entry(channel.to_string()).or_default())
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Drop every cached listing
    pub fn clear(&self) {
        let n = {
            let mut slots = self.slots.lock();
            let n = slots.len();
            slots.clear();
            n
        };
        self.provider.invalidate();
        tracing::info!(channels = n, "EPG cache cleared");
    }
}

/// Parse `YYYY-MM-DD` or `YYYYMMDD`
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let compact: String = s.chars().filter(|c| *c != '-').collect();
    NaiveDate::parse_from_str(&compact, "%Y%m%d").ok()
}

/// Start and end of `date` in `tz`, as UTC instants
pub fn day_bounds<Tz: TimeZone>(
    date: NaiveDate,
    tz: &Tz,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = date
        .and_hms_opt(0, 0, 0)?
        .and_local_timezone(tz.clone())
        .earliest()?;
    let end = date
        .succ_opt()?
        .and_hms_opt(0, 0, 0)?
        .and_local_timezone(tz.clone())
        .earliest()?;
    Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}

/// Programmes overlapping `date` in `tz`
pub fn programmes_on<Tz: TimeZone>(
    programmes: &[Programme],
    date: NaiveDate,
    tz: &Tz,
) -> Vec<Programme> {
    let Some((from, to)) = day_bounds(date, tz) else {
        return Vec::new();
    };
    programmes
        .iter()
        .filter(|p| p.overlaps(from, to))
        .cloned()
        .collect()
}

/// Guide of one channel for one day, as DIYP-style players expect it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiypGuide {
    pub channel_name: String,
    pub date: String,
    pub epg_data: Vec<DiypProgramme>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiypProgramme {
    pub start: String,
    pub end: String,
    pub title: String,
    pub desc: String,
}

impl DiypGuide {
    /// Build the guide for `date`, with times shown as `HH:MM` in `tz`
    pub fn build<Tz>(channel: &str, date: NaiveDate, programmes: &[Programme], tz: &Tz) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let epg_data = programmes_on(programmes, date, tz)
            .into_iter()
            .map(|p| DiypProgramme {
                start: p.start.with_timezone(tz).format("%H:%M").to_string(),
                end: p.end.with_timezone(tz).format("%H:%M").to_string(),
                title: p.title,
                desc: p.desc,
            })
            .collect();

        Self {
            channel_name: channel.to_string(),
            date: date.format("%Y%m%d").to_string(),
            epg_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::Error;

    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingProvider {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EpgProvider for CountingProvider {
        async fn fetch(&self, channel: &str) -> Result<Vec<Programme>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                return Err(Error::UpstreamStatus(503));
            }
            Ok(vec![programme(channel, "2024-03-01T20:00:00+00:00", "2024-03-01T21:00:00+00:00")])
        }
    }

    fn programme(title: &str, start: &str, end: &str) -> Programme {
        Programme {
            start: DateTime::parse_from_rfc3339(start).unwrap(),
            end: DateTime::parse_from_rfc3339(end).unwrap(),
            title: title.to_string(),
            desc: String::new(),
        }
    }

    #[tokio::test]
    async fn test_second_get_within_ttl_is_cached() {
        tokio::time::pause();
        let provider = CountingProvider::new(false);
        let cache = EpgCache::new(provider.clone());

        let first = cache.get("bbc").await;
        let second = cache.get("bbc").await;

        assert_eq!(provider.calls(), 1);
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_expired_entry_refetched() {
        tokio::time::pause();
        let provider = CountingProvider::new(false);
        let cache = EpgCache::new(provider.clone()).ttl(Duration::from_secs(60));

        cache.get("bbc").await;
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get("bbc").await;

        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_channels_cached_separately() {
        tokio::time::pause();
        let provider = CountingProvider::new(false);
        let cache = EpgCache::new(provider.clone());

        assert_eq!(cache.get("bbc").await[0].title, "bbc");
        assert_eq!(cache.get("cnn").await[0].title, "cnn");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        tokio::time::pause();
        let provider = CountingProvider::new(false);
        let cache = Arc::new(EpgCache::new(provider.clone()));

        let (a, b) = tokio::join!(cache.get("bbc"), cache.get("bbc"));

        assert_eq!(provider.calls(), 1);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_failure_yields_empty_and_is_cached_briefly() {
        tokio::time::pause();
        let provider = CountingProvider::new(true);
        let cache = EpgCache::new(provider.clone()).failure_ttl(Duration::from_secs(5));

        assert!(cache.get("bbc").await.is_empty());
        assert!(cache.get("bbc").await.is_empty());
        assert_eq!(provider.calls(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        cache.get("bbc").await;
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_slots_pruned_on_new_channel() {
        tokio::time::pause();
        let provider = CountingProvider::new(false);
        let cache = EpgCache::new(provider.clone()).ttl(Duration::from_secs(60));

        for i in 0..1000 {
            cache.get(&format!("channel-{}", i)).await;
        }
        assert_eq!(cache.slot_count(), 1000);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get("bbc").await;

        assert_eq!(cache.slot_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_slots_pruned_after_failure_ttl() {
        tokio::time::pause();
        let provider = CountingProvider::new(true);
        let cache = EpgCache::new(provider.clone()).failure_ttl(Duration::from_secs(5));

        for i in 0..100 {
            cache.get(&format!("junk-{}", i)).await;
        }
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.get("junk-new").await;

        assert_eq!(cache.slot_count(), 1);
    }

    #[tokio::test]
    async fn test_live_slots_survive_pruning() {
        tokio::time::pause();
        let provider = CountingProvider::new(false);
        let cache = EpgCache::new(provider.clone()).ttl(Duration::from_secs(60));

        cache.get("bbc").await;
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.get("cnn").await;
        cache.get("bbc").await;

        assert_eq!(cache.slot_count(), 2);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_forces_refetch() {
        tokio::time::pause();
        let provider = CountingProvider::new(false);
        let cache = EpgCache::new(provider.clone());

        cache.get("bbc").await;
        cache.clear();
        cache.get("bbc").await;

        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn test_parse_date() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(parse_date("2024-03-01"), Some(expected));
        assert_eq!(parse_date("20240301"), Some(expected));
        assert_eq!(parse_date("2024-13-01"), None);
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn test_programmes_on_day() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let programmes = vec![
            // 2024-02-29 23:00 to 2024-03-01 00:30 local: overlaps
            programme("late", "2024-02-29T15:00:00+00:00", "2024-02-29T16:30:00+00:00"),
            // 2024-03-01 20:00 local
            programme("evening", "2024-03-01T12:00:00+00:00", "2024-03-01T13:00:00+00:00"),
            // 2024-03-02 local
            programme("tomorrow", "2024-03-01T17:00:00+00:00", "2024-03-01T18:00:00+00:00"),
        ];

        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let titles: Vec<String> = programmes_on(&programmes, day, &tz)
            .into_iter()
            .map(|p| p.title)
            .collect();
        assert_eq!(titles, vec!["late", "evening"]);
    }

    #[test]
    fn test_diyp_guide() {
        let tz = FixedOffset::east_opt(0).unwrap();
        let programmes = vec![programme(
            "News",
            "2024-03-01T20:00:00+00:00",
            "2024-03-01T20:30:00+00:00",
        )];
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let guide = DiypGuide::build("bbc", day, &programmes, &tz);
        let value = serde_json::to_value(&guide).unwrap();

        assert_eq!(value["channel_name"], "bbc");
        assert_eq!(value["date"], "20240301");
        assert_eq!(value["epg_data"][0]["start"], "20:00");
        assert_eq!(value["epg_data"][0]["end"], "20:30");
        assert_eq!(value["epg_data"][0]["title"], "News");
    }

    #[test]
    fn test_programme_serializes_rfc3339() {
        let p = programme("News", "2024-03-01T20:00:00+08:00", "2024-03-01T20:30:00+08:00");
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["start"], "2024-03-01T20:00:00+08:00");
        assert_eq!(value["desc"], "");
    }
}
