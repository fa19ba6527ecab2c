//! Quote feed: a local store plus a remote source, with a fetch budget.
//!
//! `QuoteFeed::next` talks to the network at most once per interval. The
//! interval starts when a fetch is attempted, so a failing endpoint is not
//! hammered either. Anything that goes wrong remotely falls back to a random
//! cached quote.
//!
//! With a stamp file the attempt time is persisted, so the budget holds
//! across processes (one CLI run per quote).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::error::{Error, Result};
use crate::models::Quote;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub trait QuoteStore: Send + Sync {
    /// A uniformly random stored quote, `None` when empty.
    fn pick_cached(&self) -> Result<Option<Quote>>;
    /// Persist `quote`, returning the local id it was given.
    fn store(&self, quote: Quote) -> Result<u64>;
    fn len(&self) -> Result<usize>;
}

/// All quotes in one JSON array file.
pub struct JsonQuoteStore {
    path: PathBuf,
    quotes: Mutex<Vec<Quote>>,
}

impl JsonQuoteStore {
    /// Open (or start) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let quotes = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            Vec::new()
        };
        Ok(Self { path, quotes: Mutex::new(quotes) })
    }

    /// Write through a sibling temp file so a crash never leaves half a file.
    fn persist(&self, quotes: &[Quote]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(quotes)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl QuoteStore for JsonQuoteStore {
    fn pick_cached(&self) -> Result<Option<Quote>> {
        Ok(self.quotes.lock().choose(&mut rand::thread_rng()).cloned())
    }

    fn store(&self, mut quote: Quote) -> Result<u64> {
        let mut quotes = self.quotes.lock();
        let cid = quotes.iter().filter_map(|q| q.cid).max().unwrap_or(0) + 1;
        quote.cid = Some(cid);
        if quote.fetched_at.is_none() {
            quote.fetched_at = Some(timestamp(Utc::now()));
        }
        quotes.push(quote);
        if let Err(e) = self.persist(&quotes) {
            quotes.pop();
            return Err(e);
        }
        Ok(cid)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.quotes.lock().len())
    }
}

/// `2026-10-19T08:00:00.000Z`
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn read_stamp(path: &Path) -> Option<DateTime<Utc>> {
    let text = std::fs::read_to_string(path).ok()?;
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn write_stamp(path: &Path, at: DateTime<Utc>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, timestamp(at))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Remote source
// ---------------------------------------------------------------------------

pub trait QuoteSource: Send + Sync {
    fn fetch(&self) -> Result<Quote>;
}

/// hitokoto.cn style endpoint: GET returns one quote object.
#[cfg(feature = "http")]
pub struct HitokotoClient {
    url: String,
}

#[cfg(feature = "http")]
impl HitokotoClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[cfg(feature = "http")]
impl QuoteSource for HitokotoClient {
    fn fetch(&self) -> Result<Quote> {
        let quote: Quote = crate::effects::http::get_json(&self.url).map_err(Error::QuoteFetch)?;
        if quote.hitokoto.trim().is_empty() {
            return Err(Error::QuoteFetch(format!("{} returned no quote text", self.url)));
        }
        Ok(quote)
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

pub struct QuoteFeed {
    source: Box<dyn QuoteSource>,
    store: Box<dyn QuoteStore>,
    interval: Duration,
    stamp_file: Option<PathBuf>,
    last_attempt: Mutex<Option<DateTime<Utc>>>,
}

impl QuoteFeed {
    pub fn new(source: Box<dyn QuoteSource>, store: Box<dyn QuoteStore>, interval: Duration) -> Self {
        Self { source, store, interval, stamp_file: None, last_attempt: Mutex::new(None) }
    }

    /// Persist fetch attempts to `path` and honor attempts recorded there.
    pub fn with_stamp_file(mut self, path: impl AsRef<Path>) -> Self {
        self.stamp_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn store(&self) -> &dyn QuoteStore {
        self.store.as_ref()
    }

    /// Next quote to show. `Ok(None)` only when nothing could be fetched
    /// and nothing is cached.
    pub fn next(&self) -> Result<Option<Quote>> {
        let due = {
            let mut last = self.last_attempt.lock();
            if let Some(stamped) = self.stamp_file.as_deref().and_then(read_stamp) {
                if last.map_or(true, |at| stamped > at) {
                    *last = Some(stamped);
                }
            }
            let now = Utc::now();
            // A stamp from the future (clock moved back) does not block fetching.
            let due = last.map_or(true, |at| {
                (now - at).to_std().map_or(true, |elapsed| elapsed >= self.interval)
            });
            if due {
                *last = Some(now);
                if let Some(path) = &self.stamp_file {
                    if let Err(e) = write_stamp(path, now) {
                        log::warn!("yiyan: could not record fetch time: {}", e);
                    }
                }
            }
            due
        };
        if !due {
            return self.store.pick_cached();
        }

        match self.source.fetch() {
            Ok(mut quote) => {
                quote.fetched_at.get_or_insert_with(|| timestamp(Utc::now()));
                match self.store.store(quote.clone()) {
                    Ok(cid) => {
                        log::debug!("yiyan: stored quote {} ({})", cid, quote.hitokoto);
                        quote.cid = Some(cid);
                    }
                    Err(e) => log::warn!("yiyan: could not store quote: {}", e),
                }
                Ok(Some(quote))
            }
            Err(e) => {
                log::warn!("yiyan: {}; falling back to cache", e);
                self.store.pick_cached()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeSource {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl QuoteSource for Arc<FakeSource> {
        fn fetch(&self) -> Result<Quote> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::QuoteFetch("connection refused".into()));
            }
            Ok(Quote::text(format!("quote {}", n)))
        }
    }

    fn feed(dir: &TempDir, interval: Duration) -> (QuoteFeed, Arc<FakeSource>) {
        let source = Arc::new(FakeSource::default());
        let store = JsonQuoteStore::open(dir.path().join("quotes.json")).unwrap();
        let feed = QuoteFeed::new(Box::new(Arc::clone(&source)), Box::new(store), interval);
        (feed, source)
    }

    #[test]
    fn store_assigns_increasing_ids_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quotes.json");
        let store = JsonQuoteStore::open(&path).unwrap();
        assert_eq!(store.pick_cached().unwrap(), None);

        assert_eq!(store.store(Quote::text("a")).unwrap(), 1);
        assert_eq!(store.store(Quote::text("b")).unwrap(), 2);

        let reopened = JsonQuoteStore::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 2);
        assert_eq!(reopened.store(Quote::text("c")).unwrap(), 3);
        let picked = reopened.pick_cached().unwrap().unwrap();
        assert!(["a", "b", "c"].contains(&picked.hitokoto.as_str()));
        assert!(picked.fetched_at.is_some());
    }

    #[test]
    fn fetched_at_is_rfc3339_utc() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quotes.json");
        let store = JsonQuoteStore::open(&path).unwrap();
        store.store(Quote::text("a")).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let fetched_at = raw[0]["fetched_at"].as_str().unwrap();
        assert!(fetched_at.ends_with('Z'), "{}", fetched_at);
        assert!(DateTime::parse_from_rfc3339(fetched_at).is_ok());

        let mut kept = Quote::text("b");
        kept.fetched_at = Some("2020-01-01T00:00:00.000Z".into());
        store.store(kept).unwrap();
        let reopened = JsonQuoteStore::open(&path).unwrap();
        assert_eq!(reopened.quotes.lock()[1].fetched_at.as_deref(), Some("2020-01-01T00:00:00.000Z"));
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quotes.json");
        std::fs::write(&path, "[{").unwrap();
        assert!(matches!(JsonQuoteStore::open(&path), Err(Error::Json(_))));
    }

    #[test]
    fn fetches_at_most_once_per_interval() {
        let dir = TempDir::new().unwrap();
        let (feed, source) = feed(&dir, Duration::from_secs(3600));

        let first = feed.next().unwrap().unwrap();
        assert_eq!(first.hitokoto, "quote 0");
        assert_eq!(first.cid, Some(1));
        assert!(first.fetched_at.is_some());

        let second = feed.next().unwrap().unwrap();
        assert_eq!(second.hitokoto, "quote 0");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(feed.store().len().unwrap(), 1);
    }

    #[test]
    fn zero_interval_always_fetches() {
        let dir = TempDir::new().unwrap();
        let (feed, source) = feed(&dir, Duration::ZERO);
        feed.next().unwrap();
        feed.next().unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(feed.store().len().unwrap(), 2);
    }

    #[test]
    fn remote_failure_falls_back_to_cache() {
        let dir = TempDir::new().unwrap();
        let (feed, source) = feed(&dir, Duration::ZERO);
        feed.next().unwrap();

        source.failing.store(true, Ordering::SeqCst);
        let quote = feed.next().unwrap().unwrap();
        assert_eq!(quote.hitokoto, "quote 0");
    }

    fn stamped_feed(dir: &TempDir, source: &Arc<FakeSource>) -> QuoteFeed {
        let store = JsonQuoteStore::open(dir.path().join("quotes.json")).unwrap();
        QuoteFeed::new(Box::new(Arc::clone(source)), Box::new(store), Duration::from_secs(10))
            .with_stamp_file(dir.path().join("last_fetch"))
    }

    #[test]
    fn stamp_file_limits_fetches_across_feeds() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());

        for _ in 0..3 {
            let quote = stamped_feed(&dir, &source).next().unwrap().unwrap();
            assert_eq!(quote.hitokoto, "quote 0");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let stamp = std::fs::read_to_string(dir.path().join("last_fetch")).unwrap();
        assert!(DateTime::parse_from_rfc3339(&stamp).is_ok());
    }

    #[test]
    fn failed_attempt_is_stamped_too() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        source.failing.store(true, Ordering::SeqCst);

        assert_eq!(stamped_feed(&dir, &source).next().unwrap(), None);
        source.failing.store(false, Ordering::SeqCst);
        assert_eq!(stamped_feed(&dir, &source).next().unwrap(), None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_or_future_stamp_allows_fetch() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());
        let stamp = dir.path().join("last_fetch");

        std::fs::write(&stamp, "2001-01-01T00:00:00.000Z").unwrap();
        stamped_feed(&dir, &source).next().unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        std::fs::write(&stamp, timestamp(Utc::now() + chrono::Duration::hours(1))).unwrap();
        stamped_feed(&dir, &source).next().unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_cache_and_failed_fetch_gives_none() {
        let dir = TempDir::new().unwrap();
        let (feed, source) = feed(&dir, Duration::from_secs(3600));
        source.failing.store(true, Ordering::SeqCst);

        assert_eq!(feed.next().unwrap(), None);
        // the failed attempt still used up the interval
        source.failing.store(false, Ordering::SeqCst);
        assert_eq!(feed.next().unwrap(), None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
