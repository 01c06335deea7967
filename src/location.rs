//! Location resolution: one-shot fixes, reverse geocoding, debounced
//! place search, and map viewport derivation.
//!
//! The resolver is an owned service instance. The shell injects the
//! platform capabilities (fix provider, geocoder, search) behind the
//! traits below and observes results through a `watch` subscription;
//! there is no ambient global state.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::model::{LatLon, Placemark, Preferences};
use crate::region::{self, MapRegion, DEFAULT_REGION, TIGHT_SPAN_DEG};
use crate::{GEOCODE_CACHE_SIZE, SEARCH_DEBOUNCE};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location unavailable: {0}")]
    Unavailable(String),

    #[error("reverse geocoding failed: {0}")]
    Geocoding(String),

    #[error("place search failed: {0}")]
    SearchFailed(String),
}

/// Platform authorization status as reported by the shell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthorizationStatus {
    NotDetermined,
    Granted,
    Denied,
}

/// One-shot location fixes. The shell implements this on top of the
/// native location service.
#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    async fn authorization(&self) -> AuthorizationStatus;
    async fn request_fix(&self) -> Result<LatLon, LocationError>;
}

/// Reverse geocoding: coordinates to a placemark with country and
/// timezone.
#[async_trait::async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse_geocode(&self, at: LatLon) -> Result<Placemark, LocationError>;
}

/// Free-text place search.
#[async_trait::async_trait]
pub trait PlaceSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Placemark>, LocationError>;
}

/// Where the resolver is in its fix lifecycle. `Denied` is terminal
/// until the user re-authorizes outside the app.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ResolverStatus {
    #[default]
    Unauthorized,
    PendingFix,
    HasFix,
    Denied,
}

/// Everything observers can see, delivered through the watch channel.
///
/// `search_results` distinguishes "no active search" (`None`, the
/// query was cleared) from "search found nothing" (`Some` but empty).
#[derive(Clone, Debug, PartialEq)]
pub struct ResolverSnapshot {
    pub status: ResolverStatus,
    pub current_fix: Option<LatLon>,
    pub current_country: Option<String>,
    pub viewport: MapRegion,
    pub search_results: Option<Vec<Placemark>>,
}

impl Default for ResolverSnapshot {
    fn default() -> Self {
        Self {
            status: ResolverStatus::Unauthorized,
            current_fix: None,
            current_country: None,
            viewport: DEFAULT_REGION,
            search_results: None,
        }
    }
}

/// How an emergency call should be offered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmergencyLookup {
    /// Current country is known and in the directory: dial directly.
    Dial {
        country: String,
        number: &'static str,
    },
    /// Country unknown, not in the directory, or the override flag is
    /// set: offer the full menu.
    Choose(Vec<(&'static str, &'static str)>),
}

pub struct LocationResolver<L, G, S> {
    provider: L,
    geocoder: G,
    search: S,
    preferences: Preferences,
    snapshot: watch::Sender<ResolverSnapshot>,
    search_seq: AtomicU64,
    pending_query: Mutex<Option<String>>,
    geocode_cache: Mutex<LruCache<(i64, i64), Placemark>>,
    debounce: Duration,
}

impl<L, G, S> LocationResolver<L, G, S>
where
    L: LocationProvider,
    G: Geocoder,
    S: PlaceSearch,
{
    pub fn new(provider: L, geocoder: G, search: S, preferences: Preferences) -> Self {
        let (snapshot, _) = watch::channel(ResolverSnapshot::default());
        let cache_size =
            NonZeroUsize::new(GEOCODE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            provider,
            geocoder,
            search,
            preferences,
            snapshot,
            search_seq: AtomicU64::new(0),
            pending_query: Mutex::new(None),
            geocode_cache: Mutex::new(LruCache::new(cache_size)),
            debounce: SEARCH_DEBOUNCE,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ResolverSnapshot> {
        self.snapshot.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> ResolverSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Ask for a single fix, reverse geocode it, and recompute country
    /// and viewport. Permission denial lands in the terminal `Denied`
    /// state; transient failures leave the state as-is and the caller
    /// may retry. The resolver itself never retries.
    #[instrument(skip(self))]
    pub async fn request_current_location(&self) -> Result<Placemark, LocationError> {
        match self.provider.authorization().await {
            AuthorizationStatus::Denied => {
                warn!("location permission denied");
                self.snapshot
                    .send_modify(|s| s.status = ResolverStatus::Denied);
                return Err(LocationError::PermissionDenied);
            }
            AuthorizationStatus::NotDetermined => {
                self.snapshot
                    .send_modify(|s| s.status = ResolverStatus::Unauthorized);
                return Err(LocationError::Unavailable(
                    "authorization not determined".into(),
                ));
            }
            AuthorizationStatus::Granted => {
                self.snapshot.send_modify(|s| {
                    if s.status != ResolverStatus::HasFix {
                        s.status = ResolverStatus::PendingFix;
                    }
                });
            }
        }

        let fix = self.provider.request_fix().await?;
        self.snapshot.send_modify(|s| {
            s.current_fix = Some(fix);
            s.status = ResolverStatus::HasFix;
        });

        let placemark = self.reverse_geocode_cached(fix).await?;
        let country = placemark.country.clone();
        let viewport = match country.as_deref() {
            Some(name) => self.region_for_country(name),
            None => self.fallback_region(),
        };
        info!(country = country.as_deref().unwrap_or("unknown"), "fix resolved");
        self.snapshot.send_modify(|s| {
            s.current_country = country;
            s.viewport = viewport;
        });
        Ok(placemark)
    }

    /// Live query input. Debounced for a 500 ms quiet period,
    /// deduplicated against the previous input, and superseded by any
    /// later query: only the most recent query's results are ever
    /// applied, even when an earlier search finishes afterwards.
    ///
    /// Clearing the text cancels interest in outstanding results and
    /// sets results to "no active search".
    #[instrument(skip(self, text))]
    pub async fn set_search_query(&self, text: &str) {
        let query = text.trim().to_string();

        if query.is_empty() {
            *self.pending_query.lock().await = None;
            self.search_seq.fetch_add(1, Ordering::SeqCst);
            self.snapshot.send_modify(|s| s.search_results = None);
            return;
        }

        {
            let mut pending = self.pending_query.lock().await;
            if pending.as_deref() == Some(query.as_str()) {
                // Identical consecutive input: at most one search.
                return;
            }
            *pending = Some(query.clone());
        }

        let seq = self.search_seq.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.debounce).await;
        if self.search_seq.load(Ordering::SeqCst) != seq {
            debug!(%query, "query superseded during debounce");
            return;
        }

        match self.search.search(&query.to_lowercase()).await {
            Ok(places) => {
                if self.search_seq.load(Ordering::SeqCst) == seq {
                    self.snapshot
                        .send_modify(|s| s.search_results = Some(places));
                } else {
                    debug!(%query, "stale search result discarded");
                }
            }
            Err(e) => {
                // Surfaced to the log, superseded by the next query.
                // No internal retry.
                warn!(%query, error = %e, "place search failed");
            }
        }
    }

    /// Viewport for a country: directory entry, else last known fix at
    /// tight zoom, else the continent-scale default. Never fails.
    #[must_use]
    pub fn region_for_country(&self, country: &str) -> MapRegion {
        region::viewport(country).unwrap_or_else(|| self.fallback_region())
    }

    /// Imperative viewport jump with the same fallback rule.
    pub fn move_to(&self, country: &str) {
        let viewport = self.region_for_country(country);
        self.snapshot.send_modify(|s| s.viewport = viewport);
    }

    /// Emergency number for the current country, or the full menu when
    /// the country is unknown or the override preference is set.
    #[must_use]
    pub fn emergency_lookup(&self) -> EmergencyLookup {
        if !self.preferences.emergency_override {
            let current = self.snapshot.borrow().current_country.clone();
            if let Some(country) = current {
                if let Some(number) = region::emergency_number(&country) {
                    return EmergencyLookup::Dial { country, number };
                }
            }
        }
        EmergencyLookup::Choose(region::emergency_numbers())
    }

    fn fallback_region(&self) -> MapRegion {
        match self.snapshot.borrow().current_fix {
            Some(fix) => MapRegion {
                center: fix,
                lat_span: TIGHT_SPAN_DEG,
                lon_span: TIGHT_SPAN_DEG,
            },
            None => DEFAULT_REGION,
        }
    }

    async fn reverse_geocode_cached(&self, at: LatLon) -> Result<Placemark, LocationError> {
        let key = cache_key(at);
        if let Some(hit) = self.geocode_cache.lock().await.get(&key) {
            return Ok(hit.clone());
        }
        let placemark = self.geocoder.reverse_geocode(at).await?;
        self.geocode_cache.lock().await.put(key, placemark.clone());
        Ok(placemark)
    }
}

// ~100 m buckets; a traveler standing still should not re-geocode.
fn cache_key(at: LatLon) -> (i64, i64) {
    ((at.lat * 1000.0).round() as i64, (at.lon * 1000.0).round() as i64)
}
