//! wayfarer-core - shared core of the wayfarer travel itinerary app.
//!
//! Owns the replicated event store (soft delete, trump merge,
//! retention cleanup), the location resolver (fixes, reverse
//! geocoding, debounced place search, viewport derivation), the
//! schedule normalizer (timezone-correct display and day grouping),
//! and the static per-country region directory. The UI shell, the
//! sync transport, and the native location services live outside and
//! talk to this crate through its service types and boundary traits.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod location;
pub mod model;
pub mod region;
pub mod schedule;
pub mod store;

use std::time::Duration;

/// Soft-deleted events older than this are purged permanently.
pub const RETENTION_WINDOW_DAYS: i64 = 30;

/// Quiet period before a search query is issued.
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Reverse-geocode memoization depth.
pub const GEOCODE_CACHE_SIZE: usize = 64;

pub use location::{
    AuthorizationStatus, EmergencyLookup, Geocoder, LocationError, LocationProvider,
    LocationResolver, PlaceSearch, ResolverSnapshot, ResolverStatus,
};
pub use model::{
    Attachment, Blob, Event, EventDraft, EventId, EventKind, EventLocation, LatLon, Placemark,
    Preferences, Stamped,
};
pub use region::{MapRegion, DEFAULT_REGION, TIGHT_SPAN_DEG};
pub use schedule::{group_by_local_day, is_past, localize, LocalizedInstant};
pub use store::{EventStore, QueryFilter, StoreError};
