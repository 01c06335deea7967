use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable event identity. Never reused once assigned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Activity,
    Food,
    Stay,
    Travel,
    Other,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        Self::Activity,
        Self::Food,
        Self::Stay,
        Self::Travel,
        Self::Other,
    ];

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Activity => "Activity",
            Self::Food => "Food",
            Self::Stay => "Stay",
            Self::Travel => "Travel",
            Self::Other => "Other",
        }
    }
}

/// Validated lat/lon
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) {
            return None;
        }
        if !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        Some(Self { lat, lon })
    }

    /// `(0, 0)` is the "never set" sentinel coming out of the add/edit
    /// flow, not a real venue in the Gulf of Guinea.
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.lat == 0.0 && self.lon == 0.0
    }
}

/// Structured address for an event's venue, mirroring what reverse
/// geocoding hands back.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLocation {
    pub name: String,
    pub sub_thoroughfare: Option<String>,
    pub thoroughfare: Option<String>,
    pub locality: Option<String>,
    pub administrative_area: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub coordinate: Option<LatLon>,
}

/// Opaque binary payload (event photo).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Blob(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl Blob {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

/// Opaque file attachment plus the metadata needed to export it again.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// A value plus the instant it was last written. Blob-valued fields
/// carry their own clock so the merge can resolve them independently
/// of the rest of the record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub value: T,
    pub modified: DateTime<Utc>,
}

impl<T> Stamped<T> {
    pub fn new(value: T, modified: DateTime<Utc>) -> Self {
        Self { value, modified }
    }
}

/// The central entity: one itinerary entry.
///
/// Edits never mutate a persisted record in place. The edit flow
/// creates a replacement with a fresh id and soft-deletes the
/// original, which keeps per-record history linear under replication.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub kind: EventKind,
    /// Absolute instant the event happens.
    pub date: DateTime<Utc>,
    /// IANA identifier resolved from the venue coordinates at creation.
    pub timezone_id: Option<String>,
    pub location: EventLocation,
    pub notes: String,
    pub image: Option<Stamped<Blob>>,
    pub attachment: Option<Stamped<Attachment>>,
    /// Soft-delete flag. Hidden from every view, purged by retention
    /// cleanup once old enough.
    pub marked_for_deletion: bool,
    /// Replica metadata consumed by the merge path.
    pub last_modified: DateTime<Utc>,
    pub revision: u64,
}

// Redact debug output because notes and attachments are user content.
impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("date", &self.date)
            .field("timezone_id", &self.timezone_id)
            .field("country", &self.location.country)
            .field("notes_present", &!self.notes.is_empty())
            .field("image_present", &self.image.is_some())
            .field("attachment_present", &self.attachment.is_some())
            .field("marked_for_deletion", &self.marked_for_deletion)
            .field("last_modified", &self.last_modified)
            .field("revision", &self.revision)
            .finish()
    }
}

impl Event {
    /// Digest of the record's scalar content, the final merge
    /// tiebreak when two replicas carry identical clocks. The blob
    /// fields carry their own clocks and are excluded, so joining
    /// blobs into a record never moves its position in the merge
    /// order.
    #[must_use]
    pub fn merge_digest(&self) -> [u8; 32] {
        let scalars = (
            &self.id,
            &self.name,
            &self.kind,
            &self.date,
            &self.timezone_id,
            &self.location,
            &self.notes,
            self.marked_for_deletion,
            &self.last_modified,
            self.revision,
        );
        let mut buf = Vec::new();
        if ciborium::into_writer(&scalars, &mut buf).is_err() {
            return [0u8; 32];
        }
        *blake3::hash(&buf).as_bytes()
    }
}

/// What the add/edit flow submits. The store assigns identity and
/// replica metadata on acceptance.
#[derive(Clone, Debug, Default)]
pub struct EventDraft {
    pub name: String,
    pub kind: Option<EventKind>,
    pub date: Option<DateTime<Utc>>,
    pub timezone_id: Option<String>,
    pub location: EventLocation,
    pub notes: String,
    pub image: Option<Blob>,
    pub attachment: Option<Attachment>,
}

/// A resolved geographic result from place search or reverse geocoding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Placemark {
    pub name: Option<String>,
    pub sub_thoroughfare: Option<String>,
    pub thoroughfare: Option<String>,
    pub locality: Option<String>,
    pub administrative_area: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub coordinate: Option<LatLon>,
    /// IANA timezone identifier, when the geocoder knows it.
    pub timezone_id: Option<String>,
}

impl Placemark {
    /// Venue location as stored on an event, with the placemark name
    /// as the display name.
    #[must_use]
    pub fn to_event_location(&self) -> EventLocation {
        EventLocation {
            name: self.name.clone().unwrap_or_default(),
            sub_thoroughfare: self.sub_thoroughfare.clone(),
            thoroughfare: self.thoroughfare.clone(),
            locality: self.locality.clone(),
            administrative_area: self.administrative_area.clone(),
            postal_code: self.postal_code.clone(),
            country: self.country.clone(),
            coordinate: self.coordinate,
        }
    }
}

/// Externally-owned, read-only flags. The shell owns the settings
/// screen; the core only consumes the values.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub hide_past_events: bool,
    pub emergency_override: bool,
}
