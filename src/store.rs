//! The authoritative event set.
//!
//! All mutation goes through here: create, supersede (the edit path),
//! soft delete, inbound replica merge, and retention cleanup. Every
//! mutating operation is applied to a working copy, written durably,
//! and only then made visible, so a failed save never leaves memory
//! ahead of disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::model::{Event, EventDraft, EventId, Preferences, Stamped};
use crate::RETENTION_WINDOW_DAYS;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 100 * 1024 * 1024;
const MAX_EVENTS: usize = 10_000;
const STORE_MAGIC: &[u8; 4] = b"WAYF";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("event not found: {0}")]
    NotFound(EventId),

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many events: {count}, max {max}")]
    TooManyEvents { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Deserialize, Debug)]
struct StorePayload {
    events: Vec<Event>,
}

// Borrowed twin of `StorePayload`; saves serialize straight out of
// the shared map without cloning the records.
#[derive(Serialize)]
struct StorePayloadRef<'a> {
    events: Vec<&'a Event>,
}

/// Which events a consumer wants to see. Soft-deleted events are
/// always excluded; hiding past events is policy-driven.
#[derive(Copy, Clone, Debug)]
pub struct QueryFilter {
    pub hide_past: bool,
    pub now: DateTime<Utc>,
}

impl QueryFilter {
    #[must_use]
    pub fn everything(now: DateTime<Utc>) -> Self {
        Self {
            hide_past: false,
            now,
        }
    }

    #[must_use]
    pub fn upcoming(now: DateTime<Utc>) -> Self {
        Self {
            hide_past: true,
            now,
        }
    }

    #[must_use]
    pub fn from_preferences(prefs: &Preferences, now: DateTime<Utc>) -> Self {
        Self {
            hide_past: prefs.hide_past_events,
            now,
        }
    }
}

/// Replicated event store backed by a single durable file.
pub struct EventStore {
    path: PathBuf,
    inner: RwLock<HashMap<EventId, Arc<Event>>>,
}

impl EventStore {
    /// Open (or create) the store at `path` and run retention cleanup,
    /// the same maintenance the app performs at launch.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let events = load_from_path(&path)?;
        info!(count = events.len(), "store opened");

        let store = Self {
            path,
            inner: RwLock::new(events),
        };
        store.run_retention_cleanup(now).await?;
        Ok(store)
    }

    /// Insert a new event built from the draft. Rejects drafts with a
    /// missing name, kind, or date, and any without usable coordinates
    /// — `(0, 0)` counts as unset.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn create(
        &self,
        draft: EventDraft,
        now: DateTime<Utc>,
    ) -> Result<Event, StoreError> {
        let event = event_from_draft(draft, now)?;
        let created = event.clone();
        self.commit(move |events| {
            if events.len() >= MAX_EVENTS {
                return Err(StoreError::TooManyEvents {
                    count: events.len() + 1,
                    max: MAX_EVENTS,
                });
            }
            events.insert(event.id, Arc::new(event));
            Ok(())
        })
        .await?;
        info!(id = %created.id, "event created");
        Ok(created)
    }

    /// The edit path: create the replacement, soft-delete the
    /// original, one durable save covering both. In-place mutation is
    /// deliberately absent; delete-old + insert-new keeps each
    /// record's history linear under replicated merge.
    #[instrument(skip(self, draft), fields(old_id = %old_id))]
    pub async fn supersede(
        &self,
        old_id: EventId,
        draft: EventDraft,
        now: DateTime<Utc>,
    ) -> Result<Event, StoreError> {
        let replacement = event_from_draft(draft, now)?;
        let created = replacement.clone();
        self.commit(move |events| {
            let old = events
                .get_mut(&old_id)
                .ok_or(StoreError::NotFound(old_id))?;
            let old = Arc::make_mut(old);
            if !old.marked_for_deletion {
                old.marked_for_deletion = true;
                old.last_modified = now;
                old.revision += 1;
            }
            events.insert(replacement.id, Arc::new(replacement));
            Ok(())
        })
        .await?;
        info!(old_id = %old_id, new_id = %created.id, "event superseded");
        Ok(created)
    }

    /// Mark an event for deletion. Deleting an already-deleted event
    /// is a no-op; an unknown id is an error.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn soft_delete(&self, id: EventId, now: DateTime<Utc>) -> Result<(), StoreError> {
        {
            let guard = self.inner.read().await;
            match guard.get(&id) {
                None => return Err(StoreError::NotFound(id)),
                Some(event) if event.marked_for_deletion => return Ok(()),
                Some(_) => {}
            }
        }

        self.commit(move |events| {
            let event = events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let event = Arc::make_mut(event);
            if !event.marked_for_deletion {
                event.marked_for_deletion = true;
                event.last_modified = now;
                event.revision += 1;
            }
            Ok(())
        })
        .await
    }

    /// Apply an inbound replica version of a record. Conflicts always
    /// resolve — there is no unresolved state — and resolution is
    /// deterministic and commutative, so concurrent inbound updates
    /// converge regardless of arrival order. Unknown ids insert.
    #[instrument(skip(self, remote), fields(id = %remote.id))]
    pub async fn merge(&self, remote: Event) -> Result<Event, StoreError> {
        let resolved = self
            .commit(move |events| {
                let resolved = match events.remove(&remote.id) {
                    Some(local) => {
                        let local =
                            Arc::try_unwrap(local).unwrap_or_else(|shared| (*shared).clone());
                        let resolved = resolve(local, remote);
                        info!(id = %resolved.id, "replica conflict resolved");
                        resolved
                    }
                    None => remote,
                };
                events.insert(resolved.id, Arc::new(resolved.clone()));
                Ok(resolved)
            })
            .await?;
        Ok(resolved)
    }

    /// Permanently purge events soft-deleted long enough ago. The
    /// boundary is exclusive: an event exactly at the retention window
    /// is purged. Safe to call repeatedly; a pass with nothing to do
    /// performs no I/O.
    #[instrument(skip(self))]
    pub async fn run_retention_cleanup(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due: Vec<EventId> = {
            let guard = self.inner.read().await;
            guard
                .values()
                .filter(|e| is_purge_due(e, now))
                .map(|e| e.id)
                .collect()
        };
        if due.is_empty() {
            return Ok(0);
        }

        let purged = self
            .commit(move |events| {
                let before = events.len();
                events.retain(|_, e| !is_purge_due(e, now));
                Ok(before - events.len())
            })
            .await?;
        info!(purged, "retention cleanup");
        Ok(purged)
    }

    /// Consistent snapshot of non-deleted events, ordered by ascending
    /// date. Restartable by construction; callers iterate it as often
    /// as they like.
    pub async fn query(&self, filter: QueryFilter) -> Vec<Event> {
        let guard = self.inner.read().await;
        let mut events: Vec<Event> = guard
            .values()
            .filter(|e| !e.marked_for_deletion)
            .filter(|e| !filter.hide_past || e.date >= filter.now)
            .map(|event| Event::clone(event))
            .collect();
        events.sort_by_key(|e| (e.date, e.id));
        events
    }

    /// Raw record lookup, soft-deleted included. Views use [`query`];
    /// this exists for the sync layer and for inspection.
    ///
    /// [`query`]: EventStore::query
    pub async fn get(&self, id: EventId) -> Option<Event> {
        self.inner.read().await.get(&id).map(|event| Event::clone(event))
    }

    /// Apply a mutation to a working copy, persist it, then publish.
    /// The working copy shares its records with the published map, so
    /// the clone is shallow and a mutation pays only for the entries
    /// it rewrites. On any failure the in-memory view still matches
    /// the last durable state.
    async fn commit<T>(
        &self,
        apply: impl FnOnce(&mut HashMap<EventId, Arc<Event>>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.inner.write().await;
        let mut working = guard.clone();
        let out = apply(&mut working)?;
        if let Err(e) = persist(&self.path, &working) {
            warn!(error = %e, "store save failed, mutation rolled back");
            return Err(e);
        }
        *guard = working;
        Ok(out)
    }
}

fn is_purge_due(event: &Event, now: DateTime<Utc>) -> bool {
    event.marked_for_deletion
        && now.signed_duration_since(event.date) >= Duration::days(RETENTION_WINDOW_DAYS)
}

fn event_from_draft(draft: EventDraft, now: DateTime<Utc>) -> Result<Event, StoreError> {
    let name = draft.name.trim().to_string();
    if name.is_empty() {
        return Err(StoreError::Validation("event name is required".into()));
    }
    let kind = draft
        .kind
        .ok_or_else(|| StoreError::Validation("event type is required".into()))?;
    let date = draft
        .date
        .ok_or_else(|| StoreError::Validation("event date is required".into()))?;
    let coordinate = draft
        .location
        .coordinate
        .ok_or_else(|| StoreError::Validation("event location is required".into()))?;
    if coordinate.is_unset() {
        return Err(StoreError::Validation(
            "event location has no coordinates".into(),
        ));
    }

    Ok(Event {
        id: EventId::generate(),
        name,
        kind,
        date,
        timezone_id: draft.timezone_id,
        location: draft.location,
        notes: draft.notes,
        image: draft.image.map(|blob| Stamped::new(blob, now)),
        attachment: draft.attachment.map(|att| Stamped::new(att, now)),
        marked_for_deletion: false,
        last_modified: now,
        revision: 1,
    })
}

/// Total order on replica versions: newest write wins, revision then
/// scalar digest break ties. Giving every record a distinct position
/// is what makes the merge commutative; the digest excludes the
/// independently-clocked blob fields, so a record's position does not
/// move when a merge joins blobs into it.
fn merge_key(event: &Event) -> (DateTime<Utc>, u64, [u8; 32]) {
    (event.last_modified, event.revision, event.merge_digest())
}

/// Per-property trump merge of two versions of the same record.
///
/// Scalar properties come wholly from the version with the greater
/// merge key. Blob-valued properties (image, attachment) resolve
/// independently on their own clocks and prefer non-null from either
/// side, so a replica that never saw an attachment cannot erase it.
fn resolve(a: Event, b: Event) -> Event {
    debug_assert_eq!(a.id, b.id);
    let (winner, loser) = if merge_key(&a) >= merge_key(&b) {
        (a, b)
    } else {
        (b, a)
    };
    let mut resolved = winner;
    resolved.image = merge_stamped(resolved.image, loser.image);
    resolved.attachment = merge_stamped(resolved.attachment, loser.attachment);
    resolved
}

fn merge_stamped<T: Ord>(a: Option<Stamped<T>>, b: Option<Stamped<T>>) -> Option<Stamped<T>> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x),
        (Some(x), Some(y)) => {
            if (y.modified, &y.value) > (x.modified, &x.value) {
                Some(y)
            } else {
                Some(x)
            }
        }
    }
}

fn serialize_events(events: &HashMap<EventId, Arc<Event>>) -> Result<Vec<u8>, StoreError> {
    let payload = StorePayloadRef {
        events: events.values().map(|event| &**event).collect(),
    };

    let mut payload_bytes = Vec::new();
    ciborium::into_writer(&payload, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);

    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;
    Ok(envelope_bytes)
}

fn deserialize_events(bytes: &[u8]) -> Result<HashMap<EventId, Arc<Event>>, StoreError> {
    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }
    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if envelope.schema_version < CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnknownSchema(envelope.schema_version));
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    let payload: StorePayload = ciborium::from_reader(&envelope.payload[..])?;
    if payload.events.len() > MAX_EVENTS {
        return Err(StoreError::TooManyEvents {
            count: payload.events.len(),
            max: MAX_EVENTS,
        });
    }

    Ok(payload
        .events
        .into_iter()
        .map(|e| (e.id, Arc::new(e)))
        .collect())
}

fn load_from_path(path: &Path) -> Result<HashMap<EventId, Arc<Event>>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty file",
        });
    }
    deserialize_events(&bytes)
}

fn persist(path: &Path, events: &HashMap<EventId, Arc<Event>>) -> Result<(), StoreError> {
    let bytes = serialize_events(events)?;

    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Test-only shortcut used by other modules' unit tests to build a
/// valid event without going through a store instance.
#[cfg(test)]
pub(crate) fn new_event_for_tests(draft: EventDraft, now: DateTime<Utc>) -> Event {
    event_from_draft(draft, now).expect("draft is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attachment, Blob, EventKind, EventLocation, LatLon};
    use chrono::TimeZone as _;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn valid_draft(name: &str) -> EventDraft {
        EventDraft {
            name: name.into(),
            kind: Some(EventKind::Food),
            date: Some(base_time()),
            timezone_id: Some("Australia/Sydney".into()),
            location: EventLocation {
                name: "Chinatown".into(),
                locality: Some("Sydney".into()),
                country: Some("Australia".into()),
                coordinate: LatLon::new(-33.8786, 151.2043),
                ..EventLocation::default()
            },
            notes: "dumplings".into(),
            ..EventDraft::default()
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> EventStore {
        EventStore::open(dir.path().join("events.wayfarer"), base_time())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_rejects_missing_required_fields() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut no_name = valid_draft("  ");
        no_name.name = "   ".into();
        assert!(matches!(
            store.create(no_name, base_time()).await,
            Err(StoreError::Validation(_))
        ));

        let mut no_kind = valid_draft("a");
        no_kind.kind = None;
        assert!(matches!(
            store.create(no_kind, base_time()).await,
            Err(StoreError::Validation(_))
        ));

        let mut no_date = valid_draft("a");
        no_date.date = None;
        assert!(matches!(
            store.create(no_date, base_time()).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_null_island_coordinates() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut draft = valid_draft("nowhere");
        draft.location.coordinate = LatLon::new(0.0, 0.0);
        assert!(matches!(
            store.create(draft, base_time()).await,
            Err(StoreError::Validation(_))
        ));

        let mut no_coord = valid_draft("nowhere");
        no_coord.location.coordinate = None;
        assert!(matches!(
            store.create(no_coord, base_time()).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let event = store.create(valid_draft("lunch"), base_time()).await.unwrap();

        store.soft_delete(event.id, base_time()).await.unwrap();
        let after_first = store.get(event.id).await.unwrap();

        store.soft_delete(event.id, base_time()).await.unwrap();
        let after_second = store.get(event.id).await.unwrap();

        assert!(after_first.marked_for_deletion);
        assert_eq!(after_first, after_second);
        assert!(store.query(QueryFilter::everything(base_time())).await.is_empty());
    }

    #[tokio::test]
    async fn soft_delete_unknown_id_is_an_error() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let missing = EventId::generate();
        assert!(matches!(
            store.soft_delete(missing, base_time()).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn supersede_replaces_under_a_fresh_id() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let original = store.create(valid_draft("lunch"), base_time()).await.unwrap();

        let mut edited = valid_draft("dinner");
        edited.notes = "booked for 8".into();
        let later = base_time() + Duration::hours(1);
        let replacement = store.supersede(original.id, edited, later).await.unwrap();

        assert_ne!(replacement.id, original.id);
        let old = store.get(original.id).await.unwrap();
        assert!(old.marked_for_deletion);
        assert_eq!(old.revision, original.revision + 1);

        let visible = store.query(QueryFilter::everything(later)).await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, replacement.id);
    }

    #[tokio::test]
    async fn retention_purges_at_thirty_days_exclusive_boundary() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut on_boundary = valid_draft("boundary");
        on_boundary.date = Some(base_time() - Duration::days(30));
        let mut just_inside = valid_draft("inside");
        just_inside.date = Some(base_time() - Duration::days(30) + Duration::seconds(1));
        let mut unmarked = valid_draft("old but kept");
        unmarked.date = Some(base_time() - Duration::days(90));

        let on_boundary = store.create(on_boundary, base_time()).await.unwrap();
        let just_inside = store.create(just_inside, base_time()).await.unwrap();
        let unmarked = store.create(unmarked, base_time()).await.unwrap();

        store.soft_delete(on_boundary.id, base_time()).await.unwrap();
        store.soft_delete(just_inside.id, base_time()).await.unwrap();

        let purged = store.run_retention_cleanup(base_time()).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(on_boundary.id).await.is_none());
        assert!(store.get(just_inside.id).await.is_some());
        assert!(store.get(unmarked.id).await.is_some());

        // Second pass finds nothing and succeeds.
        assert_eq!(store.run_retention_cleanup(base_time()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_runs_at_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.wayfarer");

        let doomed_id = {
            let store = EventStore::open(&path, base_time()).await.unwrap();
            let mut old = valid_draft("ancient");
            old.date = Some(base_time() - Duration::days(45));
            let event = store.create(old, base_time()).await.unwrap();
            store.soft_delete(event.id, base_time()).await.unwrap();
            event.id
        };

        let reopened = EventStore::open(&path, base_time()).await.unwrap();
        assert!(reopened.get(doomed_id).await.is_none());
    }

    #[tokio::test]
    async fn query_orders_by_date_and_honors_hide_past() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut past = valid_draft("yesterday");
        past.date = Some(base_time() - Duration::days(1));
        let mut soon = valid_draft("soon");
        soon.date = Some(base_time() + Duration::hours(1));
        let mut later = valid_draft("later");
        later.date = Some(base_time() + Duration::hours(5));

        store.create(later, base_time()).await.unwrap();
        store.create(past, base_time()).await.unwrap();
        store.create(soon, base_time()).await.unwrap();

        let all = store.query(QueryFilter::everything(base_time())).await;
        assert_eq!(
            all.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["yesterday", "soon", "later"]
        );

        let upcoming = store.query(QueryFilter::upcoming(base_time())).await;
        assert_eq!(
            upcoming.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["soon", "later"]
        );

        let prefs = Preferences {
            hide_past_events: true,
            emergency_override: false,
        };
        let via_prefs = store
            .query(QueryFilter::from_preferences(&prefs, base_time()))
            .await;
        assert_eq!(via_prefs.len(), 2);
    }

    #[tokio::test]
    async fn store_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.wayfarer");

        let created = {
            let store = EventStore::open(&path, base_time()).await.unwrap();
            let mut draft = valid_draft("with blobs");
            draft.image = Some(Blob(vec![0xFF; 16]));
            draft.attachment = Some(Attachment {
                filename: "ticket.pdf".into(),
                content_type: "application/pdf".into(),
                data: vec![1, 2, 3, 4],
            });
            store.create(draft, base_time()).await.unwrap()
        };

        let reopened = EventStore::open(&path, base_time()).await.unwrap();
        let loaded = reopened.get(created.id).await.unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn corrupted_file_is_rejected_not_misread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.wayfarer");

        {
            let store = EventStore::open(&path, base_time()).await.unwrap();
            store.create(valid_draft("keep"), base_time()).await.unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let result = EventStore::open(&path, base_time()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_save_rolls_back_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.wayfarer");
        let store = EventStore::open(&path, base_time()).await.unwrap();
        let kept = store.create(valid_draft("kept"), base_time()).await.unwrap();

        // Occupy the temp path with a directory so the next save fails.
        std::fs::create_dir(path.with_extension("tmp")).unwrap();

        let result = store.create(valid_draft("doomed"), base_time()).await;
        assert!(matches!(result, Err(StoreError::Persistence(_))));

        let visible = store.query(QueryFilter::everything(base_time())).await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, kept.id);
    }

    #[tokio::test]
    async fn merge_inserts_unknown_records() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let remote = new_event_for_tests(valid_draft("from another device"), base_time());
        let resolved = store.merge(remote.clone()).await.unwrap();
        assert_eq!(resolved, remote);
        assert_eq!(store.get(remote.id).await.unwrap(), remote);
    }

    #[tokio::test]
    async fn merge_newer_remote_trumps_local_scalars() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let local = store.create(valid_draft("lunch"), base_time()).await.unwrap();

        let mut remote = local.clone();
        remote.name = "brunch".into();
        remote.notes = "moved earlier".into();
        remote.last_modified = base_time() + Duration::minutes(5);
        remote.revision += 1;

        let resolved = store.merge(remote.clone()).await.unwrap();
        assert_eq!(resolved.name, "brunch");
        assert_eq!(resolved.notes, "moved earlier");
        assert_eq!(store.get(local.id).await.unwrap().name, "brunch");
    }

    #[tokio::test]
    async fn merge_prefers_non_null_blobs_from_either_side() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut draft = valid_draft("with photo");
        draft.image = Some(Blob(vec![7; 8]));
        let local = store.create(draft, base_time()).await.unwrap();

        // A newer remote that never saw the photo must not erase it.
        let mut remote = local.clone();
        remote.image = None;
        remote.name = "renamed".into();
        remote.last_modified = base_time() + Duration::minutes(1);
        remote.revision += 1;

        let resolved = store.merge(remote).await.unwrap();
        assert_eq!(resolved.name, "renamed");
        assert_eq!(resolved.image, local.image);
    }

    // Clocks and revisions are drawn from tiny ranges so replicas
    // routinely tie on them and resolution falls through to the
    // digest tiebreak.
    #[tokio::test]
    async fn merge_converges_when_replica_clocks_tie() {
        let dir = tempdir().unwrap();
        let a = EventStore::open(dir.path().join("a.wayfarer"), base_time())
            .await
            .unwrap();
        let b = EventStore::open(dir.path().join("b.wayfarer"), base_time())
            .await
            .unwrap();

        // Three replica versions sharing one clock, so only the
        // digest tiebreak separates them. One carries an image the
        // others never saw.
        let base = new_event_for_tests(valid_draft("coffee"), base_time());
        let id = base.id;
        let mut with_photo = base.clone();
        with_photo.image = Some(Stamped::new(Blob(vec![9; 4]), base_time()));
        let mut renamed = base.clone();
        renamed.name = "coffee and cake".into();

        a.merge(base.clone()).await.unwrap();
        a.merge(with_photo.clone()).await.unwrap();
        a.merge(renamed.clone()).await.unwrap();

        b.merge(renamed).await.unwrap();
        b.merge(with_photo).await.unwrap();
        b.merge(base).await.unwrap();

        let on_a = a.get(id).await.unwrap();
        let on_b = b.get(id).await.unwrap();
        assert_eq!(on_a, on_b, "merge order must not matter");
        assert!(on_a.image.is_some(), "the image survives every order");
    }

    #[tokio::test]
    async fn failed_save_rolls_back_in_place_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.wayfarer");
        let store = EventStore::open(&path, base_time()).await.unwrap();
        let event = store.create(valid_draft("kept"), base_time()).await.unwrap();

        // Occupy the temp path with a directory so the next save fails.
        std::fs::create_dir(path.with_extension("tmp")).unwrap();

        let result = store.soft_delete(event.id, base_time()).await;
        assert!(matches!(result, Err(StoreError::Persistence(_))));

        let loaded = store.get(event.id).await.unwrap();
        assert!(!loaded.marked_for_deletion);
        assert_eq!(loaded.revision, event.revision);
    }

    fn arb_event(id: EventId) -> impl Strategy<Value = Event> {
        (
            "[a-z]{1,12}",
            prop::sample::select(EventKind::ALL.to_vec()),
            0i64..1_000_000,
            prop::option::of(("[a-z]{1,8}", 0i64..3)),
            any::<bool>(),
            0u64..3,
            0i64..3,
        )
            .prop_map(move |(name, kind, date_s, image, marked, revision, modified_s)| Event {
                id,
                name,
                kind,
                date: Utc.timestamp_opt(date_s, 0).unwrap(),
                timezone_id: None,
                location: EventLocation {
                    name: "somewhere".into(),
                    coordinate: LatLon::new(1.0, 2.0),
                    ..EventLocation::default()
                },
                notes: String::new(),
                image: image.map(|(bytes, stamp_s)| {
                    Stamped::new(
                        Blob(bytes.into_bytes()),
                        Utc.timestamp_opt(stamp_s, 0).unwrap(),
                    )
                }),
                attachment: None,
                marked_for_deletion: marked,
                last_modified: Utc.timestamp_opt(modified_s, 0).unwrap(),
                revision,
            })
    }

    proptest! {
        // Concurrent remote updates must converge to the same record
        // whatever order they arrive in, tied clocks included.
        #[test]
        fn merge_is_commutative(
            seed in (0u64..u64::MAX).prop_flat_map(|_| {
                let id = EventId::generate();
                (arb_event(id), arb_event(id), arb_event(id))
            }),
        ) {
            let (base, r1, r2) = seed;
            let left = resolve(resolve(base.clone(), r1.clone()), r2.clone());
            let right = resolve(resolve(base, r2), r1);
            prop_assert_eq!(left, right);
        }

        // Pairwise resolution is symmetric.
        #[test]
        fn merge_is_deterministic(
            seed in (0u64..u64::MAX).prop_flat_map(|_| {
                let id = EventId::generate();
                (arb_event(id), arb_event(id))
            }),
        ) {
            let (a, b) = seed;
            prop_assert_eq!(resolve(a.clone(), b.clone()), resolve(b, a));
        }
    }
}
