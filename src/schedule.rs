//! Timezone-aware display and grouping over the store's query results.
//!
//! Everything here is pure computation: an event's stored instant plus
//! its own IANA timezone in, strings and day buckets out. Events are
//! grouped by the calendar day *where the event happens*, not the day
//! on the traveler's device, so a late-evening UTC instant can land on
//! the next day's page.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::Event;

/// An event instant rendered for display in both clocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalizedInstant {
    /// Time-of-day in the event's own timezone.
    pub event_local: String,
    /// The same instant in the device timezone.
    pub device_local: String,
    /// True when the two zones disagree at this instant, meaning the
    /// view should show a disambiguating annotation.
    pub differs: bool,
}

impl LocalizedInstant {
    /// Display string with the device-time annotation when needed,
    /// e.g. `3:00 PM (6:00 AM device time)`.
    #[must_use]
    pub fn annotated(&self) -> String {
        if self.differs {
            format!("{} ({} device time)", self.event_local, self.device_local)
        } else {
            self.event_local.clone()
        }
    }
}

/// The event's stored timezone, when present and parseable.
#[must_use]
pub fn event_timezone(event: &Event) -> Option<Tz> {
    event.timezone_id.as_deref()?.parse().ok()
}

/// Render the event's instant in its own timezone and the device's.
#[must_use]
pub fn localize(event: &Event, device_tz: Tz) -> LocalizedInstant {
    let event_tz = event_timezone(event).unwrap_or(device_tz);
    let in_event_tz = event.date.with_timezone(&event_tz);
    let in_device_tz = event.date.with_timezone(&device_tz);

    LocalizedInstant {
        event_local: format_time(&in_event_tz),
        device_local: format_time(&in_device_tz),
        differs: in_event_tz.offset().fix() != in_device_tz.offset().fix(),
    }
}

/// Calendar day of the event in its own timezone (device fallback).
#[must_use]
pub fn local_day(event: &Event, device_tz: Tz) -> NaiveDate {
    let tz = event_timezone(event).unwrap_or(device_tz);
    event.date.with_timezone(&tz).date_naive()
}

/// Bucket events by their own local calendar day. Keys ascend;
/// each bucket is ordered by instant. Soft-deleted events never
/// appear, whatever the caller passed in.
#[must_use]
pub fn group_by_local_day<'a>(
    events: &'a [Event],
    device_tz: Tz,
) -> BTreeMap<NaiveDate, Vec<&'a Event>> {
    let mut days: BTreeMap<NaiveDate, Vec<&Event>> = BTreeMap::new();
    for event in events.iter().filter(|e| !e.marked_for_deletion) {
        days.entry(local_day(event, device_tz)).or_default().push(event);
    }
    for bucket in days.values_mut() {
        bucket.sort_by_key(|e| (e.date, e.id));
    }
    days
}

/// Strict "already happened" check against the supplied instant.
#[must_use]
pub fn is_past(event: &Event, now: DateTime<Utc>) -> bool {
    event.date < now
}

/// English ordinal suffix; teens are always "th".
#[must_use]
pub fn ordinal_suffix(day: u32) -> &'static str {
    match day % 100 {
        11..=13 => "th",
        _ => match day % 10 {
            1 => "st",
            2 => "nd",
            3 => "rd",
            _ => "th",
        },
    }
}

/// `3:00 PM`
#[must_use]
pub fn format_time<T: TimeZone>(instant: &DateTime<T>) -> String
where
    T::Offset: std::fmt::Display,
{
    instant.format("%-I:%M %p").to_string()
}

/// `21st`
#[must_use]
pub fn format_date_short<T: TimeZone>(instant: &DateTime<T>) -> String
where
    T::Offset: std::fmt::Display,
{
    let day = instant.day();
    format!("{day}{}", ordinal_suffix(day))
}

/// `21st Jun @ 3:00 PM`
#[must_use]
pub fn format_date_medium<T: TimeZone>(instant: &DateTime<T>) -> String
where
    T::Offset: std::fmt::Display,
{
    format!(
        "{} {} @ {}",
        format_date_short(instant),
        instant.format("%b"),
        format_time(instant)
    )
}

/// `Friday, 21st June`
#[must_use]
pub fn format_date_long<T: TimeZone>(instant: &DateTime<T>) -> String
where
    T::Offset: std::fmt::Display,
{
    format!(
        "{}, {} {}",
        instant.format("%A"),
        format_date_short(instant),
        instant.format("%B")
    )
}
