//! Conversion of listed Google Calendar event resources into CRM calendar events.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A calendar event as the CRM stores it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    /// Google event id
    pub external_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub all_day: bool,
}

/// Google's `start`/`end` object: either `dateTime` or `date` is set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEventTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

/// The subset of the Google event resource the CRM uses.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<GoogleEventTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<GoogleEventTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

/// What a remote event means for the CRM's copy.
#[derive(Clone, Debug, PartialEq)]
pub enum EventChange {
    Upsert(CalendarEvent),
    Delete { external_id: String },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MappingError {
    #[error("event has no id")]
    MissingId,
    #[error("event {id} has no usable {field} time")]
    MissingTime { id: String, field: &'static str },
}

/// Interpret a listed event. Cancelled events become deletions.
pub fn from_google_event(event: GoogleEvent) -> Result<EventChange, MappingError> {
    let id = event.id.ok_or(MappingError::MissingId)?;

    if event.status.as_deref() == Some("cancelled") {
        return Ok(EventChange::Delete { external_id: id });
    }

    let start = event.start.unwrap_or_default();
    let end = event.end.unwrap_or_default();
    let all_day = start.date_time.is_none() && start.date.is_some();

    let starts_at = from_google_time(&start).ok_or_else(|| MappingError::MissingTime {
        id: id.clone(),
        field: "start",
    })?;
    let ends_at = from_google_time(&end).ok_or_else(|| MappingError::MissingTime {
        id: id.clone(),
        field: "end",
    })?;

    Ok(EventChange::Upsert(CalendarEvent {
        external_id: Some(id),
        title: event.summary.unwrap_or_else(|| "(No title)".to_string()),
        description: event.description,
        location: event.location,
        starts_at,
        ends_at,
        all_day,
    }))
}

fn from_google_time(time: &GoogleEventTime) -> Option<DateTime<Utc>> {
    if let Some(dt) = time.date_time {
        return Some(dt.with_timezone(&Utc));
    }
    time.date
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
