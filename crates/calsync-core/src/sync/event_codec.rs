//! Encoding/decoding between local events and the Graph calendar wire format.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::json;

use crate::sync::types::{Event, SyncError};

/// Separator placed before the provenance note in outbound descriptions.
pub const NOTE_SEPARATOR: &str = "---";
const CREATED_NOTE: &str = "Created by calsync";
const EDITED_NOTE_PREFIX: &str = "Last edited by calsync at ";

/// Graph date-time format (no offset; the zone is sent separately).
const GRAPH_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Fields of an event the remote calendar stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPayload {
    pub subject: String,
    pub body: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub location: String,
}

/// An event as listed by the remote calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub id: String,
    pub calendar_id: String,
    pub subject: String,
    /// Plain text with provenance notes removed.
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub location: String,
    pub last_modified: DateTime<Utc>,
    /// Tombstone from an incremental listing.
    pub is_removed: bool,
}

/// Which provenance note an outbound body carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncNote {
    Created,
    Edited(DateTime<Utc>),
}

// ============================================================================
// Outbound
// ============================================================================

/// Build the remote payload for `event`.
pub fn payload_for(event: &Event, note: SyncNote) -> EventPayload {
    EventPayload {
        subject: event.title.clone(),
        body: compose_remote_body(&event.description, note),
        start: event.start_time,
        end: event.end_time,
        is_all_day: event.is_all_day,
        location: event.location.clone(),
    }
}

/// Convert a payload to a Graph event body.
pub fn to_graph_event(payload: &EventPayload) -> serde_json::Value {
    json!({
        "subject": payload.subject,
        "body": {
            "contentType": "text",
            "content": payload.body,
        },
        "start": {
            "dateTime": payload.start.format(GRAPH_DATETIME_FORMAT).to_string(),
            "timeZone": "UTC",
        },
        "end": {
            "dateTime": payload.end.format(GRAPH_DATETIME_FORMAT).to_string(),
            "timeZone": "UTC",
        },
        "location": {
            "displayName": payload.location,
        },
        "isAllDay": payload.is_all_day,
    })
}

/// Append the provenance note to a description, replacing any previous note.
pub fn compose_remote_body(description: &str, note: SyncNote) -> String {
    let original = strip_sync_notes(description);
    let note_line = match note {
        SyncNote::Created => CREATED_NOTE.to_string(),
        SyncNote::Edited(at) => format!(
            "{EDITED_NOTE_PREFIX}{}",
            at.format("%Y-%m-%d %H:%M:%S")
        ),
    };
    if original.is_empty() {
        format!("{NOTE_SEPARATOR}\n{note_line}")
    } else {
        format!("{original}\n\n{NOTE_SEPARATOR}\n{note_line}")
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Remove trailing provenance notes written by [`compose_remote_body`].
pub fn strip_sync_notes(description: &str) -> String {
    let lines: Vec<&str> = description.lines().collect();

    let separator = lines.iter().rposition(|l| l.trim() == NOTE_SEPARATOR);
    let Some(separator) = separator else {
        return description.trim_end().to_string();
    };

    let tail = &lines[separator + 1..];
    let only_notes = !tail.is_empty()
        && tail.iter().all(|l| {
            let l = l.trim();
            l.is_empty() || l == CREATED_NOTE || l.starts_with(EDITED_NOTE_PREFIX)
        });
    if !only_notes {
        return description.trim_end().to_string();
    }

    lines[..separator].join("\n").trim_end().to_string()
}

/// Convert an HTML body to plain text.
pub fn clean_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut chars = html.chars();

    while let Some(c) = chars.next() {
        if c != '<' {
            text.push(c);
            continue;
        }
        let mut tag = String::new();
        for t in chars.by_ref() {
            if t == '>' {
                break;
            }
            tag.push(t);
        }
        let name = tag
            .trim_start_matches('/')
            .split(|ch: char| ch.is_whitespace() || ch == '/')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        let closing = tag.starts_with('/');
        match name.as_str() {
            "br" => text.push('\n'),
            "p" | "div" | "li" | "tr" if closing => text.push('\n'),
            _ => {}
        }
    }

    let decoded = decode_entities(&text);
    let lines: Vec<&str> = decoded.lines().map(str::trim_end).collect();
    let mut out = String::new();
    let mut blank_run = 0;
    for line in lines {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out.trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Parse a Graph `dateTimeTimeZone` value; listings request UTC.
fn parse_graph_datetime(value: &serde_json::Value, field: &str) -> Result<DateTime<Utc>, SyncError> {
    let raw = value["dateTime"]
        .as_str()
        .ok_or_else(|| SyncError::Payload(format!("missing {field}.dateTime")))?;

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| SyncError::Payload(format!("invalid {field}.dateTime '{raw}': {e}")))
}

/// Parse a Graph event listed from `calendar_id`.
pub fn parse_graph_event(
    value: &serde_json::Value,
    calendar_id: &str,
) -> Result<RemoteEvent, SyncError> {
    let id = value["id"]
        .as_str()
        .ok_or_else(|| SyncError::Payload("missing id".into()))?
        .to_string();

    if value.get("@removed").is_some() {
        return Ok(RemoteEvent {
            id,
            calendar_id: calendar_id.to_string(),
            subject: String::new(),
            description: String::new(),
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MIN_UTC,
            is_all_day: false,
            location: String::new(),
            last_modified: Utc::now(),
            is_removed: true,
        });
    }

    let body = &value["body"];
    let content = body["content"]
        .as_str()
        .or_else(|| value["bodyPreview"].as_str())
        .unwrap_or("");
    let plain = if body["contentType"]
        .as_str()
        .is_some_and(|t| t.eq_ignore_ascii_case("html"))
    {
        clean_html(content)
    } else {
        content.to_string()
    };

    let last_modified = value["lastModifiedDateTime"]
        .as_str()
        .ok_or_else(|| SyncError::Payload("missing lastModifiedDateTime".into()))
        .and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| SyncError::Payload(format!("invalid lastModifiedDateTime: {e}")))
        })?;

    Ok(RemoteEvent {
        id,
        calendar_id: calendar_id.to_string(),
        subject: value["subject"].as_str().unwrap_or("").to_string(),
        description: strip_sync_notes(&plain),
        start: parse_graph_datetime(&value["start"], "start")?,
        end: parse_graph_datetime(&value["end"], "end")?,
        is_all_day: value["isAllDay"].as_bool().unwrap_or(false),
        location: value["location"]["displayName"]
            .as_str()
            .unwrap_or("")
            .to_string(),
        last_modified,
        is_removed: value["isCancelled"].as_bool().unwrap_or(false),
    })
}

/// Whether the remote copy differs from the local event in any synced field.
pub fn remote_differs(local: &Event, remote: &RemoteEvent) -> bool {
    local.title != remote.subject
        || strip_sync_notes(&local.description) != remote.description
        || local.location != remote.location
        || local.is_all_day != remote.is_all_day
        || local.start_time != remote.start
        || local.end_time != remote.end
}

/// A local record for a remote event with no local counterpart.
pub fn import_remote_event(remote: &RemoteEvent, now: DateTime<Utc>) -> Event {
    use crate::sync::types::{EventOrigin, SyncStatus};

    Event {
        id: EventOrigin::imported_id(&remote.id),
        title: remote.subject.clone(),
        start_time: remote.start,
        end_time: remote.end,
        is_all_day: remote.is_all_day,
        description: remote.description.clone(),
        location: remote.location.clone(),
        category_id: None,
        category_ids: Vec::new(),
        calendar_id: Some(remote.calendar_id.clone()),
        remarkable_source: false,
        external_id: Some(remote.id.clone()),
        sync_status: SyncStatus::Synced,
        last_sync_time: Some(now.max(remote.last_modified)),
        local_version: 0,
        synced_version: 0,
        last_local_change: None,
        sync_error: None,
    }
}
