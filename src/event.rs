//! Reading-event records and their normalization.
//!
//! Raw log lines arrive with optional fields and sentinel conventions
//! inherited from the event source. Normalization is a total function from
//! a raw record to a validated domain event; every sentinel substitution
//! happens here, before anything reaches the merge keys in the store.

use crate::error::IngestError;
use chrono::NaiveDateTime;
use serde::Deserialize;

/// Canonical URL of the site's front page. Reads of this page carry no
/// article signal and are excluded from every candidate set at query time.
pub const FRONTPAGE_URL: &str = "http://adressa.no";

/// Reserved title marking a front-page read in `FrontpageMode::Tag`.
pub const FRONTPAGE_TITLE: &str = "Frontpage";

pub const UNKNOWN: &str = "Unknown";

/// Sentinel publish time substituted when the source omits the field.
pub const EPOCH_ZERO: &str = "1970-01-01T00:00:00.000Z";

const PUBLISH_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// One line of the event log, as written by the tracking pipeline.
/// `userId`, `eventId`, `time` and `url` are structurally required; a line
/// missing any of them fails deserialization and is a malformed record.
/// Free-form fields (city, device, session markers) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "eventId")]
    pub event_id: i64,
    pub time: i64,
    pub url: String,
    pub title: Option<String>,
    #[serde(rename = "activeTime")]
    pub active_time: Option<i64>,
    #[serde(rename = "publishtime")]
    pub publish_time: Option<String>,
    #[serde(rename = "documentId")]
    pub document_id: Option<String>,
    pub category: Option<String>,
}

/// A fully normalized reading event, safe to merge into the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEvent {
    pub user_id: String,
    pub event_id: i64,
    pub time: i64,
    pub url: String,
    pub title: String,
    pub active_time: i64,
    pub publish_time: i64,
    pub document_id: String,
    /// Pipe-delimited category string split into segments, empty if absent.
    pub categories: Vec<String>,
}

/// How to treat an event with no title whose URL is the front page.
/// Both behaviors exist in this pipeline's history; the choice is a
/// configuration option, default `Tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontpageMode {
    /// Keep the event, tagging it with the reserved front-page title.
    Tag,
    /// Drop the event entirely.
    Discard,
}

impl FrontpageMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "tag" => Some(FrontpageMode::Tag),
            "discard" => Some(FrontpageMode::Discard),
            _ => None,
        }
    }
}

/// Parse an ISO-8601-with-milliseconds, UTC-"Z"-suffixed publish time into
/// epoch seconds. A malformed value is fatal for the containing file.
pub fn parse_publish_time(raw: &str) -> Result<i64, IngestError> {
    NaiveDateTime::parse_from_str(raw, PUBLISH_TIME_FORMAT)
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|source| IngestError::TimestampFormat {
            value: raw.to_string(),
            source,
        })
}

/// Normalize a raw record into a domain event. Returns `Ok(None)` only for
/// a front-page event discarded under `FrontpageMode::Discard`.
pub fn normalize(raw: RawEvent, mode: FrontpageMode) -> Result<Option<ReadEvent>, IngestError> {
    let title = match raw.title {
        Some(title) => title,
        None if raw.url == FRONTPAGE_URL => match mode {
            FrontpageMode::Tag => FRONTPAGE_TITLE.to_string(),
            FrontpageMode::Discard => return Ok(None),
        },
        None => UNKNOWN.to_string(),
    };

    let publish_time = parse_publish_time(raw.publish_time.as_deref().unwrap_or(EPOCH_ZERO))?;

    let categories = raw
        .category
        .as_deref()
        .map(|c| {
            c.split('|')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(ReadEvent {
        user_id: raw.user_id,
        event_id: raw.event_id,
        time: raw.time,
        url: raw.url,
        title,
        active_time: raw.active_time.unwrap_or(-1),
        publish_time,
        document_id: raw.document_id.unwrap_or_else(|| UNKNOWN.to_string()),
        categories,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;

    fn raw(title: Option<&str>, url: &str) -> RawEvent {
        RawEvent {
            user_id: "cx:user-1".to_string(),
            event_id: 145694348,
            time: 1483743602,
            url: url.to_string(),
            title: title.map(str::to_string),
            active_time: None,
            publish_time: None,
            document_id: None,
            category: None,
        }
    }

    #[test]
    fn missing_fields_get_sentinels() {
        let event = normalize(raw(None, "http://adressa.no/nyheter/article1.html"), FrontpageMode::Tag)
            .unwrap()
            .unwrap();
        assert_eq!(event.title, UNKNOWN);
        assert_eq!(event.active_time, -1);
        assert_eq!(event.publish_time, 0);
        assert_eq!(event.document_id, UNKNOWN);
        assert!(event.categories.is_empty());
    }

    #[test]
    fn untitled_frontpage_read_is_tagged_in_tag_mode() {
        let event = normalize(raw(None, FRONTPAGE_URL), FrontpageMode::Tag)
            .unwrap()
            .unwrap();
        assert_eq!(event.title, FRONTPAGE_TITLE);
    }

    #[test]
    fn untitled_frontpage_read_is_dropped_in_discard_mode() {
        let event = normalize(raw(None, FRONTPAGE_URL), FrontpageMode::Discard).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn titled_frontpage_read_keeps_its_title() {
        let event = normalize(raw(Some("Forsiden"), FRONTPAGE_URL), FrontpageMode::Discard)
            .unwrap()
            .unwrap();
        assert_eq!(event.title, "Forsiden");
    }

    #[test]
    fn publish_time_parses_to_epoch_seconds() {
        // Wednesday, March 1, 2017 01:01:01 UTC
        assert_eq!(parse_publish_time("2017-03-01T01:01:01.000Z").unwrap(), 1488330061);
        assert_eq!(parse_publish_time(EPOCH_ZERO).unwrap(), 0);
    }

    #[test]
    fn malformed_publish_time_is_a_timestamp_error() {
        let mut event = raw(Some("Title"), "http://adressa.no/a.html");
        event.publish_time = Some("01-03-2017 01:01".to_string());
        let err = normalize(event, FrontpageMode::Tag).unwrap_err();
        assert!(matches!(err, IngestError::TimestampFormat { .. }));
    }

    #[test]
    fn pipe_delimited_categories_split_into_segments() {
        let mut event = raw(Some("Kampen"), "http://adressa.no/sport/a.html");
        event.category = Some("nyheter|sport|fotball".to_string());
        let event = normalize(event, FrontpageMode::Tag).unwrap().unwrap();
        assert_eq!(event.categories, vec!["nyheter", "sport", "fotball"]);
    }

    #[test]
    fn required_fields_are_enforced_by_deserialization() {
        // No userId
        let line = r#"{"eventId": 1, "time": 2, "url": "http://adressa.no"}"#;
        assert!(serde_json::from_str::<RawEvent>(line).is_err());

        let line = r#"{"userId": "u", "eventId": 1, "time": 2, "url": "http://adressa.no", "city": "trondheim", "os": "Android"}"#;
        let raw: RawEvent = serde_json::from_str(line).unwrap();
        assert_eq!(raw.user_id, "u");
    }
}
