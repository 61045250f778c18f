//! # MeshTAK CoT
//!
//! Cursor on Target (CoT) event model, streaming XML parser and serializer.
//!
//! Unrecognized `<detail>` children survive a parse/serialize round trip
//! verbatim through [`CotEvent::raw_detail`], so events carrying vendor
//! extensions can cross the mesh without this crate understanding them.

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod parse;
mod write;

pub use parse::parse_event;
pub use write::to_xml;

/// Sentinel for an unknown point component.
pub const UNKNOWN_VALUE: f64 = 9_999_999.0;

/// Event type of a GeoChat message.
pub const CHAT_EVENT_TYPE: &str = "b-t-f";

/// Chatroom name addressing every TAK user on the mesh.
pub const ALL_CHAT_ROOMS: &str = "All Chat Rooms";

#[derive(Error, Debug)]
pub enum CotError {
    #[error("CoT parse failed: {0}")]
    ParseFailed(String),
}

/// Geographic point of an event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CotPoint {
    pub lat: f64,
    pub lon: f64,
    /// Height above ellipsoid in meters.
    pub hae: f64,
    /// Circular error in meters.
    pub ce: f64,
    /// Linear error in meters.
    pub le: f64,
}

impl CotPoint {
    pub fn new(lat: f64, lon: f64, hae: f64) -> Self {
        Self {
            lat,
            lon,
            hae,
            ce: UNKNOWN_VALUE,
            le: UNKNOWN_VALUE,
        }
    }

    /// A point with every component unknown.
    pub fn unknown() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            hae: UNKNOWN_VALUE,
            ce: UNKNOWN_VALUE,
            le: UNKNOWN_VALUE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactDetail {
    pub callsign: String,
    pub endpoint: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDetail {
    /// Team color name, e.g. "Cyan".
    pub name: String,
    /// Role name, e.g. "Team Member".
    pub role: String,
}

impl Default for GroupDetail {
    fn default() -> Self {
        Self {
            name: "Cyan".to_string(),
            role: "Team Member".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusDetail {
    /// Battery level in percent.
    pub battery: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackDetail {
    /// Ground speed in m/s.
    pub speed: f64,
    /// Course over ground in degrees.
    pub course: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDetail {
    pub message: String,
    pub sender_callsign: Option<String>,
    pub chatroom: String,
}

impl Default for ChatDetail {
    fn default() -> Self {
        Self {
            message: String::new(),
            sender_callsign: None,
            chatroom: ALL_CHAT_ROOMS.to_string(),
        }
    }
}

/// A single CoT event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CotEvent {
    pub uid: String,
    /// Dot-separated taxonomy, e.g. "a-f-G-U-C" for a friendly ground unit.
    pub event_type: String,
    /// How the data was generated.
    pub how: String,
    pub time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub stale: DateTime<Utc>,
    pub point: CotPoint,
    pub contact: Option<ContactDetail>,
    pub group: Option<GroupDetail>,
    pub status: Option<StatusDetail>,
    pub track: Option<TrackDetail>,
    pub chat: Option<ChatDetail>,
    pub remarks: Option<String>,
    /// Unrecognized `<detail>` subtrees, preserved verbatim.
    pub raw_detail: String,
}

impl CotEvent {
    pub fn new(uid: impl Into<String>, event_type: impl Into<String>, point: CotPoint) -> Self {
        let now = Utc::now();
        Self {
            uid: uid.into(),
            event_type: event_type.into(),
            how: "m-g".to_string(),
            time: now,
            start: now,
            stale: now + Duration::minutes(5),
            point,
            contact: None,
            group: None,
            status: None,
            track: None,
            chat: None,
            remarks: None,
            raw_detail: String::new(),
        }
    }

    /// Friendly ground-unit position report.
    pub fn is_pli(&self) -> bool {
        self.event_type.starts_with("a-f-G") || self.event_type.starts_with("a-f-g")
    }

    /// GeoChat message.
    pub fn is_chat(&self) -> bool {
        self.event_type == CHAT_EVENT_TYPE
    }

    /// TAK Protocol negotiation traffic, consumed by the server.
    pub fn is_protocol_control(&self) -> bool {
        self.event_type.starts_with("t-x-takp")
    }

    /// Connection ping, consumed by the server.
    pub fn is_ping(&self) -> bool {
        self.event_type == "t-x-c-t" || self.uid == "ping"
    }
}

impl fmt::Display for CotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CoT[uid={}, type={}, lat={}, lon={}]",
            self.uid, self.event_type, self.point.lat, self.point.lon
        )
    }
}

/// Parts of a `GeoChat.<senderUid>.<chatroom>.<messageId>` uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoChatId {
    pub sender_uid: String,
    pub chatroom: String,
    pub message_id: String,
}

/// Split a GeoChat uid into its sender / room / message-id parts.
pub fn parse_geochat_uid(uid: &str) -> Option<GeoChatId> {
    let mut parts = uid.splitn(4, '.');
    if parts.next()? != "GeoChat" {
        return None;
    }
    let sender_uid = parts.next()?.to_string();
    let chatroom = parts.next()?.to_string();
    let message_id = parts.next()?.to_string();
    if sender_uid.is_empty() || message_id.is_empty() {
        return None;
    }
    Some(GeoChatId {
        sender_uid,
        chatroom,
        message_id,
    })
}

/// Parse a CoT timestamp, falling back to "now" when missing or malformed.
///
/// Accepts RFC-3339 with or without fractional seconds, plus the bare
/// `yyyy-MM-dd'T'HH:mm:ss'Z'` form some clients emit.
pub fn parse_timestamp(value: Option<&str>) -> DateTime<Utc> {
    let Some(s) = value else {
        return Utc::now();
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ") {
        return naive.and_utc();
    }
    Utc::now()
}

pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Escape text for inclusion in XML content or attribute values.
pub(crate) fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geochat_uid_roundtrip() {
        let id = parse_geochat_uid("GeoChat.ANDROID-abc.All Chat Rooms.MID42").unwrap();
        assert_eq!(id.sender_uid, "ANDROID-abc");
        assert_eq!(id.chatroom, "All Chat Rooms");
        assert_eq!(id.message_id, "MID42");
    }

    #[test]
    fn test_geochat_uid_rejects_plain_uids() {
        assert!(parse_geochat_uid("ANDROID-abc").is_none());
        assert!(parse_geochat_uid("GeoChat.only.two").is_none());
    }

    #[test]
    fn test_timestamp_formats() {
        let exact = parse_timestamp(Some("2025-01-01T00:00:00Z"));
        assert_eq!(exact.to_rfc3339(), "2025-01-01T00:00:00+00:00");

        let millis = parse_timestamp(Some("2025-01-01T00:00:00.123Z"));
        assert_eq!(millis.timestamp_subsec_millis(), 123);

        // Malformed values default to now rather than failing the event.
        let now = Utc::now();
        let fallback = parse_timestamp(Some("not-a-time"));
        assert!((fallback - now).num_seconds().abs() < 5);
    }

    #[test]
    fn test_classification() {
        let mut ev = CotEvent::new("U1", "a-f-G-U-C", CotPoint::unknown());
        assert!(ev.is_pli());
        assert!(!ev.is_chat());

        ev.event_type = "b-t-f".into();
        assert!(ev.is_chat());

        ev.event_type = "t-x-takp-q".into();
        assert!(ev.is_protocol_control());

        ev.event_type = "t-x-c-t".into();
        assert!(ev.is_ping());

        ev.event_type = "a-u-G".into();
        ev.uid = "ping".into();
        assert!(ev.is_ping());
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(
            xml_escape(r#"<a b="c&d">'e'"#),
            "&lt;a b=&quot;c&amp;d&quot;&gt;&apos;e&apos;"
        );
    }
}
