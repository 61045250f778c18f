//! TAK Protocol negotiation and keepalive events.
//!
//! The gateway speaks TAK Protocol version 0 (plain XML streaming) only, and
//! says so: a `TakProtocolSupport` announcement on connect, and a
//! `TakResponse` if the client asks to negotiate.

use chrono::Duration;
use meshtak_cot::{CotEvent, CotPoint};

/// First event sent on every fresh connection: XML-only transport.
pub fn support_event() -> CotEvent {
    let mut ev = CotEvent::new(
        format!("protocol-support-{}", uuid::Uuid::new_v4()),
        "t-x-takp-v",
        CotPoint::unknown(),
    );
    ev.how = "m-g".to_string();
    ev.stale = ev.time + Duration::minutes(1);
    ev.raw_detail = r#"<TakProtocolSupport version="0"/>"#.to_string();
    ev
}

/// Reply to a `t-x-takp-q` negotiation request.
pub fn negotiation_response() -> CotEvent {
    let mut ev = CotEvent::new(
        format!("protocol-response-{}", uuid::Uuid::new_v4()),
        "t-x-takp-r",
        CotPoint::unknown(),
    );
    ev.how = "m-g".to_string();
    ev.stale = ev.time + Duration::minutes(1);
    ev.raw_detail = r#"<TakResponse status="true"/>"#.to_string();
    ev
}

/// Periodic keepalive towards connected clients.
pub fn keepalive_event() -> CotEvent {
    let mut ev = CotEvent::new("takPong", "t-x-d-d", CotPoint::unknown());
    ev.how = "m-g".to_string();
    ev.stale = ev.time + Duration::minutes(1);
    ev
}

pub fn is_negotiation_request(ev: &CotEvent) -> bool {
    ev.event_type == "t-x-takp-q"
}
