//! CoT XML serializer.
//!
//! Attribute order is fixed so peers see byte-stable output. GeoChat events
//! are expanded into the full `__chat` / `chatgrp` / `link` /
//! `__serverdestination` / `remarks` cluster ATAK clients expect.

use crate::{
    format_timestamp, parse_geochat_uid, xml_escape, ChatDetail, CotEvent, ALL_CHAT_ROOMS,
};
use std::fmt::Write as _;

/// Serialize an event to a CoT XML document.
pub fn to_xml(ev: &CotEvent) -> String {
    let mut xml = String::with_capacity(512);
    xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);

    let _ = write!(
        xml,
        r#"<event version="2.0" uid="{}" type="{}" time="{}" start="{}" stale="{}" how="{}">"#,
        xml_escape(&ev.uid),
        xml_escape(&ev.event_type),
        format_timestamp(ev.time),
        format_timestamp(ev.start),
        format_timestamp(ev.stale),
        xml_escape(&ev.how),
    );
    let _ = write!(
        xml,
        r#"<point lat="{}" lon="{}" hae="{}" ce="{}" le="{}"/>"#,
        ev.point.lat, ev.point.lon, ev.point.hae, ev.point.ce, ev.point.le,
    );

    let detail = detail_xml(ev);
    if detail.is_empty() {
        xml.push_str("<detail/>");
    } else {
        xml.push_str("<detail>");
        xml.push_str(&detail);
        xml.push_str("</detail>");
    }

    xml.push_str("</event>");
    xml
}

fn detail_xml(ev: &CotEvent) -> String {
    let mut d = String::new();

    if ev.is_chat() {
        write_chat_cluster(&mut d, ev);
    } else {
        if let Some(contact) = &ev.contact {
            let _ = write!(d, r#"<contact callsign="{}""#, xml_escape(&contact.callsign));
            if let Some(endpoint) = &contact.endpoint {
                let _ = write!(d, r#" endpoint="{}""#, xml_escape(endpoint));
            }
            if let Some(phone) = &contact.phone {
                let _ = write!(d, r#" phone="{}""#, xml_escape(phone));
            }
            d.push_str("/>");
        }
        if let Some(group) = &ev.group {
            let _ = write!(
                d,
                r#"<__group name="{}" role="{}"/>"#,
                xml_escape(&group.name),
                xml_escape(&group.role),
            );
        }
        if let Some(status) = &ev.status {
            let _ = write!(d, r#"<status battery="{}"/>"#, status.battery);
        }
        if let Some(track) = &ev.track {
            let _ = write!(
                d,
                r#"<track speed="{}" course="{}"/>"#,
                track.speed, track.course,
            );
        }
        if let Some(remarks) = &ev.remarks {
            let _ = write!(d, "<remarks>{}</remarks>", xml_escape(remarks));
        }
    }

    d.push_str(&ev.raw_detail);
    d
}

fn write_chat_cluster(d: &mut String, ev: &CotEvent) {
    // Upstream events are not required to carry a chat block; fall back to
    // the remarks body so the wire invariant holds.
    let fallback;
    let chat = match &ev.chat {
        Some(chat) => chat,
        None => {
            fallback = ChatDetail {
                message: ev.remarks.clone().unwrap_or_default(),
                sender_callsign: None,
                chatroom: ALL_CHAT_ROOMS.to_string(),
            };
            &fallback
        }
    };

    let (sender_uid, message_id) = match parse_geochat_uid(&ev.uid) {
        Some(id) => (id.sender_uid, id.message_id),
        None => (ev.uid.clone(), ev.uid.clone()),
    };
    let sender_callsign = chat
        .sender_callsign
        .clone()
        .or_else(|| ev.contact.as_ref().map(|c| c.callsign.clone()))
        .unwrap_or_else(|| sender_uid.clone());
    let room = xml_escape(&chat.chatroom);
    let sender_uid = xml_escape(&sender_uid);

    let _ = write!(
        d,
        r#"<__chat parent="RootContactGroup" groupOwner="false" messageId="{}" chatroom="{}" id="{}" senderCallsign="{}">"#,
        xml_escape(&message_id),
        room,
        room,
        xml_escape(&sender_callsign),
    );
    let _ = write!(
        d,
        r#"<chatgrp uid0="{}" uid1="{}" id="{}"/></__chat>"#,
        sender_uid, room, room,
    );
    let _ = write!(
        d,
        r#"<link uid="{}" type="a-f-G-U-C" relation="p-p"/>"#,
        sender_uid,
    );
    let _ = write!(
        d,
        r#"<__serverdestination destinations="127.0.0.1:8089:tcp:{}"/>"#,
        sender_uid,
    );
    let _ = write!(
        d,
        r#"<remarks source="BAO.F.ATAK.{}" to="{}" time="{}">{}</remarks>"#,
        sender_uid,
        room,
        format_timestamp(ev.time),
        xml_escape(&chat.message),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        parse_event, ContactDetail, CotPoint, GroupDetail, StatusDetail, TrackDetail,
        UNKNOWN_VALUE,
    };

    fn pli_event() -> CotEvent {
        let mut ev = CotEvent::new("U1", "a-f-G-U-C", CotPoint::new(37.5, -122.25, 12.0));
        ev.contact = Some(ContactDetail {
            callsign: "ALPHA".into(),
            endpoint: Some("*:-1:stcp".into()),
            phone: None,
        });
        ev.group = Some(GroupDetail::default());
        ev.status = Some(StatusDetail { battery: 84 });
        ev.track = Some(TrackDetail {
            speed: 1.5,
            course: 270.0,
        });
        ev.remarks = Some("on station".into());
        ev
    }

    #[test]
    fn test_roundtrip_pli() {
        let original = pli_event();
        let xml = to_xml(&original);
        let parsed = parse_event(&xml).unwrap();

        assert_eq!(parsed.uid, original.uid);
        assert_eq!(parsed.event_type, original.event_type);
        assert_eq!(parsed.point, original.point);
        assert_eq!(parsed.contact, original.contact);
        assert_eq!(parsed.group, original.group);
        assert_eq!(parsed.status, original.status);
        assert_eq!(parsed.track, original.track);
        assert_eq!(parsed.remarks, original.remarks);
        // Timestamps round-trip at millisecond precision.
        assert_eq!(parsed.time.timestamp_millis(), original.time.timestamp_millis());
    }

    #[test]
    fn test_roundtrip_preserves_raw_detail() {
        let mut ev = CotEvent::new("U2", "u-d-f", CotPoint::unknown());
        ev.raw_detail =
            r#"<color argb="-65536"/><shape><ellipse major="100" minor="50"/></shape>"#.into();

        let xml = to_xml(&ev);
        let parsed = parse_event(&xml).unwrap();
        assert_eq!(parsed.raw_detail, ev.raw_detail);

        // A second pass is byte-stable.
        let xml2 = to_xml(&parsed);
        assert_eq!(xml, xml2);
    }

    #[test]
    fn test_chat_cluster_shape() {
        let mut ev = CotEvent::new(
            "GeoChat.ANDROID-abc.All Chat Rooms.MID42",
            "b-t-f",
            CotPoint::unknown(),
        );
        ev.chat = Some(ChatDetail {
            message: "hello mesh".into(),
            sender_callsign: Some("ALPHA".into()),
            chatroom: ALL_CHAT_ROOMS.into(),
        });

        let xml = to_xml(&ev);
        assert!(xml.contains(r#"messageId="MID42""#));
        assert!(xml.contains(r#"chatroom="All Chat Rooms""#));
        assert!(xml.contains(r#"<chatgrp uid0="ANDROID-abc""#));
        assert!(xml.contains(r#"<link uid="ANDROID-abc""#));
        assert!(xml.contains(r#"<__serverdestination"#));
        assert!(xml.contains(r#"source="BAO.F.ATAK.ANDROID-abc""#));
        assert!(xml.contains(r#"to="All Chat Rooms""#));
        assert!(xml.contains(">hello mesh</remarks>"));
    }

    #[test]
    fn test_chat_without_detail_synthesized_from_remarks() {
        let mut ev = CotEvent::new("U3", "b-t-f", CotPoint::unknown());
        ev.remarks = Some("fallback body".into());

        let xml = to_xml(&ev);
        // Sender uid and message id fall back to the event uid.
        assert!(xml.contains(r#"messageId="U3""#));
        assert!(xml.contains(">fallback body</remarks>"));

        let parsed = parse_event(&xml).unwrap();
        assert_eq!(parsed.chat.unwrap().message, "fallback body");
    }

    #[test]
    fn test_empty_detail_serializes_self_closed() {
        let ev = CotEvent::new("takPong", "t-x-d-d", CotPoint::unknown());
        let xml = to_xml(&ev);
        assert!(xml.contains("<detail/>"));
        assert!(xml.contains(&format!(r#"hae="{}""#, UNKNOWN_VALUE)));
    }

    #[test]
    fn test_escaping_special_characters() {
        let mut ev = CotEvent::new("A&B", "a-f-G", CotPoint::unknown());
        ev.remarks = Some("x < y & z".into());

        let xml = to_xml(&ev);
        assert!(xml.contains(r#"uid="A&amp;B""#));
        assert!(xml.contains("<remarks>x &lt; y &amp; z</remarks>"));

        let parsed = parse_event(&xml).unwrap();
        assert_eq!(parsed.uid, "A&B");
        assert_eq!(parsed.remarks.as_deref(), Some("x < y & z"));
    }
}
