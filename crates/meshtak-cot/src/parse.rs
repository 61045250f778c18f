//! Streaming CoT XML parser.
//!
//! SAX-style walk over a single `<event>` document. Recognized `<detail>`
//! children are lifted into typed fields; everything else is reconstructed
//! verbatim into [`CotEvent::raw_detail`]. The record is committed only when
//! `</event>` closes.

use crate::{
    parse_timestamp, xml_escape, ChatDetail, ContactDetail, CotError, CotEvent, CotPoint,
    GroupDetail, StatusDetail, TrackDetail, ALL_CHAT_ROOMS, UNKNOWN_VALUE,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt::Write as _;

/// Recognized children of `<detail>` opened as non-empty elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenChild {
    Chat,
    Remarks,
    Skip,
}

#[derive(Default)]
struct EventHeader {
    uid: Option<String>,
    event_type: Option<String>,
    how: Option<String>,
    time: Option<String>,
    start: Option<String>,
    stale: Option<String>,
}

/// Parse one CoT event document.
pub fn parse_event(xml: &str) -> Result<CotEvent, CotError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut header: Option<EventHeader> = None;
    let mut point: Option<CotPoint> = None;
    let mut contact: Option<ContactDetail> = None;
    let mut group: Option<GroupDetail> = None;
    let mut status: Option<StatusDetail> = None;
    let mut track: Option<TrackDetail> = None;
    let mut chat: Option<ChatDetail> = None;
    let mut remarks: Option<String> = None;
    let mut raw_detail = String::new();

    let mut in_detail = false;
    // Depth inside an unknown detail subtree being captured verbatim.
    let mut capture_depth = 0usize;
    // Recognized child currently open as a start tag, with its nesting depth.
    let mut open_child: Option<(OpenChild, usize)> = None;
    let mut remarks_text = String::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| CotError::ParseFailed(e.to_string()))?;

        match event {
            Event::Eof => return Err(CotError::ParseFailed("missing </event>".into())),

            Event::Start(e) => {
                if capture_depth > 0 {
                    append_open(&mut raw_detail, &e, false)?;
                    capture_depth += 1;
                    continue;
                }
                if let Some((_, depth)) = open_child.as_mut() {
                    *depth += 1;
                    continue;
                }
                let name = e.name();
                let name = name.as_ref();
                if header.is_none() {
                    if name != b"event" {
                        return Err(CotError::ParseFailed(format!(
                            "expected <event>, found <{}>",
                            String::from_utf8_lossy(name)
                        )));
                    }
                    header = Some(parse_header(&e)?);
                } else if !in_detail {
                    match name {
                        b"point" => {
                            point = Some(parse_point(&e)?);
                            open_child = Some((OpenChild::Skip, 1));
                        }
                        b"detail" => in_detail = true,
                        _ => open_child = Some((OpenChild::Skip, 1)),
                    }
                } else {
                    match name {
                        b"__chat" => {
                            chat = Some(parse_chat(&e)?);
                            open_child = Some((OpenChild::Chat, 1));
                        }
                        b"remarks" => {
                            remarks_text.clear();
                            open_child = Some((OpenChild::Remarks, 1));
                        }
                        b"contact" | b"__group" | b"status" | b"track" | b"chatgrp" | b"link"
                        | b"uid" | b"__serverdestination" => {
                            harvest_detail_child(
                                name,
                                &e,
                                &mut contact,
                                &mut group,
                                &mut status,
                                &mut track,
                                &mut chat,
                                &mut remarks,
                            )?;
                            open_child = Some((OpenChild::Skip, 1));
                        }
                        _ => {
                            append_open(&mut raw_detail, &e, false)?;
                            capture_depth = 1;
                        }
                    }
                }
            }

            Event::Empty(e) => {
                if capture_depth > 0 {
                    append_open(&mut raw_detail, &e, true)?;
                    continue;
                }
                if open_child.is_some() {
                    continue;
                }
                let name = e.name();
                let name = name.as_ref();
                if header.is_none() {
                    return Err(CotError::ParseFailed("empty <event/> has no point".into()));
                } else if !in_detail {
                    if name == b"point" {
                        point = Some(parse_point(&e)?);
                    }
                } else {
                    match name {
                        b"__chat" => chat = Some(parse_chat(&e)?),
                        b"contact" | b"__group" | b"status" | b"track" | b"chatgrp" | b"link"
                        | b"uid" | b"__serverdestination" | b"remarks" => {
                            harvest_detail_child(
                                name,
                                &e,
                                &mut contact,
                                &mut group,
                                &mut status,
                                &mut track,
                                &mut chat,
                                &mut remarks,
                            )?;
                        }
                        _ => append_open(&mut raw_detail, &e, true)?,
                    }
                }
            }

            Event::End(e) => {
                if capture_depth > 0 {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let _ = write!(raw_detail, "</{}>", name);
                    capture_depth -= 1;
                    continue;
                }
                if let Some((kind, depth)) = open_child.as_mut() {
                    *depth -= 1;
                    if *depth == 0 {
                        if *kind == OpenChild::Remarks {
                            remarks = Some(remarks_text.clone());
                        }
                        open_child = None;
                    }
                    continue;
                }
                match e.name().as_ref() {
                    b"detail" => in_detail = false,
                    b"event" => {
                        return commit(
                            header, point, contact, group, status, track, chat, remarks,
                            raw_detail,
                        );
                    }
                    _ => {}
                }
            }

            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| CotError::ParseFailed(e.to_string()))?;
                if capture_depth > 0 {
                    raw_detail.push_str(&xml_escape(&text));
                } else if let Some((OpenChild::Remarks, _)) = open_child {
                    remarks_text.push_str(&text);
                }
            }

            // Declarations, comments, processing instructions, CDATA.
            _ => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn commit(
    header: Option<EventHeader>,
    point: Option<CotPoint>,
    contact: Option<ContactDetail>,
    group: Option<GroupDetail>,
    status: Option<StatusDetail>,
    track: Option<TrackDetail>,
    mut chat: Option<ChatDetail>,
    remarks: Option<String>,
    raw_detail: String,
) -> Result<CotEvent, CotError> {
    let header = header.ok_or_else(|| CotError::ParseFailed("missing <event>".into()))?;
    let uid = header
        .uid
        .ok_or_else(|| CotError::ParseFailed("event has no uid".into()))?;
    let event_type = header
        .event_type
        .ok_or_else(|| CotError::ParseFailed("event has no type".into()))?;
    let point = point.ok_or_else(|| CotError::ParseFailed("event has no point".into()))?;

    if let Some(chat) = chat.as_mut() {
        if chat.message.is_empty() {
            if let Some(remarks) = remarks.as_deref() {
                chat.message = remarks.to_string();
            }
        }
    }

    Ok(CotEvent {
        uid,
        event_type,
        how: header.how.unwrap_or_else(|| "h-e".to_string()),
        time: parse_timestamp(header.time.as_deref()),
        start: parse_timestamp(header.start.as_deref()),
        stale: parse_timestamp(header.stale.as_deref()),
        point,
        contact,
        group,
        status,
        track,
        chat,
        remarks,
        raw_detail,
    })
}

fn parse_header(e: &BytesStart) -> Result<EventHeader, CotError> {
    Ok(EventHeader {
        uid: attr(e, b"uid")?,
        event_type: attr(e, b"type")?,
        how: attr(e, b"how")?,
        time: attr(e, b"time")?,
        start: attr(e, b"start")?,
        stale: attr(e, b"stale")?,
    })
}

fn parse_point(e: &BytesStart) -> Result<CotPoint, CotError> {
    Ok(CotPoint {
        lat: float_attr(e, b"lat", 0.0)?,
        lon: float_attr(e, b"lon", 0.0)?,
        hae: float_attr(e, b"hae", UNKNOWN_VALUE)?,
        ce: float_attr(e, b"ce", UNKNOWN_VALUE)?,
        le: float_attr(e, b"le", UNKNOWN_VALUE)?,
    })
}

fn parse_chat(e: &BytesStart) -> Result<ChatDetail, CotError> {
    Ok(ChatDetail {
        message: String::new(),
        sender_callsign: attr(e, b"senderCallsign")?,
        chatroom: attr(e, b"chatroom")?.unwrap_or_else(|| ALL_CHAT_ROOMS.to_string()),
    })
}

#[allow(clippy::too_many_arguments)]
fn harvest_detail_child(
    name: &[u8],
    e: &BytesStart,
    contact: &mut Option<ContactDetail>,
    group: &mut Option<GroupDetail>,
    status: &mut Option<StatusDetail>,
    track: &mut Option<TrackDetail>,
    chat: &mut Option<ChatDetail>,
    remarks: &mut Option<String>,
) -> Result<(), CotError> {
    match name {
        b"contact" => {
            *contact = Some(ContactDetail {
                callsign: attr(e, b"callsign")?.unwrap_or_default(),
                endpoint: attr(e, b"endpoint")?,
                phone: attr(e, b"phone")?,
            });
        }
        b"__group" => {
            let default = GroupDetail::default();
            *group = Some(GroupDetail {
                name: attr(e, b"name")?.unwrap_or(default.name),
                role: attr(e, b"role")?.unwrap_or(default.role),
            });
        }
        b"status" => {
            *status = Some(StatusDetail {
                battery: attr(e, b"battery")?
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            });
        }
        b"track" => {
            *track = Some(TrackDetail {
                speed: float_attr(e, b"speed", 0.0)?,
                course: float_attr(e, b"course", 0.0)?,
            });
        }
        b"__chat" => *chat = Some(parse_chat(e)?),
        b"remarks" => *remarks = Some(String::new()),
        // chatgrp / link / uid / __serverdestination carry threading glue we
        // regenerate on serialization.
        _ => {}
    }
    Ok(())
}

fn attr(e: &BytesStart, name: &[u8]) -> Result<Option<String>, CotError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CotError::ParseFailed(e.to_string()))?;
        if attr.key.as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|e| CotError::ParseFailed(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn float_attr(e: &BytesStart, name: &[u8], default: f64) -> Result<f64, CotError> {
    Ok(attr(e, name)?
        .and_then(|s| s.parse().ok())
        .unwrap_or(default))
}

fn append_open(buf: &mut String, e: &BytesStart, self_closing: bool) -> Result<(), CotError> {
    let name = e.name();
    let name = std::str::from_utf8(name.as_ref())
        .map_err(|e| CotError::ParseFailed(e.to_string()))?
        .to_string();
    buf.push('<');
    buf.push_str(&name);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CotError::ParseFailed(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| CotError::ParseFailed(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| CotError::ParseFailed(e.to_string()))?;
        let _ = write!(buf, " {}=\"{}\"", key, xml_escape(&value));
    }
    buf.push_str(if self_closing { "/>" } else { ">" });
    Ok(())
}
