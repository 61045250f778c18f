//! CoT ↔ compact-binary bridge.
//!
//! Classifies outgoing events onto a transport, translates recognized
//! subtypes (PLI, GeoChat) to and from the plugin-port packet, and owns the
//! process-wide callsign → device-uid directory used to resolve
//! direct-message recipients.

use crate::proto::{tak_packet::PayloadVariant, Contact, GeoChat, Group, MemberRole, Pli, Status, TakPacket, Team};
use meshtak_core::SharedNodeStore;
use meshtak_cot::{
    parse_geochat_uid, ChatDetail, ContactDetail, CotEvent, CotPoint, GroupDetail, StatusDetail,
    TrackDetail, ALL_CHAT_ROOMS, UNKNOWN_VALUE,
};
use prost::Message;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, trace};

const UNKNOWN_CALLSIGN: &str = "Unknown";

/// Leading bytes of a duplicate-compressed plugin payload
/// (`is_compressed = true`); such copies are silently ignored.
const COMPRESSED_COPY_PREFIX: [u8; 2] = [0x08, 0x01];

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("decode failed: {0}")]
    DecodeFailed(#[from] prost::DecodeError),
}

/// Transport chosen for an outgoing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Compact-binary PLI on the plugin port.
    Pli,
    /// Compact-binary GeoChat on the plugin port.
    Chat,
    /// Compressed XML on the forwarder port, fountain-coded when large.
    Generic,
}

impl Route {
    pub fn classify(ev: &CotEvent) -> Self {
        if ev.is_pli() {
            Route::Pli
        } else if ev.is_chat() {
            Route::Chat
        } else {
            Route::Generic
        }
    }
}

pub struct Bridge {
    /// callsign → device uid, last write wins.
    directory: HashMap<String, String>,
    node_store: Option<SharedNodeStore>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            directory: HashMap::new(),
            node_store: None,
        }
    }

    pub fn with_node_store(node_store: SharedNodeStore) -> Self {
        Self {
            directory: HashMap::new(),
            node_store: Some(node_store),
        }
    }

    pub fn resolve_callsign(&self, callsign: &str) -> Option<&str> {
        self.directory.get(callsign).map(String::as_str)
    }

    fn register_callsign(&mut self, callsign: &str, device_uid: &str) {
        if callsign.is_empty() || callsign == UNKNOWN_CALLSIGN || device_uid.is_empty() {
            return;
        }
        trace!(callsign, device_uid, "directory update");
        self.directory
            .insert(callsign.to_string(), device_uid.to_string());
    }

    /// Translate a friendly-unit position report to the compact record.
    pub fn to_pli(&mut self, ev: &CotEvent) -> TakPacket {
        let callsign = ev
            .contact
            .as_ref()
            .map(|c| c.callsign.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| UNKNOWN_CALLSIGN.to_string());
        self.register_callsign(&callsign, &ev.uid);

        let track = ev.track.unwrap_or_default();
        TakPacket {
            is_compressed: false,
            contact: Some(Contact {
                callsign,
                device_callsign: ev.uid.clone(),
            }),
            group: ev.group.as_ref().map(|g| Group {
                role: role_from_name(&g.role) as i32,
                team: team_from_name(&g.name) as i32,
            }),
            status: ev.status.map(|s| Status { battery: s.battery }),
            payload_variant: Some(PayloadVariant::Pli(Pli {
                latitude_i: (ev.point.lat * 1e7).round() as i32,
                longitude_i: (ev.point.lon * 1e7).round() as i32,
                altitude: encode_altitude(ev.point.hae),
                speed: track.speed.max(0.0).round() as u32,
                course: track.course.max(0.0).round() as u32,
            })),
        }
    }

    /// Translate a GeoChat event to the compact record.
    ///
    /// The message id has no field of its own on the wire, so it rides in
    /// the device-callsign as `"<senderUid>|<messageId>"`; Android peers
    /// thread replies off that.
    pub fn to_chat(&mut self, ev: &CotEvent) -> TakPacket {
        let chat = ev.chat.clone().unwrap_or_else(|| ChatDetail {
            message: ev.remarks.clone().unwrap_or_default(),
            sender_callsign: None,
            chatroom: ALL_CHAT_ROOMS.to_string(),
        });

        let (sender_uid, message_id) = match parse_geochat_uid(&ev.uid) {
            Some(id) => (id.sender_uid, id.message_id),
            None => (ev.uid.clone(), ev.uid.clone()),
        };
        let callsign = chat
            .sender_callsign
            .clone()
            .or_else(|| ev.contact.as_ref().map(|c| c.callsign.clone()))
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| UNKNOWN_CALLSIGN.to_string());
        self.register_callsign(&callsign, &sender_uid);

        let (to, to_callsign) = if chat.chatroom == ALL_CHAT_ROOMS {
            (ALL_CHAT_ROOMS.to_string(), ALL_CHAT_ROOMS.to_string())
        } else {
            match self.directory.get(&chat.chatroom) {
                Some(uid) => (uid.clone(), chat.chatroom.clone()),
                None => {
                    debug!(
                        recipient = %chat.chatroom,
                        "recipient not in directory, sending callsign as uid"
                    );
                    (chat.chatroom.clone(), chat.chatroom.clone())
                }
            }
        };

        TakPacket {
            is_compressed: false,
            contact: Some(Contact {
                callsign,
                device_callsign: format!("{}|{}", sender_uid, message_id),
            }),
            group: None,
            status: None,
            payload_variant: Some(PayloadVariant::Chat(GeoChat {
                message: chat.message,
                to: Some(to),
                to_callsign: Some(to_callsign),
            })),
        }
    }

    /// Decode a plugin-port payload back into a CoT event.
    ///
    /// Returns `Ok(None)` for payloads consumed internally: duplicate
    /// compressed copies and read receipts.
    pub fn decode_plugin(
        &mut self,
        payload: &[u8],
        from_node: u32,
    ) -> Result<Option<CotEvent>, BridgeError> {
        if payload.starts_with(&COMPRESSED_COPY_PREFIX) {
            trace!(from_node, "ignoring duplicate compressed copy");
            return Ok(None);
        }

        let pkt = TakPacket::decode(payload)?;
        match pkt.payload_variant.clone() {
            Some(PayloadVariant::Pli(pli)) => Ok(Some(self.pli_event(&pkt, &pli, from_node))),
            Some(PayloadVariant::Chat(chat)) => Ok(self.chat_event(&pkt, chat, from_node)),
            None => {
                debug!(from_node, "packet without payload variant");
                Ok(None)
            }
        }
    }

    fn pli_event(&mut self, pkt: &TakPacket, pli: &Pli, from_node: u32) -> CotEvent {
        let contact = pkt.contact.clone().unwrap_or_default();
        let device_uid = if contact.device_callsign.is_empty() {
            format!("MESHTAK-{}", from_node)
        } else {
            contact.device_callsign
        };
        let callsign = self.incoming_callsign(contact.callsign, from_node);
        self.register_callsign(&callsign, &device_uid);

        let point = CotPoint {
            lat: pli.latitude_i as f64 / 1e7,
            lon: pli.longitude_i as f64 / 1e7,
            // Peer-compatible: 0 stays 0 rather than mapping back to the
            // unknown sentinel.
            hae: pli.altitude as f64,
            ce: UNKNOWN_VALUE,
            le: UNKNOWN_VALUE,
        };
        let mut ev = CotEvent::new(device_uid, "a-f-G-U-C", point);
        ev.contact = Some(ContactDetail {
            callsign,
            endpoint: None,
            phone: None,
        });
        ev.group = pkt.group.as_ref().map(|g| GroupDetail {
            name: team_name(g.team()).to_string(),
            role: role_name(g.role()).to_string(),
        });
        ev.status = pkt.status.as_ref().map(|s| StatusDetail { battery: s.battery });
        ev.track = Some(TrackDetail {
            speed: pli.speed as f64,
            course: pli.course as f64,
        });
        ev
    }

    fn chat_event(&mut self, pkt: &TakPacket, chat: GeoChat, from_node: u32) -> Option<CotEvent> {
        if let Some(id) = chat.message.strip_prefix("ACK:D:") {
            info!(message_id = id, from_node, "delivery receipt");
            return None;
        }
        if let Some(id) = chat.message.strip_prefix("ACK:R:") {
            info!(message_id = id, from_node, "read receipt");
            return None;
        }

        let contact = pkt.contact.clone().unwrap_or_default();
        let (device_uid, message_id) = match contact.device_callsign.split_once('|') {
            Some((device, id)) => (device.to_string(), id.to_string()),
            None if !contact.device_callsign.is_empty() => (
                contact.device_callsign.clone(),
                uuid::Uuid::new_v4().to_string(),
            ),
            None => (
                format!("MESHTAK-{}", from_node),
                uuid::Uuid::new_v4().to_string(),
            ),
        };
        let callsign = self.incoming_callsign(contact.callsign, from_node);
        self.register_callsign(&callsign, &device_uid);

        let to = chat.to.unwrap_or_else(|| ALL_CHAT_ROOMS.to_string());
        let chatroom = if to == ALL_CHAT_ROOMS {
            to
        } else {
            chat.to_callsign.filter(|c| !c.is_empty()).unwrap_or(to)
        };

        let uid = format!("GeoChat.{}.{}.{}", device_uid, chatroom, message_id);
        let mut ev = CotEvent::new(uid, "b-t-f", CotPoint::new(0.0, 0.0, 0.0));
        ev.how = "h-e".to_string();
        ev.stale = ev.time + chrono::Duration::minutes(10);
        ev.remarks = Some(chat.message.clone());
        ev.chat = Some(ChatDetail {
            message: chat.message,
            sender_callsign: Some(callsign),
            chatroom,
        });
        Some(ev)
    }

    fn incoming_callsign(&self, callsign: String, from_node: u32) -> String {
        if !callsign.is_empty() {
            return callsign;
        }
        self.node_store
            .as_ref()
            .and_then(|store| store.long_name(from_node))
            .unwrap_or_else(|| UNKNOWN_CALLSIGN.to_string())
    }
}

fn encode_altitude(hae: f64) -> i32 {
    if !hae.is_finite() || hae == UNKNOWN_VALUE {
        0
    } else {
        hae.round() as i32
    }
}

fn team_from_name(name: &str) -> Team {
    match name {
        "White" => Team::White,
        "Yellow" => Team::Yellow,
        "Orange" => Team::Orange,
        "Magenta" => Team::Magenta,
        "Red" => Team::Red,
        "Maroon" => Team::Maroon,
        "Purple" => Team::Purple,
        "Dark Blue" => Team::DarkBlue,
        "Blue" => Team::Blue,
        "Cyan" => Team::Cyan,
        "Teal" => Team::Teal,
        "Green" => Team::Green,
        "Dark Green" => Team::DarkGreen,
        "Brown" => Team::Brown,
        _ => Team::Cyan,
    }
}

fn team_name(team: Team) -> &'static str {
    match team {
        Team::White => "White",
        Team::Yellow => "Yellow",
        Team::Orange => "Orange",
        Team::Magenta => "Magenta",
        Team::Red => "Red",
        Team::Maroon => "Maroon",
        Team::Purple => "Purple",
        Team::DarkBlue => "Dark Blue",
        Team::Blue => "Blue",
        Team::Teal => "Teal",
        Team::Green => "Green",
        Team::DarkGreen => "Dark Green",
        Team::Brown => "Brown",
        Team::Cyan | Team::UnspecifedColor => "Cyan",
    }
}

fn role_from_name(name: &str) -> MemberRole {
    match name {
        "Team Member" => MemberRole::TeamMember,
        "Team Lead" => MemberRole::TeamLead,
        "HQ" => MemberRole::Hq,
        "Sniper" => MemberRole::Sniper,
        "Medic" => MemberRole::Medic,
        "Forward Observer" => MemberRole::ForwardObserver,
        "RTO" => MemberRole::Rto,
        "K9" => MemberRole::K9,
        _ => MemberRole::TeamMember,
    }
}

fn role_name(role: MemberRole) -> &'static str {
    match role {
        MemberRole::TeamLead => "Team Lead",
        MemberRole::Hq => "HQ",
        MemberRole::Sniper => "Sniper",
        MemberRole::Medic => "Medic",
        MemberRole::ForwardObserver => "Forward Observer",
        MemberRole::Rto => "RTO",
        MemberRole::K9 => "K9",
        MemberRole::TeamMember | MemberRole::Unspecifed => "Team Member",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtak_cot::parse_event;
    use prost::Message;

    const PLI_XML: &str = r#"<event version="2.0" uid="U1" type="a-f-G-U-C" time="2025-01-01T00:00:00Z" start="2025-01-01T00:00:00Z" stale="2025-01-01T00:10:00Z" how="m-g"><point lat="37.5" lon="-122.25" hae="9999999" ce="9999999" le="9999999"/><detail><contact callsign="ALPHA"/><__group name="Cyan" role="Team Member"/></detail></event>"#;

    #[test]
    fn test_pli_translation() {
        let ev = parse_event(PLI_XML).unwrap();
        let mut bridge = Bridge::new();
        let pkt = bridge.to_pli(&ev);

        let contact = pkt.contact.as_ref().unwrap();
        assert_eq!(contact.callsign, "ALPHA");
        assert_eq!(contact.device_callsign, "U1");

        let group = pkt.group.unwrap();
        assert_eq!(group.team(), Team::Cyan);
        assert_eq!(group.role(), MemberRole::TeamMember);

        match pkt.payload_variant.unwrap() {
            PayloadVariant::Pli(pli) => {
                assert_eq!(pli.latitude_i, 375_000_000);
                assert_eq!(pli.longitude_i, -1_222_500_000);
                assert_eq!(pli.altitude, 0);
            }
            other => panic!("expected PLI, got {:?}", other),
        }

        // Side effect: the sender is now resolvable.
        assert_eq!(bridge.resolve_callsign("ALPHA"), Some("U1"));
    }

    #[test]
    fn test_altitude_boundaries() {
        assert_eq!(encode_altitude(UNKNOWN_VALUE), 0);
        assert_eq!(encode_altitude(f64::NAN), 0);
        assert_eq!(encode_altitude(f64::INFINITY), 0);
        assert_eq!(encode_altitude(f64::NEG_INFINITY), 0);
        assert_eq!(encode_altitude(123.6), 124);
        assert_eq!(encode_altitude(-10.2), -10);
    }

    #[test]
    fn test_chat_message_id_smuggle() {
        let mut ev = CotEvent::new(
            "GeoChat.ANDROID-abc.All Chat Rooms.MID42",
            "b-t-f",
            CotPoint::new(0.0, 0.0, 0.0),
        );
        ev.chat = Some(ChatDetail {
            message: "hello".into(),
            sender_callsign: Some("ALPHA".into()),
            chatroom: ALL_CHAT_ROOMS.into(),
        });

        let pkt = Bridge::new().to_chat(&ev);
        assert_eq!(
            pkt.contact.as_ref().unwrap().device_callsign,
            "ANDROID-abc|MID42"
        );
        match pkt.payload_variant.unwrap() {
            PayloadVariant::Chat(chat) => {
                assert_eq!(chat.to.as_deref(), Some(ALL_CHAT_ROOMS));
                assert_eq!(chat.message, "hello");
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn test_direct_message_directory_resolution() {
        let mut bridge = Bridge::new();

        // Prior PLI from BRAVO populates the directory.
        let mut pli = CotEvent::new("ANDROID-xyz", "a-f-G-U-C", CotPoint::new(1.0, 2.0, 0.0));
        pli.contact = Some(ContactDetail {
            callsign: "BRAVO".into(),
            endpoint: None,
            phone: None,
        });
        bridge.to_pli(&pli);

        let mut ev = CotEvent::new(
            "GeoChat.ANDROID-abc.BRAVO.MID7",
            "b-t-f",
            CotPoint::new(0.0, 0.0, 0.0),
        );
        ev.chat = Some(ChatDetail {
            message: "direct".into(),
            sender_callsign: Some("ALPHA".into()),
            chatroom: "BRAVO".into(),
        });

        let pkt = bridge.to_chat(&ev);
        match pkt.payload_variant.unwrap() {
            PayloadVariant::Chat(chat) => {
                assert_eq!(chat.to.as_deref(), Some("ANDROID-xyz"));
                assert_eq!(chat.to_callsign.as_deref(), Some("BRAVO"));
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn test_direct_message_unknown_recipient_degrades() {
        let mut ev = CotEvent::new(
            "GeoChat.ANDROID-abc.CHARLIE.MID8",
            "b-t-f",
            CotPoint::new(0.0, 0.0, 0.0),
        );
        ev.chat = Some(ChatDetail {
            message: "direct".into(),
            sender_callsign: None,
            chatroom: "CHARLIE".into(),
        });

        let pkt = Bridge::new().to_chat(&ev);
        match pkt.payload_variant.unwrap() {
            PayloadVariant::Chat(chat) => {
                assert_eq!(chat.to.as_deref(), Some("CHARLIE"));
                assert_eq!(chat.to_callsign.as_deref(), Some("CHARLIE"));
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[test]
    fn test_chat_synthesized_from_remarks() {
        let mut ev = CotEvent::new("U9", "b-t-f", CotPoint::new(0.0, 0.0, 0.0));
        ev.remarks = Some("from remarks".into());

        let pkt = Bridge::new().to_chat(&ev);
        match pkt.payload_variant.unwrap() {
            PayloadVariant::Chat(chat) => {
                assert_eq!(chat.message, "from remarks");
                assert_eq!(chat.to.as_deref(), Some(ALL_CHAT_ROOMS));
            }
            other => panic!("expected chat, got {:?}", other),
        }
        // Contact is required on the wire even without one upstream.
        assert_eq!(pkt.contact.as_ref().unwrap().callsign, "Unknown");
    }

    #[test]
    fn test_plugin_roundtrip_pli() {
        let ev = parse_event(PLI_XML).unwrap();
        let mut sender = Bridge::new();
        let wire = sender.to_pli(&ev).encode_to_vec();

        let mut receiver = Bridge::new();
        let back = receiver.decode_plugin(&wire, 7).unwrap().unwrap();

        assert_eq!(back.uid, "U1");
        assert_eq!(back.event_type, "a-f-G-U-C");
        assert!((back.point.lat - 37.5).abs() < 1e-7);
        assert!((back.point.lon + 122.25).abs() < 1e-7);
        // Unknown altitude came across as 0 and stays 0.
        assert_eq!(back.point.hae, 0.0);
        assert_eq!(back.contact.as_ref().unwrap().callsign, "ALPHA");
        let group = back.group.as_ref().unwrap();
        assert_eq!(group.name, "Cyan");
        assert_eq!(group.role, "Team Member");
        assert_eq!(receiver.resolve_callsign("ALPHA"), Some("U1"));
    }

    #[test]
    fn test_plugin_roundtrip_chat() {
        let pkt = TakPacket {
            is_compressed: false,
            contact: Some(Contact {
                callsign: "ALPHA".into(),
                device_callsign: "ANDROID-abc|MID42".into(),
            }),
            group: None,
            status: None,
            payload_variant: Some(PayloadVariant::Chat(GeoChat {
                message: "hello mesh".into(),
                to: Some(ALL_CHAT_ROOMS.into()),
                to_callsign: Some(ALL_CHAT_ROOMS.into()),
            })),
        };

        let mut bridge = Bridge::new();
        let ev = bridge
            .decode_plugin(&pkt.encode_to_vec(), 7)
            .unwrap()
            .unwrap();
        assert_eq!(ev.uid, "GeoChat.ANDROID-abc.All Chat Rooms.MID42");
        assert_eq!(ev.event_type, "b-t-f");
        let chat = ev.chat.as_ref().unwrap();
        assert_eq!(chat.message, "hello mesh");
        assert_eq!(chat.chatroom, ALL_CHAT_ROOMS);
        assert_eq!(chat.sender_callsign.as_deref(), Some("ALPHA"));

        // And back out: the smuggled id survives.
        let out = bridge.to_chat(&ev);
        assert_eq!(
            out.contact.as_ref().unwrap().device_callsign,
            "ANDROID-abc|MID42"
        );
    }

    #[test]
    fn test_receipts_intercepted() {
        for body in ["ACK:D:MID42", "ACK:R:MID42"] {
            let pkt = TakPacket {
                is_compressed: false,
                contact: Some(Contact {
                    callsign: "ALPHA".into(),
                    device_callsign: "ANDROID-abc|MIDx".into(),
                }),
                group: None,
                status: None,
                payload_variant: Some(PayloadVariant::Chat(GeoChat {
                    message: body.into(),
                    to: Some(ALL_CHAT_ROOMS.into()),
                    to_callsign: None,
                })),
            };
            let out = Bridge::new().decode_plugin(&pkt.encode_to_vec(), 7).unwrap();
            assert!(out.is_none(), "receipt {} must not re-broadcast", body);
        }
    }

    #[test]
    fn test_duplicate_compressed_copy_ignored() {
        let out = Bridge::new().decode_plugin(&[0x08, 0x01, 0xAA, 0xBB], 7).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_garbage_plugin_payload_is_error() {
        assert!(Bridge::new().decode_plugin(&[0xFF, 0xFF, 0xFF], 7).is_err());
    }

    #[test]
    fn test_missing_contact_defaults_to_unknown() {
        let pkt = TakPacket {
            is_compressed: false,
            contact: None,
            group: None,
            status: None,
            payload_variant: Some(PayloadVariant::Pli(Pli {
                latitude_i: 10_000_000,
                longitude_i: 20_000_000,
                altitude: 0,
                speed: 0,
                course: 0,
            })),
        };
        let ev = Bridge::new()
            .decode_plugin(&pkt.encode_to_vec(), 99)
            .unwrap()
            .unwrap();
        assert_eq!(ev.contact.as_ref().unwrap().callsign, "Unknown");
        assert_eq!(ev.uid, "MESHTAK-99");
    }

    #[test]
    fn test_team_and_role_names_invert() {
        for team in [
            Team::White,
            Team::Yellow,
            Team::Orange,
            Team::Magenta,
            Team::Red,
            Team::Maroon,
            Team::Purple,
            Team::DarkBlue,
            Team::Blue,
            Team::Cyan,
            Team::Teal,
            Team::Green,
            Team::DarkGreen,
            Team::Brown,
        ] {
            assert_eq!(team_from_name(team_name(team)), team);
        }
        for role in [
            MemberRole::TeamMember,
            MemberRole::TeamLead,
            MemberRole::Hq,
            MemberRole::Sniper,
            MemberRole::Medic,
            MemberRole::ForwardObserver,
            MemberRole::Rto,
            MemberRole::K9,
        ] {
            assert_eq!(role_from_name(role_name(role)), role);
        }
        // Unknown names fall back to the defaults.
        assert_eq!(team_from_name("Chartreuse"), Team::Cyan);
        assert_eq!(role_from_name("Quartermaster"), MemberRole::TeamMember);
    }
}
