//! # MeshTAK Gateway
//!
//! The coordinator that ties the TAK server, the bridge and the radio
//! together. A single [`Core`] value owns every single-writer structure
//! (bridge directory, fountain receive table, pending-transfer table), so
//! there are no process-wide singletons; tests build isolated instances.

use meshtak_core::{CoreError, Datagram, RadioHandle, SharedNodeStore, BROADCAST_ADDR, FORWARDER_PORT, PLUGIN_PORT};
use meshtak_cot::{to_xml, CotEvent};
use meshtak_mesh::{Bridge, CotForwarder, ForwarderError, Route};
use meshtak_server::CotRouter;
use prost::Message;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Radio(#[from] CoreError),

    #[error(transparent)]
    Forwarder(#[from] ForwarderError),
}

/// The gateway core: owns the bridge and forwarder state, holds non-owning
/// handles to the radio driver and the server's router.
pub struct Core {
    bridge: Bridge,
    forwarder: CotForwarder,
    radio: RadioHandle,
    router: Arc<CotRouter>,
}

impl Core {
    pub fn new(radio: RadioHandle, router: Arc<CotRouter>) -> Self {
        Self {
            bridge: Bridge::new(),
            forwarder: CotForwarder::new(radio.clone()),
            radio,
            router,
        }
    }

    pub fn with_node_store(radio: RadioHandle, router: Arc<CotRouter>, store: SharedNodeStore) -> Self {
        Self {
            bridge: Bridge::with_node_store(store),
            forwarder: CotForwarder::new(radio.clone()),
            radio,
            router,
        }
    }

    /// Coordinator loop: client events from the server on one side, radio
    /// datagrams from the driver on the other.
    pub async fn run(
        mut self,
        mut uplink: mpsc::Receiver<CotEvent>,
        mut radio_rx: mpsc::Receiver<Datagram>,
    ) {
        loop {
            tokio::select! {
                maybe = uplink.recv() => match maybe {
                    Some(ev) => {
                        if let Err(e) = self.handle_local_event(ev).await {
                            warn!("failed to bridge local event: {}", e);
                        }
                    }
                    None => break,
                },
                maybe = radio_rx.recv() => match maybe {
                    Some(dgram) => self.handle_radio_packet(dgram).await,
                    None => break,
                },
            }
        }
        debug!("gateway core stopped");
    }

    /// Bridge one local CoT event onto the radio.
    pub async fn handle_local_event(&mut self, ev: CotEvent) -> Result<(), GatewayError> {
        // The server consumes these already; nothing protocol-shaped may
        // reach the radio.
        if ev.is_protocol_control() || ev.is_ping() {
            trace!("not bridging protocol event {}", ev.event_type);
            return Ok(());
        }

        match Route::classify(&ev) {
            Route::Pli => {
                let pkt = self.bridge.to_pli(&ev);
                self.radio
                    .send(BROADCAST_ADDR, PLUGIN_PORT, pkt.encode_to_vec())
                    .await?;
            }
            Route::Chat => {
                let pkt = self.bridge.to_chat(&ev);
                self.radio
                    .send(BROADCAST_ADDR, PLUGIN_PORT, pkt.encode_to_vec())
                    .await?;
            }
            Route::Generic => {
                self.forwarder.send_event(&to_xml(&ev)).await?;
            }
        }
        Ok(())
    }

    /// Dispatch one inbound radio datagram by port; reconstructed events
    /// are broadcast to every connected TAK client.
    pub async fn handle_radio_packet(&mut self, dgram: Datagram) {
        match dgram.port {
            PLUGIN_PORT => match self.bridge.decode_plugin(&dgram.payload, dgram.from) {
                Ok(Some(ev)) => self.router.broadcast(to_xml(&ev)).await,
                Ok(None) => {}
                Err(e) => debug!(from = dgram.from, "dropping plugin packet: {}", e),
            },
            FORWARDER_PORT => match self.forwarder.handle_inbound(&dgram).await {
                Ok(Some(ev)) => self.router.broadcast(to_xml(&ev)).await,
                Ok(None) => {}
                Err(e) => debug!(from = dgram.from, "forwarder packet failed: {}", e),
            },
            other => trace!(port = other, "ignoring datagram on unhandled port"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtak_cot::{ChatDetail, ContactDetail, CotPoint, ALL_CHAT_ROOMS};
    use meshtak_fountain::TRANSPORT_COT;
    use meshtak_mesh::proto::{tak_packet::PayloadVariant, Contact, GeoChat, Pli, TakPacket};

    fn core() -> (Core, mpsc::Receiver<Datagram>, mpsc::Receiver<Arc<String>>) {
        let (radio_tx, radio_out) = mpsc::channel(64);
        let radio = RadioHandle::new(radio_tx, Some(0x11), 0);
        let (uplink_tx, _uplink_rx) = mpsc::channel(8);
        let router = Arc::new(CotRouter::new(uplink_tx));
        let client_rx = router.register(1);
        (Core::new(radio, router), radio_out, client_rx)
    }

    fn pli_event() -> CotEvent {
        let mut ev = CotEvent::new("U1", "a-f-G-U-C", CotPoint::new(37.5, -122.25, 10.0));
        ev.contact = Some(ContactDetail {
            callsign: "ALPHA".into(),
            endpoint: None,
            phone: None,
        });
        ev
    }

    #[tokio::test(start_paused = true)]
    async fn test_pli_routes_to_plugin_port() {
        let (mut core, mut radio_out, _client_rx) = core();
        core.handle_local_event(pli_event()).await.unwrap();

        let dgram = radio_out.recv().await.unwrap();
        assert_eq!(dgram.port, PLUGIN_PORT);
        assert_eq!(dgram.to, BROADCAST_ADDR);

        let pkt = TakPacket::decode(dgram.payload.as_slice()).unwrap();
        match pkt.payload_variant.unwrap() {
            PayloadVariant::Pli(pli) => assert_eq!(pli.latitude_i, 375_000_000),
            other => panic!("expected PLI, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_routes_to_plugin_port() {
        let (mut core, mut radio_out, _client_rx) = core();
        let mut ev = CotEvent::new(
            "GeoChat.ANDROID-abc.All Chat Rooms.MID1",
            "b-t-f",
            CotPoint::new(0.0, 0.0, 0.0),
        );
        ev.chat = Some(ChatDetail {
            message: "hi".into(),
            sender_callsign: Some("ALPHA".into()),
            chatroom: ALL_CHAT_ROOMS.into(),
        });
        core.handle_local_event(ev).await.unwrap();

        let dgram = radio_out.recv().await.unwrap();
        assert_eq!(dgram.port, PLUGIN_PORT);
        let pkt = TakPacket::decode(dgram.payload.as_slice()).unwrap();
        assert!(matches!(pkt.payload_variant, Some(PayloadVariant::Chat(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_event_routes_to_forwarder_port() {
        let (mut core, mut radio_out, _client_rx) = core();
        let ev = CotEvent::new("U5", "b-m-p-w", CotPoint::new(1.0, 2.0, 3.0));
        core.handle_local_event(ev).await.unwrap();

        let dgram = radio_out.recv().await.unwrap();
        assert_eq!(dgram.port, FORWARDER_PORT);
        assert_eq!(dgram.payload[0], TRANSPORT_COT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_events_never_reach_radio() {
        let (mut core, mut radio_out, _client_rx) = core();
        for (uid, event_type) in [
            ("q", "t-x-takp-q"),
            ("v", "t-x-takp-v"),
            ("p", "t-x-c-t"),
            ("ping", "a-f-G"),
        ] {
            let ev = CotEvent::new(uid, event_type, CotPoint::unknown());
            core.handle_local_event(ev).await.unwrap();
        }
        assert!(radio_out.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_plugin_packet_is_broadcast() {
        let (mut core, _radio_out, mut client_rx) = core();
        let pkt = TakPacket {
            is_compressed: false,
            contact: Some(Contact {
                callsign: "BRAVO".into(),
                device_callsign: "ANDROID-xyz".into(),
            }),
            group: None,
            status: None,
            payload_variant: Some(PayloadVariant::Pli(Pli {
                latitude_i: 375_000_000,
                longitude_i: -1_222_500_000,
                altitude: 0,
                speed: 0,
                course: 0,
            })),
        };
        let dgram = Datagram {
            to: BROADCAST_ADDR,
            from: 0x22,
            channel: 0,
            port: PLUGIN_PORT,
            payload: pkt.encode_to_vec(),
        };
        core.handle_radio_packet(dgram).await;

        let xml = client_rx.recv().await.unwrap();
        assert!(xml.contains(r#"uid="ANDROID-xyz""#));
        assert!(xml.contains(r#"callsign="BRAVO""#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_receipt_not_broadcast() {
        let (mut core, _radio_out, mut client_rx) = core();
        let pkt = TakPacket {
            is_compressed: false,
            contact: Some(Contact {
                callsign: "BRAVO".into(),
                device_callsign: "ANDROID-xyz|MID1".into(),
            }),
            group: None,
            status: None,
            payload_variant: Some(PayloadVariant::Chat(GeoChat {
                message: "ACK:R:MID1".into(),
                to: Some(ALL_CHAT_ROOMS.into()),
                to_callsign: None,
            })),
        };
        let dgram = Datagram {
            to: BROADCAST_ADDR,
            from: 0x22,
            channel: 0,
            port: PLUGIN_PORT,
            payload: pkt.encode_to_vec(),
        };
        core.handle_radio_packet(dgram).await;
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_direct_forwarder_payload_is_broadcast() {
        let (mut core, _radio_out, mut client_rx) = core();

        // Raw (uncompressed) transport payload exercises the UTF-8 fallback.
        let xml = to_xml(&pli_event());
        let mut payload = vec![TRANSPORT_COT];
        payload.extend_from_slice(xml.as_bytes());
        let dgram = Datagram {
            to: BROADCAST_ADDR,
            from: 0x22,
            channel: 0,
            port: FORWARDER_PORT,
            payload,
        };
        core.handle_radio_packet(dgram).await;

        let broadcast = client_rx.recv().await.unwrap();
        assert!(broadcast.contains(r#"uid="U1""#));
    }
}
