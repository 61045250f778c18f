//! Generic-CoT transport on the forwarder port.
//!
//! Outbound events are zlib-compressed, prefixed with a transport-type byte
//! and either sent as a single datagram or fountain-encoded. Inbound
//! datagrams demultiplex into ACKs, coded blocks and direct payloads.

use meshtak_core::{CoreError, Datagram, RadioHandle, BROADCAST_ADDR, FORWARDER_PORT};
use meshtak_cot::{parse_event, CotEvent};
use meshtak_fountain::{
    compress, decompress, encode_transfer, generate_transfer_id, parse_frame, AckFrame, AckKind,
    CompletedTransfer, FountainError, FountainReceiver, Frame, PendingTransfer,
    MAX_DIRECT_PAYLOAD, TRANSPORT_COT,
};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Gap between fountain blocks, so the radio's queue is never flooded.
pub const INTER_PACKET_DELAY: Duration = Duration::from_millis(100);

/// Gap between the two Complete ACK copies.
pub const ACK_REPEAT_DELAY: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error(transparent)]
    Radio(#[from] CoreError),

    #[error(transparent)]
    Encoding(#[from] FountainError),
}

/// The forwarder-port pipeline with its send- and receive-side state.
pub struct CotForwarder {
    radio: RadioHandle,
    receiver: FountainReceiver,
    /// Transfers we have sent and not yet seen acknowledged. Receiver-side
    /// expiry is the authoritative timeout, so entries persist until acked.
    pending: HashMap<u32, PendingTransfer>,
}

impl CotForwarder {
    pub fn new(radio: RadioHandle) -> Self {
        Self {
            radio,
            receiver: FountainReceiver::default(),
            pending: HashMap::new(),
        }
    }

    /// Compress and transmit a CoT document to the mesh.
    pub async fn send_event(&mut self, xml: &str) -> Result<(), ForwarderError> {
        let compressed = match compress(xml.as_bytes()) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!("compression failed, sending raw bytes: {}", e);
                xml.as_bytes().to_vec()
            }
        };
        let mut payload = Vec::with_capacity(compressed.len() + 1);
        payload.push(TRANSPORT_COT);
        payload.extend_from_slice(&compressed);
        self.send_payload(payload).await
    }

    async fn send_payload(&mut self, payload: Vec<u8>) -> Result<(), ForwarderError> {
        if payload.len() <= MAX_DIRECT_PAYLOAD {
            self.radio
                .send(BROADCAST_ADDR, FORWARDER_PORT, payload)
                .await?;
            return Ok(());
        }
        self.send_transfer(generate_transfer_id(), &payload).await
    }

    async fn send_transfer(
        &mut self,
        transfer_id: u32,
        payload: &[u8],
    ) -> Result<(), ForwarderError> {
        let transfer = encode_transfer(transfer_id, payload)?;
        debug!(
            transfer_id = transfer.transfer_id,
            blocks = transfer.block_count,
            bytes = payload.len(),
            "starting fountain transfer"
        );
        self.pending.insert(transfer.transfer_id, transfer.pending());

        let count = transfer.frames.len();
        for (i, frame) in transfer.frames.iter().enumerate() {
            self.radio
                .send(BROADCAST_ADDR, FORWARDER_PORT, frame.to_vec())
                .await?;
            if i + 1 < count {
                tokio::time::sleep(INTER_PACKET_DELAY).await;
            }
        }
        Ok(())
    }

    /// Handle a forwarder-port datagram; returns the decoded event when one
    /// becomes available.
    pub async fn handle_inbound(
        &mut self,
        dgram: &Datagram,
    ) -> Result<Option<CotEvent>, ForwarderError> {
        match parse_frame(&dgram.payload) {
            Some(Frame::Ack(ack)) => {
                self.reconcile_ack(&ack);
                Ok(None)
            }
            Some(Frame::Data(frame)) => match self.receiver.ingest(&frame) {
                Some(done) => {
                    self.send_complete_acks(&done, dgram.from).await?;
                    Ok(self.parse_payload(&done.data))
                }
                None => Ok(None),
            },
            Some(Frame::Malformed) => {
                debug!(from = dgram.from, "dropping malformed fountain frame");
                Ok(None)
            }
            None => Ok(self.parse_payload(&dgram.payload)),
        }
    }

    fn reconcile_ack(&mut self, ack: &AckFrame) {
        match ack.kind {
            AckKind::Complete => match self.pending.get(&ack.transfer_id) {
                Some(pending) if pending.hash_prefix == ack.hash => {
                    info!(
                        transfer_id = ack.transfer_id,
                        received = ack.received,
                        "transfer acknowledged"
                    );
                    self.pending.remove(&ack.transfer_id);
                }
                Some(_) => warn!(
                    transfer_id = ack.transfer_id,
                    "complete ACK hash does not match sent data"
                ),
                None => debug!(transfer_id = ack.transfer_id, "ACK for unknown transfer"),
            },
            // Parsed but not acted on; there is no retransmission path yet.
            AckKind::NeedMore => debug!(
                transfer_id = ack.transfer_id,
                received = ack.received,
                needed = ack.needed,
                "peer requests more blocks"
            ),
        }
    }

    async fn send_complete_acks(
        &self,
        done: &CompletedTransfer,
        to: u32,
    ) -> Result<(), CoreError> {
        let ack =
            AckFrame::complete(done.transfer_id, done.received_blocks, done.hash_prefix).encode();
        self.radio.send(to, FORWARDER_PORT, ack.to_vec()).await?;
        tokio::time::sleep(ACK_REPEAT_DELAY).await;
        self.radio.send(to, FORWARDER_PORT, ack.to_vec()).await?;
        Ok(())
    }

    /// Strip the transport prefix, inflate and parse. Malformed payloads are
    /// dropped here, never escalated.
    fn parse_payload(&self, payload: &[u8]) -> Option<CotEvent> {
        let (&transport, rest) = payload.split_first()?;
        if transport != TRANSPORT_COT {
            debug!(transport, "unhandled transport type");
            return None;
        }
        let xml = match decompress(rest) {
            Ok(inflated) => inflated,
            Err(e) => {
                debug!("inflate failed, treating payload as raw text: {}", e);
                rest.to_vec()
            }
        };
        let xml = String::from_utf8_lossy(&xml);
        match parse_event(&xml) {
            Ok(ev) => Some(ev),
            Err(e) => {
                debug!("dropping unparseable CoT payload: {}", e);
                None
            }
        }
    }

    pub fn pending_transfers(&self) -> usize {
        self.pending.len()
    }
}
