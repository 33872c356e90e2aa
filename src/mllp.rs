//! MLLP framer and TCP listener (spec §4.1).
//!
//! A message begins at `0x0B` (VT) and ends at the two-byte sequence
//! `0x1C 0x0D` (FS CR); bytes outside a frame are discarded. The framer is
//! stateful per connection and tolerates arbitrary fragmentation across
//! `read()` calls.

use crate::queue::{IncomingHl7v2Message, MessageStatus, QueueStore};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const VT: u8 = 0x0B;
const FS: u8 = 0x1C;
const CR: u8 = 0x0D;

/// Stateful per-connection frame extractor.
#[derive(Default)]
pub struct MllpFramer {
    buffer: Vec<u8>,
    in_frame: bool,
    pending_fs: bool,
}

impl MllpFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds in newly-read bytes and returns every complete message frame
    /// they completed. Never emits a partial message.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for &b in bytes {
            if self.pending_fs {
                self.pending_fs = false;
                if b == CR {
                    out.push(std::mem::take(&mut self.buffer));
                    self.in_frame = false;
                    continue;
                }
                // a lone FS inside a frame is not a terminator; keep it as data
                self.buffer.push(FS);
            }

            if !self.in_frame {
                if b == VT {
                    self.in_frame = true;
                    self.buffer.clear();
                }
                continue;
            }

            if b == FS {
                self.pending_fs = true;
                continue;
            }

            self.buffer.push(b);
        }
        out
    }
}

fn encode_frame(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 3);
    out.push(VT);
    out.extend_from_slice(message.as_bytes());
    out.push(FS);
    out.push(CR);
    out
}

/// MSH fields echoed back into the ACK, extracted from the raw wire text
/// rather than `hl7-parser` so that a malformed MSH still yields an ACK with
/// synthetic placeholders (spec §4.1).
struct MshEcho {
    sending_app: String,
    sending_facility: String,
    receiving_app: String,
    receiving_facility: String,
    control_id: String,
}

/// `MSH-1` (the field separator) is implicit in the segment prefix `MSH|`,
/// so every later field is shifted one split index earlier than its HL7
/// field number; `field` is the HL7 field number (>= 2).
fn msh_field(line: &str, field: usize) -> &str {
    line.split('|').nth(field - 1).unwrap_or("")
}

fn parse_msh_echo(raw: &str) -> Option<MshEcho> {
    let line = raw.split(['\r', '\n']).find(|l| l.starts_with("MSH|"))?;
    let control_id = msh_field(line, 10);
    if control_id.is_empty() {
        return None;
    }
    Some(MshEcho {
        sending_app: msh_field(line, 3).to_string(),
        sending_facility: msh_field(line, 4).to_string(),
        receiving_app: msh_field(line, 5).to_string(),
        receiving_facility: msh_field(line, 6).to_string(),
        control_id: control_id.to_string(),
    })
}

/// Builds an MSH/MSA ACK. Application roles swap: the ACK's sender is the
/// original message's receiver and vice versa.
fn build_ack(echo: Option<&MshEcho>, ack_code: &str) -> String {
    let (send_app, send_fac, recv_app, recv_fac, control_id) = match echo {
        Some(e) => (
            e.receiving_app.clone(),
            e.receiving_facility.clone(),
            e.sending_app.clone(),
            e.sending_facility.clone(),
            e.control_id.clone(),
        ),
        None => (
            "UNKNOWN".to_string(),
            "UNKNOWN".to_string(),
            "UNKNOWN".to_string(),
            "UNKNOWN".to_string(),
            "UNKNOWN".to_string(),
        ),
    };

    format!(
        "MSH|^~\\&|{send_app}|{send_fac}|{recv_app}|{recv_fac}||ACK|{control_id}-ack|P|2.5\rMSA|{ack_code}|{control_id}\r"
    )
}

pub async fn run_listener(port: u16, store: Arc<dyn crate::fhir_store::FhirStore>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("MLLP listener bound on port {port}");

    loop {
        let (socket, peer) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            debug!("accepted MLLP connection from {peer}");
            if let Err(e) = handle_connection(socket, store).await {
                warn!("MLLP connection {peer} closed: {e}");
            }
        });
    }
}

async fn handle_connection(mut socket: TcpStream, store: Arc<dyn crate::fhir_store::FhirStore>) -> anyhow::Result<()> {
    let mut framer = MllpFramer::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for message_bytes in framer.feed(&buf[..n]) {
            let raw = String::from_utf8_lossy(&message_bytes).to_string();
            let ack = receive_message(&raw, store.as_ref()).await;
            socket.write_all(&encode_frame(&ack)).await?;
        }
    }
}

/// Persists one received message and returns the ACK text to frame and send
/// back (spec §4.1). Always returns *some* ACK, even on a parse failure.
async fn receive_message(raw: &str, store: &dyn crate::fhir_store::FhirStore) -> String {
    let echo = parse_msh_echo(raw);

    let Some(echo) = echo else {
        error!("failed to parse MSH from inbound message; sending AE with placeholder fields");
        return build_ack(None, "AE");
    };

    let message_type = crate::converter::message_type_key(
        &match hl7_parser::Message::parse_with_lenient_newlines(raw, true) {
            Ok(m) => m,
            Err(e) => {
                error!("failed to parse inbound message {}: {e}", echo.control_id);
                return build_ack(Some(&echo), "AE");
            }
        },
    )
    .unwrap_or_else(|_| "UNKNOWN".to_string());

    let id = format!("{}-{}", echo.control_id, chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let message = IncomingHl7v2Message {
        id,
        resource_type: "IncomingHl7v2Message".to_string(),
        version_id: None,
        status: MessageStatus::Received,
        raw_message: raw.to_string(),
        sending_application: echo.sending_app.clone(),
        sending_facility: echo.sending_facility.clone(),
        message_type,
        control_id: echo.control_id.clone(),
        received_at: chrono::Utc::now().to_rfc3339(),
        error_detail: None,
        unmapped_codes: Vec::new(),
        patient_ref: None,
    };

    let queue = QueueStore::new(store);
    match queue.insert_incoming(&message).await {
        Ok(_) => build_ack(Some(&echo), "AA"),
        Err(e) => {
            error!("failed to persist inbound message {}: {e}", echo.control_id);
            build_ack(Some(&echo), "AE")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_extracts_single_message_across_fragments() {
        let mut framer = MllpFramer::new();
        let mut out = framer.feed(&[VT, b'M', b'S']);
        assert!(out.is_empty());
        out = framer.feed(&[b'H', FS, CR]);
        assert_eq!(out, vec![b"MSH".to_vec()]);
    }

    #[test]
    fn framer_discards_bytes_outside_a_frame() {
        let mut framer = MllpFramer::new();
        let out = framer.feed(&[b'x', b'y', VT, b'O', b'K', FS, CR, b'z']);
        assert_eq!(out, vec![b"OK".to_vec()]);
    }

    #[test]
    fn framer_handles_two_messages_in_one_feed() {
        let mut framer = MllpFramer::new();
        let out = framer.feed(&[VT, b'A', FS, CR, VT, b'B', FS, CR]);
        assert_eq!(out, vec![b"A".to_vec(), b"B".to_vec()]);
    }

    #[tokio::test]
    async fn receive_message_acks_aa_on_success() {
        use crate::fhir_store::fake::InMemoryFhirStore;
        let store = InMemoryFhirStore::new();
        let raw = "MSH|^~\\&|LAB|HOSP|REC|RECFAC|20240102030405||ADT^A01|MSG1|P|2.5\rPID|1||MRN123^^^HOSP^MR";
        let ack = receive_message(raw, &store).await;
        assert!(ack.contains("MSA|AA|MSG1"));
    }

    #[tokio::test]
    async fn receive_message_acks_ae_on_missing_msh() {
        use crate::fhir_store::fake::InMemoryFhirStore;
        let store = InMemoryFhirStore::new();
        let ack = receive_message("PID|1||MRN123", &store).await;
        assert!(ack.contains("MSA|AE|UNKNOWN"));
    }
}
