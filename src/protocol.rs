//! Fixed binary formats for the control plane.
//!
//! Two families share this module: command/response records carried on the
//! CnC rings between clients and the driver, and control payloads carried in
//! network frames (setup, status, NAK). All fields are little-endian at fixed
//! offsets; formats are versioned through the CnC/log file versions and must
//! stay stable across client and driver releases.

use crate::{Error, Result};

// Client-to-driver command types (MPSC ring record types).
pub const CMD_ADD_PUBLICATION: u32 = 0x01;
pub const CMD_REMOVE_PUBLICATION: u32 = 0x02;
pub const CMD_ADD_SUBSCRIPTION: u32 = 0x03;
pub const CMD_REMOVE_SUBSCRIPTION: u32 = 0x04;
pub const CMD_CLIENT_KEEPALIVE: u32 = 0x05;
pub const CMD_CLIENT_CLOSE: u32 = 0x06;

// Driver-to-client response types (broadcast ring record types).
pub const RSP_PUBLICATION_READY: u32 = 0x81;
pub const RSP_SUBSCRIPTION_READY: u32 = 0x82;
pub const RSP_OPERATION_SUCCESS: u32 = 0x83;
pub const RSP_ERROR: u32 = 0x84;
pub const RSP_IMAGE_AVAILABLE: u32 = 0x85;
pub const RSP_IMAGE_UNAVAILABLE: u32 = 0x86;

// Driver error codes carried in RSP_ERROR.
pub const ERR_GENERIC: u32 = 1;
pub const ERR_INVALID_CHANNEL: u32 = 2;
pub const ERR_SLOTS_EXHAUSTED: u32 = 3;
pub const ERR_UNKNOWN_REGISTRATION: u32 = 4;

fn get_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let end = offset + 4;
    if end > buf.len() {
        return Err(Error::Corrupt("truncated control message"));
    }
    Ok(u32::from_le_bytes(
        buf[offset..end].try_into().expect("slice length"),
    ))
}

fn get_u64(buf: &[u8], offset: usize) -> Result<u64> {
    let end = offset + 8;
    if end > buf.len() {
        return Err(Error::Corrupt("truncated control message"));
    }
    Ok(u64::from_le_bytes(
        buf[offset..end].try_into().expect("slice length"),
    ))
}

fn get_string(buf: &[u8], len_offset: usize) -> Result<String> {
    let len = get_u32(buf, len_offset)? as usize;
    let start = len_offset + 4;
    let end = start + len;
    if end > buf.len() {
        return Err(Error::Corrupt("truncated control message"));
    }
    String::from_utf8(buf[start..end].to_vec())
        .map_err(|_| Error::Corrupt("control message string not utf-8"))
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// ADD_PUBLICATION / ADD_SUBSCRIPTION: register interest in a stream on a
/// channel. The same shape serves both commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddStreamCommand {
    pub correlation_id: u64,
    pub client_id: u64,
    pub stream_id: u32,
    pub channel: String,
}

impl AddStreamCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28 + self.channel.len());
        out.extend_from_slice(&self.correlation_id.to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.stream_id.to_le_bytes());
        put_string(&mut out, &self.channel);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            correlation_id: get_u64(buf, 0)?,
            client_id: get_u64(buf, 8)?,
            stream_id: get_u32(buf, 16)?,
            channel: get_string(buf, 20)?,
        })
    }
}

/// REMOVE_PUBLICATION / REMOVE_SUBSCRIPTION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveCommand {
    pub correlation_id: u64,
    pub client_id: u64,
    pub registration_id: u64,
}

impl RemoveCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&self.correlation_id.to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.registration_id.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            correlation_id: get_u64(buf, 0)?,
            client_id: get_u64(buf, 8)?,
            registration_id: get_u64(buf, 16)?,
        })
    }
}

/// CLIENT_KEEPALIVE / CLIENT_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCommand {
    pub client_id: u64,
}

impl ClientCommand {
    pub fn encode(&self) -> Vec<u8> {
        self.client_id.to_le_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            client_id: get_u64(buf, 0)?,
        })
    }
}

/// PUBLICATION_READY: the driver created (or found) the log buffer for a
/// publication and the client may map it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationReady {
    pub correlation_id: u64,
    pub client_id: u64,
    pub registration_id: u64,
    pub session_id: u32,
    pub stream_id: u32,
    pub log_file: String,
}

impl PublicationReady {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36 + self.log_file.len());
        out.extend_from_slice(&self.correlation_id.to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.registration_id.to_le_bytes());
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.stream_id.to_le_bytes());
        put_string(&mut out, &self.log_file);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            correlation_id: get_u64(buf, 0)?,
            client_id: get_u64(buf, 8)?,
            registration_id: get_u64(buf, 16)?,
            session_id: get_u32(buf, 24)?,
            stream_id: get_u32(buf, 28)?,
            log_file: get_string(buf, 32)?,
        })
    }
}

/// SUBSCRIPTION_READY / OPERATION_SUCCESS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationAck {
    pub correlation_id: u64,
    pub client_id: u64,
    pub registration_id: u64,
}

impl OperationAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&self.correlation_id.to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.registration_id.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            correlation_id: get_u64(buf, 0)?,
            client_id: get_u64(buf, 8)?,
            registration_id: get_u64(buf, 16)?,
        })
    }
}

/// ERROR: a command failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub correlation_id: u64,
    pub client_id: u64,
    pub code: u32,
    pub message: String,
}

impl ErrorResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.message.len());
        out.extend_from_slice(&self.correlation_id.to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.code.to_le_bytes());
        put_string(&mut out, &self.message);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            correlation_id: get_u64(buf, 0)?,
            client_id: get_u64(buf, 8)?,
            code: get_u32(buf, 16)?,
            message: get_string(buf, 20)?,
        })
    }
}

/// IMAGE_AVAILABLE / IMAGE_UNAVAILABLE: a producer's stream became visible to
/// (or was withdrawn from) a subscription. Unsolicited; `subscriber_position`
/// tells a joining consumer where to start and `slot_index` which position
/// slot in the log's metadata page the driver registered for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMessage {
    pub client_id: u64,
    pub subscription_id: u64,
    pub session_id: u32,
    pub stream_id: u32,
    pub subscriber_position: u64,
    pub slot_index: u32,
    pub log_file: String,
}

impl ImageMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40 + self.log_file.len());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.subscription_id.to_le_bytes());
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.stream_id.to_le_bytes());
        out.extend_from_slice(&self.subscriber_position.to_le_bytes());
        out.extend_from_slice(&self.slot_index.to_le_bytes());
        put_string(&mut out, &self.log_file);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            client_id: get_u64(buf, 0)?,
            subscription_id: get_u64(buf, 8)?,
            session_id: get_u32(buf, 16)?,
            stream_id: get_u32(buf, 20)?,
            subscriber_position: get_u64(buf, 24)?,
            slot_index: get_u32(buf, 32)?,
            log_file: get_string(buf, 36)?,
        })
    }
}

/// SETUP frame payload: announces a session's log geometry to receivers.
/// `active_term_id`/`active_term_offset` name the sender's live tail so a
/// joining receiver starts exactly there instead of NAKing history it never
/// subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPayload {
    pub initial_term_id: u32,
    pub active_term_id: u32,
    pub active_term_offset: u32,
    pub term_length: u32,
    pub mtu: u32,
}

impl SetupPayload {
    pub const LENGTH: usize = 20;

    pub fn encode(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[0..4].copy_from_slice(&self.initial_term_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.active_term_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.active_term_offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.term_length.to_le_bytes());
        out[16..20].copy_from_slice(&self.mtu.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            initial_term_id: get_u32(buf, 0)?,
            active_term_id: get_u32(buf, 4)?,
            active_term_offset: get_u32(buf, 8)?,
            term_length: get_u32(buf, 12)?,
            mtu: get_u32(buf, 16)?,
        })
    }
}

/// STATUS frame payload: receiver's consumption point and receive window.
/// The sender's flow-control limit is the minimum consumption position plus
/// the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub consumption_term_id: u32,
    pub consumption_term_offset: u32,
    pub window: u32,
}

impl StatusPayload {
    pub const LENGTH: usize = 12;

    pub fn encode(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[0..4].copy_from_slice(&self.consumption_term_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.consumption_term_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.window.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            consumption_term_id: get_u32(buf, 0)?,
            consumption_term_offset: get_u32(buf, 4)?,
            window: get_u32(buf, 8)?,
        })
    }
}

/// NAK frame payload: a receiver asks for retransmission of a term range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakPayload {
    pub term_id: u32,
    pub term_offset: u32,
    pub length: u32,
}

impl NakPayload {
    pub const LENGTH: usize = 12;

    pub fn encode(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[0..4].copy_from_slice(&self.term_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.term_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            term_id: get_u32(buf, 0)?,
            term_offset: get_u32(buf, 4)?,
            length: get_u32(buf, 8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_stream_round_trip() {
        let cmd = AddStreamCommand {
            correlation_id: 42,
            client_id: 7,
            stream_id: 1001,
            channel: "udp:unicast?endpoint=127.0.0.1:40123".to_string(),
        };
        assert_eq!(AddStreamCommand::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn publication_ready_round_trip() {
        let rsp = PublicationReady {
            correlation_id: 1,
            client_id: 2,
            registration_id: 3,
            session_id: 4,
            stream_id: 5,
            log_file: "/dev/shm/conduit/logs/00000004-00000005.logbuffer".to_string(),
        };
        assert_eq!(PublicationReady::decode(&rsp.encode()).unwrap(), rsp);
    }

    #[test]
    fn image_message_round_trip() {
        let msg = ImageMessage {
            client_id: 9,
            subscription_id: 8,
            session_id: 7,
            stream_id: 6,
            subscriber_position: 1 << 20,
            slot_index: 3,
            log_file: "x.logbuffer".to_string(),
        };
        assert_eq!(ImageMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn control_payload_round_trips() {
        let setup = SetupPayload {
            initial_term_id: 1,
            active_term_id: 3,
            active_term_offset: 256,
            term_length: 65536,
            mtu: 1408,
        };
        assert_eq!(SetupPayload::decode(&setup.encode()).unwrap(), setup);

        let status = StatusPayload {
            consumption_term_id: 3,
            consumption_term_offset: 1024,
            window: 32768,
        };
        assert_eq!(StatusPayload::decode(&status.encode()).unwrap(), status);

        let nak = NakPayload {
            term_id: 3,
            term_offset: 4096,
            length: 1408,
        };
        assert_eq!(NakPayload::decode(&nak.encode()).unwrap(), nak);
    }

    #[test]
    fn truncated_messages_rejected() {
        assert!(AddStreamCommand::decode(&[0u8; 10]).is_err());
        assert!(PublicationReady::decode(&[0u8; 33]).is_err());
        // String length pointing past the end.
        let mut bad = AddStreamCommand {
            correlation_id: 1,
            client_id: 1,
            stream_id: 1,
            channel: "ipc:x".to_string(),
        }
        .encode();
        bad[20] = 0xFF;
        assert!(AddStreamCommand::decode(&bad).is_err());
    }
}
