//! Binary frame codec for the upstream live platform.
//!
//! Every packet starts with a 16-byte big-endian header: total length
//! (u32), header length (u16, always 16), protocol version (u16),
//! operation (u32) and sequence (u32), followed by `total - 16` body
//! bytes. A single socket read may carry several concatenated packets.

use bytes::{Buf, BufMut, BytesMut};

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Protocol version sent in outbound packets.
pub const PROTOCOL_VERSION: u16 = 1;

/// Keepalive packet, empty body.
pub const OP_HEARTBEAT: u32 = 2;
/// Server-pushed event packet, JSON body.
pub const OP_MESSAGE: u32 = 5;
/// Handshake packet, JSON body.
pub const OP_AUTH: u32 = 7;

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub protocol: u16,
    pub op: u32,
    pub seq: u32,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(op: u32, body: Vec<u8>) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            op,
            seq: 1,
            body,
        }
    }
}

/// Encode one packet into wire bytes.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let total = HEADER_LEN + packet.body.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(total as u32);
    buf.put_u16(HEADER_LEN as u16);
    buf.put_u16(packet.protocol);
    buf.put_u32(packet.op);
    buf.put_u32(packet.seq);
    buf.put_slice(&packet.body);
    buf.to_vec()
}

/// Decode every complete packet in `data`.
///
/// Parsing stops silently at a partial trailing header. A declared
/// packet length smaller than the header aborts the remainder of the
/// batch; whatever decoded cleanly before it is still returned.
pub fn decode_all(data: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut rest = data;
    while rest.len() >= HEADER_LEN {
        let mut header = &rest[..HEADER_LEN];
        let total = header.get_u32() as usize;
        let _header_len = header.get_u16();
        let protocol = header.get_u16();
        let op = header.get_u32();
        let seq = header.get_u32();

        if total < HEADER_LEN {
            tracing::warn!(total, "packet shorter than header, dropping rest of batch");
            break;
        }
        if total > rest.len() {
            // Truncated packet; wait for more bytes.
            break;
        }
        packets.push(Packet {
            protocol,
            op,
            seq,
            body: rest[HEADER_LEN..total].to_vec(),
        });
        rest = &rest[total..];
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_one_packet() {
        let packet = Packet::new(OP_MESSAGE, b"{\"cmd\":\"x\"}".to_vec());
        let wire = encode(&packet);
        assert_eq!(wire.len(), HEADER_LEN + packet.body.len());
        let decoded = decode_all(&wire);
        assert_eq!(decoded, vec![packet]);
    }

    #[test]
    fn decodes_concatenated_packets() {
        let a = Packet::new(OP_HEARTBEAT, Vec::new());
        let b = Packet::new(OP_MESSAGE, b"hello".to_vec());
        let mut wire = encode(&a);
        wire.extend(encode(&b));
        let decoded = decode_all(&wire);
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn partial_header_stops_without_error() {
        let wire = encode(&Packet::new(OP_MESSAGE, b"abc".to_vec()));
        // Fifteen bytes is one short of a parseable header.
        assert!(decode_all(&wire[..15]).is_empty());
        // A full header with a truncated body also waits for more.
        assert!(decode_all(&wire[..HEADER_LEN + 1]).is_empty());
    }

    #[test]
    fn undersized_length_aborts_batch() {
        let good = Packet::new(OP_MESSAGE, b"ok".to_vec());
        let mut wire = encode(&good);
        let mut bad = BytesMut::new();
        bad.put_u32(8); // less than the header itself
        bad.put_u16(HEADER_LEN as u16);
        bad.put_u16(PROTOCOL_VERSION);
        bad.put_u32(OP_MESSAGE);
        bad.put_u32(2);
        wire.extend_from_slice(&bad);
        wire.extend(encode(&good));

        let decoded = decode_all(&wire);
        // The packet before the corrupt one survives, nothing after.
        assert_eq!(decoded, vec![good]);
    }
}
