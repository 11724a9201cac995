//! Git packet-line framing, as far as the smart-HTTP advertisement needs it.
//!
//! Each packet is prefixed with a 4-character hex length that includes the
//! prefix itself; `0000` is the flush packet.

/// Flush packet, ending a section.
pub const FLUSH: &[u8] = b"0000";

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD: usize = 0xFFFF - 4;

/// Encode `data` as one packet-line.  Payloads longer than [`MAX_PAYLOAD`]
/// are truncated.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let data = &data[..data.len().min(MAX_PAYLOAD)];
    let total_len = data.len() + 4;
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// First section of an `info/refs` response for `service`.
pub fn service_header(service: &str) -> Vec<u8> {
    let mut buf = encode_pkt_line(format!("# service={service}\n").as_bytes());
    buf.extend_from_slice(FLUSH);
    buf
}
