//! RTP fixed-header encoding/decoding (RFC 3550).
//!
//! Header format:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! All multi-byte fields are big-endian, built with explicit shifts and
//! masks; no in-memory bit-field layout is relied on.

use anyhow::{bail, Result};

/// RTP header size in bytes (no CSRC, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

/// H.264 payload type (dynamic range, RFC 6184 convention).
pub const PT_H264: u8 = 96;

/// Ethernet MTU; packet payload limits must stay below this.
pub const MTU: usize = 1500;

/// Generate a random SSRC via the OS CSPRNG.
pub fn generate_ssrc() -> u32 {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf).expect("OS CSPRNG failed");
    u32::from_be_bytes(buf)
}

/// Append a 12-byte RTP header (V=2, P=0, X=0, CC=0) to `out`.
pub fn push_header(out: &mut Vec<u8>, marker: bool, seq: u16, timestamp: u32, ssrc: u32) {
    // Byte 0: V=2, P=0, X=0, CC=0 -> 0x80
    out.push(0x80);
    // Byte 1: M bit + PT
    let byte1 = if marker { 0x80 | PT_H264 } else { PT_H264 };
    out.push(byte1);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
}

/// Parsed RTP packet.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

/// Decode bytes into an RTP packet.
pub fn decode(data: &[u8]) -> Result<RtpPacket> {
    if data.len() < RTP_HEADER_SIZE {
        bail!("RTP packet too short: {} bytes", data.len());
    }

    let version = (data[0] >> 6) & 0x03;
    if version != 2 {
        bail!("Unsupported RTP version: {}", version);
    }

    let padding = (data[0] >> 5) & 0x01 != 0;
    let extension = (data[0] >> 4) & 0x01 != 0;
    let csrc_count = data[0] & 0x0F;
    let marker = (data[1] >> 7) & 0x01 != 0;
    let payload_type = data[1] & 0x7F;
    let sequence_number = u16::from_be_bytes([data[2], data[3]]);
    let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let header_len = RTP_HEADER_SIZE + (csrc_count as usize) * 4;
    if data.len() < header_len {
        bail!(
            "RTP packet too short for {} CSRCs: {} bytes",
            csrc_count,
            data.len()
        );
    }

    Ok(RtpPacket {
        version,
        padding,
        extension,
        csrc_count,
        marker,
        payload_type,
        sequence_number,
        timestamp,
        ssrc,
        payload: data[header_len..].to_vec(),
    })
}
