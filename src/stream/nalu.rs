//! Annex-B NAL unit scanning.
//!
//! H.264 encoders emit NAL units delimited by 3-byte (`00 00 01`) or 4-byte
//! (`00 00 00 01`) start codes. Callers drive the scan one `scan_at` step at
//! a time, feeding each returned next-offset back in; units come out as
//! borrowed views and nothing is copied until packetization.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    /// The buffer does not begin with a recognizable start code.
    #[error("no start code found in encoded data")]
    NoStartCode,
    /// A start code at the very end of the buffer with no unit behind it.
    #[error("start code at end of input with no NAL unit data")]
    TruncatedUnit,
}

/// A NAL unit viewed in place inside an encoded buffer.
///
/// `data` covers the unit payload including its 1-byte NAL header, excluding
/// the start code.
#[derive(Debug, Clone, Copy)]
pub struct Nalu<'a> {
    pub start_code_len: usize,
    pub data: &'a [u8],
    pub forbidden_bit: u8,
    pub ref_idc: u8,
    pub unit_type: u8,
}

impl Nalu<'_> {
    /// Unit length in bytes, NAL header included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Start-code length (3 or 4) at `pos`, if one begins there.
///
/// The 3-byte form is checked first; a 4-byte code fails that check on its
/// extra zero byte and is picked up by the second test.
pub fn start_code_len_at(buf: &[u8], pos: usize) -> Option<usize> {
    let rest = &buf[pos.min(buf.len())..];
    if rest.len() >= 3 && rest[0] == 0 && rest[1] == 0 && rest[2] == 1 {
        return Some(3);
    }
    if rest.len() >= 4 && rest[0] == 0 && rest[1] == 0 && rest[2] == 0 && rest[3] == 1 {
        return Some(4);
    }
    None
}

/// One scan step: parse the NAL unit whose start code begins at `cur` and
/// locate the start code of the following unit.
///
/// Returns the parsed unit and the offset of the next start code (`None` when
/// this was the final unit in the buffer).
pub fn scan_at(buf: &[u8], cur: usize) -> Result<(Nalu<'_>, Option<usize>), ScanError> {
    let prefix = start_code_len_at(buf, cur).ok_or(ScanError::NoStartCode)?;

    let mut pos = cur + prefix;
    let mut next = None;
    loop {
        pos += 1;
        if pos >= buf.len() {
            pos = buf.len();
            break;
        }
        if start_code_len_at(buf, pos).is_some() {
            next = Some(pos);
            break;
        }
    }

    let data = &buf[cur + prefix..pos];
    if data.is_empty() {
        return Err(ScanError::TruncatedUnit);
    }

    Ok((
        Nalu {
            start_code_len: prefix,
            data,
            forbidden_bit: (data[0] & 0x80) >> 7,
            ref_idc: (data[0] & 0x60) >> 5,
            unit_type: data[0] & 0x1F,
        },
        next,
    ))
}
