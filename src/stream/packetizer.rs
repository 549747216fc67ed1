//! Stateful RTP/H.264 packetizer (RFC 6184).
//!
//! One `Packetizer` per stream. Feed an Annex-B encoded buffer with `put`,
//! then drain RTP packets with repeated `get` calls until it reports `None`.
//! NAL units that fit `max_pkt_len` go out in Single NAL Unit mode; larger
//! ones are split into FU-A fragments, one fragment per `get` call.
//!
//! Sequence numbers increase by one for every emitted packet and wrap at
//! 65535. The RTP timestamp is derived once per NAL unit from the session
//! clock; all fragments of a unit share it.

use thiserror::Error;

use super::clock::MediaClock;
use super::nalu::{self, ScanError};
use super::rtp;

/// Output scratch capacity. Packets normally stay below the MTU; anything
/// larger than this indicates a misconfiguration upstream.
pub const MAX_OUTBUF_SIZE: usize = 10 * 1024;

const NAL_TYPE_FU_A: u8 = 28;
const FU_START_BIT: u8 = 0x80;
const FU_END_BIT: u8 = 0x40;

#[derive(Debug, Error)]
pub enum PackError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    /// Rejected at open: the payload limit must stay below the MTU.
    #[error("max_pkt_len {0} must be between 1 and {}", rtp::MTU - 1)]
    InvalidPktLen(usize),
    /// Computed packet does not fit the output scratch buffer. Unrecoverable:
    /// it means `max_pkt_len` disagrees with the allocated capacity.
    #[error("packet of {need} bytes exceeds the {cap}-byte output buffer")]
    OutputOverflow { need: usize, cap: usize },
}

/// Session parameters, fixed at open.
#[derive(Debug, Clone, Copy)]
pub struct PackParams {
    /// Maximum payload bytes carried per RTP packet (below the MTU).
    pub max_pkt_len: usize,
    /// Synchronization source identifier, constant for the session.
    pub ssrc: u32,
}

/// The NAL unit currently in flight, as offsets into the input buffer.
#[derive(Debug, Clone, Copy, Default)]
struct CurNalu {
    /// Offset of the unit payload (past the start code, at the NAL header).
    off: usize,
    /// Payload length including the 1-byte NAL header.
    len: usize,
    forbidden_bit: u8,
    ref_idc: u8,
    unit_type: u8,
}

impl CurNalu {
    fn header_byte(&self) -> u8 {
        (self.forbidden_bit << 7) | (self.ref_idc << 5) | self.unit_type
    }
}

pub struct Packetizer {
    params: PackParams,
    clock: MediaClock,

    /// Input buffer armed by `put`; offsets below index into it.
    inbuf: Vec<u8>,
    /// Offset of the next start code, `None` once the scan is exhausted.
    scan_next: Option<usize>,
    input_complete: bool,

    cur: CurNalu,
    /// True when `cur` has been fully emitted and the next `get` must scan.
    nalu_complete: bool,
    /// Index of the final fragment of the unit in flight.
    fu_count: usize,
    /// Next fragment to emit (0 = first).
    fu_index: usize,
    /// Size of the final fragment, NAL header byte included.
    last_fu_size: usize,

    seq: u16,
    ts_current: u32,
    outbuf: Vec<u8>,
}

impl Packetizer {
    /// Open a packetizer session. Sequence numbers start at 0 and the
    /// timestamp clock is anchored here.
    pub fn open(params: PackParams) -> Result<Self, PackError> {
        if params.max_pkt_len == 0 || params.max_pkt_len >= rtp::MTU {
            return Err(PackError::InvalidPktLen(params.max_pkt_len));
        }

        Ok(Self {
            params,
            clock: MediaClock::start(),
            inbuf: Vec::new(),
            scan_next: None,
            input_complete: true,
            cur: CurNalu::default(),
            nalu_complete: true,
            fu_count: 0,
            fu_index: 0,
            last_fu_size: 0,
            seq: 0,
            ts_current: 0,
            outbuf: Vec::with_capacity(MAX_OUTBUF_SIZE),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.params.ssrc
    }

    /// Arm the session with one or more Annex-B NAL units.
    ///
    /// Produces no output itself. Any undrained fragmentation state from a
    /// previous `put` is discarded; callers must drain `get` first.
    pub fn put(&mut self, inbuf: &[u8]) {
        self.inbuf.clear();
        self.inbuf.extend_from_slice(inbuf);
        self.scan_next = Some(0);
        self.input_complete = false;
        self.nalu_complete = true;
        self.fu_count = 0;
        self.fu_index = 0;
        self.last_fu_size = 0;
    }

    /// Produce the next RTP packet for the armed input.
    ///
    /// `Ok(None)` means the input buffer is exhausted for this `put` cycle.
    /// Scan errors are fatal for the cycle; overflow errors are fatal for the
    /// session.
    pub fn get(&mut self) -> Result<Option<&[u8]>, PackError> {
        if self.input_complete {
            return Ok(None);
        }

        if self.nalu_complete {
            if !self.advance_nalu()? {
                self.input_complete = true;
                return Ok(None);
            }

            let seq = self.next_seq();
            // New NAL unit: derive a fresh timestamp. Fragments reuse it.
            self.ts_current = self.clock.rtp_timestamp();

            if self.cur.len <= self.params.max_pkt_len {
                self.emit_single(seq)?;
            } else {
                self.begin_fragmenting();
                self.emit_fragment(seq)?;
            }
        } else {
            let seq = self.next_seq();
            self.emit_fragment(seq)?;
        }

        Ok(Some(&self.outbuf))
    }

    /// Scan the next NAL unit into `cur`. False when the input is exhausted.
    fn advance_nalu(&mut self) -> Result<bool, PackError> {
        let cur_off = match self.scan_next {
            Some(off) => off,
            None => return Ok(false),
        };

        let (unit, next) = match nalu::scan_at(&self.inbuf, cur_off) {
            Ok(found) => found,
            Err(e) => {
                // Fatal for this put cycle; a later put re-arms the session.
                self.input_complete = true;
                return Err(e.into());
            }
        };

        self.cur = CurNalu {
            off: cur_off + unit.start_code_len,
            len: unit.len(),
            forbidden_bit: unit.forbidden_bit,
            ref_idc: unit.ref_idc,
            unit_type: unit.unit_type,
        };
        self.scan_next = next;
        Ok(true)
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn check_outsize(&self, need: usize) -> Result<(), PackError> {
        if need > MAX_OUTBUF_SIZE {
            return Err(PackError::OutputOverflow {
                need,
                cap: MAX_OUTBUF_SIZE,
            });
        }
        Ok(())
    }

    /// Single NAL Unit mode: RTP header + NAL header byte + payload.
    fn emit_single(&mut self, seq: u16) -> Result<(), PackError> {
        self.check_outsize(self.cur.len + rtp::RTP_HEADER_SIZE)?;

        self.outbuf.clear();
        rtp::push_header(&mut self.outbuf, true, seq, self.ts_current, self.params.ssrc);
        self.outbuf.push(self.cur.header_byte());
        self.outbuf
            .extend_from_slice(&self.inbuf[self.cur.off + 1..self.cur.off + self.cur.len]);

        self.nalu_complete = true;
        Ok(())
    }

    /// Compute the fragment layout for the unit in flight.
    ///
    /// When the unit length divides `max_pkt_len` exactly the final fragment
    /// carries a full `max_pkt_len` bytes rather than zero.
    fn begin_fragmenting(&mut self) {
        let max = self.params.max_pkt_len;
        if self.cur.len % max == 0 {
            self.fu_count = self.cur.len / max - 1;
            self.last_fu_size = max;
        } else {
            self.fu_count = self.cur.len / max;
            self.last_fu_size = self.cur.len % max;
        }
        self.fu_index = 0;
    }

    /// Emit one FU-A fragment: RTP header + FU indicator + FU header + slice.
    fn emit_fragment(&mut self, seq: u16) -> Result<(), PackError> {
        let max = self.params.max_pkt_len;
        let first = self.fu_index == 0;
        let last = self.fu_index == self.fu_count;

        // Payload bytes exclude the original NAL header; the last fragment
        // accounts for it by carrying one byte fewer than its nominal size.
        let chunk = if last { self.last_fu_size - 1 } else { max };
        self.check_outsize(chunk + rtp::RTP_HEADER_SIZE + 2)?;

        let fu_indicator =
            (self.cur.forbidden_bit << 7) | (self.cur.ref_idc << 5) | NAL_TYPE_FU_A;
        let mut fu_header = self.cur.unit_type;
        if first {
            fu_header |= FU_START_BIT;
        }
        if last {
            fu_header |= FU_END_BIT;
        }

        self.outbuf.clear();
        rtp::push_header(&mut self.outbuf, last, seq, self.ts_current, self.params.ssrc);
        self.outbuf.push(fu_indicator);
        self.outbuf.push(fu_header);

        let base = self.cur.off + 1 + self.fu_index * max;
        self.outbuf.extend_from_slice(&self.inbuf[base..base + chunk]);

        if last {
            self.nalu_complete = true;
            self.fu_index = 0;
        } else {
            self.nalu_complete = false;
            self.fu_index += 1;
        }
        Ok(())
    }
}
