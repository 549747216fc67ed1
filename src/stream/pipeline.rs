//! Pipeline orchestrator: capture -> convert -> encode -> pack -> network.
//!
//! A single cooperative loop pulls frames from the capture backend and pushes
//! them through whichever downstream stages the stage mask enables; at any
//! disabled stage boundary the current buffer goes to the dump sink instead.
//! Parameter sets pending in the encoder are always drained and transmitted
//! before the coded frame that depends on them.
//!
//! Transient "no data yet" conditions sleep briefly and retry; fatal backend
//! failures break the loop and shut the stages down in reverse order.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use super::capture::{Capture, PollFrame};
use super::convert::Convert;
use super::encode::Encode;
use super::net::Transport;
use super::packetizer::Packetizer;

/// Delay before retrying a stage that reported "no data yet".
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Cooperative cancellation flag, set from the signal handler and observed
/// once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bitset selecting which downstream stages run.
///
/// Stages build on one another, so the only valid masks are the prefixes:
/// 0 (capture only), 1 (+convert), 3 (+encode), 7 (+pack), 15 (+network).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMask(u8);

impl StageMask {
    pub const CONVERT: u8 = 0b0001;
    pub const ENCODE: u8 = 0b0010;
    pub const PACK: u8 = 0b0100;
    pub const NETWORK: u8 = 0b1000;

    pub fn new(bits: u8) -> Result<Self> {
        match bits {
            0 | 1 | 3 | 7 | 15 => Ok(Self(bits)),
            other => bail!(
                "invalid stage mask {}: valid values are 0 (capture only), \
                 1 (+convert), 3 (+encode), 7 (+pack), 15 (+network)",
                other
            ),
        }
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn convert(&self) -> bool {
        self.0 & Self::CONVERT != 0
    }

    pub fn encode(&self) -> bool {
        self.0 & Self::ENCODE != 0
    }

    pub fn pack(&self) -> bool {
        self.0 & Self::PACK != 0
    }

    pub fn network(&self) -> bool {
        self.0 & Self::NETWORK != 0
    }
}

/// On-frame mutation applied between convert and encode, e.g. a burned-in
/// timestamp overlay.
pub trait Overlay {
    fn draw(&mut self, frame: &mut [u8]);
}

/// The streaming pipeline. Build with the stages the mask requires, then
/// `run` until cancellation or a fatal backend failure.
///
/// Fields are declared sink-first so drop order releases each stage before
/// the stages it depends on.
pub struct Pipeline {
    mask: StageMask,
    net: Option<Box<dyn Transport>>,
    packetizer: Option<Packetizer>,
    encoder: Option<Box<dyn Encode>>,
    converter: Option<Box<dyn Convert>>,
    capture: Box<dyn Capture>,
    overlay: Option<Box<dyn Overlay>>,
    dump: Option<Box<dyn Write>>,
    /// Captured frames already match the encoder input format.
    skip_convert: bool,
    cancel: CancelToken,
    frame_scratch: Vec<u8>,
}

impl Pipeline {
    pub fn new(mask: StageMask, capture: Box<dyn Capture>, cancel: CancelToken) -> Self {
        Self {
            mask,
            net: None,
            packetizer: None,
            encoder: None,
            converter: None,
            capture,
            overlay: None,
            dump: None,
            skip_convert: false,
            cancel,
            frame_scratch: Vec::new(),
        }
    }

    pub fn with_converter(mut self, converter: Box<dyn Convert>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Skip the convert stage because capture already delivers the encoder
    /// input format.
    pub fn skip_convert(mut self, skip: bool) -> Self {
        self.skip_convert = skip;
        self
    }

    pub fn with_encoder(mut self, encoder: Box<dyn Encode>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn with_packetizer(mut self, packetizer: Packetizer) -> Self {
        self.packetizer = Some(packetizer);
        self
    }

    pub fn with_transport(mut self, net: Box<dyn Transport>) -> Self {
        self.net = Some(net);
        self
    }

    pub fn with_overlay(mut self, overlay: Box<dyn Overlay>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn with_dump(mut self, dump: Box<dyn Write>) -> Self {
        self.dump = Some(dump);
        self
    }

    /// Every enabled stage needs an opened backend.
    fn validate(&self) -> Result<()> {
        if self.mask.convert() && !self.skip_convert && self.converter.is_none() {
            bail!("convert stage enabled but no converter opened");
        }
        if self.mask.encode() && self.encoder.is_none() {
            bail!("encode stage enabled but no encoder opened");
        }
        if self.mask.pack() && self.packetizer.is_none() {
            bail!("pack stage enabled but no packetizer opened");
        }
        if self.mask.network() && self.net.is_none() {
            bail!("network stage enabled but no transport opened");
        }
        Ok(())
    }

    /// Run the loop until cancellation or a fatal failure, then stop capture.
    pub fn run(&mut self) -> Result<()> {
        self.validate()?;
        self.capture
            .start()
            .context("Failed to start capture stream")?;

        let result = self.run_loop();

        self.capture.stop();
        if let Some(w) = self.dump.as_mut() {
            let _ = w.flush();
        }
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        while !self.cancel.is_cancelled() {
            let cap_buf = match self.capture.get_frame() {
                Ok(PollFrame::Ready(buf)) => buf,
                Ok(PollFrame::Again) => {
                    thread::sleep(RETRY_DELAY);
                    continue;
                }
                Err(e) => {
                    tracing::error!("capture failed: {:#}", e);
                    break;
                }
            };
            if cap_buf.is_empty() {
                tracing::warn!("empty capture frame");
                continue;
            }

            if !self.mask.convert() {
                // Capture only
                if let Some(w) = self.dump.as_mut() {
                    w.write_all(cap_buf).context("dump write failed")?;
                }
                continue;
            }

            let raw: &[u8] = if self.skip_convert {
                cap_buf
            } else {
                let Some(cvt) = self.converter.as_deref_mut() else {
                    bail!("convert stage enabled but no converter opened");
                };
                match cvt.convert(cap_buf) {
                    Ok(buf) => buf,
                    Err(e) => {
                        tracing::error!("convert failed: {:#}", e);
                        break;
                    }
                }
            };

            let frame: &[u8] = match self.overlay.as_deref_mut() {
                Some(overlay) => {
                    self.frame_scratch.clear();
                    self.frame_scratch.extend_from_slice(raw);
                    overlay.draw(&mut self.frame_scratch);
                    &self.frame_scratch
                }
                None => raw,
            };

            if !self.mask.encode() {
                if let Some(w) = self.dump.as_mut() {
                    w.write_all(frame).context("dump write failed")?;
                }
                continue;
            }
            let Some(enc) = self.encoder.as_deref_mut() else {
                bail!("encode stage enabled but no encoder opened");
            };

            // Parameter sets go out before the frame that depends on them
            while let Some((hd_buf, _ptype)) = enc.get_headers() {
                if !self.mask.pack() {
                    if let Some(w) = self.dump.as_mut() {
                        w.write_all(hd_buf).context("dump write failed")?;
                    }
                    continue;
                }
                let Some(pack) = self.packetizer.as_mut() else {
                    bail!("pack stage enabled but no packetizer opened");
                };
                pack_and_send(pack, &mut self.net, &mut self.dump, hd_buf)?;
            }

            let (enc_buf, ptype) = match enc.encode(frame) {
                Ok(Some(out)) => out,
                Ok(None) => {
                    tracing::debug!("no encoded data for this frame");
                    continue;
                }
                Err(e) => {
                    tracing::error!("encode failed: {:#}", e);
                    break;
                }
            };
            tracing::trace!(?ptype, len = enc_buf.len(), "encoded frame");

            if !self.mask.pack() {
                if let Some(w) = self.dump.as_mut() {
                    w.write_all(enc_buf).context("dump write failed")?;
                }
                continue;
            }
            let Some(pack) = self.packetizer.as_mut() else {
                bail!("pack stage enabled but no packetizer opened");
            };
            pack_and_send(pack, &mut self.net, &mut self.dump, enc_buf)?;
        }

        Ok(())
    }
}

/// Packetize one encoded buffer and push every RTP packet to the transport,
/// or to the dump sink when the network stage is disabled.
///
/// A failed or short send is logged and the stream carries on; packetizer
/// errors are protocol-invariant violations and abort the run.
fn pack_and_send(
    pack: &mut Packetizer,
    net: &mut Option<Box<dyn Transport>>,
    dump: &mut Option<Box<dyn Write>>,
    buf: &[u8],
) -> Result<()> {
    pack.put(buf);
    loop {
        let pkt = match pack.get() {
            Ok(Some(pkt)) => pkt,
            Ok(None) => break,
            Err(e) => return Err(e).context("packetizer failed"),
        };

        match net.as_deref_mut() {
            Some(sink) => match sink.send(pkt) {
                Ok(sent) if sent != pkt.len() => {
                    tracing::warn!("short send: {} of {} bytes", sent, pkt.len());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("packet send failed ({} bytes): {}", pkt.len(), e);
                }
            },
            None => {
                if let Some(w) = dump.as_mut() {
                    w.write_all(pkt).context("dump write failed")?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::capture::PixelFormat;
    use crate::stream::encode::PicType;
    use crate::stream::packetizer::{PackParams, Packetizer};
    use crate::stream::rtp;
    use anyhow::anyhow;
    use std::cell::RefCell;
    use std::rc::Rc;

    type CallLog = Rc<RefCell<Vec<&'static str>>>;

    fn annexb_unit(unit: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x00, 0x00, 0x00, 0x01];
        buf.extend_from_slice(unit);
        buf
    }

    /// Capture producing a fixed list of frames, then a fatal device error.
    struct ScriptedCapture {
        frames: Vec<Vec<u8>>,
        idx: usize,
        cur: Vec<u8>,
        log: CallLog,
    }

    impl ScriptedCapture {
        fn new(frames: Vec<Vec<u8>>, log: CallLog) -> Self {
            Self {
                frames,
                idx: 0,
                cur: Vec::new(),
                log,
            }
        }
    }

    impl Capture for ScriptedCapture {
        fn start(&mut self) -> Result<()> {
            self.log.borrow_mut().push("capture.start");
            Ok(())
        }

        fn stop(&mut self) {
            self.log.borrow_mut().push("capture.stop");
        }

        fn get_frame(&mut self) -> Result<PollFrame<'_>> {
            self.log.borrow_mut().push("capture.get_frame");
            if self.idx < self.frames.len() {
                self.cur = self.frames[self.idx].clone();
                self.idx += 1;
                Ok(PollFrame::Ready(&self.cur))
            } else {
                Err(anyhow!("scripted device unplugged"))
            }
        }

        fn pixel_format(&self) -> PixelFormat {
            PixelFormat::Yuyv
        }
    }

    struct SpyConvert {
        out: Vec<u8>,
        log: CallLog,
    }

    impl Convert for SpyConvert {
        fn convert(&mut self, inbuf: &[u8]) -> Result<&[u8]> {
            self.log.borrow_mut().push("convert");
            self.out = inbuf.to_vec();
            Ok(&self.out)
        }
    }

    /// Encoder scripted with pending headers (replayed once) and a fixed
    /// Annex-B output per frame.
    struct ScriptedEncoder {
        headers: Vec<Vec<u8>>,
        header_idx: usize,
        frame_out: Vec<u8>,
        log: CallLog,
    }

    impl ScriptedEncoder {
        fn new(headers: Vec<Vec<u8>>, frame_out: Vec<u8>, log: CallLog) -> Self {
            Self {
                headers,
                header_idx: 0,
                frame_out,
                log,
            }
        }
    }

    impl Encode for ScriptedEncoder {
        fn get_headers(&mut self) -> Option<(&[u8], PicType)> {
            self.log.borrow_mut().push("encode.get_headers");
            let hd = self.headers.get(self.header_idx)?;
            self.header_idx += 1;
            Some((hd, PicType::Sps))
        }

        fn encode(&mut self, _frame: &[u8]) -> Result<Option<(&[u8], PicType)>> {
            self.log.borrow_mut().push("encode.encode");
            Ok(Some((&self.frame_out, PicType::I)))
        }

        fn set_bitrate(&mut self, _kbps: u32) -> Result<()> {
            Ok(())
        }

        fn set_framerate(&mut self, _fps: u32) -> Result<()> {
            Ok(())
        }

        fn set_gop(&mut self, _gop: u32) -> Result<()> {
            Ok(())
        }

        fn force_keyframe(&mut self) {}
    }

    struct SpyTransport {
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
        fail: bool,
        log: CallLog,
    }

    impl Transport for SpyTransport {
        fn send(&mut self, pkt: &[u8]) -> std::io::Result<usize> {
            self.log.borrow_mut().push("net.send");
            if self.fail {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "scripted failure",
                ));
            }
            self.sent.borrow_mut().push(pkt.to_vec());
            Ok(pkt.len())
        }
    }

    /// `Write` sink into a shared buffer, standing in for the dump file.
    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn packetizer() -> Packetizer {
        Packetizer::open(PackParams {
            max_pkt_len: 1400,
            ssrc: 42,
        })
        .unwrap()
    }

    #[test]
    fn test_stage_mask_accepts_prefixes_only() {
        for bits in [0u8, 1, 3, 7, 15] {
            assert!(StageMask::new(bits).is_ok(), "bits={}", bits);
        }
        for bits in [2u8, 4, 5, 6, 8, 9, 12, 14, 16, 255] {
            assert!(StageMask::new(bits).is_err(), "bits={}", bits);
        }
    }

    #[test]
    fn test_stage_mask_bits() {
        let mask = StageMask::new(7).unwrap();
        assert!(mask.convert() && mask.encode() && mask.pack());
        assert!(!mask.network());
    }

    #[test]
    fn test_capture_only_touches_no_downstream_stage() {
        let log: CallLog = CallLog::default();
        let frames = vec![vec![1u8, 2, 3], vec![4u8, 5, 6]];
        let capture = ScriptedCapture::new(frames.clone(), log.clone());
        let sink = SharedSink::default();

        let mut pipeline = Pipeline::new(
            StageMask::new(0).unwrap(),
            Box::new(capture),
            CancelToken::new(),
        )
        .with_converter(Box::new(SpyConvert {
            out: Vec::new(),
            log: log.clone(),
        }))
        .with_encoder(Box::new(ScriptedEncoder::new(
            Vec::new(),
            Vec::new(),
            log.clone(),
        )))
        .with_packetizer(packetizer())
        .with_dump(Box::new(sink.clone()));

        pipeline.run().unwrap();

        let calls = log.borrow();
        assert!(!calls.contains(&"convert"));
        assert!(!calls.contains(&"encode.get_headers"));
        assert!(!calls.contains(&"encode.encode"));
        assert!(!calls.contains(&"net.send"));
        // Raw frames went straight to the dump sink
        assert_eq!(*sink.0.borrow(), [frames[0].clone(), frames[1].clone()].concat());
    }

    #[test]
    fn test_headers_drained_before_frame_encode() {
        let log: CallLog = CallLog::default();
        let sps = annexb_unit(&[0x67, 0x42, 0xC0]);
        let pps = annexb_unit(&[0x68, 0xCE, 0x38]);
        let frame_out = annexb_unit(&[0x65, 0x88, 0x80, 0x40]);

        let capture = ScriptedCapture::new(vec![vec![0u8; 8]], log.clone());
        let encoder = ScriptedEncoder::new(
            vec![sps.clone(), pps.clone()],
            frame_out.clone(),
            log.clone(),
        );
        let sink = SharedSink::default();

        let mut pipeline = Pipeline::new(
            StageMask::new(3).unwrap(),
            Box::new(capture),
            CancelToken::new(),
        )
        .skip_convert(true)
        .with_encoder(Box::new(encoder))
        .with_dump(Box::new(sink.clone()));

        pipeline.run().unwrap();

        // Both headers fetched (plus the terminating None) before encode
        let calls = log.borrow();
        let encode_pos = calls.iter().position(|&c| c == "encode.encode").unwrap();
        let header_calls = calls[..encode_pos]
            .iter()
            .filter(|&&c| c == "encode.get_headers")
            .count();
        assert_eq!(header_calls, 3);

        // And the dump carries SPS, PPS, then the coded frame, in order
        assert_eq!(*sink.0.borrow(), [sps, pps, frame_out].concat());
    }

    #[test]
    fn test_packed_stage_dumps_rtp_packets() {
        let log: CallLog = CallLog::default();
        let unit = vec![0x65, 0x88, 0x80, 0x40];
        let capture = ScriptedCapture::new(vec![vec![0u8; 8]], log.clone());
        let encoder = ScriptedEncoder::new(Vec::new(), annexb_unit(&unit), log.clone());
        let sink = SharedSink::default();

        let mut pipeline = Pipeline::new(
            StageMask::new(7).unwrap(),
            Box::new(capture),
            CancelToken::new(),
        )
        .skip_convert(true)
        .with_encoder(Box::new(encoder))
        .with_packetizer(packetizer())
        .with_dump(Box::new(sink.clone()));

        pipeline.run().unwrap();

        let dumped = sink.0.borrow();
        let pkt = rtp::decode(&dumped).unwrap();
        assert_eq!(pkt.payload_type, rtp::PT_H264);
        assert_eq!(pkt.ssrc, 42);
        assert!(pkt.marker);
        assert_eq!(pkt.payload, unit);
    }

    #[test]
    fn test_network_receives_packets_in_order() {
        let log: CallLog = CallLog::default();
        let unit = vec![0x65u8; 40];
        let capture =
            ScriptedCapture::new(vec![vec![0u8; 8], vec![0u8; 8]], log.clone());
        let encoder = ScriptedEncoder::new(Vec::new(), annexb_unit(&unit), log.clone());
        let sent = Rc::new(RefCell::new(Vec::new()));

        let mut pipeline = Pipeline::new(
            StageMask::new(15).unwrap(),
            Box::new(capture),
            CancelToken::new(),
        )
        .skip_convert(true)
        .with_encoder(Box::new(encoder))
        .with_packetizer(packetizer())
        .with_transport(Box::new(SpyTransport {
            sent: sent.clone(),
            fail: false,
            log: log.clone(),
        }));

        pipeline.run().unwrap();

        let packets = sent.borrow();
        assert_eq!(packets.len(), 2);
        let seqs: Vec<u16> = packets
            .iter()
            .map(|p| rtp::decode(p).unwrap().sequence_number)
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_send_failure_does_not_stop_the_stream() {
        let log: CallLog = CallLog::default();
        let unit = vec![0x65u8; 40];
        let capture =
            ScriptedCapture::new(vec![vec![0u8; 8], vec![0u8; 8]], log.clone());
        let encoder = ScriptedEncoder::new(Vec::new(), annexb_unit(&unit), log.clone());

        let mut pipeline = Pipeline::new(
            StageMask::new(15).unwrap(),
            Box::new(capture),
            CancelToken::new(),
        )
        .skip_convert(true)
        .with_encoder(Box::new(encoder))
        .with_packetizer(packetizer())
        .with_transport(Box::new(SpyTransport {
            sent: Rc::new(RefCell::new(Vec::new())),
            fail: true,
            log: log.clone(),
        }));

        pipeline.run().unwrap();

        // Both frames were still encoded and handed to the transport
        let calls = log.borrow();
        assert_eq!(calls.iter().filter(|&&c| c == "encode.encode").count(), 2);
        assert_eq!(calls.iter().filter(|&&c| c == "net.send").count(), 2);
    }

    #[test]
    fn test_overlay_runs_on_converted_frames() {
        struct Stamp(CallLog);
        impl Overlay for Stamp {
            fn draw(&mut self, frame: &mut [u8]) {
                self.0.borrow_mut().push("overlay");
                if let Some(b) = frame.first_mut() {
                    *b = 0xFF;
                }
            }
        }

        let log: CallLog = CallLog::default();
        let capture = ScriptedCapture::new(vec![vec![1u8, 2, 3]], log.clone());
        let sink = SharedSink::default();

        let mut pipeline = Pipeline::new(
            StageMask::new(1).unwrap(),
            Box::new(capture),
            CancelToken::new(),
        )
        .skip_convert(true)
        .with_overlay(Box::new(Stamp(log.clone())))
        .with_dump(Box::new(sink.clone()));

        pipeline.run().unwrap();

        assert!(log.borrow().contains(&"overlay"));
        assert_eq!(*sink.0.borrow(), vec![0xFF, 2, 3]);
    }

    #[test]
    fn test_cancelled_before_start_pulls_no_frames() {
        let log: CallLog = CallLog::default();
        let capture = ScriptedCapture::new(vec![vec![0u8; 8]], log.clone());
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut pipeline =
            Pipeline::new(StageMask::new(0).unwrap(), Box::new(capture), cancel);
        pipeline.run().unwrap();

        assert_eq!(*log.borrow(), vec!["capture.start", "capture.stop"]);
    }

    #[test]
    fn test_missing_backend_fails_validation() {
        let log: CallLog = CallLog::default();
        let capture = ScriptedCapture::new(Vec::new(), log.clone());

        let mut pipeline = Pipeline::new(
            StageMask::new(3).unwrap(),
            Box::new(capture),
            CancelToken::new(),
        )
        .skip_convert(true);

        let err = pipeline.run().unwrap_err();
        assert!(err.to_string().contains("no encoder"));
        // Capture was never started
        assert!(log.borrow().is_empty());
    }
}
