//! H.264 encoding behind a fixed contract.
//!
//! The pipeline drains pending parameter sets (`get_headers`) before every
//! per-frame `encode` call so that SPS/PPS always precede the coded frame
//! that depends on them. Encoders hold the header replay cursor as explicit
//! session state, one cursor per instance.

use anyhow::Result;

/// H.264 picture kinds reported by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicType {
    Sps,
    Pps,
    I,
    P,
    B,
    Unknown,
}

/// Encoder parameters, fixed at open.
#[derive(Debug, Clone, Copy)]
pub struct EncParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Bit rate in kbps; 0 disables rate control.
    pub bitrate_kbps: u32,
    /// Group-of-pictures size; parameter sets are replayed at GOP starts.
    pub gop: u32,
}

/// Encoder contract consumed by the pipeline.
///
/// Returned slices stay valid until the next call on the same method.
pub trait Encode {
    /// Fetch the next pending parameter set, or `None` when drained.
    ///
    /// Call repeatedly until `None` before every `encode`.
    fn get_headers(&mut self) -> Option<(&[u8], PicType)>;

    /// Encode one raw frame into Annex-B H.264 bytes.
    ///
    /// `Ok(None)` means the encoder produced no output for this frame yet
    /// (transient); `Err` is fatal.
    fn encode(&mut self, frame: &[u8]) -> Result<Option<(&[u8], PicType)>>;

    fn set_bitrate(&mut self, kbps: u32) -> Result<()>;
    fn set_framerate(&mut self, fps: u32) -> Result<()>;
    fn set_gop(&mut self, gop: u32) -> Result<()>;

    /// Force the next encoded frame to be an IDR picture.
    fn force_keyframe(&mut self);
}

/// Header replay cursor, advanced one parameter set per `get_headers` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCursor {
    Sps,
    Pps,
    Done,
}

#[cfg(feature = "video-capture")]
pub use openh264_backend::OpenH264Encoder;

#[cfg(feature = "video-capture")]
mod openh264_backend {
    use anyhow::{bail, Context, Result};
    use openh264::encoder::{Encoder, EncoderConfig};
    use openh264::formats::YUVSource;
    use openh264::OpenH264API;

    use super::{EncParams, Encode, HeaderCursor, PicType};

    const NAL_TYPE_SLICE: u8 = 1;
    const NAL_TYPE_IDR: u8 = 5;
    const NAL_TYPE_SPS: u8 = 7;
    const NAL_TYPE_PPS: u8 = 8;

    /// Adapter passing raw I420 data to the openh264 encoder.
    struct RawI420<'a> {
        data: &'a [u8],
        width: usize,
        height: usize,
    }

    impl YUVSource for RawI420<'_> {
        fn width(&self) -> i32 {
            self.width as i32
        }
        fn height(&self) -> i32 {
            self.height as i32
        }
        fn y(&self) -> &[u8] {
            &self.data[..self.width * self.height]
        }
        fn u(&self) -> &[u8] {
            let y_size = self.width * self.height;
            let uv_size = (self.width / 2) * (self.height / 2);
            &self.data[y_size..y_size + uv_size]
        }
        fn v(&self) -> &[u8] {
            let y_size = self.width * self.height;
            let uv_size = (self.width / 2) * (self.height / 2);
            &self.data[y_size + uv_size..y_size + uv_size * 2]
        }
        fn y_stride(&self) -> i32 {
            self.width as i32
        }
        fn u_stride(&self) -> i32 {
            (self.width / 2) as i32
        }
        fn v_stride(&self) -> i32 {
            (self.width / 2) as i32
        }
    }

    /// H.264 encoder backed by openh264.
    ///
    /// SPS/PPS are captured (with start codes) from the first encoded IDR and
    /// replayed through `get_headers` at every GOP boundary.
    pub struct OpenH264Encoder {
        encoder: Encoder,
        params: EncParams,
        sps: Option<Vec<u8>>,
        pps: Option<Vec<u8>>,
        cursor: HeaderCursor,
        frame_index: u64,
        outbuf: Vec<u8>,
    }

    impl OpenH264Encoder {
        pub fn open(params: EncParams) -> Result<Self> {
            if params.gop == 0 {
                bail!("GOP size must be at least 1");
            }

            let api = OpenH264API::from_source();
            let config = EncoderConfig::new(params.width, params.height)
                .max_frame_rate(params.fps as f32)
                .set_bitrate_bps(params.bitrate_kbps * 1000);

            let encoder =
                Encoder::with_config(api, config).context("Failed to create openh264 encoder")?;

            tracing::info!(
                "Encoder opened: {}x{} @ {}fps, {} kbps, gop {}",
                params.width,
                params.height,
                params.fps,
                params.bitrate_kbps,
                params.gop
            );

            Ok(Self {
                encoder,
                params,
                sps: None,
                pps: None,
                cursor: HeaderCursor::Sps,
                frame_index: 0,
                outbuf: Vec::new(),
            })
        }

        fn at_gop_start(&self) -> bool {
            self.frame_index % self.params.gop as u64 == 0
        }
    }

    impl Encode for OpenH264Encoder {
        fn get_headers(&mut self) -> Option<(&[u8], PicType)> {
            // Headers are only pending at GOP starts, once captured.
            if !self.at_gop_start() || self.sps.is_none() {
                return None;
            }

            match self.cursor {
                HeaderCursor::Sps => {
                    self.cursor = HeaderCursor::Pps;
                    self.sps.as_deref().map(|sps| (sps, PicType::Sps))
                }
                HeaderCursor::Pps => {
                    self.cursor = HeaderCursor::Done;
                    self.pps.as_deref().map(|pps| (pps, PicType::Pps))
                }
                HeaderCursor::Done => {
                    self.cursor = HeaderCursor::Sps;
                    None
                }
            }
        }

        fn encode(&mut self, frame: &[u8]) -> Result<Option<(&[u8], PicType)>> {
            let expected = (self.params.width * self.params.height * 3 / 2) as usize;
            if frame.len() < expected {
                bail!(
                    "I420 frame too small: {} bytes, expected {}",
                    frame.len(),
                    expected
                );
            }

            let yuv = RawI420 {
                data: frame,
                width: self.params.width as usize,
                height: self.params.height as usize,
            };

            let bitstream = self.encoder.encode(&yuv).context("openh264 encode failed")?;

            self.outbuf.clear();
            let mut ptype = PicType::Unknown;
            for layer_idx in 0..bitstream.num_layers() {
                let Some(layer) = bitstream.layer(layer_idx) else {
                    continue;
                };
                for nal_idx in 0..layer.nal_count() {
                    let Some(nal) = layer.nal_unit(nal_idx) else {
                        continue;
                    };
                    // openh264 emits Annex-B units with start codes; keep
                    // them so the packetizer can scan the buffer directly.
                    self.outbuf.extend_from_slice(nal);

                    match nal_header_type(nal) {
                        Some(NAL_TYPE_SPS) => self.sps = Some(nal.to_vec()),
                        Some(NAL_TYPE_PPS) => self.pps = Some(nal.to_vec()),
                        Some(NAL_TYPE_IDR) => ptype = PicType::I,
                        Some(NAL_TYPE_SLICE) => {
                            if ptype == PicType::Unknown {
                                ptype = PicType::P;
                            }
                        }
                        _ => {}
                    }
                }
            }

            self.frame_index += 1;
            if self.outbuf.is_empty() {
                return Ok(None);
            }
            Ok(Some((&self.outbuf, ptype)))
        }

        fn set_bitrate(&mut self, _kbps: u32) -> Result<()> {
            bail!("runtime bitrate changes are not supported by the openh264 backend")
        }

        fn set_framerate(&mut self, _fps: u32) -> Result<()> {
            bail!("runtime framerate changes are not supported by the openh264 backend")
        }

        fn set_gop(&mut self, gop: u32) -> Result<()> {
            if gop == 0 {
                bail!("GOP size must be at least 1");
            }
            self.params.gop = gop;
            Ok(())
        }

        fn force_keyframe(&mut self) {
            self.encoder.force_intra_frame(true);
        }
    }

    /// NAL unit type of an Annex-B unit, skipping its start code.
    fn nal_header_type(nal: &[u8]) -> Option<u8> {
        let body = if nal.starts_with(&[0x00, 0x00, 0x00, 0x01]) {
            &nal[4..]
        } else if nal.starts_with(&[0x00, 0x00, 0x01]) {
            &nal[3..]
        } else {
            nal
        };
        body.first().map(|b| b & 0x1F)
    }
}
