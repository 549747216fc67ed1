//! Pixel-format conversion between capture output and encoder input.
//!
//! Only the software YUYV -> I420 path is built in; hardware scalers plug in
//! through the same `Convert` trait.

use anyhow::{bail, Result};

/// Converter contract consumed by the pipeline. The returned slice is valid
/// until the next `convert` call.
pub trait Convert {
    fn convert(&mut self, inbuf: &[u8]) -> Result<&[u8]>;
}

/// Software converter from packed YUYV (4:2:2) to planar I420 (4:2:0).
///
/// Chroma is subsampled by taking the U/V samples of even rows.
pub struct YuyvToI420 {
    width: usize,
    height: usize,
    outbuf: Vec<u8>,
}

impl YuyvToI420 {
    pub fn open(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            bail!("YUYV conversion requires even dimensions, got {}x{}", width, height);
        }
        let w = width as usize;
        let h = height as usize;
        Ok(Self {
            width: w,
            height: h,
            outbuf: vec![0u8; w * h * 3 / 2],
        })
    }
}

impl Convert for YuyvToI420 {
    fn convert(&mut self, inbuf: &[u8]) -> Result<&[u8]> {
        let w = self.width;
        let h = self.height;
        if inbuf.len() < w * h * 2 {
            bail!(
                "YUYV frame too small: {} bytes, expected {}",
                inbuf.len(),
                w * h * 2
            );
        }

        let y_size = w * h;
        let uv_size = (w / 2) * (h / 2);
        let (y_plane, uv_planes) = self.outbuf.split_at_mut(y_size);
        let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

        for row in 0..h {
            for col in (0..w).step_by(2) {
                let off = (row * w + col) * 2;
                let y0 = inbuf[off];
                let u = inbuf[off + 1];
                let y1 = inbuf[off + 2];
                let v = inbuf[off + 3];

                y_plane[row * w + col] = y0;
                y_plane[row * w + col + 1] = y1;

                // 2x2 chroma subsampling: even rows carry U/V
                if row % 2 == 0 {
                    let uv_off = (row / 2) * (w / 2) + col / 2;
                    u_plane[uv_off] = u;
                    v_plane[uv_off] = v;
                }
            }
        }

        Ok(&self.outbuf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_odd_dimensions() {
        assert!(YuyvToI420::open(641, 480).is_err());
        assert!(YuyvToI420::open(640, 481).is_err());
        assert!(YuyvToI420::open(0, 480).is_err());
        assert!(YuyvToI420::open(640, 480).is_ok());
    }

    #[test]
    fn test_convert_rejects_short_frames() {
        let mut cvt = YuyvToI420::open(4, 2).unwrap();
        assert!(cvt.convert(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_convert_2x2_planes() {
        // One 2x2 block: pixels (Y0 U Y1 V) per pair, second row chroma dropped
        let mut cvt = YuyvToI420::open(2, 2).unwrap();
        let yuyv = [
            10, 90, 20, 190, // row 0: Y=10,20 U=90 V=190
            30, 91, 40, 191, // row 1: Y=30,40 (chroma ignored)
        ];
        let i420 = cvt.convert(&yuyv).unwrap();
        assert_eq!(i420, &[10, 20, 30, 40, 90, 190]);
    }

    #[test]
    fn test_convert_output_size() {
        let mut cvt = YuyvToI420::open(16, 8).unwrap();
        let frame = vec![0x80u8; 16 * 8 * 2];
        let out = cvt.convert(&frame).unwrap();
        assert_eq!(out.len(), 16 * 8 * 3 / 2);
    }
}
