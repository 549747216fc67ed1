//! Video frame capture behind a fixed contract.
//!
//! The pipeline only sees the `Capture` trait; the V4L2 backend (mmap
//! streaming via the `v4l` crate) lives behind the `video-capture` feature.

use anyhow::Result;

/// Pixel formats the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUV 4:2:2, what most USB cameras deliver.
    Yuyv,
    /// Planar I420, what the encoder consumes.
    Yuv420,
}

impl PixelFormat {
    /// Byte size of one frame at the given resolution.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuyv => pixels * 2,
            PixelFormat::Yuv420 => pixels * 3 / 2,
        }
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yuyv" => Ok(PixelFormat::Yuyv),
            "yuv420" | "i420" => Ok(PixelFormat::Yuv420),
            other => anyhow::bail!("unknown pixel format: {} (expected yuyv or yuv420)", other),
        }
    }
}

/// Result of polling the capture device for a frame.
pub enum PollFrame<'a> {
    /// A complete frame, valid until the next `get_frame` call.
    Ready(&'a [u8]),
    /// No frame available yet; retry after a short delay.
    Again,
}

/// Capture device contract consumed by the pipeline.
pub trait Capture {
    /// Start the capture stream. Must be called before `get_frame`.
    fn start(&mut self) -> Result<()>;

    /// Stop the capture stream.
    fn stop(&mut self);

    /// Poll for the next frame. `Err` is a fatal device failure.
    fn get_frame(&mut self) -> Result<PollFrame<'_>>;

    /// The format frames are delivered in.
    fn pixel_format(&self) -> PixelFormat;
}

#[cfg(feature = "video-capture")]
pub use v4l2::{CapParams, V4l2Capture};

#[cfg(feature = "video-capture")]
mod v4l2 {
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    use anyhow::{bail, Context, Result};
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture as V4lCapture;
    use v4l::{Device, FourCC};

    use super::{Capture, PixelFormat, PollFrame};

    /// Capture parameters, fixed at open.
    #[derive(Debug, Clone)]
    pub struct CapParams {
        pub device: String,
        pub width: u32,
        pub height: u32,
        pub pixfmt: PixelFormat,
        pub rate: u32,
    }

    /// V4L2 camera capture. The blocking mmap stream runs on a dedicated
    /// thread feeding a small bounded channel; `get_frame` polls it so the
    /// pipeline loop never blocks inside the device driver.
    pub struct V4l2Capture {
        params: CapParams,
        dev: Option<Device>,
        rx: Option<mpsc::Receiver<Vec<u8>>>,
        handle: Option<JoinHandle<()>>,
        frame: Vec<u8>,
    }

    fn fourcc(pixfmt: PixelFormat) -> FourCC {
        match pixfmt {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Yuv420 => FourCC::new(b"YU12"),
        }
    }

    impl V4l2Capture {
        /// Open the device and negotiate format and frame rate.
        pub fn open(params: CapParams) -> Result<Self> {
            let dev = Device::with_path(&params.device)
                .with_context(|| format!("Failed to open camera at {}", params.device))?;

            let mut fmt = dev.format().context("Failed to get camera format")?;
            fmt.width = params.width;
            fmt.height = params.height;
            fmt.fourcc = fourcc(params.pixfmt);

            let actual = dev
                .set_format(&fmt)
                .with_context(|| format!("Failed to set camera format {}", fmt.fourcc))?;
            if actual.fourcc != fmt.fourcc {
                bail!(
                    "camera does not support {} (driver offered {})",
                    fmt.fourcc,
                    actual.fourcc
                );
            }
            if actual.width != params.width || actual.height != params.height {
                bail!(
                    "camera does not support {}x{} (driver offered {}x{})",
                    params.width,
                    params.height,
                    actual.width,
                    actual.height
                );
            }

            if let Ok(mut stream_params) = dev.params() {
                stream_params.interval = v4l::Fraction::new(1, params.rate);
                let _ = dev.set_params(&stream_params);
            }

            tracing::info!(
                "Camera opened: {} {}x{} {} @ {}fps",
                params.device,
                params.width,
                params.height,
                fmt.fourcc,
                params.rate
            );

            Ok(Self {
                params,
                dev: Some(dev),
                rx: None,
                handle: None,
                frame: Vec::new(),
            })
        }
    }

    /// Capture loop body, runs on its own thread until the receiver is gone.
    fn capture_loop(dev: Device, tx: mpsc::SyncSender<Vec<u8>>) -> Result<()> {
        let mut stream = Stream::with_buffers(&dev, Type::VideoCapture, 4)
            .context("Failed to start V4L2 mmap stream")?;

        loop {
            let (buf, _meta) = stream.next().context("Failed to read camera frame")?;
            match tx.try_send(buf.to_vec()) {
                Ok(()) => {}
                // Consumer is behind: drop the frame, keep going
                Err(mpsc::TrySendError::Full(_)) => {}
                Err(mpsc::TrySendError::Disconnected(_)) => break,
            }
        }

        Ok(())
    }

    impl Capture for V4l2Capture {
        fn start(&mut self) -> Result<()> {
            let dev = match self.dev.take() {
                Some(dev) => dev,
                None => bail!("capture stream already started"),
            };

            let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(2);
            let handle = std::thread::spawn(move || {
                if let Err(e) = capture_loop(dev, tx) {
                    tracing::error!("Camera capture loop exited: {:#}", e);
                }
            });

            self.rx = Some(rx);
            self.handle = Some(handle);
            Ok(())
        }

        fn stop(&mut self) {
            // Dropping the receiver makes the capture thread bail out on its
            // next send attempt.
            self.rx = None;
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }

        fn get_frame(&mut self) -> Result<PollFrame<'_>> {
            let rx = match self.rx.as_ref() {
                Some(rx) => rx,
                None => bail!("capture stream not started"),
            };

            match rx.try_recv() {
                Ok(frame) => {
                    self.frame = frame;
                    Ok(PollFrame::Ready(&self.frame))
                }
                Err(mpsc::TryRecvError::Empty) => Ok(PollFrame::Again),
                Err(mpsc::TryRecvError::Disconnected) => bail!("capture thread exited"),
            }
        }

        fn pixel_format(&self) -> PixelFormat {
            self.params.pixfmt
        }
    }

    impl Drop for V4l2Capture {
        fn drop(&mut self) {
            self.stop();
        }
    }
}
