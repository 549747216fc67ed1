//! Live camera streaming: V4L2 capture, YUYV-to-I420 conversion, H.264
//! encoding, RTP packetization and UDP/TCP transmission, glued together by
//! a single-threaded [`pipeline::Pipeline`].

pub mod capture;
pub mod clock;
pub mod convert;
pub mod encode;
pub mod nalu;
pub mod net;
pub mod packetizer;
pub mod pipeline;
pub mod rtp;
