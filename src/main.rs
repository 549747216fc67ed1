//! camstream - live camera streaming over RTP
//!
//! Captures V4L2 frames, converts and encodes them to H.264, packetizes the
//! Annex-B stream into RTP and sends it over UDP or TCP. A stage mask cuts
//! the pipeline short at any boundary and dumps the intermediate output to a
//! file instead.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camstream::config::Config;
use camstream::stream;

#[derive(Parser)]
#[command(name = "camstream")]
#[command(about = "Live camera streaming over RTP/H.264", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming pipeline
    Stream {
        /// V4L2 device node
        #[arg(short, long)]
        device: Option<String>,

        /// Capture width in pixels
        #[arg(long)]
        width: Option<u32>,

        /// Capture height in pixels
        #[arg(long)]
        height: Option<u32>,

        /// Capture pixel format: yuyv or yuv420
        #[arg(long)]
        pixfmt: Option<String>,

        /// Target frame rate
        #[arg(long)]
        fps: Option<u32>,

        /// Encoder bitrate in kbit/s
        #[arg(short, long)]
        bitrate: Option<u32>,

        /// Group-of-pictures length in frames
        #[arg(long)]
        gop: Option<u32>,

        /// Stage mask: 0 capture, 1 +convert, 3 +encode, 7 +pack, 15 +network
        #[arg(short, long)]
        stage: Option<u8>,

        /// Maximum RTP payload size in bytes
        #[arg(long)]
        max_pkt_len: Option<usize>,

        /// Destination IP address (network stage)
        #[arg(short, long)]
        addr: Option<String>,

        /// Destination port (network stage)
        #[arg(short, long)]
        port: Option<u16>,

        /// Transport protocol: udp or tcp
        #[arg(long)]
        proto: Option<String>,

        /// Fixed RTP SSRC (random when omitted)
        #[arg(long)]
        ssrc: Option<u32>,

        /// Dump the output of the last enabled stage to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show or initialize the configuration file
    Config {
        /// Write a config file populated with the defaults
        #[arg(long)]
        init: bool,
    },
}

/// Stream settings after merging command-line flags over the config file.
#[cfg_attr(not(feature = "video-capture"), allow(dead_code))]
struct StreamSettings {
    device: String,
    width: u32,
    height: u32,
    pixfmt: stream::capture::PixelFormat,
    fps: u32,
    bitrate: u32,
    gop: u32,
    stage: stream::pipeline::StageMask,
    max_pkt_len: usize,
    addr: Option<String>,
    port: Option<u16>,
    proto: stream::net::Proto,
    ssrc: Option<u32>,
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Stream {
            device,
            width,
            height,
            pixfmt,
            fps,
            bitrate,
            gop,
            stage,
            max_pkt_len,
            addr,
            port,
            proto,
            ssrc,
            output,
        } => {
            let cfg = Config::load()?;
            let settings = StreamSettings {
                device: device.unwrap_or(cfg.device),
                width: width.unwrap_or(cfg.width),
                height: height.unwrap_or(cfg.height),
                pixfmt: pixfmt.unwrap_or(cfg.pixfmt).parse()?,
                fps: fps.unwrap_or(cfg.fps),
                bitrate: bitrate.unwrap_or(cfg.bitrate),
                gop: gop.unwrap_or(cfg.gop),
                stage: stream::pipeline::StageMask::new(stage.unwrap_or(cfg.stage))?,
                max_pkt_len: max_pkt_len.unwrap_or(cfg.max_pkt_len),
                addr: addr.or(cfg.addr),
                port: port.or(cfg.port),
                proto: proto.unwrap_or(cfg.proto).parse()?,
                ssrc: ssrc.or(cfg.ssrc),
                output,
            };
            run_stream(settings)?;
        }
        Commands::Config { init } => {
            if init {
                let cfg = Config::default();
                cfg.save()?;
                println!("Wrote {}", Config::config_path()?.display());
            } else {
                let cfg = Config::load()?;
                println!("# {}", Config::config_path()?.display());
                print!("{}", toml::to_string_pretty(&cfg)?);
            }
        }
    }

    Ok(())
}

#[cfg(feature = "video-capture")]
fn run_stream(settings: StreamSettings) -> Result<()> {
    use anyhow::Context;
    use std::fs::File;
    use std::io::BufWriter;

    use camstream::stream::capture::{CapParams, Capture, PixelFormat, V4l2Capture};
    use camstream::stream::convert::YuyvToI420;
    use camstream::stream::encode::{EncParams, OpenH264Encoder};
    use camstream::stream::net::NetSink;
    use camstream::stream::packetizer::{PackParams, Packetizer};
    use camstream::stream::pipeline::{CancelToken, Pipeline};
    use camstream::stream::rtp;

    let mask = settings.stage;

    let capture = V4l2Capture::open(CapParams {
        device: settings.device.clone(),
        width: settings.width,
        height: settings.height,
        pixfmt: settings.pixfmt,
        rate: settings.fps,
    })
    .with_context(|| format!("Failed to open capture device {}", settings.device))?;

    // The convert stage is a no-op when the camera already delivers I420
    let skip_convert = capture.pixel_format() == PixelFormat::Yuv420;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Interrupted, shutting down");
            cancel.cancel();
        })
        .context("Failed to install signal handler")?;
    }

    let mut pipeline = Pipeline::new(mask, Box::new(capture), cancel).skip_convert(skip_convert);

    if mask.convert() && !skip_convert {
        let converter = YuyvToI420::open(settings.width, settings.height)?;
        pipeline = pipeline.with_converter(Box::new(converter));
    }

    if mask.encode() {
        let encoder = OpenH264Encoder::open(EncParams {
            width: settings.width,
            height: settings.height,
            fps: settings.fps,
            bitrate_kbps: settings.bitrate,
            gop: settings.gop,
        })
        .context("Failed to open H.264 encoder")?;
        pipeline = pipeline.with_encoder(Box::new(encoder));
    }

    if mask.pack() {
        let ssrc = settings.ssrc.unwrap_or_else(rtp::generate_ssrc);
        tracing::info!(ssrc, "RTP session");
        let packetizer = Packetizer::open(PackParams {
            max_pkt_len: settings.max_pkt_len,
            ssrc,
        })?;
        pipeline = pipeline.with_packetizer(packetizer);
    }

    if mask.network() {
        let addr = settings
            .addr
            .context("network stage enabled but no address given (use --addr)")?;
        let port = settings
            .port
            .context("network stage enabled but no port given (use --port)")?;
        let net = NetSink::open(settings.proto, &addr, port)
            .with_context(|| format!("Failed to open transport to {}:{}", addr, port))?;
        tracing::info!("Streaming to {}:{}", addr, port);
        pipeline = pipeline.with_transport(Box::new(net));
    }

    if let Some(path) = &settings.output {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        pipeline = pipeline.with_dump(Box::new(BufWriter::new(file)));
    }

    tracing::info!(
        stage = mask.bits(),
        "{}x{} @ {} fps, {} kbps",
        settings.width,
        settings.height,
        settings.fps,
        settings.bitrate
    );
    pipeline.run()
}

#[cfg(not(feature = "video-capture"))]
fn run_stream(_settings: StreamSettings) -> Result<()> {
    anyhow::bail!(
        "camstream was compiled without the video-capture feature; \
         rebuild with --features video-capture"
    )
}
