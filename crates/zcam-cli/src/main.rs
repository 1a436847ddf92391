use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use zcam_hw::frame::SyncStats;
use zcam_hw::profile::{self, ProgramVariant};
use zcam_hw::transport::ReplaySource;
use zcam_hw::usb::{self, UsbVideoReader};
use zcam_hw::{
    Frame, FrameSynchronizer, LineFrequency, PacketSource, Session, TransportError, UsbTransport,
};

mod config;

use config::{parse_hex_u16, Config};

#[derive(Parser)]
#[command(name = "zcam", about = "USB JPEG camera bridge diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DeviceArgs {
    /// Vendor ID in hex (overrides ZCAM_VID)
    #[arg(long, value_parser = hex_id)]
    vid: Option<u16>,
    /// Product ID in hex (overrides ZCAM_PID)
    #[arg(long, value_parser = hex_id)]
    pid: Option<u16>,
    /// Use this sensor profile instead of probing
    #[arg(long)]
    sensor: Option<String>,
    /// Bring the sensor up at its scaled-down resolution
    #[arg(long)]
    scaled: bool,
    /// Power-line frequency: 0, 50 or 60
    #[arg(long)]
    line_frequency: Option<LineFrequency>,
}

impl DeviceArgs {
    fn apply(self, config: &mut Config) {
        if let Some(vid) = self.vid {
            config.vendor_id = vid;
        }
        if let Some(pid) = self.pid {
            config.product_id = pid;
        }
        if self.sensor.is_some() {
            config.sensor = self.sensor;
        }
        config.scaled |= self.scaled;
        if let Some(freq) = self.line_frequency {
            config.line_frequency = freq;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in sensor profiles
    Sensors,
    /// List attached bridge devices
    Devices {
        /// Vendor ID in hex
        #[arg(long, value_parser = hex_id)]
        vid: Option<u16>,
        /// Product ID in hex
        #[arg(long, value_parser = hex_id)]
        pid: Option<u16>,
    },
    /// Print a sensor's bring-up program
    Program {
        /// Sensor name, e.g. "hv7131r"
        sensor: String,
        /// init, init_scaled, light_50hz, light_60hz or light_none
        variant: String,
    },
    /// Bring a device up, apply controls and print its state
    Status {
        #[command(flatten)]
        device: DeviceArgs,
        #[arg(long)]
        brightness: Option<u8>,
        #[arg(long)]
        contrast: Option<u8>,
        #[arg(long)]
        gamma: Option<u8>,
        #[arg(long)]
        sharpness: Option<u8>,
        /// Turn the auto-gain loop off
        #[arg(long)]
        no_auto_gain: bool,
    },
    /// Capture frames from a device
    Capture {
        #[command(flatten)]
        device: DeviceArgs,
        /// Number of frames to write
        #[arg(short = 'n', long, default_value_t = 10)]
        frames: usize,
        /// Output directory (overrides ZCAM_OUTPUT_DIR)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Cut a recorded packet dump into frames
    Replay {
        /// Raw concatenation of fixed-size packets
        dump: PathBuf,
        /// Packet size of the dump (overrides ZCAM_PACKET_SIZE)
        #[arg(long)]
        packet_size: Option<usize>,
        /// Inject this sensor's synthetic header
        #[arg(long)]
        sensor: Option<String>,
        /// Use the sensor's scaled geometry for the header
        #[arg(long)]
        scaled: bool,
        /// Output directory (overrides ZCAM_OUTPUT_DIR)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn hex_id(s: &str) -> Result<u16, String> {
    parse_hex_u16(s).ok_or_else(|| format!("'{s}' is not a 16-bit hex ID"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command {
        Commands::Sensors => list_sensors()?,
        Commands::Devices { vid, pid } => {
            let vid = vid.unwrap_or(config.vendor_id);
            let devices = usb::list_devices(vid, pid)?;
            if devices.is_empty() {
                println!("no devices with vendor ID {vid:04x}");
            }
            for d in devices {
                println!(
                    "bus {:03} address {:03} id {:04x}:{:04x}",
                    d.bus, d.address, d.vendor_id, d.product_id
                );
            }
        }
        Commands::Program { sensor, variant } => {
            let profile = profile::lookup_profile(&sensor)?;
            let Some(key) = ProgramVariant::from_key(&variant) else {
                let keys: Vec<_> = ProgramVariant::ALL.iter().map(|v| v.key()).collect();
                bail!("unknown program '{variant}' (expected one of {})", keys.join(", "));
            };
            let Some(program) = profile.program(key) else {
                bail!("sensor {} has no {} program", profile.name(), key.key());
            };
            println!("{}", serde_json::to_string_pretty(program)?);
        }
        Commands::Status {
            device,
            brightness,
            contrast,
            gamma,
            sharpness,
            no_auto_gain,
        } => {
            device.apply(&mut config);
            let (session, reader) = open_session(&config).await?;
            drop(reader);
            if let Some(v) = brightness {
                session.set_brightness(v)?;
            }
            if let Some(v) = contrast {
                session.set_contrast(v)?;
            }
            if let Some(v) = gamma {
                session.set_gamma(v)?;
            }
            if let Some(v) = sharpness {
                session.set_sharpness(v)?;
            }
            if no_auto_gain {
                session.set_auto_gain(false);
            }
            let status = serde_json::json!({
                "state": session.state(),
                "gains": session.gains(),
                "luminance": session.read_luminance()?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Capture { device, frames, out } => {
            device.apply(&mut config);
            if let Some(out) = out {
                config.output_dir = out;
            }
            capture(&config, frames).await?;
        }
        Commands::Replay {
            dump,
            packet_size,
            sensor,
            scaled,
            out,
        } => {
            if let Some(size) = packet_size {
                config.packet_size = size;
            }
            if let Some(out) = out {
                config.output_dir = out;
            }
            replay(&config, &dump, sensor.as_deref(), scaled).await?;
        }
    }

    Ok(())
}

fn list_sensors() -> Result<()> {
    let sensors: Vec<_> = profile::list_profiles()
        .iter()
        .map(|p| {
            let programs: Vec<_> = ProgramVariant::ALL
                .into_iter()
                .filter(|v| p.program(*v).is_some())
                .map(|v| v.key())
                .collect();
            serde_json::json!({
                "name": p.name(),
                "description": p.sensor.description,
                "dimensions": p.dimensions(false),
                "scaled_dimensions": p.dimensions(true),
                "header_complete": p.stream.hardware_header_complete,
                "programs": programs,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&sensors)?);
    Ok(())
}

/// Open the bridge and bring the sensor up off the async runtime.
async fn open_session(config: &Config) -> Result<(Arc<Session<UsbTransport>>, UsbVideoReader)> {
    let usb = config.usb_options();
    let options = config.session_options();
    tokio::task::spawn_blocking(move || -> Result<_> {
        let transport = UsbTransport::open(usb).context("opening bridge")?;
        let reader = transport.video_reader();
        let session = Session::open(transport, options)?;
        Ok((Arc::new(session), reader))
    })
    .await?
}

#[derive(Default)]
struct Written {
    frames: usize,
    undecodable: usize,
}

impl Written {
    /// Write one frame and check that it decodes.
    async fn save(&mut self, dir: &Path, frame: &Frame) -> Result<()> {
        let path = dir.join(format!("frame-{:05}.jpg", frame.sequence));
        tokio::fs::write(&path, &frame.data)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        self.frames += 1;

        if let Err(e) = image::load_from_memory_with_format(&frame.data, image::ImageFormat::Jpeg)
        {
            self.undecodable += 1;
            tracing::warn!(
                seq = frame.sequence,
                len = frame.data.len(),
                eoi = frame.has_eoi(),
                error = %e,
                "frame does not decode"
            );
        }
        Ok(())
    }

    fn report(&self, stats: SyncStats, dir: &Path) -> Result<()> {
        let summary = serde_json::json!({
            "written": self.frames,
            "undecodable": self.undecodable,
            "frames_seen": stats.frames,
            "skipped_bytes": stats.skipped_bytes,
            "oversized": stats.oversized,
            "output_dir": dir.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }
}

async fn capture(config: &Config, count: usize) -> Result<()> {
    let (session, reader) = open_session(config).await?;
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("creating {}", config.output_dir.display()))?;

    let sync = session.start_stream()?;
    let (tx, mut rx) = mpsc::channel::<Frame>(4);
    let stop = Arc::new(AtomicBool::new(false));
    let reader_task = tokio::task::spawn_blocking({
        let stop = Arc::clone(&stop);
        let packet_size = config.packet_size;
        move || read_frames(reader, sync, packet_size, &stop, tx)
    });

    let mut gain_timer = tokio::time::interval(config.gain_interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut written = Written::default();
    while written.frames < count {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    tracing::warn!("video stream ended early");
                    break;
                };
                written.save(&config.output_dir, &frame).await?;
            }
            _ = gain_timer.tick() => {
                let session = Arc::clone(&session);
                match tokio::task::spawn_blocking(move || session.auto_gain_step()).await? {
                    Ok(true) => tracing::debug!("gains updated"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "gain step failed"),
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    drop(rx);
    let stats = reader_task.await??;
    written.report(stats, &config.output_dir)
}

/// Blocking packet loop. Stops on `stop`, end of stream, or when the receiver goes away.
fn read_frames(
    mut source: impl PacketSource,
    mut sync: FrameSynchronizer,
    packet_size: usize,
    stop: &AtomicBool,
    tx: mpsc::Sender<Frame>,
) -> Result<SyncStats, TransportError> {
    let mut buf = vec![0u8; packet_size.max(1)];
    while !stop.load(Ordering::Relaxed) {
        let Some(n) = source.read_packet(&mut buf)? else {
            break;
        };
        for frame in sync.push(&buf[..n]) {
            if tx.blocking_send(frame).is_err() {
                return Ok(sync.stats());
            }
        }
    }
    let stats = sync.stats();
    if let Some(frame) = sync.finish() {
        let _ = tx.blocking_send(frame);
    }
    Ok(stats)
}

async fn replay(config: &Config, dump: &Path, sensor: Option<&str>, scaled: bool) -> Result<()> {
    let mut sync = match sensor {
        Some(name) => {
            let profile = profile::lookup_profile(name)?;
            let sync = FrameSynchronizer::new(profile.synthetic_header(scaled)?);
            match profile.stream.max_frame_len {
                Some(max) => sync.with_max_frame_len(max),
                None => sync,
            }
        }
        None => FrameSynchronizer::new(None),
    };

    let file = std::fs::File::open(dump).with_context(|| format!("opening {}", dump.display()))?;
    let mut source = ReplaySource::new(std::io::BufReader::new(file), config.packet_size);
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("creating {}", config.output_dir.display()))?;

    let mut written = Written::default();
    let mut buf = vec![0u8; config.packet_size.max(1)];
    while let Some(n) = source.read_packet(&mut buf)? {
        for frame in sync.push(&buf[..n]) {
            written.save(&config.output_dir, &frame).await?;
        }
    }
    let stats = sync.stats();
    if let Some(frame) = sync.finish() {
        written.save(&config.output_dir, &frame).await?;
    }
    written.report(stats, &config.output_dir)
}
