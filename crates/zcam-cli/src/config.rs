use std::path::PathBuf;
use std::time::Duration;
use zcam_hw::{LineFrequency, SessionOptions, UsbOptions};

/// Runtime settings, loaded from environment variables.
pub struct Config {
    /// Bridge vendor ID (default: 0x0ac8).
    pub vendor_id: u16,
    /// Bridge product ID (default: 0x301b).
    pub product_id: u16,
    /// Skip sensor probing and use this profile.
    pub sensor: Option<String>,
    /// Bring the sensor up at its scaled-down resolution.
    pub scaled: bool,
    pub interface: u8,
    /// Alternate setting that enables the video endpoint.
    pub alt_setting: u8,
    pub video_endpoint: u8,
    /// Largest video packet read in one call.
    pub packet_size: usize,
    /// Timeout for control transfers and packet reads.
    pub timeout: Duration,
    /// Pause after each raw delay write in a bring-up program.
    pub settle: Duration,
    /// Period of the auto-gain loop.
    pub gain_interval: Duration,
    pub line_frequency: LineFrequency,
    /// Where captured frames go.
    pub output_dir: PathBuf,
}

impl Config {
    /// Load configuration from `ZCAM_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            vendor_id: env_hex_u16("ZCAM_VID", 0x0ac8),
            product_id: env_hex_u16("ZCAM_PID", 0x301b),
            sensor: std::env::var("ZCAM_SENSOR").ok().filter(|s| !s.is_empty()),
            scaled: std::env::var("ZCAM_SCALED")
                .map(|v| v != "0")
                .unwrap_or(false),
            interface: env_parse("ZCAM_INTERFACE", 0),
            alt_setting: env_parse("ZCAM_ALT_SETTING", 7),
            video_endpoint: env_hex_u16("ZCAM_VIDEO_ENDPOINT", 0x81) as u8,
            packet_size: env_parse("ZCAM_PACKET_SIZE", 1023),
            timeout: Duration::from_millis(env_parse("ZCAM_TIMEOUT_MS", 500)),
            settle: Duration::from_millis(env_parse("ZCAM_SETTLE_MS", 10)),
            gain_interval: Duration::from_millis(env_parse("ZCAM_GAIN_INTERVAL_MS", 250)),
            line_frequency: env_parse("ZCAM_LINE_FREQUENCY", LineFrequency::Hz50),
            output_dir: std::env::var("ZCAM_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("frames")),
        }
    }

    pub fn usb_options(&self) -> UsbOptions {
        UsbOptions {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            interface: self.interface,
            alt_setting: self.alt_setting,
            video_endpoint: self.video_endpoint,
            timeout: self.timeout,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            forced_sensor: self.sensor.clone(),
            scaled: self.scaled,
            settle: self.settle,
            line_frequency: self.line_frequency,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_hex_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_hex_u16(&v))
        .unwrap_or(default)
}

/// Accepts `0x0ac8`, `0ac8` or plain hex digits.
pub fn parse_hex_u16(s: &str) -> Option<u16> {
    let digits = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u16::from_str_radix(digits, 16).ok()
}
