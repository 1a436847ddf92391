//! Sensor profile database.
//!
//! Every image sensor behind the bridge needs its own bring-up programs,
//! register addresses and tuning tables. Profiles are TOML files embedded
//! at compile time from `contrib/sensors/*.toml` and parsed once.

use crate::gain::{GainConfig, GainError, SharpnessTable};
use crate::jpeg::{self, HeaderParams, JpegError, QuantTables, Subsampling};
use crate::program::BringUpProgram;
use serde::Deserialize;
use std::sync::OnceLock;
use thiserror::Error;

const PROFILE_HV7131R: &str = include_str!("../../../contrib/sensors/hv7131r.toml");
const PROFILE_PAS202B: &str = include_str!("../../../contrib/sensors/pas202b.toml");

static PROFILE_DB: OnceLock<Vec<SensorProfile>> = OnceLock::new();

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("bad profile TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("profile '{name}': {source}")]
    Gain {
        name: String,
        #[source]
        source: GainError,
    },
    #[error("profile '{name}': {source}")]
    Jpeg {
        name: String,
        #[source]
        source: JpegError,
    },
    #[error("unknown sensor '{0}'")]
    UnknownSensor(String),
}

/// One sensor profile (one `contrib/sensors/*.toml` file).
#[derive(Debug, Clone, Deserialize)]
pub struct SensorProfile {
    pub sensor: SensorInfo,
    pub probe: Option<ProbeInfo>,
    pub stream: StreamInfo,
    pub registers: ControlRegisters,
    pub gain: GainConfig,
    pub sharpness: Option<SharpnessTable>,
    pub programs: Programs,
}

/// `[sensor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Sensor-bus register that identifies the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ProbeInfo {
    pub addr: u8,
    pub expect: u8,
}

fn default_quality() -> u8 {
    50
}

/// `[stream]` section: frame geometry and JPEG header handling.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    pub width: u16,
    pub height: u16,
    /// Scaled-down geometry used with the `init_scaled` program.
    pub scaled_width: Option<u16>,
    pub scaled_height: Option<u16>,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub subsampling: Subsampling,
    /// False when the hardware omits the tables and a header must be injected.
    #[serde(default)]
    pub hardware_header_complete: bool,
    /// 128 bytes, luma then chroma, natural order. Standard tables if absent.
    pub quant_table: Option<QuantTables>,
    pub max_frame_len: Option<usize>,
}

/// Bridge registers behind single-write controls.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ControlRegisters {
    pub brightness: u16,
    pub contrast: u16,
    pub gamma: u16,
    pub sharpness: u16,
    /// Hardware luminance accumulator, read by the gain loop.
    pub luminance: u16,
}

/// `[programs.*]` sections.
#[derive(Debug, Clone, Deserialize)]
pub struct Programs {
    pub init: BringUpProgram,
    pub init_scaled: Option<BringUpProgram>,
    pub light_50hz: BringUpProgram,
    pub light_60hz: BringUpProgram,
    pub light_none: BringUpProgram,
}

/// Which program of a profile to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramVariant {
    Init,
    InitScaled,
    Light50Hz,
    Light60Hz,
    LightNone,
}

impl ProgramVariant {
    pub const ALL: [ProgramVariant; 5] = [
        ProgramVariant::Init,
        ProgramVariant::InitScaled,
        ProgramVariant::Light50Hz,
        ProgramVariant::Light60Hz,
        ProgramVariant::LightNone,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ProgramVariant::Init => "init",
            ProgramVariant::InitScaled => "init_scaled",
            ProgramVariant::Light50Hz => "light_50hz",
            ProgramVariant::Light60Hz => "light_60hz",
            ProgramVariant::LightNone => "light_none",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.key() == key)
    }
}

impl SensorProfile {
    pub fn name(&self) -> &str {
        &self.sensor.name
    }

    pub fn program(&self, variant: ProgramVariant) -> Option<&BringUpProgram> {
        match variant {
            ProgramVariant::Init => Some(&self.programs.init),
            ProgramVariant::InitScaled => self.programs.init_scaled.as_ref(),
            ProgramVariant::Light50Hz => Some(&self.programs.light_50hz),
            ProgramVariant::Light60Hz => Some(&self.programs.light_60hz),
            ProgramVariant::LightNone => Some(&self.programs.light_none),
        }
    }

    /// Frame geometry for the full or scaled bring-up.
    pub fn dimensions(&self, scaled: bool) -> (u16, u16) {
        match (scaled, self.stream.scaled_width, self.stream.scaled_height) {
            (true, Some(w), Some(h)) => (w, h),
            _ => (self.stream.width, self.stream.height),
        }
    }

    /// The header to inject in front of every frame, if the hardware's is incomplete.
    pub fn synthetic_header(&self, scaled: bool) -> Result<Option<Vec<u8>>, JpegError> {
        if self.stream.hardware_header_complete {
            return Ok(None);
        }
        let (width, height) = self.dimensions(scaled);
        let params = HeaderParams {
            width,
            height,
            quality: self.stream.quality,
            subsampling: self.stream.subsampling,
            quant: self.stream.quant_table.clone().unwrap_or_default(),
        };
        jpeg::build_header(&params).map(Some)
    }
}

/// Parse and validate one profile.
pub fn parse_profile(src: &str) -> Result<SensorProfile, ProfileError> {
    let mut profile: SensorProfile = toml::from_str(src)?;
    let name = profile.sensor.name.clone();

    profile.gain.validate().map_err(|source| ProfileError::Gain {
        name: name.clone(),
        source,
    })?;
    if profile.sharpness.as_ref().is_some_and(|s| s.values.is_empty()) {
        return Err(ProfileError::Gain {
            name,
            source: GainError::EmptySharpness,
        });
    }
    // Fail at load time rather than at stream start.
    profile.synthetic_header(false).map_err(|source| ProfileError::Jpeg {
        name: name.clone(),
        source,
    })?;

    for variant in ProgramVariant::ALL {
        let program = match variant {
            ProgramVariant::Init => Some(&mut profile.programs.init),
            ProgramVariant::InitScaled => profile.programs.init_scaled.as_mut(),
            ProgramVariant::Light50Hz => Some(&mut profile.programs.light_50hz),
            ProgramVariant::Light60Hz => Some(&mut profile.programs.light_60hz),
            ProgramVariant::LightNone => Some(&mut profile.programs.light_none),
        };
        if let Some(program) = program {
            if program.name.is_empty() {
                program.name = format!("{name}/{}", variant.key());
            }
        }
    }
    Ok(profile)
}

fn profile_db() -> &'static Vec<SensorProfile> {
    PROFILE_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [PROFILE_HV7131R, PROFILE_PAS202B] {
            match parse_profile(src) {
                Ok(p) => db.push(p),
                Err(e) => tracing::error!(error = %e, "skipping bad sensor profile"),
            }
        }
        db
    })
}

/// Look up a profile by sensor name (case-insensitive).
pub fn lookup_profile(name: &str) -> Result<&'static SensorProfile, ProfileError> {
    profile_db()
        .iter()
        .find(|p| p.sensor.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| ProfileError::UnknownSensor(name.to_string()))
}

/// List all embedded profiles.
pub fn list_profiles() -> &'static [SensorProfile] {
    profile_db()
}
