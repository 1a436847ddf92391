//! Device session: sensor selection, bring-up, controls and the gain loop.
//!
//! A session owns the transport behind a mutex. Every program, including
//! the gain loop's register writes, runs with that lock held, so a tick
//! can never land in the middle of a bring-up or retuning program.

use crate::frame::FrameSynchronizer;
use crate::gain::{GainController, GainError};
use crate::interpreter::{BringUpFault, Interpreter};
use crate::jpeg::JpegError;
use crate::profile::{self, ProfileError, ProgramVariant, SensorProfile};
use crate::program::{BringUpProgram, RegisterOp};
use crate::sensor_bus::{BusFault, SensorBus};
use crate::transport::{Transport, TransportError};
use serde::Serialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BRIGHTNESS: u8 = 0x80;
const DEFAULT_CONTRAST: u8 = 0x80;
const DEFAULT_GAMMA: u8 = 0x04;
const DEFAULT_SHARPNESS: u8 = 0x02;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("bring-up failed: {0}")]
    BringUp(#[from] BringUpFault),
    #[error(transparent)]
    Bus(#[from] BusFault),
    #[error("control transfer failed: {0}")]
    Io(#[from] TransportError),
    #[error("header synthesis failed: {0}")]
    Jpeg(#[from] JpegError),
    #[error(transparent)]
    Gain(#[from] GainError),
    #[error("no known sensor answered the probe")]
    NoSensorDetected,
    #[error("a program failed; bring the device up again first")]
    Faulted,
}

/// Power-line flicker filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineFrequency {
    Disabled,
    #[default]
    Hz50,
    Hz60,
}

impl LineFrequency {
    fn variant(self) -> ProgramVariant {
        match self {
            LineFrequency::Disabled => ProgramVariant::LightNone,
            LineFrequency::Hz50 => ProgramVariant::Light50Hz,
            LineFrequency::Hz60 => ProgramVariant::Light60Hz,
        }
    }
}

impl FromStr for LineFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "none" | "disabled" | "off" => Ok(LineFrequency::Disabled),
            "50" | "50hz" => Ok(LineFrequency::Hz50),
            "60" | "60hz" => Ok(LineFrequency::Hz60),
            other => Err(format!("unknown line frequency '{other}' (expected 0, 50 or 60)")),
        }
    }
}

impl std::fmt::Display for LineFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineFrequency::Disabled => f.write_str("disabled"),
            LineFrequency::Hz50 => f.write_str("50Hz"),
            LineFrequency::Hz60 => f.write_str("60Hz"),
        }
    }
}

/// How to bring a device up.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Skip probing and use this sensor profile.
    pub forced_sensor: Option<String>,
    /// Use the resolution-scaled bring-up, if the sensor has one.
    pub scaled: bool,
    /// Pause after each raw delay write.
    pub settle: Duration,
    pub line_frequency: LineFrequency,
}

/// User-visible settings of an open device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub sensor: String,
    pub brightness: u8,
    pub contrast: u8,
    pub gamma: u8,
    pub sharpness: u8,
    pub auto_gain: bool,
    pub line_frequency: LineFrequency,
    pub scaled: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Find the first profile whose probe register answers as expected.
pub fn detect_sensor<'p, T: Transport + ?Sized>(
    transport: &mut T,
    profiles: &'p [SensorProfile],
) -> Result<&'p SensorProfile, SessionError> {
    for profile in profiles {
        let Some(probe) = profile.probe else {
            continue;
        };
        let id = SensorBus::new(&mut *transport).read_indirect(probe.addr)?;
        tracing::debug!(sensor = profile.name(), addr = probe.addr, id, "probe");
        if id == probe.expect {
            return Ok(profile);
        }
    }
    Err(SessionError::NoSensorDetected)
}

pub struct Session<T: Transport> {
    transport: Mutex<T>,
    profile: SensorProfile,
    state: Mutex<DeviceState>,
    gain: Mutex<GainController>,
    settle: Duration,
    faulted: AtomicBool,
}

impl<T: Transport> Session<T> {
    /// Pick the sensor (forced or probed) from the embedded profiles and bring it up.
    pub fn open(mut transport: T, options: SessionOptions) -> Result<Self, SessionError> {
        let profile = match &options.forced_sensor {
            Some(name) => {
                tracing::info!(sensor = %name, "using forced sensor");
                profile::lookup_profile(name)?
            }
            None => detect_sensor(&mut transport, profile::list_profiles())?,
        };
        Self::with_profile(transport, profile.clone(), options)
    }

    /// Bring up a device with a known profile.
    pub fn with_profile(
        transport: T,
        profile: SensorProfile,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let gain = GainController::new(profile.gain.clone(), profile.sharpness.clone())?;
        let scaled = options.scaled && profile.programs.init_scaled.is_some();
        let state = DeviceState {
            sensor: profile.name().to_string(),
            brightness: DEFAULT_BRIGHTNESS,
            contrast: DEFAULT_CONTRAST,
            gamma: DEFAULT_GAMMA,
            sharpness: DEFAULT_SHARPNESS,
            auto_gain: true,
            line_frequency: options.line_frequency,
            scaled,
        };
        let session = Self {
            transport: Mutex::new(transport),
            profile,
            state: Mutex::new(state),
            gain: Mutex::new(gain),
            settle: options.settle,
            faulted: AtomicBool::new(false),
        };
        session.bring_up()?;
        Ok(session)
    }

    /// Run the full bring-up: init, flicker tuning, controls, gains.
    ///
    /// Also the way to recover after a failed program.
    pub fn bring_up(&self) -> Result<(), SessionError> {
        let state = lock(&self.state).clone();
        let init = if state.scaled {
            ProgramVariant::InitScaled
        } else {
            ProgramVariant::Init
        };
        let regs = self.profile.registers;
        let controls = BringUpProgram::new(
            format!("{}/controls", self.profile.name()),
            vec![
                RegisterOp::DirectWrite { value: state.brightness, index: regs.brightness },
                RegisterOp::DirectWrite { value: state.contrast, index: regs.contrast },
                RegisterOp::DirectWrite { value: state.gamma, index: regs.gamma },
                RegisterOp::DirectWrite { value: state.sharpness, index: regs.sharpness },
            ],
        );
        let gains = lock(&self.gain).writes();

        // One lock for the whole sequence.
        let mut transport = lock(&self.transport);
        let mut interp = Interpreter::new(&mut *transport).with_settle(self.settle);
        let programs = [init, state.line_frequency.variant()]
            .into_iter()
            .filter_map(|v| self.profile.program(v))
            .chain([&controls, &gains]);
        for program in programs {
            if let Err(fault) = interp.run(program) {
                self.faulted.store(true, Ordering::SeqCst);
                return Err(fault.into());
            }
        }
        self.faulted.store(false, Ordering::SeqCst);

        tracing::info!(
            sensor = self.profile.name(),
            scaled = state.scaled,
            line_frequency = %state.line_frequency,
            "sensor up"
        );
        Ok(())
    }

    pub fn profile(&self) -> &SensorProfile {
        &self.profile
    }

    /// Snapshot of the current settings.
    pub fn state(&self) -> DeviceState {
        lock(&self.state).clone()
    }

    /// True after a program failed, until the next successful [`bring_up`](Self::bring_up).
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Run a program atomically with respect to every other register write.
    ///
    /// A failure leaves the session faulted.
    pub fn run(&self, program: &BringUpProgram) -> Result<(), BringUpFault> {
        let mut transport = lock(&self.transport);
        let result = Interpreter::new(&mut *transport)
            .with_settle(self.settle)
            .run(program);
        if result.is_err() {
            self.faulted.store(true, Ordering::SeqCst);
        }
        result
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.is_faulted() {
            return Err(SessionError::Faulted);
        }
        Ok(())
    }

    /// Fresh frame assembly state for a new stream.
    pub fn start_stream(&self) -> Result<FrameSynchronizer, SessionError> {
        self.ensure_ready()?;
        let scaled = lock(&self.state).scaled;
        let header = self.profile.synthetic_header(scaled)?;
        let mut sync = FrameSynchronizer::new(header);
        if let Some(max) = self.profile.stream.max_frame_len {
            sync = sync.with_max_frame_len(max);
        }
        Ok(sync)
    }

    /// Read the hardware luminance accumulator.
    pub fn read_luminance(&self) -> Result<u32, TransportError> {
        let index = self.profile.registers.luminance;
        lock(&self.transport).control_read(index).map(u32::from)
    }

    /// Feed one luminance sample to the gain loop. Returns whether gains changed.
    pub fn tick(&self, luminance: u32) -> Result<bool, SessionError> {
        self.ensure_ready()?;
        let mut gain = lock(&self.gain);
        match gain.tick(luminance) {
            Some(program) => {
                self.run(&program)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sample the accumulator and tick, if auto-gain is on.
    pub fn auto_gain_step(&self) -> Result<bool, SessionError> {
        if !lock(&self.gain).enabled() {
            return Ok(false);
        }
        let luminance = self.read_luminance()?;
        self.tick(luminance)
    }

    pub fn gains(&self) -> [u8; 3] {
        lock(&self.gain).gains()
    }

    pub fn set_brightness(&self, value: u8) -> Result<(), SessionError> {
        self.set_control(value, self.profile.registers.brightness, |s| &mut s.brightness)
    }

    pub fn set_contrast(&self, value: u8) -> Result<(), SessionError> {
        self.set_control(value, self.profile.registers.contrast, |s| &mut s.contrast)
    }

    pub fn set_gamma(&self, value: u8) -> Result<(), SessionError> {
        self.set_control(value, self.profile.registers.gamma, |s| &mut s.gamma)
    }

    pub fn set_sharpness(&self, value: u8) -> Result<(), SessionError> {
        self.set_control(value, self.profile.registers.sharpness, |s| &mut s.sharpness)
    }

    pub fn set_auto_gain(&self, enabled: bool) {
        lock(&self.gain).set_enabled(enabled);
        lock(&self.state).auto_gain = enabled;
        tracing::debug!(enabled, "auto gain");
    }

    /// Switch flicker filtering by running the matching tuning program.
    pub fn set_line_frequency(&self, freq: LineFrequency) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let mut state = lock(&self.state);
        if state.line_frequency == freq {
            return Ok(());
        }
        if let Some(program) = self.profile.program(freq.variant()) {
            self.run(program)?;
        }
        state.line_frequency = freq;
        tracing::debug!(line_frequency = %freq, "line frequency");
        Ok(())
    }

    /// Give the transport back, e.g. to inspect a test double.
    pub fn into_transport(self) -> T {
        self.transport
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_control(
        &self,
        value: u8,
        index: u16,
        field: impl Fn(&mut DeviceState) -> &mut u8,
    ) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let mut state = lock(&self.state);
        let slot = field(&mut *state);
        if *slot == value {
            return Ok(());
        }
        let program = BringUpProgram::new(
            "control",
            vec![RegisterOp::DirectWrite { value, index }],
        );
        self.run(&program)?;
        *slot = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::parse_profile;
    use crate::sensor_bus::BUS_READ_DATA_REG;
    use crate::transport::mock::{RecordingTransport, Transfer};
    use crate::transport::RequestKind;
    use std::sync::Arc;

    const PROFILE: &str = r#"
        [sensor]
        name = "mock"

        [probe]
        addr = 0x00
        expect = 0x42

        [stream]
        width = 320
        height = 240
        scaled_width = 160
        scaled_height = 120

        [registers]
        brightness = 0x0101
        contrast = 0x0102
        gamma = 0x0103
        sharpness = 0x0104
        luminance = 0x0105

        [gain]
        min = 0x10
        max = 0x20
        step = 2
        target = 100
        registers = [0x0118, 0x0119, 0x011a]
        initial = 0x18

        [programs.init]
        ops = [{ op = "direct_write", value = 0x01, index = 0x0000 }]

        [programs.init_scaled]
        ops = [{ op = "direct_write", value = 0x02, index = 0x0000 }]

        [programs.light_50hz]
        ops = [{ op = "direct_write", value = 0x50, index = 0x0190 }]

        [programs.light_60hz]
        ops = [{ op = "direct_write", value = 0x60, index = 0x0190 }]

        [programs.light_none]
        ops = [{ op = "direct_write", value = 0x00, index = 0x0190 }]
    "#;

    fn profile() -> SensorProfile {
        parse_profile(PROFILE).unwrap()
    }

    fn open() -> Session<RecordingTransport> {
        Session::with_profile(RecordingTransport::new(), profile(), SessionOptions::default())
            .unwrap()
    }

    fn writes_to(log: &[Transfer], index: u16) -> Vec<u8> {
        log.iter()
            .filter_map(|t| match *t {
                Transfer::Write { value, index: i, .. } if i == index => Some(value),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_bring_up_sequence() {
        let log = open().into_transport().take_log();
        assert_eq!(
            log,
            vec![
                Transfer::direct(0x01, 0x0000),
                Transfer::direct(0x50, 0x0190),
                Transfer::direct(DEFAULT_BRIGHTNESS, 0x0101),
                Transfer::direct(DEFAULT_CONTRAST, 0x0102),
                Transfer::direct(DEFAULT_GAMMA, 0x0103),
                Transfer::direct(DEFAULT_SHARPNESS, 0x0104),
                Transfer::direct(0x18, 0x0118),
                Transfer::direct(0x18, 0x0119),
                Transfer::direct(0x18, 0x011a),
            ]
        );
    }

    #[test]
    fn test_scaled_bring_up_uses_scaled_program() {
        let options = SessionOptions {
            scaled: true,
            line_frequency: LineFrequency::Hz60,
            ..Default::default()
        };
        let session =
            Session::with_profile(RecordingTransport::new(), profile(), options).unwrap();
        assert!(session.state().scaled);
        let log = session.into_transport().take_log();
        assert_eq!(log[0], Transfer::direct(0x02, 0x0000));
        assert_eq!(log[1], Transfer::direct(0x60, 0x0190));
    }

    #[test]
    fn test_failed_bring_up_surfaces_fault() {
        let err = Session::with_profile(
            RecordingTransport::new().fail_at(1),
            profile(),
            SessionOptions::default(),
        )
        .err()
        .unwrap();
        match err {
            SessionError::BringUp(fault) => assert_eq!(fault.offset, 0),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_controls_write_once_and_skip_unchanged() {
        let session = open();
        session.set_brightness(0x90).unwrap();
        session.set_brightness(0x90).unwrap();
        session.set_gamma(DEFAULT_GAMMA).unwrap();
        session.set_sharpness(0x07).unwrap();
        let state = session.state();
        assert_eq!(state.brightness, 0x90);
        assert_eq!(state.sharpness, 0x07);

        let log = session.into_transport().take_log();
        assert_eq!(writes_to(&log, 0x0101), vec![DEFAULT_BRIGHTNESS, 0x90]);
        assert_eq!(writes_to(&log, 0x0103), vec![DEFAULT_GAMMA]);
        assert_eq!(writes_to(&log, 0x0104), vec![DEFAULT_SHARPNESS, 0x07]);
    }

    #[test]
    fn test_failed_write_faults_until_bring_up() {
        // Bring-up issues nine transfers; the tenth fails.
        let session = Session::with_profile(
            RecordingTransport::new().fail_at(9),
            profile(),
            SessionOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            session.set_brightness(0x90),
            Err(SessionError::BringUp(_))
        ));
        assert!(session.is_faulted());
        assert_eq!(session.state().brightness, DEFAULT_BRIGHTNESS);
        assert!(matches!(session.set_contrast(0x10), Err(SessionError::Faulted)));
        assert!(matches!(session.tick(0), Err(SessionError::Faulted)));
        assert!(matches!(session.start_stream(), Err(SessionError::Faulted)));

        session.bring_up().unwrap();
        assert!(!session.is_faulted());
        session.set_contrast(0x10).unwrap();
        assert_eq!(session.state().contrast, 0x10);
    }

    #[test]
    fn test_line_frequency_runs_tuning_program() {
        let session = open();
        session.set_line_frequency(LineFrequency::Disabled).unwrap();
        session.set_line_frequency(LineFrequency::Disabled).unwrap();
        session.set_line_frequency(LineFrequency::Hz60).unwrap();
        assert_eq!(session.state().line_frequency, LineFrequency::Hz60);
        let log = session.into_transport().take_log();
        assert_eq!(writes_to(&log, 0x0190), vec![0x50, 0x00, 0x60]);
    }

    #[test]
    fn test_auto_gain_reads_accumulator_and_writes_gains() {
        let mut transport = RecordingTransport::new();
        transport.set_register(0x0105, 10);
        let session =
            Session::with_profile(transport, profile(), SessionOptions::default()).unwrap();
        assert!(session.auto_gain_step().unwrap());
        assert_eq!(session.gains(), [0x1a; 3]);

        session.set_auto_gain(false);
        assert!(!session.state().auto_gain);
        assert!(!session.auto_gain_step().unwrap());

        let log = session.into_transport().take_log();
        assert_eq!(log.iter().filter(|t| **t == Transfer::read(0x0105)).count(), 1);
        assert_eq!(writes_to(&log, 0x0118), vec![0x18, 0x1a]);
    }

    #[test]
    fn test_gain_ticks_never_split_a_program() {
        let session = Arc::new(open());
        let long = BringUpProgram::new(
            "long",
            (0..200)
                .map(|i| RegisterOp::DirectWrite { value: 0xee, index: 0x0200 + i })
                .collect(),
        );

        let ticker = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                for i in 0..50 {
                    let sample = if i % 2 == 0 { 0 } else { 255 };
                    session.tick(sample).unwrap();
                }
            })
        };
        for _ in 0..5 {
            session.run(&long).unwrap();
        }
        ticker.join().unwrap();

        let session = Arc::try_unwrap(session).ok().unwrap();
        let log = session.into_transport().take_log();
        let mut run = 0;
        for t in &log {
            match *t {
                Transfer::Write { value: 0xee, index, .. } => {
                    assert_eq!(index, 0x0200 + run, "program interleaved");
                    run = (run + 1) % 200;
                }
                _ => assert_eq!(run, 0, "foreign write inside program"),
            }
        }
    }

    #[test]
    fn test_detect_sensor_by_probe() {
        let profiles = vec![profile()];
        let mut t = RecordingTransport::new();
        t.set_register(BUS_READ_DATA_REG, 0x42);
        let found = detect_sensor(&mut t, &profiles).unwrap();
        assert_eq!(found.name(), "mock");
        assert!(t
            .log()
            .contains(&Transfer::write(RequestKind::BusAddr, 0x00, crate::sensor_bus::BUS_ADDR_REG)));

        let mut t = RecordingTransport::new();
        t.set_register(BUS_READ_DATA_REG, 0x41);
        assert!(matches!(
            detect_sensor(&mut t, &profiles),
            Err(SessionError::NoSensorDetected)
        ));
    }

    #[test]
    fn test_open_with_forced_sensor() {
        let options = SessionOptions {
            forced_sensor: Some("pas202b".into()),
            ..Default::default()
        };
        let session = Session::open(RecordingTransport::new(), options).unwrap();
        assert_eq!(session.state().sensor, "pas202b");
        let sync = session.start_stream().unwrap();
        assert!(!sync.in_frame());

        let options = SessionOptions {
            forced_sensor: Some("missing".into()),
            ..Default::default()
        };
        assert!(matches!(
            Session::open(RecordingTransport::new(), options),
            Err(SessionError::Profile(ProfileError::UnknownSensor(_)))
        ));
    }

    #[test]
    fn test_stream_injects_header_for_incomplete_hardware() {
        let session = open();
        let mut sync = session.start_stream().unwrap();
        let frames = sync.push(&[0xff, 0xd8, 0x01, 0xff, 0xd8]);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].injected_header);
        let header = session.profile().synthetic_header(false).unwrap().unwrap();
        assert_eq!(&frames[0].data[..header.len()], header.as_slice());
        assert_eq!(frames[0].data[header.len()..], [0x01]);
    }

    #[test]
    fn test_line_frequency_parse() {
        assert_eq!("50".parse::<LineFrequency>().unwrap(), LineFrequency::Hz50);
        assert_eq!("60Hz".parse::<LineFrequency>().unwrap(), LineFrequency::Hz60);
        assert_eq!("off".parse::<LineFrequency>().unwrap(), LineFrequency::Disabled);
        assert!("75".parse::<LineFrequency>().is_err());
    }
}
