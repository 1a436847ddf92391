//! zcam-hw: driver core for USB JPEG camera bridges.
//!
//! Bring-up programs are data: a sequence of register operations run by
//! the [`interpreter`] against a [`transport::Transport`]. Sensor
//! registers are reached through the bridge's indirect [`sensor_bus`].
//! The video stream is cut into JPEG frames by [`frame::FrameSynchronizer`],
//! which can prepend a header built by [`jpeg`] when the hardware sends an
//! incomplete one. [`session::Session`] ties it together with the
//! [`gain`] loop and the per-sensor [`profile`] database.

pub mod frame;
pub mod gain;
pub mod interpreter;
pub mod jpeg;
pub mod profile;
pub mod program;
pub mod sensor_bus;
pub mod session;
pub mod transport;
pub mod usb;

pub use frame::{Frame, FrameSynchronizer};
pub use interpreter::{BringUpFault, Interpreter};
pub use profile::{ProgramVariant, SensorProfile};
pub use program::{BringUpProgram, RegisterOp};
pub use session::{LineFrequency, Session, SessionError, SessionOptions};
pub use transport::{PacketSource, Transport, TransportError};
pub use usb::{UsbOptions, UsbTransport};
