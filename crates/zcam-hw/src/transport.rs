//! Control-transfer seam between the core and the USB device.
//!
//! Everything above this module speaks in register writes and reads.
//! The request kind is carried along so transports and test doubles can
//! tell plain register traffic apart from sensor-bus handshake steps, even
//! though on the wire they are the same vendor request.

use thiserror::Error;

/// What a control write is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Plain bridge register write.
    Direct,
    /// Sensor-bus address select.
    BusAddr,
    /// Sensor-bus data byte.
    BusData,
    /// Sensor-bus "go" command.
    BusCommand,
    /// Sensor-bus acknowledge poll.
    BusAck,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("usb: {0}")]
    Usb(#[from] rusb::Error),
    #[error("short control read from register {index:#06x}")]
    ShortRead { index: u16 },
    #[error("transfer failed: {0}")]
    Failed(String),
}

/// Synchronous register access to the bridge chip.
pub trait Transport {
    /// Write one byte to a bridge register.
    fn control_write(&mut self, kind: RequestKind, value: u8, index: u16)
        -> Result<(), TransportError>;

    /// Read one byte from a bridge register.
    fn control_read(&mut self, index: u16) -> Result<u8, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn control_write(
        &mut self,
        kind: RequestKind,
        value: u8,
        index: u16,
    ) -> Result<(), TransportError> {
        (**self).control_write(kind, value, index)
    }

    fn control_read(&mut self, index: u16) -> Result<u8, TransportError> {
        (**self).control_read(index)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn control_write(
        &mut self,
        kind: RequestKind,
        value: u8,
        index: u16,
    ) -> Result<(), TransportError> {
        (**self).control_write(kind, value, index)
    }

    fn control_read(&mut self, index: u16) -> Result<u8, TransportError> {
        (**self).control_read(index)
    }
}

/// Source of raw video packets, one per call.
pub trait PacketSource {
    /// Fill `buf` with the next packet and return its length.
    /// `Ok(None)` means the stream ended.
    fn read_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;
}

/// Replays a packet dump: a raw concatenation of fixed-size packets.
/// The final packet may be short.
pub struct ReplaySource<R> {
    reader: R,
    packet_size: usize,
}

impl<R: std::io::Read> ReplaySource<R> {
    pub fn new(reader: R, packet_size: usize) -> Self {
        Self {
            reader,
            packet_size: packet_size.max(1),
        }
    }
}

impl<R: std::io::Read> PacketSource for ReplaySource<R> {
    fn read_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let want = self.packet_size.min(buf.len());
        let mut filled = 0;
        while filled < want {
            match self.reader.read(&mut buf[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Failed(format!("dump read: {e}"))),
            }
        }
        Ok((filled > 0).then_some(filled))
    }
}

#[cfg(any(test, feature = "mock"))]
pub mod mock {
    //! Transport double that records every transfer.

    use super::{RequestKind, Transport, TransportError};
    use std::collections::HashMap;

    /// One recorded control transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Transfer {
        Write { kind: RequestKind, value: u8, index: u16 },
        Read { index: u16 },
    }

    impl Transfer {
        pub fn write(kind: RequestKind, value: u8, index: u16) -> Self {
            Transfer::Write { kind, value, index }
        }

        pub fn direct(value: u8, index: u16) -> Self {
            Transfer::Write {
                kind: RequestKind::Direct,
                value,
                index,
            }
        }

        pub fn read(index: u16) -> Self {
            Transfer::Read { index }
        }
    }

    /// Records transfers in call order. Reads return the value registered
    /// for the register with [`RecordingTransport::set_register`], or zero.
    #[derive(Debug, Default, Clone)]
    pub struct RecordingTransport {
        log: Vec<Transfer>,
        registers: HashMap<u16, u8>,
        fail_at: Option<usize>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the transfer with this zero-based position fail, once.
        pub fn fail_at(mut self, position: usize) -> Self {
            self.fail_at = Some(position);
            self
        }

        pub fn set_register(&mut self, index: u16, value: u8) {
            self.registers.insert(index, value);
        }

        pub fn log(&self) -> &[Transfer] {
            &self.log
        }

        pub fn take_log(&mut self) -> Vec<Transfer> {
            std::mem::take(&mut self.log)
        }

        fn check_failure(&mut self) -> Result<(), TransportError> {
            if self.fail_at == Some(self.log.len()) {
                self.fail_at = None;
                return Err(TransportError::Failed(format!(
                    "injected failure at transfer {}",
                    self.log.len()
                )));
            }
            Ok(())
        }
    }

    impl Transport for RecordingTransport {
        fn control_write(
            &mut self,
            kind: RequestKind,
            value: u8,
            index: u16,
        ) -> Result<(), TransportError> {
            self.check_failure()?;
            self.log.push(Transfer::Write { kind, value, index });
            Ok(())
        }

        fn control_read(&mut self, index: u16) -> Result<u8, TransportError> {
            self.check_failure()?;
            self.log.push(Transfer::Read { index });
            Ok(self.registers.get(&index).copied().unwrap_or(0))
        }
    }
}
