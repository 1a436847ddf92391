//! Indirect sensor register access through the bridge's low-speed bus.
//!
//! The bridge exposes a tiny bus controller: an address latch, a data
//! latch, a command register and an acknowledge register. Every access is
//! a fixed handshake. The acknowledge read is issued but its value is not
//! inspected; on real parts the read itself advances the controller, so it
//! must never be skipped or reordered.

use crate::transport::{RequestKind, Transport, TransportError};
use thiserror::Error;

pub const BUS_ADDR_REG: u16 = 0x0092;
pub const BUS_DATA_REG: u16 = 0x0093;
pub const BUS_COMMAND_REG: u16 = 0x0090;
pub const BUS_ACK_REG: u16 = 0x0091;
pub const BUS_READ_DATA_REG: u16 = 0x0095;

const CMD_WRITE: u8 = 0x01;
const CMD_READ: u8 = 0x02;

/// Handshake step, for fault reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStep {
    AddressSelect,
    Data,
    Command,
    Ack,
    ReadData,
}

impl std::fmt::Display for BusStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BusStep::AddressSelect => "address select",
            BusStep::Data => "data",
            BusStep::Command => "command",
            BusStep::Ack => "ack",
            BusStep::ReadData => "read data",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sensor bus {step} step failed for address {addr:#04x}: {source}")]
pub struct BusFault {
    pub addr: u8,
    pub step: BusStep,
    #[source]
    pub source: TransportError,
}

/// Sensor-bus handshakes over a borrowed transport.
pub struct SensorBus<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: Transport + ?Sized> SensorBus<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self { transport }
    }

    /// Write `data` to sensor register `addr`.
    pub fn write_indirect(&mut self, addr: u8, data: u8) -> Result<(), BusFault> {
        self.write(addr, BusStep::AddressSelect, RequestKind::BusAddr, addr, BUS_ADDR_REG)?;
        self.write(addr, BusStep::Data, RequestKind::BusData, data, BUS_DATA_REG)?;
        self.write(addr, BusStep::Command, RequestKind::BusCommand, CMD_WRITE, BUS_COMMAND_REG)?;
        let ack = self.read(addr, BusStep::Ack, BUS_ACK_REG)?;
        tracing::trace!(addr, data, ack, "sensor bus write");
        Ok(())
    }

    /// Read sensor register `addr`.
    pub fn read_indirect(&mut self, addr: u8) -> Result<u8, BusFault> {
        self.write(addr, BusStep::AddressSelect, RequestKind::BusAddr, addr, BUS_ADDR_REG)?;
        self.write(addr, BusStep::Command, RequestKind::BusCommand, CMD_READ, BUS_COMMAND_REG)?;
        let ack = self.read(addr, BusStep::Ack, BUS_ACK_REG)?;
        let value = self.read(addr, BusStep::ReadData, BUS_READ_DATA_REG)?;
        tracing::trace!(addr, value, ack, "sensor bus read");
        Ok(value)
    }

    fn write(&mut self, addr: u8, step: BusStep, kind: RequestKind, value: u8, index: u16)
        -> Result<(), BusFault>
    {
        self.transport
            .control_write(kind, value, index)
            .map_err(|source| BusFault { addr, step, source })
    }

    fn read(&mut self, addr: u8, step: BusStep, index: u16) -> Result<u8, BusFault> {
        self.transport
            .control_read(index)
            .map_err(|source| BusFault { addr, step, source })
    }
}
