//! Executes bring-up programs against a transport.

use crate::program::{AckCheck, BringUpProgram, RegisterOp};
use crate::sensor_bus::{BusFault, SensorBus};
use crate::transport::{RequestKind, Transport, TransportError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FaultCause {
    #[error("control transfer failed: {0}")]
    Io(#[from] TransportError),
    #[error(transparent)]
    Bus(#[from] BusFault),
    #[error("register {index:#06x} read {actual:#04x}, expected {expected:#04x}")]
    AckMismatch { index: u16, expected: u8, actual: u8 },
}

/// A program stopped at `offset`. Ops before it were issued; none after.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("program '{program}' failed at op {offset}: {cause}")]
pub struct BringUpFault {
    pub program: String,
    pub offset: usize,
    #[source]
    pub cause: FaultCause,
}

/// Runs programs top to bottom. Never retries.
pub struct Interpreter<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    settle: Duration,
}

impl<'a, T: Transport + ?Sized> Interpreter<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            settle: Duration::ZERO,
        }
    }

    /// Pause after every `RawDelayWrite`.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn run(&mut self, program: &BringUpProgram) -> Result<(), BringUpFault> {
        tracing::debug!(program = %program.name, ops = program.len(), "running program");

        for (offset, op) in program.ops.iter().enumerate() {
            tracing::trace!(offset, ?op, "op");
            self.step(op).map_err(|cause| {
                tracing::warn!(program = %program.name, offset, error = %cause, "program aborted");
                BringUpFault {
                    program: program.name.clone(),
                    offset,
                    cause,
                }
            })?;
        }
        Ok(())
    }

    fn step(&mut self, op: &RegisterOp) -> Result<(), FaultCause> {
        match *op {
            RegisterOp::DirectWrite { value, index } => {
                self.transport.control_write(RequestKind::Direct, value, index)?;
            }
            RegisterOp::ReadAck { index, check } => {
                let actual = self.transport.control_read(index)?;
                if let AckCheck::Expect(expected) = check {
                    if actual != expected {
                        return Err(FaultCause::AckMismatch {
                            index,
                            expected,
                            actual,
                        });
                    }
                }
            }
            RegisterOp::IndirectBusWrite { addr, data } => {
                SensorBus::new(&mut *self.transport).write_indirect(addr, data)?;
            }
            RegisterOp::RawDelayWrite { value, index } => {
                self.transport.control_write(RequestKind::Direct, value, index)?;
                if !self.settle.is_zero() {
                    std::thread::sleep(self.settle);
                }
            }
        }
        Ok(())
    }
}
