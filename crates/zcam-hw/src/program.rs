//! Bring-up programs: typed register operations.
//!
//! Vendor tables historically encode each step as a raw
//! `(class, value, index)` triple where the class byte picks the opcode.
//! Here the class is an enum; raw triples are only accepted through
//! [`RegisterOp::from_raw`], which rejects unknown class bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const RAW_DIRECT_WRITE: u8 = 0xa0;
const RAW_READ_ACK: u8 = 0xa1;
const RAW_BUS_WRITE: u8 = 0xaa;
const RAW_DELAY_WRITE: u8 = 0xdd;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    #[error("unknown opcode class {class:#04x} at entry {offset}")]
    UnknownOpcode { offset: usize, class: u8 },
    #[error("sensor-bus address {index:#06x} at entry {offset} does not fit in a byte")]
    BusAddressRange { offset: usize, index: u16 },
}

/// How a [`RegisterOp::ReadAck`] treats the value it reads back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckCheck {
    /// Read for the bus round-trip only; the value is ignored.
    #[default]
    Discard,
    /// The read must return exactly this byte.
    Expect(u8),
}

/// One step of a bring-up program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegisterOp {
    /// Write `value` to bridge register `index`.
    DirectWrite { value: u8, index: u16 },
    /// Read bridge register `index`.
    ReadAck {
        index: u16,
        #[serde(default)]
        check: AckCheck,
    },
    /// Write `data` to sensor register `addr` over the sensor bus.
    IndirectBusWrite { addr: u8, data: u8 },
    /// Same wire traffic as `DirectWrite`, followed by a settle pause.
    RawDelayWrite { value: u8, index: u16 },
}

impl RegisterOp {
    /// Decode a vendor table triple.
    ///
    /// Returns `Ok(None)` for the all-zero sentinel.
    pub fn from_raw(offset: usize, class: u8, value: u8, index: u16)
        -> Result<Option<Self>, ProgramError>
    {
        let op = match class {
            0 if value == 0 && index == 0 => return Ok(None),
            RAW_DIRECT_WRITE => RegisterOp::DirectWrite { value, index },
            RAW_READ_ACK => RegisterOp::ReadAck {
                index,
                check: AckCheck::Discard,
            },
            RAW_BUS_WRITE => {
                let addr = u8::try_from(index)
                    .map_err(|_| ProgramError::BusAddressRange { offset, index })?;
                RegisterOp::IndirectBusWrite { addr, data: value }
            }
            RAW_DELAY_WRITE => RegisterOp::RawDelayWrite { value, index },
            other => return Err(ProgramError::UnknownOpcode { offset, class: other }),
        };
        Ok(Some(op))
    }
}

/// A named, ordered list of register operations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct BringUpProgram {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ops: Vec<RegisterOp>,
}

impl BringUpProgram {
    pub fn new(name: impl Into<String>, ops: Vec<RegisterOp>) -> Self {
        Self {
            name: name.into(),
            ops,
        }
    }

    /// Decode a vendor table. Decoding stops at the first all-zero triple.
    pub fn from_raw(name: impl Into<String>, table: &[(u8, u8, u16)])
        -> Result<Self, ProgramError>
    {
        let mut ops = Vec::with_capacity(table.len());
        for (offset, &(class, value, index)) in table.iter().enumerate() {
            match RegisterOp::from_raw(offset, class, value, index)? {
                Some(op) => ops.push(op),
                None => break,
            }
        }
        Ok(Self::new(name, ops))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_stops_at_sentinel() {
        let table = [
            (0xa0, 0x01, 0x0000),
            (0xaa, 0x34, 0x0012),
            (0xa1, 0x01, 0x0008),
            (0xdd, 0x00, 0x0010),
            (0x00, 0x00, 0x0000),
            (0xa0, 0xff, 0x00ff),
        ];
        let program = BringUpProgram::from_raw("t", &table).unwrap();
        assert_eq!(
            program.ops,
            vec![
                RegisterOp::DirectWrite { value: 0x01, index: 0x0000 },
                RegisterOp::IndirectBusWrite { addr: 0x12, data: 0x34 },
                RegisterOp::ReadAck { index: 0x0008, check: AckCheck::Discard },
                RegisterOp::RawDelayWrite { value: 0x00, index: 0x0010 },
            ]
        );
    }

    #[test]
    fn test_from_raw_rejects_unknown_class() {
        let table = [(0xa0, 0x01, 0x0000), (0x42, 0x00, 0x0001)];
        let err = BringUpProgram::from_raw("t", &table).unwrap_err();
        assert_eq!(err, ProgramError::UnknownOpcode { offset: 1, class: 0x42 });
    }

    #[test]
    fn test_from_raw_rejects_wide_bus_address() {
        let err = RegisterOp::from_raw(3, 0xaa, 0x00, 0x0112).unwrap_err();
        assert_eq!(err, ProgramError::BusAddressRange { offset: 3, index: 0x0112 });
    }

    #[test]
    fn test_zero_class_with_payload_is_not_sentinel() {
        assert!(RegisterOp::from_raw(0, 0x00, 0x01, 0x0000).is_err());
    }

    #[test]
    fn test_deserialize_toml_ops() {
        let src = r#"
            name = "init"
            ops = [
                { op = "direct_write", value = 1, index = 0 },
                { op = "read_ack", index = 8 },
                { op = "read_ack", index = 9, check = { expect = 3 } },
                { op = "indirect_bus_write", addr = 0x12, data = 0x34 },
                { op = "raw_delay_write", value = 0, index = 0x10 },
            ]
        "#;
        let program: BringUpProgram = toml::from_str(src).unwrap();
        assert_eq!(program.name, "init");
        assert_eq!(program.len(), 5);
        assert_eq!(
            program.ops[2],
            RegisterOp::ReadAck { index: 9, check: AckCheck::Expect(3) }
        );
    }
}
