//! rusb-backed transport.
//!
//! Register access is a pair of vendor control requests: `0xa0` writes
//! (`wValue` = data byte, `wIndex` = register) and `0xa1` reads one byte
//! back. Video packets are read from the configured IN endpoint.

use crate::transport::{PacketSource, RequestKind, Transport, TransportError};
use rusb::{request_type, Context, Device, DeviceHandle, Direction, Recipient, RequestType,
    UsbContext};
use std::sync::Arc;
use std::time::Duration;

const REQ_WRITE: u8 = 0xa0;
const REQ_READ: u8 = 0xa1;

/// How to open and drive a bridge device.
#[derive(Debug, Clone)]
pub struct UsbOptions {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    /// Alternate setting that enables the video endpoint.
    pub alt_setting: u8,
    pub video_endpoint: u8,
    pub timeout: Duration,
}

/// Info about a discovered bridge device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Open a particular device by VID/PID.
fn open_device<T: UsbContext>(ctx: &T, vid: u16, pid: u16)
    -> rusb::Result<(Device<T>, DeviceHandle<T>)>
{
    for device in ctx.devices()?.iter() {
        let desc = device.device_descriptor()?;
        if desc.vendor_id() == vid && desc.product_id() == pid {
            let handle = device.open()?;
            return Ok((device, handle));
        }
    }
    Err(rusb::Error::NoDevice)
}

/// List devices matching the given VID and, optionally, PID.
pub fn list_devices(vid: u16, pid: Option<u16>) -> Result<Vec<DeviceInfo>, TransportError> {
    let ctx = Context::new()?;
    let mut found = Vec::new();
    for device in ctx.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if desc.vendor_id() != vid || pid.is_some_and(|p| p != desc.product_id()) {
            continue;
        }
        found.push(DeviceInfo {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
        });
    }
    Ok(found)
}

/// Control-transfer transport for one claimed bridge interface.
pub struct UsbTransport {
    handle: Arc<DeviceHandle<Context>>,
    options: UsbOptions,
}

impl UsbTransport {
    pub fn open(options: UsbOptions) -> Result<Self, TransportError> {
        let ctx = Context::new()?;
        let (device, mut handle) = open_device(&ctx, options.vendor_id, options.product_id)?;

        if let Ok(true) = handle.kernel_driver_active(options.interface) {
            handle.detach_kernel_driver(options.interface)?;
        }
        handle.claim_interface(options.interface)?;
        handle.set_alternate_setting(options.interface, options.alt_setting)?;

        tracing::info!(
            bus = device.bus_number(),
            address = device.address(),
            vid = %format!("{:04x}", options.vendor_id),
            pid = %format!("{:04x}", options.product_id),
            "opened bridge"
        );

        Ok(Self {
            handle: Arc::new(handle),
            options,
        })
    }

    /// A packet reader sharing this device's handle.
    pub fn video_reader(&self) -> UsbVideoReader {
        UsbVideoReader {
            handle: Arc::clone(&self.handle),
            endpoint: self.options.video_endpoint,
            timeout: self.options.timeout,
        }
    }
}

impl Transport for UsbTransport {
    fn control_write(&mut self, kind: RequestKind, value: u8, index: u16)
        -> Result<(), TransportError>
    {
        let rt = request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        tracing::trace!(?kind, value, index, "control write");
        self.handle
            .write_control(rt, REQ_WRITE, value as u16, index, &[], self.options.timeout)?;
        Ok(())
    }

    fn control_read(&mut self, index: u16) -> Result<u8, TransportError> {
        let rt = request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut buf = [0u8; 1];
        let n = self
            .handle
            .read_control(rt, REQ_READ, 0, index, &mut buf, self.options.timeout)?;
        if n != 1 {
            return Err(TransportError::ShortRead { index });
        }
        tracing::trace!(index, value = buf[0], "control read");
        Ok(buf[0])
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let interface = self.options.interface;
        let Some(handle) = Arc::get_mut(&mut self.handle) else {
            tracing::warn!("video reader still open; leaving interface claimed");
            return;
        };
        if let Err(e) = handle.set_alternate_setting(interface, 0) {
            tracing::warn!(error = %e, "couldn't reset alternate setting");
        }
        if let Err(e) = handle.release_interface(interface) {
            tracing::warn!(error = %e, "couldn't release interface");
        }
    }
}

/// Reads video packets from the bridge's IN endpoint.
pub struct UsbVideoReader {
    handle: Arc<DeviceHandle<Context>>,
    endpoint: u8,
    timeout: Duration,
}

impl PacketSource for UsbVideoReader {
    fn read_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        match self.handle.read_bulk(self.endpoint, buf, self.timeout) {
            Ok(n) => {
                if tracing::enabled!(tracing::Level::TRACE) {
                    use pretty_hex::PrettyHex;
                    let packet = &buf[..n];
                    tracing::trace!("packet:\n{:?}", packet.hex_dump());
                }
                Ok(Some(n))
            }
            // An idle interval is not the end of the stream.
            Err(rusb::Error::Timeout) => Ok(Some(0)),
            Err(e) => Err(e.into()),
        }
    }
}
