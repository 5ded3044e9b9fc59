//! USB bulk transport (spec §4.B), grounded directly on the teacher's
//! `usb/mod.rs`: finds the ADB interface (class 0xff, subclass 0x42,
//! protocol 0x01) on a device's active configuration and speaks full ADB
//! messages over its bulk IN/OUT endpoints. `rusb`'s `DeviceHandle` allows
//! concurrent transfers on distinct endpoints from different threads, so a
//! split reader/writer pair shares one `Arc<DeviceHandle<_>>`.

use std::sync::Arc;
use std::time::Duration;

use rusb::{DeviceHandle, UsbContext};

use crate::error::{AdbError, Result};

pub struct UsbTransport {
    handle: Arc<DeviceHandle<rusb::Context>>,
    ep_in: u8,
    ep_out: u8,
    timeout: Duration,
}

/// Endpoint max packet size: USB requires a zero-length packet to follow any
/// write whose size is an exact multiple of this, so the peer can detect the
/// transfer boundary (spec §4.B). Bulk endpoints on full/high speed devices
/// use 64 or 512 byte packets; 512 covers both without a probe.
const BULK_MAX_PACKET_SIZE: usize = 512;

impl UsbTransport {
    /// Open the `device_index`-th matching Mi-Assistant/ADB interface found
    /// among the host's USB devices.
    pub fn open(device_index: usize) -> Result<Self> {
        let ctx = rusb::Context::new().map_err(usb_err)?;

        let mut matches: Vec<(rusb::Device<rusb::Context>, u8, u8, u8)> = Vec::new();
        for device in ctx.devices().map_err(usb_err)?.iter() {
            let config = match device.active_config_descriptor() {
                Ok(c) => c,
                Err(_) => continue,
            };
            for iface in config.interfaces() {
                for setting in iface.descriptors() {
                    if setting.class_code() == 0xff
                        && setting.sub_class_code() == 0x42
                        && setting.protocol_code() == 0x01
                    {
                        let mut ep_in = None;
                        let mut ep_out = None;
                        for ep in setting.endpoint_descriptors() {
                            let addr = ep.address();
                            if ep.transfer_type() == rusb::TransferType::Bulk {
                                if addr & 0x80 != 0 {
                                    ep_in = Some(addr);
                                } else {
                                    ep_out = Some(addr);
                                }
                            }
                        }
                        if let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) {
                            matches.push((device.clone(), setting.interface_number(), ep_in, ep_out));
                        }
                    }
                }
            }
        }

        if matches.is_empty() {
            return Err(AdbError::TransportClosed);
        }
        if device_index >= matches.len() {
            return Err(AdbError::InvalidResponse(format!(
                "device index {} out of range ({} found)",
                device_index,
                matches.len()
            )));
        }

        let (device, interface_number, ep_in, ep_out) = matches.remove(device_index);
        let mut handle = device.open().map_err(usb_err)?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            handle.set_auto_detach_kernel_driver(true).ok();
        }
        handle.claim_interface(interface_number).map_err(usb_err)?;

        Ok(UsbTransport {
            handle: Arc::new(handle),
            ep_in,
            ep_out,
            timeout: Duration::from_millis(5000),
        })
    }

    pub fn set_timeout(&mut self, dur: Duration) {
        self.timeout = dur;
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        write_all_bulk(&self.handle, self.ep_out, data, self.timeout)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        read_exact_bulk(&self.handle, self.ep_in, buf, self.timeout)
    }

    pub fn close(&mut self) -> Result<()> {
        self.handle.release_interface(0).ok();
        Ok(())
    }

    pub fn split(self) -> (UsbReader, UsbWriter) {
        (
            UsbReader {
                handle: self.handle.clone(),
                ep_in: self.ep_in,
                timeout: self.timeout,
            },
            UsbWriter {
                handle: self.handle,
                ep_out: self.ep_out,
                timeout: self.timeout,
            },
        )
    }
}

fn write_all_bulk(
    handle: &DeviceHandle<rusb::Context>,
    ep_out: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        let n = handle.write_bulk(ep_out, &data[written..], timeout).map_err(usb_err)?;
        if n == 0 {
            return Err(AdbError::TransportClosed);
        }
        written += n;
    }
    if !data.is_empty() && data.len() % BULK_MAX_PACKET_SIZE == 0 {
        // Signal end-of-transfer with a ZLP, as required by spec §4.B.
        handle.write_bulk(ep_out, &[], timeout).map_err(usb_err)?;
    }
    Ok(())
}

fn read_exact_bulk(
    handle: &DeviceHandle<rusb::Context>,
    ep_in: u8,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    let mut read = 0;
    while read < buf.len() {
        let n = handle.read_bulk(ep_in, &mut buf[read..], timeout).map_err(usb_err)?;
        if n == 0 {
            return Err(AdbError::TransportClosed);
        }
        read += n;
    }
    Ok(())
}

fn usb_err(e: rusb::Error) -> AdbError {
    match e {
        rusb::Error::Timeout => AdbError::Timeout,
        rusb::Error::NoDevice | rusb::Error::Io => AdbError::TransportClosed,
        other => AdbError::InvalidResponse(other.to_string()),
    }
}

pub struct UsbReader {
    handle: Arc<DeviceHandle<rusb::Context>>,
    ep_in: u8,
    timeout: Duration,
}

impl UsbReader {
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        read_exact_bulk(&self.handle, self.ep_in, buf, self.timeout)
    }

    pub fn set_timeout(&mut self, dur: Duration) {
        self.timeout = dur;
    }
}

pub struct UsbWriter {
    handle: Arc<DeviceHandle<rusb::Context>>,
    ep_out: u8,
    timeout: Duration,
}

impl UsbWriter {
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        write_all_bulk(&self.handle, self.ep_out, buf, self.timeout)
    }
}
