//! USB transport for the ULINK adapter.
//!
//! The adapter enumerates with the same VID/PID in its unconfigured state
//! (stock Keil firmware) and when running OpenULINK. All command traffic
//! uses the bulk endpoint pair on endpoint 2; firmware download uses vendor
//! control transfers on EP0. The driver talks to the device through the
//! [`UlinkTransport`] seam so the command layer can be exercised against a
//! scripted transport in tests.

use std::io;
use std::time::Duration;

use async_io::{block_on, Timer};
use futures_lite::FutureExt;
use nusb::MaybeFuture;
use std::num::NonZeroU8;

use nusb::transfer::{Bulk, ControlOut, ControlType, In, Out, Recipient};

use crate::error::ProbeCreationError;

/// USB Vendor ID of the ULINK device, both unconfigured and with OpenULINK
/// firmware.
pub(crate) const ULINK_VID: u16 = 0xC251;

/// USB Product ID of the ULINK device.
pub(crate) const ULINK_PID: u16 = 0x2710;

/// USB interface number claimed by the driver.
const USB_INTERFACE: u8 = 0;

/// Bulk OUT endpoint carrying command packets.
const EP_OUT: u8 = 0x02;

/// Bulk IN endpoint carrying response packets.
const EP_IN: u8 = 0x82;

/// String descriptor index of the manufacturer string.
const MANUFACTURER_INDEX: u8 = 1;

/// Default timeout for USB transfers.
pub(crate) const USB_TIMEOUT: Duration = Duration::from_millis(5000);

/// The USB surface the driver needs from a ULINK device: one bulk endpoint
/// pair plus vendor control writes for the firmware loader.
pub trait UlinkTransport {
    /// Writes a command packet to the bulk OUT endpoint.
    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize>;

    /// Reads a response packet from the bulk IN endpoint.
    fn bulk_read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Issues a vendor control write to the device.
    fn control_write(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> io::Result<usize>;

    /// Reads the manufacturer string descriptor.
    fn manufacturer_string(&mut self, timeout: Duration) -> io::Result<String>;

    /// Releases the interface and closes the device handle.
    fn close(&mut self);

    /// Re-opens the device after it dropped off the bus, e.g. after
    /// ReNumeration.
    fn reopen(&mut self) -> Result<(), ProbeCreationError>;
}

fn is_ulink_device(device: &nusb::DeviceInfo) -> bool {
    device.vendor_id() == ULINK_VID && device.product_id() == ULINK_PID
}

/// A ULINK adapter reached through nusb.
pub struct UlinkUsbDevice {
    device: Option<nusb::Device>,
    interface: Option<nusb::Interface>,
}

impl std::fmt::Debug for UlinkUsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UlinkUsbDevice")
            .field("open", &self.interface.is_some())
            .finish()
    }
}

impl UlinkUsbDevice {
    /// Opens the first ULINK device on the bus and claims its interface.
    pub fn open() -> Result<Self, ProbeCreationError> {
        let info = nusb::list_devices()
            .wait()
            .map_err(io::Error::from)
            .map_err(ProbeCreationError::Usb)?
            .find(is_ulink_device)
            .ok_or(ProbeCreationError::NotFound)?;

        let device = info
            .open()
            .wait()
            .map_err(io::Error::from)
            .map_err(ProbeCreationError::Usb)?;
        let interface = device
            .claim_interface(USB_INTERFACE)
            .wait()
            .map_err(io::Error::from)
            .map_err(ProbeCreationError::Usb)?;

        tracing::debug!("Acquired handle for ULINK probe");

        Ok(Self {
            device: Some(device),
            interface: Some(interface),
        })
    }

    fn interface(&self) -> io::Result<&nusb::Interface> {
        self.interface
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device handle is closed"))
    }
}

impl UlinkTransport for UlinkUsbDevice {
    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        self.interface()?.write_bulk(EP_OUT, data, timeout)
    }

    fn bulk_read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.interface()?.read_bulk(EP_IN, buf, timeout)
    }

    fn control_write(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        self.interface()?
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(io::Error::from)
            .map(|()| data.len())
    }

    fn manufacturer_string(&mut self, timeout: Duration) -> io::Result<String> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device handle is closed"))?;
        device
            .get_string_descriptor(
                NonZeroU8::new(MANUFACTURER_INDEX).expect("MANUFACTURER_INDEX is nonzero"),
                0,
                timeout,
            )
            .wait()
            .map_err(io::Error::from)
    }

    fn close(&mut self) {
        self.interface = None;
        self.device = None;
    }

    fn reopen(&mut self) -> Result<(), ProbeCreationError> {
        self.close();
        let reopened = Self::open()?;
        *self = reopened;
        Ok(())
    }
}

trait InterfaceExt {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> io::Result<usize>;
}

impl InterfaceExt for nusb::Interface {
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        let fut = async {
            let mut ep_out = self.endpoint::<Bulk, Out>(endpoint).unwrap();
            let mut transfer = ep_out.allocate(buf.len().max(1));
            transfer.extend_from_slice(buf);
            ep_out.submit(transfer);
            let Some(comp) = ep_out.wait_next_complete(timeout) else {
                return Err(io::ErrorKind::TimedOut.into());
            };
            comp.status.map_err(io::Error::other)?;
            Ok(comp.actual_len)
        };

        block_on(fut.or(async {
            Timer::after(timeout).await;
            Err(io::ErrorKind::TimedOut.into())
        }))
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let fut = async {
            let mut ep_in = self.endpoint::<Bulk, In>(endpoint).unwrap();
            let transfer = ep_in.allocate(buf.len());
            ep_in.submit(transfer);
            let Some(comp) = ep_in.wait_next_complete(timeout) else {
                return Err(io::ErrorKind::TimedOut.into());
            };
            comp.status.map_err(io::Error::other)?;

            let n = comp.actual_len;
            buf[..n].copy_from_slice(&comp.buffer[..n]);
            Ok(n)
        };

        block_on(fut.or(async {
            Timer::after(timeout).await;
            Err(io::ErrorKind::TimedOut.into())
        }))
    }
}
