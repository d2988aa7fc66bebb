//! Downloading the OpenULINK firmware into the adapter's EZ-USB
//! microcontroller.
//!
//! The EZ-USB code memory is written through vendor control transfers on
//! EP0 while the CPU is held in reset via its CPUCS register. After the CPU
//! is released the device disconnects and re-enumerates with the new
//! firmware (ReNumeration), so the USB handle must be reopened.

use std::path::Path;
use std::time::Duration;

use ihex::Record;

use crate::error::{FirmwareLoadError, UlinkError};
use crate::usb::{UlinkTransport, USB_TIMEOUT};

/// Address of the EZ-USB CPU Control & Status register.
const CPUCS_REG: u16 = 0x7F92;

/// Control EP0 bRequest "Firmware Load".
const REQUEST_FIRMWARE_LOAD: u8 = 0xA0;

/// CPUCS value that holds the CPU in reset.
const CPU_RESET: u8 = 0x01;

/// CPUCS value that releases the CPU.
const CPU_START: u8 = 0x00;

/// Largest data stage of a single firmware-load control transfer.
const CHUNK_SIZE: usize = 64;

/// Delay to wait while the EZ-USB performs ReNumeration.
pub(crate) const RENUMERATION_DELAY: Duration = Duration::from_millis(1500);

/// Location of the OpenULINK firmware image, fixed at build time.
pub(crate) const ULINK_FIRMWARE_FILE: &str = "/usr/share/openulink/ulink_firmware.hex";

/// A contiguous run of firmware bytes at a code-space address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FirmwareSection {
    pub base_address: u16,
    pub data: Vec<u8>,
}

/// A parsed firmware image: its data records merged into contiguous
/// sections, in file order.
#[derive(Debug, Clone, Default)]
pub(crate) struct FirmwareImage {
    pub sections: Vec<FirmwareSection>,
}

impl FirmwareImage {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FirmwareLoadError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_hex(&text)
    }

    pub fn from_hex(text: &str) -> Result<Self, FirmwareLoadError> {
        let mut image = Self::default();
        let mut base_address = 0u64;

        for record in ihex::Reader::new(text) {
            match record? {
                Record::Data { offset, value } => {
                    let address = base_address + u64::from(offset);
                    let end = address + value.len() as u64;
                    // The EZ-USB code space is 8 kB; anything beyond 16-bit
                    // addressing cannot be a ULINK image.
                    if end > u64::from(u16::MAX) + 1 {
                        return Err(FirmwareLoadError::AddressOutOfRange);
                    }
                    image.append(address as u16, value);
                }
                Record::ExtendedSegmentAddress(address) => {
                    base_address = u64::from(address) * 16;
                }
                Record::ExtendedLinearAddress(address) => {
                    base_address = u64::from(address) << 16;
                }
                Record::EndOfFile
                | Record::StartSegmentAddress { .. }
                | Record::StartLinearAddress(_) => {}
            }
        }

        Ok(image)
    }

    fn append(&mut self, address: u16, data: Vec<u8>) {
        if let Some(last) = self.sections.last_mut() {
            if u32::from(last.base_address) + last.data.len() as u32 == u32::from(address) {
                last.data.extend_from_slice(&data);
                return;
            }
        }
        self.sections.push(FirmwareSection {
            base_address: address,
            data,
        });
    }
}

/// Writes CPU_RESET or CPU_START into the CPUCS register.
fn cpu_reset<T: UlinkTransport>(transport: &mut T, reset_bit: u8) -> Result<(), UlinkError> {
    let written = transport
        .control_write(REQUEST_FIRMWARE_LOAD, CPUCS_REG, 0, &[reset_bit], USB_TIMEOUT)
        .map_err(UlinkError::Usb)?;

    // The data stage is a single byte; anything else means the write did
    // not reach the register.
    if written != 1 {
        return Err(FirmwareLoadError::ShortControlWrite.into());
    }
    Ok(())
}

/// Streams one firmware section in chunks of up to 64 bytes.
fn write_section<T: UlinkTransport>(
    transport: &mut T,
    section: &FirmwareSection,
) -> Result<(), UlinkError> {
    tracing::debug!(
        "firmware section at {:#06x} ({:#06x} bytes)",
        section.base_address,
        section.data.len()
    );

    for (index, chunk) in section.data.chunks(CHUNK_SIZE).enumerate() {
        let address = section.base_address + (index * CHUNK_SIZE) as u16;
        let written = transport
            .control_write(REQUEST_FIRMWARE_LOAD, address, 0, chunk, USB_TIMEOUT)
            .map_err(UlinkError::Usb)?;
        if written != chunk.len() {
            return Err(FirmwareLoadError::ShortControlWrite.into());
        }
    }

    Ok(())
}

/// Holds the CPU in reset, downloads all sections and releases the CPU.
pub(crate) fn load_firmware<T: UlinkTransport>(
    transport: &mut T,
    image: &FirmwareImage,
) -> Result<(), UlinkError> {
    cpu_reset(transport, CPU_RESET)?;

    for section in &image.sections {
        write_section(transport, section)?;
    }

    cpu_reset(transport, CPU_START)?;

    Ok(())
}

/// Downloads the firmware, then closes the handle, waits out ReNumeration
/// and reopens the device.
pub(crate) fn load_firmware_and_renumerate<T: UlinkTransport>(
    transport: &mut T,
    image: &FirmwareImage,
    delay: Duration,
) -> Result<(), UlinkError> {
    load_firmware(transport, image)?;

    transport.close();
    std::thread::sleep(delay);
    transport.reopen()?;

    Ok(())
}
