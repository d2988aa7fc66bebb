//! Host-side driver for Keil ULINK JTAG adapters running the OpenULINK
//! firmware.
//!
//! The original ULINK is a Cypress EZ-USB (AN2131) based adapter. Its code
//! memory is volatile, so on every power cycle the adapter enumerates with
//! the stock Keil firmware and must be loaded with the OpenULINK firmware
//! image before it understands the command protocol implemented here. The
//! driver detects this from the USB manufacturer string and performs the
//! download and ReNumeration automatically during [`UlinkProbe::init`].
//!
//! Once running, the firmware accepts batches of fixed-format commands over
//! a single pair of bulk endpoints, with at most 64 bytes per direction per
//! batch. [`UlinkProbe`] translates abstract JTAG operations ([`JtagCommand`])
//! into those batches: it packs commands into the 64-byte windows, splits
//! long scans into firmware-sized fragments joined by PAUSE excursions,
//! tracks a host-side shadow of the TAP state, and scatters response bytes
//! back into the originating scans.
//!
//! ```no_run
//! use openulink::{JtagCommand, JtagInterface, ScanCommand, ScanField, ScanRegister, TapState, UlinkProbe};
//!
//! let mut probe = UlinkProbe::open()?;
//! probe.init()?;
//!
//! let ops = [JtagCommand::Scan(ScanCommand {
//!     register: ScanRegister::Ir,
//!     fields: vec![ScanField {
//!         num_bits: 8,
//!         out: Some(vec![0xA5]),
//!         capture: true,
//!     }],
//!     end_state: TapState::Idle,
//! })];
//! let mut results = probe.execute_queue(&ops)?;
//! let _captured = results.take(0).unwrap();
//! # Ok::<(), openulink::UlinkError>(())
//! ```

mod error;
mod firmware;
mod jtag;
mod probe;
mod protocol;
mod scan;
mod tap;
mod usb;

pub use error::{FirmwareLoadError, ProbeCreationError, UlinkError};
pub use jtag::{
    JtagCommand, JtagInterface, ScanCommand, ScanField, ScanRegister, ScanResults, ScanType,
    WireProtocol,
};
pub use probe::{UlinkProbe, UlinkType};
pub use tap::{tms_path, TapState, TmsPath};
pub use usb::{UlinkTransport, UlinkUsbDevice};
