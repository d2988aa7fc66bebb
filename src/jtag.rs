//! The abstract JTAG operations accepted by the driver and the buffers they
//! exchange with the upstream debugger framework.

use std::collections::HashMap;
use std::fmt;

use bitvec::prelude::*;

use crate::error::UlinkError;
use crate::tap::TapState;

/// The protocol that is to be used by the probe when communicating with the
/// target. The original ULINK hardware speaks JTAG only.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WireProtocol {
    /// Serial Wire Debug. Not available on ULINK-1 hardware.
    Swd,
    /// JTAG (IEEE 1149.1).
    Jtag,
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireProtocol::Swd => write!(f, "SWD"),
            WireProtocol::Jtag => write!(f, "JTAG"),
        }
    }
}

/// The JTAG register a scan shifts through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRegister {
    /// The instruction register.
    Ir,
    /// The currently selected data register.
    Dr,
}

/// One field of a scan: a run of bits with optional TDI data and an optional
/// request to capture the TDO bits shifted out in its place.
#[derive(Debug, Clone)]
pub struct ScanField {
    /// Number of bits in this field.
    pub num_bits: usize,
    /// TDI bits to shift in, packed LSB first. `None` shifts zeros.
    pub out: Option<Vec<u8>>,
    /// Whether the TDO bits for this field should be captured.
    pub capture: bool,
}

/// A shift through the instruction or data register, bracketed by moves into
/// and out of the matching SHIFT state.
#[derive(Debug, Clone)]
pub struct ScanCommand {
    /// Which register to shift through.
    pub register: ScanRegister,
    /// The concatenated fields of the scan, first field shifted first.
    pub fields: Vec<ScanField>,
    /// The stable state the TAP is left in after the scan.
    pub end_state: TapState,
}

/// Transfer direction of a scan, derived from its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    /// Capture TDO only; TDI shifts zeros.
    In,
    /// Shift TDI only; TDO is discarded.
    Out,
    /// Shift TDI and capture TDO.
    Io,
}

impl ScanCommand {
    /// Total number of bits shifted by this scan.
    pub fn total_bits(&self) -> usize {
        self.fields.iter().map(|f| f.num_bits).sum()
    }

    /// Derives the transfer direction from the fields. A scan with neither
    /// TDI data nor capture requests still clocks bits and is treated as an
    /// OUT scan of zeros.
    pub fn scan_type(&self) -> ScanType {
        let writes = self.fields.iter().any(|f| f.out.is_some());
        let reads = self.fields.iter().any(|f| f.capture);
        match (writes, reads) {
            (true, true) => ScanType::Io,
            (false, true) => ScanType::In,
            _ => ScanType::Out,
        }
    }

    /// Packs the TDI data of all fields into one contiguous LSB-first byte
    /// buffer of `ceil(total_bits / 8)` bytes.
    pub(crate) fn build_tdi(&self) -> Result<Vec<u8>, UlinkError> {
        let mut bits = bitvec![u8, Lsb0; 0; self.total_bits()];
        let mut offset = 0;
        for field in &self.fields {
            if let Some(out) = &field.out {
                if out.len() * 8 < field.num_bits {
                    return Err(UlinkError::Bug("scan field TDI buffer is too small"));
                }
                bits[offset..offset + field.num_bits]
                    .copy_from_bitslice(&out.view_bits::<Lsb0>()[..field.num_bits]);
            }
            offset += field.num_bits;
        }
        Ok(bits.into_vec())
    }

    /// Unpacks a contiguous TDO buffer into per-field capture results.
    /// Fields without a capture request yield `None`.
    pub(crate) fn extract_fields(&self, tdo: &[u8]) -> Vec<Option<BitVec<u8, Lsb0>>> {
        let bits = tdo.view_bits::<Lsb0>();
        let mut offset = 0;
        self.fields
            .iter()
            .map(|field| {
                let captured = field
                    .capture
                    .then(|| bits[offset..offset + field.num_bits].to_bitvec());
                offset += field.num_bits;
                captured
            })
            .collect()
    }
}

/// An abstract JTAG operation, lowered by the driver into one or more
/// on-wire commands.
#[derive(Debug, Clone)]
pub enum JtagCommand {
    /// Shift through the instruction or data register.
    Scan(ScanCommand),
    /// Move the TAP into Test-Logic-Reset using five TMS ones.
    TlrReset,
    /// Generate TCK cycles in Run-Test/Idle, then move to the end state.
    RunTest {
        /// Number of TCK cycles to spend in Run-Test/Idle.
        num_cycles: u16,
        /// The stable state the TAP is left in afterwards.
        end_state: TapState,
    },
    /// Assert or deassert the TRST and SRST lines.
    Reset {
        /// Assert the JTAG test reset line.
        trst: bool,
        /// Assert the system reset line.
        srst: bool,
    },
    /// Walk an explicit sequence of TAP states.
    ///
    /// Accepted but not emitted; see the driver documentation.
    PathMove {
        /// The states to walk through, in order.
        path: Vec<TapState>,
    },
    /// Wait on the adapter for the given number of microseconds.
    ///
    /// The wait happens on-device, between the surrounding queued commands,
    /// so it is not subject to host scheduling jitter.
    Sleep {
        /// Microseconds to wait.
        us: u32,
    },
}

/// Captured TDO data for the scans of one executed queue, keyed by the index
/// of the originating operation.
#[derive(Debug, Default)]
pub struct ScanResults(HashMap<usize, Vec<Option<BitVec<u8, Lsb0>>>>);

impl ScanResults {
    pub(crate) fn insert(&mut self, op_index: usize, fields: Vec<Option<BitVec<u8, Lsb0>>>) {
        self.0.insert(op_index, fields);
    }

    /// Takes the per-field capture results of the operation at `op_index`.
    pub fn take(&mut self, op_index: usize) -> Option<Vec<Option<BitVec<u8, Lsb0>>>> {
        self.0.remove(&op_index)
    }

    /// Number of operations with captured data.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether no scan captured any data.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The driver surface registered with the upstream debugger framework.
pub trait JtagInterface {
    /// Short name the interface is registered under.
    fn name(&self) -> &'static str;

    /// The transports this interface can drive.
    fn transports(&self) -> &'static [WireProtocol];

    /// Opens the adapter, loads firmware if needed and verifies that the
    /// device responds.
    fn init(&mut self) -> Result<(), UlinkError>;

    /// Releases the adapter.
    fn quit(&mut self) -> Result<(), UlinkError>;

    /// Lowers and executes a batch of JTAG operations, returning the
    /// captured scan data.
    fn execute_queue(&mut self, ops: &[JtagCommand]) -> Result<ScanResults, UlinkError>;

    /// Maps a requested TCK frequency to a speed index.
    fn khz(&mut self, khz: u32) -> Result<u32, UlinkError>;

    /// Selects a previously validated speed index.
    fn speed(&mut self, index: u32) -> Result<(), UlinkError>;

    /// Reports the TCK frequency in kHz for a speed index.
    fn speed_div(&mut self, index: u32) -> Result<u32, UlinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn io_field(num_bits: usize, out: &[u8]) -> ScanField {
        ScanField {
            num_bits,
            out: Some(out.to_vec()),
            capture: true,
        }
    }

    #[test]
    fn tdi_packing_concatenates_fields_lsb_first() {
        let scan = ScanCommand {
            register: ScanRegister::Dr,
            fields: vec![
                io_field(4, &[0x0F]),
                ScanField {
                    num_bits: 3,
                    out: None,
                    capture: false,
                },
                io_field(9, &[0xFF, 0x01]),
            ],
            end_state: TapState::Idle,
        };

        assert_eq!(scan.total_bits(), 16);
        // bits 0..4 ones, 4..7 zeros, 7..16 ones
        assert_eq!(scan.build_tdi().unwrap(), vec![0x8F, 0xFF]);
    }

    #[test]
    fn field_extraction_mirrors_packing_offsets() {
        let scan = ScanCommand {
            register: ScanRegister::Dr,
            fields: vec![
                ScanField {
                    num_bits: 5,
                    out: None,
                    capture: false,
                },
                io_field(8, &[0x00]),
            ],
            end_state: TapState::Idle,
        };

        // 13 bits total; TDO bytes carry 0xA5 in bits 5..13.
        let tdo = [0xA5u8 << 5, 0xA5 >> 3];
        let fields = scan.extract_fields(&tdo);
        assert_eq!(fields[0], None);
        let captured = fields[1].as_ref().unwrap();
        assert_eq!(captured.len(), 8);
        assert_eq!(captured.clone().into_vec(), vec![0xA5]);
    }

    #[test]
    fn scan_type_is_derived_from_fields() {
        let mut scan = ScanCommand {
            register: ScanRegister::Ir,
            fields: vec![io_field(8, &[0xFF])],
            end_state: TapState::Idle,
        };
        assert_eq!(scan.scan_type(), ScanType::Io);

        scan.fields[0].capture = false;
        assert_eq!(scan.scan_type(), ScanType::Out);

        scan.fields[0].out = None;
        scan.fields[0].capture = true;
        assert_eq!(scan.scan_type(), ScanType::In);

        scan.fields[0].capture = false;
        assert_eq!(scan.scan_type(), ScanType::Out);
    }

    #[test]
    fn undersized_tdi_buffer_is_a_bug() {
        let scan = ScanCommand {
            register: ScanRegister::Dr,
            fields: vec![io_field(16, &[0xFF])],
            end_state: TapState::Idle,
        };
        assert!(matches!(scan.build_tdi(), Err(UlinkError::Bug(_))));
    }
}
