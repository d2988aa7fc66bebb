//! The IEEE 1149.1 TAP state machine and the canonical TMS paths between
//! its stable states.
//!
//! The driver never generates TMS paths on the fly. Between any two stable
//! states there is one canonical, minimal TMS bit sequence of at most seven
//! transitions; [`tms_path`] is the lookup oracle for it. The sequences are
//! clocked out LSB first, matching the CLOCK_TMS wire format.

/// A state of the JTAG TAP state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    /// Test-Logic-Reset.
    Reset,
    /// Run-Test/Idle.
    Idle,
    /// Select-DR-Scan.
    DrSelect,
    /// Capture-DR.
    DrCapture,
    /// Shift-DR.
    DrShift,
    /// Exit1-DR.
    DrExit1,
    /// Pause-DR.
    DrPause,
    /// Exit2-DR.
    DrExit2,
    /// Update-DR.
    DrUpdate,
    /// Select-IR-Scan.
    IrSelect,
    /// Capture-IR.
    IrCapture,
    /// Shift-IR.
    IrShift,
    /// Exit1-IR.
    IrExit1,
    /// Pause-IR.
    IrPause,
    /// Exit2-IR.
    IrExit2,
    /// Update-IR.
    IrUpdate,
}

impl TapState {
    /// Returns whether the TAP remains in this state while TMS is held at a
    /// constant level. Only stable states may be used as scan or statemove
    /// end states.
    pub fn is_stable(self) -> bool {
        self.stable_index().is_some()
    }

    /// The state reached by one TCK cycle with the given TMS level.
    pub fn step(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (Reset, true) => Reset,
            (Reset, false) => Idle,
            (Idle, true) => DrSelect,
            (Idle, false) => Idle,
            (DrSelect, true) => IrSelect,
            (DrSelect, false) => DrCapture,
            (DrCapture, true) => DrExit1,
            (DrCapture, false) => DrShift,
            (DrShift, true) => DrExit1,
            (DrShift, false) => DrShift,
            (DrExit1, true) => DrUpdate,
            (DrExit1, false) => DrPause,
            (DrPause, true) => DrExit2,
            (DrPause, false) => DrPause,
            (DrExit2, true) => DrUpdate,
            (DrExit2, false) => DrShift,
            (DrUpdate, true) => DrSelect,
            (DrUpdate, false) => Idle,
            (IrSelect, true) => Reset,
            (IrSelect, false) => IrCapture,
            (IrCapture, true) => IrExit1,
            (IrCapture, false) => IrShift,
            (IrShift, true) => IrExit1,
            (IrShift, false) => IrShift,
            (IrExit1, true) => IrUpdate,
            (IrExit1, false) => IrPause,
            (IrPause, true) => IrExit2,
            (IrPause, false) => IrPause,
            (IrExit2, true) => IrUpdate,
            (IrExit2, false) => IrShift,
            (IrUpdate, true) => DrSelect,
            (IrUpdate, false) => Idle,
        }
    }

    fn stable_index(self) -> Option<usize> {
        match self {
            TapState::Reset => Some(0),
            TapState::Idle => Some(1),
            TapState::DrShift => Some(2),
            TapState::DrPause => Some(3),
            TapState::IrShift => Some(4),
            TapState::IrPause => Some(5),
            _ => None,
        }
    }
}

/// A TMS bit sequence moving the TAP between two stable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmsPath {
    /// Number of TCK cycles, at most 7.
    pub count: u8,
    /// TMS levels for each cycle, shifted out LSB first.
    pub sequence: u8,
}

/// Canonical TMS sequences between stable states, indexed
/// `[from][to]` in the order RESET, IDLE, DRSHIFT, DRPAUSE, IRSHIFT,
/// IRPAUSE. Sequences read right to left since the LSB is clocked first.
#[rustfmt::skip]
const TMS_PATHS: [[TmsPath; 6]; 6] = [
    // from RESET
    [p(0b111_1111, 7), p(0b000_0000, 7), p(0b001_0111, 7), p(0b000_1010, 7), p(0b001_1011, 7), p(0b001_0110, 7)],
    // from IDLE
    [p(0b111_1111, 7), p(0b000_0000, 7), p(0b001, 3),      p(0b0101, 4),     p(0b0011, 4),     p(0b0_1011, 5)],
    // from DRSHIFT
    [p(0b111_1111, 7), p(0b011, 3),      p(0b0_0111, 5),   p(0b01, 2),       p(0b00_1111, 6),  p(0b010_1111, 7)],
    // from DRPAUSE
    [p(0b111_1111, 7), p(0b011, 3),      p(0b01, 2),       p(0b01_0111, 6),  p(0b00_1111, 6),  p(0b010_1111, 7)],
    // from IRSHIFT
    [p(0b111_1111, 7), p(0b011, 3),      p(0b0_0111, 5),   p(0b01_0111, 6),  p(0b00_1111, 6),  p(0b01, 2)],
    // from IRPAUSE
    [p(0b111_1111, 7), p(0b011, 3),      p(0b0_0111, 5),   p(0b01_0111, 6),  p(0b01, 2),       p(0b010_1111, 7)],
];

const fn p(sequence: u8, count: u8) -> TmsPath {
    TmsPath { count, sequence }
}

/// Looks up the canonical TMS path between two stable states.
///
/// Returns `None` if either state is unstable; asking for such a path is a
/// driver bug.
pub fn tms_path(from: TapState, to: TapState) -> Option<TmsPath> {
    Some(TMS_PATHS[from.stable_index()?][to.stable_index()?])
}
