//! The ULINK probe driver: lifecycle, operation lowering and the queue
//! flush protocol.

use std::time::Duration;

use crate::error::{ProbeCreationError, UlinkError};
use crate::firmware::{self, FirmwareImage};
use crate::jtag::{
    JtagCommand, JtagInterface, ScanCommand, ScanRegister, ScanResults, ScanType, WireProtocol,
};
use crate::protocol::{
    input_signals, leds, output_signals, BufferId, CommandId, CommandQueue, InView, QueuedCommand,
    MAX_SCAN_BITS,
};
use crate::scan::{split_scan, ScanExcursions, ScanFragment};
use crate::tap::{tms_path, TapState, TmsPath};
use crate::usb::{UlinkTransport, UlinkUsbDevice, USB_TIMEOUT};

/// Timeout for the init-time self test. Short, because a firmware that is
/// alive answers immediately and a dead one should not stall init for the
/// full transfer timeout.
const SELF_TEST_TIMEOUT: Duration = Duration::from_millis(200);

/// Maximum TCK frequency the adapter can generate, in kHz.
const MAX_TCK_KHZ: u32 = 150;

/// ULINK hardware variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UlinkType {
    /// Original ULINK adapter, based on a Cypress EZ-USB AN2131. Full JTAG
    /// support, no SWD. The only variant this driver supports; ULINK2,
    /// ULINK-PRO and ULINK-ME are different hardware.
    Ulink1,
}

/// Context threaded through command appends so that an append-triggered
/// flush can postprocess scans against the batch being lowered.
struct FlushCtx<'a> {
    ops: &'a [JtagCommand],
    results: &'a mut ScanResults,
    timeout: Duration,
}

/// A ULINK adapter running the OpenULINK firmware.
///
/// The probe owns the USB handle, the pending-command queue and the
/// host-side shadow of the target's TAP state. It is driven from a single
/// thread; all I/O is synchronous with bounded timeouts.
pub struct UlinkProbe<T: UlinkTransport = UlinkUsbDevice> {
    transport: T,
    hardware: UlinkType,
    queue: CommandQueue,
    /// Host-side shadow of the TAP state. Always a stable state.
    tap_state: TapState,
    /// The end-state follower: where the next statemove will go.
    end_state: TapState,
    speed_index: u32,
    slow_commands: bool,
}

impl UlinkProbe<UlinkUsbDevice> {
    /// Opens the first ULINK adapter found on the USB bus.
    pub fn open() -> Result<Self, ProbeCreationError> {
        Ok(Self::from_transport(UlinkUsbDevice::open()?))
    }
}

impl<T: UlinkTransport> std::fmt::Debug for UlinkProbe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UlinkProbe")
            .field("hardware", &self.hardware)
            .field("tap_state", &self.tap_state)
            .field("end_state", &self.end_state)
            .field("speed_index", &self.speed_index)
            .field("slow_commands", &self.slow_commands)
            .finish()
    }
}

impl<T: UlinkTransport> UlinkProbe<T> {
    /// Creates a probe over an already opened transport.
    pub fn from_transport(transport: T) -> Self {
        Self {
            transport,
            hardware: UlinkType::Ulink1,
            queue: CommandQueue::new(),
            tap_state: TapState::Reset,
            end_state: TapState::Reset,
            speed_index: 0,
            slow_commands: false,
        }
    }

    /// The hardware variant behind this probe.
    pub fn hardware(&self) -> UlinkType {
        self.hardware
    }

    /// The current host-side shadow of the TAP state.
    pub fn tap_state(&self) -> TapState {
        self.tap_state
    }

    /// Selects the SLOW_ command variants for all subsequent scans and TMS
    /// sequences. The fast variants are the default.
    pub fn set_slow_commands(&mut self, slow: bool) {
        self.slow_commands = slow;
    }

    /// Queues a CONFIGURE_TCK_FREQ command setting the firmware's three
    /// delay-loop counters, and executes it immediately.
    pub fn configure_tck_delays(
        &mut self,
        delay_scan: u8,
        delay_tck: u8,
        delay_tms: u8,
    ) -> Result<(), UlinkError> {
        self.run_immediate(QueuedCommand::new(
            CommandId::ConfigureTckFreq,
            vec![delay_scan, delay_tck, delay_tms],
        ))?;
        Ok(())
    }

    /// Switches the COM and RUN LEDs. `None` leaves a LED untouched.
    pub fn set_leds(&mut self, com: Option<bool>, run: Option<bool>) -> Result<(), UlinkError> {
        let mut mask = 0;
        match com {
            Some(true) => mask |= leds::COM_ON,
            Some(false) => mask |= leds::COM_OFF,
            None => {}
        }
        match run {
            Some(true) => mask |= leds::RUN_ON,
            Some(false) => mask |= leds::RUN_OFF,
            None => {}
        }
        if mask == 0 {
            return Ok(());
        }
        self.run_immediate(QueuedCommand::new(CommandId::SetLeds, vec![mask]))?;
        Ok(())
    }

    /// Reads the JTAG line states, returning the raw
    /// `(input_signals, output_signals)` bytes.
    pub fn read_signals(&mut self) -> Result<(u8, u8), UlinkError> {
        if !self.queue.is_empty() {
            return Err(UlinkError::Bug("queue not drained before direct command"));
        }
        let arena = self.queue.alloc_arena(2);
        self.queue.push(QueuedCommand {
            id: CommandId::GetSignals,
            payload_out: vec![],
            payload_in: Some(InView {
                buffer: arena,
                offset: 0,
                len: 2,
                owns_origin: true,
            }),
            needs_postprocess: true,
            origin: None,
        })?;
        self.queue.execute(&mut self.transport, USB_TIMEOUT)?;
        let bytes = self
            .queue
            .arena(arena)
            .ok_or(UlinkError::Bug("signal state buffer was released"))?;
        let signals = (bytes[0], bytes[1]);
        self.queue.clear();
        Ok(signals)
    }

    /// Executes a single command outside of any lowered batch. The queue
    /// must be drained, which it always is between `execute_queue` calls.
    fn run_immediate(&mut self, command: QueuedCommand) -> Result<(), UlinkError> {
        if !self.queue.is_empty() {
            return Err(UlinkError::Bug("queue not drained before direct command"));
        }
        self.queue.push(command)?;
        let result = self.queue.execute(&mut self.transport, USB_TIMEOUT);
        self.queue.clear();
        result
    }

    /// Opens the adapter for use: detects whether OpenULINK is running,
    /// downloads it if not, and verifies that the firmware responds.
    pub fn init(&mut self) -> Result<(), UlinkError> {
        self.init_with(None, firmware::RENUMERATION_DELAY)
    }

    pub(crate) fn init_with(
        &mut self,
        image: Option<&FirmwareImage>,
        renumeration_delay: Duration,
    ) -> Result<(), UlinkError> {
        // The manufacturer string tells the firmware apart: the stock Keil
        // firmware (or an unconfigured EZ-USB, which has no string
        // descriptor at all) must be replaced before the device understands
        // our command set.
        let needs_firmware = match self.transport.manufacturer_string(USB_TIMEOUT) {
            Ok(manufacturer) => !manufacturer.starts_with("OpenULINK"),
            Err(error) => {
                tracing::debug!("could not read manufacturer string: {error}");
                true
            }
        };

        if needs_firmware {
            tracing::info!(
                "Loading OpenULINK firmware. This is reversible by power-cycling the ULINK device."
            );
            let loaded;
            let image = match image {
                Some(image) => image,
                None => {
                    loaded = FirmwareImage::from_file(firmware::ULINK_FIRMWARE_FILE)?;
                    &loaded
                }
            };
            firmware::load_firmware_and_renumerate(&mut self.transport, image, renumeration_delay)?;
        } else {
            tracing::info!("ULINK device is already running OpenULINK firmware");
        }

        self.queue.clear();
        self.self_test()?;

        let (input, output) = self.read_signals()?;
        report_signal_states(input, output);

        Ok(())
    }

    /// Issues one TEST command with a short timeout to check that the
    /// firmware accepts commands.
    fn self_test(&mut self) -> Result<(), UlinkError> {
        self.queue
            .push(QueuedCommand::new(CommandId::Test, vec![0xAA]))?;

        if let Err(error) = self.queue.execute(&mut self.transport, SELF_TEST_TIMEOUT) {
            // The firmware may still be offering a bulk IN packet that a
            // crashed host session never fetched, which blocks all further
            // command processing. Retrieve it once.
            tracing::debug!("self test failed ({error}), trying to drain a stale response");
            let mut stale = [0u8; 64];
            if self
                .transport
                .bulk_read(&mut stale, SELF_TEST_TIMEOUT)
                .is_err()
            {
                self.queue.clear();
                return Err(UlinkError::SelfTestFailed);
            }
            tracing::debug!("recovered a stale bulk IN packet");
        }

        self.queue.clear();
        Ok(())
    }

    /// Releases the adapter.
    pub fn quit(&mut self) -> Result<(), UlinkError> {
        self.transport.close();
        Ok(())
    }

    /// Drops all pending commands. A failed [`execute_queue`] leaves the
    /// queue in an unspecified state; it must be cleared before the probe
    /// is used again.
    ///
    /// [`execute_queue`]: Self::execute_queue
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Lowers a batch of JTAG operations into on-wire commands and executes
    /// them, flushing whenever a 64-byte window would overflow and once more
    /// at the end.
    pub fn execute_queue(&mut self, ops: &[JtagCommand]) -> Result<ScanResults, UlinkError> {
        let mut results = ScanResults::default();
        let mut ctx = FlushCtx {
            ops,
            results: &mut results,
            timeout: USB_TIMEOUT,
        };

        for (index, op) in ops.iter().enumerate() {
            match op {
                JtagCommand::Scan(scan) => self.queue_scan(index, scan, &mut ctx)?,
                JtagCommand::TlrReset => self.queue_tlr_reset(&mut ctx)?,
                JtagCommand::RunTest {
                    num_cycles,
                    end_state,
                } => self.queue_runtest(*num_cycles, *end_state, &mut ctx)?,
                JtagCommand::Reset { trst, srst } => self.queue_reset(*trst, *srst, &mut ctx)?,
                JtagCommand::PathMove { path } => self.queue_pathmove(path)?,
                JtagCommand::Sleep { us } => self.queue_sleep(*us, &mut ctx)?,
            }
        }

        if !self.queue.is_empty() {
            self.flush(&mut ctx)?;
        }

        Ok(results)
    }

    /// Appends one command, flushing first if either 64-byte window would
    /// overflow. An append of a command that respects the per-command size
    /// invariant always succeeds.
    fn append(&mut self, command: QueuedCommand, ctx: &mut FlushCtx<'_>) -> Result<(), UlinkError> {
        if !self.queue.fits(&command) {
            self.flush(ctx)?;
        }
        self.queue.push(command)
    }

    /// Executes the queue, postprocesses responses and resets the queue.
    fn flush(&mut self, ctx: &mut FlushCtx<'_>) -> Result<(), UlinkError> {
        self.queue.execute(&mut self.transport, ctx.timeout)?;
        self.post_process_queue(ctx.ops, ctx.results)?;
        self.queue.clear();
        Ok(())
    }

    /// Hands the responses of executed commands back to their originating
    /// operations. Only scans have a non-trivial postprocessor.
    fn post_process_queue(
        &self,
        ops: &[JtagCommand],
        results: &mut ScanResults,
    ) -> Result<(), UlinkError> {
        for command in self.queue.entries() {
            if !command.needs_postprocess {
                continue;
            }
            let Some(origin) = command.origin else {
                continue;
            };
            match ops.get(origin) {
                Some(JtagCommand::Scan(scan)) => {
                    if let Some(view) = &command.payload_in {
                        // The arena spans the entire original scan, not just
                        // this fragment's view.
                        let tdo = self
                            .queue
                            .arena(view.buffer)
                            .ok_or(UlinkError::Bug("postprocessing a released TDO buffer"))?;
                        results.insert(origin, scan.extract_fields(tdo));
                    }
                }
                Some(_) => {}
                None => {
                    return Err(UlinkError::Bug(
                        "postprocess origin outside the executed batch",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Sets the end-state follower. Only stable states are legal.
    fn set_end_state(&mut self, state: TapState) -> Result<(), UlinkError> {
        if !state.is_stable() {
            return Err(UlinkError::Bug("attempted to set an unstable TAP end state"));
        }
        self.end_state = state;
        Ok(())
    }

    /// Moves the TAP shadow from the current state to the end state with
    /// one CLOCK_TMS command. No-op if already there.
    fn queue_statemove(&mut self, ctx: &mut FlushCtx<'_>) -> Result<(), UlinkError> {
        if self.tap_state == self.end_state {
            return Ok(());
        }
        let path = tms_path(self.tap_state, self.end_state)
            .ok_or(UlinkError::Bug("statemove involving an unstable TAP state"))?;
        self.append_clock_tms(path, ctx)?;
        self.tap_state = self.end_state;
        Ok(())
    }

    fn queue_scan(
        &mut self,
        index: usize,
        scan: &ScanCommand,
        ctx: &mut FlushCtx<'_>,
    ) -> Result<(), UlinkError> {
        let total_bits = scan.total_bits();
        if total_bits == 0 {
            return Err(UlinkError::Bug("zero-length scan"));
        }
        let total_bytes = total_bits.div_ceil(8);
        let scan_type = scan.scan_type();

        let tdi = match scan_type {
            ScanType::Out | ScanType::Io => Some(scan.build_tdi()?),
            ScanType::In => None,
        };
        let tdo = match scan_type {
            ScanType::In | ScanType::Io => Some(self.queue.alloc_arena(total_bytes)),
            ScanType::Out => None,
        };

        let (shift_state, pause_state) = match scan.register {
            ScanRegister::Ir => (TapState::IrShift, TapState::IrPause),
            ScanRegister::Dr => (TapState::DrShift, TapState::DrPause),
        };

        self.set_end_state(shift_state)?;
        let first = tms_path(self.tap_state, shift_state)
            .ok_or(UlinkError::Bug("scan started from an unstable TAP state"))?;
        self.tap_state = shift_state;
        self.set_end_state(scan.end_state)?;
        let last = tms_path(shift_state, scan.end_state)
            .ok_or(UlinkError::Bug("scan ends in an unstable TAP state"))?;
        let pause = tms_path(shift_state, pause_state)
            .ok_or(UlinkError::Bug("no SHIFT to PAUSE excursion"))?;
        let resume = tms_path(pause_state, shift_state)
            .ok_or(UlinkError::Bug("no PAUSE to SHIFT excursion"))?;

        let excursions = ScanExcursions {
            first,
            last,
            pause,
            resume,
        };
        for fragment in split_scan(total_bits, &excursions) {
            let command =
                self.scan_fragment_command(index, scan_type, &fragment, tdi.as_deref(), tdo)?;
            self.append(command, ctx)?;
        }

        self.tap_state = scan.end_state;
        Ok(())
    }

    /// Builds the on-wire command for one scan fragment.
    fn scan_fragment_command(
        &self,
        origin: usize,
        scan_type: ScanType,
        fragment: &ScanFragment,
        tdi: Option<&[u8]>,
        tdo: Option<BufferId>,
    ) -> Result<QueuedCommand, UlinkError> {
        if fragment.size_bits > MAX_SCAN_BITS {
            return Err(UlinkError::Bug("scan fragment exceeds the wire ceiling"));
        }

        // A byte with all eight bits valid is encoded as 8, never 0.
        let bits_last_byte = ((fragment.size_bits - 1) % 8 + 1) as u8;

        let mut payload_out = vec![
            fragment.size_bytes as u8,
            bits_last_byte,
            ((fragment.tms_start.count & 0x0F) << 4) | (fragment.tms_end.count & 0x0F),
            fragment.tms_start.sequence,
            fragment.tms_end.sequence,
        ];
        if let Some(tdi) = tdi {
            payload_out
                .extend_from_slice(&tdi[fragment.byte_offset..fragment.byte_offset + fragment.size_bytes]);
        }

        let payload_in = tdo.map(|buffer| InView {
            buffer,
            offset: fragment.byte_offset,
            len: fragment.size_bytes,
            owns_origin: fragment.is_final,
        });

        Ok(QueuedCommand {
            id: self.scan_id(scan_type),
            payload_out,
            payload_in,
            needs_postprocess: fragment.is_final,
            origin: Some(origin),
        })
    }

    fn queue_tlr_reset(&mut self, ctx: &mut FlushCtx<'_>) -> Result<(), UlinkError> {
        // Five TMS ones reach Test-Logic-Reset from any state.
        self.append_clock_tms(
            TmsPath {
                count: 5,
                sequence: 0xFF,
            },
            ctx,
        )?;
        self.tap_state = TapState::Reset;
        Ok(())
    }

    fn queue_runtest(
        &mut self,
        num_cycles: u16,
        end_state: TapState,
        ctx: &mut FlushCtx<'_>,
    ) -> Result<(), UlinkError> {
        if self.tap_state != TapState::Idle {
            self.set_end_state(TapState::Idle)?;
            self.queue_statemove(ctx)?;
        }

        self.append_clock_tck(num_cycles, ctx)?;

        if end_state != self.tap_state {
            self.set_end_state(end_state)?;
            self.queue_statemove(ctx)?;
        }
        Ok(())
    }

    fn queue_reset(
        &mut self,
        trst: bool,
        srst: bool,
        ctx: &mut FlushCtx<'_>,
    ) -> Result<(), UlinkError> {
        let mut low = 0;
        let mut high = 0;

        // TRST and SRST are active-low on the hardware; asserting a reset
        // means setting its bit in the high mask.
        if trst {
            // The target TAP is held in Test-Logic-Reset by the line.
            self.tap_state = TapState::Reset;
            high |= output_signals::TRST;
        } else {
            low |= output_signals::TRST;
        }

        if srst {
            high |= output_signals::RESET;
        } else {
            low |= output_signals::RESET;
        }

        self.append_set_signals(low, high, ctx)
    }

    fn queue_pathmove(&mut self, path: &[TapState]) -> Result<(), UlinkError> {
        // Accepted for interface completeness; the firmware never sees it.
        tracing::debug!("ignoring PATHMOVE over {} states", path.len());
        Ok(())
    }

    fn queue_sleep(&mut self, us: u32, ctx: &mut FlushCtx<'_>) -> Result<(), UlinkError> {
        // The wait must happen on-device: a host-side sleep would start at
        // an arbitrary time relative to the queued JTAG work around it.
        if us > u32::from(u16::MAX) {
            let ms = (us / 1000).min(u32::from(u16::MAX)) as u16;
            let rest = (us - u32::from(ms) * 1000).min(u32::from(u16::MAX)) as u16;
            self.append_sleep_ms(ms, ctx)?;
            self.append_sleep_us(rest, ctx)
        } else {
            self.append_sleep_us(us as u16, ctx)
        }
    }

    fn append_clock_tms(&mut self, path: TmsPath, ctx: &mut FlushCtx<'_>) -> Result<(), UlinkError> {
        let id = if self.slow_commands {
            CommandId::SlowClockTms
        } else {
            CommandId::ClockTms
        };
        self.append(QueuedCommand::new(id, vec![path.count, path.sequence]), ctx)
    }

    fn append_clock_tck(&mut self, count: u16, ctx: &mut FlushCtx<'_>) -> Result<(), UlinkError> {
        self.append(
            QueuedCommand::new(CommandId::ClockTck, count.to_le_bytes().to_vec()),
            ctx,
        )
    }

    fn append_set_signals(
        &mut self,
        low: u8,
        high: u8,
        ctx: &mut FlushCtx<'_>,
    ) -> Result<(), UlinkError> {
        self.append(QueuedCommand::new(CommandId::SetSignals, vec![low, high]), ctx)
    }

    fn append_sleep_us(&mut self, us: u16, ctx: &mut FlushCtx<'_>) -> Result<(), UlinkError> {
        self.append(
            QueuedCommand::new(CommandId::SleepUs, us.to_le_bytes().to_vec()),
            ctx,
        )
    }

    fn append_sleep_ms(&mut self, ms: u16, ctx: &mut FlushCtx<'_>) -> Result<(), UlinkError> {
        self.append(
            QueuedCommand::new(CommandId::SleepMs, ms.to_le_bytes().to_vec()),
            ctx,
        )
    }

    fn scan_id(&self, scan_type: ScanType) -> CommandId {
        match (scan_type, self.slow_commands) {
            (ScanType::In, false) => CommandId::ScanIn,
            (ScanType::In, true) => CommandId::SlowScanIn,
            (ScanType::Out, false) => CommandId::ScanOut,
            (ScanType::Out, true) => CommandId::SlowScanOut,
            (ScanType::Io, false) => CommandId::ScanIo,
            (ScanType::Io, true) => CommandId::SlowScanIo,
        }
    }
}

/// Logs the line states returned by GET_SIGNALS. TRST and SRST read
/// inverted because the hardware inverts them.
fn report_signal_states(input: u8, output: u8) {
    tracing::info!(
        "ULINK signal states: TDI: {}, TDO: {}, TMS: {}, TCK: {}, TRST: {}, SRST: {}",
        u8::from(output & output_signals::TDI != 0),
        u8::from(input & input_signals::TDO != 0),
        u8::from(output & output_signals::TMS != 0),
        u8::from(output & output_signals::TCK != 0),
        u8::from(output & output_signals::TRST == 0),
        u8::from(output & output_signals::RESET == 0),
    );
}

impl<T: UlinkTransport> JtagInterface for UlinkProbe<T> {
    fn name(&self) -> &'static str {
        "ulink"
    }

    fn transports(&self) -> &'static [WireProtocol] {
        &[WireProtocol::Jtag]
    }

    fn init(&mut self) -> Result<(), UlinkError> {
        UlinkProbe::init(self)
    }

    fn quit(&mut self) -> Result<(), UlinkError> {
        UlinkProbe::quit(self)
    }

    fn execute_queue(&mut self, ops: &[JtagCommand]) -> Result<ScanResults, UlinkError> {
        UlinkProbe::execute_queue(self, ops)
    }

    fn khz(&mut self, khz: u32) -> Result<u32, UlinkError> {
        if khz == 0 {
            // khz == 0 requests adaptive clocking from RTCK, which the
            // adapter cannot do.
            return Err(UlinkError::RclkNotSupported);
        }
        if khz > MAX_TCK_KHZ {
            return Err(UlinkError::UnsupportedSpeed(khz));
        }
        tracing::info!("requested TCK frequency: {khz} kHz");
        Ok(0)
    }

    fn speed(&mut self, index: u32) -> Result<(), UlinkError> {
        // Recorded only; the firmware's TCK delay counters are configured
        // through `configure_tck_delays` and the SLOW_ variants through
        // `set_slow_commands`.
        self.speed_div(index)?;
        self.speed_index = index;
        Ok(())
    }

    fn speed_div(&mut self, index: u32) -> Result<u32, UlinkError> {
        match index {
            0 => Ok(MAX_TCK_KHZ),
            1 => Ok(100),
            _ => Err(UlinkError::InvalidSpeedIndex(index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jtag::ScanField;
    use crate::usb::testing::{MockEvent, MockTransport};
    use bitvec::prelude::*;
    use pretty_assertions::assert_eq;

    fn probe_at(state: TapState) -> UlinkProbe<MockTransport> {
        let mut probe = UlinkProbe::from_transport(MockTransport::default());
        probe.tap_state = state;
        probe.end_state = state;
        probe
    }

    fn io_scan(register: ScanRegister, num_bits: usize, tdi: &[u8]) -> JtagCommand {
        JtagCommand::Scan(ScanCommand {
            register,
            fields: vec![ScanField {
                num_bits,
                out: Some(tdi.to_vec()),
                capture: true,
            }],
            end_state: TapState::Idle,
        })
    }

    #[test]
    fn ir_scan_of_one_byte_is_a_single_scan_io() {
        let mut probe = probe_at(TapState::Idle);
        probe.transport.push_response(&[0x5A]);

        let ops = [io_scan(ScanRegister::Ir, 8, &[0xA5])];
        let mut results = probe.execute_queue(&ops).unwrap();

        // IDLE -> IRSHIFT is (4, 0x03); IRSHIFT -> IDLE is (3, 0x03).
        assert_eq!(
            probe.transport.packets(),
            vec![&[0x04, 0x01, 0x08, 0x43, 0x03, 0x03, 0xA5][..]]
        );
        assert_eq!(probe.tap_state(), TapState::Idle);

        let fields = results.take(0).unwrap();
        assert_eq!(fields[0].as_ref().unwrap().clone().into_vec(), vec![0x5A]);
    }

    #[test]
    fn a_500_bit_dr_scan_splits_with_pause_excursions() {
        let mut probe = probe_at(TapState::Idle);
        let tdi: Vec<u8> = (0..63).collect();
        probe.transport.push_response(&vec![0xEE; 58]);
        probe.transport.push_response(&[0xD0, 0xD1, 0xD2, 0xD3, 0x0D]);

        let ops = [io_scan(ScanRegister::Dr, 500, &tdi)];
        let mut results = probe.execute_queue(&ops).unwrap();

        let packets: Vec<Vec<u8>> = probe
            .transport
            .packets()
            .iter()
            .map(|p| p.to_vec())
            .collect();
        assert_eq!(packets.len(), 2);

        // First fragment: full 58 bytes, IDLE -> DRSHIFT (3, 0x01) in,
        // DRSHIFT -> DRPAUSE (2, 0x01) out.
        assert_eq!(packets[0].len(), 64);
        assert_eq!(&packets[0][..6], &[0x04, 58, 0x08, 0x32, 0x01, 0x01]);
        assert_eq!(&packets[0][6..], &tdi[..58]);

        // Final fragment: 5 bytes, 4 valid bits in the last byte,
        // DRPAUSE -> DRSHIFT (2, 0x01) in, DRSHIFT -> IDLE (3, 0x03) out.
        assert_eq!(&packets[1][..6], &[0x04, 5, 0x04, 0x23, 0x01, 0x03]);
        assert_eq!(&packets[1][6..], &tdi[58..]);

        assert_eq!(probe.tap_state(), TapState::Idle);

        let fields = results.take(0).unwrap();
        let captured = fields[0].as_ref().unwrap();
        assert_eq!(captured.len(), 500);
        let mut tdo: Vec<u8> = vec![0xEE; 58];
        tdo.extend_from_slice(&[0xD0, 0xD1, 0xD2, 0xD3, 0x0D]);
        assert_eq!(captured.as_bitslice(), &tdo.view_bits::<Lsb0>()[..500]);
    }

    #[test]
    fn tlr_reset_is_five_tms_ones() {
        let mut probe = probe_at(TapState::DrPause);
        probe.execute_queue(&[JtagCommand::TlrReset]).unwrap();

        assert_eq!(probe.transport.packets(), vec![&[0x06, 5, 0xFF][..]]);
        assert_eq!(probe.tap_state(), TapState::Reset);
    }

    #[test]
    fn runtest_moves_to_idle_before_clocking() {
        let mut probe = probe_at(TapState::DrPause);
        probe
            .execute_queue(&[JtagCommand::RunTest {
                num_cycles: 1024,
                end_state: TapState::Idle,
            }])
            .unwrap();

        // DRPAUSE -> IDLE is (3, 0x03), then 1024 TCK cycles.
        assert_eq!(
            probe.transport.packets(),
            vec![&[0x06, 3, 0x03, 0x08, 0x00, 0x04][..]]
        );
        assert_eq!(probe.tap_state(), TapState::Idle);
    }

    #[test]
    fn runtest_from_idle_skips_the_statemove() {
        let mut probe = probe_at(TapState::Idle);
        probe
            .execute_queue(&[JtagCommand::RunTest {
                num_cycles: 1,
                end_state: TapState::Idle,
            }])
            .unwrap();

        assert_eq!(probe.transport.packets(), vec![&[0x08, 0x01, 0x00][..]]);
    }

    #[test]
    fn trst_assertion_sets_the_high_mask_and_tap_shadow() {
        let mut probe = probe_at(TapState::Idle);
        probe
            .execute_queue(&[JtagCommand::Reset {
                trst: true,
                srst: false,
            }])
            .unwrap();

        // TRST asserted -> high mask; SRST deasserted -> low mask.
        assert_eq!(probe.transport.packets(), vec![&[0x0C, 0x20, 0x08][..]]);
        assert_eq!(probe.tap_state(), TapState::Reset);
    }

    #[test]
    fn sleep_is_queued_on_device() {
        let mut probe = probe_at(TapState::Idle);
        probe.execute_queue(&[JtagCommand::Sleep { us: 500 }]).unwrap();
        assert_eq!(probe.transport.packets(), vec![&[0x09, 0xF4, 0x01][..]]);
    }

    #[test]
    fn long_sleeps_use_the_millisecond_command() {
        let mut probe = probe_at(TapState::Idle);
        probe
            .execute_queue(&[JtagCommand::Sleep { us: 70_500 }])
            .unwrap();
        // 70 ms on the millisecond path, 500 us remainder.
        assert_eq!(
            probe.transport.packets(),
            vec![&[0x0A, 70, 0x00, 0x09, 0xF4, 0x01][..]]
        );
    }

    #[test]
    fn appends_flush_when_the_out_window_would_overflow() {
        let mut probe = probe_at(TapState::Idle);
        // Each TLR reset queues one 3-byte CLOCK_TMS; 21 of them fill 63 of
        // the 64 OUT bytes, so the 22nd must flush first.
        let ops = vec![JtagCommand::TlrReset; 22];
        probe.execute_queue(&ops).unwrap();

        let packets = probe.transport.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 63);
        assert_eq!(packets[1], &[0x06, 5, 0xFF][..]);
    }

    #[test]
    fn slow_commands_select_the_slow_ids() {
        let mut probe = probe_at(TapState::Idle);
        probe.set_slow_commands(true);
        probe.transport.push_response(&[0x00]);

        let ops = [
            io_scan(ScanRegister::Dr, 8, &[0xFF]),
            JtagCommand::TlrReset,
        ];
        probe.execute_queue(&ops).unwrap();

        let packets = probe.transport.packets();
        assert_eq!(packets[0][0], 0x05); // SLOW_SCAN_IO
        assert_eq!(packets[0][7], 0x07); // SLOW_CLOCK_TMS
    }

    #[test]
    fn pathmove_is_accepted_without_emission() {
        let mut probe = probe_at(TapState::Idle);
        probe
            .execute_queue(&[JtagCommand::PathMove {
                path: vec![TapState::DrSelect, TapState::DrCapture],
            }])
            .unwrap();
        assert!(probe.transport.packets().is_empty());
        assert_eq!(probe.tap_state(), TapState::Idle);
    }

    #[test]
    fn clock_policy_rejects_rclk_and_fast_clocks() {
        let mut probe = probe_at(TapState::Idle);
        assert!(matches!(probe.khz(0), Err(UlinkError::RclkNotSupported)));
        assert!(matches!(
            probe.khz(151),
            Err(UlinkError::UnsupportedSpeed(151))
        ));
        assert_eq!(probe.khz(150).unwrap(), 0);
        assert_eq!(probe.khz(1).unwrap(), 0);
        assert_eq!(probe.speed_div(0).unwrap(), 150);
        assert_eq!(probe.speed_div(1).unwrap(), 100);
        assert!(matches!(
            probe.speed_div(2),
            Err(UlinkError::InvalidSpeedIndex(2))
        ));
        probe.speed(1).unwrap();
        assert_eq!(probe.speed_index, 1);
    }

    #[test]
    fn init_loads_firmware_when_the_keil_firmware_answers() {
        let mut transport = MockTransport::with_manufacturer("Keil ULINK");
        transport.manufacturer_after_reopen = Some("OpenULINK".to_string());
        // GET_SIGNALS response: TDO high, all outputs low.
        transport.push_response(&[0x01, 0x00]);

        let mut image = FirmwareImage::default();
        image.sections.push(crate::firmware::FirmwareSection {
            base_address: 0x0000,
            data: vec![0x02, 0x01, 0x00],
        });

        let mut probe = UlinkProbe::from_transport(transport);
        probe.init_with(Some(&image), Duration::ZERO).unwrap();

        let cpucs = |bit: u8| MockEvent::ControlWrite {
            request: 0xA0,
            value: 0x7F92,
            index: 0,
            data: vec![bit],
        };
        assert_eq!(
            probe.transport.log,
            vec![
                cpucs(0x01),
                MockEvent::ControlWrite {
                    request: 0xA0,
                    value: 0x0000,
                    index: 0,
                    data: vec![0x02, 0x01, 0x00],
                },
                cpucs(0x00),
                MockEvent::Close,
                MockEvent::Reopen,
                // Self test, then the signal probe.
                MockEvent::BulkWrite(vec![0x0F, 0xAA]),
                MockEvent::BulkWrite(vec![0x0B]),
                MockEvent::BulkRead,
            ]
        );
    }

    #[test]
    fn init_skips_the_loader_when_openulink_is_running() {
        let mut transport = MockTransport::with_manufacturer("OpenULINK 1.0");
        transport.push_response(&[0x01, 0x00]);

        let mut probe = UlinkProbe::from_transport(transport);
        probe.init_with(None, Duration::ZERO).unwrap();

        assert_eq!(
            probe.transport.log,
            vec![
                MockEvent::BulkWrite(vec![0x0F, 0xAA]),
                MockEvent::BulkWrite(vec![0x0B]),
                MockEvent::BulkRead,
            ]
        );
    }

    #[test]
    fn init_recovers_a_stale_bulk_in_packet_once() {
        let mut transport = MockTransport::with_manufacturer("OpenULINK 1.0");
        transport.fail_bulk_writes = 1;
        // The stale packet from a crashed session, then the signal states.
        transport.push_response(&[0u8; 64]);
        transport.push_response(&[0x01, 0x00]);

        let mut probe = UlinkProbe::from_transport(transport);
        probe.init_with(None, Duration::ZERO).unwrap();
    }

    #[test]
    fn init_fails_when_the_device_stays_silent() {
        let mut transport = MockTransport::with_manufacturer("OpenULINK 1.0");
        transport.fail_bulk_writes = 1;
        transport.fail_bulk_reads = 1;

        let mut probe = UlinkProbe::from_transport(transport);
        let err = probe.init_with(None, Duration::ZERO).unwrap_err();
        assert!(matches!(err, UlinkError::SelfTestFailed));
    }

    #[test]
    fn set_leds_prefers_the_off_bits() {
        let mut probe = probe_at(TapState::Idle);
        probe.set_leds(Some(true), Some(false)).unwrap();
        probe.set_leds(None, None).unwrap();
        assert_eq!(probe.transport.packets(), vec![&[0x0E, 0x09][..]]);
    }

    #[test]
    fn tck_delay_counters_go_out_as_one_command() {
        let mut probe = probe_at(TapState::Idle);
        probe.configure_tck_delays(0x10, 0x20, 0x30).unwrap();
        assert_eq!(
            probe.transport.packets(),
            vec![&[0x0D, 0x10, 0x20, 0x30][..]]
        );
    }

    #[test]
    fn signals_round_trip_through_get_signals() {
        let mut probe = probe_at(TapState::Idle);
        probe.transport.push_response(&[0x03, 0x28]);
        let (input, output) = probe.read_signals().unwrap();
        assert_eq!(input, 0x03);
        assert_eq!(output, 0x28);
        assert!(probe.queue.is_empty());
    }
}
