//! The OpenULINK on-wire command model and the pending-command queue.
//!
//! Every command on the wire is `<id> <payload_out...>`. The firmware
//! executes one bulk OUT packet of concatenated commands in order and
//! answers with a single bulk IN packet holding the concatenated response
//! payloads, with no framing. Both directions are limited to 64 bytes per
//! batch, which is the invariant [`CommandQueue`] maintains.

use std::time::Duration;

use crate::error::UlinkError;
use crate::usb::UlinkTransport;

/// Size of the firmware's USB I/O buffers, per direction.
pub(crate) const MAX_PACKET_SIZE: usize = 64;

/// Fixed setup bytes preceding the TDI data of a scan command.
pub(crate) const SCAN_SETUP_BYTES: usize = 5;

/// Maximum TDI bytes of a single scan command: 64 minus one ID byte and the
/// scan setup. This is the scan-fragment ceiling.
pub(crate) const MAX_SCAN_BYTES: usize = MAX_PACKET_SIZE - 1 - SCAN_SETUP_BYTES;

/// Maximum bits a single scan command can shift.
pub(crate) const MAX_SCAN_BITS: usize = MAX_SCAN_BYTES * 8;

/// OpenULINK command IDs. The SLOW_ variants run the same operation through
/// the firmware's delay-loop paths for low TCK rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CommandId {
    ScanIn = 0x00,
    SlowScanIn = 0x01,
    ScanOut = 0x02,
    SlowScanOut = 0x03,
    ScanIo = 0x04,
    SlowScanIo = 0x05,
    ClockTms = 0x06,
    SlowClockTms = 0x07,
    ClockTck = 0x08,
    SleepUs = 0x09,
    SleepMs = 0x0A,
    GetSignals = 0x0B,
    SetSignals = 0x0C,
    ConfigureTckFreq = 0x0D,
    SetLeds = 0x0E,
    Test = 0x0F,
}

/// Output signal bits as understood by CMD_SET_SIGNALS and reported in the
/// second CMD_GET_SIGNALS byte. TRST and RESET are inverted by hardware.
#[allow(dead_code)]
pub(crate) mod output_signals {
    pub const TDI: u8 = 1 << 0;
    pub const TMS: u8 = 1 << 1;
    pub const TCK: u8 = 1 << 2;
    pub const TRST: u8 = 1 << 3;
    pub const BRKIN: u8 = 1 << 4;
    pub const RESET: u8 = 1 << 5;
    pub const OCDSE: u8 = 1 << 6;
}

/// Input signal bits reported in the first CMD_GET_SIGNALS byte.
#[allow(dead_code)]
pub(crate) mod input_signals {
    pub const TDO: u8 = 1 << 0;
    pub const BRKOUT: u8 = 1 << 1;
}

/// CMD_SET_LEDS bits. An off-bit beats the matching on-bit.
pub(crate) mod leds {
    pub const COM_ON: u8 = 1 << 0;
    pub const RUN_ON: u8 = 1 << 1;
    pub const COM_OFF: u8 = 1 << 2;
    pub const RUN_OFF: u8 = 1 << 3;
}

/// Handle of an IN-payload arena held by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferId(usize);

/// Destination of a command's response bytes: a sub-range of an arena.
///
/// The fragments of one split scan all point into the same arena; only the
/// final fragment carries `owns_origin` and releases the arena when it is
/// destroyed.
#[derive(Debug, Clone)]
pub(crate) struct InView {
    pub buffer: BufferId,
    pub offset: usize,
    pub len: usize,
    pub owns_origin: bool,
}

/// One pending command.
#[derive(Debug, Clone)]
pub(crate) struct QueuedCommand {
    pub id: CommandId,
    pub payload_out: Vec<u8>,
    pub payload_in: Option<InView>,
    pub needs_postprocess: bool,
    /// Index of the abstract operation that spawned this command, if its
    /// response needs to be handed back.
    pub origin: Option<usize>,
}

impl QueuedCommand {
    /// A command without response bytes or postprocessing.
    pub fn new(id: CommandId, payload_out: Vec<u8>) -> Self {
        Self {
            id,
            payload_out,
            payload_in: None,
            needs_postprocess: false,
            origin: None,
        }
    }

    /// Bytes this command occupies in the OUT packet, including its ID.
    pub fn out_len(&self) -> usize {
        1 + self.payload_out.len()
    }

    /// Bytes this command expects in the IN packet.
    pub fn in_len(&self) -> usize {
        self.payload_in.as_ref().map_or(0, |view| view.len)
    }
}

/// The pending-command queue with its two cached direction counters.
///
/// `bytes_out <= 64` and `bytes_in <= 64` hold at all times; the driver
/// flushes before any append that would break them. The queue also owns the
/// IN-payload arenas that responses are scattered into.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    entries: Vec<QueuedCommand>,
    arenas: Vec<Option<Vec<u8>>>,
    free_arenas: Vec<usize>,
    bytes_out: usize,
    bytes_in: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes_out(&self) -> usize {
        self.bytes_out
    }

    pub fn bytes_in(&self) -> usize {
        self.bytes_in
    }

    pub fn entries(&self) -> &[QueuedCommand] {
        &self.entries
    }

    /// Whether `command` can be appended without breaking the 64-byte
    /// windows.
    pub fn fits(&self, command: &QueuedCommand) -> bool {
        self.bytes_out + command.out_len() <= MAX_PACKET_SIZE
            && self.bytes_in + command.in_len() <= MAX_PACKET_SIZE
    }

    /// Appends a command. The caller must have flushed beforehand if the
    /// command does not fit; a command that does not even fit an empty
    /// queue violates the per-command size invariant.
    pub fn push(&mut self, command: QueuedCommand) -> Result<(), UlinkError> {
        if command.out_len() > MAX_PACKET_SIZE || command.in_len() > MAX_PACKET_SIZE {
            return Err(UlinkError::Bug("oversized payload for a single command"));
        }
        if let Some(view) = &command.payload_in {
            let arena_len = self
                .arena(view.buffer)
                .ok_or(UlinkError::Bug("command points at a released IN arena"))?
                .len();
            if view.offset + view.len > arena_len {
                return Err(UlinkError::Bug("IN view lies outside its arena"));
            }
        }
        if !self.fits(&command) {
            return Err(UlinkError::Bug("append would overflow the packet window"));
        }

        self.bytes_out += command.out_len();
        self.bytes_in += command.in_len();
        self.entries.push(command);
        Ok(())
    }

    /// Allocates a zeroed IN arena of `len` bytes.
    pub fn alloc_arena(&mut self, len: usize) -> BufferId {
        let arena = vec![0u8; len];
        match self.free_arenas.pop() {
            Some(index) => {
                self.arenas[index] = Some(arena);
                BufferId(index)
            }
            None => {
                self.arenas.push(Some(arena));
                BufferId(self.arenas.len() - 1)
            }
        }
    }

    /// The full contents of an arena, or `None` if it was released.
    pub fn arena(&self, id: BufferId) -> Option<&[u8]> {
        self.arenas.get(id.0)?.as_deref()
    }

    /// The bytes a view points at.
    pub fn view_bytes(&self, view: &InView) -> Option<&[u8]> {
        Some(&self.arena(view.buffer)?[view.offset..view.offset + view.len])
    }

    /// Packs the queue into one bulk OUT packet, fires the bulk IN if any
    /// response bytes are expected, and scatters them back into the queued
    /// commands' views in queue order.
    ///
    /// On error the queue contents are unspecified; the caller must
    /// [`clear`](Self::clear) before reuse.
    pub fn execute<T: UlinkTransport>(
        &mut self,
        transport: &mut T,
        timeout: Duration,
    ) -> Result<(), UlinkError> {
        if self.entries.is_empty() {
            return Ok(());
        }

        let mut packet = Vec::with_capacity(self.bytes_out);
        for command in &self.entries {
            packet.push(command.id as u8);
            packet.extend_from_slice(&command.payload_out);
        }
        debug_assert_eq!(packet.len(), self.bytes_out);

        tracing::trace!(
            "executing {} queued commands, {} bytes out, {} bytes in",
            self.entries.len(),
            self.bytes_out,
            self.bytes_in
        );

        let written = transport
            .bulk_write(&packet, timeout)
            .map_err(UlinkError::Usb)?;
        if written != packet.len() {
            return Err(UlinkError::IncompleteTransfer {
                expected: packet.len(),
                actual: written,
            });
        }

        if self.bytes_in > 0 {
            let mut response = [0u8; MAX_PACKET_SIZE];
            let read = transport
                .bulk_read(&mut response, timeout)
                .map_err(UlinkError::Usb)?;
            if read != self.bytes_in {
                return Err(UlinkError::IncompleteResponse {
                    expected: self.bytes_in,
                    actual: read,
                });
            }

            let Self {
                entries, arenas, ..
            } = self;
            let mut cursor = 0;
            for command in entries.iter() {
                if let Some(view) = &command.payload_in {
                    let arena = arenas[view.buffer.0]
                        .as_mut()
                        .ok_or(UlinkError::Bug("response targets a released IN arena"))?;
                    arena[view.offset..view.offset + view.len]
                        .copy_from_slice(&response[cursor..cursor + view.len]);
                    cursor += view.len;
                }
            }
        }

        Ok(())
    }

    /// Destroys all entries and resets both byte counters. IN arenas are
    /// released only through the entry that owns them; arenas still shared
    /// with not-yet-queued scan fragments survive.
    pub fn clear(&mut self) {
        let Self {
            entries,
            arenas,
            free_arenas,
            ..
        } = self;
        for command in entries.drain(..) {
            if let Some(view) = command.payload_in {
                if view.owns_origin {
                    arenas[view.buffer.0] = None;
                    free_arenas.push(view.buffer.0);
                }
            }
        }
        self.bytes_out = 0;
        self.bytes_in = 0;
    }
}
