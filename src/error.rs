//! Error types for the ULINK driver.

/// This error occurs whenever the driver encounters a problem while
/// operating the ULINK adapter.
///
/// Transport failures ([`UlinkError::Usb`], [`UlinkError::IncompleteResponse`],
/// [`UlinkError::IncompleteTransfer`]) leave the command queue in an
/// unspecified state; the caller must clear the queue (or tear the probe
/// down) before reusing it. [`UlinkError::Bug`] indicates a violated driver
/// invariant and should be treated as fatal. The configuration refusals
/// ([`UlinkError::RclkNotSupported`], [`UlinkError::UnsupportedSpeed`]) are
/// recoverable by retrying with a different value.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum UlinkError {
    /// USB communication error.
    Usb(#[source] std::io::Error),

    /// The probe could not be created.
    ProbeCouldNotBeCreated(#[from] ProbeCreationError),

    /// The device answered with {actual} bytes where {expected} were expected.
    IncompleteResponse {
        /// Number of response bytes the queued commands require.
        expected: usize,
        /// Number of bytes the device actually returned.
        actual: usize,
    },

    /// The device accepted only {actual} of {expected} bytes of a bulk transfer.
    IncompleteTransfer {
        /// Length of the packed command buffer.
        expected: usize,
        /// Number of bytes the device actually accepted.
        actual: usize,
    },

    /// Adaptive clocking (RCLK) is not supported by the ULINK adapter.
    RclkNotSupported,

    /// The requested TCK frequency of {0} kHz is above the ~150 kHz the adapter can generate.
    UnsupportedSpeed(u32),

    /// The speed index {0} does not name a known TCK setting.
    InvalidSpeedIndex(u32),

    /// Loading the OpenULINK firmware onto the adapter failed.
    FirmwareLoad(#[from] FirmwareLoadError),

    /// Cannot communicate with the ULINK device. Disconnect it from the USB port, re-connect it, and retry.
    SelfTestFailed,

    /// BUG: {0}
    Bug(&'static str),

    /// Some other error occurred.
    #[display("{0}")]
    Other(#[from] anyhow::Error),
}

/// An error during probe creation occurred.
/// This is almost always a sign of a bad USB setup.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ProbeCreationError {
    /// The ULINK device was not found. This can be due to permissions.
    NotFound,

    /// A USB error occurred.
    Usb(#[source] std::io::Error),

    /// Something else happened.
    #[display("{0}")]
    Other(&'static str),
}

/// An error while reading or streaming the OpenULINK firmware image.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum FirmwareLoadError {
    /// The firmware image could not be read.
    Io(#[from] std::io::Error),

    /// The firmware image is not a valid Intel HEX file.
    Parse(#[from] ihex::ReaderError),

    /// A firmware record lies outside the 16-bit EZ-USB code space.
    AddressOutOfRange,

    /// The device accepted only part of a firmware-load control transfer.
    ShortControlWrite,
}
