//! Unified error types for the OTA engine.
//!
//! A single `Error` enum that every subsystem converts into, so the host
//! runtime handles failures uniformly.  All variants are `Copy`; nothing on
//! the protocol path allocates to report a failure.
//!
//! Protocol-level problems never surface as `Error` to a remote peer: the
//! engines turn them into ZCL status codes (see
//! [`ZclStatus`](crate::protocol::ZclStatus)).

use core::fmt;

use crate::protocol::ZclStatus;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A wire record failed structural validation.
    Decode(DecodeError),
    /// A wire record did not fit its output buffer.
    Encode(EncodeError),
    /// The network transport refused a frame.
    Transport(TransportError),
    /// The staging flash region failed.
    Storage(StorageError),
    /// The file provider could not accept a request.
    Provider(ProviderError),
    /// The downloaded OTA file is not acceptable.
    Image(ImageError),
    /// Configuration is invalid.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode: {e}"),
            Self::Encode(e) => write!(f, "encode: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Provider(e) => write!(f, "provider: {e}"),
            Self::Image(e) => write!(f, "image: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

// ---------------------------------------------------------------------------
// Wire codec errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the record requires.
    Truncated,
    /// Payload length is not one of the lengths the record allows.
    BadLength { len: usize },
    /// A status byte that is not a known ZCL status.
    UnknownStatus(u8),
    /// A status that this record cannot carry.
    UnexpectedStatus(ZclStatus),
    /// A field value outside its defined range.
    BadField(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "record truncated"),
            Self::BadLength { len } => write!(f, "invalid payload length {len}"),
            Self::UnknownStatus(s) => write!(f, "unknown status 0x{s:02X}"),
            Self::UnexpectedStatus(s) => write!(f, "unexpected status {s:?}"),
            Self::BadField(name) => write!(f, "invalid field: {name}"),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<DecodeError> for ZclStatus {
    fn from(_: DecodeError) -> Self {
        ZclStatus::MalformedCommand
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The output buffer is full.
    BufferFull,
    /// Block data longer than the transport unit.
    DataTooLong { len: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferFull => write!(f, "output buffer full"),
            Self::DataTooLong { len } => write!(f, "block data too long ({len} bytes)"),
        }
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

// ---------------------------------------------------------------------------
// Port errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No route to the destination.
    NoRoute,
    /// The transmit queue is full.
    Busy,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoute => write!(f, "no route to destination"),
            Self::Busy => write!(f, "transmit queue busy"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Operation attempted before `open()`.
    NotOpen,
    /// Page index or offset outside the staging region.
    OutOfRange,
    /// The underlying flash reported a failure.
    Io,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOpen => write!(f, "staging region not open"),
            Self::OutOfRange => write!(f, "access outside staging region"),
            Self::Io => write!(f, "flash I/O failure"),
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider cannot accept another request right now.
    Busy,
    /// The side channel to the provider is down.
    Unavailable,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "provider busy"),
            Self::Unavailable => write!(f, "provider unavailable"),
        }
    }
}

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

// ---------------------------------------------------------------------------
// Image errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// OTA file header magic is wrong.
    BadMagic(u32),
    /// Header length outside the range the format defines.
    BadHeaderLength(u16),
    /// Header file identifier differs from the offered one.
    FileIdMismatch,
    /// Header total size differs from the offered image size.
    SizeMismatch { header: u32, offered: u32 },
    /// Data continues past the declared image size.
    Overrun,
    /// Image ended without an upgrade-image sub-element.
    MissingPayload,
    /// Staged payload does not fit in the staging region.
    TooLarge { len: u32, capacity: u32 },
    /// No valid metadata record in the staging region.
    NoStagedImage,
    /// Staged payload CRC does not match the metadata record.
    CrcMismatch { expected: u32, actual: u32 },
    /// Staging flash failed underneath the image pipeline.
    Storage(StorageError),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic(m) => write!(f, "bad OTA header magic 0x{m:08X}"),
            Self::BadHeaderLength(l) => write!(f, "bad OTA header length {l}"),
            Self::FileIdMismatch => write!(f, "header file id does not match offer"),
            Self::SizeMismatch { header, offered } => {
                write!(f, "header size {header} != offered size {offered}")
            }
            Self::Overrun => write!(f, "data past end of image"),
            Self::MissingPayload => write!(f, "no upgrade image sub-element"),
            Self::TooLarge { len, capacity } => {
                write!(f, "image of {len} bytes exceeds staging capacity {capacity}")
            }
            Self::NoStagedImage => write!(f, "no staged image"),
            Self::CrcMismatch { expected, actual } => {
                write!(f, "staged CRC 0x{actual:08X} != recorded 0x{expected:08X}")
            }
            Self::Storage(e) => write!(f, "staging: {e}"),
        }
    }
}

impl From<StorageError> for ImageError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ImageError> for Error {
    fn from(e: ImageError) -> Self {
        Self::Image(e)
    }
}

impl From<ImageError> for ZclStatus {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::Storage(_) | ImageError::TooLarge { .. } => ZclStatus::Abort,
            _ => ZclStatus::InvalidImage,
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
