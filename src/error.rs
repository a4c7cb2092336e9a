// Error model for the loader. Every failure is detected before the commit
// step and reported to the syscall layer as a single negative status.

pub const EIO: i16 = 5;
pub const E2BIG: i16 = 7;
pub const ENOEXEC: i16 = 8;
pub const ENOMEM: i16 = 12;
pub const EINVAL: i16 = 22;
pub const EFBIG: i16 = 27;

/// Unified loader error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// Leading bytes match no supported format.
    BadMagic,
    /// Recognized family, but a variant or feature we do not load.
    UnsupportedFormat,
    /// Structurally bad header (truncated, bad type field, zero text).
    BadHeader,
    /// A header field combination that can never be valid.
    InvalidHeaderField,
    /// Image declares compressed segments and no decompressor is wired in.
    CompressionUnsupported,
    /// Decompressed length did not match the declared segment size.
    BadCompressedData,
    /// Stack or heap addition overflowed the 16-bit segment space.
    TooBig,
    /// Argument/environment block does not fit.
    ArgTooBig,
    /// Segment table exceeds the fixed maximum.
    TableOverflow,
    /// Segment allocation failed.
    OutOfMemory,
    /// Backing store returned fewer bytes than required.
    ShortRead,
    /// Backing store read failed outright.
    Io,
    /// Malformed or unsupported relocation stream.
    BadRelocation,
}

pub type ExecResult<T> = Result<T, ExecError>;

impl ExecError {
    /// Negative status code surfaced to the invoking process.
    pub fn errno(&self) -> i16 {
        let e = match self {
            ExecError::BadMagic
            | ExecError::UnsupportedFormat
            | ExecError::BadHeader
            | ExecError::CompressionUnsupported
            | ExecError::BadCompressedData => ENOEXEC,
            ExecError::InvalidHeaderField | ExecError::BadRelocation => EINVAL,
            ExecError::TooBig => EFBIG,
            ExecError::ArgTooBig | ExecError::TableOverflow => E2BIG,
            ExecError::OutOfMemory => ENOMEM,
            ExecError::ShortRead | ExecError::Io => EIO,
        };
        -e
    }
}

impl core::fmt::Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ExecError::BadMagic => write!(f, "not an executable"),
            ExecError::UnsupportedFormat => write!(f, "unsupported executable variant"),
            ExecError::BadHeader => write!(f, "malformed executable header"),
            ExecError::InvalidHeaderField => write!(f, "invalid header field"),
            ExecError::CompressionUnsupported => write!(f, "compressed image not supported"),
            ExecError::BadCompressedData => write!(f, "compressed segment length mismatch"),
            ExecError::TooBig => write!(f, "image too big for address space"),
            ExecError::ArgTooBig => write!(f, "argument block too large"),
            ExecError::TableOverflow => write!(f, "segment table too large"),
            ExecError::OutOfMemory => write!(f, "out of segment memory"),
            ExecError::ShortRead => write!(f, "short read from backing store"),
            ExecError::Io => write!(f, "backing store read error"),
            ExecError::BadRelocation => write!(f, "bad relocation stream"),
        }
    }
}
