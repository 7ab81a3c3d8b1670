/// Error codes written into the call context's error slot by compiled code,
/// the emulator and runtime helpers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
pub enum ErrorCode {
    #[strum(serialize = "no error")]
    Ok = 0,
    #[strum(serialize = "unexpected end of input")]
    UnexpectedEof = 1,
    #[strum(serialize = "invalid wire type tag")]
    InvalidTag = 2,
    #[strum(serialize = "duplicate struct field id")]
    DuplicateField = 3,
    #[strum(serialize = "missing required field")]
    MissingRequiredField = 4,
    #[strum(serialize = "duplicate set element")]
    DuplicateSetElement = 5,
    #[strum(serialize = "nesting depth exceeded")]
    NestingOverflow = 6,
    #[strum(serialize = "invalid length")]
    InvalidLength = 7,
    #[strum(serialize = "output buffer too small")]
    BufferTooSmall = 8,
    /// A deferred codec could not be compiled; see the call's compile error.
    #[strum(serialize = "internal compiler failure")]
    Internal = 9,
}

impl ErrorCode {
    /// Converts a raw error slot value. Unknown values map to `None`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::from_repr(raw)
    }
}

/// A recoverable error raised while encoding or decoding a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{code} at offset {offset}")]
pub struct CodecError {
    pub code: ErrorCode,
    /// Byte offset in the wire buffer where the error was detected.
    pub offset: usize,
}

/// Errors raised while turning a type descriptor into runnable code.
///
/// Schema problems are recoverable. Everything else means the compiler
/// produced something inconsistent; see [`CompileError::is_fatal`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("unsupported schema: {0}")]
    Unsupported(String),

    #[error("label L{0} referenced but never defined")]
    UnresolvedLabel(u32),

    #[error("program has no terminal halt")]
    MissingHalt,

    #[error("malformed program: {0}")]
    Malformed(String),

    #[error("unresolved call target #{0}")]
    UnresolvedCall(u32),

    #[error("call to `{name}` does not match its signature: {reason}")]
    SignatureMismatch { name: &'static str, reason: String },

    #[error("program too complex: {0}")]
    ProgramTooComplex(String),

    #[error("code emission failed: {0}")]
    Emit(String),

    #[error("failed to load executable code: {0}")]
    Load(String),
}

impl CompileError {
    /// Fatal errors indicate a defect in the compiler, never bad input.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CompileError::Unsupported(_))
    }
}

/// Top-level error returned by the public entry points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl Error {
    /// The codec error code, if this is a codec error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Codec(e) => Some(e.code),
            Error::Compile(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_and_convert_from_raw() {
        assert_eq!(ErrorCode::InvalidTag.to_string(), "invalid wire type tag");
        assert_eq!(ErrorCode::from_raw(8), Some(ErrorCode::BufferTooSmall));
        assert_eq!(ErrorCode::from_raw(10), None);

        let e = CodecError {
            code: ErrorCode::UnexpectedEof,
            offset: 3,
        };
        assert_eq!(e.to_string(), "unexpected end of input at offset 3");
    }
}
