use thiserror::Error;

#[derive(Error, Debug)]
pub enum MiliError {
    #[error("Invalid family handle: {0}")]
    InvalidFamilyHandle(u32),

    #[error("Invalid magic number in family header")]
    InvalidMagic,

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(String),

    #[error("Family not opened for writing: {0}")]
    ReadOnlyFamily(String),

    #[error("Mesh not found: {0}")]
    MeshNotFound(String),

    #[error("Class not found: {class} in mesh {mesh}")]
    ClassNotFound { mesh: usize, class: String },

    #[error("State variable not found: {0}")]
    SvarNotFound(String),

    #[error("Subrecord not found: {0}")]
    SubrecordNotFound(String),

    #[error("Entry already exists: {0}")]
    EntryExists(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Entry is not a string: {0}")]
    NotAString(String),

    #[error("Allocation failed: {0}")]
    AllocFailed(String),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Short write: {0}")]
    ShortWrite(String),

    #[error("Type mismatch for {name}: stored {stored}, requested {requested}")]
    TypeMismatch {
        name: String,
        stored: String,
        requested: String,
    },

    #[error("String length mismatch for {name}: stored {stored}, requested {requested}")]
    StringLengthMismatch {
        name: String,
        stored: usize,
        requested: usize,
    },

    #[error("Array shape mismatch for {name}: stored {stored} elements, requested {requested}")]
    ArrayShapeMismatch {
        name: String,
        stored: usize,
        requested: usize,
    },

    #[error("Object range [{first}, {last}] overlaps existing objects in {class}")]
    ObjectRangeOverlap {
        class: String,
        first: usize,
        last: usize,
    },

    #[error("Invalid id-block [{first}, {last}]")]
    InvalidIdBlock { first: usize, last: usize },

    #[error("Invalid state index: {index} (state count {count})")]
    InvalidStateIndex { index: usize, count: usize },

    #[error("State record format {0} is closed for definition")]
    SrecClosed(usize),

    #[error("State record format {0} is still open for definition")]
    SrecOpen(usize),

    #[error("Invalid state record format: {0}")]
    InvalidSrec(usize),

    #[error("Malformed control string: {0}")]
    MalformedControlString(String),

    #[error("Missing labels for class {0}")]
    MissingLabels(String),

    #[error("Object {id} is not part of subrecord {subrecord}")]
    ObjectNotInSubrecord { subrecord: String, id: usize },

    #[error("Invalid aggregation: {0}")]
    InvalidAggregation(String),

    #[error("Corrupted file: {0}")]
    Corrupted(String),

    #[error("Timed out after {waited_secs}s waiting for state {state} on all processors")]
    LiveWaitTimeout { state: usize, waited_secs: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a [`MiliError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidHandle,
    BadFormat,
    AccessMode,
    NotFound,
    EntryExists,
    NotAString,
    AllocFailed,
    ShortRead,
    ShortWrite,
    TypeMismatch,
    LengthMismatch,
    ObjectRangeOverlap,
    InvalidStateIndex,
    SrecClosed,
    SrecOpen,
    MalformedControlString,
    MissingLabels,
    Corrupted,
    Timeout,
    Config,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidHandle => "invalid family handle",
            ErrorKind::BadFormat => "not a mili family",
            ErrorKind::AccessMode => "invalid access mode",
            ErrorKind::NotFound => "not found",
            ErrorKind::EntryExists => "entry exists",
            ErrorKind::NotAString => "not a string type",
            ErrorKind::AllocFailed => "allocation failure",
            ErrorKind::ShortRead => "short read",
            ErrorKind::ShortWrite => "short write",
            ErrorKind::TypeMismatch => "numeric type mismatch",
            ErrorKind::LengthMismatch => "length mismatch",
            ErrorKind::ObjectRangeOverlap => "object range overlap",
            ErrorKind::InvalidStateIndex => "invalid state index",
            ErrorKind::SrecClosed => "state record format closed",
            ErrorKind::SrecOpen => "state record format still open",
            ErrorKind::MalformedControlString => "malformed control string",
            ErrorKind::MissingLabels => "missing labels",
            ErrorKind::Corrupted => "corrupted file",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Config => "invalid configuration",
            ErrorKind::Io => "i/o error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MiliError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MiliError::InvalidFamilyHandle(_) => ErrorKind::InvalidHandle,
            MiliError::InvalidMagic | MiliError::UnsupportedVersion(_) => ErrorKind::BadFormat,
            MiliError::ReadOnlyFamily(_) => ErrorKind::AccessMode,
            MiliError::MeshNotFound(_)
            | MiliError::ClassNotFound { .. }
            | MiliError::SvarNotFound(_)
            | MiliError::SubrecordNotFound(_)
            | MiliError::EntryNotFound(_)
            | MiliError::InvalidSrec(_)
            | MiliError::ObjectNotInSubrecord { .. } => ErrorKind::NotFound,
            MiliError::EntryExists(_) => ErrorKind::EntryExists,
            MiliError::NotAString(_) => ErrorKind::NotAString,
            MiliError::AllocFailed(_) => ErrorKind::AllocFailed,
            MiliError::ShortRead { .. } => ErrorKind::ShortRead,
            MiliError::ShortWrite(_) => ErrorKind::ShortWrite,
            MiliError::TypeMismatch { .. } | MiliError::InvalidAggregation(_) => {
                ErrorKind::TypeMismatch
            }
            MiliError::StringLengthMismatch { .. } | MiliError::ArrayShapeMismatch { .. } => {
                ErrorKind::LengthMismatch
            }
            MiliError::ObjectRangeOverlap { .. } | MiliError::InvalidIdBlock { .. } => {
                ErrorKind::ObjectRangeOverlap
            }
            MiliError::InvalidStateIndex { .. } => ErrorKind::InvalidStateIndex,
            MiliError::SrecClosed(_) => ErrorKind::SrecClosed,
            MiliError::SrecOpen(_) => ErrorKind::SrecOpen,
            MiliError::MalformedControlString(_) => ErrorKind::MalformedControlString,
            MiliError::MissingLabels(_) => ErrorKind::MissingLabels,
            MiliError::Corrupted(_) | MiliError::Serialization(_) => ErrorKind::Corrupted,
            MiliError::LiveWaitTimeout { .. } => ErrorKind::Timeout,
            MiliError::Config(_) => ErrorKind::Config,
            MiliError::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, MiliError>;
