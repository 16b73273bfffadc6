use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error from any `wim` operation.
///
/// The error taxonomy is closed: every error maps to exactly one
/// [`ErrorKind`], which a command-line wrapper can turn into an exit code
/// with [`Error::exit_code`].
pub struct Error(Box<ErrorInner>);

/// The named I/O operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoOp {
    Open,
    Read,
    Write,
    Stat,
    Link,
    Mkdir,
    Rename,
    Readlink,
    Truncate,
}

#[derive(Debug)]
pub(crate) enum ErrorInner {
    Io(IoOp, std::io::Error),

    // Format errors.
    NotAWim,
    UnknownVersion(u32),
    InvalidHeader(&'static str),
    InvalidChunkSize(u32),
    InvalidCompressionType(u32),
    InvalidIntegrityTable(&'static str),
    InvalidBlobTableEntry(&'static str),
    InvalidMetadataResource(&'static str),
    InvalidResourceHash,
    InvalidSecurityData(&'static str),
    UnexpectedEof,

    // Codec errors.
    Decompression,

    // Usage errors.
    InvalidParam(&'static str),
    InvalidImage(u32),
    ImageNameCollision(String),
    ImageCount,
    NoFilename,
    ResourceOrder,
    SplitInvalid(String),
    SplitUnsupported,
    NotPipable,
    InvalidPipableWim(&'static str),
    WimIsReadonly,

    // Concurrency.
    AlreadyLocked,

    // Resources.
    ResourceNotFound(String),

    // XML data.
    Xml(&'static str),

    // Environment.
    Integrity,
    AbortedByProgress,
    Unsupported(&'static str),
    Encoding(&'static str),
}

/// The closed classification of [`Error`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    Open,
    Read,
    Write,
    Stat,
    Link,
    Mkdir,
    Rename,
    Readlink,
    Truncate,
    NotAWim,
    UnknownVersion,
    InvalidHeader,
    InvalidChunkSize,
    InvalidCompressionType,
    InvalidIntegrityTable,
    InvalidBlobTableEntry,
    InvalidMetadataResource,
    InvalidResourceHash,
    InvalidSecurityData,
    InvalidReparseData,
    InvalidOverlay,
    UnexpectedEof,
    Decompression,
    InvalidParam,
    InvalidImage,
    ImageNameCollision,
    ImageCount,
    NoFilename,
    ResourceOrder,
    SplitInvalid,
    SplitUnsupported,
    NotPipable,
    InvalidPipableWim,
    WimIsReadonly,
    Xml,
    AlreadyLocked,
    FilesystemDaemonCrashed,
    ResourceNotFound,
    Integrity,
    AbortedByProgress,
    Nomem,
    Unsupported,
    Encoding,
}

impl Error {
    /// The taxonomy entry this error belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match &*self.0 {
            ErrorInner::Io(op, _) => match op {
                IoOp::Open => ErrorKind::Open,
                IoOp::Read => ErrorKind::Read,
                IoOp::Write => ErrorKind::Write,
                IoOp::Stat => ErrorKind::Stat,
                IoOp::Link => ErrorKind::Link,
                IoOp::Mkdir => ErrorKind::Mkdir,
                IoOp::Rename => ErrorKind::Rename,
                IoOp::Readlink => ErrorKind::Readlink,
                IoOp::Truncate => ErrorKind::Truncate,
            },
            ErrorInner::NotAWim => ErrorKind::NotAWim,
            ErrorInner::UnknownVersion(_) => ErrorKind::UnknownVersion,
            ErrorInner::InvalidHeader(_) => ErrorKind::InvalidHeader,
            ErrorInner::InvalidChunkSize(_) => ErrorKind::InvalidChunkSize,
            ErrorInner::InvalidCompressionType(_) => ErrorKind::InvalidCompressionType,
            ErrorInner::InvalidIntegrityTable(_) => ErrorKind::InvalidIntegrityTable,
            ErrorInner::InvalidBlobTableEntry(_) => ErrorKind::InvalidBlobTableEntry,
            ErrorInner::InvalidMetadataResource(_) => ErrorKind::InvalidMetadataResource,
            ErrorInner::InvalidResourceHash => ErrorKind::InvalidResourceHash,
            ErrorInner::InvalidSecurityData(_) => ErrorKind::InvalidSecurityData,
            ErrorInner::UnexpectedEof => ErrorKind::UnexpectedEof,
            ErrorInner::Decompression => ErrorKind::Decompression,
            ErrorInner::InvalidParam(_) => ErrorKind::InvalidParam,
            ErrorInner::InvalidImage(_) => ErrorKind::InvalidImage,
            ErrorInner::ImageNameCollision(_) => ErrorKind::ImageNameCollision,
            ErrorInner::ImageCount => ErrorKind::ImageCount,
            ErrorInner::NoFilename => ErrorKind::NoFilename,
            ErrorInner::ResourceOrder => ErrorKind::ResourceOrder,
            ErrorInner::SplitInvalid(_) => ErrorKind::SplitInvalid,
            ErrorInner::SplitUnsupported => ErrorKind::SplitUnsupported,
            ErrorInner::NotPipable => ErrorKind::NotPipable,
            ErrorInner::InvalidPipableWim(_) => ErrorKind::InvalidPipableWim,
            ErrorInner::WimIsReadonly => ErrorKind::WimIsReadonly,
            ErrorInner::Xml(_) => ErrorKind::Xml,
            ErrorInner::AlreadyLocked => ErrorKind::AlreadyLocked,
            ErrorInner::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            ErrorInner::Integrity => ErrorKind::Integrity,
            ErrorInner::AbortedByProgress => ErrorKind::AbortedByProgress,
            ErrorInner::Unsupported(_) => ErrorKind::Unsupported,
            ErrorInner::Encoding(_) => ErrorKind::Encoding,
        }
    }

    /// Exit code for a CLI wrapper: 2 for usage errors, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::InvalidParam
            | ErrorKind::InvalidImage
            | ErrorKind::ImageNameCollision
            | ErrorKind::ImageCount
            | ErrorKind::NoFilename
            | ErrorKind::SplitInvalid
            | ErrorKind::SplitUnsupported
            | ErrorKind::NotPipable
            | ErrorKind::WimIsReadonly => 2,
            _ => 1,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::Io(op, err) => {
                let what = match op {
                    IoOp::Open => "failed to open file",
                    IoOp::Read => "failed to read",
                    IoOp::Write => "failed to write",
                    IoOp::Stat => "failed to stat file",
                    IoOp::Link => "failed to link",
                    IoOp::Mkdir => "failed to create directory",
                    IoOp::Rename => "failed to rename",
                    IoOp::Readlink => "failed to read link target",
                    IoOp::Truncate => "failed to truncate",
                };
                write!(f, "{what}: {err}")
            }
            ErrorInner::NotAWim => f.pad("not a WIM file"),
            ErrorInner::UnknownVersion(v) => write!(f, "unknown WIM version {v:#x}"),
            ErrorInner::InvalidHeader(msg) => write!(f, "invalid WIM header: {msg}"),
            ErrorInner::InvalidChunkSize(size) => write!(f, "invalid chunk size {size}"),
            ErrorInner::InvalidCompressionType(v) => {
                write!(f, "invalid compression type {v:#x}")
            }
            ErrorInner::InvalidIntegrityTable(msg) => {
                write!(f, "invalid integrity table: {msg}")
            }
            ErrorInner::InvalidBlobTableEntry(msg) => {
                write!(f, "invalid blob table entry: {msg}")
            }
            ErrorInner::InvalidMetadataResource(msg) => {
                write!(f, "invalid metadata resource: {msg}")
            }
            ErrorInner::InvalidResourceHash => {
                f.pad("a resource's data does not match its recorded SHA-1")
            }
            ErrorInner::InvalidSecurityData(msg) => {
                write!(f, "invalid security descriptor data: {msg}")
            }
            ErrorInner::UnexpectedEof => f.pad("unexpected end of file"),
            ErrorInner::Decompression => f.pad("failed to decompress resource data"),
            ErrorInner::InvalidParam(msg) => write!(f, "invalid parameter: {msg}"),
            ErrorInner::InvalidImage(idx) => write!(f, "image {idx} does not exist"),
            ErrorInner::ImageNameCollision(name) => {
                write!(f, "an image named {name:?} already exists")
            }
            ErrorInner::ImageCount => f.pad("image count mismatch between header and XML data"),
            ErrorInner::NoFilename => f.pad("the WIM is not backed by a file"),
            ErrorInner::ResourceOrder => f.pad("resources are in an unsupported order"),
            ErrorInner::SplitInvalid(msg) => write!(f, "invalid split set: {msg}"),
            ErrorInner::SplitUnsupported => {
                f.pad("operation not supported on a split WIM part; join the set first")
            }
            ErrorInner::NotPipable => f.pad("the WIM is not pipable"),
            ErrorInner::InvalidPipableWim(msg) => write!(f, "invalid pipable WIM: {msg}"),
            ErrorInner::WimIsReadonly => f.pad("the WIM is read-only"),
            ErrorInner::Xml(msg) => write!(f, "invalid XML data: {msg}"),
            ErrorInner::AlreadyLocked => f.pad("the WIM file is locked by another process"),
            ErrorInner::ResourceNotFound(hash) => {
                write!(f, "no resource with hash {hash} is available")
            }
            ErrorInner::Integrity => f.pad("integrity check failed"),
            ErrorInner::AbortedByProgress => f.pad("operation aborted by the progress callback"),
            ErrorInner::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            ErrorInner::Encoding(msg) => write!(f, "string encoding error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Io(_, err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

pub(crate) trait IoResultExt<T> {
    fn io_ctx(self, op: IoOp) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    #[inline]
    fn io_ctx(self, op: IoOp) -> Result<T> {
        self.map_err(|err| ErrorInner::Io(op, err).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_exit_codes() {
        let err: Error = ErrorInner::InvalidImage(3).into();
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
        assert_eq!(err.exit_code(), 2);

        let err: Error = ErrorInner::Decompression.into();
        assert_eq!(err.kind(), ErrorKind::Decompression);
        assert_eq!(err.exit_code(), 1);

        let err: Error = ErrorInner::Io(
            IoOp::Read,
            std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        )
        .into();
        assert_eq!(err.kind(), ErrorKind::Read);
        assert!(err.to_string().contains("failed to read"));
    }
}
