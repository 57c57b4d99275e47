use std::{fmt, result};

/// Error variants returned by this crate, each carrying the `file!():line!()`
/// location where it was raised (see [err_at]) and a human readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// NaN in a point, dimension mismatch, empty row identifier. Rejected
    /// before any state mutation.
    InvalidInput(String, String),
    /// Arena segment cap reached. Insert fails, tree is unchanged.
    ArenaExhausted(String, String),
    /// Snapshot checksum mismatch, unknown magic, or truncated file.
    SnapshotCorrupt(String, String),
    /// Transient I/O failure during a snapshot save.
    SnapshotIO(String, String),
    /// Write or fsync error on a durable-mode commit.
    DurableCommitFailed(String, String),
    /// A NodeID has no live mapping in the store.
    NotFound(String, String),
    /// A second writer entered the engine without the write gate.
    ConcurrentViolation(String, String),
    /// Any other I/O failure (open, read, seek, lock).
    IOError(String, String),
    /// Internal invariant broken; always a bug if observed.
    Fatal(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidInput(p, m) => write!(f, "{} invalid-input: {}", p, m),
            Error::ArenaExhausted(p, m) => write!(f, "{} arena-exhausted: {}", p, m),
            Error::SnapshotCorrupt(p, m) => write!(f, "{} snapshot-corrupt: {}", p, m),
            Error::SnapshotIO(p, m) => write!(f, "{} snapshot-io: {}", p, m),
            Error::DurableCommitFailed(p, m) => write!(f, "{} durable-commit-failed: {}", p, m),
            Error::NotFound(p, m) => write!(f, "{} not-found: {}", p, m),
            Error::ConcurrentViolation(p, m) => write!(f, "{} concurrent-violation: {}", p, m),
            Error::IOError(p, m) => write!(f, "{} io-error: {}", p, m),
            Error::Fatal(p, m) => write!(f, "{} fatal: {}", p, m),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

/// Stamp the current source location onto an [Error] variant, or convert
/// an arbitrary `Result<T, E: Display>` into one tagged with that variant.
///
/// ```ignore
/// err_at!(IOError, fs::metadata(path))?;
/// err_at!(InvalidInput, msg: "bad dimension {}", dim)?;
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!("{}: {}", format!($($arg),+), err)))
            }
        }
    }};
}
