//! Error kinds and positioned warnings for the persistence core.
//!
//! Fatal conditions abort the current load or dump and propagate upward as
//! [`PersistError`]. Recoverable conditions are recorded as [`Warning`]
//! values and surfaced in the load/dump outcome, so a human can locate the
//! defect in the persisted corpus or in the scanned sources.

use std::{fmt, io, path::PathBuf};

use crate::oid::Oid;

/// Fatal errors surfaced by the loader, the dumper, and the value algebra.
///
/// Every variant that points at persisted data carries enough position
/// information (space id, line number, file path, object id) to locate the
/// offending input.
#[derive(Debug)]
pub enum PersistError {
    /// An object-id string failed to parse: wrong length, missing leading
    /// underscore, a character outside the base-62 alphabet, or a zero half.
    InvalidIdString { input: String, reason: &'static str },
    /// The same object id appeared twice in one loading run.
    DuplicateObject { oid: Oid, space: Oid, line: u32 },
    /// A space file declared `nbobjects` but contained a different count.
    ObjectCountMismatch { space: Oid, declared: usize, found: usize },
    /// The top-level or user manifest was missing, malformed, or incomplete.
    BadManifest { path: PathBuf, detail: String },
    /// A space-file prologue was malformed or disagreed with its file name.
    BadPrologue { space: Oid, line: u32, detail: String },
    /// An object body inside a space file was malformed.
    BadObjectBody { space: Oid, line: u32, oid: Oid, detail: String },
    /// A line of persisted input was not valid UTF-8.
    NonUtf8Line { path: PathBuf, line: u32 },
    /// An object id referenced from persisted data never materialized.
    UnresolvedId { oid: Oid, space: Option<Oid>, line: u32 },
    /// A payload token named a kind no deserializer was registered for.
    UnknownPayloadKind { kind: String, oid: Oid, space: Oid, line: u32 },
    /// A dynamic symbol required by `magicattr`, `applying` or `payload`
    /// could not be resolved.
    MissingDynamicSymbol { symbol: String, oid: Oid, space: Oid, line: u32 },
    /// The deferred-task queue exceeded its hard cap, or a task kept
    /// re-enqueuing itself without making progress.
    DeferredOverflow { tasks: usize },
    /// The number of root objects after load disagrees with the hardwired
    /// root-slot count.
    RootCountMismatch { expected: usize, found: usize },
    /// The number of bound named-root symbols disagrees with the hardwired
    /// named-slot count.
    SymbolCountMismatch { expected: usize, found: usize },
    /// The manifest or a prologue carried a format tag that is neither the
    /// current nor the previous accepted tag.
    FormatVersionRejected { found: String },
    /// A value JSON shape was recognized by neither the scalar nor the
    /// `vtype` dispatch. (Only fatal when a payload requires the value.)
    UnknownValueShape { space: Oid, line: u32 },
    /// A transient value reached a position where only persistent values
    /// are allowed.
    TransientValueRejected { oid: Oid },
    /// `install_payload` was called on an object that already has one.
    PayloadAlreadyPresent { oid: Oid },
    /// A value extractor was applied to the wrong variant.
    TypeMismatch { expected: &'static str, actual: &'static str },
    /// An underlying filesystem operation failed.
    Io { path: PathBuf, source: io::Error },
    /// Renaming a temporary dump file onto its final name failed.
    RenameFailed { from: PathBuf, to: PathBuf, source: io::Error },
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdString { input, reason } => {
                write!(f, "invalid object id {input:?}: {reason}")
            }
            Self::DuplicateObject { oid, space, line } => {
                write!(f, "duplicate object {oid} in space {space} line {line}")
            }
            Self::ObjectCountMismatch { space, declared, found } => {
                write!(
                    f,
                    "space {space} declared {declared} objects but contained {found}"
                )
            }
            Self::BadManifest { path, detail } => {
                write!(f, "bad manifest {}: {detail}", path.display())
            }
            Self::BadPrologue { space, line, detail } => {
                write!(f, "bad prologue for space {space} at line {line}: {detail}")
            }
            Self::BadObjectBody { space, line, oid, detail } => {
                write!(
                    f,
                    "bad body for object {oid} in space {space} at line {line}: {detail}"
                )
            }
            Self::NonUtf8Line { path, line } => {
                write!(f, "non UTF-8 line {line} in {}", path.display())
            }
            Self::UnresolvedId { oid, space, line } => {
                write!(f, "unknown object id {oid} at line {line}")?;
                if let Some(space) = space {
                    write!(f, " in space {space}")?;
                }
                Ok(())
            }
            Self::UnknownPayloadKind { kind, oid, space, line } => {
                write!(
                    f,
                    "unknown payload kind {kind:?} for object {oid} in space {space} line {line}"
                )
            }
            Self::MissingDynamicSymbol { symbol, oid, space, line } => {
                write!(
                    f,
                    "cannot resolve symbol {symbol} for object {oid} in space {space} line {line}"
                )
            }
            Self::DeferredOverflow { tasks } => {
                write!(f, "too many deferred loader tasks ({tasks})")
            }
            Self::RootCountMismatch { expected, found } => {
                write!(f, "got {found} root objects, expected {expected}")
            }
            Self::SymbolCountMismatch { expected, found } => {
                write!(f, "bound {found} named-root symbols, expected {expected}")
            }
            Self::FormatVersionRejected { found } => {
                write!(f, "unsupported persistence format {found:?}")
            }
            Self::UnknownValueShape { space, line } => {
                write!(f, "unrecognized value shape in space {space} line {line}")
            }
            Self::TransientValueRejected { oid } => {
                write!(f, "transient object {oid} cannot be persisted here")
            }
            Self::PayloadAlreadyPresent { oid } => {
                write!(f, "object {oid} already carries a payload")
            }
            Self::TypeMismatch { expected, actual } => {
                write!(f, "expected {expected}, got {actual}")
            }
            Self::Io { path, source } => {
                write!(f, "I/O error on {}: {source}", path.display())
            }
            Self::RenameFailed { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} to {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } | Self::RenameFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl PersistError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A recoverable diagnostic recorded during a load or a dump.
///
/// Warnings never abort the run; they substitute a neutral value (for
/// example `Value::Empty` for an unknown value shape) or skip the offending
/// datum, and carry whatever position information was available.
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    /// Human-readable description of what was skipped or substituted.
    pub message: String,
    /// Space being read or written, when inside one.
    pub space: Option<Oid>,
    /// File the warning points into (space file or scanned source file).
    pub file: Option<PathBuf>,
    /// 1-based line number inside `file`.
    pub line: Option<u32>,
    /// Object being built or emitted, when known.
    pub object: Option<Oid>,
}

impl Warning {
    /// Creates a warning with only a message; position fields start empty.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            space: None,
            file: None,
            line: None,
            object: None,
        }
    }

    /// Attaches the space the warning occurred in.
    #[must_use]
    pub fn in_space(mut self, space: Oid) -> Self {
        self.space = Some(space);
        self
    }

    /// Attaches a file and line position.
    #[must_use]
    pub fn at(mut self, file: impl Into<PathBuf>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    /// Attaches the object the warning concerns.
    #[must_use]
    pub fn on_object(mut self, oid: Oid) -> Self {
        self.object = Some(oid);
        self
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(space) = self.space {
            write!(f, " [space {space}]")?;
        }
        if let Some(file) = &self.file {
            write!(f, " [{}", file.display())?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
            }
            f.write_str("]")?;
        } else if let Some(line) = self.line {
            write!(f, " [line {line}]")?;
        }
        if let Some(object) = self.object {
            write!(f, " [object {object}]")?;
        }
        Ok(())
    }
}
