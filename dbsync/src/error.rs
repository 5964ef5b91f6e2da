use thiserror::Error;

/// Result alias used across the crate.
pub type SyncResult<T> = std::result::Result<T, Error>;

/// One colliding row in a [`Error::UniqueConstraint`] report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraintEntry {
    pub model: String,
    pub pk: String,
    pub columns: Vec<String>,
}

/// Field delimiter inside one wire argument; keeps the exception envelope
/// at plain strings while preserving the entry structure.
const WIRE_FIELD_SEP: &str = "\u{1f}";

impl UniqueConstraintEntry {
    /// The entry as one structured wire argument:
    /// `model <sep> pk <sep> column...`.
    pub fn to_wire(&self) -> String {
        let mut parts = Vec::with_capacity(2 + self.columns.len());
        parts.push(self.model.as_str());
        parts.push(self.pk.as_str());
        parts.extend(self.columns.iter().map(String::as_str));
        parts.join(WIRE_FIELD_SEP)
    }

    /// Parses the wire argument form back into an entry.
    pub fn from_wire(arg: &str) -> UniqueConstraintEntry {
        let mut parts = arg.split(WIRE_FIELD_SEP);
        UniqueConstraintEntry {
            model: parts.next().unwrap_or_default().to_owned(),
            pk: parts.next().unwrap_or_default().to_owned(),
            columns: parts.map(str::to_owned).collect(),
        }
    }
}

impl std::fmt::Display for UniqueConstraintEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} pk {} columns ({})", self.model, self.pk, self.columns.join(", "))
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The server refused the push outright. Fatal to the round.
    #[error("push rejected: {0}")]
    PushRejected(String),

    /// The client is behind the server; pull first, then retry the push.
    #[error("pull suggested: {0}")]
    PullSuggested(String),

    /// Local rows collide on a unique constraint in a way the merge can't
    /// repair. User data must be fixed by hand.
    #[error("unique constraint error: {}", format_entries(.0))]
    UniqueConstraint(Vec<UniqueConstraintEntry>),

    /// A single operation couldn't be applied for a predictable cause.
    #[error("operation error: {0}")]
    Operation(String),

    /// Misconfiguration: untracked model, missing engine, bad schema.
    #[error("registry error: {0}")]
    Registry(String),

    /// Constraint violation or other store-level fault.
    #[error("store error: {0}")]
    Store(String),

    /// Transient store failure; the sync round may be retried.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// The peer sent something that isn't a valid message.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// Raised by extension hooks to suppress a tracking or an apply.
    /// Not an error: control flow between hooks and the engine.
    #[error("operation skipped")]
    SkipOperation,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

fn format_entries(entries: &[UniqueConstraintEntry]) -> String {
    entries.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl Error {
    /// Transient errors drive the synchronize retry loop; everything else
    /// surfaces to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Serialization(_) | Error::Io(_) | Error::BadResponse(_))
    }

    /// Wire name used in the exception envelope.
    pub fn extype(&self) -> &'static str {
        match self {
            Error::PushRejected(_) => "PushRejected",
            Error::PullSuggested(_) => "PullSuggested",
            Error::UniqueConstraint(_) => "UniqueConstraintError",
            Error::Operation(_) => "OperationError",
            Error::Registry(_) => "RegistryError",
            Error::Store(_) => "StoreError",
            Error::Serialization(_) => "SerializationError",
            Error::BadResponse(_) => "BadResponseError",
            Error::SkipOperation => "SkipOperation",
            Error::Io(_) => "IoError",
            Error::Codec(_) => "CodecError",
        }
    }

    /// Rebuilds an error from the wire envelope `{extype, args}`.
    pub fn from_wire(extype: &str, args: Vec<String>) -> Error {
        let detail = args.join("; ");
        match extype {
            "PushRejected" => Error::PushRejected(detail),
            "PullSuggested" => Error::PullSuggested(detail),
            "UniqueConstraintError" => Error::UniqueConstraint(
                args.iter().map(|a| UniqueConstraintEntry::from_wire(a)).collect(),
            ),
            "OperationError" => Error::Operation(detail),
            "RegistryError" => Error::Registry(detail),
            "StoreError" => Error::Store(detail),
            "SerializationError" => Error::Serialization(detail),
            _ => Error::BadResponse(format!("{}: {}", extype, detail)),
        }
    }

    /// Envelope arguments for the wire form. `UniqueConstraint` carries
    /// one structured argument per entry so the receiver can rebuild the
    /// full `{model, pk, columns}` report.
    pub fn wire_args(&self) -> Vec<String> {
        match self {
            Error::UniqueConstraint(entries) => entries.iter().map(|e| e.to_wire()).collect(),
            other => vec![other.to_string()],
        }
    }
}
