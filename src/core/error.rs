use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidQuery,
    TableNotFound,
    ColumnNotFound,
    DocumentNotFound,
    DocIdExhausted,
    Busy,
    PreconditionFailed,
    Codec,
    SourceTransient,
    SourceFatal,
    Io,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Error {
            kind,
            context: context.into(),
        }
    }

    /// True when the replication runner should retry with backoff
    /// instead of halting the apply thread.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::SourceTransient
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Codec,
            context: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_context() {
        let err = Error::new(ErrorKind::DocIdExhausted, "DocID space exhausted");
        let rendered = err.to_string();
        assert!(rendered.contains("DocIdExhausted"));
        assert!(rendered.contains("exhausted"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::new(ErrorKind::SourceTransient, "connection reset").is_transient());
        assert!(!Error::new(ErrorKind::SourceFatal, "bad row image").is_transient());
    }
}
