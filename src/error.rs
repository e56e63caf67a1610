use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("namespace `{0}` not found")]
    NamespaceNotFound(String),
    #[error("schema mismatch on chunk `{table}`: {detail}")]
    SchemaMismatch { table: String, detail: String },
    #[error("could not allocate a column for key `{key}` in namespace `{namespace}`")]
    ColumnCollision { namespace: String, key: String },
    #[error("no shard owns namespace `{0}`")]
    ShardNotFound(String),
    #[error("namespace `{namespace}` exists on more than one shard: {shards:?}")]
    AmbiguousShard {
        namespace: String,
        shards: Vec<String>,
    },
    #[error("backend unavailable ({context}): {source}")]
    BackendUnavailable {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("timed out: {operation}")]
    Timeout { operation: String },
    #[error("database error: {0}")]
    Db(sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Error::Timeout {
                operation: "acquire pooled connection".into(),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::BackendUnavailable {
                context: "backend connection".into(),
                source: err,
            },
            other => Error::Db(other),
        }
    }
}

impl Error {
    /// The innermost error, looking through `Context` wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Transient failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Error::BackendUnavailable { .. } | Error::Timeout { .. }
        )
    }

    /// Invariant violations that indicate a bug or an operational misconfiguration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Error::AmbiguousShard { .. }
                | Error::SchemaMismatch { .. }
                | Error::ColumnCollision { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            Error::InvalidQuery(_) | Error::InvalidEvent(_)
        )
    }

    pub fn is_namespace_not_found(&self) -> bool {
        matches!(self.root(), Error::NamespaceNotFound(_))
    }
}

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_retryable() {
        let err = Error::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn context_keeps_classification() {
        let err: Result<()> = Err(Error::AmbiguousShard {
            namespace: "ns".into(),
            shards: vec!["a".into(), "b".into()],
        });
        let wrapped = err.context("route ns").unwrap_err();
        assert!(wrapped.is_fatal());
        assert!(!wrapped.is_retryable());
        assert!(wrapped.to_string().starts_with("route ns: "));
    }

    #[test]
    fn row_not_found_is_plain_db_error() {
        let err = Error::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, Error::Db(_)));
        assert!(!err.is_retryable());
    }
}
