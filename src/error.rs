//! Error taxonomy shared by every cluster-facing component.
//!
//! Each variant maps onto an [`ErrorKind`] so retry policies can filter on
//! kinds without inspecting messages.

use thiserror::Error;

pub type CbResult<T> = std::result::Result<T, CbError>;

#[derive(Debug, Error)]
pub enum CbError {
    // configuration
    #[error("schema configuration error: {0}")]
    SchemaConfig(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("rules error: {0}")]
    Rules(String),
    #[error("configuration error: {0}")]
    Config(String),

    // connectivity
    #[error("DNS SRV lookup timed out for {0}")]
    DnsLookupTimeout(String),
    #[error("node {0} unreachable")]
    NodeUnreachable(String),
    #[error("cluster init failed: {0}")]
    ClusterInit(String),

    // services
    #[error("KV service unavailable: {0}")]
    KvService(String),
    #[error("query service unavailable: {0}")]
    QueryService(String),
    #[error("view service unavailable: {0}")]
    ViewService(String),
    #[error("cluster health check failed: {0}")]
    HealthCheck(String),

    // operations
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("index already exists: {0}")]
    IndexExists(String),
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("query requires a field or a statement")]
    QueryArguments,
    #[error("query returned no rows")]
    QueryEmpty,
    #[error("transient error: {0}")]
    Transient(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("couchbase error {code}: {message}")]
    Couchbase { code: u32, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Copyable classification used by retry allow/always-raise sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SchemaConfig,
    Template,
    Rules,
    Config,
    DnsLookupTimeout,
    NodeUnreachable,
    ClusterInit,
    KvService,
    QueryService,
    ViewService,
    HealthCheck,
    DocumentNotFound,
    AlreadyExists,
    NotFound,
    IndexExists,
    IndexNotFound,
    QueryArguments,
    QueryEmpty,
    Transient,
    Timeout,
    Couchbase,
    Protocol,
    Io,
    Json,
    Csv,
}

impl CbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CbError::SchemaConfig(_) => ErrorKind::SchemaConfig,
            CbError::Template(_) => ErrorKind::Template,
            CbError::Rules(_) => ErrorKind::Rules,
            CbError::Config(_) => ErrorKind::Config,
            CbError::DnsLookupTimeout(_) => ErrorKind::DnsLookupTimeout,
            CbError::NodeUnreachable(_) => ErrorKind::NodeUnreachable,
            CbError::ClusterInit(_) => ErrorKind::ClusterInit,
            CbError::KvService(_) => ErrorKind::KvService,
            CbError::QueryService(_) => ErrorKind::QueryService,
            CbError::ViewService(_) => ErrorKind::ViewService,
            CbError::HealthCheck(_) => ErrorKind::HealthCheck,
            CbError::DocumentNotFound(_) => ErrorKind::DocumentNotFound,
            CbError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CbError::NotFound(_) => ErrorKind::NotFound,
            CbError::IndexExists(_) => ErrorKind::IndexExists,
            CbError::IndexNotFound(_) => ErrorKind::IndexNotFound,
            CbError::QueryArguments => ErrorKind::QueryArguments,
            CbError::QueryEmpty => ErrorKind::QueryEmpty,
            CbError::Transient(_) => ErrorKind::Transient,
            CbError::Timeout(_) => ErrorKind::Timeout,
            CbError::Couchbase { .. } => ErrorKind::Couchbase,
            CbError::Protocol(_) => ErrorKind::Protocol,
            CbError::Io(_) => ErrorKind::Io,
            CbError::Json(_) => ErrorKind::Json,
            CbError::Csv(_) => ErrorKind::Csv,
        }
    }

    /// Decode a query-service error code into the matching variant.
    ///
    /// 4300 and "already exists" messages are index-exists; 12004/12016 and
    /// 5000 with "not found" are index-not-found; 5000/12003 are transient.
    pub fn from_query_code(code: u32, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        match code {
            4300 => CbError::IndexExists(message.to_string()),
            _ if lower.contains("already exist") => CbError::IndexExists(message.to_string()),
            12004 | 12016 => CbError::IndexNotFound(message.to_string()),
            5000 if lower.contains("index") && lower.contains("not found") => {
                CbError::IndexNotFound(message.to_string())
            }
            5000 | 12003 => CbError::Transient(format!("{}: {}", code, message)),
            _ => CbError::Couchbase {
                code,
                message: message.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_code_decoding() {
        assert_eq!(
            CbError::from_query_code(4300, "The index #primary already exists.").kind(),
            ErrorKind::IndexExists
        );
        assert_eq!(
            CbError::from_query_code(5000, "Index ix1 already exist").kind(),
            ErrorKind::IndexExists
        );
        assert_eq!(
            CbError::from_query_code(12016, "Index Not Found - cause: GSI index ix1 not found.").kind(),
            ErrorKind::IndexNotFound
        );
        assert_eq!(
            CbError::from_query_code(5000, "internal error").kind(),
            ErrorKind::Transient
        );
        assert_eq!(CbError::from_query_code(12003, "keyspace").kind(), ErrorKind::Transient);
        assert_eq!(CbError::from_query_code(3000, "syntax error").kind(), ErrorKind::Couchbase);
    }
}
