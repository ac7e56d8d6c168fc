use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("opening spool database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("spool query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("spool worker thread is gone")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no connection to collector")]
    NoConnection,
    #[error("building request: {0}")]
    Build(#[from] reqwest::Error),
    #[error("compressing request body: {0}")]
    Compress(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("generating key/CSR: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("certificate revoked, waiting for replacement")]
    Revoked,
    #[error("certificate not yet signed")]
    NotYetSigned,
    #[error("fetched certificate public modulus does not match the on-disk private key")]
    ModulusMismatch,
    #[error("transport error during enrollment: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("sensor kind `{0}` is not registered")]
    UnknownKind(String),
    #[error("spawning sensor worker process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("result validation failed: {0}")]
    InvalidResult(String),
}
