use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database connection failed: {0}")]
    Connection(String),
    #[error("database configuration invalid: {0}")]
    Configuration(String),
    #[error("query failed: {0}")]
    Query(#[from] libsql::Error),
    #[error("data mapping failed: {0}")]
    Mapping(String),
    #[error("transaction failed")]
    Transaction,
}
