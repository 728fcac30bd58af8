use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NatcacheError {
    #[error("could not initialize conntrack after: {0:?}")]
    InitTimeout(Duration),
    #[error("conntrack event source error: {0}")]
    EventSource(String),
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[source] std::io::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}
