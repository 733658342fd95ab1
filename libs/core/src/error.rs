use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1}")]
    // Boxing this error because the size can be large
    KubeError(String, #[source] Box<kube::Error>),

    #[error("{0}: {1}")]
    IpsetError(String, #[source] polman_dataplane::ipset::error::IpsetError),

    #[error("{0}: {1}")]
    FilterError(
        String,
        #[source] polman_dataplane::iptables::error::FilterError,
    ),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}")]
    MissingData(String),

    #[error("parse error: {0}")]
    ParseError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
