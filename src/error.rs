use thiserror::Error;

use crate::storage::KvError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user {0} cannot be blank")]
    MissingIdentifier(&'static str),

    #[error("user does not exist")]
    NotFound,

    #[error("email or id already associated with another user")]
    DuplicateIdentity,

    #[error("{op} failed for {key}: {source}")]
    Transport {
        op: &'static str,
        key: String,
        #[source]
        source: KvError,
    },
}

impl StoreError {
    pub(crate) fn transport(op: &'static str, key: impl Into<String>, source: KvError) -> Self {
        StoreError::Transport {
            op,
            key: key.into(),
            source,
        }
    }
}
