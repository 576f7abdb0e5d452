use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store rejected the request: {0}")]
    Api(String),

    #[error("Unexpected status {0}")]
    Status(u16),
}
