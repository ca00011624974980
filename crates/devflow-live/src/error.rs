use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("live client driver has stopped")]
    Closed,
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported url scheme `{0}`")]
    UnsupportedScheme(String),
}
