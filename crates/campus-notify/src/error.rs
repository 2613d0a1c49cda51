use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("recipient has no {0} address")]
    NoAddress(String),
    #[error("no provider configured for {0}")]
    NotConfigured(String),
    #[error("provider rejected delivery ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}
