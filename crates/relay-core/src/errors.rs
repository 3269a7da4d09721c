/// Core error type for the relay.
///
/// Adapter crates map their transport and decode failures into this type so
/// the relay loop can log and skip a step without caring which backend failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error: {status}: {body}")]
    Api { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cancelled")]
    Cancelled,

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Build an `Api` error, keeping only a prefix of large response bodies.
    pub fn api(status: u16, body: &str) -> Self {
        Error::Api {
            status,
            body: body.chars().take(200).collect(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
