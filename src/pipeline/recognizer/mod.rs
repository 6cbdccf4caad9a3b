mod http;

use thiserror::Error;

use crate::types::RecognitionResponse;

pub use self::http::HttpRecognizer;

/// Why a single recognition round trip produced no usable result.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("recognition request failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("recognition endpoint returned HTTP {status}")]
    Status { status: u16 },
    #[error("malformed recognition response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Remote face recognition service.
pub trait RecognitionEndpoint: Send + Sync + 'static {
    /// Submits one JPEG frame. `bearer` is attached as the `Authorization`
    /// credential when present.
    fn recognize(
        &self,
        jpeg: Vec<u8>,
        bearer: Option<&str>,
    ) -> Result<RecognitionResponse, RecognitionError>;
}
