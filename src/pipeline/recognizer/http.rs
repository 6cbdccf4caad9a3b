use std::time::Duration;

use anyhow::Context;
use reqwest::{
    StatusCode,
    blocking::{
        Client,
        multipart::{Form, Part},
    },
};

use super::{RecognitionEndpoint, RecognitionError};
use crate::types::RecognitionResponse;

const RECOGNIZE_PATH: &str = "camera/recognize";
const FRAME_FIELD: &str = "file";
const FRAME_FILENAME: &str = "frame.jpg";

/// `POST {base}/camera/recognize` over HTTP with a multipart frame upload.
#[derive(Clone, Debug)]
pub struct HttpRecognizer {
    client: Client,
    url: String,
}

impl HttpRecognizer {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build recognition HTTP client")?;
        Ok(Self {
            client,
            url: endpoint_url(base_url),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

pub(crate) fn endpoint_url(base_url: &str) -> String {
    format!("{}/{RECOGNIZE_PATH}", base_url.trim_end_matches('/'))
}

impl RecognitionEndpoint for HttpRecognizer {
    fn recognize(
        &self,
        jpeg: Vec<u8>,
        bearer: Option<&str>,
    ) -> Result<RecognitionResponse, RecognitionError> {
        let part = Part::bytes(jpeg)
            .file_name(FRAME_FILENAME)
            .mime_str("image/jpeg")
            .map_err(|err| RecognitionError::Transport(Box::new(err)))?;
        let form = Form::new().part(FRAME_FIELD, part);

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|err| RecognitionError::Transport(Box::new(err)))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| RecognitionError::Transport(Box::new(err)))?;

        interpret_response(status, &body)
    }
}

fn interpret_response(status: StatusCode, body: &str) -> Result<RecognitionResponse, RecognitionError> {
    if !status.is_success() {
        return Err(RecognitionError::Status {
            status: status.as_u16(),
        });
    }
    Ok(serde_json::from_str(body)?)
}
