//! Thin client over the four ComfyUI endpoints a job needs: `/prompt`,
//! `/history/{id}`, `/upload/image` and `/view`.

use std::time::Duration;

use pixaris_core::executor::ExecutorError;
use serde::Deserialize;

use crate::history::ImageRef;

/// Timeout for queuing a prompt.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a single history poll.
const HISTORY_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for uploading one input image.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(20);

/// Server-side folder that receives uploaded inputs.
const UPLOAD_SUBFOLDER: &str = "uploaded_images";

/// Client bound to one worker's base URL.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Body of a successful `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue position at submission time.
    #[serde(default)]
    pub number: i32,
}

/// Response returned by `/upload/image`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
}

impl UploadResponse {
    /// Value to place in a `LoadImage` node's `image` input.
    pub fn image_path(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx answer; `body` is kept verbatim for the failure log.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },
}

impl ComfyUIApiError {
    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::ApiError { status, .. } => *status >= 500,
        }
    }
}

impl From<ComfyUIApiError> for ExecutorError {
    fn from(e: ComfyUIApiError) -> Self {
        match &e {
            ComfyUIApiError::Request(inner) if inner.is_connect() || inner.is_timeout() => {
                ExecutorError::Connection(e.to_string())
            }
            ComfyUIApiError::Request(_) => ExecutorError::Protocol(e.to_string()),
            ComfyUIApiError::ApiError { .. } => ExecutorError::Remote(e.to_string()),
        }
    }
}

impl ComfyUIApi {
    /// Client for the worker at `address` (`host:port`). The
    /// [`reqwest::Client`] is shared so connections are pooled per host.
    pub fn for_address(client: reqwest::Client, address: &str) -> Self {
        Self {
            client,
            api_url: format!("http://{address}"),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue `workflow` (API format) under `client_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(SUBMIT_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Raw history for one prompt. The object stays empty until the
    /// prompt has started executing; see [`crate::history`].
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Upload an input image as multipart form data.
    ///
    /// Existing files with the same name are kept (`overwrite=false`);
    /// ComfyUI answers with the name it actually stored.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "false")
            .text("subfolder", UPLOAD_SUBFOLDER);

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download an output image referenced by a history entry.
    pub async fn view_image(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.folder_type.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<body unavailable: {e}>"));
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
