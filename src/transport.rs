use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use url::Url;

const CONFIG_PATH: &str = "/api/config";
const MEDIA_UPLOAD_PATH: &str = "/api/media/upload";
const UPDATE_PATH: &str = "/api/update";

/// HTTP client for talking to other players' admin API.
///
/// Every call carries its own timeout; nothing here retries.
#[derive(Clone)]
pub struct PeerClient {
    client: Client,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid peer URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Http(reqwest::Error),
    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("cannot read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Http(e)
        }
    }
}

impl PeerClient {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self { client })
    }

    /// GET the peer's config. On success returns the display name it reports,
    /// if any.
    pub async fn probe(&self, base: &str, timeout: Duration) -> Result<Option<String>, TransportError> {
        let url = endpoint(base, CONFIG_PATH)?;
        let response = self.client.get(url).timeout(timeout).send().await?;
        let response = check_status(response)?;
        // A peer that answers 2xx is online even if the body is not what we expect.
        let body: Option<Value> = response.json().await.ok();
        Ok(body
            .as_ref()
            .and_then(|b| b.get("displayName"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub async fn apply_config(
        &self,
        base: &str,
        updates: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let url = endpoint(base, CONFIG_PATH)?;
        let response = self
            .client
            .post(url)
            .json(updates)
            .timeout(timeout)
            .send()
            .await?;
        check_status(response)?;
        Ok(())
    }

    /// Upload media files. Each file is streamed from disk for this peer only.
    pub async fn upload_media(
        &self,
        base: &str,
        files: &[std::path::PathBuf],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let url = endpoint(base, MEDIA_UPLOAD_PATH)?;
        let mut form = Form::new();
        for file in files {
            form = form.part("file", file_part(file).await?);
        }
        let response = self
            .client
            .post(url)
            .multipart(form)
            .timeout(timeout)
            .send()
            .await?;
        check_status(response)?;
        Ok(())
    }

    pub async fn push_update(
        &self,
        base: &str,
        package: &Path,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let url = endpoint(base, UPDATE_PATH)?;
        let form = Form::new().part("update", file_part(package).await?);
        let response = self
            .client
            .post(url)
            .multipart(form)
            .timeout(timeout)
            .send()
            .await?;
        check_status(response)?;
        Ok(())
    }
}

fn endpoint(base: &str, path: &str) -> Result<Url, TransportError> {
    Ok(Url::parse(base)?.join(path)?)
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Status(status))
    }
}

async fn file_part(path: &Path) -> Result<Part, TransportError> {
    let file_err = |source| TransportError::File {
        path: path.display().to_string(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(file_err)?;
    let len = file.metadata().await.map_err(file_err)?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.bin".to_string());

    let body = Body::wrap_stream(ReaderStream::new(file));
    Ok(Part::stream_with_length(body, len).file_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        let url = endpoint("http://10.0.0.4:3006", CONFIG_PATH).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.4:3006/api/config");
        let url = endpoint("http://[::1]:3006", UPDATE_PATH).unwrap();
        assert_eq!(url.as_str(), "http://[::1]:3006/api/update");
    }

    #[tokio::test]
    async fn test_missing_upload_file() {
        let err = file_part(Path::new("/definitely/not/here.png")).await.unwrap_err();
        assert!(matches!(err, TransportError::File { .. }));
    }
}
