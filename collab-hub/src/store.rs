//! Remote file store reached over HTTP.
//!
//! Document text lives in an external file service; the hub only loads a
//! document's text when its first joiner arrives and writes it back on
//! checkpoints and teardown:
//!
//! ```text
//! GET {base}{load_path}{doc}?hubID={session}   -> document text
//! PUT {base}{save_path}{doc}?hubID={session}   <- document text
//! ```
//!
//! There is deliberately no retry or timeout policy here: a hung store
//! call leaves a document in Loading with joiners queued, and a failed
//! save is logged by the caller and not retried.

use async_trait::async_trait;
use thiserror::Error;

/// Persistence failure. Never fatal to a session.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from file store")]
    Status { status: u16 },
}

/// The persistence gateway contract.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn load(&self, doc_id: &str, session_id: &str) -> Result<String, StoreError>;
    async fn save(&self, doc_id: &str, session_id: &str, text: &str) -> Result<(), StoreError>;
}

/// `reqwest`-backed store speaking the Orion shared-workspace endpoints.
pub struct HttpFileStore {
    http: reqwest::Client,
    load_base: String,
    save_base: String,
}

impl HttpFileStore {
    pub fn new(base_url: &str, load_path: &str, save_path: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            load_base: format!("{base_url}{load_path}"),
            save_base: format!("{base_url}{save_path}"),
        }
    }

    fn url(base: &str, doc_id: &str, session_id: &str) -> String {
        format!("{base}{doc_id}?hubID={session_id}")
    }
}

#[async_trait]
impl FileStore for HttpFileStore {
    async fn load(&self, doc_id: &str, session_id: &str) -> Result<String, StoreError> {
        let response = self
            .http
            .get(Self::url(&self.load_base, doc_id, session_id))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }

    async fn save(&self, doc_id: &str, session_id: &str, text: &str) -> Result<(), StoreError> {
        let response = self
            .http
            .put(Self::url(&self.save_base, doc_id, session_id))
            .header("Orion-Version", "1")
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=UTF-8")
            .body(text.to_string())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
