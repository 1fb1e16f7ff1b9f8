//! Reply egress to the phone.

use std::future::Future;
use std::pin::Pin;

use cona_matrix::{http_client_builder, read_capped_error_body};
use cona_types::ReplyRequest;
use thiserror::Error;
use url::Url;

pub type ReplyFut<'a> = Pin<Box<dyn Future<Output = Result<(), ReplyError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reply endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Where operator replies are delivered.
pub trait ReplySink: Send + Sync {
    fn send_reply<'a>(&'a self, reply: &'a ReplyRequest) -> ReplyFut<'a>;
}

/// POSTs `{title, text}` to the phone's reply endpoint.
///
/// Fire-and-forget: one attempt, the response body is read only to report a
/// failure status.
#[derive(Debug, Clone)]
pub struct HttpReplySink {
    http: reqwest::Client,
    url: Url,
}

impl HttpReplySink {
    pub fn new(url: Url) -> Result<Self, ReplyError> {
        let http = http_client_builder().build()?;
        Ok(Self { http, url })
    }

    async fn post(&self, reply: &ReplyRequest) -> Result<(), ReplyError> {
        let response = self.http.post(self.url.clone()).json(reply).send().await?;
        let status = response.status();
        if status.is_success() {
            // Drain so the connection can be reused.
            let _ = response.bytes().await;
            return Ok(());
        }
        Err(ReplyError::Status {
            status: status.as_u16(),
            body: read_capped_error_body(response).await,
        })
    }
}

impl ReplySink for HttpReplySink {
    fn send_reply<'a>(&'a self, reply: &'a ReplyRequest) -> ReplyFut<'a> {
        Box::pin(self.post(reply))
    }
}
