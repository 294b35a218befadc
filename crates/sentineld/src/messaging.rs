//! Best-effort alert delivery.
//!
//! Sinks never retry. Callers log failures and move on.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on one HTTP request, connection included.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// A JPEG image attached to an alert.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub jpeg: Vec<u8>,
}

/// One alert, addressed to several recipients.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub message: String,
    pub attachment: Option<Attachment>,
    pub recipients: Vec<String>,
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<(), SinkError>;
}

/// Send `event` to each recipient in turn. Returns how many succeeded.
pub async fn deliver(sink: &dyn MessageSink, event: &AlertEvent) -> usize {
    let mut delivered = 0;
    for recipient in &event.recipients {
        match sink
            .send(recipient, &event.message, event.attachment.as_ref())
            .await
        {
            Ok(()) => delivered += 1,
            Err(e) => tracing::warn!(sink = sink.name(), recipient, error = %e, "alert delivery failed"),
        }
    }
    tracing::info!(
        sink = sink.name(),
        delivered,
        total = event.recipients.len(),
        "alert dispatched"
    );
    delivered
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "HTTP client setup failed; using defaults");
            reqwest::Client::new()
        })
}

async fn check_status(resp: reqwest::Response) -> Result<(), SinkError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SinkError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Telegram Bot API: `sendPhoto` with an attachment, `sendMessage` without.
pub struct TelegramSink {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramSink {
    pub fn new(token: &str) -> Self {
        Self::with_api_base(format!("https://api.telegram.org/bot{token}"))
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            client: http_client(SEND_TIMEOUT),
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl MessageSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<(), SinkError> {
        let resp = match attachment {
            Some(a) => {
                let photo = reqwest::multipart::Part::bytes(a.jpeg.clone())
                    .file_name(a.file_name.clone())
                    .mime_str("image/jpeg")?;
                let form = reqwest::multipart::Form::new()
                    .text("chat_id", recipient.to_string())
                    .text("caption", text.to_string())
                    .part("photo", photo);
                self.client
                    .post(format!("{}/sendPhoto", self.api_base))
                    .multipart(form)
                    .send()
                    .await?
            }
            None => {
                self.client
                    .post(format!("{}/sendMessage", self.api_base))
                    .json(&serde_json::json!({ "chat_id": recipient, "text": text }))
                    .send()
                    .await?
            }
        };
        check_status(resp).await
    }
}

/// Generic SMS gateway taking `to`, `message` and an optional `image` part.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: http_client(SEND_TIMEOUT),
            url: url.into(),
        }
    }
}

#[async_trait]
impl MessageSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<(), SinkError> {
        let mut form = reqwest::multipart::Form::new()
            .text("to", recipient.to_string())
            .text("message", text.to_string());
        if let Some(a) = attachment {
            let image = reqwest::multipart::Part::bytes(a.jpeg.clone())
                .file_name(a.file_name.clone())
                .mime_str("image/jpeg")?;
            form = form.part("image", image);
        }
        let resp = self.client.post(&self.url).multipart(form).send().await?;
        check_status(resp).await
    }
}

/// Logs alerts instead of sending them; used when no transport is configured.
pub struct LogSink;

#[async_trait]
impl MessageSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        attachment: Option<&Attachment>,
    ) -> Result<(), SinkError> {
        tracing::info!(
            recipient,
            text,
            attachment = attachment.map(|a| a.file_name.as_str()),
            "alert (no transport configured)"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[tokio::test]
    async fn test_deliver_continues_past_failures() {
        let sink = RecordingSink {
            fail_for: Some("bad".into()),
            ..Default::default()
        };
        let event = AlertEvent {
            message: "hello".into(),
            attachment: None,
            recipients: vec!["a".into(), "bad".into(), "c".into()],
        };
        assert_eq!(deliver(&sink, &event).await, 2);
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].recipient, "c");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        // Port 9 on localhost: nothing listens, the connection is refused.
        let sink = TelegramSink::with_api_base("http://127.0.0.1:9/botTOKEN");
        assert!(matches!(sink.send("1", "hi", None).await, Err(SinkError::Http(_))));
    }

    #[tokio::test]
    async fn test_stalled_endpoint_times_out() {
        // Accept connections and never answer.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let sink = WebhookSink {
            client: http_client(Duration::from_millis(200)),
            url: format!("http://{addr}/sms"),
        };
        let sent = tokio::time::timeout(Duration::from_secs(5), sink.send("+1555", "hi", None))
            .await
            .expect("request should time out on its own");
        assert!(matches!(sent, Err(SinkError::Http(_))));
    }

    #[tokio::test]
    async fn test_log_sink_always_succeeds() {
        let attachment = Attachment {
            file_name: "face.jpg".into(),
            jpeg: vec![0xFF, 0xD8],
        };
        assert!(LogSink.send("x", "y", Some(&attachment)).await.is_ok());
    }
}
