//! Mail notification.
//!
//! Form data travels as `base64(key):base64(value)` pairs joined by `&`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use imgate_account::{InboxUrl, MailMessage};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

/// Mail-notification capability flags.
pub const SUPPORTS_UNREAD_MAIL_COUNT: u32 = 1;
pub const SUPPORTS_REQUEST_MAIL_URL: u32 = 2;
pub const EMITS_MAILS_RECEIVED: u32 = 4;

pub const CAPABILITIES: u32 =
    SUPPORTS_UNREAD_MAIL_COUNT | SUPPORTS_REQUEST_MAIL_URL | EMITS_MAILS_RECEIVED;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MailUrl {
    pub url: String,
    pub method: HttpMethod,
    pub post_data: Vec<(String, String)>,
}

impl From<InboxUrl> for MailUrl {
    fn from(inbox: InboxUrl) -> Self {
        Self {
            url: inbox.post_url,
            method: HttpMethod::Post,
            post_data: inbox.form_data,
        }
    }
}

/// One entry of a `MailsReceived` signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Mail {
    pub id: String,
    pub url_data: String,
    pub senders: Vec<(String, String)>,
    pub subject: String,
}

impl From<MailMessage> for Mail {
    fn from(mail: MailMessage) -> Self {
        Self {
            url_data: encode_url_data(&mail.form_data),
            id: mail.post_url,
            senders: vec![(mail.sender_name, mail.sender_address)],
            subject: mail.subject,
        }
    }
}

pub fn encode_url_data(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}:{}", STANDARD.encode(k), STANDARD.encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn decode_url_data(data: &str) -> GatewayResult<Vec<(String, String)>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let decode = |part: &str| -> GatewayResult<String> {
        let bytes = STANDARD
            .decode(part)
            .map_err(|e| GatewayError::invalid_argument(format!("bad url data: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|_| GatewayError::invalid_argument("url data is not utf-8"))
    };
    data.split('&')
        .map(|pair| {
            let (k, v) = pair
                .split_once(':')
                .ok_or_else(|| GatewayError::invalid_argument(format!("bad url pair '{pair}'")))?;
            Ok((decode(k)?, decode(v)?))
        })
        .collect()
}

/// Per-connection mailbox state.
#[derive(Debug, Default)]
pub struct MailNotification {
    enabled: bool,
    unread: u32,
    waiting: Vec<oneshot::Sender<MailUrl>>,
}

impl MailNotification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, unread: u32) {
        self.enabled = true;
        self.unread = unread;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn capabilities(&self) -> u32 {
        if self.enabled { CAPABILITIES } else { 0 }
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    /// Record a new unread count; true when it changed.
    pub fn set_unread(&mut self, count: u32) -> bool {
        let changed = self.unread != count;
        self.unread = count;
        changed
    }

    /// Queue a caller for the next inbox URL. Returns true when no request
    /// is in flight yet and the account has to be asked.
    pub fn wait_inbox(&mut self, reply: oneshot::Sender<MailUrl>) -> bool {
        self.waiting.retain(|tx| !tx.is_closed());
        self.waiting.push(reply);
        self.waiting.len() == 1
    }

    pub fn inbox_ready(&mut self, url: MailUrl) {
        for tx in self.waiting.drain(..) {
            if tx.send(url.clone()).is_err() {
                debug!("inbox url requester went away");
            }
        }
    }

    /// Dropping the senders fails every waiting caller.
    pub fn clear(&mut self) {
        self.enabled = false;
        self.unread = 0;
        self.waiting.clear();
    }
}

/// Mail URL for a notification previously delivered in `MailsReceived`.
pub fn mail_url(id: &str, url_data: &str) -> GatewayResult<MailUrl> {
    Ok(MailUrl {
        url: id.to_string(),
        method: HttpMethod::Post,
        post_data: decode_url_data(url_data)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_data_survives_encoding() {
        let pairs = vec![
            ("folder".to_string(), "inbox".to_string()),
            ("t".to_string(), "a&b:c".to_string()),
        ];
        let encoded = encode_url_data(&pairs);
        assert_eq!(encoded.matches('&').count(), 1);
        assert_eq!(decode_url_data(&encoded).unwrap(), pairs);
    }

    #[test]
    fn malformed_url_data_is_rejected() {
        for bad in ["nocolon", "!!!:Zm9v", "Zm9v:Zm9v&x"] {
            assert_eq!(
                decode_url_data(bad).unwrap_err().error_code(),
                "invalid_argument",
                "{bad}"
            );
        }
    }

    #[test]
    fn mail_uses_post_url_as_id() {
        let mail = Mail::from(MailMessage {
            sender_name: "Alice".into(),
            sender_address: "alice@example.com".into(),
            subject: "hi".into(),
            post_url: "https://mail.example.com/open".into(),
            form_data: vec![("id".into(), "42".into())],
        });
        assert_eq!(mail.id, "https://mail.example.com/open");
        let url = mail_url(&mail.id, &mail.url_data).unwrap();
        assert_eq!(url.post_data, vec![("id".to_string(), "42".to_string())]);
        assert_eq!(url.method, HttpMethod::Post);
    }

    #[tokio::test]
    async fn waiters_share_one_request() {
        let mut mail = MailNotification::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        assert!(mail.wait_inbox(tx1));
        assert!(!mail.wait_inbox(tx2));
        mail.inbox_ready(MailUrl {
            url: "https://inbox".into(),
            method: HttpMethod::Post,
            post_data: Vec::new(),
        });
        assert_eq!(rx1.await.unwrap().url, "https://inbox");
        assert_eq!(rx2.await.unwrap().url, "https://inbox");
    }
}
