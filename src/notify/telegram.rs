use async_trait::async_trait;
use serde_json::{json, Value};

use super::{NotifyError, NotifySender};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Sends Markdown messages through the Telegram Bot API.
pub struct TelegramSender {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramSender {
    pub fn new(client: reqwest::Client, bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client,
            api_base: TELEGRAM_API.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Build from a destination config: `{"bot_token": "...", "chat_id": "..."}`.
    /// `chat_id` may be a string or a number; camelCase keys are accepted too.
    pub fn from_config(client: reqwest::Client, config: &Value) -> Result<Self, NotifyError> {
        let bot_token = config_str(config, &["bot_token", "botToken"])
            .ok_or_else(|| NotifyError::NotConfigured("telegram: missing bot_token".to_string()))?;
        let chat_id = config_str(config, &["chat_id", "chatId"])
            .ok_or_else(|| NotifyError::NotConfigured("telegram: missing chat_id".to_string()))?;
        Ok(Self::new(client, bot_token, chat_id))
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

#[async_trait]
impl NotifySender for TelegramSender {
    fn name(&self) -> String {
        format!("telegram:{}", self.chat_id)
    }

    /// Sends with Markdown first. Telegram answers 400 when a name breaks
    /// the markup (`ESPN_HD`), so that case is resent as plain text.
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        match self.post(text, true).await {
            Err(NotifyError::Rejected { status: 400, description }) => {
                tracing::warn!(
                    "Notify: telegram:{} rejected Markdown ({}), resending as plain text",
                    self.chat_id,
                    description
                );
                self.post(text, false).await
            }
            outcome => outcome,
        }
    }
}

impl TelegramSender {
    async fn post(&self, text: &str, markdown: bool) -> Result<(), NotifyError> {
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        if markdown {
            body["parse_mode"] = json!("Markdown");
        }

        let response = self.client.post(self.endpoint()).json(&body).send().await?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() && body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }

        Err(NotifyError::Rejected {
            status: status.as_u16(),
            description: body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        })
    }
}

/// First non-empty string or number under any of `keys`.
pub(crate) fn config_str(config: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match config.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_from_config() {
        let sender = TelegramSender::from_config(
            reqwest::Client::new(),
            &json!({"botToken": "123:abc", "chatId": "@alerts"}),
        )
        .unwrap();
        assert_eq!(sender.name(), "telegram:@alerts");
        assert_eq!(sender.endpoint(), "https://api.telegram.org/bot123:abc/sendMessage");

        let err = TelegramSender::from_config(reqwest::Client::new(), &json!({"bot_token": "", "chat_id": 1}));
        assert!(matches!(err, Err(NotifyError::NotConfigured(_))));
    }

    type Received = Arc<Mutex<Vec<Value>>>;

    /// Rejects Markdown bodies with an unpaired `_`, like the Bot API does.
    async fn fake_send_message(State(received): State<Received>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let markdown = body.get("parse_mode").is_some();
        let underscores = body["text"].as_str().unwrap_or_default().matches('_').count();
        received.lock().unwrap().push(body);

        if markdown && underscores % 2 == 1 {
            let reply = json!({"ok": false, "description": "Bad Request: can't parse entities"});
            return (StatusCode::BAD_REQUEST, Json(reply));
        }
        (StatusCode::OK, Json(json!({"ok": true})))
    }

    #[tokio::test]
    async fn test_underscore_in_channel_name_still_delivers() {
        let received = Received::default();
        let app = Router::new()
            .route("/botTOKEN/sendMessage", post(fake_send_message))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sender = TelegramSender {
            api_base: format!("http://{}", addr),
            ..TelegramSender::new(reqwest::Client::new(), "TOKEN", "42")
        };
        sender
            .send("🚨 *2 channel(s) down:*\n• ESPN_HD (Server s1)\n• News (Server s1)")
            .await
            .unwrap();

        let bodies = received.lock().unwrap().clone();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["parse_mode"], "Markdown");
        assert!(bodies[1].get("parse_mode").is_none());
        assert!(bodies[1]["text"].as_str().unwrap().contains("ESPN_HD"));
        assert!(bodies[1]["text"].as_str().unwrap().contains("News"));
    }

    #[tokio::test]
    async fn test_connection_failure_is_not_retried() {
        let sender = TelegramSender {
            api_base: "http://127.0.0.1:9".to_string(),
            ..TelegramSender::new(reqwest::Client::new(), "TOKEN", "42")
        };
        assert!(matches!(sender.send("plain").await, Err(NotifyError::Http(_))));
    }
}
