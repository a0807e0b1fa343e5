use std::{
  sync::atomic::{AtomicI64, Ordering},
  time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::{Error, Result};

use super::{ChatEvent, ChatId, ChatTransport, MenuOption, MessageId};

const API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_SECS: u64 = 30;

/// Telegram Bot API over plain HTTPS, long-polling `getUpdates`.
pub struct Telegram {
  client: reqwest::Client,
  endpoint: String,
  // id of the next update to fetch
  offset: AtomicI64,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
  ok: bool,
  result: Option<T>,
  description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Update {
  update_id: i64,
  message: Option<Message>,
  callback_query: Option<CallbackQuery>,
}

#[derive(Deserialize, Debug)]
struct Message {
  message_id: i64,
  chat: Chat,
  text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Chat {
  id: i64,
}

#[derive(Deserialize, Debug)]
struct CallbackQuery {
  id: String,
  message: Option<Message>,
  data: Option<String>,
}

impl Telegram {
  pub fn new(token: &str) -> Result<Self> {
    Self::with_endpoint(format!("{API_BASE}/bot{token}"))
  }

  pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
      .build()?;

    Ok(Self {
      client,
      endpoint: endpoint.into(),
      offset: AtomicI64::new(0),
    })
  }

  async fn call<T: DeserializeOwned>(
    &self,
    method: &str,
    payload: Value,
  ) -> Result<T> {
    debug!(method, "telegram api call");

    // api errors are json bodies with a non-2xx status
    let resp: ApiResponse<T> = self
      .client
      .post(format!("{}/{method}", self.endpoint))
      .json(&payload)
      .send()
      .await?
      .json()
      .await?;

    match resp {
      ApiResponse {
        ok: true,
        result: Some(result),
        ..
      } => Ok(result),
      ApiResponse { description, .. } => Err(Error::TransportRejected(
        description.unwrap_or_else(|| format!("{method} failed")),
      )),
    }
  }
}

fn to_event(update: Update) -> Option<ChatEvent> {
  if let Some(query) = update.callback_query {
    let message = query.message?;
    return Some(ChatEvent::Selection {
      chat_id: message.chat.id,
      message_id: message.message_id,
      callback_id: query.id,
      payload: query.data?,
    });
  }

  let message = update.message?;
  Some(ChatEvent::Text {
    chat_id: message.chat.id,
    text: message.text?,
  })
}

fn escape_html(text: &str) -> String {
  text
    .replace('&', "&amp;")
    .replace('<', "&lt;")
    .replace('>', "&gt;")
    .replace('"', "&quot;")
}

#[async_trait]
impl ChatTransport for Telegram {
  async fn poll(&self) -> Result<Vec<ChatEvent>> {
    let offset = self.offset.load(Ordering::SeqCst);
    let updates: Vec<Update> = self
      .call(
        "getUpdates",
        json!({
          "offset": offset,
          "timeout": LONG_POLL_SECS,
          "allowed_updates": ["message", "callback_query"],
        }),
      )
      .await?;

    if let Some(last) = updates.iter().map(|u| u.update_id).max() {
      self.offset.store(last + 1, Ordering::SeqCst);
    }

    Ok(updates.into_iter().filter_map(to_event).collect())
  }

  async fn reply(&self, chat_id: ChatId, text: &str) -> Result<()> {
    self
      .call::<Value>("sendMessage", json!({ "chat_id": chat_id, "text": text }))
      .await?;
    Ok(())
  }

  async fn reply_with_menu(
    &self,
    chat_id: ChatId,
    text: &str,
    options: &[MenuOption],
  ) -> Result<()> {
    let keyboard = options
      .iter()
      .map(|option| {
        vec![json!({ "text": option.label, "callback_data": option.payload })]
      })
      .collect::<Vec<_>>();

    self
      .call::<Value>(
        "sendMessage",
        json!({
          "chat_id": chat_id,
          "text": text,
          "reply_markup": { "inline_keyboard": keyboard },
        }),
      )
      .await?;
    Ok(())
  }

  async fn edit_text(
    &self,
    chat_id: ChatId,
    message_id: MessageId,
    text: &str,
  ) -> Result<()> {
    self
      .call::<Value>(
        "editMessageText",
        json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
      )
      .await?;
    Ok(())
  }

  async fn acknowledge(&self, callback_id: &str) -> Result<()> {
    self
      .call::<Value>(
        "answerCallbackQuery",
        json!({ "callback_query_id": callback_id }),
      )
      .await?;
    Ok(())
  }

  async fn send_video(
    &self,
    chat_id: ChatId,
    url: &str,
    filename: &str,
  ) -> Result<()> {
    self
      .call::<Value>(
        "sendVideo",
        json!({
          "chat_id": chat_id,
          "video": url,
          "caption": filename,
          "supports_streaming": true,
        }),
      )
      .await?;
    Ok(())
  }

  async fn send_audio(
    &self,
    chat_id: ChatId,
    url: &str,
    filename: &str,
  ) -> Result<()> {
    self
      .call::<Value>(
        "sendAudio",
        json!({ "chat_id": chat_id, "audio": url, "caption": filename }),
      )
      .await?;
    Ok(())
  }

  async fn send_link(
    &self,
    chat_id: ChatId,
    url: &str,
    text: &str,
  ) -> Result<()> {
    let html = format!(
      "<a href=\"{}\">{}</a>",
      escape_html(url),
      escape_html(text)
    );

    self
      .call::<Value>(
        "sendMessage",
        json!({ "chat_id": chat_id, "text": html, "parse_mode": "HTML" }),
      )
      .await?;
    Ok(())
  }
}
