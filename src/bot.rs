mod telegram;

use std::{
  net::{IpAddr, SocketAddr},
  sync::Arc,
  time::Duration,
};

use async_trait::async_trait;
use itertools::Itertools;
use tokio::task::{JoinError, JoinSet};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, warn};

use crate::{
  config::Config,
  resolver::{ResolverRef, StreamDescriptor, StreamKind},
  route::{extract_video_id, RelayTarget, VideoId},
  Error, Result,
};

pub use telegram::Telegram;

pub type ChatId = i64;
pub type MessageId = i64;

const HELP: &str =
  "Send me a YouTube link or an 11 character video id to get started.";
const GENERIC_FAILURE: &str =
  "Something went wrong while looking up this video, please try again later.";
const PUBLIC_IP_SERVICE: &str = "https://api.ipify.org";
const POLL_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
  Text {
    chat_id: ChatId,
    text: String,
  },
  // a menu button was pressed; payload is the button's `/<id>/<index>`
  Selection {
    chat_id: ChatId,
    message_id: MessageId,
    callback_id: String,
    payload: String,
  },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MenuOption {
  pub label: String,
  pub payload: String,
}

/// The chat platform the bot talks through.
///
/// Implementations return `Error::TransportRejected` when the platform
/// refuses a request (too large, unsupported url, ...), which lets the bot
/// fall back to a plain link.
#[async_trait]
pub trait ChatTransport: Send + Sync {
  async fn poll(&self) -> Result<Vec<ChatEvent>>;
  async fn reply(&self, chat_id: ChatId, text: &str) -> Result<()>;
  async fn reply_with_menu(
    &self,
    chat_id: ChatId,
    text: &str,
    options: &[MenuOption],
  ) -> Result<()>;
  async fn edit_text(
    &self,
    chat_id: ChatId,
    message_id: MessageId,
    text: &str,
  ) -> Result<()>;
  async fn acknowledge(&self, callback_id: &str) -> Result<()>;
  async fn send_video(
    &self,
    chat_id: ChatId,
    url: &str,
    filename: &str,
  ) -> Result<()>;
  async fn send_audio(
    &self,
    chat_id: ChatId,
    url: &str,
    filename: &str,
  ) -> Result<()>;
  async fn send_link(&self, chat_id: ChatId, url: &str, text: &str)
    -> Result<()>;
}

/// Where chat users can reach the relay.
pub enum RelayAddress {
  Fixed(String),
  // asks a public ip echo service on every use
  Discover { client: reqwest::Client, port: u16 },
}

impl RelayAddress {
  pub fn from_config(config: &Config) -> Self {
    if let Some(url) = &config.public_url {
      return RelayAddress::Fixed(url.clone());
    }

    if config.bind_addr.ip().is_loopback() {
      return RelayAddress::Fixed(format!("http://{}", config.bind_addr));
    }

    RelayAddress::Discover {
      client: reqwest::Client::new(),
      port: config.bind_addr.port(),
    }
  }

  pub async fn base_url(&self) -> Result<String> {
    match self {
      RelayAddress::Fixed(url) => Ok(url.clone()),
      RelayAddress::Discover { client, port } => {
        let ip = client
          .get(PUBLIC_IP_SERVICE)
          .send()
          .await?
          .error_for_status()?
          .text()
          .await?;
        let ip: IpAddr = ip
          .trim()
          .parse()
          .map_err(|e| Error::internal("AddrParseError", e))?;

        Ok(format!("http://{}", SocketAddr::new(ip, *port)))
      }
    }
  }
}

pub struct Bot {
  transport: Arc<dyn ChatTransport>,
  resolver: ResolverRef,
  address: RelayAddress,
}

impl Bot {
  pub fn new(
    transport: Arc<dyn ChatTransport>,
    resolver: ResolverRef,
    address: RelayAddress,
  ) -> Self {
    Self {
      transport,
      resolver,
      address,
    }
  }

  pub async fn run(
    self: Arc<Self>,
    subsys: SubsystemHandle,
  ) -> anyhow::Result<()> {
    info!("bot started");
    let mut handlers = JoinSet::new();

    loop {
      let poll = self.transport.poll();
      tokio::pin!(poll);

      let events = loop {
        tokio::select! {
          _ = subsys.on_shutdown_requested() => break None,
          Some(done) = handlers.join_next() => log_handled(done),
          events = &mut poll => break Some(events),
        }
      };

      let events = match events {
        Some(Ok(events)) => events,
        Some(Err(err)) => {
          warn!("polling chat updates failed: {err}");
          tokio::select! {
            _ = subsys.on_shutdown_requested() => break,
            _ = tokio::time::sleep(POLL_BACKOFF) => continue,
          }
        }
        None => break,
      };

      for event in events {
        let bot = self.clone();
        handlers.spawn(async move { bot.handle(event).await });
      }
    }

    if !handlers.is_empty() {
      info!(pending = handlers.len(), "waiting for in-flight chat events");
    }
    while let Some(done) = handlers.join_next().await {
      log_handled(done);
    }

    info!("bot stopped");
    Ok(())
  }

  pub async fn handle(&self, event: ChatEvent) -> Result<()> {
    match event {
      ChatEvent::Text { chat_id, text } => self.on_text(chat_id, &text).await,
      ChatEvent::Selection {
        chat_id,
        message_id,
        callback_id,
        payload,
      } => {
        self.transport.acknowledge(&callback_id).await?;
        self.on_selection(chat_id, message_id, &payload).await
      }
    }
  }

  async fn on_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
    let video_id = match extract_video_id(text) {
      Some(video_id) => video_id,
      None => return self.transport.reply(chat_id, HELP).await,
    };

    debug!(%video_id, chat_id, "building stream menu");

    let streams = match self.resolver.resolve(&video_id).await {
      Ok(streams) => streams,
      Err(err) => {
        self.transport.reply(chat_id, &user_message(&err)).await?;
        return report(err);
      }
    };

    let options = build_menu(&video_id, &streams);
    let text = format!("Pick a stream of {video_id}:");
    self.transport.reply_with_menu(chat_id, &text, &options).await
  }

  async fn on_selection(
    &self,
    chat_id: ChatId,
    message_id: MessageId,
    payload: &str,
  ) -> Result<()> {
    let target = match RelayTarget::parse(payload) {
      Some(target) => target,
      None => {
        warn!(payload, "ignoring selection with malformed payload");
        return Ok(());
      }
    };

    let streams = match self.resolver.resolve(&target.video_id).await {
      Ok(streams) => streams,
      Err(err) => {
        let text = user_message(&err);
        self.transport.edit_text(chat_id, message_id, &text).await?;
        return report(err);
      }
    };

    let stream = match streams.get(target.stream_index) {
      Some(stream) => stream,
      None => {
        let err = Error::IndexOutOfRange {
          video_id: target.video_id.clone(),
          index: target.stream_index,
          count: streams.len(),
        };
        let text = err.to_string();
        return self.transport.edit_text(chat_id, message_id, &text).await;
      }
    };

    let status = format!("Sending {} ...", option_label(stream));
    self.transport.edit_text(chat_id, message_id, &status).await?;

    let base = self.address.base_url().await?;
    let url = relay_url(&base, &target, stream);
    let filename = stream.filename();

    let sent = match stream.kind {
      StreamKind::Video => {
        self.transport.send_video(chat_id, &url, &filename).await
      }
      StreamKind::Audio => {
        self.transport.send_audio(chat_id, &url, &filename).await
      }
    };

    match sent {
      Err(Error::TransportRejected(reason)) => {
        info!(%url, "media push rejected ({reason}), sending a link instead");
        self.transport.send_link(chat_id, &url, &filename).await
      }
      other => other,
    }
  }
}

fn log_handled(done: std::result::Result<Result<()>, JoinError>) {
  match done {
    Ok(Ok(())) => {}
    Ok(Err(err)) => warn!("failed to handle chat event: {err}"),
    Err(err) => warn!("chat event handler aborted: {err}"),
  }
}

// classified failures are an answer; anything else is worth bubbling up.
fn report(err: Error) -> Result<()> {
  match err {
    Error::Unresolvable { .. } => Ok(()),
    err => Err(err),
  }
}

fn user_message(err: &Error) -> String {
  match err {
    Error::Internal { .. } => GENERIC_FAILURE.to_string(),
    err => err.to_string(),
  }
}

/// Video options first, smallest resolution first, then audio options in
/// resolved order.
pub fn build_menu(
  video_id: &VideoId,
  streams: &[StreamDescriptor],
) -> Vec<MenuOption> {
  let (videos, audios): (Vec<_>, Vec<_>) = streams
    .iter()
    .partition(|stream| stream.kind == StreamKind::Video);

  videos
    .into_iter()
    .sorted_by_key(|stream| stream.height().unwrap_or(0))
    .chain(audios)
    .map(|stream| MenuOption {
      label: option_label(stream),
      payload: RelayTarget {
        video_id: video_id.clone(),
        stream_index: stream.index,
      }
      .path(),
    })
    .collect()
}

pub fn option_label(stream: &StreamDescriptor) -> String {
  let computed_kbps = stream.kbps().map(|kbps| format!("{kbps}kbps"));

  let parts = match stream.kind {
    StreamKind::Video => [stream.resolution.clone(), computed_kbps],
    StreamKind::Audio => [stream.audio_bitrate.clone().or(computed_kbps), None],
  };

  std::iter::once(stream.mime_type.clone())
    .chain(parts.into_iter().flatten())
    .join(" ")
}

fn relay_url(
  base: &str,
  target: &RelayTarget,
  stream: &StreamDescriptor,
) -> String {
  format!(
    "{}/{}/{}/{}",
    base.trim_end_matches('/'),
    target.video_id,
    target.stream_index,
    stream.filename()
  )
}
