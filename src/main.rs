use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod bot;
mod config;
mod error;
mod relay;
mod resolver;
mod route;
mod util;

pub use error::{Error, Result};

use crate::{
  bot::{Bot, RelayAddress, Telegram},
  config::Config,
  relay::RelayEngine,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let config = Config::from_env().context("failed to read configuration")?;
  let resolver = resolver::from_config(&config);

  let engine = Arc::new(
    RelayEngine::new(resolver.clone(), &config)
      .context("failed to build relay engine")?,
  );

  let bot = match &config.bot_token {
    Some(token) => {
      let transport =
        Telegram::new(token).context("failed to build chat transport")?;
      let address = RelayAddress::from_config(&config);
      Some(Arc::new(Bot::new(Arc::new(transport), resolver, address)))
    }
    None => {
      info!("BOT_TOKEN not set, running without the chat bot");
      None
    }
  };

  let bind_addr = config.bind_addr;

  Toplevel::new(move |s: SubsystemHandle| async move {
    s.start(SubsystemBuilder::new("relay", move |h: SubsystemHandle| {
      relay::serve(engine, bind_addr, h)
    }));

    if let Some(bot) = bot {
      s.start(SubsystemBuilder::new("bot", move |h: SubsystemHandle| {
        bot.run(h)
      }));
    }
  })
  .catch_signals()
  .handle_shutdown_requests(SHUTDOWN_TIMEOUT)
  .await
  .map_err(|e| anyhow::anyhow!("{e}"))
}
