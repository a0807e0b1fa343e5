use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

const DEFAULT_BIND: &str = "0.0.0.0:8081";
const DEFAULT_CONCURRENCY: usize = 64;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverKind {
  Rustube,
  YtDlp,
}

impl FromStr for ResolverKind {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "rustube" => Ok(ResolverKind::Rustube),
      "ytdlp" | "yt-dlp" => Ok(ResolverKind::YtDlp),
      other => bail!("unknown resolver: {other}"),
    }
  }
}

/// Static configuration, read once at startup and handed to the relay and
/// the bot.
#[derive(Clone, Debug)]
pub struct Config {
  pub bind_addr: SocketAddr,
  // externally reachable base url of the relay, used in bot replies.
  // discovered from the public ip when absent.
  pub public_url: Option<String>,
  pub bot_token: Option<String>,
  pub concurrency: usize,
  pub upstream_timeout: Duration,
  pub resolver: ResolverKind,
  pub ytdlp_proxy: Option<String>,
  pub ytdlp_concurrency: usize,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    fn parse<T>(key: &str, value: Option<String>, default: T) -> Result<T>
    where
      T: FromStr,
      T::Err: std::fmt::Display,
    {
      match value {
        None => Ok(default),
        Some(v) => v
          .trim()
          .parse()
          .map_err(|e| anyhow::anyhow!("{e}"))
          .with_context(|| format!("invalid value for {key}: {v:?}")),
      }
    }

    let bind_addr = parse(
      "RELAY_BIND",
      var("RELAY_BIND"),
      DEFAULT_BIND.parse::<SocketAddr>().context("default bind address")?,
    )?;
    let concurrency = parse(
      "RELAY_CONCURRENCY",
      var("RELAY_CONCURRENCY"),
      DEFAULT_CONCURRENCY,
    )?;
    let timeout_secs = parse(
      "UPSTREAM_TIMEOUT_SECS",
      var("UPSTREAM_TIMEOUT_SECS"),
      DEFAULT_UPSTREAM_TIMEOUT_SECS,
    )?;
    let resolver =
      parse("RESOLVER", var("RESOLVER"), ResolverKind::Rustube)?;
    let ytdlp_concurrency =
      parse("YTDLP_CONCURRENCY", var("YTDLP_CONCURRENCY"), 1)?;

    if concurrency == 0 {
      bail!("RELAY_CONCURRENCY must be at least 1");
    }

    Ok(Self {
      bind_addr,
      public_url: var("RELAY_PUBLIC_URL")
        .map(|url| url.trim_end_matches('/').to_string()),
      bot_token: var("BOT_TOKEN"),
      concurrency,
      upstream_timeout: Duration::from_secs(timeout_secs),
      resolver,
      ytdlp_proxy: var("YTDLP_PROXY"),
      ytdlp_concurrency,
    })
  }
}
