mod rustube;
mod ytdlp;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
  config::{Config, ResolverKind},
  route::VideoId,
  Error, Result,
};

pub use self::rustube::Rustube;
pub use ytdlp::YtDlp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
  Audio,
  Video,
}

/// One encoded rendition of a video. The url is short-lived and the index
/// is only meaningful within the list it was resolved in.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescriptor {
  pub index: usize,
  pub kind: StreamKind,
  pub mime_type: String,
  // e.g. "720p" or "1080p60"
  pub resolution: Option<String>,
  // e.g. "128kbps", when the extractor provides one
  pub audio_bitrate: Option<String>,
  // bits per second
  pub bitrate: Option<u64>,
  pub url: String,
}

static LEADING_DIGITS: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^\d+").unwrap());

impl StreamDescriptor {
  pub fn extension(&self) -> &str {
    let subtype = self
      .mime_type
      .split_once('/')
      .map(|(_, subtype)| subtype)
      .unwrap_or("bin");
    let subtype = subtype.split(';').next().unwrap_or(subtype).trim();

    match (self.kind, subtype) {
      (StreamKind::Audio, "mp4") => "m4a",
      (_, "3gpp") => "3gp",
      (_, "") => "bin",
      (_, subtype) => subtype,
    }
  }

  pub fn filename(&self) -> String {
    format!("video.{}", self.extension())
  }

  pub fn height(&self) -> Option<u32> {
    let resolution = self.resolution.as_deref()?;
    LEADING_DIGITS.find(resolution)?.as_str().parse().ok()
  }

  pub fn kbps(&self) -> Option<u64> {
    self.bitrate.map(|bps| bps / 1000)
  }
}

/// Why a video could not be turned into a list of streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveFailure {
  Private,
  RegionBlocked,
  Unavailable,
  NoStreams,
}

impl fmt::Display for ResolveFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let msg = match self {
      ResolveFailure::Private => "is private",
      ResolveFailure::RegionBlocked => "is not available in this region",
      ResolveFailure::Unavailable => "is unavailable",
      ResolveFailure::NoStreams => "has no downloadable streams",
    };
    f.write_str(msg)
  }
}

#[async_trait]
pub trait Resolver: Send + Sync {
  /// Resolves the current streams of a video. Classified failures come back
  /// as `Error::Unresolvable`; anything else is an internal error.
  async fn resolve(&self, video_id: &VideoId) -> Result<Vec<StreamDescriptor>>;
}

pub type ResolverRef = Arc<dyn Resolver>;

pub fn from_config(config: &Config) -> ResolverRef {
  match config.resolver {
    ResolverKind::Rustube => Arc::new(Rustube),
    ResolverKind::YtDlp => Arc::new(YtDlp::new(
      config.ytdlp_proxy.clone(),
      config.ytdlp_concurrency,
    )),
  }
}

// reindexes the extracted streams and rejects an empty result.
fn finish(
  video_id: &VideoId,
  streams: Vec<StreamDescriptor>,
) -> Result<Vec<StreamDescriptor>> {
  if streams.is_empty() {
    return Err(Error::Unresolvable {
      video_id: video_id.clone(),
      reason: ResolveFailure::NoStreams,
    });
  }

  Ok(
    streams
      .into_iter()
      .enumerate()
      .map(|(index, stream)| StreamDescriptor { index, ..stream })
      .collect(),
  )
}

// phrases extractors use when a video can't be played. bot checks, age gates
// and anything else unrecognized yield None.
const PRIVATE_PHRASES: &[&str] =
  &["private video", "video is private", "if you've been granted access"];
const REGION_PHRASES: &[&str] = &[
  "available in your country",
  "blocked it in your country",
  "geo-restrict",
];
const UNAVAILABLE_PHRASES: &[&str] = &[
  "video unavailable",
  "video is unavailable",
  "video has been removed",
  "no longer available",
];

fn classify_unavailable(detail: &str) -> Option<ResolveFailure> {
  let detail = detail.to_lowercase();
  let mentions = |phrases: &[&str]| phrases.iter().any(|p| detail.contains(p));

  // before UNAVAILABLE_PHRASES: region blocks read "Video unavailable. The
  // uploader has not made this video available in your country"
  if mentions(PRIVATE_PHRASES) {
    Some(ResolveFailure::Private)
  } else if mentions(REGION_PHRASES) {
    Some(ResolveFailure::RegionBlocked)
  } else if mentions(UNAVAILABLE_PHRASES) {
    Some(ResolveFailure::Unavailable)
  } else {
    None
  }
}


#[cfg(test)]
mod test {
  use super::stub::{audio, video};
  use super::*;

  #[test]
  fn test_extension_and_filename() {
    assert_eq!(video("video/mp4", "720p", "").filename(), "video.mp4");
    assert_eq!(video("video/webm", "720p", "").extension(), "webm");
    assert_eq!(video("video/3gpp", "144p", "").extension(), "3gp");
    assert_eq!(audio("audio/mp4", 128_000, "").extension(), "m4a");
    assert_eq!(audio("audio/webm", 160_000, "").extension(), "webm");
    assert_eq!(
      video("video/mp4; codecs=\"avc1\"", "720p", "").extension(),
      "mp4"
    );
    assert_eq!(video("garbage", "720p", "").extension(), "bin");
  }

  #[test]
  fn test_height() {
    assert_eq!(video("video/mp4", "1080p60", "").height(), Some(1080));
    assert_eq!(video("video/mp4", "144p", "").height(), Some(144));
    assert_eq!(video("video/mp4", "hd", "").height(), None);
    assert_eq!(audio("audio/mp4", 1, "").height(), None);
  }

  #[test]
  fn test_finish_reindexes_and_rejects_empty() {
    let id = VideoId::parse("dQw4w9WgXcQ").unwrap();
    let streams = vec![
      video("video/mp4", "720p", "a"),
      audio("audio/mp4", 128_000, "b"),
    ];

    let streams = finish(&id, streams).unwrap();
    assert_eq!(streams[0].index, 0);
    assert_eq!(streams[1].index, 1);

    match finish(&id, vec![]) {
      Err(Error::Unresolvable { reason, .. }) => {
        assert_eq!(reason, ResolveFailure::NoStreams)
      }
      other => panic!("unexpected: {other:?}"),
    }
  }

  #[test]
  fn test_classify_unavailable() {
    use ResolveFailure::*;

    assert_eq!(classify_unavailable("This video is private"), Some(Private));
    assert_eq!(
      classify_unavailable(
        "Private video. Sign in if you've been granted access to this video"
      ),
      Some(Private)
    );
    assert_eq!(
      classify_unavailable(
        "Video unavailable. The uploader has not made this video available \
         in your country"
      ),
      Some(RegionBlocked)
    );
    assert_eq!(
      classify_unavailable("This video is geo-restricted"),
      Some(RegionBlocked)
    );
    assert_eq!(classify_unavailable("Video unavailable"), Some(Unavailable));

    assert_eq!(
      classify_unavailable("Sign in to confirm you're not a bot"),
      None
    );
    assert_eq!(
      classify_unavailable(
        "Sign in to confirm your age. This video may be inappropriate"
      ),
      None
    );
    assert_eq!(
      classify_unavailable("Unable to extract geolocation data"),
      None
    );
    assert_eq!(classify_unavailable("LoginRequired"), None);
  }
}
