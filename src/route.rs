use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

// /<video-id>/<stream-index>, optionally followed by a cosmetic filename
// segment such as /video.mp4 so that downloads get a sensible name.
static RELAY_PATH_REGEX: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"^/([A-Za-z0-9_-]{11})/(\d{0,2})(?:/[^/]*)?$").unwrap()
});

// an id on its own, or one following a slash (youtu.be/<id>, /shorts/<id>)
// or a `v=` query parameter.
static LOOSE_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"(?:^|/|v=)([A-Za-z0-9_-]{11})(?:$|[^A-Za-z0-9_-])").unwrap()
});

const VIDEO_ID_LEN: usize = 11;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VideoId(String);

impl VideoId {
  pub fn parse(raw: &str) -> Option<Self> {
    let valid = raw.len() == VIDEO_ID_LEN
      && raw
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

    valid.then(|| Self(raw.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn watch_url(&self) -> String {
    format!("https://www.youtube.com/watch?v={}", self.0)
  }
}

impl fmt::Display for VideoId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayTarget {
  pub video_id: VideoId,
  pub stream_index: usize,
}

impl RelayTarget {
  /// Parses a relay path. An empty index (`/<id>/`) selects stream 0.
  pub fn parse(path: &str) -> Option<Self> {
    let caps = RELAY_PATH_REGEX.captures(path)?;
    let video_id = VideoId::parse(&caps[1])?;
    let stream_index = match &caps[2] {
      "" => 0,
      digits => digits.parse().ok()?,
    };

    Some(Self {
      video_id,
      stream_index,
    })
  }

  pub fn path(&self) -> String {
    format!("/{}/{}", self.video_id, self.stream_index)
  }
}

/// Finds a video id in free-form chat text, either bare or embedded in a
/// youtube url.
pub fn extract_video_id(text: &str) -> Option<VideoId> {
  let text = text.trim();
  if let Some(id) = VideoId::parse(text) {
    return Some(id);
  }

  LOOSE_ID_REGEX
    .captures_iter(text)
    .find_map(|caps| VideoId::parse(&caps[1]))
}

#[cfg(test)]
mod test {
  use super::*;

  fn target(path: &str) -> Option<(String, usize)> {
    RelayTarget::parse(path)
      .map(|t| (t.video_id.as_str().to_string(), t.stream_index))
  }

  #[test]
  fn test_parse_relay_path() {
    assert_eq!(target("/dQw4w9WgXcQ/0"), Some(("dQw4w9WgXcQ".into(), 0)));
    assert_eq!(target("/dQw4w9WgXcQ/17"), Some(("dQw4w9WgXcQ".into(), 17)));
    assert_eq!(target("/a-b_c-d_e-f/3"), Some(("a-b_c-d_e-f".into(), 3)));
    // missing index falls back to the first stream
    assert_eq!(target("/dQw4w9WgXcQ/"), Some(("dQw4w9WgXcQ".into(), 0)));
    // trailing filename segment produced by the bot
    assert_eq!(
      target("/dQw4w9WgXcQ/4/video.webm"),
      Some(("dQw4w9WgXcQ".into(), 4))
    );
  }

  #[test]
  fn test_reject_malformed_path() {
    assert_eq!(target("/"), None);
    assert_eq!(target("/health"), None);
    assert_eq!(target("/dQw4w9WgXcQ"), None);
    assert_eq!(target("/dQw4w9WgXc/0"), None);
    assert_eq!(target("/dQw4w9WgXcQQ/0"), None);
    assert_eq!(target("/dQw4w9WgX.Q/0"), None);
    assert_eq!(target("/dQw4w9WgXcQ/123"), None);
    assert_eq!(target("/dQw4w9WgXcQ/x"), None);
    assert_eq!(target("/dQw4w9WgXcQ/1/a/b"), None);
    assert_eq!(target("dQw4w9WgXcQ/1"), None);
  }

  #[test]
  fn test_extract_video_id() {
    let id = |s: &str| extract_video_id(s).map(|id| id.0);

    assert_eq!(id("dQw4w9WgXcQ"), Some("dQw4w9WgXcQ".into()));
    assert_eq!(id("  dQw4w9WgXcQ\n"), Some("dQw4w9WgXcQ".into()));
    assert_eq!(
      id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42"),
      Some("dQw4w9WgXcQ".into())
    );
    assert_eq!(id("https://youtu.be/dQw4w9WgXcQ"), Some("dQw4w9WgXcQ".into()));
    assert_eq!(
      id("look at https://youtube.com/shorts/dQw4w9WgXcQ?feature=share"),
      Some("dQw4w9WgXcQ".into())
    );
    assert_eq!(id("hello there"), None);
    assert_eq!(id("https://youtu.be/short"), None);
    assert_eq!(id("https://youtu.be/dQw4w9WgXcQxyz"), None);
  }
}
