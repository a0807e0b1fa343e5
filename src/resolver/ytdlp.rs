use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::{process::Command, sync::Semaphore};
use tracing::{debug, info};

use crate::{route::VideoId, Error, Result};

use super::{
  classify_unavailable, finish, Resolver, StreamDescriptor, StreamKind,
};

// run yt-dlp command line to get the playback urls of every format.
// requires yt-dlp executable to be in PATH.
pub struct YtDlp {
  proxy: Option<String>,
  // limits the number of concurrent yt-dlp processes
  permits: Semaphore,
}

impl YtDlp {
  pub fn new(proxy: Option<String>, concurrency: usize) -> Self {
    Self {
      proxy,
      permits: Semaphore::new(concurrency.max(1)),
    }
  }
}

#[derive(Deserialize, Debug)]
struct YtdlpOutput {
  formats: Vec<Format>,
}

#[derive(Deserialize, Debug)]
struct Format {
  url: String,
  ext: String,
  #[serde(default)]
  protocol: Option<String>,
  #[serde(default)]
  vcodec: Option<String>,
  #[serde(default)]
  acodec: Option<String>,
  #[serde(default)]
  height: Option<u32>,
  #[serde(default)]
  fps: Option<f64>,
  #[serde(default)]
  abr: Option<f64>,
  #[serde(default)]
  tbr: Option<f64>,
}

#[async_trait]
impl Resolver for YtDlp {
  async fn resolve(&self, video_id: &VideoId) -> Result<Vec<StreamDescriptor>> {
    let mut cmd = Command::new("yt-dlp");
    cmd.arg("-j").arg("--no-warnings");

    if let Some(proxy) = &self.proxy {
      // used to remove cred info from proxy url before printing
      static AUTH_REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"//[^:]+(:[^@]+)@").unwrap());
      info!("using proxy: {}", AUTH_REGEX.replace(proxy, "//<REDACTED>@"));
      cmd.arg("--proxy").arg(proxy);
    }

    cmd.arg(video_id.watch_url());

    let output = {
      let _guard = self
        .permits
        .acquire()
        .await
        .map_err(|e| Error::internal("SemaphoreClosed", e))?;
      cmd.output().await?
    };

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(classify_stderr(video_id, &stderr));
    }

    let streams = parse_formats(&output.stdout)?;
    debug!(%video_id, count = streams.len(), "resolved streams with yt-dlp");
    finish(video_id, streams)
  }
}

fn parse_formats(stdout: &[u8]) -> Result<Vec<StreamDescriptor>> {
  let output: YtdlpOutput = serde_json::from_slice(stdout)?;

  let streams = output
    .formats
    .into_iter()
    // manifests and storyboards can't be relayed as a single file
    .filter(|f| matches!(f.protocol.as_deref(), None | Some("https" | "http")))
    .filter_map(|f| {
      let has_video = has_codec(&f.vcodec);
      let has_audio = has_codec(&f.acodec);

      let kind = match (has_video, has_audio) {
        (true, _) => StreamKind::Video,
        (false, true) => StreamKind::Audio,
        (false, false) => return None,
      };

      let mime_type = match (kind, f.ext.as_str()) {
        (StreamKind::Audio, "m4a") => "audio/mp4".to_string(),
        (StreamKind::Audio, ext) => format!("audio/{ext}"),
        (StreamKind::Video, ext) => format!("video/{ext}"),
      };

      let resolution = f.height.map(|h| match f.fps {
        Some(fps) if fps > 30.0 => format!("{h}p{}", fps.round() as u32),
        _ => format!("{h}p"),
      });

      Some(StreamDescriptor {
        index: 0,
        kind,
        mime_type,
        resolution,
        audio_bitrate: f.abr.map(|abr| format!("{}kbps", abr.round() as u64)),
        bitrate: f.tbr.map(|tbr| (tbr * 1000.0) as u64),
        url: f.url,
      })
    })
    .collect();

  Ok(streams)
}

fn has_codec(codec: &Option<String>) -> bool {
  matches!(codec.as_deref(), Some(c) if c != "none")
}

fn classify_stderr(video_id: &VideoId, stderr: &str) -> Error {
  let detail = stderr
    .lines()
    .find(|line| line.contains("ERROR:"))
    .unwrap_or(stderr)
    .trim();

  match classify_unavailable(detail) {
    Some(reason) => Error::Unresolvable {
      video_id: video_id.clone(),
      reason,
    },
    None => Error::internal("ExtractionError", detail),
  }
}

#[cfg(test)]
mod test {
  use crate::resolver::ResolveFailure;

  use super::*;

  const SAMPLE: &str = r#"{
    "id": "dQw4w9WgXcQ",
    "formats": [
      {"format_id": "sb0", "ext": "mhtml", "protocol": "mhtml",
       "vcodec": "none", "acodec": "none", "url": "https://sb"},
      {"format_id": "140", "ext": "m4a", "protocol": "https",
       "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5,
       "tbr": 129.5, "url": "https://audio"},
      {"format_id": "22", "ext": "mp4", "protocol": "https",
       "vcodec": "avc1.64001F", "acodec": "mp4a.40.2", "height": 720,
       "fps": 30, "tbr": 1500.0, "url": "https://video"},
      {"format_id": "299", "ext": "mp4", "protocol": "https",
       "vcodec": "avc1.64002a", "acodec": "none", "height": 1080,
       "fps": 60, "url": "https://video60"},
      {"format_id": "hls", "ext": "mp4", "protocol": "m3u8_native",
       "vcodec": "avc1", "acodec": "mp4a", "height": 360,
       "url": "https://manifest"}
    ]
  }"#;

  #[test]
  fn test_parse_formats() {
    let streams = parse_formats(SAMPLE.as_bytes()).unwrap();
    assert_eq!(streams.len(), 3);

    assert_eq!(streams[0].kind, StreamKind::Audio);
    assert_eq!(streams[0].mime_type, "audio/mp4");
    assert_eq!(streams[0].audio_bitrate.as_deref(), Some("130kbps"));
    assert_eq!(streams[0].url, "https://audio");

    assert_eq!(streams[1].kind, StreamKind::Video);
    assert_eq!(streams[1].mime_type, "video/mp4");
    assert_eq!(streams[1].resolution.as_deref(), Some("720p"));
    assert_eq!(streams[1].bitrate, Some(1_500_000));

    assert_eq!(streams[2].resolution.as_deref(), Some("1080p60"));
  }

  #[test]
  fn test_parse_garbage() {
    assert!(matches!(
      parse_formats(b"not json"),
      Err(Error::Internal { .. })
    ));
  }

  #[test]
  fn test_classify_stderr() {
    let id = VideoId::parse("dQw4w9WgXcQ").unwrap();
    let reason = |stderr: &str| match classify_stderr(&id, stderr) {
      Error::Unresolvable { reason, .. } => Some(reason),
      _ => None,
    };

    assert_eq!(
      reason(
        "ERROR: [youtube] dQw4w9WgXcQ: Private video. \
         Sign in if you've been granted access to this video"
      ),
      Some(ResolveFailure::Private)
    );
    assert_eq!(
      reason(
        "WARNING: x\nERROR: [youtube] dQw4w9WgXcQ: Video unavailable. \
         The uploader has not made this video available in your country"
      ),
      Some(ResolveFailure::RegionBlocked)
    );
    assert_eq!(
      reason("ERROR: [youtube] dQw4w9WgXcQ: Video unavailable"),
      Some(ResolveFailure::Unavailable)
    );
    assert_eq!(reason("ERROR: Unable to download webpage: timed out"), None);
  }

  #[test]
  fn test_classify_stderr_challenges_are_internal() {
    let id = VideoId::parse("dQw4w9WgXcQ").unwrap();
    let stderrs = [
      "ERROR: [youtube] dQw4w9WgXcQ: Sign in to confirm you're not a bot. \
       This helps protect our community.",
      "ERROR: [youtube] dQw4w9WgXcQ: Sign in to confirm your age. \
       This video may be inappropriate for some users.",
      "ERROR: [youtube] dQw4w9WgXcQ: Unable to extract geolocation data",
    ];

    for stderr in stderrs {
      match classify_stderr(&id, stderr) {
        Error::Internal { kind, message } => {
          assert_eq!(kind, "ExtractionError");
          assert!(message.starts_with("ERROR: [youtube]"), "{message}");
        }
        other => panic!("{stderr}: unexpected {other:?}"),
      }
    }
  }
}
