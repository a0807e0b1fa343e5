use async_trait::async_trait;
use tracing::debug;

use crate::{route::VideoId, Error, Result};

use super::{
  classify_unavailable, finish, Resolver, StreamDescriptor, StreamKind,
};

// in-process extraction through rustube's fetcher and descrambler.
pub struct Rustube;

#[async_trait]
impl Resolver for Rustube {
  async fn resolve(&self, video_id: &VideoId) -> Result<Vec<StreamDescriptor>> {
    use rustube::{Id, VideoFetcher};

    let to_error = |err: rustube::Error| classify(video_id, err);

    let id = Id::from_str(video_id.as_str()).map_err(to_error)?.as_owned();
    let video = VideoFetcher::from_id(id)
      .map_err(to_error)?
      .fetch()
      .await
      .map_err(to_error)?
      .descramble()
      .map_err(to_error)?;

    let streams = video
      .streams()
      .iter()
      .map(|stream| {
        let kind = if stream.includes_video_track {
          StreamKind::Video
        } else {
          StreamKind::Audio
        };

        StreamDescriptor {
          index: 0,
          kind,
          mime_type: format!(
            "{}/{}",
            stream.mime.type_(),
            stream.mime.subtype()
          ),
          resolution: stream.height.map(|h| format!("{h}p")),
          audio_bitrate: None,
          bitrate: stream.bitrate,
          url: stream.signature_cipher.url.to_string(),
        }
      })
      .collect::<Vec<_>>();

    debug!(%video_id, count = streams.len(), "resolved streams with rustube");
    finish(video_id, streams)
  }
}

fn classify(video_id: &VideoId, err: rustube::Error) -> Error {
  match err {
    rustube::Error::VideoUnavailable(status) => {
      let detail = format!("{status:?}");
      match classify_unavailable(&detail) {
        Some(reason) => Error::Unresolvable {
          video_id: video_id.clone(),
          reason,
        },
        None => Error::internal("ExtractionError", detail),
      }
    }
    err => Error::internal("ExtractionError", err),
  }
}

#[cfg(test)]
mod test {
  use serde_json::json;

  use super::*;
  use crate::resolver::ResolveFailure;

  fn unavailable(status: &str, reason: &str) -> rustube::Error {
    let status = json!({
      "status": status,
      "reason": reason,
      "messages": [reason],
      "playableInEmbed": false,
      "contextParams": "",
    });
    rustube::Error::VideoUnavailable(serde_json::from_value(status).unwrap())
  }

  fn id() -> VideoId {
    VideoId::parse("dQw4w9WgXcQ").unwrap()
  }

  #[test]
  fn test_unavailable_status_is_classified() {
    let cases = [
      ("LOGIN_REQUIRED", "This video is private", ResolveFailure::Private),
      ("ERROR", "Video unavailable", ResolveFailure::Unavailable),
      (
        "UNPLAYABLE",
        "The uploader has not made this video available in your country",
        ResolveFailure::RegionBlocked,
      ),
    ];

    for (status, reason, expected) in cases {
      match classify(&id(), unavailable(status, reason)) {
        Error::Unresolvable { video_id, reason } => {
          assert_eq!(video_id, id());
          assert_eq!(reason, expected);
        }
        other => panic!("{status}: unexpected {other:?}"),
      }
    }
  }

  #[test]
  fn test_bot_check_is_internal() {
    let err =
      unavailable("LOGIN_REQUIRED", "Sign in to confirm you're not a bot");

    assert!(matches!(
      classify(&id(), err),
      Error::Internal {
        kind: "ExtractionError",
        ..
      }
    ));
  }

  #[test]
  fn test_other_errors_are_internal() {
    let err = rustube::Error::Fatal("player js changed".into());

    match classify(&id(), err) {
      Error::Internal { kind, message } => {
        assert_eq!(kind, "ExtractionError");
        assert!(message.contains("player js changed"), "{message}");
      }
      other => panic!("unexpected {other:?}"),
    }
  }
}
