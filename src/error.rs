use std::{fmt::Display, time::Duration};

use axum::{
  http::{Method, StatusCode},
  response::{IntoResponse, Response},
};
use tracing::{error, info};

use crate::{resolver::ResolveFailure, route::VideoId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub const USAGE: &str = "Bad url formatting, \"/<video-id>/<stream-id>\"";

const UNEXPECTED_PREAMBLE: &str = "The server experienced an unexpected \
  error while processing your request.\nPlease report this on our GitHub \
  issues page and try again later.";

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("{}", USAGE)]
  RouteInvalid,
  #[error("Method {0} is not supported, use GET or HEAD")]
  MethodNotAllowed(Method),
  #[error("Video {video_id} {reason}")]
  Unresolvable {
    video_id: VideoId,
    reason: ResolveFailure,
  },
  #[error(
    "Stream {index} not found for video {video_id}, \
     only {count} streams available"
  )]
  IndexOutOfRange {
    video_id: VideoId,
    index: usize,
    count: usize,
  },
  #[error(
    "The video server rejected the request for video {video_id}.\n\
     Upstream status: {status}\n{snippet}"
  )]
  UpstreamNonSuccess {
    video_id: VideoId,
    status: StatusCode,
    snippet: String,
  },
  #[error("The video server did not answer within {}s", .0.as_secs())]
  UpstreamTimeout(Duration),
  #[error("Chat transport rejected the request: {0}")]
  TransportRejected(String),
  #[error("{kind}: {message}")]
  Internal { kind: &'static str, message: String },
}

impl Error {
  pub fn internal(kind: &'static str, err: impl Display) -> Self {
    Error::Internal {
      kind,
      message: err.to_string(),
    }
  }

  pub fn status_code(&self) -> StatusCode {
    match self {
      Error::RouteInvalid => StatusCode::BAD_REQUEST,
      Error::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
      Error::Unresolvable { reason, .. } => match reason {
        ResolveFailure::Private => StatusCode::FORBIDDEN,
        ResolveFailure::RegionBlocked => StatusCode::BAD_GATEWAY,
        ResolveFailure::Unavailable | ResolveFailure::NoStreams => {
          StatusCode::NOT_FOUND
        }
      },
      Error::IndexOutOfRange { .. } => StatusCode::NOT_FOUND,
      Error::UpstreamNonSuccess { .. }
      | Error::UpstreamTimeout(_)
      | Error::TransportRejected(_) => StatusCode::BAD_GATEWAY,
      Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = self.status_code();

    let body = match &self {
      Error::Internal { .. } => {
        error!("unexpected error while relaying: {self}");
        format!("{UNEXPECTED_PREAMBLE}\n{self}")
      }
      _ => {
        info!(%status, "request failed: {self}");
        self.to_string()
      }
    };

    (status, body).into_response()
  }
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    Error::internal("RequestError", err)
  }
}

impl From<std::io::Error> for Error {
  fn from(err: std::io::Error) -> Self {
    Error::internal("IOError", err)
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Error::internal("JSONError", err)
  }
}

impl From<http::Error> for Error {
  fn from(err: http::Error) -> Self {
    Error::internal("HTTPError", err)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(err: http::header::InvalidHeaderValue) -> Self {
    Error::internal("InvalidHeaderValue", err)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn id() -> VideoId {
    VideoId::parse("dQw4w9WgXcQ").unwrap()
  }

  #[test]
  fn test_resolve_failure_status() {
    let status = |reason| {
      Error::Unresolvable {
        video_id: id(),
        reason,
      }
      .status_code()
    };

    assert_eq!(status(ResolveFailure::Private), StatusCode::FORBIDDEN);
    assert_eq!(status(ResolveFailure::RegionBlocked), StatusCode::BAD_GATEWAY);
    assert_eq!(status(ResolveFailure::Unavailable), StatusCode::NOT_FOUND);
    assert_eq!(status(ResolveFailure::NoStreams), StatusCode::NOT_FOUND);
  }

  #[test]
  fn test_messages() {
    assert_eq!(
      Error::RouteInvalid.to_string(),
      "Bad url formatting, \"/<video-id>/<stream-id>\""
    );

    let err = Error::IndexOutOfRange {
      video_id: id(),
      index: 9,
      count: 3,
    };
    assert!(err.to_string().ends_with("only 3 streams available"));

    let err = Error::Unresolvable {
      video_id: id(),
      reason: ResolveFailure::Private,
    };
    assert_eq!(err.to_string(), "Video dQw4w9WgXcQ is private");
  }

  #[test]
  fn test_internal_message_names_kind() {
    let err = Error::internal("RequestError", "connection reset");
    assert_eq!(err.to_string(), "RequestError: connection reset");
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
  }
}
