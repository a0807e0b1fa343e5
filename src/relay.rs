use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
  body::{boxed, Empty, StreamBody},
  extract::State,
  http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
  response::Response,
  routing::get,
  Router,
};
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use tokio::sync::Semaphore;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, info, warn};

use crate::{
  config::Config,
  resolver::{ResolverRef, StreamDescriptor},
  route::RelayTarget,
  util::ByteStream,
  Error, Result,
};

pub const CHUNK_SIZE: usize = 4096;
// how much of an upstream error body is echoed back to the client
pub const SNIPPET_LIMIT: usize = 4096;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
  AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct RelayRequest {
  pub target: RelayTarget,
  // forwarded verbatim so that clients can resume downloads
  pub range: Option<HeaderValue>,
  // false for HEAD
  pub wants_body: bool,
}

pub struct RelayEngine {
  resolver: ResolverRef,
  client: reqwest::Client,
  permits: Arc<Semaphore>,
  // bounds the wait for the response head and every gap between body chunks
  upstream_timeout: Duration,
}

impl RelayEngine {
  pub fn new(resolver: ResolverRef, config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

    Ok(Self {
      resolver,
      client,
      permits: Arc::new(Semaphore::new(config.concurrency)),
      upstream_timeout: config.upstream_timeout,
    })
  }

  /// Resolves the requested stream and relays the upstream response.
  ///
  /// Exactly one response is produced per request. Every early return drops
  /// the upstream response, which closes its connection.
  pub async fn relay(&self, request: RelayRequest) -> Result<Response> {
    let RelayRequest {
      target,
      range,
      wants_body,
    } = request;

    // held until the body is fully sent or the client goes away
    let permit = self
      .permits
      .clone()
      .acquire_owned()
      .await
      .map_err(|e| Error::internal("SemaphoreClosed", e))?;

    let streams = self.resolver.resolve(&target.video_id).await?;
    let count = streams.len();
    let stream = streams
      .into_iter()
      .nth(target.stream_index)
      .ok_or_else(|| Error::IndexOutOfRange {
        video_id: target.video_id.clone(),
        index: target.stream_index,
        count,
      })?;

    let upstream = self.fetch(&stream.url, range).await?;
    let status = upstream.status();

    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
      warn!(video_id = %target.video_id, %status, "upstream refused stream");
      let snippet = read_snippet(upstream, self.upstream_timeout).await;
      return Err(Error::UpstreamNonSuccess {
        video_id: target.video_id,
        status,
        snippet,
      });
    }

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
      relay_headers(upstream.headers(), headers, &stream)?;
    }

    if !wants_body {
      drop(upstream);
      return Ok(builder.body(boxed(Empty::new()))?);
    }

    info!(
      video_id = %target.video_id,
      index = target.stream_index,
      %status,
      "relaying {}",
      stream.mime_type
    );

    let video_id = target.video_id;
    let upstream = idle_timeout(upstream, self.upstream_timeout);
    let body = ByteStream::new(upstream)
      .chunk_size(CHUNK_SIZE)
      .map(move |chunk| {
        let _permit = &permit;
        if let Err(err) = &chunk {
          warn!(%video_id, "upstream body failed mid-stream: {err}");
        }
        chunk
      });

    Ok(builder.body(boxed(StreamBody::new(body)))?)
  }

  async fn fetch(
    &self,
    url: &str,
    range: Option<HeaderValue>,
  ) -> Result<reqwest::Response> {
    let mut request = self.client.get(url);
    if let Some(range) = range {
      request = request.header(header::RANGE, range);
    }

    let resp = tokio::time::timeout(self.upstream_timeout, request.send())
      .await
      .map_err(|_| Error::UpstreamTimeout(self.upstream_timeout))??;

    Ok(resp)
  }
}

// copies the upstream headers, replacing the content headers with the ones
// derived from the stream descriptor.
fn relay_headers(
  upstream: &HeaderMap,
  out: &mut HeaderMap,
  stream: &StreamDescriptor,
) -> Result<()> {
  for (name, value) in upstream {
    let skipped = matches!(
      name.as_str(),
      "content-type"
        | "content-disposition"
        | "connection"
        | "keep-alive"
        | "transfer-encoding"
    );
    if !skipped {
      out.append(name.clone(), value.clone());
    }
  }

  out.insert(
    header::CONTENT_TYPE,
    HeaderValue::from_str(&stream.mime_type)?,
  );
  out.insert(
    header::CONTENT_DISPOSITION,
    HeaderValue::from_str(&format!(
      "attachment;filename={}",
      stream.filename()
    ))?,
  );

  Ok(())
}

// yields the upstream body, ending it with a `TimedOut` error once upstream
// stalls for longer than `idle`. dropping the stream closes the connection.
fn idle_timeout(
  upstream: reqwest::Response,
  idle: Duration,
) -> BoxStream<'static, io::Result<Bytes>> {
  let chunks = upstream.bytes_stream().boxed();

  futures::stream::unfold(Some(chunks), move |chunks| async move {
    // None once the idle timer fired
    let mut chunks = match chunks {
      Some(chunks) => chunks,
      None => return None,
    };
    match tokio::time::timeout(idle, chunks.next()).await {
      Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(chunks))),
      Ok(Some(Err(err))) => {
        Some((Err(io::Error::new(io::ErrorKind::Other, err)), Some(chunks)))
      }
      Ok(None) => None,
      Err(_) => {
        let err = io::Error::new(
          io::ErrorKind::TimedOut,
          format!("upstream sent nothing for {idle:?}"),
        );
        Some((Err(err), None))
      }
    }
  })
  .boxed()
}

async fn read_snippet(upstream: reqwest::Response, idle: Duration) -> String {
  let mut body =
    ByteStream::new(idle_timeout(upstream, idle)).limit_bytes(SNIPPET_LIMIT);

  let mut snippet = Vec::new();
  while let Some(Ok(chunk)) = body.next().await {
    snippet.extend_from_slice(&chunk);
  }

  String::from_utf8_lossy(&snippet).into_owned()
}

pub fn router(engine: Arc<RelayEngine>) -> Router {
  Router::new()
    .route("/health", get(health))
    .fallback(relay)
    .with_state(engine)
}

async fn relay(
  State(engine): State<Arc<RelayEngine>>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
) -> Result<Response> {
  let target = RelayTarget::parse(uri.path()).ok_or(Error::RouteInvalid)?;

  let wants_body = match method {
    Method::GET => true,
    Method::HEAD => false,
    other => return Err(Error::MethodNotAllowed(other)),
  };

  debug!(path = uri.path(), %method, "relay request");

  let request = RelayRequest {
    target,
    range: headers.get(header::RANGE).cloned(),
    wants_body,
  };

  engine.relay(request).await
}

async fn health() -> String {
  "ok".to_owned()
}

pub async fn serve(
  engine: Arc<RelayEngine>,
  addr: SocketAddr,
  subsys: SubsystemHandle,
) -> anyhow::Result<()> {
  let server =
    axum::Server::try_bind(&addr)?.serve(router(engine).into_make_service());

  info!("relay listening on http://{}", server.local_addr());

  server
    .with_graceful_shutdown(subsys.on_shutdown_requested())
    .await?;

  info!("relay stopped");
  Ok(())
}
