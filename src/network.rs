//! Network seam used by the worker for live fetches.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::{HeaderName, HeaderValue};

use crate::http::{Request, Response};

/// Something that can perform a request against the live server.
///
/// An `Err` means the fetch itself failed (DNS, connection reset, ...).
/// Non-2xx statuses are still `Ok` responses.
pub trait Network: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// Network implementation backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("shellcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn send(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      // Headers that do not survive parsing are dropped rather than failing the fetch
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        builder = builder.header(name, value);
      }
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}

impl Network for HttpNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(self.send(request))
  }
}
