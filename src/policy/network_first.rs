//! Network-first retrieval for dynamic content.

use color_eyre::Result;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::{FetchPolicy, PolicyContext};
use crate::http::{Request, Response};

/// Prefer the live server; the dynamic generation is only a degradation path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkFirst;

impl NetworkFirst {
  async fn run(&self, ctx: &PolicyContext, request: &Request) -> Result<Response> {
    let key = request.cache_key();

    match ctx.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          ctx.store_dynamic(&key, &response).await;
        }
        Ok(response)
      }
      Err(e) => {
        warn!(url = %key.url, error = %e, "Network first strategy failed");
        match ctx.lookup(&ctx.dynamic_cache, &key).await {
          Some(entry) => {
            debug!(url = %key.url, cached_at = %entry.cached_at, "Serving cached fallback");
            Ok(entry.response)
          }
          None => Ok(Response::offline()),
        }
      }
    }
  }
}

impl FetchPolicy for NetworkFirst {
  fn name(&self) -> &'static str {
    "network-first"
  }

  fn fetch_with_policy<'a>(
    &'a self,
    ctx: &'a PolicyContext,
    request: &'a Request,
  ) -> BoxFuture<'a, Result<Response>> {
    Box::pin(self.run(ctx, request))
  }
}
