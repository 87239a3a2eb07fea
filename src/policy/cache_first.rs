//! Cache-first retrieval for precached app-shell assets.

use color_eyre::Result;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::{FetchPolicy, PolicyContext};
use crate::http::{Request, Response};

/// Serve from cache without revalidation; fall back to the network.
///
/// 1. Look in the static generation, then the dynamic one
/// 2. On a hit, return it immediately
/// 3. On a miss, fetch; successful responses are written to the dynamic
///    generation (the static one only changes with a new deploy)
/// 4. If the fetch fails, answer with the offline response
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFirst;

impl CacheFirst {
  async fn run(&self, ctx: &PolicyContext, request: &Request) -> Result<Response> {
    let key = request.cache_key();

    for handle in [&ctx.static_cache, &ctx.dynamic_cache] {
      if let Some(entry) = ctx.lookup(handle, &key).await {
        debug!(url = %key.url, generation = handle.name(), "Cache hit");
        return Ok(entry.response);
      }
    }

    match ctx.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          ctx.store_dynamic(&key, &response).await;
        }
        Ok(response)
      }
      Err(e) => {
        warn!(url = %key.url, error = %e, "Cache first strategy failed");
        Ok(Response::offline())
      }
    }
  }
}

impl FetchPolicy for CacheFirst {
  fn name(&self) -> &'static str {
    "cache-first"
  }

  fn fetch_with_policy<'a>(
    &'a self,
    ctx: &'a PolicyContext,
    request: &'a Request,
  ) -> BoxFuture<'a, Result<Response>> {
    Box::pin(self.run(ctx, request))
  }
}
