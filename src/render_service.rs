//! Render orchestration
//!
//! A render walks a fixed path: budget check, page acquisition, page setup,
//! navigation, the idle wait, extraction and classification. Every browser
//! failure is absorbed here; callers only see a [`RenderOutcome`] or `None`.

use crate::cache::ContentCache;
use crate::page::{NavigationOptions, PageLease, PageSource, WaitUntil};
use crate::quiescence::wait_for_quiescence;
use crate::utils::{extract_special_headers, RequestInterceptor};
use crate::{BrowserPool, Config, Metrics, RenderError, RenderRequest, RenderResult, TransformPool};
use futures::future::join_all;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Terminal state a render finished in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Freshly rendered with a cacheable status and stored
    Cached(RenderResult),
    /// No page was available; the last stored entry was served instead
    FallbackServed(RenderResult),
    /// Rendered with a non-cacheable status; any stored entry was evicted
    PassThrough(RenderResult),
}

impl RenderOutcome {
    pub fn result(&self) -> &RenderResult {
        match self {
            RenderOutcome::Cached(result)
            | RenderOutcome::FallbackServed(result)
            | RenderOutcome::PassThrough(result) => result,
        }
    }

    pub fn into_result(self) -> RenderResult {
        match self {
            RenderOutcome::Cached(result)
            | RenderOutcome::FallbackServed(result)
            | RenderOutcome::PassThrough(result) => result,
        }
    }
}

/// Time left for one render: `timeout - gap - elapsed`
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Instant,
    allowance: Option<Duration>,
}

impl TimeBudget {
    pub fn start(timeout: Duration, gap: Duration) -> Self {
        Self {
            started: Instant::now(),
            allowance: timeout.checked_sub(gap),
        }
    }

    /// `None` once the budget is spent.
    pub fn remaining(&self) -> Option<Duration> {
        self.allowance?
            .checked_sub(self.started.elapsed())
            .filter(|left| !left.is_zero())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Clone)]
pub struct RenderService {
    config: Config,
    pool: Arc<dyn PageSource>,
    cache: Arc<ContentCache>,
    transforms: Option<Arc<TransformPool>>,
    metrics: Arc<Metrics>,
    interceptor: Arc<RequestInterceptor>,
    not_found: Regex,
    render_limiter: Arc<Semaphore>,
}

impl RenderService {
    pub fn new(
        config: Config,
        pool: Arc<dyn PageSource>,
        cache: Arc<ContentCache>,
        transforms: Option<Arc<TransformPool>>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, RenderError> {
        config.validate()?;
        let not_found = Regex::new(&config.not_found_marker)?;
        let render_limiter = Arc::new(Semaphore::new(config.max_concurrent_renders));

        Ok(Self {
            config,
            pool,
            cache,
            transforms,
            metrics,
            interceptor: Arc::new(RequestInterceptor::new()),
            not_found,
            render_limiter,
        })
    }

    /// Launch the browser pool and worker pool described by `config`.
    pub async fn from_config(config: Config, metrics: Arc<Metrics>) -> Result<Self, RenderError> {
        config.validate()?;
        let pool = BrowserPool::new(config.clone(), metrics.clone()).await?;
        let transforms = TransformPool::from_config(&config)?;
        let cache = ContentCache::new(config.compress_cache_entries);

        Self::new(
            config,
            Arc::new(pool),
            Arc::new(cache),
            Some(Arc::new(transforms)),
            metrics,
        )
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn render(&self, request: RenderRequest) -> Option<RenderOutcome> {
        let budget = TimeBudget::start(self.config.render_timeout, self.config.gap_duration);
        let outcome = self.run_render(&request, budget).await;

        self.metrics.record_render(budget.elapsed());
        match &outcome {
            Some(outcome) => info!(
                "Render {} for {} finished with status {} in {:?}",
                request.id,
                request.url,
                outcome.result().status,
                budget.elapsed()
            ),
            None => {
                self.metrics.record_no_result();
                info!("Render {} for {} produced no result", request.id, request.url);
            }
        }
        outcome
    }

    async fn run_render(&self, request: &RenderRequest, budget: TimeBudget) -> Option<RenderOutcome> {
        if budget.remaining().is_none() {
            debug!("Render {} has no budget left", request.id);
            return None;
        }

        let Some(lease) = self.pool.acquire_page().await else {
            debug!("No page available for {}", request.url);
            return self.fallback(request);
        };

        let Some(left) = budget.remaining() else {
            debug!("Budget for {} ran out while acquiring a page", request.url);
            if let Err(e) = lease.release().await {
                warn!("Releasing page for {} failed: {}", request.url, e);
            }
            return self.fallback(request);
        };

        let (html, status, close_failed) = self.drive_page(lease, request, left).await?;
        let status = self.classify_status(&html, status);

        let outcome = if self.config.is_cacheable(status) {
            match self.cache.set(&request.url, html, status, true) {
                Ok(result) => {
                    self.metrics.record_cached();
                    if !close_failed {
                        self.schedule_optimization(request, status);
                    }
                    RenderOutcome::Cached(result)
                }
                Err(e) => {
                    error!("Caching {} failed: {}", request.url, e);
                    return None;
                }
            }
        } else {
            let evicted = self.cache.remove(&request.url).is_some();
            self.metrics.record_pass_through(evicted);
            RenderOutcome::PassThrough(RenderResult {
                html,
                status,
                served_from_cache: false,
            })
        };

        if close_failed {
            return None;
        }
        Some(outcome)
    }

    /// Configure, navigate, wait and extract. Returns the markup, the
    /// navigation status and whether closing the page failed.
    async fn drive_page(
        &self,
        mut lease: PageLease,
        request: &RenderRequest,
        left: Duration,
    ) -> Option<(String, Option<u16>, bool)> {
        let nav_timeout = left.min(self.config.navigation_ceiling());

        let extracted = match self.navigate_and_extract(&mut lease, request, nav_timeout).await {
            Ok(extracted) => extracted,
            Err(e) => {
                warn!("Render of {} aborted: {}", request.url, e);
                if let Err(e) = lease.release().await {
                    warn!("Releasing page for {} failed: {}", request.url, e);
                }
                return None;
            }
        };

        let close_failed = match lease.release().await {
            Ok(()) => false,
            Err(e) => {
                error!("Closing page for {} failed: {}", request.url, e);
                true
            }
        };

        let (html, status) = extracted;
        Some((html, status, close_failed))
    }

    async fn navigate_and_extract(
        &self,
        lease: &mut PageLease,
        request: &RenderRequest,
        nav_timeout: Duration,
    ) -> Result<(String, Option<u16>), RenderError> {
        let page = lease.page()?;

        page.set_request_interception(self.interceptor.clone()).await?;
        page.set_extra_http_headers(extract_special_headers(&request.url))
            .await?;

        let nav_start = Instant::now();
        let options = NavigationOptions {
            wait_until: WaitUntil::NetworkIdle,
            timeout: nav_timeout,
        };
        let status = match page.goto(&request.url, options).await {
            Ok(status) => status,
            Err(e) if e.is_timeout() => {
                debug!("Navigation to {} timed out, extracting anyway", request.url);
                self.metrics.record_navigation_timeout();
                None
            }
            Err(e) => return Err(e),
        };

        // only activity after navigation may extend the idle wait
        let mut events = page.network_events();
        if let Some(rest) = nav_timeout.checked_sub(nav_start.elapsed()) {
            if !rest.is_zero() {
                let outcome =
                    wait_for_quiescence(&mut events, self.config.idle_settings(), rest).await;
                debug!("Idle wait for {} ended: {:?}", request.url, outcome);
            }
        }

        let html = page.content().await?;
        Ok((html, status))
    }

    fn classify_status(&self, html: &str, status: Option<u16>) -> u16 {
        if self.not_found.is_match(html) {
            404
        } else {
            status.unwrap_or(200)
        }
    }

    fn fallback(&self, request: &RenderRequest) -> Option<RenderOutcome> {
        if request.is_first_request {
            return None;
        }

        let entry = self.cache.achieve(&request.url)?;
        match entry.to_result(true) {
            Ok(result) => {
                self.metrics.record_fallback();
                info!("Serving stored render of {} ({})", request.url, entry.stored_at);
                Some(RenderOutcome::FallbackServed(result))
            }
            Err(e) => {
                error!("Stored render of {} is unreadable: {}", request.url, e);
                None
            }
        }
    }

    fn schedule_optimization(&self, request: &RenderRequest, status: u16) {
        if !self.config.deferred_optimization {
            return;
        }
        let Some(transforms) = self.transforms.clone() else {
            return;
        };

        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let url = request.url.clone();

        tokio::spawn(async move {
            let result = async {
                let entry = cache
                    .achieve(&url)
                    .ok_or_else(|| RenderError::Transform("entry vanished".to_string()))?;
                let compressed = transforms.compress(entry.body).await?;
                let optimized = transforms.optimize(compressed, true).await?;
                cache.replace_if(&url, entry.revision, optimized, status, false)
            }
            .await;

            match result {
                Ok(Some(_)) => debug!("Stored optimized render of {}", url),
                Ok(None) => debug!("Render of {} changed while optimizing, result dropped", url),
                Err(e) => {
                    metrics.record_transform_failure();
                    warn!("Optimizing {} failed: {}", url, e);
                }
            }
        });
    }

    /// Render every URL, at most `max_concurrent_renders` at a time.
    pub async fn render_urls(&self, urls: Vec<String>) -> Vec<(String, Option<RenderOutcome>)> {
        let tasks = urls.into_iter().map(|url| {
            let service = self.clone();
            async move {
                let _permit = service.render_limiter.clone().acquire_owned().await.ok()?;
                let outcome = service.render(RenderRequest::new(url.clone(), false)).await;
                Some((url, outcome))
            }
        });

        join_all(tasks).await.into_iter().flatten().collect()
    }

    pub async fn shutdown(&self) {
        info!("Shutting down render service...");
        self.pool.shutdown().await;
        if let Some(transforms) = self.transforms.clone() {
            if tokio::task::spawn_blocking(move || transforms.shutdown())
                .await
                .is_err()
            {
                warn!("Transform pool shutdown task panicked");
            }
        }
        info!("Render service shutdown complete");
    }
}
