//! Browser pool management for render pages
//!
//! This module owns the Chrome processes renders draw their pages from. In
//! the default mode a fixed set of long-lived browsers is shared by every
//! render; in isolated-profile mode each lease gets a dedicated browser with
//! a fresh user-data directory that is removed when the lease is released.

use crate::page::{CdpPage, PageLease, PageSource};
use crate::{create_browser_config, Config, Metrics, RenderError};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

type HandlerTask = JoinHandle<Result<(), chromiumoxide::error::CdpError>>;

/// Current status of a browser instance in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Instance is accepting new pages
    Healthy,
    /// Instance is being replaced
    Restarting,
    /// Last restart failed; the next acquisition retries it
    Failed,
}

/// A single long-lived Chrome process
#[derive(Debug)]
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    /// Background task handling Chrome DevTools Protocol communication
    pub handler: HandlerTask,
    /// Bumped on every restart so concurrent acquirers restart at most once
    pub generation: u64,
    pub user_data_dir: PathBuf,
    pub created_at: Instant,
    pub last_used: Instant,
    pub pages_opened: usize,
    pub status: InstanceStatus,
    pub failure_count: usize,
}

impl BrowserInstance {
    fn new(id: usize, generation: u64, browser: Browser, handler: HandlerTask, user_data_dir: PathBuf) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
            generation,
            user_data_dir,
            created_at: Instant::now(),
            last_used: Instant::now(),
            pages_opened: 0,
            status: InstanceStatus::Healthy,
            failure_count: 0,
        }
    }

    pub fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.pages_opened += 1;
    }

    pub fn is_crashed(&self) -> bool {
        self.handler.is_finished() || self.status != InstanceStatus::Healthy
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    async fn shutdown(self) {
        if let Err(e) = self.browser.lock().await.close().await {
            debug!("Browser instance {} close failed: {}", self.id, e);
        }
    }
}

impl Drop for BrowserInstance {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

/// How a restart request for an instance is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartDecision {
    /// Someone else already replaced it; use the current browser
    Reuse,
    /// A relaunch is in progress elsewhere
    Skip,
    Restart,
}

fn restart_decision(
    status: InstanceStatus,
    handler_finished: bool,
    generation: u64,
    seen_generation: u64,
) -> RestartDecision {
    match status {
        InstanceStatus::Restarting => RestartDecision::Skip,
        InstanceStatus::Healthy if generation != seen_generation && !handler_finished => {
            RestartDecision::Reuse
        }
        _ => RestartDecision::Restart,
    }
}

pub struct BrowserPool {
    instances: Arc<Mutex<Vec<BrowserInstance>>>,
    next_instance: Arc<AtomicUsize>,
    page_permits: Arc<Semaphore>,
    profile_stamp: Arc<AtomicU64>,
    clock_origin: Instant,
    config: Config,
    metrics: Arc<Metrics>,
    is_shutting_down: Arc<AtomicBool>,
    health_task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl BrowserPool {
    pub async fn new(config: Config, metrics: Arc<Metrics>) -> Result<Self, RenderError> {
        let pool = Self {
            instances: Arc::new(Mutex::new(Vec::new())),
            next_instance: Arc::new(AtomicUsize::new(0)),
            page_permits: Arc::new(Semaphore::new(config.max_open_pages)),
            profile_stamp: Arc::new(AtomicU64::new(0)),
            clock_origin: Instant::now(),
            config,
            metrics,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            health_task: Arc::new(std::sync::Mutex::new(None)),
        };

        if !pool.config.isolated_profiles {
            pool.initialize_instances().await?;
            pool.start_health_check_task();
        }

        Ok(pool)
    }

    async fn initialize_instances(&self) -> Result<(), RenderError> {
        let mut instances = self.instances.lock().await;

        for i in 0..self.config.browser_pool_size {
            // stagger launches so the processes don't race for the same ports
            if i > 0 {
                sleep(Duration::from_millis(500)).await;
            }

            match self.create_browser_instance(i, 0).await {
                Ok(instance) => {
                    instances.push(instance);
                    info!("Browser instance {} created successfully", i);
                }
                Err(e) => {
                    error!("Failed to create browser instance {}: {}", i, e);
                    return Err(e);
                }
            }
        }

        info!("Browser pool initialized with {} instances", instances.len());
        Ok(())
    }

    async fn launch_browser(&self, user_data_dir: &Path) -> Result<(Browser, HandlerTask), RenderError> {
        tokio::fs::create_dir_all(user_data_dir).await.map_err(|e| {
            RenderError::BrowserLaunchFailed(format!("Failed to create user data dir: {e}"))
        })?;

        let browser_config = create_browser_config(&self.config, user_data_dir)?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RenderError::BrowserLaunchFailed(e.to_string()))?;

        // The handler stream drives all CDP traffic and must be polled continuously
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("Handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        tracing::info!("Handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        Ok((browser, handler_task))
    }

    async fn create_browser_instance(&self, id: usize, generation: u64) -> Result<BrowserInstance, RenderError> {
        let user_data_dir = self
            .config
            .user_data_root
            .join(format!("instance_{}_{}", std::process::id(), id));
        let (browser, handler) = self.launch_browser(&user_data_dir).await?;
        Ok(BrowserInstance::new(id, generation, browser, handler, user_data_dir))
    }

    /// Strictly increasing stamp derived from the pool's monotonic clock.
    fn next_profile_stamp(&self) -> u64 {
        let now = self.clock_origin.elapsed().as_micros() as u64;
        let mut previous = self.profile_stamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(previous + 1);
            match self.profile_stamp.compare_exchange(
                previous,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    fn isolated_profile_dir(&self, stamp: u64) -> PathBuf {
        self.config.user_data_root.join(format!("user_data_{stamp}"))
    }

    pub async fn acquire_page(&self) -> Option<PageLease> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return None;
        }

        let permit = match self.page_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Open page ceiling of {} reached", self.config.max_open_pages);
                return None;
            }
        };

        if self.config.isolated_profiles {
            return self.acquire_isolated(permit).await;
        }

        let instance_count = self.instances.lock().await.len();
        for _ in 0..instance_count {
            let id = self.next_instance.fetch_add(1, Ordering::Relaxed) % instance_count;
            match self.page_from_instance(id).await {
                Ok(page) => {
                    if let Some(instance) = self.instances.lock().await.get_mut(id) {
                        instance.mark_used();
                    }
                    let lease = PageLease::new(Box::new(page))
                        .with_release_hook(move || async move { drop(permit) });
                    return Some(lease);
                }
                Err(e) => warn!("Browser instance {} could not provide a page: {}", id, e),
            }
        }

        error!("No browser instance could provide a page");
        None
    }

    async fn page_from_instance(&self, id: usize) -> Result<CdpPage, RenderError> {
        let (browser, status, crashed, generation) = {
            let instances = self.instances.lock().await;
            let instance = instances.get(id).ok_or(RenderError::BrowserUnavailable)?;
            (
                instance.browser.clone(),
                instance.status,
                instance.is_crashed(),
                instance.generation,
            )
        };

        if status == InstanceStatus::Restarting {
            debug!("Browser instance {} is restarting, skipping it", id);
            return Err(RenderError::BrowserUnavailable);
        }

        let (browser, generation) = if crashed {
            warn!("Browser instance {} is down, restarting", id);
            self.restart_instance(id, generation).await?
        } else {
            (browser, generation)
        };

        match open_page(&browser).await {
            Ok(page) => Ok(page),
            Err(e) => {
                warn!("Opening a page on instance {} failed ({}), restarting", id, e);
                let (browser, _) = self.restart_instance(id, generation).await?;
                open_page(&browser).await
            }
        }
    }

    /// Replace instance `id` unless someone already restarted it past `seen_generation`.
    ///
    /// The pool lock is only held to claim the instance and to swap the new
    /// browser in; the relaunch itself runs unlocked while the instance is
    /// marked [`InstanceStatus::Restarting`] and skipped by acquirers.
    pub async fn restart_instance(
        &self,
        id: usize,
        seen_generation: u64,
    ) -> Result<(Arc<Mutex<Browser>>, u64), RenderError> {
        let (old_browser, generation) = {
            let mut instances = self.instances.lock().await;
            let instance = instances.get_mut(id).ok_or(RenderError::BrowserUnavailable)?;

            match restart_decision(
                instance.status,
                instance.handler.is_finished(),
                instance.generation,
                seen_generation,
            ) {
                RestartDecision::Reuse => {
                    return Ok((instance.browser.clone(), instance.generation));
                }
                RestartDecision::Skip => return Err(RenderError::BrowserUnavailable),
                RestartDecision::Restart => {}
            }

            instance.status = InstanceStatus::Restarting;
            instance.generation += 1;
            (instance.browser.clone(), instance.generation)
        };

        if let Err(e) = old_browser.lock().await.close().await {
            debug!("Closing browser instance {} before restart failed: {}", id, e);
        }
        let launched = self.create_browser_instance(id, generation).await;

        let mut instances = self.instances.lock().await;
        if id >= instances.len() {
            // the pool was shut down while relaunching
            drop(instances);
            if let Ok(orphan) = launched {
                orphan.shutdown().await;
            }
            return Err(RenderError::BrowserUnavailable);
        }
        let instance = &mut instances[id];

        match launched {
            Ok(new_instance) => {
                *instance = new_instance;
                self.metrics.record_browser_restart();
                info!("Browser instance {} restarted successfully", id);
                Ok((instance.browser.clone(), instance.generation))
            }
            Err(e) => {
                instance.handler.abort();
                instance.status = InstanceStatus::Failed;
                instance.failure_count += 1;
                error!("Failed to restart browser instance {}: {}", id, e);
                Err(e)
            }
        }
    }

    async fn acquire_isolated(&self, permit: OwnedSemaphorePermit) -> Option<PageLease> {
        let stamp = self.next_profile_stamp();
        let user_data_dir = self.isolated_profile_dir(stamp);

        let (mut browser, handler) = match self.launch_browser(&user_data_dir).await {
            Ok(launched) => launched,
            Err(e) => {
                error!("Isolated browser launch failed: {}", e);
                remove_profile_dir(&user_data_dir).await;
                return None;
            }
        };

        let page = match browser.new_page("about:blank").await {
            Ok(page) => CdpPage::new(page).await,
            Err(e) => Err(RenderError::from(e)),
        };

        match page {
            Ok(page) => {
                debug!("Leased isolated browser with profile {}", user_data_dir.display());
                let lease = PageLease::new(Box::new(page)).with_release_hook(move || async move {
                    let mut browser = browser;
                    if let Err(e) = browser.close().await {
                        debug!("Isolated browser close failed: {}", e);
                    }
                    handler.abort();
                    remove_profile_dir(&user_data_dir).await;
                    drop(permit);
                });
                Some(lease)
            }
            Err(e) => {
                error!("Isolated browser could not open a page: {}", e);
                if let Err(e) = browser.close().await {
                    debug!("Isolated browser close failed: {}", e);
                }
                handler.abort();
                remove_profile_dir(&user_data_dir).await;
                None
            }
        }
    }

    fn start_health_check_task(&self) {
        let pool = self.downgrade();

        let task = tokio::spawn(async move {
            // quick check every 15s for dead handlers, deep check every 60s for old instances
            let mut quick_interval = tokio::time::interval(Duration::from_secs(15));
            let mut deep_interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                let deep = tokio::select! {
                    _ = quick_interval.tick() => false,
                    _ = deep_interval.tick() => true,
                };
                let Some(pool) = pool.upgrade() else {
                    debug!("Browser pool dropped, stopping health checks");
                    break;
                };
                if pool.is_shutting_down.load(Ordering::Relaxed) {
                    break;
                }

                if deep {
                    let max_age = pool.config.max_instance_age;
                    pool.restart_where(|i| i.age() > max_age || i.status == InstanceStatus::Failed)
                        .await
                } else {
                    pool.restart_where(|i| i.handler.is_finished()).await
                }
            }
        });

        if let Ok(mut slot) = self.health_task.lock() {
            *slot = Some(task);
        }
    }

    /// A handle that does not keep the browsers alive.
    fn downgrade(&self) -> WeakBrowserPool {
        WeakBrowserPool {
            instances: Arc::downgrade(&self.instances),
            next_instance: self.next_instance.clone(),
            page_permits: self.page_permits.clone(),
            profile_stamp: self.profile_stamp.clone(),
            clock_origin: self.clock_origin,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
            health_task: self.health_task.clone(),
        }
    }

    async fn restart_where<F: Fn(&BrowserInstance) -> bool>(&self, needs_restart: F) {
        let to_restart: Vec<(usize, u64)> = {
            let instances = self.instances.lock().await;
            instances
                .iter()
                .filter(|instance| needs_restart(instance))
                .map(|instance| {
                    info!(
                        "Scheduling restart for browser instance {}: age={:?}, idle={:?}, failures={}, handler_alive={}",
                        instance.id,
                        instance.age(),
                        instance.idle_time(),
                        instance.failure_count,
                        !instance.handler.is_finished()
                    );
                    (instance.id, instance.generation)
                })
                .collect()
        };

        for (id, generation) in to_restart {
            if let Err(e) = self.restart_instance(id, generation).await {
                error!("Failed to restart browser instance {} during health check: {}", id, e);
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        let mut instances = self.instances.lock().await;
        for instance in instances.drain(..) {
            instance.shutdown().await;
        }

        info!("Browser pool shutdown complete");
    }

    pub async fn get_stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;

        let mut stats = BrowserPoolStats {
            total_instances: instances.len(),
            open_pages: self.config.max_open_pages - self.page_permits.available_permits(),
            ..Default::default()
        };
        for instance in instances.iter() {
            stats.pages_opened += instance.pages_opened;
            match instance.status {
                InstanceStatus::Healthy if !instance.handler.is_finished() => stats.healthy_instances += 1,
                InstanceStatus::Failed => stats.failed_instances += 1,
                _ => {}
            }
        }
        stats
    }
}

async fn open_page(browser: &Arc<Mutex<Browser>>) -> Result<CdpPage, RenderError> {
    let page = browser.lock().await.new_page("about:blank").await?;
    CdpPage::new(page).await
}

async fn remove_profile_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove profile directory {}: {}", dir.display(), e);
        }
    }
}

impl Clone for BrowserPool {
    fn clone(&self) -> Self {
        Self {
            instances: self.instances.clone(),
            next_instance: self.next_instance.clone(),
            page_permits: self.page_permits.clone(),
            profile_stamp: self.profile_stamp.clone(),
            clock_origin: self.clock_origin,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
            health_task: self.health_task.clone(),
        }
    }
}

struct WeakBrowserPool {
    instances: Weak<Mutex<Vec<BrowserInstance>>>,
    next_instance: Arc<AtomicUsize>,
    page_permits: Arc<Semaphore>,
    profile_stamp: Arc<AtomicU64>,
    clock_origin: Instant,
    config: Config,
    metrics: Arc<Metrics>,
    is_shutting_down: Arc<AtomicBool>,
    health_task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl WeakBrowserPool {
    fn upgrade(&self) -> Option<BrowserPool> {
        Some(BrowserPool {
            instances: self.instances.upgrade()?,
            next_instance: self.next_instance.clone(),
            page_permits: self.page_permits.clone(),
            profile_stamp: self.profile_stamp.clone(),
            clock_origin: self.clock_origin,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
            health_task: self.health_task.clone(),
        })
    }
}

#[async_trait]
impl PageSource for BrowserPool {
    async fn acquire_page(&self) -> Option<PageLease> {
        BrowserPool::acquire_page(self).await
    }

    async fn shutdown(&self) {
        BrowserPool::shutdown(self).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrowserPoolStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub failed_instances: usize,
    pub open_pages: usize,
    pub pages_opened: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn isolated_pool(max_open_pages: usize) -> BrowserPool {
        let config = Config {
            isolated_profiles: true,
            max_open_pages,
            user_data_root: std::env::temp_dir().join("prerender-pool-tests"),
            ..Default::default()
        };
        BrowserPool::new(config, Arc::new(Metrics::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_isolated_pool_launches_nothing_up_front() {
        let pool = isolated_pool(4).await;
        let stats = pool.get_stats().await;
        assert_eq!(stats.total_instances, 0);
        assert_eq!(stats.open_pages, 0);
    }

    #[tokio::test]
    async fn test_profile_stamps_strictly_increase() {
        let pool = isolated_pool(1).await;
        let mut previous = pool.next_profile_stamp();
        for _ in 0..1000 {
            let next = pool.next_profile_stamp();
            assert!(next > previous);
            previous = next;
        }

        let dir = pool.isolated_profile_dir(42);
        assert!(dir.ends_with("user_data_42"));
    }

    #[tokio::test]
    async fn test_clones_share_the_stamp_sequence() {
        let pool = isolated_pool(1).await;
        let clone = pool.clone();
        let a = pool.next_profile_stamp();
        let b = clone.next_profile_stamp();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_exhausted_page_ceiling_yields_none() {
        let pool = isolated_pool(1).await;
        let _held = pool.page_permits.clone().try_acquire_owned().unwrap();

        assert!(pool.acquire_page().await.is_none());
        assert_eq!(pool.get_stats().await.open_pages, 1);
    }

    #[test]
    fn test_restart_decision() {
        use InstanceStatus::*;

        // crashed or aged out at the generation the caller saw
        assert_eq!(restart_decision(Healthy, true, 3, 3), RestartDecision::Restart);
        assert_eq!(restart_decision(Healthy, false, 3, 3), RestartDecision::Restart);
        assert_eq!(restart_decision(Failed, true, 3, 2), RestartDecision::Restart);
        // already replaced by someone else
        assert_eq!(restart_decision(Healthy, false, 4, 3), RestartDecision::Reuse);
        assert_eq!(restart_decision(Healthy, true, 4, 3), RestartDecision::Restart);
        // relaunch in progress, never wait for it
        assert_eq!(restart_decision(Restarting, false, 4, 3), RestartDecision::Skip);
        assert_eq!(restart_decision(Restarting, true, 4, 4), RestartDecision::Skip);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_task_stops_once_the_pool_is_dropped() {
        let pool = isolated_pool(1).await;
        pool.start_health_check_task();
        let task = pool.health_task.lock().unwrap().take().unwrap();
        let instances = Arc::downgrade(&pool.instances);

        drop(pool);

        let stopped = tokio::time::timeout(Duration::from_secs(120), task).await;
        assert!(stopped.is_ok());
        assert!(instances.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_task_keeps_running_while_the_pool_lives() {
        let pool = isolated_pool(1).await;
        pool.start_health_check_task();

        tokio::time::sleep(Duration::from_secs(200)).await;
        let slot = pool.health_task.lock().unwrap();
        assert!(!slot.as_ref().unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_shut_down_pool_yields_none() {
        let pool = isolated_pool(2).await;
        pool.shutdown().await;
        assert!(pool.acquire_page().await.is_none());
        assert_eq!(pool.page_permits.available_permits(), 2);
    }
}
