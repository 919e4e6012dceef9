//! Navigable browser pages and the leases that own them
//!
//! [`RenderPage`] is the capability the orchestrator drives: interception,
//! extra headers, navigation, a stream of network events and content reads.
//! [`CdpPage`] implements it on top of a chromiumoxide [`Page`] using the CDP
//! Fetch and Network domains.

use crate::utils::{InterceptDecision, RequestInterceptor, ResourceKind};
use crate::RenderError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams,
    FulfillRequestParams, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, EventLoadingFailed, EventLoadingFinished, EventRequestServedFromCache,
    EventRequestWillBeSent, EventResponseReceived, Headers, LoaderId, ResourceType,
    SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Network idle means at most this many requests in flight...
const NETWORK_IDLE_MAX_IN_FLIGHT: usize = 2;
/// ...for this long.
const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);
const NETWORK_IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    RequestFinished,
    ServedFromCache,
    RequestFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// The `load` event fired
    Load,
    /// The document responded and the network went quiet, load or not
    NetworkIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationOptions {
    pub wait_until: WaitUntil,
    pub timeout: Duration,
}

#[async_trait]
pub trait RenderPage: Send + Sync {
    async fn set_request_interception(
        &mut self,
        interceptor: Arc<RequestInterceptor>,
    ) -> Result<(), RenderError>;

    async fn set_extra_http_headers(
        &mut self,
        headers: HashMap<String, String>,
    ) -> Result<(), RenderError>;

    /// Navigate and return the main document's HTTP status when known.
    ///
    /// Exceeding `options.timeout` yields [`RenderError::NavigationTimeout`];
    /// every other failure is [`RenderError::NavigationFailed`].
    async fn goto(&mut self, url: &str, options: NavigationOptions)
        -> Result<Option<u16>, RenderError>;

    /// Subscribe to finished, cached and failed requests from now on.
    fn network_events(&mut self) -> mpsc::UnboundedReceiver<NetworkEvent>;

    async fn content(&mut self) -> Result<String, RenderError>;

    async fn close(self: Box<Self>) -> Result<(), RenderError>;
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<NetworkEvent>>>>;

/// Ids of requests that were sent and have not finished or failed yet
#[derive(Debug, Default)]
struct InFlight(Mutex<HashSet<String>>);

impl InFlight {
    /// A redirect hop is re-sent under the same id and stays one entry.
    fn track(&self, request_id: &str) {
        if let Ok(mut ids) = self.0.lock() {
            ids.insert(request_id.to_string());
        }
    }

    fn settle(&self, request_id: &str) {
        if let Ok(mut ids) = self.0.lock() {
            ids.remove(request_id);
        }
    }

    fn len(&self) -> usize {
        self.0.lock().map(|ids| ids.len()).unwrap_or(0)
    }
}

pub struct CdpPage {
    page: Page,
    in_flight: Arc<InFlight>,
    subscribers: Subscribers,
    listeners: Vec<JoinHandle<()>>,
}

impl CdpPage {
    pub async fn new(page: Page) -> Result<Self, RenderError> {
        let mut cdp_page = Self {
            page,
            in_flight: Arc::new(InFlight::default()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            listeners: Vec::new(),
        };
        cdp_page.start_network_listener().await?;
        Ok(cdp_page)
    }

    async fn start_network_listener(&mut self) -> Result<(), RenderError> {
        let mut sent = self.page.event_listener::<EventRequestWillBeSent>().await?;
        let mut finished = self.page.event_listener::<EventLoadingFinished>().await?;
        let mut failed = self.page.event_listener::<EventLoadingFailed>().await?;
        let mut cached = self
            .page
            .event_listener::<EventRequestServedFromCache>()
            .await?;

        let in_flight = self.in_flight.clone();
        let subscribers = self.subscribers.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(event) = sent.next() => {
                        in_flight.track(event.request_id.inner());
                        continue;
                    }
                    Some(event) = finished.next() => {
                        in_flight.settle(event.request_id.inner());
                        NetworkEvent::RequestFinished
                    }
                    Some(event) = failed.next() => {
                        in_flight.settle(event.request_id.inner());
                        NetworkEvent::RequestFailed
                    }
                    Some(_) = cached.next() => NetworkEvent::ServedFromCache,
                    else => break,
                };
                publish(&subscribers, event);
            }
        });

        self.listeners.push(task);
        Ok(())
    }

    async fn wait_for_network_idle(&self) {
        let mut quiet_since: Option<Instant> = None;
        loop {
            if self.in_flight.len() <= NETWORK_IDLE_MAX_IN_FLIGHT {
                let since = *quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= NETWORK_IDLE_WINDOW {
                    return;
                }
            } else {
                quiet_since = None;
            }
            sleep(NETWORK_IDLE_POLL).await;
        }
    }

    /// Navigate and wait for the `load` event.
    async fn goto_load(&self, url: &str, timeout: Duration) -> Result<Option<u16>, RenderError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| navigation_error(e, timeout))?;
        let status = self
            .page
            .wait_for_navigation_response()
            .await
            .map_err(|e| navigation_error(e, timeout))?
            .and_then(|request| request.response.as_ref().map(|response| response.status))
            .and_then(|status| u16::try_from(status).ok());
        Ok(status)
    }

    /// Issue the navigation, take the status from the document response and
    /// then wait for network idle. Subresources may still be loading.
    async fn goto_network_idle(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Option<u16>, RenderError> {
        let mut responses = self.page.event_listener::<EventResponseReceived>().await?;
        let navigated = self
            .page
            .execute(NavigateParams::new(url))
            .await
            .map_err(|e| navigation_error(e, timeout))?
            .result;
        if let Some(error) = navigated.error_text {
            return Err(RenderError::NavigationFailed(error));
        }

        let mut status = None;
        if let Some(loader_id) = navigated.loader_id {
            while let Some(event) = responses.next().await {
                if let Some(found) =
                    document_status(&event.r#type, &event.loader_id, &loader_id, event.response.status)
                {
                    status = found;
                    break;
                }
            }
        }

        self.wait_for_network_idle().await;
        Ok(status)
    }
}

/// Status of the main document response of the navigation `navigation`.
///
/// `None` when the response belongs to something else; `Some(None)` when it
/// is the document but the status does not fit an HTTP code.
fn document_status(
    kind: &ResourceType,
    loader_id: &LoaderId,
    navigation: &LoaderId,
    status: i64,
) -> Option<Option<u16>> {
    (*kind == ResourceType::Document && loader_id == navigation).then(|| u16::try_from(status).ok())
}

fn publish(subscribers: &Mutex<Vec<mpsc::UnboundedSender<NetworkEvent>>>, event: NetworkEvent) {
    if let Ok(mut subscribers) = subscribers.lock() {
        subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

fn navigation_error(err: CdpError, timeout: Duration) -> RenderError {
    match err {
        CdpError::Timeout => RenderError::NavigationTimeout(timeout),
        other => RenderError::NavigationFailed(other.to_string()),
    }
}

async fn resolve_paused_request(
    page: &Page,
    event: &EventRequestPaused,
    decision: InterceptDecision,
) -> Result<(), RenderError> {
    let request_id = event.request_id.clone();
    match decision {
        InterceptDecision::Continue => {
            page.execute(ContinueRequestParams::new(request_id)).await?;
        }
        InterceptDecision::Abort => {
            page.execute(FailRequestParams::new(request_id, ErrorReason::BlockedByClient))
                .await?;
        }
        InterceptDecision::Respond { status, body } => {
            let params = FulfillRequestParams::builder()
                .request_id(request_id)
                .response_code(i64::from(status))
                .body(STANDARD.encode(body))
                .build()
                .map_err(RenderError::InterceptionFailed)?;
            page.execute(params).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl RenderPage for CdpPage {
    async fn set_request_interception(
        &mut self,
        interceptor: Arc<RequestInterceptor>,
    ) -> Result<(), RenderError> {
        let mut paused = self.page.event_listener::<EventRequestPaused>().await?;
        let page = self.page.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let kind = ResourceKind::from(event.resource_type.as_ref());
                let decision = interceptor.decide(&event.request.url, kind);
                if let Err(e) = resolve_paused_request(&page, &event, decision).await {
                    debug!("Could not resolve intercepted request {}: {}", event.request.url, e);
                }
            }
        });
        self.listeners.push(task);

        let pattern = RequestPattern::builder()
            .url_pattern("*")
            .request_stage(RequestStage::Request)
            .build();
        self.page
            .execute(EnableParams::builder().pattern(pattern).build())
            .await
            .map_err(|e| RenderError::InterceptionFailed(e.to_string()))?;
        Ok(())
    }

    async fn set_extra_http_headers(
        &mut self,
        headers: HashMap<String, String>,
    ) -> Result<(), RenderError> {
        let headers = serde_json::to_value(headers)?;
        self.page
            .execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await?;
        Ok(())
    }

    async fn goto(
        &mut self,
        url: &str,
        options: NavigationOptions,
    ) -> Result<Option<u16>, RenderError> {
        let navigation = async {
            match options.wait_until {
                WaitUntil::Load => self.goto_load(url, options.timeout).await,
                WaitUntil::NetworkIdle => self.goto_network_idle(url, options.timeout).await,
            }
        };

        match tokio::time::timeout(options.timeout, navigation).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::NavigationTimeout(options.timeout)),
        }
    }

    fn network_events(&mut self) -> mpsc::UnboundedReceiver<NetworkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(_) => warn!("Network event subscribers poisoned; events will not be delivered"),
        }
        rx
    }

    async fn content(&mut self) -> Result<String, RenderError> {
        self.page
            .content()
            .await
            .map_err(|e| RenderError::ExtractionFailed(e.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        let CdpPage { page, listeners, .. } = *self;
        for listener in &listeners {
            listener.abort();
        }
        page.close()
            .await
            .map_err(|e| RenderError::PageError(e.to_string()))
    }
}

/// Work to run after a lease's page is closed
pub type ReleaseHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Exclusive lease on one page for the duration of one render
///
/// Call [`PageLease::release`] on every path; a lease that is dropped instead
/// closes its page in the background.
pub struct PageLease {
    page: Option<Box<dyn RenderPage>>,
    on_release: Option<ReleaseHook>,
}

impl PageLease {
    pub fn new(page: Box<dyn RenderPage>) -> Self {
        Self {
            page: Some(page),
            on_release: None,
        }
    }

    pub fn with_release_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_release = Some(Box::new(move || Box::pin(hook()) as BoxFuture<'static, ()>));
        self
    }

    pub fn page(&mut self) -> Result<&mut Box<dyn RenderPage>, RenderError> {
        self.page
            .as_mut()
            .ok_or_else(|| RenderError::PageError("page already released".to_string()))
    }

    /// Close the page, then run the release hook whatever the close result.
    pub async fn release(mut self) -> Result<(), RenderError> {
        let page = self.page.take();
        let hook = self.on_release.take();

        let result = match page {
            Some(page) => page.close().await,
            None => Ok(()),
        };
        if let Some(hook) = hook {
            hook().await;
        }
        result
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let page = self.page.take();
        let hook = self.on_release.take();
        if page.is_none() && hook.is_none() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(page) = page {
                        if let Err(e) = page.close().await {
                            debug!("Background page close failed: {}", e);
                        }
                    }
                    if let Some(hook) = hook {
                        hook().await;
                    }
                });
            }
            Err(_) => warn!("Page lease dropped outside a runtime, page left open"),
        }
    }
}

/// Anything that can hand out page leases
///
/// `None` means no capacity right now; callers never wait for a page.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn acquire_page(&self) -> Option<PageLease>;

    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ClosingPage {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RenderPage for ClosingPage {
        async fn set_request_interception(
            &mut self,
            _interceptor: Arc<RequestInterceptor>,
        ) -> Result<(), RenderError> {
            Ok(())
        }

        async fn set_extra_http_headers(
            &mut self,
            _headers: HashMap<String, String>,
        ) -> Result<(), RenderError> {
            Ok(())
        }

        async fn goto(
            &mut self,
            _url: &str,
            _options: NavigationOptions,
        ) -> Result<Option<u16>, RenderError> {
            Ok(Some(200))
        }

        fn network_events(&mut self) -> mpsc::UnboundedReceiver<NetworkEvent> {
            mpsc::unbounded_channel().1
        }

        async fn content(&mut self) -> Result<String, RenderError> {
            Ok(String::new())
        }

        async fn close(self: Box<Self>) -> Result<(), RenderError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn lease_with_flags() -> (PageLease, Arc<AtomicBool>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let hooked = Arc::new(AtomicBool::new(false));
        let hook_flag = hooked.clone();
        let lease = PageLease::new(Box::new(ClosingPage {
            closed: closed.clone(),
        }))
        .with_release_hook(move || async move {
            hook_flag.store(true, Ordering::SeqCst);
        });
        (lease, closed, hooked)
    }

    #[tokio::test]
    async fn test_release_closes_page_and_runs_hook() {
        let (lease, closed, hooked) = lease_with_flags();
        lease.release().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(hooked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_lease_closes_in_background() {
        let (lease, closed, hooked) = lease_with_flags();
        drop(lease);
        for _ in 0..100 {
            if closed.load(Ordering::SeqCst) && hooked.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(closed.load(Ordering::SeqCst));
        assert!(hooked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_settling_unknown_request_is_ignored() {
        let in_flight = InFlight::default();
        in_flight.track("1000.1");
        in_flight.settle("1000.1");
        in_flight.settle("1000.1");
        in_flight.settle("1000.7");
        assert_eq!(in_flight.len(), 0);
    }

    #[test]
    fn test_redirect_hops_count_as_one_request() {
        let in_flight = InFlight::default();
        // http -> https -> final page, all under the document's request id
        in_flight.track("1000.1");
        in_flight.track("1000.1");
        in_flight.track("1000.1");
        in_flight.track("1000.2");
        assert_eq!(in_flight.len(), 2);

        in_flight.settle("1000.1");
        assert_eq!(in_flight.len(), 1);
        in_flight.settle("1000.2");
        assert_eq!(in_flight.len(), 0);
    }

    #[test]
    fn test_status_comes_from_the_navigated_document() {
        let navigation = LoaderId::new("A1");
        let earlier = LoaderId::new("9F");

        assert_eq!(
            document_status(&ResourceType::Document, &navigation, &navigation, 404),
            Some(Some(404))
        );
        assert_eq!(
            document_status(&ResourceType::Script, &navigation, &navigation, 200),
            None
        );
        assert_eq!(
            document_status(&ResourceType::Document, &earlier, &navigation, 200),
            None
        );
        assert_eq!(
            document_status(&ResourceType::Document, &navigation, &navigation, -1),
            Some(None)
        );
    }

    #[test]
    fn test_publish_drops_closed_subscribers() {
        let (open_tx, mut open_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        drop(closed_rx);
        let subscribers = Mutex::new(vec![open_tx, closed_tx]);

        publish(&subscribers, NetworkEvent::RequestFinished);

        assert_eq!(subscribers.lock().unwrap().len(), 1);
        assert_eq!(open_rx.try_recv().unwrap(), NetworkEvent::RequestFinished);
    }
}
