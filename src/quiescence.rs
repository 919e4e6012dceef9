//! Idle-debounce wait run after navigation settles

use crate::page::NetworkEvent;
use crate::IdleSettings;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiescenceOutcome {
    /// No network event arrived for a full idle interval
    Idle,
    /// The hard ceiling fired first
    CeilingReached,
}

/// Wait until the page goes quiet or the ceiling `min(rest, hard_ceiling)` passes.
///
/// Every finished, cached or failed request re-arms the idle timer; the first
/// arming uses `first_interval`, later ones `interval`. Whichever timer fires
/// first resolves the wait and the other is dropped.
pub async fn wait_for_quiescence(
    events: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    settings: IdleSettings,
    rest: Duration,
) -> QuiescenceOutcome {
    let ceiling = sleep_until(Instant::now() + rest.min(settings.hard_ceiling));
    let idle = sleep(settings.first_interval);
    tokio::pin!(ceiling);
    tokio::pin!(idle);

    let mut events_open = true;
    loop {
        tokio::select! {
            biased;

            _ = &mut ceiling => return QuiescenceOutcome::CeilingReached,
            _ = &mut idle => return QuiescenceOutcome::Idle,
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    trace!("Network activity: {:?}", event);
                    idle.as_mut().reset(Instant::now() + settings.interval);
                }
                None => events_open = false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> IdleSettings {
        IdleSettings {
            first_interval: Duration::from_millis(250),
            interval: Duration::from_millis(150),
            hard_ceiling: Duration::from_secs(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_page_resolves_after_first_interval() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();

        let outcome = wait_for_quiescence(&mut rx, settings(), Duration::from_secs(10)).await;

        assert_eq!(outcome, QuiescenceOutcome::Idle);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_rearm_the_idle_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for _ in 0..3 {
                sleep(Duration::from_millis(100)).await;
                tx.send(NetworkEvent::RequestFinished).ok();
            }
            sleep(Duration::from_secs(60)).await;
        });
        let start = Instant::now();

        let outcome = wait_for_quiescence(&mut rx, settings(), Duration::from_secs(10)).await;

        // last event at 300ms, then one 150ms interval
        assert_eq!(outcome, QuiescenceOutcome::Idle);
        assert_eq!(start.elapsed(), Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_page_hits_the_hard_ceiling() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(100)).await;
                if tx.send(NetworkEvent::ServedFromCache).is_err() {
                    break;
                }
            }
        });
        let start = Instant::now();

        let outcome = wait_for_quiescence(&mut rx, settings(), Duration::from_secs(10)).await;

        assert_eq!(outcome, QuiescenceOutcome::CeilingReached);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_budget_caps_the_ceiling() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(50)).await;
                if tx.send(NetworkEvent::RequestFailed).is_err() {
                    break;
                }
            }
        });
        let start = Instant::now();

        let outcome = wait_for_quiescence(&mut rx, settings(), Duration::from_millis(700)).await;

        assert_eq!(outcome, QuiescenceOutcome::CeilingReached);
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_event_stream_still_waits_for_idle() {
        let (tx, mut rx) = mpsc::unbounded_channel::<NetworkEvent>();
        drop(tx);
        let start = Instant::now();

        let outcome = wait_for_quiescence(&mut rx, settings(), Duration::from_secs(10)).await;

        assert_eq!(outcome, QuiescenceOutcome::Idle);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }
}
