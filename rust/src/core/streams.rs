// Cancellable subscriptions and the per-session registry that owns them.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::state::ConversationKey;

/// A running consumption loop. Cancellation is cooperative: the loop exits at its next
/// await point and drops the underlying stream.
pub(crate) struct Subscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the loop to acknowledge.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!(err = %e, "subscription task panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub(crate) enum StreamEvent<T> {
    Item(T),
    Failed(String),
    Ended,
}

/// Open a stream with `open` and feed every item to `on_event` until the stream ends,
/// fails, or the subscription is cancelled. Nothing is reported after cancellation.
pub(crate) fn spawn_subscription<T, E, Fut, H>(rt: &Handle, open: Fut, mut on_event: H) -> Subscription
where
    T: Send + 'static,
    E: Display + Send + 'static,
    Fut: Future<Output = Result<BoxStream<'static, Result<T, E>>, E>> + Send + 'static,
    H: FnMut(StreamEvent<T>) + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = rt.spawn(async move {
        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            opened = open => match opened {
                Ok(s) => s,
                Err(e) => {
                    on_event(StreamEvent::Failed(e.to_string()));
                    return;
                }
            },
        };
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(item)) => on_event(StreamEvent::Item(item)),
                    Some(Err(e)) => {
                        on_event(StreamEvent::Failed(e.to_string()));
                        break;
                    }
                    None => {
                        on_event(StreamEvent::Ended);
                        break;
                    }
                },
            }
        }
    });
    Subscription { cancel, handle }
}

/// Call `on_tick` every `period` plus up to `jitter`, until it returns false or the
/// subscription is cancelled. The first tick fires after one full period.
pub(crate) fn spawn_interval<H>(rt: &Handle, period: Duration, jitter: Duration, mut on_tick: H) -> Subscription
where
    H: FnMut() -> bool + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = rt.spawn(async move {
        loop {
            let delay = period + jitter_sample(jitter);
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {
                    if !on_tick() {
                        break;
                    }
                }
            }
        }
    });
    Subscription { cancel, handle }
}

fn jitter_sample(jitter: Duration) -> Duration {
    let max_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamTarget {
    Discovery,
    Conversation(ConversationKey),
}

/// At most one message subscription per conversation key and one discovery
/// subscription per session. Every entry carries a generation so a late "stream
/// closed" report cannot remove a newer subscription for the same target.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    discovery: Option<(u64, Subscription)>,
    messages: HashMap<ConversationKey, (u64, Subscription)>,
    // Network monitor and recheck timer; closed with everything else.
    background: Vec<Subscription>,
    next_generation: u64,
}

impl StreamRegistry {
    pub(crate) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub(crate) fn has_message_stream(&self, key: &ConversationKey) -> bool {
        self.messages.contains_key(key)
    }

    pub(crate) fn insert_message_stream(
        &mut self,
        key: ConversationKey,
        generation: u64,
        sub: Subscription,
    ) {
        if let Some((_, old)) = self.messages.insert(key, (generation, sub)) {
            old.cancel();
        }
    }

    pub(crate) fn take_message_stream(&mut self, key: &ConversationKey) -> Option<Subscription> {
        self.messages.remove(key).map(|(_, sub)| sub)
    }

    pub(crate) fn has_discovery(&self) -> bool {
        self.discovery.is_some()
    }

    pub(crate) fn set_discovery(&mut self, generation: u64, sub: Subscription) {
        if let Some((_, old)) = self.discovery.replace((generation, sub)) {
            old.cancel();
        }
    }

    pub(crate) fn add_background(&mut self, sub: Subscription) {
        self.background.push(sub);
    }

    /// Drop the entry for `target` if it still belongs to `generation`.
    pub(crate) fn remove_if_generation(
        &mut self,
        target: &StreamTarget,
        generation: u64,
    ) -> Option<Subscription> {
        match target {
            StreamTarget::Discovery => {
                if matches!(&self.discovery, Some((g, _)) if *g == generation) {
                    return self.discovery.take().map(|(_, sub)| sub);
                }
                None
            }
            StreamTarget::Conversation(key) => {
                if matches!(self.messages.get(key), Some((g, _)) if *g == generation) {
                    return self.messages.remove(key).map(|(_, sub)| sub);
                }
                None
            }
        }
    }

    pub(crate) fn open_subscription_count(&self) -> usize {
        self.messages.len() + usize::from(self.discovery.is_some()) + self.background.len()
    }

    /// Empty the registry, handing every subscription to the caller for shutdown.
    pub(crate) fn drain(&mut self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self.messages.drain().map(|(_, (_, s))| s).collect();
        subs.extend(self.discovery.take().map(|(_, s)| s));
        subs.append(&mut self.background);
        subs
    }
}

/// Cancel every subscription first, then wait for all of them.
pub(crate) async fn close_all(subs: Vec<Subscription>) {
    for sub in &subs {
        sub.cancel();
    }
    futures::future::join_all(subs.into_iter().map(Subscription::shutdown)).await;
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap()
    }

    fn wait_finished(rt: &tokio::runtime::Runtime, sub: &Subscription) {
        rt.block_on(async {
            while !sub.is_finished() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
    }

    fn pending_stream() -> BoxStream<'static, Result<u32, Infallible>> {
        futures::stream::pending().boxed()
    }

    #[test]
    fn items_then_end_are_reported_in_order() {
        let rt = runtime();
        let (tx, rx) = flume::unbounded();
        let sub = spawn_subscription(
            rt.handle(),
            async { Ok::<_, Infallible>(futures::stream::iter(vec![Ok(1u32), Ok(2)]).boxed()) },
            move |ev| {
                let tag = match ev {
                    StreamEvent::Item(n) => format!("item {n}"),
                    StreamEvent::Failed(e) => format!("failed {e}"),
                    StreamEvent::Ended => "ended".to_string(),
                };
                let _ = tx.send(tag);
            },
        );
        wait_finished(&rt, &sub);
        let seen: Vec<String> = rx.drain().collect();
        assert_eq!(seen, vec!["item 1", "item 2", "ended"]);
    }

    #[test]
    fn open_failure_is_reported() {
        let rt = runtime();
        let (tx, rx) = flume::unbounded();
        let sub = spawn_subscription(
            rt.handle(),
            async { Err::<BoxStream<'static, Result<u32, String>>, _>("boom".to_string()) },
            move |ev| {
                if let StreamEvent::Failed(e) = ev {
                    let _ = tx.send(e);
                }
            },
        );
        wait_finished(&rt, &sub);
        assert_eq!(rx.try_recv().unwrap(), "boom");
    }

    #[test]
    fn cancelled_loop_exits_without_reporting() {
        let rt = runtime();
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        let sub = spawn_subscription(rt.handle(), async { Ok(pending_stream()) }, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!sub.is_finished());
        rt.block_on(sub.shutdown());
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_generation_does_not_remove_newer_stream() {
        let rt = runtime();
        let key = ConversationKey::group("Apes");
        let mut registry = StreamRegistry::default();

        let g1 = registry.next_generation();
        let first = spawn_subscription(rt.handle(), async { Ok(pending_stream()) }, |_| {});
        registry.insert_message_stream(key.clone(), g1, first);
        let g2 = registry.next_generation();
        let second = spawn_subscription(rt.handle(), async { Ok(pending_stream()) }, |_| {});
        registry.insert_message_stream(key.clone(), g2, second);

        let target = StreamTarget::Conversation(key.clone());
        assert!(registry.remove_if_generation(&target, g1).is_none());
        assert!(registry.has_message_stream(&key));
        assert!(registry.remove_if_generation(&target, g2).is_some());
        assert!(!registry.has_message_stream(&key));
    }

    #[test]
    fn drain_closes_everything() {
        let rt = runtime();
        let mut registry = StreamRegistry::default();
        for name in ["a", "b", "c"] {
            let g = registry.next_generation();
            let sub = spawn_subscription(rt.handle(), async { Ok(pending_stream()) }, |_| {});
            registry.insert_message_stream(ConversationKey::group(name), g, sub);
        }
        let g = registry.next_generation();
        registry.set_discovery(g, spawn_subscription(rt.handle(), async { Ok(pending_stream()) }, |_| {}));
        registry.add_background(spawn_interval(rt.handle(), Duration::from_secs(60), Duration::ZERO, || true));
        assert_eq!(registry.open_subscription_count(), 5);

        let subs = registry.drain();
        assert_eq!(subs.len(), 5);
        assert_eq!(registry.open_subscription_count(), 0);
        assert!(!registry.has_discovery());
        rt.block_on(close_all(subs));
    }

    #[test]
    fn interval_ticks_until_handler_stops() {
        let rt = runtime();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let sub = spawn_interval(rt.handle(), Duration::from_millis(5), Duration::from_millis(2), move || {
            counter.fetch_add(1, Ordering::SeqCst) < 2
        });
        wait_finished(&rt, &sub);
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
