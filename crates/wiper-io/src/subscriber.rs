//! Actuator target subscription with reconnect and backoff.

use crate::broker::{AggregationClient, CallContext, StatusCode, StreamItem, StreamStatus, UpdateBatch};
use crate::metrics::BridgeMetrics;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use wiper_core::LifecycleFlag;

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub initial_backoff: Duration,
    pub backoff_step: Duration,
    pub max_backoff: Duration,
    /// Pause after a stream ends with a recoverable status.
    pub cooldown: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            backoff_step: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberExit {
    /// Nothing to subscribe to.
    NoPaths,
    /// The stream ended with a status that rules out reconnecting.
    Fatal(StatusCode),
    Shutdown,
}

pub struct ReconnectingSubscriber {
    client: Arc<dyn AggregationClient>,
    paths: Vec<String>,
    config: SubscriberConfig,
    metrics: Option<Arc<BridgeMetrics>>,
    active: LifecycleFlag,
    session: Mutex<Option<CallContext>>,
}

impl ReconnectingSubscriber {
    pub fn new(
        client: Arc<dyn AggregationClient>,
        paths: Vec<String>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            client,
            paths,
            config,
            metrics: None,
            active: LifecycleFlag::new(),
            session: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.is_up()
    }

    fn session(&self) -> MutexGuard<'_, Option<CallContext>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deactivates the subscriber and cancels the open stream, if any.
    /// Returns false if it was already inactive.
    pub fn shutdown(&self) -> bool {
        let lowered = self.active.lower();
        let session = self.session();
        if let Some(ctx) = session.as_ref() {
            debug!("cancelling actuator subscription");
            ctx.cancel();
        }
        lowered
    }

    /// Subscribes and hands every update batch to `on_update` until shut down
    /// or a fatal status is received.
    pub fn run<F>(&self, mut on_update: F) -> SubscriberExit
    where
        F: FnMut(UpdateBatch),
    {
        if self.paths.is_empty() {
            error!("no actuator paths to subscribe");
            self.active.lower();
            return SubscriberExit::NoPaths;
        }
        if !self.active.raise() {
            debug!("subscriber shut down before start");
            return SubscriberExit::Shutdown;
        }

        info!(address = %self.client.address(), "starting actuator target subscriber");
        let mut backoff = self.config.initial_backoff;

        while self.active.is_up() {
            if !self.client.wait_for_connected(Instant::now() + backoff) {
                info!(backoff_s = backoff.as_secs_f64(), "not connected");
                if let Some(metrics) = &self.metrics {
                    metrics.connect_failures.inc();
                }
                backoff = (backoff + self.config.backoff_step).min(self.config.max_backoff);
                continue;
            }
            backoff = self.config.initial_backoff;
            info!(address = %self.client.address(), "connected");

            let Some(status) = self.stream_once(&mut on_update) else {
                break;
            };

            if status.code.is_fatal() {
                error!(%status, "actuator subscription failed permanently");
                self.active.lower();
                return SubscriberExit::Fatal(status.code);
            }
            warn!(%status, cooldown_ms = self.config.cooldown.as_millis() as u64, "actuator stream ended");
            if let Some(metrics) = &self.metrics {
                metrics.stream_restarts.inc();
            }
            if self.active.wait_for_down(self.config.cooldown) {
                break;
            }
        }
        debug!("actuator subscriber exiting");
        SubscriberExit::Shutdown
    }

    /// Opens one stream and reads it to the end. Returns `None` when the
    /// subscriber was deactivated meanwhile.
    fn stream_once<F>(&self, on_update: &mut F) -> Option<StreamStatus>
    where
        F: FnMut(UpdateBatch),
    {
        let ctx = self.client.create_call_context();
        {
            let mut session = self.session();
            if !self.active.is_up() {
                return None;
            }
            *session = Some(ctx.clone());
        }

        debug!(paths = ?self.paths, "subscribing");
        let mut reader = self.client.open_subscribe_stream(&ctx, &self.paths);
        self.set_connected(true);

        let status = loop {
            match reader.read() {
                StreamItem::Update(batch) if self.active.is_up() => on_update(batch),
                StreamItem::Update(_) => break StreamStatus::cancelled(),
                StreamItem::End(status) => break status,
            }
        };

        self.set_connected(false);
        *self.session() = None;
        if self.active.is_up() {
            Some(status)
        } else {
            debug!(%status, "stream closed by shutdown");
            None
        }
    }

    fn set_connected(&self, connected: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.subscriber_connected.set(if connected { 1.0 } else { 0.0 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, DatapointMetadata, DatapointValue, StreamReader};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::{channel, Receiver};
    use std::thread;

    /// Connect results and stream scripts are consumed in order. Once a
    /// script runs out the stream blocks until cancelled.
    #[derive(Default)]
    struct ScriptedBroker {
        connects: Mutex<VecDeque<bool>>,
        streams: Mutex<VecDeque<Vec<StreamItem>>>,
        backoffs: Mutex<Vec<u64>>,
        opens: AtomicUsize,
    }

    impl ScriptedBroker {
        fn backoffs(&self) -> Vec<u64> {
            self.backoffs.lock().unwrap().clone()
        }
    }

    struct ScriptedReader {
        rx: Receiver<StreamItem>,
    }

    impl StreamReader for ScriptedReader {
        fn read(&mut self) -> StreamItem {
            self.rx
                .recv()
                .unwrap_or_else(|_| StreamItem::End(StreamStatus::cancelled()))
        }
    }

    impl AggregationClient for ScriptedBroker {
        fn address(&self) -> &str {
            "scripted"
        }

        fn wait_for_connected(&self, deadline: Instant) -> bool {
            let secs = deadline
                .saturating_duration_since(Instant::now())
                .as_secs_f64()
                .round() as u64;
            self.backoffs.lock().unwrap().push(secs);
            self.connects.lock().unwrap().pop_front().unwrap_or(true)
        }

        fn create_call_context(&self) -> CallContext {
            CallContext::new()
        }

        fn open_subscribe_stream(
            &self,
            ctx: &CallContext,
            _paths: &[String],
        ) -> Box<dyn StreamReader> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = channel();
            for item in self.streams.lock().unwrap().pop_front().unwrap_or_default() {
                tx.send(item).unwrap();
            }
            ctx.on_cancel(move || {
                let _ = tx.send(StreamItem::End(StreamStatus::cancelled()));
            });
            Box::new(ScriptedReader { rx })
        }

        fn register_datapoints(&self, _metadata: &[DatapointMetadata]) -> Result<(), BrokerError> {
            Ok(())
        }

        fn update_datapoints(&self, _batch: &UpdateBatch) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn end(code: StatusCode) -> StreamItem {
        StreamItem::End(StreamStatus::new(code, "scripted"))
    }

    fn config(cooldown_ms: u64) -> SubscriberConfig {
        SubscriberConfig {
            cooldown: Duration::from_millis(cooldown_ms),
            ..SubscriberConfig::default()
        }
    }

    fn paths() -> Vec<String> {
        vec!["A.Mode".to_string()]
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(5), "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn spawn(sub: &Arc<ReconnectingSubscriber>) -> thread::JoinHandle<SubscriberExit> {
        let sub = Arc::clone(sub);
        thread::spawn(move || sub.run(|_| {}))
    }

    #[test]
    fn backoff_grows_then_resets_after_success() {
        let broker = Arc::new(ScriptedBroker::default());
        broker.connects.lock().unwrap().extend([false; 5]);
        broker
            .streams
            .lock()
            .unwrap()
            .push_back(vec![end(StatusCode::Unavailable)]);

        let sub = Arc::new(ReconnectingSubscriber::new(broker.clone(), paths(), config(10)));
        let handle = spawn(&sub);
        wait_for(|| broker.backoffs().len() >= 7);
        assert!(sub.shutdown());
        assert_eq!(handle.join().unwrap(), SubscriberExit::Shutdown);

        let backoffs = broker.backoffs();
        assert_eq!(&backoffs[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(backoffs[6], 1);
    }

    #[test]
    fn backoff_is_capped() {
        let broker = Arc::new(ScriptedBroker::default());
        broker.connects.lock().unwrap().extend([false; 12]);
        let sub = Arc::new(ReconnectingSubscriber::new(broker.clone(), paths(), config(10)));
        let handle = spawn(&sub);
        wait_for(|| broker.opens.load(Ordering::SeqCst) == 1);
        sub.shutdown();
        handle.join().unwrap();
        let backoffs = broker.backoffs();
        assert_eq!(&backoffs[8..12], &[9, 10, 10, 10]);
    }

    #[test]
    fn fatal_status_stops_reconnecting() {
        let broker = Arc::new(ScriptedBroker::default());
        broker
            .streams
            .lock()
            .unwrap()
            .push_back(vec![end(StatusCode::Unauthenticated)]);
        let sub = ReconnectingSubscriber::new(broker.clone(), paths(), config(10));

        assert_eq!(
            sub.run(|_| {}),
            SubscriberExit::Fatal(StatusCode::Unauthenticated)
        );
        assert!(!sub.is_active());
        assert_eq!(broker.backoffs().len(), 1);
        assert_eq!(broker.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recoverable_status_reconnects_once_after_cooldown() {
        let broker = Arc::new(ScriptedBroker::default());
        broker
            .streams
            .lock()
            .unwrap()
            .push_back(vec![end(StatusCode::Unknown)]);
        let sub = Arc::new(ReconnectingSubscriber::new(broker.clone(), paths(), config(100)));

        let start = Instant::now();
        let handle = spawn(&sub);
        wait_for(|| broker.opens.load(Ordering::SeqCst) >= 1);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(broker.opens.load(Ordering::SeqCst), 1);

        wait_for(|| broker.opens.load(Ordering::SeqCst) >= 2);
        assert!(start.elapsed() >= Duration::from_millis(100));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(broker.opens.load(Ordering::SeqCst), 2);
        assert_eq!(broker.backoffs().len(), 2);

        sub.shutdown();
        assert_eq!(handle.join().unwrap(), SubscriberExit::Shutdown);
    }

    #[test]
    fn updates_reach_callback() {
        let broker = Arc::new(ScriptedBroker::default());
        let batch = UpdateBatch::from([("A.Mode".to_string(), DatapointValue::String("WIPE".into()))]);
        broker
            .streams
            .lock()
            .unwrap()
            .push_back(vec![StreamItem::Update(batch.clone()), StreamItem::Update(batch.clone())]);
        let sub = Arc::new(ReconnectingSubscriber::new(broker.clone(), paths(), config(10)));

        let (tx, rx) = channel();
        let handle = {
            let sub = Arc::clone(&sub);
            thread::spawn(move || sub.run(move |b| tx.send(b).unwrap()))
        };
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), batch);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), batch);
        sub.shutdown();
        assert_eq!(handle.join().unwrap(), SubscriberExit::Shutdown);
        assert_eq!(broker.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_interrupts_cooldown() {
        let broker = Arc::new(ScriptedBroker::default());
        broker
            .streams
            .lock()
            .unwrap()
            .push_back(vec![end(StatusCode::Unavailable)]);
        let sub = Arc::new(ReconnectingSubscriber::new(
            broker.clone(),
            paths(),
            config(60_000),
        ));
        let handle = spawn(&sub);
        wait_for(|| broker.opens.load(Ordering::SeqCst) == 1);
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        sub.shutdown();
        assert_eq!(handle.join().unwrap(), SubscriberExit::Shutdown);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(broker.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_before_run_skips_connect() {
        let broker = Arc::new(ScriptedBroker::default());
        let sub = ReconnectingSubscriber::new(broker.clone(), paths(), config(10));
        assert!(sub.shutdown());
        assert!(!sub.shutdown());
        assert_eq!(sub.run(|_| {}), SubscriberExit::Shutdown);
        assert!(broker.backoffs().is_empty());
    }

    #[test]
    fn empty_paths_exit_immediately() {
        let broker = Arc::new(ScriptedBroker::default());
        let sub = ReconnectingSubscriber::new(broker, Vec::new(), config(10));
        assert_eq!(sub.run(|_| {}), SubscriberExit::NoPaths);
    }
}
