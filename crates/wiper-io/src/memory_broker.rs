//! In-process aggregation service used by the standalone binary and tests.

use crate::broker::{
    bearer, AggregationClient, BrokerError, CallContext, DatapointMetadata, DatapointValue,
    StatusCode, StreamItem, StreamReader, StreamStatus, UpdateBatch,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, warn};
use wiper_core::WaitFlag;

const AUTHORIZATION: &str = "authorization";

/// Upsert batches kept for inspection; older ones are dropped.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

struct StreamSlot {
    id: u64,
    paths: Vec<String>,
    tx: Sender<StreamItem>,
}

#[derive(Default)]
struct Store {
    values: BTreeMap<String, DatapointValue>,
    metadata: BTreeMap<String, DatapointMetadata>,
    targets: BTreeMap<String, DatapointValue>,
    history: VecDeque<UpdateBatch>,
    update_count: usize,
    streams: Vec<StreamSlot>,
    next_stream_id: u64,
    stream_opens: usize,
}

impl Store {
    fn targets_for(&self, paths: &[String]) -> UpdateBatch {
        paths
            .iter()
            .filter_map(|p| self.targets.get(p).map(|v| (p.clone(), v.clone())))
            .collect()
    }
}

pub struct MemoryBroker {
    address: String,
    available: WaitFlag,
    client_token: Option<String>,
    required_token: Option<String>,
    history_capacity: usize,
    store: Arc<Mutex<Store>>,
}

impl MemoryBroker {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            available: WaitFlag::new(true),
            client_token: None,
            required_token: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    /// Token the adapter presents on every call.
    pub fn with_client_token(mut self, token: Option<String>) -> Self {
        self.client_token = token;
        self
    }

    /// Token the service insists on; other callers get `Unauthenticated`.
    pub fn require_token(mut self, token: &str) -> Self {
        self.required_token = Some(token.to_string());
        self
    }

    /// Number of recent upsert batches [`MemoryBroker::updates`] retains.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authorized(&self, presented: Option<&str>) -> bool {
        match &self.required_token {
            None => true,
            Some(token) => presented == Some(bearer(token).as_str()),
        }
    }

    fn check_client(&self) -> Result<(), BrokerError> {
        if !self.available.get() {
            return Err(BrokerError::Unavailable(self.address.clone()));
        }
        let presented = self.client_token.as_deref().map(bearer);
        if self.authorized(presented.as_deref()) {
            Ok(())
        } else {
            Err(BrokerError::Rpc(StreamStatus::new(
                StatusCode::Unauthenticated,
                "invalid token",
            )))
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    /// Applies actuator targets and pushes the full current target set to
    /// every open stream subscribed to any of the changed paths.
    pub fn set_actuator_targets(&self, batch: UpdateBatch) {
        let mut store = self.lock();
        let changed: Vec<String> = batch.keys().cloned().collect();
        store.targets.extend(batch);
        let Store {
            streams, targets, ..
        } = &mut *store;
        streams.retain(|slot| {
            if !slot.paths.iter().any(|p| changed.contains(p)) {
                return true;
            }
            let update: UpdateBatch = slot
                .paths
                .iter()
                .filter_map(|p| targets.get(p).map(|v| (p.clone(), v.clone())))
                .collect();
            slot.tx.send(StreamItem::Update(update)).is_ok()
        });
    }

    /// Ends every open stream with `code`.
    pub fn fail_streams(&self, code: StatusCode) {
        let streams = std::mem::take(&mut self.lock().streams);
        for slot in streams {
            let _ = slot
                .tx
                .send(StreamItem::End(StreamStatus::new(code, "terminated by server")));
        }
    }

    pub fn value(&self, path: &str) -> Option<DatapointValue> {
        self.lock().values.get(path).cloned()
    }

    pub fn metadata(&self, path: &str) -> Option<DatapointMetadata> {
        self.lock().metadata.get(path).cloned()
    }

    /// The most recent upsert batches, oldest first.
    pub fn updates(&self) -> Vec<UpdateBatch> {
        self.lock().history.iter().cloned().collect()
    }

    /// Upserts accepted since start, including those no longer in history.
    pub fn update_count(&self) -> usize {
        self.lock().update_count
    }

    pub fn stream_opens(&self) -> usize {
        self.lock().stream_opens
    }

    pub fn open_streams(&self) -> usize {
        self.lock().streams.len()
    }
}

impl AggregationClient for MemoryBroker {
    fn address(&self) -> &str {
        &self.address
    }

    fn wait_for_connected(&self, deadline: Instant) -> bool {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.available
            .wait_timeout_until(timeout, |available| available)
            .is_some()
    }

    fn create_call_context(&self) -> CallContext {
        let ctx = CallContext::new();
        match &self.client_token {
            Some(token) => ctx.with_metadata(AUTHORIZATION, &bearer(token)),
            None => ctx,
        }
    }

    fn open_subscribe_stream(&self, ctx: &CallContext, paths: &[String]) -> Box<dyn StreamReader> {
        let (tx, rx) = channel();
        let mut store = self.lock();
        store.stream_opens += 1;
        let mut slot_id = None;
        if ctx.is_cancelled() {
            let _ = tx.send(StreamItem::End(StreamStatus::cancelled()));
        } else if !self.available.get() {
            let _ = tx.send(StreamItem::End(StreamStatus::new(
                StatusCode::Unavailable,
                "service unavailable",
            )));
        } else if !self.authorized(ctx.metadata(AUTHORIZATION).as_deref()) {
            warn!(address = %self.address, "rejecting subscribe: bad or missing token");
            let _ = tx.send(StreamItem::End(StreamStatus::new(
                StatusCode::Unauthenticated,
                "invalid token",
            )));
        } else {
            let snapshot = store.targets_for(paths);
            if !snapshot.is_empty() {
                let _ = tx.send(StreamItem::Update(snapshot));
            }
            let id = store.next_stream_id;
            store.next_stream_id += 1;
            debug!(id, paths = paths.len(), "subscribe stream opened");
            store.streams.push(StreamSlot {
                id,
                paths: paths.to_vec(),
                tx: tx.clone(),
            });
            slot_id = Some(id);
        }
        drop(store);

        // The hook may run right here if the call was cancelled meanwhile.
        let shared = Arc::clone(&self.store);
        ctx.on_cancel(move || {
            if let Some(id) = slot_id {
                shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .streams
                    .retain(|slot| slot.id != id);
            }
            let _ = tx.send(StreamItem::End(StreamStatus::cancelled()));
        });
        Box::new(ChannelReader { rx, ended: None })
    }

    fn register_datapoints(&self, metadata: &[DatapointMetadata]) -> Result<(), BrokerError> {
        self.check_client()?;
        let mut store = self.lock();
        for md in metadata {
            store.metadata.insert(md.path.clone(), md.clone());
        }
        Ok(())
    }

    fn update_datapoints(&self, batch: &UpdateBatch) -> Result<(), BrokerError> {
        self.check_client()?;
        let mut store = self.lock();
        store
            .values
            .extend(batch.iter().map(|(k, v)| (k.clone(), v.clone())));
        store.history.push_back(batch.clone());
        while store.history.len() > self.history_capacity {
            store.history.pop_front();
        }
        store.update_count += 1;
        Ok(())
    }
}

struct ChannelReader {
    rx: Receiver<StreamItem>,
    ended: Option<StreamStatus>,
}

impl StreamReader for ChannelReader {
    fn read(&mut self) -> StreamItem {
        if let Some(status) = &self.ended {
            return StreamItem::End(status.clone());
        }
        let item = self.rx.recv().unwrap_or_else(|_| {
            StreamItem::End(StreamStatus::new(StatusCode::Unavailable, "stream closed"))
        });
        if let StreamItem::End(status) = &item {
            self.ended = Some(status.clone());
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn paths() -> Vec<String> {
        vec!["A.Mode".to_string(), "A.Frequency".to_string()]
    }

    #[test]
    fn stream_receives_snapshot_then_changes() {
        let broker = MemoryBroker::new("mem");
        broker.set_actuator_targets(UpdateBatch::from([(
            "A.Mode".to_string(),
            DatapointValue::String("WIPE".into()),
        )]));

        let ctx = broker.create_call_context();
        let mut reader = broker.open_subscribe_stream(&ctx, &paths());
        match reader.read() {
            StreamItem::Update(batch) => assert_eq!(batch.len(), 1),
            other => panic!("unexpected {other:?}"),
        }

        broker.set_actuator_targets(UpdateBatch::from([(
            "A.Frequency".to_string(),
            DatapointValue::Uint32(40),
        )]));
        match reader.read() {
            StreamItem::Update(batch) => {
                assert_eq!(batch.len(), 2);
                assert_eq!(batch["A.Frequency"], DatapointValue::Uint32(40));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unrelated_targets_are_not_streamed() {
        let broker = MemoryBroker::new("mem");
        let ctx = broker.create_call_context();
        let mut reader = broker.open_subscribe_stream(&ctx, &paths());
        broker.set_actuator_targets(UpdateBatch::from([(
            "B.Other".to_string(),
            DatapointValue::Bool(true),
        )]));
        ctx.cancel();
        assert_eq!(reader.read(), StreamItem::End(StreamStatus::cancelled()));
    }

    #[test]
    fn cancel_ends_blocked_read() {
        let broker = MemoryBroker::new("mem");
        let ctx = broker.create_call_context();
        let mut reader = broker.open_subscribe_stream(&ctx, &paths());
        let canceller = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                ctx.cancel();
            })
        };
        assert_eq!(reader.read(), StreamItem::End(StreamStatus::cancelled()));
        assert_eq!(reader.read(), StreamItem::End(StreamStatus::cancelled()));
        canceller.join().unwrap();
    }

    #[test]
    fn wrong_token_is_unauthenticated() {
        let broker = MemoryBroker::new("mem")
            .require_token("secret")
            .with_client_token(Some("other".into()));
        let ctx = broker.create_call_context();
        let mut reader = broker.open_subscribe_stream(&ctx, &paths());
        match reader.read() {
            StreamItem::End(status) => assert_eq!(status.code, StatusCode::Unauthenticated),
            other => panic!("unexpected {other:?}"),
        }
        assert!(broker.update_datapoints(&UpdateBatch::new()).is_err());
    }

    #[test]
    fn matching_token_is_accepted() {
        let broker = MemoryBroker::new("mem")
            .require_token("secret")
            .with_client_token(Some("secret".into()));
        let ctx = broker.create_call_context();
        assert_eq!(
            ctx.metadata("authorization").as_deref(),
            Some("Bearer secret")
        );
        let _reader = broker.open_subscribe_stream(&ctx, &paths());
        assert_eq!(broker.open_streams(), 1);
        broker
            .update_datapoints(&UpdateBatch::from([(
                "A.Pos".to_string(),
                DatapointValue::Float(1.0),
            )]))
            .unwrap();
        assert_eq!(broker.value("A.Pos"), Some(DatapointValue::Float(1.0)));
        assert_eq!(broker.updates().len(), 1);
    }

    #[test]
    fn fail_streams_ends_with_code() {
        let broker = MemoryBroker::new("mem");
        let ctx = broker.create_call_context();
        let mut reader = broker.open_subscribe_stream(&ctx, &paths());
        broker.fail_streams(StatusCode::Internal);
        match reader.read() {
            StreamItem::End(status) => assert_eq!(status.code, StatusCode::Internal),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(broker.open_streams(), 0);
    }

    #[test]
    fn cancelled_streams_release_their_slot() {
        let broker = MemoryBroker::new("mem");
        for _ in 0..5 {
            let ctx = broker.create_call_context();
            let reader = broker.open_subscribe_stream(&ctx, &paths());
            assert_eq!(broker.open_streams(), 1);
            ctx.cancel();
            drop(reader);
        }
        assert_eq!(broker.open_streams(), 0);
        assert_eq!(broker.stream_opens(), 5);
    }

    #[test]
    fn stream_on_cancelled_call_ends_at_once() {
        let broker = MemoryBroker::new("mem");
        broker.set_actuator_targets(UpdateBatch::from([(
            "A.Mode".to_string(),
            DatapointValue::String("WIPE".into()),
        )]));
        let ctx = broker.create_call_context();
        ctx.cancel();
        let mut reader = broker.open_subscribe_stream(&ctx, &paths());
        assert_eq!(reader.read(), StreamItem::End(StreamStatus::cancelled()));
        assert_eq!(broker.open_streams(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let broker = MemoryBroker::new("mem").with_history_capacity(16);
        for i in 0..100u32 {
            broker
                .update_datapoints(&UpdateBatch::from([(
                    "A.Frequency".to_string(),
                    DatapointValue::Uint32(i),
                )]))
                .unwrap();
        }
        let updates = broker.updates();
        assert_eq!(updates.len(), 16);
        assert_eq!(updates[0]["A.Frequency"], DatapointValue::Uint32(84));
        assert_eq!(broker.update_count(), 100);
        assert_eq!(broker.value("A.Frequency"), Some(DatapointValue::Uint32(99)));
    }

    #[test]
    fn wait_for_connected_honours_deadline() {
        let broker = MemoryBroker::new("mem");
        assert!(broker.wait_for_connected(Instant::now()));
        broker.set_available(false);
        let start = Instant::now();
        assert!(!broker.wait_for_connected(start + Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(broker.update_datapoints(&UpdateBatch::new()).is_err());
    }
}
