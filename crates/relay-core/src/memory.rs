//! In-memory broker.
//!
//! Keeps channel history in a [`StreamStore`], deduplicates idempotent
//! publishes through a TTL cache, and dispatches events straight to the
//! registered handler. PUB/SUB is process-local, so `subscribe` and
//! `unsubscribe` are bookkeeping no-ops.

use crate::broker::{Broker, BrokerError, BrokerEventHandler, HistoryFilter, PublishOptions};
use crate::stream::{StreamStore, VersionHint};
use dashmap::DashMap;
use relay_protocol::{unix_time_ms, ClientInfo, Publication, StreamPosition};
use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BinaryHeap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

const NUM_PUBLISH_LOCKS: usize = 128;

/// Cached idempotent publish results with heap-based TTL expiry. Kept behind
/// its own lock so cache contention never stalls history appends.
#[derive(Default)]
struct ResultCache {
    entries: HashMap<String, (StreamPosition, Instant)>,
    deadlines: BinaryHeap<Reverse<(Instant, String)>>,
}

impl ResultCache {
    fn get(&self, key: &str) -> Option<StreamPosition> {
        let (sp, deadline) = self.entries.get(key)?;
        if *deadline <= Instant::now() {
            return None;
        }
        Some(sp.clone())
    }

    fn set(&mut self, key: &str, sp: StreamPosition, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        self.entries.insert(key.to_string(), (sp, deadline));
        self.deadlines.push(Reverse((deadline, key.to_string())));
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((deadline, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, key))) = self.deadlines.pop() else {
                break;
            };
            if self.entries.get(&key).is_some_and(|(_, d)| *d <= now) {
                self.entries.remove(&key);
            }
        }
    }
}

/// Options for the in-memory broker, normally derived from node config.
#[derive(Debug, Clone)]
pub struct MemoryBrokerOptions {
    /// Default stream metadata retention.
    pub history_meta_ttl: Duration,
    /// Default idempotent publish result retention.
    pub idempotent_result_ttl: Duration,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            history_meta_ttl: Duration::from_secs(30 * 24 * 3600),
            idempotent_result_ttl: Duration::from_secs(300),
        }
    }
}

/// Broker implementation backed by process memory.
pub struct MemoryBroker {
    options: MemoryBrokerOptions,
    streams: Arc<StreamStore>,
    results: Arc<Mutex<ResultCache>>,
    prev_pubs: DashMap<String, Publication>,
    // Hashed-bucket locks serializing append + dispatch per channel.
    publish_locks: Vec<Mutex<()>>,
    handler: RwLock<Option<Arc<dyn BrokerEventHandler>>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new(options: MemoryBrokerOptions) -> Self {
        Self {
            options,
            streams: Arc::new(StreamStore::new()),
            results: Arc::new(Mutex::new(ResultCache::default())),
            prev_pubs: DashMap::new(),
            publish_locks: (0..NUM_PUBLISH_LOCKS).map(|_| Mutex::new(())).collect(),
            handler: RwLock::new(None),
        }
    }

    fn publish_lock(&self, channel: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        channel.hash(&mut hasher);
        &self.publish_locks[(hasher.finish() as usize) % NUM_PUBLISH_LOCKS]
    }

    fn current_handler(&self) -> Result<Arc<dyn BrokerEventHandler>, BrokerError> {
        let guard = match self.handler.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(BrokerError::NotRunning)
    }

    fn lock_results(&self) -> std::sync::MutexGuard<'_, ResultCache> {
        match self.results.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn meta_ttl(&self, override_ttl: Option<Duration>) -> Duration {
        override_ttl.unwrap_or(self.options.history_meta_ttl)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerOptions::default())
    }
}

impl Broker for MemoryBroker {
    fn run(&self, handler: Arc<dyn BrokerEventHandler>) -> Result<(), BrokerError> {
        {
            let mut guard = match self.handler.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(handler);
        }
        // Periodic amortized expiry of stream TTLs and idempotency results.
        let streams = Arc::clone(&self.streams);
        let results = Arc::clone(&self.results);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                streams.sweep();
                match results.lock() {
                    Ok(mut cache) => cache.sweep(),
                    Err(poisoned) => poisoned.into_inner().sweep(),
                }
            }
        });
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        debug!(channel = %channel, "broker subscribe");
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        debug!(channel = %channel, "broker unsubscribe");
        Ok(())
    }

    fn publish(
        &self,
        channel: &str,
        data: &[u8],
        opts: &PublishOptions,
    ) -> Result<(StreamPosition, bool), BrokerError> {
        let handler = self.current_handler()?;

        if let Some(key) = &opts.idempotency_key {
            if let Some(sp) = self.lock_results().get(key) {
                return Ok((sp, true));
            }
        }

        let sp;
        {
            // Append-then-deliver must be atomic relative to other publishes
            // on the same channel.
            let guard = self.publish_lock(channel).lock();
            let _guard = match guard {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };

            let mut publication = Publication {
                offset: 0,
                data: data.to_vec(),
                info: opts.client_info.clone(),
                tags: opts.tags.clone(),
                time_ms: unix_time_ms(),
                channel: None,
            };

            if opts.history_size > 0 && !opts.history_ttl.is_zero() {
                let hint = (opts.version > 0).then(|| VersionHint {
                    version: opts.version,
                    epoch: opts.version_epoch.clone(),
                });
                let (position, appended) = self.streams.add(
                    channel,
                    publication.clone(),
                    opts.history_size,
                    opts.history_ttl,
                    self.meta_ttl(opts.history_meta_ttl),
                    hint.as_ref(),
                );
                if !appended {
                    // A newer or equal version already reached the stream;
                    // skip delivery to avoid reordering full-state updates.
                    return Ok((position, false));
                }
                publication.offset = position.offset;
                sp = position;
            } else {
                sp = StreamPosition::default();
            }

            let prev_pub = if opts.use_delta {
                self.prev_pubs
                    .insert(channel.to_string(), publication.clone())
            } else {
                self.prev_pubs.remove(channel);
                None
            };

            handler.handle_publication(channel, publication, sp.clone(), prev_pub);
        }

        if let Some(key) = &opts.idempotency_key {
            let ttl = opts
                .idempotent_result_ttl
                .unwrap_or(self.options.idempotent_result_ttl);
            self.lock_results().set(key, sp.clone(), ttl);
        }

        Ok((sp, false))
    }

    fn publish_join(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError> {
        self.current_handler()?.handle_join(channel, info.clone());
        Ok(())
    }

    fn publish_leave(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError> {
        self.current_handler()?.handle_leave(channel, info.clone());
        Ok(())
    }

    fn history(
        &self,
        channel: &str,
        filter: &HistoryFilter,
        meta_ttl: Option<Duration>,
    ) -> Result<(Vec<Publication>, StreamPosition), BrokerError> {
        let since = filter.since.as_ref().map(|sp| sp.offset);
        Ok(self.streams.get(
            channel,
            since,
            filter.limit,
            filter.reverse,
            self.meta_ttl(meta_ttl),
        ))
    }

    fn remove_history(&self, channel: &str) -> Result<(), BrokerError> {
        self.streams.clear(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        publications: StdMutex<Vec<(String, Publication, StreamPosition, Option<Publication>)>>,
        joins: StdMutex<Vec<String>>,
    }

    impl BrokerEventHandler for RecordingHandler {
        fn handle_publication(
            &self,
            channel: &str,
            publication: Publication,
            sp: StreamPosition,
            prev_pub: Option<Publication>,
        ) {
            self.publications.lock().unwrap().push((
                channel.to_string(),
                publication,
                sp,
                prev_pub,
            ));
        }

        fn handle_join(&self, channel: &str, _info: ClientInfo) {
            self.joins.lock().unwrap().push(channel.to_string());
        }

        fn handle_leave(&self, _channel: &str, _info: ClientInfo) {}
    }

    fn history_opts() -> PublishOptions {
        PublishOptions {
            history_size: 10,
            history_ttl: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_appends_and_dispatches() {
        let broker = MemoryBroker::default();
        let handler = Arc::new(RecordingHandler::default());
        broker.run(handler.clone()).unwrap();

        let (sp1, deduped) = broker.publish("news", b"one", &history_opts()).unwrap();
        assert!(!deduped);
        assert_eq!(sp1.offset, 1);
        let (sp2, _) = broker.publish("news", b"two", &history_opts()).unwrap();
        assert_eq!(sp2.offset, 2);
        assert_eq!(sp1.epoch, sp2.epoch);

        let events = handler.publications.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1.offset, 1);
        assert_eq!(events[1].1.offset, 2);
    }

    #[tokio::test]
    async fn test_publish_without_history_has_zero_offset() {
        let broker = MemoryBroker::default();
        let handler = Arc::new(RecordingHandler::default());
        broker.run(handler.clone()).unwrap();

        let (sp, _) = broker
            .publish("ephemeral", b"x", &PublishOptions::default())
            .unwrap();
        assert_eq!(sp.offset, 0);
        assert_eq!(handler.publications.lock().unwrap()[0].1.offset, 0);
    }

    #[tokio::test]
    async fn test_idempotent_publish_single_append() {
        let broker = MemoryBroker::default();
        let handler = Arc::new(RecordingHandler::default());
        broker.run(handler.clone()).unwrap();

        let opts = PublishOptions {
            idempotency_key: Some("key-1".into()),
            ..history_opts()
        };
        let (sp1, deduped1) = broker.publish("news", b"payload", &opts).unwrap();
        let (sp2, deduped2) = broker.publish("news", b"payload", &opts).unwrap();

        assert!(!deduped1);
        assert!(deduped2);
        assert_eq!(sp1, sp2);
        // Only one append and one delivery happened.
        assert_eq!(handler.publications.lock().unwrap().len(), 1);
        let (pubs, _) = broker
            .history("news", &HistoryFilter { limit: -1, ..Default::default() }, None)
            .unwrap();
        assert_eq!(pubs.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_fails_without_handler() {
        let broker = MemoryBroker::default();
        let err = broker
            .publish("news", b"x", &PublishOptions::default())
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotRunning));
    }

    #[tokio::test]
    async fn test_delta_prev_pub_cache() {
        let broker = MemoryBroker::default();
        let handler = Arc::new(RecordingHandler::default());
        broker.run(handler.clone()).unwrap();

        let opts = PublishOptions {
            use_delta: true,
            ..history_opts()
        };
        broker.publish("doc", b"v1", &opts).unwrap();
        broker.publish("doc", b"v2", &opts).unwrap();

        let events = handler.publications.lock().unwrap();
        assert!(events[0].3.is_none());
        assert_eq!(events[1].3.as_ref().unwrap().data, b"v1".to_vec());
    }

    #[tokio::test]
    async fn test_history_since_and_top() {
        let broker = MemoryBroker::default();
        broker.run(Arc::new(RecordingHandler::default())).unwrap();
        for i in 0..5u8 {
            broker.publish("news", &[i], &history_opts()).unwrap();
        }

        let filter = HistoryFilter {
            limit: -1,
            since: Some(StreamPosition::new(3, "")),
            reverse: false,
        };
        let (pubs, sp) = broker.history("news", &filter, None).unwrap();
        assert_eq!(pubs.iter().map(|p| p.offset).collect::<Vec<_>>(), [4, 5]);
        assert_eq!(sp.offset, 5);
    }

    #[tokio::test]
    async fn test_join_events_reach_handler() {
        let broker = MemoryBroker::default();
        let handler = Arc::new(RecordingHandler::default());
        broker.run(handler.clone()).unwrap();
        broker
            .publish_join("chat", &ClientInfo::default())
            .unwrap();
        assert_eq!(handler.joins.lock().unwrap().as_slice(), ["chat"]);
    }
}
