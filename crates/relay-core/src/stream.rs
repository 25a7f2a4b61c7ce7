//! Per-channel bounded publication streams with offset/epoch identity.
//!
//! Each channel owns an append-only buffer capped at a per-publish maximum
//! size. Offsets start at 1 and increase strictly by one per append, even
//! when old entries are trimmed. The `epoch` names one incarnation of the
//! stream: it is minted when the channel stream is first created and again
//! after full metadata expiry, which is how a recovering client detects an
//! unrecoverable gap rather than a simple continuation.
//!
//! Payload TTL and metadata TTL are independent: payloads expire first while
//! offset/epoch bookkeeping lives longer, so positioning and gap detection
//! keep working slightly beyond payload retention.

use relay_protocol::{Publication, StreamPosition};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

static EPOCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint an opaque epoch identifier for a new stream incarnation.
fn mint_epoch() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = EPOCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}.{:x}", nanos, seq)
}

/// External monotonic version attached to a publication, letting a publisher
/// skip the append when a newer or equal version was already written. Used
/// to avoid reordering full-state publications.
#[derive(Debug, Clone)]
pub struct VersionHint {
    pub version: u64,
    pub epoch: String,
}

struct StreamItem {
    buf: VecDeque<Publication>,
    top_offset: u64,
    epoch: String,
    last_version: u64,
    last_version_epoch: String,
    payload_deadline: Option<Instant>,
    meta_deadline: Instant,
}

impl StreamItem {
    fn new(meta_ttl: Duration) -> Self {
        Self {
            buf: VecDeque::new(),
            top_offset: 0,
            epoch: mint_epoch(),
            last_version: 0,
            last_version_epoch: String::new(),
            payload_deadline: None,
            meta_deadline: Instant::now() + meta_ttl,
        }
    }

    fn position(&self) -> StreamPosition {
        StreamPosition::new(self.top_offset, self.epoch.clone())
    }
}

#[derive(Default)]
struct StreamInner {
    items: HashMap<String, StreamItem>,
    // Min-heaps keyed by expiry time so sweeps avoid O(n) scans.
    payload_heap: BinaryHeap<Reverse<(Instant, String)>>,
    meta_heap: BinaryHeap<Reverse<(Instant, String)>>,
}

impl StreamInner {
    /// Get a live stream item, creating it (and minting an epoch) when absent
    /// or when its metadata already expired.
    fn ensure(&mut self, channel: &str, meta_ttl: Duration) -> &mut StreamItem {
        let now = Instant::now();
        let expired = self
            .items
            .get(channel)
            .is_some_and(|item| item.meta_deadline <= now);
        if expired {
            self.items.remove(channel);
        }
        if !self.items.contains_key(channel) {
            trace!(channel = %channel, "creating stream incarnation");
            self.meta_heap
                .push(Reverse((now + meta_ttl, channel.to_string())));
        }
        self.items
            .entry(channel.to_string())
            .or_insert_with(|| StreamItem::new(meta_ttl))
    }
}

/// In-memory store for all channel streams. One exclusive lock per store.
#[derive(Default)]
pub struct StreamStore {
    inner: Mutex<StreamInner>,
}

impl StreamStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a publication to a channel stream.
    ///
    /// Returns the assigned position and whether an append actually happened:
    /// with a `hint` whose version is not newer than the last appended one,
    /// the existing top position is returned with `appended == false`.
    pub fn add(
        &self,
        channel: &str,
        mut publication: Publication,
        max_size: usize,
        ttl: Duration,
        meta_ttl: Duration,
        hint: Option<&VersionHint>,
    ) -> (StreamPosition, bool) {
        let mut inner = self.lock();
        let item = inner.ensure(channel, meta_ttl);

        if let Some(hint) = hint {
            if hint.version > 0 {
                let same_epoch = item.last_version_epoch == hint.epoch;
                if same_epoch && item.last_version >= hint.version {
                    return (item.position(), false);
                }
                item.last_version = hint.version;
                item.last_version_epoch = hint.epoch.clone();
            }
        }

        item.top_offset += 1;
        publication.offset = item.top_offset;
        item.buf.push_back(publication);
        while max_size > 0 && item.buf.len() > max_size {
            item.buf.pop_front();
        }

        let now = Instant::now();
        item.payload_deadline = Some(now + ttl);
        item.meta_deadline = now + meta_ttl;
        let position = item.position();

        inner
            .payload_heap
            .push(Reverse((now + ttl, channel.to_string())));
        inner
            .meta_heap
            .push(Reverse((now + meta_ttl, channel.to_string())));

        (position, true)
    }

    /// Read publications from a channel stream.
    ///
    /// `since_offset` is exclusive; `limit < 0` means no limit, `limit == 0`
    /// returns only the current position. `reverse` iterates from the stream
    /// end backwards.
    pub fn get(
        &self,
        channel: &str,
        since_offset: Option<u64>,
        limit: i32,
        reverse: bool,
        meta_ttl: Duration,
    ) -> (Vec<Publication>, StreamPosition) {
        let mut inner = self.lock();
        let item = inner.ensure(channel, meta_ttl);
        let position = item.position();

        if limit == 0 {
            return (Vec::new(), position);
        }

        let take = if limit < 0 {
            usize::MAX
        } else {
            limit as usize
        };

        let matches = |p: &Publication| since_offset.map_or(true, |since| p.offset > since);
        let pubs: Vec<Publication> = if reverse {
            item.buf
                .iter()
                .rev()
                .filter(|p| matches(p))
                .take(take)
                .cloned()
                .collect()
        } else {
            item.buf
                .iter()
                .filter(|p| matches(p))
                .take(take)
                .cloned()
                .collect()
        };

        (pubs, position)
    }

    /// Current top position of a channel stream, creating the stream
    /// metadata (with a fresh epoch) when absent.
    pub fn top_position(&self, channel: &str, meta_ttl: Duration) -> StreamPosition {
        let mut inner = self.lock();
        inner.ensure(channel, meta_ttl).position()
    }

    /// Drop a channel's retained payloads while keeping offset/epoch
    /// bookkeeping intact.
    pub fn clear(&self, channel: &str) {
        let mut inner = self.lock();
        if let Some(item) = inner.items.get_mut(channel) {
            item.buf.clear();
            item.payload_deadline = None;
        }
    }

    /// Expire due payloads and metadata. Amortized over heap entries; stale
    /// heap entries (superseded by later appends) are skipped by re-checking
    /// the item's current deadline.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.lock();

        while let Some(Reverse((deadline, _))) = inner.payload_heap.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, channel))) = inner.payload_heap.pop() else {
                break;
            };
            if let Some(item) = inner.items.get_mut(&channel) {
                if item.payload_deadline.is_some_and(|d| d <= now) {
                    trace!(channel = %channel, "stream payload expired");
                    item.buf.clear();
                    item.payload_deadline = None;
                }
            }
        }

        while let Some(Reverse((deadline, _))) = inner.meta_heap.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, channel))) = inner.meta_heap.pop() else {
                break;
            };
            let expired = inner
                .items
                .get(&channel)
                .is_some_and(|item| item.meta_deadline <= now);
            if expired {
                trace!(channel = %channel, "stream metadata expired");
                inner.items.remove(&channel);
            }
        }
    }

    /// Number of live channel streams.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.lock().items.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);
    const META_TTL: Duration = Duration::from_secs(120);

    fn add_one(store: &StreamStore, channel: &str, data: &[u8]) -> StreamPosition {
        let (sp, appended) =
            store.add(channel, Publication::new(data.to_vec()), 10, TTL, META_TTL, None);
        assert!(appended);
        sp
    }

    #[test]
    fn test_offsets_increase_strictly() {
        let store = StreamStore::new();
        let sp1 = add_one(&store, "news", b"a");
        let sp2 = add_one(&store, "news", b"b");
        let sp3 = add_one(&store, "news", b"c");
        assert_eq!(sp1.offset, 1);
        assert_eq!(sp2.offset, 2);
        assert_eq!(sp3.offset, 3);
        assert_eq!(sp1.epoch, sp3.epoch);
    }

    #[test]
    fn test_offsets_survive_trimming() {
        let store = StreamStore::new();
        for i in 0..5u8 {
            store.add(
                "news",
                Publication::new(vec![i]),
                2,
                TTL,
                META_TTL,
                None,
            );
        }
        let (pubs, sp) = store.get("news", None, -1, false, META_TTL);
        assert_eq!(sp.offset, 5);
        assert_eq!(pubs.len(), 2);
        assert_eq!(pubs[0].offset, 4);
        assert_eq!(pubs[1].offset, 5);
    }

    #[test]
    fn test_get_since_exclusive() {
        let store = StreamStore::new();
        for i in 0..4u8 {
            add_one(&store, "news", &[i]);
        }
        let (pubs, sp) = store.get("news", Some(2), -1, false, META_TTL);
        assert_eq!(sp.offset, 4);
        assert_eq!(pubs.iter().map(|p| p.offset).collect::<Vec<_>>(), [3, 4]);
    }

    #[test]
    fn test_get_reverse_with_limit() {
        let store = StreamStore::new();
        for i in 0..4u8 {
            add_one(&store, "news", &[i]);
        }
        let (pubs, _) = store.get("news", None, 2, true, META_TTL);
        assert_eq!(pubs.iter().map(|p| p.offset).collect::<Vec<_>>(), [4, 3]);
    }

    #[test]
    fn test_version_hint_skips_stale() {
        let store = StreamStore::new();
        let hint_v2 = VersionHint {
            version: 2,
            epoch: "v".into(),
        };
        let (sp, appended) = store.add(
            "state",
            Publication::new(b"v2".to_vec()),
            10,
            TTL,
            META_TTL,
            Some(&hint_v2),
        );
        assert!(appended);
        assert_eq!(sp.offset, 1);

        // An older version for the same version-epoch must be skipped.
        let hint_v1 = VersionHint {
            version: 1,
            epoch: "v".into(),
        };
        let (sp, appended) = store.add(
            "state",
            Publication::new(b"v1".to_vec()),
            10,
            TTL,
            META_TTL,
            Some(&hint_v1),
        );
        assert!(!appended);
        assert_eq!(sp.offset, 1);

        // A newer version appends normally.
        let hint_v3 = VersionHint {
            version: 3,
            epoch: "v".into(),
        };
        let (sp, appended) = store.add(
            "state",
            Publication::new(b"v3".to_vec()),
            10,
            TTL,
            META_TTL,
            Some(&hint_v3),
        );
        assert!(appended);
        assert_eq!(sp.offset, 2);
    }

    #[test]
    fn test_clear_keeps_position() {
        let store = StreamStore::new();
        add_one(&store, "news", b"a");
        add_one(&store, "news", b"b");
        let before = store.top_position("news", META_TTL);
        store.clear("news");
        let (pubs, sp) = store.get("news", None, -1, false, META_TTL);
        assert!(pubs.is_empty());
        assert_eq!(sp, before);
        // Appends continue from the same offset sequence.
        let sp = add_one(&store, "news", b"c");
        assert_eq!(sp.offset, 3);
    }

    #[test]
    fn test_meta_expiry_mints_new_epoch() {
        let store = StreamStore::new();
        let (sp1, _) = store.add(
            "news",
            Publication::new(b"a".to_vec()),
            10,
            Duration::from_millis(0),
            Duration::from_millis(0),
            None,
        );
        std::thread::sleep(Duration::from_millis(5));
        store.sweep();
        let sp2 = store.top_position("news", META_TTL);
        assert_ne!(sp1.epoch, sp2.epoch);
        assert_eq!(sp2.offset, 0);
    }

    #[test]
    fn test_payload_expiry_keeps_meta() {
        let store = StreamStore::new();
        store.add(
            "news",
            Publication::new(b"a".to_vec()),
            10,
            Duration::from_millis(0),
            META_TTL,
            None,
        );
        std::thread::sleep(Duration::from_millis(5));
        store.sweep();
        let (pubs, sp) = store.get("news", None, -1, false, META_TTL);
        assert!(pubs.is_empty());
        assert_eq!(sp.offset, 1);
    }

    #[test]
    fn test_top_position_mints_epoch_without_publications() {
        let store = StreamStore::new();
        let sp = store.top_position("fresh", META_TTL);
        assert_eq!(sp.offset, 0);
        assert!(!sp.epoch.is_empty());
        // Stable across repeated queries.
        assert_eq!(store.top_position("fresh", META_TTL), sp);
    }
}
