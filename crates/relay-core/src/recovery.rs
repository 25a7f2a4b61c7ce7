//! Subscribe-time synchronization between channel history and the live
//! publication flow.
//!
//! While a client subscribes to a channel with history, publications keep
//! arriving through the broker. [`PubSubSync`] buffers those until the client
//! has read history, then [`merge_publications`] combines both sources into
//! one gapless ordered list. A merge that cannot be proven gapless fails;
//! the caller must disconnect the client rather than deliver a guess.

use bytes::Bytes;
use relay_protocol::{Publication, StreamPosition};
use std::collections::HashMap;
use std::sync::Mutex;

/// A live publication captured while a subscribe was in progress, together
/// with its stream position and the frame already encoded for fan-out.
#[derive(Debug, Clone)]
pub struct BufferedPub {
    pub publication: Publication,
    pub sp: StreamPosition,
    pub prepared: Bytes,
}

#[derive(Default)]
struct ChannelBuffer {
    items: Vec<BufferedPub>,
}

/// Per-client buffering of live publications during channel subscribe.
#[derive(Default)]
pub struct PubSubSync {
    channels: Mutex<HashMap<String, ChannelBuffer>>,
}

impl PubSubSync {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChannelBuffer>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start buffering live publications for a channel.
    pub fn start_buffering(&self, channel: &str) {
        self.lock()
            .insert(channel.to_string(), ChannelBuffer::default());
    }

    /// Route a live publication: buffered when a subscribe is in flight for
    /// the channel, otherwise handed to `deliver`.
    pub fn sync_publication(
        &self,
        channel: &str,
        item: BufferedPub,
        deliver: impl FnOnce(BufferedPub),
    ) {
        {
            let mut channels = self.lock();
            if let Some(buffer) = channels.get_mut(channel) {
                buffer.items.push(item);
                return;
            }
        }
        deliver(item);
    }

    /// Drain publications buffered so far without stopping buffering. Used
    /// between reading history and merging, so nothing slips past the merge.
    #[must_use]
    pub fn read_buffered(&self, channel: &str) -> Vec<BufferedPub> {
        let mut channels = self.lock();
        match channels.get_mut(channel) {
            Some(buffer) => std::mem::take(&mut buffer.items),
            None => Vec::new(),
        }
    }

    /// Stop buffering and return anything captured since the last
    /// [`read_buffered`](Self::read_buffered) call.
    #[must_use]
    pub fn stop_buffering(&self, channel: &str) -> Vec<BufferedPub> {
        let mut channels = self.lock();
        match channels.remove(channel) {
            Some(buffer) => buffer.items,
            None => Vec::new(),
        }
    }

    /// Drop buffering state for all channels. Called on client close.
    pub fn release(&self) {
        self.lock().clear();
    }
}

/// Decide whether history read at subscribe time fully covers the gap
/// between the position a client claims and the current stream top.
///
/// An epoch mismatch always fails: the stream was recreated and offsets are
/// not comparable across incarnations.
#[must_use]
pub fn is_stream_recovered(
    publications: &[Publication],
    stream_top: &StreamPosition,
    since: &StreamPosition,
) -> bool {
    if stream_top.epoch != since.epoch {
        return false;
    }
    match (publications.first(), publications.last()) {
        (None, _) => stream_top.offset == since.offset,
        (Some(first), Some(last)) => {
            first.offset == since.offset + 1 && last.offset == stream_top.offset
        }
        _ => false,
    }
}

/// Merge recovered history with publications buffered during subscribe into
/// one ordered, deduplicated, gapless list.
///
/// Returns `None` when a gap remains between consecutive offsets: the merge
/// would silently lose data, so the subscribe attempt must fail instead. On
/// success also returns the highest merged offset (0 when both inputs were
/// empty).
#[must_use]
pub fn merge_publications(
    recovered: Vec<Publication>,
    buffered: Vec<Publication>,
) -> Option<(Vec<Publication>, u64)> {
    let mut merged: Vec<Publication> = recovered;
    merged.extend(buffered);
    merged.sort_by_key(|p| p.offset);
    merged.dedup_by_key(|p| p.offset);

    let mut max_seen = 0;
    for publication in &merged {
        if max_seen > 0 && publication.offset != max_seen + 1 {
            return None;
        }
        max_seen = publication.offset;
    }
    Some((merged, max_seen))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pubs(offsets: &[u64]) -> Vec<Publication> {
        offsets
            .iter()
            .map(|&offset| Publication {
                offset,
                ..Default::default()
            })
            .collect()
    }

    fn buffered(offset: u64) -> BufferedPub {
        BufferedPub {
            publication: Publication {
                offset,
                ..Default::default()
            },
            sp: StreamPosition::new(offset, "e1"),
            prepared: Bytes::new(),
        }
    }

    #[test]
    fn test_recovered_empty_history_same_offset() {
        let top = StreamPosition::new(7, "e1");
        let since = StreamPosition::new(7, "e1");
        assert!(is_stream_recovered(&[], &top, &since));
        assert!(!is_stream_recovered(
            &[],
            &top,
            &StreamPosition::new(6, "e1")
        ));
    }

    #[test]
    fn test_recovered_contiguous_range() {
        let top = StreamPosition::new(10, "e1");
        let since = StreamPosition::new(7, "e1");
        assert!(is_stream_recovered(&pubs(&[8, 9, 10]), &top, &since));
        // Missing the head of the gap.
        assert!(!is_stream_recovered(&pubs(&[9, 10]), &top, &since));
        // Missing the tail.
        assert!(!is_stream_recovered(&pubs(&[8, 9]), &top, &since));
    }

    #[test]
    fn test_epoch_mismatch_never_recovers() {
        let top = StreamPosition::new(7, "e2");
        let since = StreamPosition::new(7, "e1");
        assert!(!is_stream_recovered(&[], &top, &since));
    }

    #[test]
    fn test_merge_dedup_and_order() {
        let (merged, max_seen) =
            merge_publications(pubs(&[3, 4, 5]), pubs(&[5, 6])).unwrap();
        assert_eq!(merged.iter().map(|p| p.offset).collect::<Vec<_>>(), [3, 4, 5, 6]);
        assert_eq!(max_seen, 6);
    }

    #[test]
    fn test_merge_gap_is_fatal() {
        assert!(merge_publications(pubs(&[3, 4]), pubs(&[6, 7])).is_none());
    }

    #[test]
    fn test_merge_empty() {
        let (merged, max_seen) = merge_publications(Vec::new(), Vec::new()).unwrap();
        assert!(merged.is_empty());
        assert_eq!(max_seen, 0);
    }

    #[test]
    fn test_sync_buffers_while_subscribing() {
        let sync = PubSubSync::new();
        sync.start_buffering("news");

        let mut delivered = Vec::new();
        sync.sync_publication("news", buffered(1), |item| delivered.push(item));
        assert!(delivered.is_empty());

        let first = sync.read_buffered("news");
        assert_eq!(first.len(), 1);

        // Still buffering after a read.
        sync.sync_publication("news", buffered(2), |item| delivered.push(item));
        let rest = sync.stop_buffering("news");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].publication.offset, 2);

        // After stop everything goes straight through.
        sync.sync_publication("news", buffered(3), |item| delivered.push(item));
        assert_eq!(delivered.len(), 1);
    }
}
