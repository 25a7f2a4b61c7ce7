//! Optional per-channel delivery layer between broker events and hub fan-out.
//!
//! A [`ChannelMedium`] exists for a channel only while it has local
//! subscribers and only when its options enable at least one feature:
//! keeping the latest publication, shared position verification, or a
//! dedicated delivery queue with optional broadcast coalescing.

use crate::hub::Hub;
use relay_protocol::{Publication, StreamPosition};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Sentinel offset broadcast to force subscribers into resync.
pub const INSUFFICIENT_STATE_OFFSET: u64 = u64::MAX;

/// Per-channel medium behavior. All disabled means no medium is created.
#[derive(Debug, Clone, Default)]
pub struct ChannelMediumOptions {
    /// Cache the most recent publication of the channel.
    pub keep_latest_publication: bool,
    /// Verify stream position once per interval for all subscribers instead
    /// of per client.
    pub shared_position_sync: bool,
    /// Deliver through a dedicated queue task instead of synchronously.
    pub enable_queue: bool,
    /// Queue byte budget; 0 means unlimited. Only meaningful with
    /// `enable_queue`.
    pub max_queue_size: usize,
    /// Coalesce queued publications, keeping only the newest one per
    /// interval. Incompatible with recovery and positioning since
    /// intermediate offsets are never delivered.
    pub broadcast_delay: Duration,
}

impl ChannelMediumOptions {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.keep_latest_publication
            || self.shared_position_sync
            || self.enable_queue
            || !self.broadcast_delay.is_zero()
    }
}

struct QueuedPub {
    publication: Publication,
    sp: StreamPosition,
    prev_pub: Option<Publication>,
    size: usize,
}

struct MediumState {
    latest_publication: Option<(Publication, StreamPosition)>,
    // Highest stream position seen through this medium, compared against the
    // broker top during shared position checks.
    top_seen: Option<StreamPosition>,
    last_position_check: Option<Instant>,
    queue: VecDeque<QueuedPub>,
    queued_bytes: usize,
    queue_closed: bool,
}

/// Delivery layer of one channel.
pub struct ChannelMedium {
    channel: String,
    options: ChannelMediumOptions,
    hub: Arc<Hub>,
    state: Mutex<MediumState>,
    queue_wake: Notify,
}

impl ChannelMedium {
    #[must_use]
    pub fn new(channel: &str, options: ChannelMediumOptions, hub: Arc<Hub>) -> Arc<Self> {
        let medium = Arc::new(Self {
            channel: channel.to_string(),
            options,
            hub,
            state: Mutex::new(MediumState {
                latest_publication: None,
                top_seen: None,
                last_position_check: None,
                queue: VecDeque::new(),
                queued_bytes: 0,
                queue_closed: false,
            }),
            queue_wake: Notify::new(),
        });
        if medium.options.enable_queue {
            let worker = Arc::clone(&medium);
            tokio::spawn(async move { worker.run_queue().await });
        }
        medium
    }

    fn lock(&self) -> MutexGuard<'_, MediumState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Route a publication through the medium.
    pub fn broadcast_publication(
        &self,
        publication: &Publication,
        sp: &StreamPosition,
        prev_pub: Option<&Publication>,
    ) {
        {
            let mut state = self.lock();
            if self.options.keep_latest_publication && sp.offset != INSUFFICIENT_STATE_OFFSET {
                state.latest_publication = Some((publication.clone(), sp.clone()));
            }
            if sp.offset != INSUFFICIENT_STATE_OFFSET {
                let advanced = state
                    .top_seen
                    .as_ref()
                    .map_or(true, |seen| sp.offset > seen.offset);
                if advanced {
                    state.top_seen = Some(sp.clone());
                }
            }
        }

        if !self.options.enable_queue {
            self.hub
                .broadcast_publication(&self.channel, publication, sp, prev_pub);
            return;
        }

        let size = publication.data.len();
        {
            let mut state = self.lock();
            if state.queue_closed {
                debug!(channel = %self.channel, "medium queue closed");
                return;
            }
            if self.options.max_queue_size > 0 {
                // Over budget: evict from the head. The newest publication
                // is the one subscribers must eventually see; positioned
                // subscribers resync through position checks.
                while !state.queue.is_empty()
                    && state.queued_bytes + size > self.options.max_queue_size
                {
                    if let Some(oldest) = state.queue.pop_front() {
                        state.queued_bytes = state.queued_bytes.saturating_sub(oldest.size);
                        warn!(channel = %self.channel, offset = oldest.sp.offset, "medium queue full, dropping oldest publication");
                    }
                }
            }
            state.queued_bytes += size;
            state.queue.push_back(QueuedPub {
                publication: publication.clone(),
                sp: sp.clone(),
                prev_pub: prev_pub.cloned(),
                size,
            });
        }
        self.queue_wake.notify_one();
    }

    /// The most recent publication seen on the channel, when caching is
    /// enabled.
    #[must_use]
    pub fn latest_publication(&self) -> Option<(Publication, StreamPosition)> {
        self.lock().latest_publication.clone()
    }

    /// Shared, throttled stream position verification.
    ///
    /// At most one verification per `delay` actually runs; skipped calls
    /// report success. `fetch_top` reads the broker's current position; when
    /// it lags behind what the medium has already delivered nothing is wrong,
    /// but a broker top ahead of everything seen here means local subscribers
    /// missed data; the insufficient-state sentinel is broadcast so each of
    /// them resyncs, and the call reports failure.
    pub fn check_position(
        &self,
        delay: Duration,
        fetch_top: impl FnOnce() -> Option<StreamPosition>,
    ) -> bool {
        {
            let mut state = self.lock();
            let now = Instant::now();
            if state
                .last_position_check
                .is_some_and(|last| now.duration_since(last) < delay)
            {
                return true;
            }
            state.last_position_check = Some(now);
        }

        let Some(top) = fetch_top() else {
            return true;
        };

        let in_sync = {
            let mut state = self.lock();
            match &state.top_seen {
                Some(seen) => seen.epoch == top.epoch && seen.offset >= top.offset,
                None => {
                    state.top_seen = Some(top.clone());
                    true
                }
            }
        };
        if !in_sync {
            warn!(channel = %self.channel, offset = top.offset, "medium position check failed");
            self.broadcast_insufficient_state();
        }
        in_sync
    }

    fn broadcast_insufficient_state(&self) {
        let sentinel = StreamPosition::new(INSUFFICIENT_STATE_OFFSET, "");
        let publication = Publication {
            offset: INSUFFICIENT_STATE_OFFSET,
            ..Default::default()
        };
        self.hub
            .broadcast_publication(&self.channel, &publication, &sentinel, None);
    }

    /// Queue worker. Without a broadcast delay items pass through in order;
    /// with one, everything queued during the interval collapses into the
    /// newest publication.
    async fn run_queue(self: Arc<Self>) {
        loop {
            let mut item = loop {
                {
                    let mut state = self.lock();
                    if let Some(item) = state.queue.pop_front() {
                        state.queued_bytes = state.queued_bytes.saturating_sub(item.size);
                        break item;
                    }
                    if state.queue_closed {
                        debug!(channel = %self.channel, "medium queue worker stopped");
                        return;
                    }
                }
                self.queue_wake.notified().await;
            };
            if !self.options.broadcast_delay.is_zero() {
                tokio::time::sleep(self.options.broadcast_delay).await;
                let mut state = self.lock();
                while let Some(next) = state.queue.pop_front() {
                    state.queued_bytes = state.queued_bytes.saturating_sub(next.size);
                    item = next;
                }
            }
            self.hub.broadcast_publication(
                &self.channel,
                &item.publication,
                &item.sp,
                item.prev_pub.as_ref(),
            );
        }
    }

    /// Stop the queue worker. Called when the channel loses its last local
    /// subscriber; anything still queued is delivered first.
    pub fn close(&self) {
        self.lock().queue_closed = true;
        self.queue_wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn medium(options: ChannelMediumOptions) -> Arc<ChannelMedium> {
        ChannelMedium::new("news", options, Arc::new(Hub::new()))
    }

    fn publication(offset: u64) -> (Publication, StreamPosition) {
        (
            Publication {
                offset,
                data: b"x".to_vec(),
                ..Default::default()
            },
            StreamPosition::new(offset, "e1"),
        )
    }

    #[tokio::test]
    async fn test_keep_latest_publication() {
        let medium = medium(ChannelMediumOptions {
            keep_latest_publication: true,
            ..Default::default()
        });
        assert!(medium.latest_publication().is_none());
        let (p1, sp1) = publication(1);
        let (p2, sp2) = publication(2);
        medium.broadcast_publication(&p1, &sp1, None);
        medium.broadcast_publication(&p2, &sp2, None);
        let (latest, sp) = medium.latest_publication().unwrap();
        assert_eq!(latest.offset, 2);
        assert_eq!(sp.offset, 2);
    }

    #[tokio::test]
    async fn test_check_position_throttled() {
        let medium = medium(ChannelMediumOptions {
            shared_position_sync: true,
            ..Default::default()
        });
        let (p, sp) = publication(5);
        medium.broadcast_publication(&p, &sp, None);

        // First check runs and matches.
        assert!(medium.check_position(Duration::from_secs(30), || {
            Some(StreamPosition::new(5, "e1"))
        }));
        // Second check within the delay is skipped even though the top moved.
        assert!(medium.check_position(Duration::from_secs(30), || {
            Some(StreamPosition::new(9, "e1"))
        }));
    }

    #[tokio::test]
    async fn test_check_position_detects_lag() {
        let medium = medium(ChannelMediumOptions {
            shared_position_sync: true,
            ..Default::default()
        });
        let (p, sp) = publication(5);
        medium.broadcast_publication(&p, &sp, None);
        assert!(!medium.check_position(Duration::ZERO, || {
            Some(StreamPosition::new(7, "e1"))
        }));
    }

    #[tokio::test]
    async fn test_check_position_epoch_mismatch() {
        let medium = medium(ChannelMediumOptions {
            shared_position_sync: true,
            ..Default::default()
        });
        let (p, sp) = publication(5);
        medium.broadcast_publication(&p, &sp, None);
        assert!(!medium.check_position(Duration::ZERO, || {
            Some(StreamPosition::new(5, "e2"))
        }));
    }

    #[tokio::test]
    async fn test_queue_overflow_evicts_oldest() {
        let medium = medium(ChannelMediumOptions {
            enable_queue: true,
            max_queue_size: 2,
            ..Default::default()
        });
        // Single-threaded runtime, no awaits: the worker has not run yet,
        // so every publication sits in the queue.
        for offset in 1..=3u64 {
            let (p, sp) = publication(offset);
            medium.broadcast_publication(&p, &sp, None);
        }

        let state = medium.lock();
        let queued: Vec<u64> = state.queue.iter().map(|item| item.sp.offset).collect();
        assert_eq!(queued, [2, 3]);
        assert_eq!(state.queued_bytes, 2);
    }

    #[test]
    fn test_options_enabled() {
        assert!(!ChannelMediumOptions::default().is_enabled());
        assert!(ChannelMediumOptions {
            enable_queue: true,
            ..Default::default()
        }
        .is_enabled());
        assert!(ChannelMediumOptions {
            broadcast_delay: Duration::from_millis(50),
            ..Default::default()
        }
        .is_enabled());
    }
}
