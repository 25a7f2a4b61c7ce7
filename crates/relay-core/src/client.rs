//! One client connection.
//!
//! A [`Client`] owns the full command lifecycle of a single transport
//! connection: authentication, channel subscriptions with recovery,
//! positioned delivery, periodic presence/position/expiration maintenance
//! and the outbound write queue. Command handling is synchronous; the only
//! async piece is the writer task draining the queue into the transport.
//!
//! State moves `Connecting → Connected → Closed`, never backwards. Close is
//! terminal and idempotent: it releases subscriptions, presence, buffering
//! state and timers exactly once no matter how many times or from which
//! task it is invoked.

use crate::config::Config;
use crate::errors::{Disconnect, Error};
use crate::hooks::{
    ConnectEvent, DisconnectEvent, HistoryEvent, MessageEvent, PresenceEvent, PublishEvent,
    RefreshEvent, RpcEvent, SubRefreshEvent, SubscribeEvent, SubscribeOptions,
};
use crate::medium::INSUFFICIENT_STATE_OFFSET;
use crate::node::Node;
use crate::recovery::{is_stream_recovered, merge_publications, BufferedPub, PubSubSync};
use crate::transport::Transport;
use bytes::Bytes;
use relay_protocol::{
    codec, validate_channel_name, ClientInfo, Command, ConnectResult, ConnectSubRequest,
    HistoryResult, PresenceResult, PresenceStatsResult, Publication, PublishResult, Push,
    RefreshResult, Reply, ReplyResult, RpcResult, StreamPosition, SubRefreshResult,
    SubscribeResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Unsubscribe push code for server-initiated unsubscribes.
pub const UNSUBSCRIBE_CODE_SERVER: u32 = 2000;

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

fn generate_client_id() -> String {
    let seq = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", relay_protocol::unix_time_ms(), seq)
}

fn unix_time_secs() -> u64 {
    relay_protocol::unix_time_ms() / 1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Connecting,
    Connected,
    Closed,
}

/// Per-subscription state kept while a channel subscription is active.
#[derive(Debug, Clone, Default)]
struct ChannelContext {
    positioned: bool,
    emit_presence: bool,
    emit_join_leave: bool,
    push_join_leave: bool,
    expire_at: Option<u64>,
    info: Option<serde_json::Value>,
    /// Highest stream position confirmed delivered to this connection.
    position: StreamPosition,
    position_failures: u8,
    last_position_check: Option<Instant>,
}

struct ConnState {
    status: Status,
    user_id: String,
    info: Option<serde_json::Value>,
    expire_at: Option<u64>,
    channels: HashMap<String, ChannelContext>,
    queue_bytes: usize,
    // Stale and maintenance timers. The writer task is deliberately not
    // tracked here: it must outlive close so it can flush the disconnect
    // push and close the transport.
    timers: Vec<JoinHandle<()>>,
}

enum Outgoing {
    Frame(Bytes),
    Close(Disconnect),
}

/// A single client connection bound to one transport.
pub struct Client {
    id: String,
    node: Arc<Node>,
    state: Mutex<ConnState>,
    sync: PubSubSync,
    out_tx: mpsc::UnboundedSender<Outgoing>,
}

enum SubscribeFailure {
    Reply(Error),
    Terminal(Disconnect),
}

impl From<Error> for SubscribeFailure {
    fn from(error: Error) -> Self {
        SubscribeFailure::Reply(error)
    }
}

impl Client {
    /// Create a client for an accepted transport connection and start its
    /// writer task. The connection stays in `Connecting` until a valid
    /// connect command arrives; a stale timer closes it if none does.
    pub fn new(node: Arc<Node>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            id: generate_client_id(),
            node,
            state: Mutex::new(ConnState {
                status: Status::Connecting,
                user_id: String::new(),
                info: None,
                expire_at: None,
                channels: HashMap::new(),
                queue_bytes: 0,
                timers: Vec::new(),
            }),
            sync: PubSubSync::new(),
            out_tx,
        });

        tokio::spawn(run_writer(
            Arc::downgrade(&client),
            Arc::clone(&transport),
            out_rx,
        ));
        let stale = tokio::spawn(run_stale_timer(
            Arc::downgrade(&client),
            client.node.config().client_stale_close_delay,
        ));
        client.lock().timers.push(stale);
        debug!(client = %client.id, transport = transport.name(), "client created");
        client
    }

    /// Unique connection ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// User ID of the connection, empty before authentication or for
    /// anonymous connections.
    #[must_use]
    pub fn user_id(&self) -> String {
        self.lock().user_id.clone()
    }

    /// Whether the connection reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().status == Status::Closed
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn config(&self) -> &Config {
        self.node.config()
    }

    fn client_info(&self, chan_info: Option<serde_json::Value>) -> ClientInfo {
        let state = self.lock();
        ClientInfo {
            client: self.id.clone(),
            user: state.user_id.clone(),
            conn_info: state.info.clone(),
            chan_info,
        }
    }

    // ---- outbound queue ----

    /// Queue an encoded frame, enforcing the slow-consumer byte budget.
    fn enqueue(&self, frame: Bytes) -> bool {
        let size = frame.len();
        {
            let mut state = self.lock();
            if state.status == Status::Closed {
                return false;
            }
            state.queue_bytes += size;
            if state.queue_bytes > self.config().client_queue_max_size {
                drop(state);
                debug!(client = %self.id, "outbound queue overflow");
                self.close(&Disconnect::SLOW);
                return false;
            }
        }
        self.out_tx.send(Outgoing::Frame(frame)).is_ok()
    }

    fn drained(&self, bytes: usize) {
        let mut state = self.lock();
        state.queue_bytes = state.queue_bytes.saturating_sub(bytes);
    }

    fn send_reply(&self, reply: &Reply) {
        match codec::encode(reply) {
            Ok(frame) => {
                self.enqueue(frame);
            }
            Err(error) => {
                warn!(client = %self.id, error = %error, "failed to encode reply");
                self.close(&Disconnect::SERVER_ERROR);
            }
        }
    }

    fn send_result(&self, id: u64, result: ReplyResult) {
        self.send_reply(&Reply::ok(id, result));
    }

    fn send_error(&self, id: u64, error: &Error) {
        self.send_reply(&Reply::err(id, error.into()));
    }

    fn send_push(&self, push: &Push) {
        match codec::encode(push) {
            Ok(frame) => {
                self.enqueue(frame);
            }
            Err(error) => {
                warn!(client = %self.id, error = %error, "failed to encode push");
            }
        }
    }

    // ---- delivery ----

    /// Deliver a publication push, enforcing ordered delivery on positioned
    /// subscriptions. `prepared` is the frame already encoded by the hub.
    pub fn write_publication(
        &self,
        channel: &str,
        publication: &Publication,
        sp: StreamPosition,
        prepared: Bytes,
    ) {
        let item = BufferedPub {
            publication: publication.clone(),
            sp,
            prepared,
        };
        self.sync
            .sync_publication(channel, item, |item| self.write_positioned(channel, item));
    }

    fn write_positioned(&self, channel: &str, item: BufferedPub) {
        enum Action {
            Deliver,
            Drop,
            Insufficient,
        }
        let action = {
            let mut state = self.lock();
            let Some(ctx) = state.channels.get_mut(channel) else {
                return;
            };
            if !ctx.positioned {
                if item.sp.offset == INSUFFICIENT_STATE_OFFSET {
                    // Resync sentinel is meaningless without positioning.
                    return;
                }
                Action::Deliver
            } else if item.sp.offset == INSUFFICIENT_STATE_OFFSET {
                Action::Insufficient
            } else if item.sp.epoch != ctx.position.epoch
                || item.sp.offset > ctx.position.offset + 1
            {
                Action::Insufficient
            } else if item.sp.offset <= ctx.position.offset {
                // Stale replay, e.g. flushed buffer overlapping recovery.
                Action::Drop
            } else {
                ctx.position.offset = item.sp.offset;
                Action::Deliver
            }
        };
        match action {
            Action::Deliver => {
                self.enqueue(item.prepared);
            }
            Action::Drop => {
                trace!(client = %self.id, channel = %channel, offset = item.sp.offset, "stale publication dropped");
            }
            Action::Insufficient => {
                debug!(client = %self.id, channel = %channel, offset = item.sp.offset, "insufficient state on delivery");
                self.close(&Disconnect::INSUFFICIENT_STATE);
            }
        }
    }

    /// Deliver a join push when the subscription opted into them.
    pub fn write_join(&self, channel: &str, prepared: Bytes) {
        let wanted = self
            .lock()
            .channels
            .get(channel)
            .is_some_and(|ctx| ctx.push_join_leave);
        if wanted {
            self.enqueue(prepared);
        }
    }

    /// Deliver a leave push when the subscription opted into them.
    pub fn write_leave(&self, channel: &str, prepared: Bytes) {
        let wanted = self
            .lock()
            .channels
            .get(channel)
            .is_some_and(|ctx| ctx.push_join_leave);
        if wanted {
            self.enqueue(prepared);
        }
    }

    /// Deliver a raw application message push.
    pub fn send_message(&self, data: Vec<u8>) {
        self.send_push(&Push::Message { data });
    }

    // ---- close ----

    /// Terminate the connection. Idempotent and safe to call concurrently;
    /// the first caller wins and runs the cleanup.
    pub fn close(&self, disconnect: &Disconnect) {
        let (user_id, channels, timers) = {
            let mut state = self.lock();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Closed;
            (
                state.user_id.clone(),
                std::mem::take(&mut state.channels),
                std::mem::take(&mut state.timers),
            )
        };

        for timer in timers {
            timer.abort();
        }
        for (channel, ctx) in channels {
            if ctx.emit_presence {
                self.node.remove_presence(&channel, &self.id, &user_id);
            }
            if ctx.emit_join_leave {
                self.node
                    .publish_leave(&channel, &self.client_info_closed(&user_id, ctx.info));
            }
            self.node.remove_subscription(&channel, &self.id);
        }
        self.sync.release();
        self.node.hub().remove(self);

        // The writer drains pending frames, pushes the disconnect to the
        // client and closes the transport, then exits.
        let _ = self.out_tx.send(Outgoing::Close(disconnect.clone()));

        debug!(client = %self.id, code = disconnect.code, reason = disconnect.reason, "client closed");
        if let Some(hook) = &self.node.hooks().on_disconnect {
            hook(DisconnectEvent {
                client_id: self.id.clone(),
                user_id,
                disconnect: disconnect.clone(),
            });
        }
    }

    // client_info requires the state lock; this variant runs after the state
    // was already torn down.
    fn client_info_closed(&self, user_id: &str, chan_info: Option<serde_json::Value>) -> ClientInfo {
        ClientInfo {
            client: self.id.clone(),
            user: user_id.to_string(),
            conn_info: None,
            chan_info,
        }
    }

    // ---- command dispatch ----

    /// Process one decoded command. The first command must be connect;
    /// anything violating the protocol closes the connection.
    pub fn handle_command(self: &Arc<Self>, command: Command) {
        let status = self.lock().status;
        if status == Status::Closed {
            return;
        }
        match (&command, status) {
            (Command::Connect { .. }, Status::Connecting) => {}
            (Command::Connect { .. }, _) | (_, Status::Connecting) => {
                self.close(&Disconnect::BAD_REQUEST);
                return;
            }
            _ => {}
        }

        match command {
            Command::Connect {
                id,
                token,
                name,
                version,
                data,
                subs,
            } => self.handle_connect(id, token, name, version, data, subs),
            Command::Subscribe {
                id,
                channel,
                recover,
                offset,
                epoch,
            } => self.handle_subscribe(id, channel, recover, offset, epoch),
            Command::Unsubscribe { id, channel } => self.handle_unsubscribe(id, &channel),
            Command::Publish { id, channel, data } => self.handle_publish(id, &channel, data),
            Command::Presence { id, channel } => self.handle_presence(id, &channel),
            Command::PresenceStats { id, channel } => self.handle_presence_stats(id, &channel),
            Command::History {
                id,
                channel,
                limit,
                since,
                reverse,
            } => self.handle_history(id, &channel, limit, since, reverse),
            Command::Refresh { id, token } => self.handle_refresh(id, token),
            Command::SubRefresh { id, channel, token } => {
                self.handle_sub_refresh(id, &channel, token);
            }
            Command::Rpc { id, method, data } => self.handle_rpc(id, method, data),
            Command::Send { data } => self.handle_send(data),
            Command::Ping { id } => self.send_result(id, ReplyResult::Ping {}),
        }
    }

    fn handle_connect(
        self: &Arc<Self>,
        id: u64,
        token: Option<String>,
        name: Option<String>,
        version: Option<String>,
        data: Option<serde_json::Value>,
        subs: HashMap<String, ConnectSubRequest>,
    ) {
        let Some(hook) = self.node.hooks().on_connecting.clone() else {
            self.send_error(id, &Error::UNAUTHORIZED);
            self.close(&Disconnect::INVALID_TOKEN);
            return;
        };
        let reply = match hook(ConnectEvent {
            client_id: self.id.clone(),
            token,
            name,
            version,
            data,
        }) {
            Ok(reply) => reply,
            Err(error) => {
                self.send_error(id, &error);
                self.close(&Disconnect::INVALID_TOKEN);
                return;
            }
        };
        let Some(credentials) = reply.credentials else {
            self.send_error(id, &Error::UNAUTHORIZED);
            self.close(&Disconnect::INVALID_TOKEN);
            return;
        };

        let limit = self.config().user_connection_limit;
        if limit > 0
            && !credentials.user_id.is_empty()
            && self.node.hub().user_connections(&credentials.user_id).len() >= limit
        {
            debug!(client = %self.id, user = %credentials.user_id, "user connection limit reached");
            self.close(&Disconnect::CONNECTION_LIMIT);
            return;
        }

        let (expires, ttl) = match credentials.expire_at {
            Some(expire_at) => {
                let now = unix_time_secs();
                if expire_at <= now {
                    self.send_error(id, &Error::EXPIRED);
                    self.close(&Disconnect::EXPIRED);
                    return;
                }
                (true, (expire_at - now) as u32)
            }
            None => (false, 0),
        };

        {
            let mut state = self.lock();
            if state.status != Status::Connecting {
                return;
            }
            state.status = Status::Connected;
            state.user_id = credentials.user_id.clone();
            state.info = credentials.info.clone();
            state.expire_at = credentials.expire_at;
        }
        self.node.hub().add(Arc::clone(self));
        self.start_maintenance();

        // Server-declared subscriptions plus channels the client asks to
        // restore, executed before the connect reply. First failure wins.
        let mut sub_results = HashMap::new();
        let mut requested: Vec<(String, SubscribeOptions, Option<StreamPosition>)> = Vec::new();
        for (channel, opts) in reply.subscriptions {
            let recover_from = subs.get(&channel).filter(|r| r.recover).map(|r| {
                StreamPosition::new(r.offset, r.epoch.clone())
            });
            requested.push((channel, opts, recover_from));
        }
        for (channel, opts, recover_from) in requested {
            match self.subscribe_channel(&channel, opts, recover_from) {
                Ok(result) => {
                    sub_results.insert(channel, result);
                }
                Err(SubscribeFailure::Reply(error)) => {
                    warn!(client = %self.id, channel = %channel, code = error.code, "connect-time subscribe failed");
                    self.close(&Disconnect::SERVER_ERROR);
                    return;
                }
                Err(SubscribeFailure::Terminal(disconnect)) => {
                    self.close(&disconnect);
                    return;
                }
            }
        }

        let result = ConnectResult {
            client: self.id.clone(),
            version: self.config().version.clone(),
            expires,
            ttl,
            data: reply.data,
            subs: sub_results,
            ping: self.config().ping_interval.as_secs() as u32,
        };
        debug!(client = %self.id, user = %self.user_id(), "client connected");
        self.send_result(id, ReplyResult::Connect(result));
    }

    fn handle_subscribe(
        self: &Arc<Self>,
        id: u64,
        channel: String,
        recover: bool,
        offset: u64,
        epoch: String,
    ) {
        if let Err(reason) = validate_channel_name(&channel) {
            debug!(client = %self.id, channel = %channel, reason, "invalid channel name");
            self.close(&Disconnect::BAD_REQUEST);
            return;
        }
        {
            let state = self.lock();
            if state.channels.contains_key(&channel) {
                drop(state);
                self.send_error(id, &Error::ALREADY_SUBSCRIBED);
                return;
            }
            let limit = self.config().client_channel_limit;
            if limit > 0 && state.channels.len() >= limit {
                drop(state);
                debug!(client = %self.id, channel = %channel, "channel limit reached");
                self.close(&Disconnect::CHANNEL_LIMIT);
                return;
            }
        }

        let Some(hook) = self.node.hooks().on_subscribe.clone() else {
            self.send_error(id, &Error::NOT_AVAILABLE);
            return;
        };
        let options = match hook(SubscribeEvent {
            client_id: self.id.clone(),
            user_id: self.user_id(),
            channel: channel.clone(),
        }) {
            Ok(reply) => reply.options,
            Err(error) => {
                self.send_error(id, &error);
                return;
            }
        };

        let recover_from = recover.then(|| StreamPosition::new(offset, epoch));
        match self.subscribe_channel(&channel, options, recover_from) {
            Ok(result) => self.send_result(id, ReplyResult::Subscribe(result)),
            Err(SubscribeFailure::Reply(error)) => self.send_error(id, &error),
            Err(SubscribeFailure::Terminal(disconnect)) => self.close(&disconnect),
        }
    }

    /// Core subscription establishment, shared between the subscribe command
    /// and connect-time server-side subscriptions.
    ///
    /// With `recover_from` set, missed publications are recovered from
    /// channel history while live ones buffer, then the two flows merge into
    /// one gapless sequence. A merge that cannot be proven gapless is fatal
    /// for the connection rather than silently incomplete.
    fn subscribe_channel(
        self: &Arc<Self>,
        channel: &str,
        options: SubscribeOptions,
        recover_from: Option<StreamPosition>,
    ) -> Result<SubscribeResult, SubscribeFailure> {
        let positioned = options.enable_positioning || options.enable_recovery;
        let was_recovering = recover_from.is_some();

        let (expires, ttl) = match options.expire_at {
            Some(expire_at) => {
                let now = unix_time_secs();
                if expire_at <= now {
                    return Err(Error::EXPIRED.into());
                }
                (true, (expire_at - now) as u32)
            }
            None => (false, 0),
        };

        if positioned {
            self.sync.start_buffering(channel);
        }
        if let Err(error) = self.node.add_subscription(channel, Arc::clone(self)) {
            warn!(client = %self.id, channel = %channel, error = %error, "failed to add subscription");
            if positioned {
                let _ = self.sync.stop_buffering(channel);
            }
            return Err(SubscribeFailure::Terminal(Disconnect::SERVER_ERROR));
        }

        let rollback = |client: &Arc<Self>| {
            if positioned {
                let _ = client.sync.stop_buffering(channel);
            }
            client.node.remove_subscription(channel, &client.id);
        };

        if options.emit_presence {
            let info = self.client_info(options.channel_info.clone());
            if let Err(error) = self.node.add_presence(channel, &self.id, &info) {
                warn!(client = %self.id, channel = %channel, error = %error, "failed to add presence");
                rollback(self);
                return Err(SubscribeFailure::Terminal(Disconnect::SERVER_ERROR));
            }
        }

        let mut result = SubscribeResult {
            expires,
            ttl,
            recoverable: options.enable_recovery,
            positioned,
            was_recovering,
            data: options.data.clone(),
            ..Default::default()
        };
        let mut tracked = StreamPosition::default();

        if positioned {
            if let Some(since) = recover_from {
                let (recovered_pubs, top) = match self.node.recover_history(channel, &since) {
                    Ok(history) => history,
                    Err(error) => {
                        warn!(client = %self.id, channel = %channel, error = %error, "history read failed");
                        rollback(self);
                        return Err(SubscribeFailure::Terminal(Disconnect::SERVER_ERROR));
                    }
                };
                let recovered = is_stream_recovered(&recovered_pubs, &top, &since);
                let buffered: Vec<Publication> = self
                    .sync
                    .read_buffered(channel)
                    .into_iter()
                    .map(|item| item.publication)
                    .collect();
                if recovered {
                    let Some((merged, max_seen)) = merge_publications(recovered_pubs, buffered)
                    else {
                        debug!(client = %self.id, channel = %channel, "recovery merge gap");
                        rollback(self);
                        return Err(SubscribeFailure::Terminal(Disconnect::INSUFFICIENT_STATE));
                    };
                    tracked = StreamPosition::new(max_seen.max(top.offset), top.epoch.clone());
                    result.publications = merged;
                    result.recovered = true;
                } else {
                    // Not recoverable from the requested position: the
                    // client gets the current top and resyncs by itself.
                    tracked = top.clone();
                }
                result.offset = tracked.offset;
                result.epoch = tracked.epoch.clone();
            } else {
                let top = match self.node.stream_top(channel) {
                    Ok(top) => top,
                    Err(error) => {
                        warn!(client = %self.id, channel = %channel, error = %error, "stream top read failed");
                        rollback(self);
                        return Err(SubscribeFailure::Terminal(Disconnect::SERVER_ERROR));
                    }
                };
                tracked = top;
                result.offset = tracked.offset;
                result.epoch = tracked.epoch.clone();
            }
        }

        {
            let mut state = self.lock();
            if state.status == Status::Closed {
                drop(state);
                rollback(self);
                return Err(SubscribeFailure::Terminal(Disconnect::CONNECTION_CLOSED));
            }
            state.channels.insert(
                channel.to_string(),
                ChannelContext {
                    positioned,
                    emit_presence: options.emit_presence,
                    emit_join_leave: options.emit_join_leave,
                    push_join_leave: options.push_join_leave,
                    expire_at: options.expire_at,
                    info: options.channel_info.clone(),
                    position: tracked,
                    position_failures: 0,
                    last_position_check: None,
                },
            );
        }

        if positioned {
            // Anything buffered after the merge read flows through the
            // positioned write path; overlaps drop as stale.
            for item in self.sync.stop_buffering(channel) {
                self.write_positioned(channel, item);
            }
        }

        if options.emit_join_leave {
            let info = self.client_info(options.channel_info);
            self.node.publish_join(channel, &info);
        }

        debug!(
            client = %self.id,
            channel = %channel,
            positioned,
            recovered = result.recovered,
            "subscribed"
        );
        Ok(result)
    }

    fn handle_unsubscribe(&self, id: u64, channel: &str) {
        self.unsubscribe_channel(channel);
        self.send_result(id, ReplyResult::Unsubscribe {});
    }

    fn unsubscribe_channel(&self, channel: &str) {
        let Some(ctx) = self.lock().channels.remove(channel) else {
            return;
        };
        let user_id = self.user_id();
        if ctx.emit_presence {
            self.node.remove_presence(channel, &self.id, &user_id);
        }
        if ctx.emit_join_leave {
            let info = self.client_info(ctx.info);
            self.node.publish_leave(channel, &info);
        }
        self.node.remove_subscription(channel, &self.id);
        debug!(client = %self.id, channel = %channel, "unsubscribed");
    }

    fn handle_publish(&self, id: u64, channel: &str, data: Vec<u8>) {
        if validate_channel_name(channel).is_err() || data.is_empty() {
            self.close(&Disconnect::BAD_REQUEST);
            return;
        }
        let Some(hook) = self.node.hooks().on_publish.clone() else {
            self.send_error(id, &Error::NOT_AVAILABLE);
            return;
        };
        let reply = match hook(PublishEvent {
            client_id: self.id.clone(),
            user_id: self.user_id(),
            channel: channel.to_string(),
            data: data.clone(),
        }) {
            Ok(reply) => reply,
            Err(error) => {
                self.send_error(id, &error);
                return;
            }
        };
        match self.node.publish(channel, &data, reply.options) {
            Ok((sp, _deduped)) => self.send_result(
                id,
                ReplyResult::Publish(PublishResult {
                    offset: sp.offset,
                    epoch: sp.epoch,
                }),
            ),
            Err(error) => {
                warn!(client = %self.id, channel = %channel, error = %error, "publish failed");
                self.send_error(id, &Error::INTERNAL);
            }
        }
    }

    fn handle_presence(&self, id: u64, channel: &str) {
        let Some(hook) = self.node.hooks().on_presence.clone() else {
            self.send_error(id, &Error::NOT_AVAILABLE);
            return;
        };
        if let Err(error) = hook(PresenceEvent {
            client_id: self.id.clone(),
            user_id: self.user_id(),
            channel: channel.to_string(),
        }) {
            self.send_error(id, &error);
            return;
        }
        match self.node.presence(channel) {
            Ok(presence) => self.send_result(id, ReplyResult::Presence(PresenceResult { presence })),
            Err(error) => {
                warn!(client = %self.id, channel = %channel, error = %error, "presence failed");
                self.send_error(id, &Error::INTERNAL);
            }
        }
    }

    fn handle_presence_stats(&self, id: u64, channel: &str) {
        let Some(hook) = self.node.hooks().on_presence_stats.clone() else {
            self.send_error(id, &Error::NOT_AVAILABLE);
            return;
        };
        if let Err(error) = hook(PresenceEvent {
            client_id: self.id.clone(),
            user_id: self.user_id(),
            channel: channel.to_string(),
        }) {
            self.send_error(id, &error);
            return;
        }
        match self.node.presence_stats(channel) {
            Ok(stats) => self.send_result(
                id,
                ReplyResult::PresenceStats(PresenceStatsResult {
                    num_clients: stats.num_clients as u32,
                    num_users: stats.num_users as u32,
                }),
            ),
            Err(error) => {
                warn!(client = %self.id, channel = %channel, error = %error, "presence stats failed");
                self.send_error(id, &Error::INTERNAL);
            }
        }
    }

    fn handle_history(
        &self,
        id: u64,
        channel: &str,
        limit: i32,
        since: Option<StreamPosition>,
        reverse: bool,
    ) {
        let Some(hook) = self.node.hooks().on_history.clone() else {
            self.send_error(id, &Error::NOT_AVAILABLE);
            return;
        };
        if let Err(error) = hook(HistoryEvent {
            client_id: self.id.clone(),
            user_id: self.user_id(),
            channel: channel.to_string(),
        }) {
            self.send_error(id, &error);
            return;
        }
        match self.node.history(channel, limit, since, reverse) {
            Ok((publications, top)) => self.send_result(
                id,
                ReplyResult::History(HistoryResult {
                    publications,
                    offset: top.offset,
                    epoch: top.epoch,
                }),
            ),
            Err(error) => {
                warn!(client = %self.id, channel = %channel, error = %error, "history failed");
                self.send_error(id, &Error::INTERNAL);
            }
        }
    }

    fn handle_refresh(&self, id: u64, token: Option<String>) {
        let Some(hook) = self.node.hooks().on_refresh.clone() else {
            self.send_error(id, &Error::NOT_AVAILABLE);
            return;
        };
        let reply = match hook(RefreshEvent {
            client_id: self.id.clone(),
            user_id: self.user_id(),
            token,
        }) {
            Ok(reply) => reply,
            Err(error) => {
                self.send_error(id, &error);
                return;
            }
        };
        if reply.expired {
            self.send_error(id, &Error::EXPIRED);
            self.close(&Disconnect::EXPIRED);
            return;
        }
        let (expires, ttl) = {
            let mut state = self.lock();
            state.expire_at = reply.expire_at;
            if let Some(info) = reply.info {
                state.info = Some(info);
            }
            match reply.expire_at {
                Some(expire_at) => (true, expire_at.saturating_sub(unix_time_secs()) as u32),
                None => (false, 0),
            }
        };
        self.send_result(
            id,
            ReplyResult::Refresh(RefreshResult {
                client: self.id.clone(),
                expires,
                ttl,
            }),
        );
    }

    fn handle_sub_refresh(&self, id: u64, channel: &str, token: Option<String>) {
        let Some(hook) = self.node.hooks().on_sub_refresh.clone() else {
            self.send_error(id, &Error::NOT_AVAILABLE);
            return;
        };
        if !self.lock().channels.contains_key(channel) {
            self.send_error(id, &Error::BAD_REQUEST);
            return;
        }
        let reply = match hook(SubRefreshEvent {
            client_id: self.id.clone(),
            user_id: self.user_id(),
            channel: channel.to_string(),
            token,
        }) {
            Ok(reply) => reply,
            Err(error) => {
                self.send_error(id, &error);
                return;
            }
        };
        if reply.expired {
            self.send_error(id, &Error::EXPIRED);
            return;
        }
        let (expires, ttl) = {
            let mut state = self.lock();
            let Some(ctx) = state.channels.get_mut(channel) else {
                drop(state);
                self.send_error(id, &Error::BAD_REQUEST);
                return;
            };
            ctx.expire_at = reply.expire_at;
            match reply.expire_at {
                Some(expire_at) => (true, expire_at.saturating_sub(unix_time_secs()) as u32),
                None => (false, 0),
            }
        };
        self.send_result(id, ReplyResult::SubRefresh(SubRefreshResult { expires, ttl }));
    }

    fn handle_rpc(&self, id: u64, method: String, data: Vec<u8>) {
        let Some(hook) = self.node.hooks().on_rpc.clone() else {
            self.send_error(id, &Error::NOT_AVAILABLE);
            return;
        };
        match hook(RpcEvent {
            client_id: self.id.clone(),
            user_id: self.user_id(),
            method,
            data,
        }) {
            Ok(reply) => self.send_result(id, ReplyResult::Rpc(RpcResult { data: reply.data })),
            Err(error) => self.send_error(id, &error),
        }
    }

    fn handle_send(&self, data: Vec<u8>) {
        if let Some(hook) = &self.node.hooks().on_message {
            hook(MessageEvent {
                client_id: self.id.clone(),
                user_id: self.user_id(),
                data,
            });
        }
    }

    // ---- server API ----

    /// Subscribe this connection to a channel server-side.
    pub fn server_subscribe(
        self: &Arc<Self>,
        channel: &str,
        options: SubscribeOptions,
    ) -> Result<(), Error> {
        if self.lock().channels.contains_key(channel) {
            return Ok(());
        }
        match self.subscribe_channel(channel, options, None) {
            Ok(_) => Ok(()),
            Err(SubscribeFailure::Reply(error)) => Err(error),
            Err(SubscribeFailure::Terminal(disconnect)) => {
                self.close(&disconnect);
                Err(Error::INTERNAL)
            }
        }
    }

    /// Unsubscribe this connection from a channel server-side, notifying the
    /// client with an unsubscribe push.
    pub fn server_unsubscribe(&self, channel: &str) {
        if !self.lock().channels.contains_key(channel) {
            return;
        }
        self.unsubscribe_channel(channel);
        self.send_push(&Push::Unsubscribe {
            channel: channel.to_string(),
            code: UNSUBSCRIBE_CODE_SERVER,
            reason: "server unsubscribe".to_string(),
        });
    }

    /// Apply a server-side credential refresh decision.
    pub fn server_refresh(&self, expire_at: Option<u64>, expired: bool) {
        if expired {
            self.close(&Disconnect::EXPIRED);
            return;
        }
        self.lock().expire_at = expire_at;
    }

    // ---- periodic maintenance ----

    fn start_maintenance(self: &Arc<Self>) {
        let task = tokio::spawn(run_maintenance(
            Arc::downgrade(self),
            self.config().client_presence_update_interval,
        ));
        self.lock().timers.push(task);
    }

    fn on_maintenance_tick(self: &Arc<Self>) {
        if self.check_expired() {
            return;
        }
        self.update_presence();
        self.check_positions();
        self.check_subscription_expiry();
    }

    /// Connection credential expiry. Returns true when the connection was
    /// closed.
    fn check_expired(self: &Arc<Self>) -> bool {
        let expire_at = self.lock().expire_at;
        let Some(expire_at) = expire_at else {
            return false;
        };
        let now = unix_time_secs();
        if expire_at > now {
            return false;
        }
        if let Some(hook) = self.node.hooks().on_refresh.clone() {
            match hook(RefreshEvent {
                client_id: self.id.clone(),
                user_id: self.user_id(),
                token: None,
            }) {
                Ok(reply) if !reply.expired => {
                    self.lock().expire_at = reply.expire_at;
                    return false;
                }
                _ => {}
            }
        }
        // Expired credentials get a grace window for a client-side refresh
        // before the forced close.
        let grace = self.config().client_expired_close_delay.as_secs();
        if now < expire_at.saturating_add(grace) {
            return false;
        }
        debug!(client = %self.id, "connection expired");
        self.close(&Disconnect::EXPIRED);
        true
    }

    fn check_subscription_expiry(self: &Arc<Self>) {
        let now = unix_time_secs();
        let expired = {
            let state = self.lock();
            state
                .channels
                .iter()
                .any(|(_, ctx)| ctx.expire_at.is_some_and(|at| at <= now))
        };
        if expired {
            debug!(client = %self.id, "subscription expired");
            self.close(&Disconnect::SUB_EXPIRED);
        }
    }

    fn update_presence(&self) {
        let entries: Vec<(String, Option<serde_json::Value>)> = {
            let state = self.lock();
            state
                .channels
                .iter()
                .filter(|(_, ctx)| ctx.emit_presence)
                .map(|(channel, ctx)| (channel.clone(), ctx.info.clone()))
                .collect()
        };
        for (channel, chan_info) in entries {
            let info = self.client_info(chan_info);
            if let Err(error) = self.node.add_presence(&channel, &self.id, &info) {
                warn!(client = %self.id, channel = %channel, error = %error, "presence update failed");
            }
        }
    }

    /// Verify positioned subscriptions against the broker's stream top.
    /// Checks are throttled per channel; consecutive failures beyond the
    /// configured budget close the connection so the client resubscribes
    /// with recovery instead of silently missing data.
    fn check_positions(self: &Arc<Self>) {
        let delay = self.config().client_channel_position_check_delay;
        let max_failures = self.config().client_channel_position_max_failures;

        let due: Vec<(String, StreamPosition)> = {
            let mut state = self.lock();
            let now = Instant::now();
            state
                .channels
                .iter_mut()
                .filter(|(_, ctx)| ctx.positioned)
                .filter(|(_, ctx)| {
                    ctx.last_position_check
                        .map_or(true, |last| now.duration_since(last) >= delay)
                })
                .map(|(channel, ctx)| {
                    ctx.last_position_check = Some(now);
                    (channel.clone(), ctx.position.clone())
                })
                .collect()
        };

        for (channel, position) in due {
            if let Some(medium) = self.node.medium(&channel) {
                if medium.check_position(delay, || self.node.stream_top(&channel).ok()) {
                    continue;
                }
                // The medium already broadcast the resync sentinel.
                continue;
            }
            let Ok(top) = self.node.stream_top(&channel) else {
                continue;
            };
            let in_sync = top.epoch == position.epoch && top.offset <= position.offset;
            let failures = {
                let mut state = self.lock();
                let Some(ctx) = state.channels.get_mut(&channel) else {
                    continue;
                };
                if in_sync || ctx.position.offset >= top.offset {
                    // Delivery caught up while we were checking.
                    ctx.position_failures = 0;
                    continue;
                }
                ctx.position_failures += 1;
                ctx.position_failures
            };
            if failures >= max_failures {
                debug!(client = %self.id, channel = %channel, "position check failed repeatedly");
                self.close(&Disconnect::INSUFFICIENT_STATE);
                return;
            }
        }
    }

    fn close_if_stale(&self) {
        if self.lock().status == Status::Connecting {
            debug!(client = %self.id, "closing stale connection");
            self.close(&Disconnect::STALE);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

async fn run_stale_timer(client: Weak<Client>, delay: std::time::Duration) {
    tokio::time::sleep(delay).await;
    if let Some(client) = client.upgrade() {
        client.close_if_stale();
    }
}

async fn run_maintenance(client: Weak<Client>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so checks start one interval in.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(client) = client.upgrade() else {
            return;
        };
        client.on_maintenance_tick();
    }
}

/// Writer task: drains the outbound queue into the transport, batching
/// frames that are already waiting. Owns the final transport close.
async fn run_writer(
    client: Weak<Client>,
    transport: Arc<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    const MAX_BATCH: usize = 64;
    while let Some(item) = rx.recv().await {
        let mut batch = Vec::new();
        let mut close_after: Option<Disconnect> = None;
        match item {
            Outgoing::Frame(frame) => batch.push(frame),
            Outgoing::Close(disconnect) => close_after = Some(disconnect),
        }
        while close_after.is_none() && batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(Outgoing::Frame(frame)) => batch.push(frame),
                Ok(Outgoing::Close(disconnect)) => close_after = Some(disconnect),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let bytes: usize = batch.iter().map(Bytes::len).sum();
            if let Some(client) = client.upgrade() {
                client.drained(bytes);
            }
            let result = if batch.len() == 1 {
                transport.write(batch.remove(0)).await
            } else {
                transport.write_many(batch).await
            };
            if let Err(error) = result {
                debug!(error = %error, "transport write failed");
                if let Some(client) = client.upgrade() {
                    client.close(&Disconnect::WRITE_ERROR);
                }
                let _ = transport.close(&Disconnect::WRITE_ERROR).await;
                return;
            }
        }

        if let Some(disconnect) = close_after {
            if let Ok(frame) = codec::encode(&Push::Disconnect {
                code: disconnect.code,
                reason: disconnect.reason.to_string(),
            }) {
                let _ = transport.write(frame).await;
            }
            let _ = transport.close(&disconnect).await;
            return;
        }
    }
}
