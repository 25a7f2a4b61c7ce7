//! Shared fixtures for engine tests.

use crate::broker::PublishOptions;
use crate::errors::Disconnect;
use crate::hooks::{
    ConnectReply, Credentials, EventHooks, PublishReply, RpcReply, SubscribeOptions,
    SubscribeReply,
};
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{codec, Push, Reply, ServerFrame};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Transport capturing written frames for inspection.
pub struct MockTransport {
    frames: Mutex<Vec<Bytes>>,
    closed: Mutex<Option<Disconnect>>,
    blocked: Mutex<bool>,
    unblock: Notify,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
            blocked: Mutex::new(false),
            unblock: Notify::new(),
        })
    }

    /// Make writes hang until [`unblock`](Self::unblock) so the outbound
    /// queue fills up.
    pub fn block(&self) {
        *self.blocked.lock().unwrap() = true;
    }

    pub fn unblock(&self) {
        *self.blocked.lock().unwrap() = false;
        self.unblock.notify_waiters();
    }

    pub fn decoded(&self) -> Vec<ServerFrame> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|frame| codec::decode::<ServerFrame>(frame).expect("valid frame"))
            .collect()
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.decoded()
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::Reply(reply) => Some(reply),
                ServerFrame::Push(_) => None,
            })
            .collect()
    }

    pub fn reply(&self, id: u64) -> Option<Reply> {
        self.replies().into_iter().find(|reply| reply.id == id)
    }

    pub fn pushes(&self) -> Vec<Push> {
        self.decoded()
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::Push(push) => Some(push),
                ServerFrame::Reply(_) => None,
            })
            .collect()
    }

    pub fn publication_offsets(&self, channel: &str) -> Vec<u64> {
        self.pushes()
            .into_iter()
            .filter_map(|push| match push {
                Push::Publication {
                    channel: c,
                    publication,
                } if c == channel => Some(publication.offset),
                _ => None,
            })
            .collect()
    }

    pub fn closed_with(&self) -> Option<Disconnect> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        while *self.blocked.lock().unwrap() {
            self.unblock.notified().await;
        }
        self.frames.lock().unwrap().push(data);
        Ok(())
    }

    async fn write_many(&self, data: Vec<Bytes>) -> Result<(), TransportError> {
        for frame in data {
            self.write(frame).await?;
        }
        Ok(())
    }

    async fn close(&self, disconnect: &Disconnect) -> Result<(), TransportError> {
        *self.closed.lock().unwrap() = Some(disconnect.clone());
        Ok(())
    }
}

/// Publish options retaining a short history, as the publish hook of a
/// history-enabled application would configure them.
pub fn history_options() -> PublishOptions {
    PublishOptions {
        history_size: 10,
        history_ttl: Duration::from_secs(60),
        ..Default::default()
    }
}

/// Hooks accepting every connection (token becomes the user ID) and every
/// channel. Channels prefixed `feed` subscribe without positioning; all
/// others get recovery and presence.
pub fn test_hooks() -> EventHooks {
    EventHooks {
        on_connecting: Some(Arc::new(|event| {
            Ok(ConnectReply {
                credentials: Some(Credentials {
                    user_id: event.token.unwrap_or_default(),
                    ..Default::default()
                }),
                ..Default::default()
            })
        })),
        on_subscribe: Some(Arc::new(|event| {
            let plain = event.channel.starts_with("feed");
            Ok(SubscribeReply {
                options: SubscribeOptions {
                    enable_recovery: !plain,
                    emit_presence: !plain,
                    ..Default::default()
                },
            })
        })),
        on_publish: Some(Arc::new(|_| {
            Ok(PublishReply {
                options: history_options(),
            })
        })),
        on_presence: Some(Arc::new(|_| Ok(()))),
        on_presence_stats: Some(Arc::new(|_| Ok(()))),
        on_history: Some(Arc::new(|_| Ok(()))),
        on_rpc: Some(Arc::new(|event| Ok(RpcReply { data: event.data }))),
        ..Default::default()
    }
}

/// Let spawned tasks (writer, medium worker, delayed unsubscribe) run.
pub async fn drain() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
