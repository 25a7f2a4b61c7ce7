//! Application behavior wired from server configuration.
//!
//! The standalone server has no embedding application, so channel
//! permissions and history settings come from the `[channels]` config
//! section. Tokens are opaque user identifiers here; real deployments
//! embed relay-core and install their own hooks.

use crate::config::ChannelsConfig;
use relay_core::{
    ConnectReply, Credentials, Error, EventHooks, PublishOptions, PublishReply, SubscribeOptions,
    SubscribeReply,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Build event hooks implementing the configured channel policy.
#[must_use]
pub fn build_hooks(channels: &ChannelsConfig) -> EventHooks {
    let mut hooks = EventHooks::default();

    let cfg = channels.clone();
    hooks.on_connecting = Some(Arc::new(move |event| {
        let user_id = match event.token {
            Some(token) if !token.is_empty() => token,
            _ if cfg.allow_anonymous => String::new(),
            _ => {
                debug!(client = %event.client_id, "connection without token rejected");
                return Err(Error::UNAUTHORIZED);
            }
        };
        Ok(ConnectReply {
            credentials: Some(Credentials {
                user_id,
                expire_at: None,
                info: None,
            }),
            ..ConnectReply::default()
        })
    }));

    let cfg = channels.clone();
    hooks.on_subscribe = Some(Arc::new(move |_event| {
        Ok(SubscribeReply {
            options: SubscribeOptions {
                emit_presence: cfg.presence,
                emit_join_leave: cfg.join_leave,
                push_join_leave: cfg.join_leave,
                enable_recovery: cfg.recovery && cfg.history_size > 0,
                enable_positioning: cfg.recovery && cfg.history_size > 0,
                ..SubscribeOptions::default()
            },
        })
    }));

    let cfg = channels.clone();
    hooks.on_publish = Some(Arc::new(move |event| {
        if !cfg.allow_publish {
            debug!(client = %event.client_id, channel = %event.channel, "publish denied");
            return Err(Error::PERMISSION_DENIED);
        }
        Ok(PublishReply {
            options: PublishOptions {
                history_size: cfg.history_size,
                history_ttl: Duration::from_secs(cfg.history_ttl_s),
                ..PublishOptions::default()
            },
        })
    }));

    let cfg = channels.clone();
    hooks.on_presence = Some(Arc::new(move |_event| {
        if cfg.presence {
            Ok(())
        } else {
            Err(Error::NOT_AVAILABLE)
        }
    }));
    let cfg = channels.clone();
    hooks.on_presence_stats = Some(Arc::new(move |_event| {
        if cfg.presence {
            Ok(())
        } else {
            Err(Error::NOT_AVAILABLE)
        }
    }));

    let cfg = channels.clone();
    hooks.on_history = Some(Arc::new(move |_event| {
        if cfg.history_size > 0 {
            Ok(())
        } else {
            Err(Error::NOT_AVAILABLE)
        }
    }));

    hooks
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ConnectEvent;

    fn connect_event(token: Option<&str>) -> ConnectEvent {
        ConnectEvent {
            client_id: "c1".into(),
            token: token.map(String::from),
            name: None,
            version: None,
            data: None,
        }
    }

    #[test]
    fn test_token_becomes_user_id() {
        let hooks = build_hooks(&ChannelsConfig::default());
        let on_connecting = hooks.on_connecting.unwrap();
        let reply = on_connecting(connect_event(Some("user-42"))).unwrap();
        assert_eq!(reply.credentials.unwrap().user_id, "user-42");
    }

    #[test]
    fn test_missing_token_rejected_unless_anonymous() {
        let hooks = build_hooks(&ChannelsConfig::default());
        let on_connecting = hooks.on_connecting.unwrap();
        assert!(on_connecting(connect_event(None)).is_err());

        let cfg = ChannelsConfig {
            allow_anonymous: true,
            ..ChannelsConfig::default()
        };
        let hooks = build_hooks(&cfg);
        let on_connecting = hooks.on_connecting.unwrap();
        let reply = on_connecting(connect_event(None)).unwrap();
        assert_eq!(reply.credentials.unwrap().user_id, "");
    }

    #[test]
    fn test_recovery_requires_history() {
        let cfg = ChannelsConfig {
            recovery: true,
            history_size: 0,
            ..ChannelsConfig::default()
        };
        let hooks = build_hooks(&cfg);
        let on_subscribe = hooks.on_subscribe.unwrap();
        let reply = on_subscribe(relay_core::SubscribeEvent {
            client_id: "c1".into(),
            user_id: "u1".into(),
            channel: "news".into(),
        })
        .unwrap();
        assert!(!reply.options.enable_recovery);
    }

    #[test]
    fn test_publish_denied_when_disabled() {
        let cfg = ChannelsConfig {
            allow_publish: false,
            ..ChannelsConfig::default()
        };
        let hooks = build_hooks(&cfg);
        let on_publish = hooks.on_publish.unwrap();
        let result = on_publish(relay_core::PublishEvent {
            client_id: "c1".into(),
            user_id: "u1".into(),
            channel: "news".into(),
            data: b"{}".to_vec(),
        });
        assert_eq!(result.unwrap_err().code, Error::PERMISSION_DENIED.code);
    }
}
