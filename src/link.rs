//! A worker's channel to the peer plus what it needs to reopen it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::app::AppPackage;
use crate::connection::{self, Channel, ChannelState, TlsClient};
use crate::protocol::PeerDescriptor;

/// Everything needed to open and register a channel.
#[derive(Clone)]
pub struct LinkTarget {
    pub peer: PeerDescriptor,
    pub want_secure: bool,
    pub tls: Option<TlsClient>,
    pub connect_timeout: Duration,
    pub app: AppPackage,
    pub chunk_bytes: usize,
}

impl LinkTarget {
    /// Connect and register a new channel, leaving it Ready.
    pub fn open(&self) -> anyhow::Result<Channel> {
        let mut channel = connection::connect(
            &self.peer,
            self.want_secure,
            self.tls.as_ref(),
            self.connect_timeout,
        )?;
        channel.register(&self.app, self.chunk_bytes)?;
        channel.mark_ready();
        Ok(channel)
    }
}

pub struct PeerLink {
    label: String,
    channel: Channel,
    target: Option<Arc<LinkTarget>>,
    reconnect: bool,
}

impl PeerLink {
    /// No peer at all: every task runs locally.
    pub fn offline(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            channel: Channel::broken(),
            target: None,
            reconnect: false,
        }
    }

    /// Wrap an already registered channel.
    pub fn from_channel(
        label: impl Into<String>,
        channel: Channel,
        target: Arc<LinkTarget>,
        reconnect: bool,
    ) -> Self {
        Self {
            label: label.into(),
            channel,
            target: Some(target),
            reconnect,
        }
    }

    /// Open a channel for a worker. If it cannot be opened the link stays
    /// Broken for its whole lifetime.
    pub fn open(label: impl Into<String>, target: Arc<LinkTarget>, reconnect: bool) -> Self {
        let label = label.into();
        match target.open() {
            Ok(channel) => {
                info!(link = %label, secure = channel.is_secure(), "channel ready");
                Self::from_channel(label, channel, target, reconnect)
            }
            Err(err) => {
                error!(link = %label, error = %format!("{err:#}"), "could not open channel, running locally only");
                Self {
                    label,
                    channel: Channel::broken(),
                    target: None,
                    reconnect: false,
                }
            }
        }
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Mark the current channel unusable after a failed exchange.
    pub fn mark_broken(&mut self) {
        self.channel.mark_broken();
    }

    /// A Ready channel for one remote exchange, reopening a channel that
    /// broke mid-session once when allowed. `None` means run locally.
    pub fn channel_for_remote(&mut self) -> Option<&mut Channel> {
        if self.channel.is_ready() {
            return Some(&mut self.channel);
        }
        if !self.reconnect {
            return None;
        }
        let target = self.target.as_ref()?;
        warn!(link = %self.label, "channel broken, reconnecting");
        match target.open() {
            Ok(channel) => {
                info!(link = %self.label, "channel re-established");
                self.channel = channel;
                Some(&mut self.channel)
            }
            Err(err) => {
                error!(link = %self.label, error = %format!("{err:#}"), "reconnect failed, channel permanently broken");
                self.target = None;
                self.reconnect = false;
                None
            }
        }
    }
}
