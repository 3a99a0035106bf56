//! The offload engine: an explicit object constructed once at process start
//! and handed to callers.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::app::AppPackage;
use crate::broker;
use crate::config::EngineConfig;
use crate::connection::{self, TlsClient};
use crate::dispatch::Dispatcher;
use crate::instrument::{InstrumentationSink, LogSink};
use crate::invocation::{InvocationOutcome, MethodIdentity};
use crate::link::{LinkTarget, PeerLink};
use crate::local::LocalInvoker;
use crate::netquality::{NetworkQuality, Unmonitored};
use crate::oracle::DecisionOracle;
use crate::pool::{LinkFactory, WorkerPool};
use crate::protocol::PeerDescriptor;
use crate::registry::{MethodRegistry, SharedReceiver};

/// External collaborators the engine calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub oracle: Arc<dyn DecisionOracle>,
    pub sink: Arc<dyn InstrumentationSink>,
    pub network: Arc<dyn NetworkQuality>,
}

impl Collaborators {
    pub fn new(oracle: Arc<dyn DecisionOracle>) -> Self {
        Self {
            oracle,
            sink: Arc::new(LogSink),
            network: Arc::new(Unmonitored),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn InstrumentationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkQuality>) -> Self {
        self.network = network;
        self
    }
}

pub struct Engine {
    app_id: String,
    user_id: Option<u64>,
    peer: Option<PeerDescriptor>,
    online: bool,
    pool: WorkerPool,
}

impl Engine {
    /// Resolve the peer, register the application once, then start the
    /// worker pool. An unreachable peer is not fatal: the engine runs every
    /// task locally.
    pub fn start(
        config: EngineConfig,
        app: AppPackage,
        registry: Arc<MethodRegistry>,
        collab: Collaborators,
    ) -> Result<Self> {
        config.validate().context("invalid engine config")?;

        let tls = match config.tls.as_ref().map(TlsClient::from_settings).transpose() {
            Ok(tls) => tls,
            Err(err) => {
                warn!(error = %err, "TLS trust material unusable, secure connects will fall back");
                None
            }
        };

        let (peer, user_id) = match config.peer.clone() {
            Some(peer) => (Some(peer), None),
            None => {
                let reply = broker::fetch_peer(&config.broker_addr, config.broker_retry());
                (reply.peer, Some(reply.user_id))
            }
        };

        let local = LocalInvoker::new(app.app_id.clone(), registry, Arc::clone(&collab.sink));
        let dispatcher = Arc::new(Dispatcher::new(
            app.app_id.clone(),
            Arc::clone(&collab.oracle),
            local,
            Arc::clone(&collab.sink),
        ));

        let app_id = app.app_id.clone();
        let mut links: Vec<LinkFactory> = Vec::with_capacity(config.workers);
        let mut online = false;

        match peer.clone() {
            None => {
                warn!("no peer available, only local execution will be possible");
            }
            Some(peer) => {
                info!(peer = ?peer, "connecting to peer");
                let target = Arc::new(LinkTarget {
                    peer,
                    want_secure: config.connect_secure,
                    tls,
                    connect_timeout: config.connect_timeout(),
                    app,
                    chunk_bytes: config.upload_chunk_bytes,
                });
                match connection::connect(
                    &target.peer,
                    target.want_secure,
                    target.tls.as_ref(),
                    target.connect_timeout,
                ) {
                    Ok(mut primary) => {
                        let estimates = collab.network.wait_stable(config.network_wait());
                        info!(estimates = ?estimates, "network profiling done");
                        match primary.register(&target.app, target.chunk_bytes) {
                            Ok(reg) => {
                                info!(registration = ?reg, "application registered with peer");
                                primary.mark_ready();
                                online = true;
                                let first = PeerLink::from_channel(
                                    "worker-0",
                                    primary,
                                    Arc::clone(&target),
                                    config.reconnect_on_failure,
                                );
                                links.push(Box::new(move || first));
                                for i in 1..config.workers {
                                    let target = Arc::clone(&target);
                                    let reconnect = config.reconnect_on_failure;
                                    links.push(Box::new(move || {
                                        PeerLink::open(format!("worker-{i}"), target, reconnect)
                                    }));
                                }
                            }
                            Err(err) => {
                                error!(error = %err, "registration with peer failed, running locally only");
                            }
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "could not connect to peer, running locally only");
                    }
                }
            }
        }

        if !online {
            links.clear();
            for i in 0..config.workers {
                links.push(Box::new(move || PeerLink::offline(format!("worker-{i}"))));
            }
        }

        let pool = WorkerPool::spawn(links, dispatcher).context("failed to start worker pool")?;
        info!(workers = pool.size(), online, "offload engine started");

        Ok(Self {
            app_id,
            user_id,
            peer,
            online,
            pool,
        })
    }

    /// Run `identity` on `receiver` wherever the oracle decides, blocking
    /// until the result is available. Always resolves to an outcome.
    pub fn submit(
        &self,
        identity: MethodIdentity,
        args: Vec<Value>,
        receiver: SharedReceiver,
    ) -> InvocationOutcome {
        self.pool.submit(identity, args, receiver)
    }

    pub fn shutdown(&self) {
        info!("offload engine shutting down");
        self.pool.shutdown();
    }

    /// Wait for workers to exit after `shutdown`. Blocks while a worker is
    /// still inside a remote exchange.
    pub fn join(&self) {
        self.pool.join();
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn user_id(&self) -> Option<u64> {
        self.user_id
    }

    pub fn peer(&self) -> Option<&PeerDescriptor> {
        self.peer.as_ref()
    }

    /// Whether the initial connection and registration succeeded.
    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn workers(&self) -> usize {
        self.pool.size()
    }
}
