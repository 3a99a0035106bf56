//! Reference peer: accepts device channels, stores uploaded applications and
//! runs offloaded invocations through the shared [`MethodRegistry`].
//!
//! One thread per connection. Each connection binds its own application
//! context on REGISTER_APP and serves offload requests strictly in order.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use tracing::{debug, error, info, warn};

use crate::class_cache::ClassCache;
use crate::config::{PeerConfig, PeerTlsSettings};
use crate::error::ProtocolError;
use crate::instrument::nanos;
use crate::invocation::{ErrorKind, InvocationError, InvocationOutcome, MethodIdentity};
use crate::protocol::{self, InvocationDescriptor, PeerDescriptor, ResultContainer};
use crate::registry::MethodRegistry;

const APP_FILE: &str = "app.bin";

/// Counters exposed for tests and operators.
#[derive(Debug, Default)]
pub struct PeerStats {
    connections: AtomicU64,
    disconnections: AtomicU64,
    registrations: AtomicU64,
    uploads: AtomicU64,
    offload_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub disconnections: u64,
    pub registrations: u64,
    pub uploads: u64,
    pub offload_requests: u64,
}

impl PeerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::SeqCst),
            disconnections: self.disconnections.load(Ordering::SeqCst),
            registrations: self.registrations.load(Ordering::SeqCst),
            uploads: self.uploads.load(Ordering::SeqCst),
            offload_requests: self.offload_requests.load(Ordering::SeqCst),
        }
    }
}

struct PeerContext {
    apps_dir: PathBuf,
    registry: Arc<MethodRegistry>,
    platform: HashSet<String>,
    stats: Arc<PeerStats>,
}

/// Application bound to one connection by REGISTER_APP.
struct Session {
    app_id: String,
    classes: ClassCache,
}

pub struct PeerServer {
    listener: TcpListener,
    secure: Option<(TcpListener, Arc<ServerConfig>)>,
    ctx: Arc<PeerContext>,
}

impl PeerServer {
    pub fn bind(config: &PeerConfig, registry: Arc<MethodRegistry>) -> Result<Self> {
        fs::create_dir_all(&config.apps_dir).with_context(|| {
            format!(
                "failed to create apps dir '{}'",
                config.apps_dir.display()
            )
        })?;
        let listener = TcpListener::bind(&config.bind)
            .with_context(|| format!("failed to bind peer at {}", config.bind))?;

        let secure = match (&config.secure_bind, &config.tls) {
            (Some(addr), Some(tls)) => {
                let tls_config = server_tls_config(tls)?;
                let l = TcpListener::bind(addr)
                    .with_context(|| format!("failed to bind secure peer at {addr}"))?;
                Some((l, tls_config))
            }
            (Some(_), None) => return Err(anyhow!("secure_bind requires a tls section")),
            (None, _) => None,
        };

        let platform = registry.type_names().map(str::to_string).collect();
        Ok(Self {
            listener,
            secure,
            ctx: Arc::new(PeerContext {
                apps_dir: config.apps_dir.clone(),
                registry,
                platform,
                stats: Arc::new(PeerStats::default()),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn secure_addr(&self) -> Option<SocketAddr> {
        self.secure
            .as_ref()
            .and_then(|(l, _)| l.local_addr().ok())
    }

    pub fn stats(&self) -> Arc<PeerStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Descriptor a device would use to reach this server at `address`.
    pub fn descriptor(&self, address: &str) -> Result<PeerDescriptor> {
        let port = self.local_addr()?.port();
        let secure_port = self.secure_addr().map(|a| a.port());
        Ok(PeerDescriptor {
            address: address.to_string(),
            port,
            secure_port: secure_port.unwrap_or(port),
            crypto_capable: secure_port.is_some(),
        })
    }

    /// Serve on a background thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("offload-peer".to_string())
            .spawn(move || {
                if let Err(err) = self.serve() {
                    error!(error = %format!("{err:#}"), "peer server stopped");
                }
            })
            .context("failed to spawn peer server thread")
    }

    /// Accept connections until the listener fails.
    pub fn serve(self) -> Result<()> {
        info!(addr = ?self.local_addr().ok(), secure = ?self.secure_addr(), "offload peer listening");
        if let Some((listener, tls)) = self.secure {
            let ctx = Arc::clone(&self.ctx);
            thread::Builder::new()
                .name("offload-peer-tls".to_string())
                .spawn(move || accept_loop(listener, ctx, Some(tls)))
                .context("failed to spawn secure accept thread")?;
        }
        accept_loop(self.listener, self.ctx, None);
        Ok(())
    }
}

fn server_tls_config(tls: &PeerTlsSettings) -> Result<Arc<ServerConfig>> {
    let certs = CertificateDer::pem_file_iter(&tls.cert_file)
        .map_err(|err| anyhow!("failed to read certificates '{}': {err:?}", tls.cert_file.display()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| anyhow!("failed to parse certificates '{}': {err:?}", tls.cert_file.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in '{}'", tls.cert_file.display()));
    }
    let key = PrivateKeyDer::from_pem_file(&tls.key_file)
        .map_err(|err| anyhow!("failed to read private key '{}': {err:?}", tls.key_file.display()))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate/key pair")?;
    Ok(Arc::new(config))
}

fn accept_loop(listener: TcpListener, ctx: Arc<PeerContext>, tls: Option<Arc<ServerConfig>>) {
    for incoming in listener.incoming() {
        let sock = match incoming {
            Ok(sock) => sock,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let conn = ctx.stats.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = Arc::clone(&ctx);
        let tls = tls.clone();
        let spawned = thread::Builder::new()
            .name(format!("offload-peer-conn-{conn}"))
            .spawn(move || {
                let peer_addr = sock.peer_addr().ok();
                info!(conn, peer = ?peer_addr, secure = tls.is_some(), "device connected");
                let result = match tls {
                    Some(cfg) => serve_tls(sock, cfg, &ctx, conn),
                    None => serve_connection(sock, &ctx, conn),
                };
                match result {
                    Ok(()) => info!(conn, "device disconnected"),
                    Err(err) => warn!(conn, error = %err, "connection closed on error"),
                }
                ctx.stats.disconnections.fetch_add(1, Ordering::SeqCst);
            });
        if let Err(err) = spawned {
            error!(error = %err, "failed to spawn connection thread");
        }
    }
}

fn serve_tls(
    sock: TcpStream,
    cfg: Arc<ServerConfig>,
    ctx: &PeerContext,
    conn: u64,
) -> Result<(), ProtocolError> {
    let server = ServerConnection::new(cfg)
        .map_err(|err| ProtocolError::Io(io::Error::new(io::ErrorKind::Other, err)))?;
    serve_connection(StreamOwned::new(server, sock), ctx, conn)
}

fn serve_connection<S: Read + Write>(
    mut stream: S,
    ctx: &PeerContext,
    conn: u64,
) -> Result<(), ProtocolError> {
    let mut session: Option<Session> = None;
    loop {
        let op = match protocol::read_opcode(&mut stream) {
            Ok(op) => op,
            Err(ProtocolError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(err) => return Err(err),
        };
        match op {
            protocol::REGISTER_APP => {
                let app_id = protocol::read_str(&mut stream)?;
                let size = protocol::read_u64(&mut stream)?;
                let app_dir = register_app(&mut stream, ctx, conn, &app_id, size)?;
                ctx.stats.registrations.fetch_add(1, Ordering::SeqCst);
                session = Some(Session {
                    classes: ClassCache::new(app_dir, ctx.platform.clone()),
                    app_id,
                });
            }
            protocol::OFFLOAD_REQUEST => {
                let replicas = protocol::read_u32(&mut stream)?;
                if replicas != protocol::SINGLE_REPLICA {
                    return Err(ProtocolError::ReplicaCount(replicas));
                }
                let descriptor: InvocationDescriptor = protocol::read_frame(&mut stream)?;
                ctx.stats.offload_requests.fetch_add(1, Ordering::SeqCst);
                let container = execute(ctx, session.as_ref(), descriptor);
                protocol::write_frame(&mut stream, &container)?;
                stream.flush()?;
            }
            got => {
                return Err(ProtocolError::UnexpectedOpcode {
                    got,
                    expected: "REGISTER_APP or OFFLOAD_REQUEST",
                })
            }
        }
    }
}

fn valid_app_id(app_id: &str) -> bool {
    !app_id.is_empty()
        && app_id != "."
        && app_id != ".."
        && !app_id.contains(['/', '\\', '\0'])
}

/// Answer APP_PRESENT when the stored payload matches `size`, otherwise ask
/// for the upload and store it atomically.
fn register_app<S: Read + Write>(
    stream: &mut S,
    ctx: &PeerContext,
    conn: u64,
    app_id: &str,
    size: u64,
) -> Result<PathBuf, ProtocolError> {
    if !valid_app_id(app_id) {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid application id '{app_id}'"),
        )));
    }
    let app_dir = ctx.apps_dir.join(app_id);
    let app_file = app_dir.join(APP_FILE);

    let present = fs::metadata(&app_file)
        .map(|m| m.is_file() && m.len() == size)
        .unwrap_or(false);
    if present {
        info!(conn, app = app_id, "application already present");
        protocol::write_opcode(stream, protocol::APP_PRESENT)?;
        stream.flush()?;
        return Ok(app_dir);
    }

    info!(conn, app = app_id, bytes = size, "requesting application upload");
    protocol::write_opcode(stream, protocol::APP_REQUEST)?;
    stream.flush()?;

    fs::create_dir_all(&app_dir)?;
    let partial = app_dir.join(format!("{APP_FILE}.part-{conn}"));
    let received = receive_payload(stream, &partial, size);
    match received {
        Ok(()) => fs::rename(&partial, &app_file)?,
        Err(err) => {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }
    }
    ctx.stats.uploads.fetch_add(1, Ordering::SeqCst);
    debug!(conn, app = app_id, path = %app_file.display(), "application stored");

    protocol::write_opcode(stream, protocol::UPLOAD_ACK)?;
    stream.flush()?;
    Ok(app_dir)
}

fn receive_payload<S: Read>(stream: &mut S, path: &Path, size: u64) -> Result<(), ProtocolError> {
    let mut file = File::create(path)?;
    let copied = io::copy(&mut stream.by_ref().take(size), &mut file)?;
    if copied != size {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("application upload ended after {copied} of {size} bytes"),
        )));
    }
    file.sync_all()?;
    Ok(())
}

fn failed(kind: ErrorKind, message: impl Into<String>) -> ResultContainer {
    ResultContainer {
        function_result: InvocationOutcome::failed(InvocationError::new(kind, message)),
        state_delta: None,
        pure_execution_nanos: 0,
    }
}

fn execute(
    ctx: &PeerContext,
    session: Option<&Session>,
    descriptor: InvocationDescriptor,
) -> ResultContainer {
    let Some(session) = session else {
        return failed(
            ErrorKind::Internal,
            "no application registered on this connection",
        );
    };
    let type_name = descriptor.receiver.type_name;
    if let Err(err) = session.classes.resolve(&type_name) {
        warn!(app = %session.app_id, class = %type_name, error = %err, "class resolution failed");
        return failed(ErrorKind::UnknownType, err.to_string());
    }
    let mut receiver = match ctx.registry.restore(&type_name, descriptor.receiver.state) {
        Some(Ok(receiver)) => receiver,
        Some(Err(err)) => return failed(ErrorKind::BadArguments, err.to_string()),
        None => {
            return failed(
                ErrorKind::UnknownType,
                format!("type '{type_name}' has no registered handlers on this peer"),
            )
        }
    };

    let identity = MethodIdentity {
        type_name,
        method: descriptor.method,
        param_types: descriptor.param_types,
    };
    let started = Instant::now();
    let outcome = ctx
        .registry
        .invoke(&identity, &mut *receiver, &descriptor.args);
    let pure_execution_nanos = nanos(started.elapsed());
    debug!(app = %session.app_id, method = %identity, ok = outcome.is_success(), "offloaded invocation finished");

    let state_delta = if outcome.is_success() {
        match receiver.snapshot() {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(method = %identity, error = %err, "could not snapshot receiver after call");
                None
            }
        }
    } else {
        None
    };
    ResultContainer {
        function_result: outcome,
        state_delta,
        pure_execution_nanos,
    }
}
