//! Connection lifecycle to the peer: secure-first connect with plaintext
//! fallback, and the one-time application registration per channel.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use tracing::{debug, info, warn};

use crate::app::AppPackage;
use crate::config::TlsSettings;
use crate::error::{ConnectError, ProtocolError, RegisterError, RemoteError, TlsError};
use crate::protocol::{self, PeerDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    /// Transport is up; registration has not run yet.
    Connecting,
    Registered,
    Ready,
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    AlreadyPresent,
    Uploaded { bytes: u64 },
}

pub enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// Trust material for secure channels.
#[derive(Clone)]
pub struct TlsClient {
    config: Arc<ClientConfig>,
    server_name: Option<String>,
}

impl TlsClient {
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, TlsError> {
        let certs = CertificateDer::pem_file_iter(&settings.ca_file)
            .map_err(|err| TlsError::Pem {
                path: settings.ca_file.clone(),
                message: format!("{err:?}"),
            })?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| TlsError::Pem {
                path: settings.ca_file.clone(),
                message: format!("{err:?}"),
            })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates(settings.ca_file.clone()));
        }

        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots.add(cert)?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            config: Arc::new(config),
            server_name: settings.server_name.clone(),
        })
    }

    fn handshake(
        &self,
        peer: &PeerDescriptor,
        sock: TcpStream,
    ) -> Result<StreamOwned<ClientConnection, TcpStream>, String> {
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| peer.address.clone());
        let server_name =
            ServerName::try_from(name.clone()).map_err(|_| TlsError::ServerName(name).to_string())?;
        let conn = ClientConnection::new(Arc::clone(&self.config), server_name)
            .map_err(|err| err.to_string())?;
        let mut stream = StreamOwned::new(conn, sock);
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|err| format!("TLS handshake failed: {err}"))?;
        }
        Ok(stream)
    }
}

/// One connection to the peer, exclusively owned by a single worker.
pub struct Channel {
    state: ChannelState,
    transport: Option<Transport>,
    secure: bool,
}

impl Channel {
    /// A channel that never connected; it must not carry offload requests.
    pub fn broken() -> Self {
        Self {
            state: ChannelState::Broken,
            transport: None,
            secure: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ChannelState::Ready
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn mark_ready(&mut self) {
        if self.state == ChannelState::Registered {
            self.state = ChannelState::Ready;
        }
    }

    /// Drop the transport; the socket closes and the channel stays Broken.
    pub fn mark_broken(&mut self) {
        self.state = ChannelState::Broken;
        self.transport = None;
    }

    /// Transport of a Ready channel, for one request/response exchange.
    pub fn ready_transport(&mut self) -> Result<&mut Transport, RemoteError> {
        if self.state != ChannelState::Ready {
            return Err(RemoteError::ChannelNotReady);
        }
        self.transport.as_mut().ok_or(RemoteError::ChannelNotReady)
    }

    /// Announce the application and upload it if the peer asks for it.
    ///
    /// Runs exactly once per channel: the peer binds the application context
    /// to the connection.
    pub fn register(
        &mut self,
        app: &AppPackage,
        chunk_bytes: usize,
    ) -> Result<Registration, RegisterError> {
        if self.state != ChannelState::Connecting {
            return Err(RegisterError::InvalidState(self.state));
        }
        let result = self.register_inner(app, chunk_bytes);
        match &result {
            Ok(_) => self.state = ChannelState::Registered,
            Err(_) => self.mark_broken(),
        }
        result
    }

    fn register_inner(
        &mut self,
        app: &AppPackage,
        chunk_bytes: usize,
    ) -> Result<Registration, RegisterError> {
        let stream = self
            .transport
            .as_mut()
            .ok_or(RegisterError::InvalidState(ChannelState::Disconnected))?;

        let mut header = Vec::with_capacity(16 + app.app_id.len());
        protocol::write_opcode(&mut header, protocol::REGISTER_APP)?;
        protocol::write_str(&mut header, &app.app_id)?;
        protocol::write_u64(&mut header, app.size)?;
        stream.write_all(&header).map_err(ProtocolError::from)?;
        stream.flush().map_err(ProtocolError::from)?;

        match protocol::read_opcode(stream)? {
            protocol::APP_PRESENT => {
                info!(app = %app.app_id, "application already present on the peer");
                Ok(Registration::AlreadyPresent)
            }
            protocol::APP_REQUEST => {
                info!(app = %app.app_id, bytes = app.size, "peer requested the application, uploading");
                let sent = upload(stream, app, chunk_bytes)?;
                protocol::expect_opcode(stream, protocol::UPLOAD_ACK)?;
                debug!(sent, "upload acknowledged");
                Ok(Registration::Uploaded { bytes: sent })
            }
            got => Err(RegisterError::Protocol(ProtocolError::UnexpectedOpcode {
                got,
                expected: "APP_PRESENT or APP_REQUEST",
            })),
        }
    }
}

fn upload(
    stream: &mut Transport,
    app: &AppPackage,
    chunk_bytes: usize,
) -> Result<u64, RegisterError> {
    let mut reader = app.open().map_err(RegisterError::Upload)?;
    let mut buf = vec![0_u8; chunk_bytes.max(1)];
    let mut sent: u64 = 0;
    while sent < app.size {
        let want = buf.len().min((app.size - sent) as usize);
        let n = reader.read(&mut buf[..want]).map_err(RegisterError::Upload)?;
        if n == 0 {
            return Err(RegisterError::ShortPayload {
                sent,
                expected: app.size,
            });
        }
        stream
            .write_all(&buf[..n])
            .map_err(|err| RegisterError::Protocol(err.into()))?;
        sent += n as u64;
    }
    stream
        .flush()
        .map_err(|err| RegisterError::Protocol(err.into()))?;
    Ok(sent)
}

fn resolve(endpoint: &str) -> io::Result<SocketAddr> {
    endpoint.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for '{endpoint}'"),
        )
    })
}

fn open_socket(endpoint: &str, timeout: Duration) -> io::Result<TcpStream> {
    let addr = resolve(endpoint)?;
    let sock = TcpStream::connect_timeout(&addr, timeout)?;
    sock.set_nodelay(true)?;
    Ok(sock)
}

/// Connect to the peer, secure first when requested and possible, falling
/// back to one plaintext attempt.
pub fn connect(
    peer: &PeerDescriptor,
    want_secure: bool,
    tls: Option<&TlsClient>,
    timeout: Duration,
) -> Result<Channel, ConnectError> {
    if peer.address.trim().is_empty() {
        return Err(ConnectError::Address(peer.address.clone()));
    }

    let mut secure_failure = None;
    if want_secure && peer.crypto_capable {
        info!(endpoint = %peer.secure_endpoint(), "connecting to peer over TLS");
        let attempt = match tls {
            Some(tls) => open_socket(&peer.secure_endpoint(), timeout)
                .map_err(|err| err.to_string())
                .and_then(|sock| tls.handshake(peer, sock)),
            None => Err("no TLS trust material configured".to_string()),
        };
        match attempt {
            Ok(stream) => {
                return Ok(Channel {
                    state: ChannelState::Connecting,
                    transport: Some(Transport::Tls(Box::new(stream))),
                    secure: true,
                })
            }
            Err(err) => {
                warn!(error = %err, "secure connect failed, falling back to plaintext");
                secure_failure = Some(err);
            }
        }
    }

    info!(endpoint = %peer.plaintext_endpoint(), "connecting to peer in clear");
    match open_socket(&peer.plaintext_endpoint(), timeout) {
        Ok(sock) => Ok(Channel {
            state: ChannelState::Connecting,
            transport: Some(Transport::Plain(sock)),
            secure: false,
        }),
        Err(plaintext) => Err(ConnectError::Unreachable {
            address: peer.address.clone(),
            secure: secure_failure,
            plaintext,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn local_peer(port: u16, crypto: bool) -> PeerDescriptor {
        PeerDescriptor {
            address: "127.0.0.1".to_string(),
            port,
            secure_port: closed_port(),
            crypto_capable: crypto,
        }
    }

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn connect_falls_back_to_plaintext_when_secure_port_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = local_peer(port, true);

        let ch = connect(&peer, true, None, Duration::from_secs(2)).expect("plaintext fallback");
        assert_eq!(ch.state(), ChannelState::Connecting);
        assert!(!ch.is_secure());
    }

    #[test]
    fn connect_fails_when_both_ports_are_closed() {
        let peer = local_peer(closed_port(), true);
        let err = connect(&peer, true, None, Duration::from_secs(2))
            .err()
            .expect("both attempts should fail");
        match err {
            ConnectError::Unreachable { secure, .. } => assert!(secure.is_some()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn register_reads_app_present_and_sends_nothing_else() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            protocol::expect_opcode(&mut sock, protocol::REGISTER_APP).unwrap();
            let app_id = protocol::read_str(&mut sock).unwrap();
            let size = protocol::read_u64(&mut sock).unwrap();
            protocol::write_opcode(&mut sock, protocol::APP_PRESENT).unwrap();
            (app_id, size)
        });

        let mut ch = connect(&local_peer(port, false), false, None, Duration::from_secs(2)).unwrap();
        let app = AppPackage::from_bytes("calc", vec![1, 2, 3]);
        assert_eq!(ch.register(&app, 4096).unwrap(), Registration::AlreadyPresent);
        assert_eq!(ch.state(), ChannelState::Registered);
        ch.mark_ready();
        assert!(ch.is_ready());

        let (app_id, size) = server.join().unwrap();
        assert_eq!(app_id, "calc");
        assert_eq!(size, 3);

        let err = ch.register(&app, 4096).unwrap_err();
        assert!(matches!(err, RegisterError::InvalidState(ChannelState::Ready)), "{err}");
    }

    #[test]
    fn register_uploads_payload_in_chunks_when_requested() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            protocol::expect_opcode(&mut sock, protocol::REGISTER_APP).unwrap();
            let _ = protocol::read_str(&mut sock).unwrap();
            let size = protocol::read_u64(&mut sock).unwrap();
            protocol::write_opcode(&mut sock, protocol::APP_REQUEST).unwrap();
            let mut payload = vec![0_u8; size as usize];
            sock.read_exact(&mut payload).unwrap();
            protocol::write_opcode(&mut sock, protocol::UPLOAD_ACK).unwrap();
            payload
        });

        let bytes: Vec<u8> = (0..10_000_u32).map(|i| (i % 251) as u8).collect();
        let app = AppPackage::from_bytes("calc", bytes.clone());
        let mut ch = connect(&local_peer(port, false), false, None, Duration::from_secs(2)).unwrap();
        let reg = ch.register(&app, 4096).unwrap();
        assert_eq!(reg, Registration::Uploaded { bytes: 10_000 });
        assert_eq!(server.join().unwrap(), bytes);
    }

    #[test]
    fn register_breaks_channel_on_unexpected_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut header = [0_u8; 1 + 2 + 4 + 8];
            sock.read_exact(&mut header).unwrap();
            protocol::write_opcode(&mut sock, 0x7f).unwrap();
        });

        let app = AppPackage::from_bytes("calc", vec![0; 4]);
        let mut ch = connect(&local_peer(port, false), false, None, Duration::from_secs(2)).unwrap();
        assert!(ch.register(&app, 4096).is_err());
        assert_eq!(ch.state(), ChannelState::Broken);
        assert!(matches!(ch.ready_transport(), Err(RemoteError::ChannelNotReady)));
    }

    #[test]
    fn register_rejects_a_wrong_upload_acknowledgement() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            protocol::expect_opcode(&mut sock, protocol::REGISTER_APP).unwrap();
            let _ = protocol::read_str(&mut sock).unwrap();
            let size = protocol::read_u64(&mut sock).unwrap();
            protocol::write_opcode(&mut sock, protocol::APP_REQUEST).unwrap();
            let mut payload = vec![0_u8; size as usize];
            sock.read_exact(&mut payload).unwrap();
            // Storage failed on this side: no ack, a second upload request instead.
            protocol::write_opcode(&mut sock, protocol::APP_REQUEST).unwrap();
        });

        let app = AppPackage::from_bytes("calc", vec![9; 64]);
        let mut ch = connect(&local_peer(port, false), false, None, Duration::from_secs(2)).unwrap();
        let err = ch.register(&app, 16).unwrap_err();
        assert!(
            matches!(
                err,
                RegisterError::Protocol(ProtocolError::UnexpectedOpcode { got: protocol::APP_REQUEST, .. })
            ),
            "{err}"
        );
        assert_eq!(ch.state(), ChannelState::Broken);
    }
}
