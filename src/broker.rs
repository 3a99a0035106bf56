//! Client side of the local resource broker that hands out the peer.

use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::ProtocolError;
use crate::protocol::{self, PeerDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerReply {
    pub user_id: u64,
    /// `None` when the broker sent a descriptor that could not be decoded.
    pub peer: Option<PeerDescriptor>,
}

/// One HELLO exchange with the broker.
pub fn request_peer(addr: &str) -> Result<BrokerReply, ProtocolError> {
    let mut sock = TcpStream::connect(addr)?;
    protocol::write_opcode(&mut sock, protocol::HELLO)?;
    sock.flush()?;

    let user_id = protocol::read_u64(&mut sock)?;
    let peer = match protocol::read_frame::<_, PeerDescriptor>(&mut sock) {
        Ok(peer) => Some(peer),
        Err(ProtocolError::Json(err)) => {
            error!(error = %err, "could not decode the peer descriptor from the broker");
            None
        }
        Err(err) => return Err(err),
    };
    Ok(BrokerReply { user_id, peer })
}

/// Ask the broker for the peer, retrying every `retry` until it answers.
/// There is no retry ceiling.
pub fn fetch_peer(addr: &str, retry: Duration) -> BrokerReply {
    loop {
        match request_peer(addr) {
            Ok(reply) => {
                info!(user_id = reply.user_id, peer = ?reply.peer, "received peer from broker");
                return reply;
            }
            Err(err) => {
                warn!(broker = addr, error = %err, retry_ms = retry.as_millis() as u64, "broker not reachable yet, retrying");
                thread::sleep(retry);
            }
        }
    }
}
