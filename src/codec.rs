//! One offload exchange on a Ready channel: encode the invocation, read the
//! [`ResultContainer`], patch the receiver with the returned state.

use std::io::Write;

use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::Channel;
use crate::error::{ProtocolError, RemoteError};
use crate::invocation::MethodIdentity;
use crate::protocol::{self, InvocationDescriptor, ReceiverSnapshot, ResultContainer};
use crate::registry::Offloadable;

/// Build the descriptor from a fresh snapshot of the receiver.
pub fn describe(
    identity: &MethodIdentity,
    args: &[Value],
    receiver: &dyn Offloadable,
) -> Result<InvocationDescriptor, RemoteError> {
    let state = receiver.snapshot().map_err(RemoteError::Snapshot)?;
    Ok(InvocationDescriptor {
        receiver: ReceiverSnapshot {
            type_name: identity.type_name.clone(),
            state,
        },
        method: identity.method.clone(),
        param_types: identity.param_types.clone(),
        args: args.to_vec(),
    })
}

/// Encode a full offload request into a new buffer.
pub fn encode_request(descriptor: &InvocationDescriptor) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    protocol::write_opcode(&mut buf, protocol::OFFLOAD_REQUEST)?;
    protocol::write_u32(&mut buf, protocol::SINGLE_REPLICA)?;
    protocol::write_frame(&mut buf, descriptor)?;
    Ok(buf)
}

/// Run one request/response round trip and apply the returned state.
///
/// The channel is left as-is; on error the caller decides whether it is
/// still usable.
pub fn execute_remote(
    channel: &mut Channel,
    identity: &MethodIdentity,
    args: &[Value],
    receiver: &mut dyn Offloadable,
) -> Result<ResultContainer, RemoteError> {
    let descriptor = describe(identity, args, receiver)?;
    let request = encode_request(&descriptor)?;

    let stream = channel.ready_transport()?;
    stream.write_all(&request).map_err(ProtocolError::from)?;
    stream.flush().map_err(ProtocolError::from)?;
    debug!(method = %identity, bytes = request.len(), "offload request sent");

    let container: ResultContainer = protocol::read_frame(stream)?;
    if container.function_result.is_success() {
        apply_state(&container, receiver)?;
    } else if container.state_delta.is_some() {
        // The caller may rerun the method locally on this receiver.
        warn!(method = %identity, "dropping receiver state sent with a failed result");
    }
    Ok(container)
}

/// Merge the peer's post-call state into the local receiver. A missing
/// delta means the call failed remotely; the failure travels in the result.
pub fn apply_state(
    container: &ResultContainer,
    receiver: &mut dyn Offloadable,
) -> Result<(), RemoteError> {
    match &container.state_delta {
        Some(delta) => receiver
            .merge_state(delta.clone())
            .map_err(RemoteError::ApplyState),
        None => {
            warn!(result = ?container.function_result, "peer returned no receiver state");
            Ok(())
        }
    }
}
