//! Single request/response ioctl exchange.
//!
//! One [`IoctlRequest`] is read, executed against the registry, answered with
//! one [`IoctlReply`], and the connection is closed. Requests naming a handle
//! that is not (or no longer) registered get no reply at all.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::protocol::{is_control_ioctl, IoctlReply, IoctlRequest};
use crate::provider::{IoctlArg, PtyHandle, SharedHandle};
use crate::registry::Registry;

pub async fn serve<S>(mut stream: S, registry: &Registry) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = IoctlRequest::read_from(&mut stream).await?;
    let handle = resolve(&request, registry)?;
    // Some requests (TCSETSW) wait for output to drain.
    let reply = tokio::task::spawn_blocking(move || execute_on(&*handle, &request))
        .await
        .map_err(|e| BridgeError::Transport(io::Error::other(e)))?;
    reply.write_to(&mut stream).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Runs `request` against the registered handle. Provider failures and
/// rejected control requests become error codes in the reply; only a missing
/// handle is an error.
pub fn execute(request: &IoctlRequest, registry: &Registry) -> Result<IoctlReply, BridgeError> {
    let handle = resolve(request, registry)?;
    Ok(execute_on(&*handle, request))
}

fn resolve(request: &IoctlRequest, registry: &Registry) -> Result<SharedHandle, BridgeError> {
    registry
        .lookup(request.id, request.role)
        .ok_or(BridgeError::UnknownHandle {
            id: request.id,
            role: request.role,
        })
}

fn execute_on(handle: &dyn PtyHandle, request: &IoctlRequest) -> IoctlReply {
    if is_control_ioctl(request.request) {
        let err = BridgeError::ControlIoctlUnsupported(request.request);
        warn!(id = request.id, role = %request.role, "{}", err);
        return failed_reply(request, &err);
    }

    let mut arg = request.arg();
    match handle.ioctl(request.request, &mut arg) {
        Ok(ret) => {
            debug!(
                id = request.id,
                role = %request.role,
                request = request.request,
                ret,
                "ioctl forwarded"
            );
            IoctlReply {
                payload: reply_payload(request, arg),
                ret,
                errno: 0,
            }
        }
        Err(source) => {
            let err = BridgeError::ProviderIoctlFailed {
                request: request.request,
                source,
            };
            debug!(id = request.id, role = %request.role, "{}", err);
            failed_reply(request, &err)
        }
    }
}

fn failed_reply(request: &IoctlRequest, err: &BridgeError) -> IoctlReply {
    IoctlReply {
        payload: request.payload.clone(),
        ret: -1,
        errno: err.errno(),
    }
}

/// The reply always carries exactly as many bytes as the request did.
fn reply_payload(request: &IoctlRequest, arg: IoctlArg) -> Vec<u8> {
    match arg {
        IoctlArg::Value(_) => request.payload.clone(),
        IoctlArg::Buffer(mut buf) => {
            buf.resize(request.payload.len(), 0);
            buf
        }
    }
}
