//! Wire format shared by the daemon and its clients.
//!
//! Every connection starts with the 4-byte [`MAGIC`] tag followed by one
//! [`Opcode`] byte. All integers are little-endian.
//!
//! - `OpenMaster`: daemon answers with the 4-byte terminal id, then the socket
//!   becomes a raw byte relay to the master handle.
//! - `OpenSlave`: client sends the 4-byte terminal id, then the socket becomes
//!   a raw byte relay to a freshly opened slave handle.
//! - `Ioctl`: one [`IoctlRequest`] frame in, one [`IoctlReply`] out, close.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BridgeError;
use crate::provider::{IoctlArg, Role, TerminalId};

pub const MAGIC: [u8; 4] = *b"upty";

/// Largest argument payload an ioctl frame can carry (length is one byte).
pub const MAX_IOCTL_ARG_LEN: usize = u8::MAX as usize;

/// Argument-kind tag for an inline integer argument. Any other tag means the
/// payload is a buffer passed by reference.
pub const ARG_KIND_VALUE: u8 = 0;
pub const ARG_KIND_BUFFER: u8 = 1;

// Linux tty ioctl request codes.
pub const TCGETS: u64 = 0x5401;
pub const TCSETS: u64 = 0x5402;
pub const TCSETSW: u64 = 0x5403;
pub const TCSETSF: u64 = 0x5404;
pub const TCSBRK: u64 = 0x5409;
pub const TCXONC: u64 = 0x540A;
pub const TCFLSH: u64 = 0x540B;
pub const TIOCSCTTY: u64 = 0x540E;
pub const TIOCGPGRP: u64 = 0x540F;
pub const TIOCSPGRP: u64 = 0x5410;
pub const TIOCGWINSZ: u64 = 0x5413;
pub const TIOCSWINSZ: u64 = 0x5414;
pub const FIONREAD: u64 = 0x541B;
pub const TIOCNOTTY: u64 = 0x5422;
pub const TCSBRKP: u64 = 0x5425;
pub const TIOCSBRK: u64 = 0x5427;
pub const TIOCCBRK: u64 = 0x5428;
pub const TIOCGPTN: u64 = 0x8004_5430;
pub const TIOCSPTLCK: u64 = 0x4004_5431;
pub const TIOCGPTLCK: u64 = 0x8004_5439;

/// Requests that need the caller's process/session context. They are answered
/// by the daemon and never reach a terminal provider.
pub const CONTROL_IOCTLS: [u64; 4] = [TIOCSCTTY, TIOCGPGRP, TIOCNOTTY, TIOCSPGRP];

pub fn is_control_ioctl(request: u64) -> bool {
    CONTROL_IOCTLS.contains(&request)
}

/// Requests whose third argument is a plain integer rather than a pointer.
pub const INTEGER_ARG_IOCTLS: [u64; 6] = [TCSBRK, TCXONC, TCFLSH, TCSBRKP, TIOCSBRK, TIOCCBRK];

pub fn takes_integer_arg(request: u64) -> bool {
    INTEGER_ARG_IOCTLS.contains(&request)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    OpenMaster = 0,
    OpenSlave = 1,
    Ioctl = 2,
}

impl TryFrom<u8> for Opcode {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::OpenMaster),
            1 => Ok(Opcode::OpenSlave),
            2 => Ok(Opcode::Ioctl),
            other => Err(BridgeError::ProtocolViolation(other)),
        }
    }
}

/// Reads and validates the magic tag, then the opcode byte.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Opcode, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(BridgeError::ProtocolMismatch { found: magic });
    }
    let opcode = reader.read_u8().await?;
    Opcode::try_from(opcode)
}

pub async fn write_handshake<W>(writer: &mut W, opcode: Opcode) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = [0u8; 5];
    frame[..4].copy_from_slice(&MAGIC);
    frame[4] = opcode as u8;
    writer.write_all(&frame).await
}

pub async fn read_terminal_id<R>(reader: &mut R) -> io::Result<TerminalId>
where
    R: AsyncRead + Unpin,
{
    reader.read_u32_le().await
}

pub async fn write_terminal_id<W>(writer: &mut W, id: TerminalId) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&id.to_le_bytes()).await?;
    writer.flush().await
}

/// One ioctl request as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlRequest {
    pub id: TerminalId,
    pub role: Role,
    pub request: u64,
    pub arg_kind: u8,
    pub payload: Vec<u8>,
}

impl IoctlRequest {
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let id = reader.read_u32_le().await?;
        let role = Role::from_wire(reader.read_u8().await?);
        let request = reader.read_u64_le().await?;
        let arg_kind = reader.read_u8().await?;
        let len = reader.read_u8().await? as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Self {
            id,
            role,
            request,
            arg_kind,
            payload,
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let len = u8::try_from(self.payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "ioctl argument is {} bytes, limit is {}",
                    self.payload.len(),
                    MAX_IOCTL_ARG_LEN
                ),
            )
        })?;
        let mut frame = Vec::with_capacity(15 + self.payload.len());
        frame.extend_from_slice(&self.id.to_le_bytes());
        frame.push(self.role.to_wire());
        frame.extend_from_slice(&self.request.to_le_bytes());
        frame.push(self.arg_kind);
        frame.push(len);
        frame.extend_from_slice(&self.payload);
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    /// Decodes the argument the way the provider receives it.
    pub fn arg(&self) -> IoctlArg {
        if self.arg_kind == ARG_KIND_VALUE {
            let mut raw = [0u8; 8];
            let n = self.payload.len().min(8);
            raw[..n].copy_from_slice(&self.payload[..n]);
            IoctlArg::Value(u64::from_le_bytes(raw))
        } else {
            IoctlArg::Buffer(self.payload.clone())
        }
    }
}

/// Reply to an [`IoctlRequest`]: the argument payload (same length as sent,
/// possibly rewritten by the provider), the return value and an error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlReply {
    pub payload: Vec<u8>,
    pub ret: i32,
    pub errno: i32,
}

impl IoctlReply {
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut frame = Vec::with_capacity(self.payload.len() + 8);
        frame.extend_from_slice(&self.payload);
        frame.extend_from_slice(&self.ret.to_le_bytes());
        frame.extend_from_slice(&self.errno.to_le_bytes());
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    /// `arg_len` is the payload length of the request this replies to.
    pub async fn read_from<R>(reader: &mut R, arg_len: usize) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut payload = vec![0u8; arg_len];
        reader.read_exact(&mut payload).await?;
        let ret = reader.read_i32_le().await?;
        let errno = reader.read_i32_le().await?;
        Ok(Self {
            payload,
            ret,
            errno,
        })
    }
}
