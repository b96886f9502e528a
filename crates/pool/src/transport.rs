//! TRANSPORT boundary (spec §1 "out of scope"): frame-level crypto,
//! chunking and authenticated channel setup given a socket and a PoW
//! target. The pool only depends on the [`Transport`] / [`Authenticator`]
//! traits; the plaintext implementation below exists so the crate's own
//! integration tests can run two pools against each other over loopback
//! TCP without pulling in a real cryptographic stack.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::config::Identity;
use crate::registry::peer::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer failed proof-of-work check")]
    ProofOfWorkRejected,
    #[error("no common protocol version")]
    NoCommonProtocol,
    #[error("peer handshake malformed: {0}")]
    Malformed(String),
    #[error("transport closed")]
    Closed,
}

/// The read half of an authenticated channel. Owned exclusively by the
/// connection's control worker (spec §4.4: "single task owning the read
/// side of the TRANSPORT").
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Read the next whole frame, or `Ok(None)` on a graceful EOF.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, Error>;
}

/// The write half of an authenticated channel. May be cloned/shared so
/// that both the higher layer's `write` calls and the control worker's
/// replies (bootstrap/advertise/swap) can send frames independently of
/// the read loop.
#[async_trait]
pub trait FrameWriter: Send + Sync + 'static {
    /// Write a whole frame, chunked internally at the transport's
    /// configured chunk size.
    async fn write_frame(&self, payload: &[u8]) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// An authenticated, bidirectional, chunked byte channel, split into
/// independent read/write halves the way `TcpStream::into_split` does.
pub trait Transport: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Result of a successful authenticated handshake: TRANSPORT already
/// split into its two halves, type-erased so the pool orchestrator
/// doesn't need to be generic over the concrete transport (only over the
/// [`Authenticator`], which is itself usually stored as `Arc<dyn ...>`
/// behind a non-generic wrapper — see `pool::PoolBuilder`).
pub struct Authenticated {
    pub reader: Box<dyn FrameReader>,
    pub writer: Arc<dyn FrameWriter>,
    pub peer_id: PeerId,
    pub negotiated_version: u16,
    pub peer_listening_port: Option<u16>,
}

/// Performs the authenticate-and-negotiate phase of the handshake pipeline
/// (spec §4.5 step 4) given a raw socket.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate_outbound(
        &self,
        stream: TcpStream,
        pow_target: u64,
        local: &Identity,
        local_versions: &[u16],
        local_listening_port: Option<u16>,
    ) -> Result<Authenticated, Error>;

    async fn authenticate_inbound(
        &self,
        stream: TcpStream,
        pow_target: u64,
        local: &Identity,
        local_versions: &[u16],
        local_listening_port: Option<u16>,
    ) -> Result<Authenticated, Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Authenticator {}

    #[async_trait]
    impl Authenticator for Authenticator {
        async fn authenticate_outbound(
            &self,
            stream: TcpStream,
            pow_target: u64,
            local: &Identity,
            local_versions: &[u16],
            local_listening_port: Option<u16>,
        ) -> Result<Authenticated, Error>;

        async fn authenticate_inbound(
            &self,
            stream: TcpStream,
            pow_target: u64,
            local: &Identity,
            local_versions: &[u16],
            local_listening_port: Option<u16>,
        ) -> Result<Authenticated, Error>;
    }
}

#[cfg(test)]
mod mock_tests {
    use super::*;

    #[test]
    fn mock_authenticator_constructs() {
        let mut _mock = MockAuthenticator::new();
    }
}

/// Length-prefixed framing over a raw [`TcpStream`], with no encryption.
///
/// Reference implementation only: a real deployment plugs in a TRANSPORT
/// that actually encrypts and authenticates the channel.
pub struct PlaintextTransport {
    stream: TcpStream,
    chunk_size: usize,
}

impl Transport for PlaintextTransport {
    type Reader = PlaintextReader;
    type Writer = PlaintextWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = self.stream.into_split();
        (
            PlaintextReader { read },
            PlaintextWriter {
                write: tokio::sync::Mutex::new(write),
                chunk_size: self.chunk_size,
            },
        )
    }
}

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub struct PlaintextReader {
    read: OwnedReadHalf,
}

#[async_trait]
impl FrameReader for PlaintextReader {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut len_buf = [0u8; 4];
        match self.read.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(Error::Malformed(format!("frame length {len} exceeds cap")));
        }
        let mut payload = vec![0u8; len as usize];
        self.read.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

/// Chunked writes at `binary_chunks_size` (spec §6), serialized behind a
/// mutex since [`FrameWriter::write_frame`] takes `&self` so it can be
/// shared between the higher layer and the control worker's replies.
pub struct PlaintextWriter {
    write: tokio::sync::Mutex<OwnedWriteHalf>,
    chunk_size: usize,
}

#[async_trait]
impl FrameWriter for PlaintextWriter {
    async fn write_frame(&self, payload: &[u8]) -> Result<(), Error> {
        let mut write = self.write.lock().await;
        let len = payload.len() as u32;
        write_chunked(&mut write, &len.to_be_bytes(), self.chunk_size.max(1)).await?;
        write_chunked(&mut write, payload, self.chunk_size.max(1)).await?;
        write.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
        Ok(())
    }
}

async fn write_chunked(
    write: &mut OwnedWriteHalf,
    mut buf: &[u8],
    chunk_size: usize,
) -> Result<(), Error> {
    while !buf.is_empty() {
        let n = buf.len().min(chunk_size);
        write.write_all(&buf[..n]).await?;
        buf = &buf[n..];
    }
    Ok(())
}

/// Reference [`Authenticator`]: exchanges a PoW stamp and the local
/// version list over the plain socket, with no encryption. Accepts any
/// non-empty stamp as proof of work (real PoW verification belongs to the
/// identity module, out of scope here).
#[derive(Debug, Clone, Default)]
pub struct PlaintextAuthenticator {
    pub chunk_size: usize,
}

impl PlaintextAuthenticator {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    async fn exchange(
        &self,
        mut stream: TcpStream,
        _pow_target: u64,
        local: &Identity,
        local_versions: &[u16],
        local_listening_port: Option<u16>,
        initiator: bool,
    ) -> Result<Authenticated, Error> {
        let hello = HelloMessage {
            public_id: local.public_id.clone(),
            pow_stamp: local.pow_stamp.clone(),
            versions: local_versions.to_vec(),
            listening_port: local_listening_port,
        };
        let encoded = hello.encode();
        stream
            .write_all(&(encoded.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&encoded).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await?;
        let peer_hello = HelloMessage::decode(&buf)?;

        if peer_hello.pow_stamp.is_empty() {
            return Err(Error::ProofOfWorkRejected);
        }

        // Spec §6: the negotiated version is the first entry of the
        // initiator's list that also appears in the responder's list, so
        // both ends must walk the same (the initiator's) list order
        // rather than each consulting its own.
        let negotiated_version = if initiator {
            local_versions
                .iter()
                .find(|v| peer_hello.versions.contains(v))
                .copied()
                .ok_or(Error::NoCommonProtocol)?
        } else {
            peer_hello
                .versions
                .iter()
                .find(|v| local_versions.contains(v))
                .copied()
                .ok_or(Error::NoCommonProtocol)?
        };

        let transport = PlaintextTransport {
            stream,
            chunk_size: self.chunk_size.max(1),
        };
        let (reader, writer) = transport.split();

        Ok(Authenticated {
            reader: Box::new(reader),
            writer: Arc::new(writer),
            peer_id: PeerId::from_bytes(peer_hello.public_id),
            negotiated_version,
            peer_listening_port: peer_hello.listening_port,
        })
    }
}

#[async_trait]
impl Authenticator for PlaintextAuthenticator {
    async fn authenticate_outbound(
        &self,
        stream: TcpStream,
        pow_target: u64,
        local: &Identity,
        local_versions: &[u16],
        local_listening_port: Option<u16>,
    ) -> Result<Authenticated, Error> {
        self.exchange(stream, pow_target, local, local_versions, local_listening_port, true)
            .await
    }

    async fn authenticate_inbound(
        &self,
        stream: TcpStream,
        pow_target: u64,
        local: &Identity,
        local_versions: &[u16],
        local_listening_port: Option<u16>,
    ) -> Result<Authenticated, Error> {
        self.exchange(stream, pow_target, local, local_versions, local_listening_port, false)
            .await
    }
}

struct HelloMessage {
    public_id: Vec<u8>,
    pow_stamp: Vec<u8>,
    versions: Vec<u16>,
    listening_port: Option<u16>,
}

impl HelloMessage {
    fn encode(&self) -> Vec<u8> {
        #[derive(serde::Serialize)]
        struct Wire<'a> {
            public_id: &'a [u8],
            pow_stamp: &'a [u8],
            versions: &'a [u16],
            listening_port: Option<u16>,
        }
        serde_json::to_vec(&Wire {
            public_id: &self.public_id,
            pow_stamp: &self.pow_stamp,
            versions: &self.versions,
            listening_port: self.listening_port,
        })
        .expect("hello message is always serializable")
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        #[derive(serde::Deserialize)]
        struct Wire {
            public_id: Vec<u8>,
            pow_stamp: Vec<u8>,
            versions: Vec<u16>,
            listening_port: Option<u16>,
        }
        let wire: Wire =
            serde_json::from_slice(bytes).map_err(|e| Error::Malformed(e.to_string()))?;
        Ok(Self {
            public_id: wire.public_id,
            pow_stamp: wire.pow_stamp,
            versions: wire.versions,
            listening_port: wire.listening_port,
        })
    }
}
