//! A live, handshaken TCP connection to one peer
//!
//! A connection has exactly one owner at a time: the pool while activating
//! it, then the worker it is handed to. All reads and writes go through
//! `&mut self`, so no lock is needed around the socket.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};

use super::bitfield::Bitfield;
use super::handshake::HandshakeCodec;
use super::messages::{MAX_FRAME_LEN, MessageCodec};
use super::types::{PeerHandshake, PeerId, PeerMessage};
use crate::config::NetworkConfig;
use crate::torrent::{InfoHash, PieceIndex, TorrentError};

/// Handshaken connection with the remote peer's choke and availability state.
#[derive(Debug)]
pub struct PeerConnection {
    stream: TcpStream,
    address: SocketAddr,
    remote_peer_id: PeerId,
    info_hash: InfoHash,
    piece_count: usize,
    /// Remote is choking us; starts true
    pub choked: bool,
    /// Pieces the remote has advertised
    pub bitfield: Bitfield,
}

impl PeerConnection {
    /// Dials a peer, exchanges handshakes and waits for its initial bitfield.
    ///
    /// The bitfield is kept `piece_count` pieces wide. A first message of
    /// `have`, `choke` or `unchoke` is accepted as an implicit empty bitfield
    /// and applied. Keep-alives are skipped until
    /// the bitfield deadline.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Dial failure or a timeout
    /// - `TorrentError::HandshakeMismatch` - Peer serves another torrent
    /// - `TorrentError::ProtocolError` - Malformed handshake or first message
    pub async fn connect(
        address: SocketAddr,
        info_hash: InfoHash,
        local_peer_id: PeerId,
        piece_count: usize,
        config: &NetworkConfig,
    ) -> Result<Self, TorrentError> {
        let stream = match timeout(config.peer_dial_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TorrentError::PeerConnectionError {
                    address,
                    reason: format!("dial failed: {e}"),
                });
            }
            Err(_) => {
                return Err(TorrentError::PeerConnectionError {
                    address,
                    reason: format!("dial timed out after {:?}", config.peer_dial_timeout),
                });
            }
        };

        let mut connection = Self {
            stream,
            address,
            remote_peer_id: PeerId::new([0; 20]),
            info_hash,
            piece_count,
            choked: true,
            bitfield: Bitfield::empty(piece_count),
        };

        let handshake = PeerHandshake::new(info_hash, local_peer_id);
        let remote = match timeout(
            config.handshake_timeout,
            connection.exchange_handshake(handshake),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(TorrentError::PeerConnectionError {
                    address,
                    reason: format!("handshake timed out after {:?}", config.handshake_timeout),
                });
            }
        };
        connection.remote_peer_id = remote.peer_id;

        connection.receive_bitfield(config.bitfield_timeout).await?;

        Ok(connection)
    }

    async fn exchange_handshake(
        &mut self,
        handshake: PeerHandshake,
    ) -> Result<PeerHandshake, TorrentError> {
        let outgoing = HandshakeCodec::serialize_handshake(&handshake);
        self.stream
            .write_all(&outgoing)
            .await
            .map_err(|e| self.io_error("send handshake", e))?;

        let mut protocol_len = [0u8; 1];
        self.stream
            .read_exact(&mut protocol_len)
            .await
            .map_err(|e| self.io_error("read handshake", e))?;

        let mut incoming = vec![0u8; HandshakeCodec::expected_len(protocol_len[0])];
        incoming[0] = protocol_len[0];
        self.stream
            .read_exact(&mut incoming[1..])
            .await
            .map_err(|e| self.io_error("read handshake", e))?;

        let remote = HandshakeCodec::deserialize_handshake(&incoming)?;
        HandshakeCodec::validate(&remote, handshake.info_hash)?;
        Ok(remote)
    }

    async fn receive_bitfield(&mut self, limit: Duration) -> Result<(), TorrentError> {
        let deadline = Instant::now() + limit;
        loop {
            let message = match timeout_at(deadline, self.read_message()).await {
                Ok(message) => message?,
                Err(_) => {
                    return Err(TorrentError::PeerConnectionError {
                        address: self.address,
                        reason: format!("no bitfield within {limit:?}"),
                    });
                }
            };

            match message {
                None => continue,
                Some(
                    message @ (PeerMessage::Bitfield { .. }
                    | PeerMessage::Have { .. }
                    | PeerMessage::Choke
                    | PeerMessage::Unchoke),
                ) => {
                    self.apply(&message);
                    return Ok(());
                }
                Some(other) => {
                    return Err(TorrentError::ProtocolError {
                        message: format!(
                            "expected bitfield from {}, got message id {}",
                            self.address,
                            other.id()
                        ),
                    });
                }
            }
        }
    }

    /// Reads one frame; `Ok(None)` is a keep-alive.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Socket closed or failed
    /// - `TorrentError::ProtocolError` - Oversized or malformed frame
    pub async fn read_message(&mut self) -> Result<Option<PeerMessage>, TorrentError> {
        let mut length_buf = [0u8; 4];
        self.stream
            .read_exact(&mut length_buf)
            .await
            .map_err(|e| self.io_error("read message length", e))?;

        let length = u32::from_be_bytes(length_buf);
        if length == 0 {
            return Ok(None);
        }
        if length > MAX_FRAME_LEN {
            return Err(TorrentError::ProtocolError {
                message: format!("frame of {length} bytes from {} exceeds limit", self.address),
            });
        }

        let mut body = vec![0u8; length as usize];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| self.io_error("read message payload", e))?;

        MessageCodec::decode_body(&body).map(Some)
    }

    /// Applies choke, unchoke, have and bitfield messages to connection state.
    ///
    /// Returns false for messages that carry no connection state.
    pub fn apply(&mut self, message: &PeerMessage) -> bool {
        match message {
            PeerMessage::Choke => self.choked = true,
            PeerMessage::Unchoke => self.choked = false,
            PeerMessage::Have { piece_index } => self.bitfield.set_piece(piece_index.as_usize()),
            PeerMessage::Bitfield { bitfield } => {
                self.bitfield = Bitfield::sized(bitfield, self.piece_count);
            }
            _ => return false,
        }
        true
    }

    /// Waits up to `idle` for the peer to send something and applies one
    /// message if it does.
    ///
    /// Returns without reading when nothing arrives in time. Once a frame
    /// starts arriving it must complete within `read_limit`.
    ///
    /// # Errors
    /// - `TorrentError::StalledPeer` - Frame did not complete in time
    /// - `TorrentError::PeerConnectionError` - Socket closed or failed
    /// - `TorrentError::ProtocolError` - Oversized or malformed frame
    pub async fn await_state_change(
        &mut self,
        idle: Duration,
        read_limit: Duration,
    ) -> Result<(), TorrentError> {
        match timeout(idle, self.stream.readable()).await {
            Err(_) => return Ok(()),
            Ok(Err(e)) => return Err(self.io_error("wait for peer", e)),
            Ok(Ok(())) => {}
        }

        match timeout(read_limit, self.read_message()).await {
            Ok(Ok(Some(message))) => {
                self.apply(&message);
                Ok(())
            }
            Ok(Ok(None)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TorrentError::StalledPeer {
                address: self.address,
            }),
        }
    }

    /// Writes one message frame.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Socket write failed
    pub async fn send_message(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        let frame = MessageCodec::serialize_message(message);
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| self.io_error("send message", e))
    }

    /// Requests one block of a piece.
    pub async fn send_request(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        self.send_message(&PeerMessage::Request {
            piece_index,
            offset,
            length,
        })
        .await
    }

    pub async fn send_interested(&mut self) -> Result<(), TorrentError> {
        self.send_message(&PeerMessage::Interested).await
    }

    pub async fn send_unchoke(&mut self) -> Result<(), TorrentError> {
        self.send_message(&PeerMessage::Unchoke).await
    }

    /// Announces a verified piece to the peer.
    pub async fn send_have(&mut self, piece_index: PieceIndex) -> Result<(), TorrentError> {
        self.send_message(&PeerMessage::Have { piece_index }).await
    }

    /// Shuts the socket down, ignoring errors from an already dead peer.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(peer = %self.address, "Shutdown failed: {}", e);
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn io_error(&self, stage: &str, error: std::io::Error) -> TorrentError {
        TorrentError::PeerConnectionError {
            address: self.address,
            reason: format!("{stage}: {error}"),
        }
    }
}
