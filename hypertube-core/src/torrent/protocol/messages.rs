//! BitTorrent wire protocol message framing

use bytes::{Buf, BufMut, Bytes};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: u32 = 1 << 21;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a message into a length-prefixed frame.
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u8(message.id());

        match message {
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => {}
            PeerMessage::Have { piece_index } => {
                body.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                body.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            }
            | PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                body.put_u32(piece_index.as_u32());
                body.put_u32(*offset);
                body.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                body.put_u32(piece_index.as_u32());
                body.put_u32(*offset);
                body.extend_from_slice(data);
            }
            PeerMessage::Port { port } => {
                body.put_u16(*port);
            }
            PeerMessage::Unknown { payload, .. } => {
                body.extend_from_slice(payload);
            }
        }

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        frame
    }

    /// Frame bytes of a keep-alive.
    pub fn keep_alive() -> [u8; 4] {
        [0; 4]
    }

    /// Deserializes one complete frame.
    ///
    /// Returns `Ok(None)` for a keep-alive.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Truncated frame or bad payload length
    pub fn deserialize_message(frame: &[u8]) -> Result<Option<PeerMessage>, TorrentError> {
        if frame.len() < 4 {
            return Err(TorrentError::ProtocolError {
                message: "Message too short".to_string(),
            });
        }

        let mut buf = frame;
        let length = buf.get_u32() as usize;
        if length == 0 {
            return Ok(None);
        }
        if buf.len() != length {
            return Err(TorrentError::ProtocolError {
                message: format!("Frame declares {length} bytes but carries {}", buf.len()),
            });
        }

        Self::decode_body(buf).map(Some)
    }

    /// Decodes a message id and payload, the part of a frame after the length.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Payload length does not fit the id
    pub fn decode_body(body: &[u8]) -> Result<PeerMessage, TorrentError> {
        let mut buf = body;
        if !buf.has_remaining() {
            return Err(TorrentError::ProtocolError {
                message: "Missing message id".to_string(),
            });
        }
        let message_id = buf.get_u8();
        let payload_len = buf.remaining();

        let expect_len = |expected: usize, name: &str| {
            if payload_len == expected {
                Ok(())
            } else {
                Err(TorrentError::ProtocolError {
                    message: format!("Invalid {name} payload length {payload_len}"),
                })
            }
        };

        match message_id {
            0 => expect_len(0, "choke").map(|_| PeerMessage::Choke),
            1 => expect_len(0, "unchoke").map(|_| PeerMessage::Unchoke),
            2 => expect_len(0, "interested").map(|_| PeerMessage::Interested),
            3 => expect_len(0, "not interested").map(|_| PeerMessage::NotInterested),
            4 => {
                expect_len(4, "have")?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(buf.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(buf),
            }),
            6 | 8 => {
                expect_len(12, if message_id == 6 { "request" } else { "cancel" })?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(if message_id == 6 {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            7 => {
                if payload_len < 8 {
                    return Err(TorrentError::ProtocolError {
                        message: format!("Invalid piece payload length {payload_len}"),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            9 => {
                expect_len(2, "port")?;
                Ok(PeerMessage::Port {
                    port: buf.get_u16(),
                })
            }
            id => Ok(PeerMessage::Unknown {
                id,
                payload: Bytes::copy_from_slice(buf),
            }),
        }
    }
}
