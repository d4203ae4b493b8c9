//! BitTorrent peer wire protocol.
//!
//! Handshake and message framing codecs, the piece availability bitfield,
//! and the single-owner TCP connection the scheduler's workers drive.

pub mod bitfield;
pub mod connection;
pub mod handshake;
pub mod messages;
pub mod types;

pub use bitfield::Bitfield;
pub use connection::PeerConnection;
pub use handshake::HandshakeCodec;
pub use messages::MessageCodec;
pub use types::{PeerHandshake, PeerId, PeerMessage};

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::HypertubeConfig;
    use crate::torrent::{InfoHash, PieceIndex, TorrentError};

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate("-HT0001-");
        assert_eq!(&peer_id.as_bytes()[..8], b"-HT0001-");

        let peer_id2 = PeerId::generate("-HT0001-");
        assert_ne!(peer_id.as_bytes(), peer_id2.as_bytes());
    }

    #[test]
    fn test_handshake_layout() {
        let handshake = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]));
        let data = HandshakeCodec::serialize_handshake(&handshake);

        assert_eq!(data.len(), 68);
        assert_eq!(data[0], 19);
        assert_eq!(&data[1..20], b"BitTorrent protocol");
        assert_eq!(&data[20..28], &[0u8; 8]);
        assert_eq!(&data[28..48], &[1u8; 20]);
        assert_eq!(&data[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_handshake_rejects_other_torrent() {
        let remote = PeerHandshake::new(InfoHash::new([9u8; 20]), PeerId::new([2u8; 20]));
        let result = HandshakeCodec::validate(&remote, InfoHash::new([1u8; 20]));

        match result {
            Err(TorrentError::HandshakeMismatch { expected, actual }) => {
                assert_eq!(expected, InfoHash::new([1u8; 20]));
                assert_eq!(actual, InfoHash::new([9u8; 20]));
            }
            other => panic!("expected handshake mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_rejects_bad_lengths() {
        assert!(HandshakeCodec::deserialize_handshake(&[]).is_err());
        assert!(HandshakeCodec::deserialize_handshake(&[0u8; 49]).is_err());

        let handshake = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]));
        let data = HandshakeCodec::serialize_handshake(&handshake);
        assert!(HandshakeCodec::deserialize_handshake(&data[..67]).is_err());
    }

    #[test]
    fn test_handshake_cuts_overlong_protocol() {
        let handshake = PeerHandshake {
            protocol: "p".repeat(300),
            reserved: [0; 8],
            info_hash: InfoHash::new([1u8; 20]),
            peer_id: PeerId::new([2u8; 20]),
        };
        let data = HandshakeCodec::serialize_handshake(&handshake);

        assert_eq!(data[0], 255);
        assert_eq!(data.len(), HandshakeCodec::expected_len(255));
        let decoded = HandshakeCodec::deserialize_handshake(&data).unwrap();
        assert_eq!(decoded.protocol, "p".repeat(255));
        assert_eq!(decoded.info_hash, handshake.info_hash);
        assert_eq!(decoded.peer_id, handshake.peer_id);
    }

    #[test]
    fn test_keep_alive_decodes_to_no_message() {
        let frame = MessageCodec::keep_alive();
        assert_eq!(MessageCodec::deserialize_message(&frame).unwrap(), None);
    }

    #[test]
    fn test_request_wire_format() {
        let frame = MessageCodec::serialize_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(1),
            offset: 16384,
            length: 16384,
        });
        assert_eq!(
            frame,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_truncated_frames_are_errors() {
        assert!(MessageCodec::deserialize_message(&[0, 0]).is_err());
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 5, 4, 0, 0]).is_err());
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 2, 4, 0]).is_err());
    }

    #[test]
    fn test_unknown_message_id_is_carried() {
        let message = MessageCodec::deserialize_message(&[0, 0, 0, 3, 20, 0xab, 0xcd])
            .unwrap()
            .unwrap();
        assert_eq!(
            message,
            PeerMessage::Unknown {
                id: 20,
                payload: Bytes::from_static(&[0xab, 0xcd]),
            }
        );
    }

    #[test]
    fn test_bitfield_is_msb_first() {
        let bitfield = Bitfield::from_bytes(&[0b1010_0000, 0b0000_0001]);

        assert!(bitfield.has_piece(0));
        assert!(!bitfield.has_piece(1));
        assert!(bitfield.has_piece(2));
        assert!(bitfield.has_piece(15));
        assert!(!bitfield.has_piece(16));
        assert_eq!(bitfield.count(), 3);
    }

    #[test]
    fn test_bitfield_ignores_out_of_range_have() {
        let message = MessageCodec::deserialize_message(&[0, 0, 0, 5, 4, 0xFF, 0xFF, 0xFF, 0xF8])
            .unwrap()
            .unwrap();
        let PeerMessage::Have { piece_index } = message else {
            panic!("expected have, got {message:?}");
        };

        let mut bitfield = Bitfield::empty(4);
        bitfield.set_piece(piece_index.as_usize());
        bitfield.set_piece(8);
        assert_eq!(bitfield.capacity(), 8);
        assert_eq!(bitfield.count(), 0);

        bitfield.set_piece(3);
        assert!(bitfield.has_piece(3));
        assert_eq!(bitfield.count(), 1);
    }

    #[test]
    fn test_sized_bitfield_pads_and_cuts() {
        let short = Bitfield::sized(&[0b1000_0000], 20);
        assert_eq!(short.capacity(), 24);
        assert!(short.has_piece(0));

        let long = Bitfield::sized(&[0xFF; 64], 4);
        assert_eq!(long.capacity(), 8);
    }

    fn arb_message() -> impl Strategy<Value = PeerMessage> {
        let bytes = prop::collection::vec(any::<u8>(), 0..64).prop_map(Bytes::from);
        prop_oneof![
            Just(PeerMessage::Choke),
            Just(PeerMessage::Unchoke),
            Just(PeerMessage::Interested),
            Just(PeerMessage::NotInterested),
            any::<u32>().prop_map(|i| PeerMessage::Have {
                piece_index: PieceIndex::new(i)
            }),
            bytes.clone().prop_map(|bitfield| PeerMessage::Bitfield { bitfield }),
            (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(i, offset, length)| {
                PeerMessage::Request {
                    piece_index: PieceIndex::new(i),
                    offset,
                    length,
                }
            }),
            (any::<u32>(), any::<u32>(), bytes).prop_map(|(i, offset, data)| PeerMessage::Piece {
                piece_index: PieceIndex::new(i),
                offset,
                data,
            }),
            (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(i, offset, length)| {
                PeerMessage::Cancel {
                    piece_index: PieceIndex::new(i),
                    offset,
                    length,
                }
            }),
            any::<u16>().prop_map(|port| PeerMessage::Port { port }),
        ]
    }

    proptest! {
        #[test]
        fn prop_message_frames_round_trip(message in arb_message()) {
            let frame = MessageCodec::serialize_message(&message);
            prop_assert_eq!(frame.len() as u32 - 4, u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]));
            prop_assert_eq!(MessageCodec::deserialize_message(&frame).unwrap(), Some(message));
        }

        #[test]
        fn prop_handshake_round_trips(
            protocol in "[a-zA-Z ]{1,40}",
            info_hash in any::<[u8; 20]>(),
            peer_id in any::<[u8; 20]>(),
        ) {
            let handshake = PeerHandshake {
                protocol,
                reserved: [0; 8],
                info_hash: InfoHash::new(info_hash),
                peer_id: PeerId::new(peer_id),
            };
            let data = HandshakeCodec::serialize_handshake(&handshake);
            prop_assert_eq!(data.len(), 49 + handshake.protocol.len());
            prop_assert_eq!(HandshakeCodec::deserialize_handshake(&data).unwrap(), handshake);
        }

        #[test]
        fn prop_bitfield_set_then_has(len in 1usize..32, seed in any::<usize>()) {
            let mut bitfield = Bitfield::from_bytes(&vec![0u8; len]);
            let index = seed % (len * 8);
            prop_assert!(!bitfield.has_piece(index));
            bitfield.set_piece(index);
            prop_assert!(bitfield.has_piece(index));
            prop_assert_eq!(bitfield.count(), 1);
        }
    }

    async fn fake_peer(
        info_hash: InfoHash,
        first_frames: Vec<Vec<u8>>,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut incoming = vec![0u8; 68];
            socket.read_exact(&mut incoming).await.unwrap();
            let reply = PeerHandshake::new(info_hash, PeerId::new([7u8; 20]));
            socket
                .write_all(&HandshakeCodec::serialize_handshake(&reply))
                .await
                .unwrap();
            for frame in first_frames {
                socket.write_all(&frame).await.unwrap();
            }
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
            rest
        });
        (address, handle)
    }

    #[tokio::test]
    async fn test_connect_receives_bitfield() {
        let info_hash = InfoHash::new([3u8; 20]);
        let bitfield = MessageCodec::serialize_message(&PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0b0100_0000]),
        });
        let (address, peer) =
            fake_peer(info_hash, vec![MessageCodec::keep_alive().to_vec(), bitfield]).await;
        let config = HypertubeConfig::for_testing();

        let mut connection =
            PeerConnection::connect(address, info_hash, PeerId::generate("-HT0001-"), 8, &config.network)
                .await
                .unwrap();

        assert!(connection.choked);
        assert!(connection.bitfield.has_piece(1));
        assert!(!connection.bitfield.has_piece(0));
        assert_eq!(connection.remote_peer_id(), PeerId::new([7u8; 20]));

        connection.send_have(PieceIndex::new(1)).await.unwrap();
        connection.close().await;
        let sent = peer.await.unwrap();
        assert_eq!(sent, vec![0, 0, 0, 5, 4, 0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_connect_accepts_have_as_implicit_bitfield() {
        let info_hash = InfoHash::new([3u8; 20]);
        let have = MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(5),
        });
        let (address, _peer) = fake_peer(info_hash, vec![have]).await;
        let config = HypertubeConfig::for_testing();

        let connection =
            PeerConnection::connect(address, info_hash, PeerId::generate("-HT0001-"), 8, &config.network)
                .await
                .unwrap();

        assert!(connection.bitfield.has_piece(5));
        assert_eq!(connection.bitfield.count(), 1);
    }

    #[tokio::test]
    async fn test_connect_ignores_have_past_piece_count() {
        let info_hash = InfoHash::new([3u8; 20]);
        let have = MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(u32::MAX - 7),
        });
        let (address, _peer) = fake_peer(info_hash, vec![have]).await;
        let config = HypertubeConfig::for_testing();

        let connection =
            PeerConnection::connect(address, info_hash, PeerId::generate("-HT0001-"), 8, &config.network)
                .await
                .unwrap();

        assert_eq!(connection.bitfield.capacity(), 8);
        assert_eq!(connection.bitfield.count(), 0);
    }

    #[tokio::test]
    async fn test_idle_connection_applies_later_have() {
        let info_hash = InfoHash::new([3u8; 20]);
        let bitfield = MessageCodec::serialize_message(&PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0]),
        });
        let have = MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(6),
        });
        let (address, _peer) = fake_peer(info_hash, vec![bitfield, have]).await;
        let config = HypertubeConfig::for_testing();

        let mut connection =
            PeerConnection::connect(address, info_hash, PeerId::generate("-HT0001-"), 8, &config.network)
                .await
                .unwrap();
        assert!(!connection.bitfield.has_piece(6));

        let wait = std::time::Duration::from_secs(1);
        connection.await_state_change(wait, wait).await.unwrap();
        assert!(connection.bitfield.has_piece(6));

        let started = std::time::Instant::now();
        connection
            .await_state_change(std::time::Duration::from_millis(50), wait)
            .await
            .unwrap();
        assert!(started.elapsed() < wait);
        assert_eq!(connection.bitfield.count(), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_piece_as_first_message() {
        let info_hash = InfoHash::new([3u8; 20]);
        let piece = MessageCodec::serialize_message(&PeerMessage::Piece {
            piece_index: PieceIndex::new(0),
            offset: 0,
            data: Bytes::from_static(b"data"),
        });
        let (address, _peer) = fake_peer(info_hash, vec![piece]).await;
        let config = HypertubeConfig::for_testing();

        let result =
            PeerConnection::connect(address, info_hash, PeerId::generate("-HT0001-"), 8, &config.network)
                .await;
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_connect_rejects_info_hash_mismatch() {
        let (address, _peer) = fake_peer(InfoHash::new([4u8; 20]), Vec::new()).await;
        let config = HypertubeConfig::for_testing();

        let result = PeerConnection::connect(
            address,
            InfoHash::new([3u8; 20]),
            PeerId::generate("-HT0001-"),
            8,
            &config.network,
        )
        .await;
        assert!(matches!(result, Err(TorrentError::HandshakeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_bitfield() {
        let info_hash = InfoHash::new([3u8; 20]);
        let (address, _peer) = fake_peer(info_hash, Vec::new()).await;
        let mut config = HypertubeConfig::for_testing();
        config.network.bitfield_timeout = std::time::Duration::from_millis(100);

        let result =
            PeerConnection::connect(address, info_hash, PeerId::generate("-HT0001-"), 8, &config.network)
                .await;
        assert!(matches!(result, Err(TorrentError::PeerConnectionError { .. })));
    }
}
