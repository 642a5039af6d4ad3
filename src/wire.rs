// SPDX-FileCopyrightText: 2025 The swarmlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::buffer_pool::{BufferPool, PoolBuffer};
use crate::config::RECEIVE_CHUNK_SIZE;
use crate::connection::Connection;
use crate::encryption::Cipher;
use crate::error::WireError;
use crate::monitor::ConnectionMonitor;
use crate::peer::{InfoHash, PeerId};
use crate::rate_limiter::RateLimiter;

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";
const PROTOCOL_STRING_LENGTH: u8 = 19;
pub const HANDSHAKE_LENGTH: usize = 68;

// Largest legal frame: a block request may ask for up to 128 KiB.
const MAX_FRAME_BYTES: usize = (1 << 17) + 64;

/// The fixed-format message exchanged immediately after encryption is
/// negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Handshake { info_hash, peer_id, reserved: [0u8; 8] }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(HANDSHAKE_LENGTH);
        raw.push(PROTOCOL_STRING_LENGTH);
        raw.extend_from_slice(PROTOCOL_STRING);
        raw.extend_from_slice(&self.reserved);
        raw.extend_from_slice(&self.info_hash.0);
        raw.extend_from_slice(&self.peer_id.0);
        raw
    }

    pub fn decode(raw: &[u8; HANDSHAKE_LENGTH]) -> Result<Handshake, WireError> {
        if raw[0] != PROTOCOL_STRING_LENGTH || &raw[1..20] != PROTOCOL_STRING {
            return Err(WireError::BadHandshake);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&raw[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&raw[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&raw[48..68]);
        Ok(Handshake {
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
            reserved,
        })
    }
}

/// A framed protocol message. Outbound piece messages are enqueued with
/// `data: None` and filled from disk by the send pump just before they go
/// out; inbound piece payloads arrive in pool buffers.
#[derive(Debug)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Vec<u8>),
    Request { piece: u32, begin: u32, length: u32 },
    Piece { piece: u32, begin: u32, length: u32, data: Option<PoolBuffer> },
    Cancel { piece: u32, begin: u32, length: u32 },
    Port(u16),
}

impl PeerMessage {
    pub fn is_piece(&self) -> bool {
        matches!(self, PeerMessage::Piece { .. })
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut frame = Vec::new();
        match self {
            PeerMessage::KeepAlive => frame.extend_from_slice(&0u32.to_be_bytes()),
            PeerMessage::Choke => put(&mut frame, 0, &[]),
            PeerMessage::Unchoke => put(&mut frame, 1, &[]),
            PeerMessage::Interested => put(&mut frame, 2, &[]),
            PeerMessage::NotInterested => put(&mut frame, 3, &[]),
            PeerMessage::Have { piece } => put(&mut frame, 4, &piece.to_be_bytes()),
            PeerMessage::Bitfield(bits) => put(&mut frame, 5, bits),
            PeerMessage::Request { piece, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&piece.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                put(&mut frame, 6, &payload);
            }
            PeerMessage::Piece { piece, begin, data, .. } => {
                let block = data.as_deref().ok_or(WireError::Malformed("piece"))?;
                frame.extend_from_slice(&((9 + block.len()) as u32).to_be_bytes());
                frame.push(7);
                frame.extend_from_slice(&piece.to_be_bytes());
                frame.extend_from_slice(&begin.to_be_bytes());
                frame.extend_from_slice(block);
            }
            PeerMessage::Cancel { piece, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&piece.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                put(&mut frame, 8, &payload);
            }
            PeerMessage::Port(port) => put(&mut frame, 9, &port.to_be_bytes()),
        }
        if frame.len() > MAX_FRAME_BYTES + 4 {
            return Err(WireError::MessageTooLarge(frame.len()));
        }
        Ok(frame)
    }
}

fn put(frame: &mut Vec<u8>, id: u8, payload: &[u8]) {
    frame.extend_from_slice(&((payload.len() + 1) as u32).to_be_bytes());
    frame.push(id);
    frame.extend_from_slice(payload);
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Reads and validates the remote 68-byte handshake.
pub async fn receive_handshake(
    connection: &Connection,
    decryptor: &mut dyn Cipher,
) -> Result<Handshake, WireError> {
    let mut raw = [0u8; HANDSHAKE_LENGTH];
    connection.receive_exact(&mut raw).await?;
    decryptor.apply(&mut raw);
    Handshake::decode(&raw)
}

/// Receives one framed message, metering the transfer through the download
/// limiter in `RECEIVE_CHUNK_SIZE` slices and crediting both monitors per
/// chunk. Piece payloads are read into a pool buffer.
pub async fn receive_message(
    connection: &Connection,
    decryptor: &mut dyn Cipher,
    limiter: &RateLimiter,
    peer_monitor: &ConnectionMonitor,
    torrent_monitor: &ConnectionMonitor,
    pool: &BufferPool,
) -> Result<PeerMessage, WireError> {
    let mut length_prefix = [0u8; 4];
    read_chunked(connection, decryptor, limiter, peer_monitor, torrent_monitor, &mut length_prefix)
        .await?;
    let frame_length = be_u32(&length_prefix) as usize;
    if frame_length == 0 {
        return Ok(PeerMessage::KeepAlive);
    }
    if frame_length > MAX_FRAME_BYTES {
        return Err(WireError::MessageTooLarge(frame_length));
    }

    let mut id = [0u8; 1];
    read_chunked(connection, decryptor, limiter, peer_monitor, torrent_monitor, &mut id).await?;
    let payload_length = frame_length - 1;

    if id[0] == 7 {
        if payload_length < 8 {
            return Err(WireError::Malformed("piece"));
        }
        let mut header = [0u8; 8];
        read_chunked(connection, decryptor, limiter, peer_monitor, torrent_monitor, &mut header)
            .await?;
        let block_length = payload_length - 8;
        let mut block = pool.get(block_length);
        read_chunked(connection, decryptor, limiter, peer_monitor, torrent_monitor, &mut block)
            .await?;
        return Ok(PeerMessage::Piece {
            piece: be_u32(&header[0..4]),
            begin: be_u32(&header[4..8]),
            length: block_length as u32,
            data: Some(block),
        });
    }

    let mut payload = vec![0u8; payload_length];
    read_chunked(connection, decryptor, limiter, peer_monitor, torrent_monitor, &mut payload)
        .await?;
    parse_payload(id[0], &payload)
}

fn parse_payload(id: u8, payload: &[u8]) -> Result<PeerMessage, WireError> {
    match id {
        0 if payload.is_empty() => Ok(PeerMessage::Choke),
        1 if payload.is_empty() => Ok(PeerMessage::Unchoke),
        2 if payload.is_empty() => Ok(PeerMessage::Interested),
        3 if payload.is_empty() => Ok(PeerMessage::NotInterested),
        4 if payload.len() == 4 => Ok(PeerMessage::Have { piece: be_u32(payload) }),
        5 => Ok(PeerMessage::Bitfield(payload.to_vec())),
        6 if payload.len() == 12 => Ok(PeerMessage::Request {
            piece: be_u32(&payload[0..4]),
            begin: be_u32(&payload[4..8]),
            length: be_u32(&payload[8..12]),
        }),
        8 if payload.len() == 12 => Ok(PeerMessage::Cancel {
            piece: be_u32(&payload[0..4]),
            begin: be_u32(&payload[4..8]),
            length: be_u32(&payload[8..12]),
        }),
        9 if payload.len() == 2 => Ok(PeerMessage::Port(u16::from_be_bytes([payload[0], payload[1]]))),
        0..=9 => Err(WireError::Malformed("payload length")),
        other => Err(WireError::UnknownMessage(other)),
    }
}

/// Sends one framed message through the encryptor, metered like the receive
/// side.
pub async fn send_message(
    connection: &Connection,
    encryptor: &mut dyn Cipher,
    message: &PeerMessage,
    limiter: &RateLimiter,
    peer_monitor: &ConnectionMonitor,
    torrent_monitor: &ConnectionMonitor,
) -> Result<(), WireError> {
    let mut frame = message.encode()?;
    encryptor.apply(&mut frame);

    let mut offset = 0;
    while offset < frame.len() {
        let take = (frame.len() - offset).min(RECEIVE_CHUNK_SIZE);
        limiter.throttle(take).await;
        connection.send(&frame[offset..offset + take]).await?;
        peer_monitor.add_sent(take as u64);
        torrent_monitor.add_sent(take as u64);
        offset += take;
    }
    Ok(())
}

async fn read_chunked(
    connection: &Connection,
    decryptor: &mut dyn Cipher,
    limiter: &RateLimiter,
    peer_monitor: &ConnectionMonitor,
    torrent_monitor: &ConnectionMonitor,
    buffer: &mut [u8],
) -> Result<(), WireError> {
    let mut offset = 0;
    while offset < buffer.len() {
        let take = (buffer.len() - offset).min(RECEIVE_CHUNK_SIZE);
        limiter.throttle(take).await;
        connection.receive_exact(&mut buffer[offset..offset + take]).await?;
        decryptor.apply(&mut buffer[offset..offset + take]);
        peer_monitor.add_received(take as u64);
        torrent_monitor.add_received(take as u64);
        offset += take;
    }
    Ok(())
}
