//! # Gossip Wire Codec
//!
//! Frames on the gossip TCP stream:
//!
//! ```text
//! ┌────────────────┬─────────┬───────────────────┐
//! │ u32 length (BE)│ u8 flags│ payload (length B)│
//! └────────────────┴─────────┴───────────────────┘
//! ```
//!
//! `length` counts payload bytes only. Flag bit 0 marks a gzip-compressed
//! payload; all other bits must be zero. The payload is the serde_json
//! encoding of a [`GossipMessage`] — self-describing, so a peer running a
//! newer build can still parse what it understands.
//!
//! Compression is opportunistic: payloads over 1 KiB are gzipped, and the
//! compressed form is kept only when it actually saves at least 10%.
//! Anti-entropy snapshots compress well; single-instance updates usually
//! do not clear the bar and ship plain.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{COMPRESSION_MIN_GAIN, COMPRESSION_THRESHOLD_BYTES, MAX_FRAME_BYTES};
use crate::error::{Result, ShoalError};
use crate::gossip::message::GossipMessage;

/// Flag bit 0: payload is gzip-compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// An encoded frame ready for the socket.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Full frame bytes: header + payload.
    pub bytes: BytesMut,
    /// Whether the payload shipped compressed.
    pub compressed: bool,
    /// Bytes saved by compression (0 when shipped plain).
    pub saved_bytes: u64,
}

/// Serializes a message into a wire frame, compressing when worthwhile.
pub fn encode(msg: &GossipMessage) -> Result<EncodedFrame> {
    let plain = serde_json::to_vec(msg)?;

    let (payload, flags, saved) = if plain.len() > COMPRESSION_THRESHOLD_BYTES {
        let mut encoder = GzEncoder::new(Vec::with_capacity(plain.len() / 2), Compression::fast());
        encoder
            .write_all(&plain)
            .and_then(|_| encoder.finish())
            .map(|compressed| {
                let gain = 1.0 - compressed.len() as f64 / plain.len() as f64;
                if gain >= COMPRESSION_MIN_GAIN {
                    let saved = (plain.len() - compressed.len()) as u64;
                    (compressed, FLAG_COMPRESSED, saved)
                } else {
                    (plain.clone(), 0, 0)
                }
            })
            .unwrap_or((plain.clone(), 0, 0))
    } else {
        (plain, 0, 0)
    };

    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(ShoalError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte cap",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }

    let mut bytes = BytesMut::with_capacity(5 + payload.len());
    bytes.put_u32(payload.len() as u32);
    bytes.put_u8(flags);
    bytes.put_slice(&payload);

    Ok(EncodedFrame {
        bytes,
        compressed: flags & FLAG_COMPRESSED != 0,
        saved_bytes: saved,
    })
}

/// Decodes a payload received off the wire.
pub fn decode(flags: u8, payload: &[u8]) -> Result<GossipMessage> {
    if flags & !FLAG_COMPRESSED != 0 {
        return Err(ShoalError::Protocol(format!(
            "unknown frame flags 0x{flags:02x}"
        )));
    }

    let plain: Vec<u8> = if flags & FLAG_COMPRESSED != 0 {
        let mut decoder = GzDecoder::new(payload);
        let mut out = Vec::with_capacity(payload.len() * 2);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ShoalError::Protocol(format!("gzip payload: {e}")))?;
        out
    } else {
        payload.to_vec()
    };

    let msg = serde_json::from_slice(&plain)?;
    Ok(msg)
}

/// Writes one frame to an async stream.
pub async fn write_frame<W>(writer: &mut W, msg: &GossipMessage) -> Result<EncodedFrame>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg)?;
    writer.write_all(&frame.bytes).await?;
    writer.flush().await?;
    Ok(frame)
}

/// Reads one frame from an async stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary; EOF in the
/// middle of a frame is a protocol error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<GossipMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(ShoalError::Protocol(format!(
            "declared frame length {len} exceeds the {MAX_FRAME_BYTES} byte cap"
        )));
    }

    let mut flags = [0u8; 1];
    reader
        .read_exact(&mut flags)
        .await
        .map_err(|e| ShoalError::Protocol(format!("truncated frame header: {e}")))?;

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ShoalError::Protocol(format!("truncated frame payload: {e}")))?;

    decode(flags[0], &payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::message::{GossipPayload, MessagePriority, RegistrySnapshot};
    use crate::registry::instance::ServiceInstance;
    use std::collections::BTreeMap;

    fn small_message() -> GossipMessage {
        let instance =
            ServiceInstance::new("web", "svc1", "10.0.0.1", 8080, BTreeMap::new(), "p1").unwrap();
        GossipMessage::new(
            "10.0.0.1:6003",
            GossipPayload::ServiceRegister(instance),
            MessagePriority::High,
            4,
            30_000,
        )
    }

    fn large_message() -> GossipMessage {
        // A snapshot with enough repetitive content to clear both the size
        // threshold and the 10% gain bar.
        let mut snapshot = RegistrySnapshot::new();
        let mut by_id = BTreeMap::new();
        for i in 0..50 {
            let mut meta = BTreeMap::new();
            meta.insert("region".to_string(), "us-east-1".to_string());
            meta.insert("capabilities".to_string(), "file-transfer,gossip".to_string());
            let instance = ServiceInstance::new(
                "web",
                &format!("svc{i}"),
                "10.0.0.1",
                8080,
                meta,
                "p1",
            )
            .unwrap();
            by_id.insert(format!("svc{i}"), instance);
        }
        snapshot.insert("web".to_string(), by_id);
        GossipMessage::new(
            "10.0.0.1:6003",
            GossipPayload::AntiEntropy { snapshot },
            MessagePriority::Low,
            4,
            30_000,
        )
    }

    #[test]
    fn small_messages_ship_plain() {
        let frame = encode(&small_message()).unwrap();
        assert!(!frame.compressed);
        assert_eq!(frame.saved_bytes, 0);
        assert_eq!(frame.bytes[4], 0); // flags byte
    }

    #[test]
    fn large_messages_compress() {
        let msg = large_message();
        let frame = encode(&msg).unwrap();
        assert!(frame.compressed);
        assert!(frame.saved_bytes > 0);
        assert_eq!(frame.bytes[4], FLAG_COMPRESSED);
    }

    #[test]
    fn encode_decode_roundtrip_plain() {
        let msg = small_message();
        let frame = encode(&msg).unwrap();
        let payload = &frame.bytes[5..];
        let back = decode(frame.bytes[4], payload).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn encode_decode_roundtrip_compressed() {
        let msg = large_message();
        let frame = encode(&msg).unwrap();
        let payload = &frame.bytes[5..];
        let back = decode(frame.bytes[4], payload).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let msg = small_message();
        let frame = encode(&msg).unwrap();
        let payload = &frame.bytes[5..];
        assert!(matches!(
            decode(0b1000_0000, payload),
            Err(ShoalError::Protocol(_))
        ));
    }

    #[test]
    fn garbage_payload_is_a_protocol_error() {
        assert!(matches!(
            decode(0, b"not json at all"),
            Err(ShoalError::Protocol(_))
        ));
        assert!(matches!(
            decode(FLAG_COMPRESSED, b"not gzip either"),
            Err(ShoalError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn async_roundtrip_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let sent = small_message();
        let big = large_message();
        write_frame(&mut client, &sent).await.unwrap();
        write_frame(&mut client, &big).await.unwrap();
        drop(client);

        let got1 = read_frame(&mut server).await.unwrap().unwrap();
        let got2 = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(got1, sent);
        assert_eq!(got2, big);

        // Clean EOF after the last frame.
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut evil = BytesMut::new();
        evil.put_u32(MAX_FRAME_BYTES + 1);
        evil.put_u8(0);
        tokio::io::AsyncWriteExt::write_all(&mut client, &evil)
            .await
            .unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(ShoalError::Protocol(_))
        ));
    }
}
