//! # File-Transfer Protocol
//!
//! The binary protocol peers speak to move file bytes. Strings travel as
//! `writeUTF` frames: a 2-byte big-endian length followed by UTF-8 bytes,
//! which keeps the protocol compatible with DataInputStream-style clients.
//!
//! ```text
//! Client                              Peer
//! ──────                              ─────
//! UTF "PROTOCOL_V1"
//! UTF "GET_FILE"
//! UTF <fileName>
//!                                     UTF "SENDING_FILE"
//!                                     i64 fileSize (BE)
//!                                     UTF <hex sha-256>
//!                                     fileSize raw bytes
//!
//!                  — or —             UTF "FILE_NOT_FOUND"
//!                  — or —             UTF "ERROR", UTF <message>
//! ```
//!
//! The checksum rides ahead of the bytes so the client can verify the
//! transfer without a second round trip.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{Result, ShoalError};
use crate::peer::files::{checksum, checksum_bytes, SharedFiles, FILE_CHUNK_BYTES};

/// Protocol preamble; the first frame on every connection.
pub const PROTOCOL_HEADER: &str = "PROTOCOL_V1";
/// The only fetch command.
pub const CMD_GET_FILE: &str = "GET_FILE";
/// Success status, followed by size, checksum, and bytes.
pub const STATUS_SENDING_FILE: &str = "SENDING_FILE";
/// Miss status; the connection ends after it.
pub const STATUS_FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";
/// Failure status, followed by a message frame.
pub const STATUS_ERROR: &str = "ERROR";

// ---------------------------------------------------------------------------
// writeUTF / readUTF framing
// ---------------------------------------------------------------------------

/// Writes a `u16`-length-prefixed UTF-8 string frame.
pub async fn write_utf<W>(writer: &mut W, s: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(ShoalError::InvalidArgument(format!(
            "string frame of {} bytes exceeds the u16 length prefix",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

/// Reads one `u16`-length-prefixed UTF-8 string frame.
pub async fn read_utf<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| ShoalError::Protocol(format!("invalid UTF-8 frame: {e}")))
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Serves one inbound transfer connection against the shared-file set.
///
/// Protocol violations answer an `ERROR` frame where the stream still
/// permits one; the error is also returned so the accept loop can log it.
pub async fn serve_connection<S>(stream: &mut S, files: &SharedFiles) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    eprintln!("DBG serve_connection: started");
    let header = read_utf(stream).await?;
    eprintln!("DBG serve_connection: header={header}");
    if header != PROTOCOL_HEADER {
        let msg = format!("unsupported protocol '{header}'");
        write_utf(stream, STATUS_ERROR).await?;
        write_utf(stream, &msg).await?;
        return Err(ShoalError::Protocol(msg));
    }

    let command = read_utf(stream).await?;
    match command.as_str() {
        CMD_GET_FILE => {
            let name = read_utf(stream).await?;
            serve_get_file(stream, files, &name).await
        }
        other => {
            let msg = format!("unknown command '{other}'");
            write_utf(stream, STATUS_ERROR).await?;
            write_utf(stream, &msg).await?;
            Err(ShoalError::Protocol(msg))
        }
    }
}

async fn serve_get_file<S>(stream: &mut S, files: &SharedFiles, name: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(path) = files.lookup(name) else {
        debug!(file = name, "requested file not shared");
        write_utf(stream, STATUS_FILE_NOT_FOUND).await?;
        return Ok(());
    };

    // Size and checksum are read before the status line goes out, so a
    // vanished or unreadable file still gets a clean ERROR frame.
    let prepared = prepare_file(&path).await;
    let (size, sum) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(file = name, error = %e, "failed to prepare file for transfer");
            write_utf(stream, STATUS_ERROR).await?;
            write_utf(stream, &e.to_string()).await?;
            return Ok(());
        }
    };

    write_utf(stream, STATUS_SENDING_FILE).await?;
    stream.write_all(&(size as i64).to_be_bytes()).await?;
    write_utf(stream, &sum).await?;

    let mut file = tokio::fs::File::open(&path).await?;
    let mut buf = vec![0u8; FILE_CHUNK_BYTES];
    let mut sent: u64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;
    }
    stream.flush().await?;

    info!(file = name, bytes = sent, "file served");
    Ok(())
}

async fn prepare_file(path: &Path) -> Result<(u64, String)> {
    let meta = tokio::fs::metadata(path).await?;
    let sum = checksum(path).await?;
    Ok((meta.len(), sum))
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// A completed, verified download.
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

/// Fetches `file_name` from the peer at `addr` into `dest_dir`,
/// verifying size and checksum before reporting success.
pub async fn download(addr: &str, file_name: &str, dest_dir: &Path) -> Result<Download> {
    eprintln!("DBG download: connecting to {addr}");
    let mut stream = TcpStream::connect(addr).await?;
    eprintln!("DBG download: connected");

    write_utf(&mut stream, PROTOCOL_HEADER).await?;
    eprintln!("DBG download: wrote header");
    write_utf(&mut stream, CMD_GET_FILE).await?;
    eprintln!("DBG download: wrote cmd");
    write_utf(&mut stream, file_name).await?;
    eprintln!("DBG download: wrote filename");

    let status = read_utf(&mut stream).await?;
    eprintln!("DBG download: status={status}");
    match status.as_str() {
        STATUS_SENDING_FILE => {}
        STATUS_FILE_NOT_FOUND => {
            return Err(ShoalError::NotFound(format!(
                "peer {addr} does not share '{file_name}'"
            )));
        }
        STATUS_ERROR => {
            let message = read_utf(&mut stream).await?;
            return Err(ShoalError::Internal(format!("peer {addr}: {message}")));
        }
        other => {
            return Err(ShoalError::Protocol(format!(
                "unexpected transfer status '{other}'"
            )));
        }
    }

    let mut size_buf = [0u8; 8];
    stream.read_exact(&mut size_buf).await?;
    let declared = i64::from_be_bytes(size_buf);
    if declared < 0 {
        return Err(ShoalError::Protocol(format!(
            "negative file size {declared}"
        )));
    }
    let declared = declared as u64;
    let expected_sum = read_utf(&mut stream).await?;

    let mut hasher = sha2::Sha256::new();
    use sha2::Digest;

    let dest = dest_dir.join(file_name);
    let mut out = tokio::fs::File::create(&dest).await?;
    let mut remaining = declared;
    let mut buf = vec![0u8; FILE_CHUNK_BYTES];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ShoalError::Protocol(format!(
                "transfer truncated with {remaining} bytes remaining"
            )));
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    out.flush().await?;

    let actual_sum = hex::encode(hasher.finalize());
    if actual_sum != expected_sum {
        return Err(ShoalError::Protocol(format!(
            "checksum mismatch: expected {expected_sum}, got {actual_sum}"
        )));
    }

    info!(file = file_name, bytes = declared, from = addr, "file downloaded");
    Ok(Download {
        path: dest,
        size: declared,
        checksum: actual_sum,
    })
}

/// Checksum helper re-exported for integration tests and callers that
/// verify out-of-band.
pub fn verify_bytes(data: &[u8], expected: &str) -> bool {
    checksum_bytes(data) == expected
}
