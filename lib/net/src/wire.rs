//! On-wire framing for the peer transport.
//!
//! Every message is a 4-byte big-endian length prefix followed by a JSON-encoded [`Header`], and
//! then, for each of `Header`'s declared attachments, a 4-byte big-endian length prefix and the
//! raw bytes. This is the concrete resolution of the "attachment side-channel during
//! serialization" redesign note in spec.md §9: pre-serialized block payloads travel as raw
//! buffers rather than being re-encoded into the JSON body.

use bytes::Bytes;
use error_stack::{IntoReport, ResultExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};

/// Maximum header size accepted from a peer, to bound memory use on malformed input.
const MAX_HEADER_LEN: u32 = 16 * 1024 * 1024;
/// Maximum single attachment size accepted from a peer.
const MAX_ATTACHMENT_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub correlation_id: u64,
    pub kind: Kind,
    pub num_attachments: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Kind {
    Hello {
        name: String,
        node_type: String,
        addresses: Vec<crate::address::NodeAddress>,
    },
    Request {
        service: String,
        method: String,
        payload: serde_json::Value,
    },
    Response {
        payload: serde_json::Value,
    },
    Error {
        message: String,
    },
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &Header,
    attachments: &[Bytes],
) -> Result<()> {
    let body = serde_json::to_vec(header)
        .into_report()
        .change_context_lazy(|| NetError::transport("could not serialize message header"))?;
    writer
        .write_u32(body.len() as u32)
        .await
        .into_report()
        .change_context_lazy(|| NetError::transport("could not write header length"))?;
    writer
        .write_all(&body)
        .await
        .into_report()
        .change_context_lazy(|| NetError::transport("could not write header"))?;
    for attachment in attachments {
        writer
            .write_u32(attachment.len() as u32)
            .await
            .into_report()
            .change_context_lazy(|| NetError::transport("could not write attachment length"))?;
        writer
            .write_all(attachment)
            .await
            .into_report()
            .change_context_lazy(|| NetError::transport("could not write attachment"))?;
    }
    writer
        .flush()
        .await
        .into_report()
        .change_context_lazy(|| NetError::transport("could not flush connection"))?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Header, Vec<Bytes>)> {
    let len = reader
        .read_u32()
        .await
        .into_report()
        .change_context_lazy(|| NetError::transport("connection closed while reading header"))?;
    if len > MAX_HEADER_LEN {
        return Err(error_stack::Report::new(NetError::transport(format!(
            "header of {len} bytes exceeds limit"
        ))));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .into_report()
        .change_context_lazy(|| NetError::transport("connection closed while reading header body"))?;
    let header: Header = serde_json::from_slice(&body)
        .into_report()
        .change_context_lazy(|| NetError::transport("could not deserialize message header"))?;

    let mut attachments = Vec::with_capacity(header.num_attachments as usize);
    for _ in 0..header.num_attachments {
        let len = reader
            .read_u32()
            .await
            .into_report()
            .change_context_lazy(|| NetError::transport("connection closed while reading attachment"))?;
        if len > MAX_ATTACHMENT_LEN {
            return Err(error_stack::Report::new(NetError::transport(format!(
                "attachment of {len} bytes exceeds limit"
            ))));
        }
        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .into_report()
            .change_context_lazy(|| NetError::transport("connection closed while reading attachment body"))?;
        attachments.push(Bytes::from(buf));
    }

    Ok((header, attachments))
}
