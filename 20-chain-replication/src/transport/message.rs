//! Frames exchanged between adjacent nodes.
//!
//! Every frame is one JSON document on its own line, tagged with `type` and
//! carrying a `payload`:
//!
//! ```text
//! {"type":"request","payload":{"id":"u1","key":"k","kind":"update","value":"djE="}}
//! {"type":"ack","payload":{"id":"u1"}}
//! {"type":"response","payload":{"id":"u1","key":"k","value":"djE="}}
//! ```
//!
//! Requests travel toward the tail, responses toward the head, and every
//! request or response is answered with an [`Ack`] carrying the same id.
//! Byte values are standard base64 strings.

use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{Request, Response};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Acknowledges the request or response whose business id is `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub id: String,
}

/// Frame exchanged between adjacent nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    Request(Request),
    Response(Response),
    Ack(Ack),
}

impl Message {
    /// Business id of the payload; acknowledgments reuse it.
    pub fn id(&self) -> &str {
        match self {
            Message::Request(request) => &request.id,
            Message::Response(response) => &response.id,
            Message::Ack(ack) => &ack.id,
        }
    }
}

/// Reads the next newline-delimited JSON document, skipping blank lines.
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

/// Writes `message` as one JSON document followed by a newline, then flushes.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let sent = vec![
            Message::Request(Request::update("u1", "k", b"v1".to_vec())),
            Message::Ack(Ack { id: "u1".into() }),
            Message::Response(Response::new("u1", "k", Some(b"v1".to_vec()))),
        ];

        for message in &sent {
            write_message(&mut writer, message).await.expect("write message");
        }
        drop(writer);

        let mut received = Vec::new();
        while let Some(message) = read_message::<_, Message>(&mut reader).await.expect("read message") {
            received.push(message);
        }
        assert_eq!(received, sent);
    }

    #[test]
    fn ack_wire_shape() {
        let json = serde_json::to_value(Message::Ack(Ack { id: "u1".into() })).expect("serialize");
        assert_eq!(json, serde_json::json!({"type": "ack", "payload": {"id": "u1"}}));
    }

    #[tokio::test]
    async fn malformed_frame_is_invalid_data() {
        let mut reader = tokio::io::BufReader::new(&b"\n{not json}\n"[..]);
        let err = read_message::<_, Message>(&mut reader).await.expect_err("should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
