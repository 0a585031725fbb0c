//! Codec - 長さプレフィックス付き JSON フレーム

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Message, ProtocolError};

/// Largest accepted frame body. Status reports are the biggest messages and
/// stay far below this.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    // MAX_FRAME_LEN fits in a u32.
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean EOF before the length prefix is `Closed`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(ProtocolError::Closed),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use crate::protocol::Route;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let task_id = TaskId::generate();

        write_message(&mut client, &Message::TaskRefused { task_id })
            .await
            .unwrap();
        write_message(&mut client, &Message::Bye).await.unwrap();

        let first = read_message(&mut server).await.unwrap();
        assert!(matches!(first, Message::TaskRefused { task_id: id } if id == task_id));
        assert_eq!(read_message(&mut server).await.unwrap().route(), Route::Bye);
    }

    #[tokio::test]
    async fn eof_before_prefix_is_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Closed));
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected_without_reading_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(u32::MAX).await.unwrap();

        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn garbage_body_is_a_codec_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let body = b"not json";
        client.write_u32(body.len() as u32).await.unwrap();
        client.write_all(body).await.unwrap();

        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Codec(_)));
    }
}
