//! Line framing for [`Frame`]s on a byte stream.
//!
//! Each frame is one JSON document terminated by `\n`. A line that fails to
//! decode is surfaced as an `Err` *item* rather than a stream error, so a
//! malformed payload aborts only the transfer it belongs to while the
//! connection keeps working. Only real I/O failures end the stream.

use crate::mailserver::error::{DecodeError, TransportError};
use crate::mailserver::message::Frame;
use bytes::{BufMut, BytesMut};
use futures::StreamExt;
use std::io;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Default upper bound for one encoded frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub type FrameReader<R> = FramedRead<R, FrameCodec>;
pub type FrameWriter<W> = FramedWrite<W, FrameCodec>;

/// Codec turning a byte stream into [`Frame`]s and back
#[derive(Debug, Clone)]
pub struct FrameCodec {
    lines: LinesCodec,
    max_length: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn frame_from_line(
        &self,
        line: Result<Option<String>, LinesCodecError>,
    ) -> io::Result<Option<Option<Result<Frame, DecodeError>>>> {
        match line {
            // Blank lines are keep-alive noise; ask the caller to try again
            Ok(Some(line)) if line.trim().is_empty() => Ok(Some(None)),
            Ok(Some(line)) => Ok(Some(Some(
                Frame::from_bytes(line.as_bytes()).map_err(DecodeError::from),
            ))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Ok(Some(Some(Err(DecodeError::FrameTooLong(self.max_length)))))
            }
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Some(Err(DecodeError::InvalidUtf8))))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        loop {
            let line = self.lines.decode(src);
            match self.frame_from_line(line)? {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        loop {
            let line = self.lines.decode_eof(src);
            match self.frame_from_line(line)? {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        let bytes = frame
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // The peer would discard anything longer, so refuse before writing
        if bytes.len() - 1 > self.max_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                DecodeError::FrameTooLong(self.max_length),
            ));
        }

        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

/// Wait for the next frame, bounded by an optional idle timeout.
///
/// `Ok(None)` means the peer closed the stream.
pub async fn read_frame<R>(
    reader: &mut FrameReader<R>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<Frame, DecodeError>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.next())
            .await
            .map_err(|_| TransportError::IdleTimeout(limit.as_secs()))?,
        None => reader.next().await,
    };

    next.transpose().map_err(TransportError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailserver::message::Command;
    use futures::SinkExt;

    fn decode_next(codec: &mut FrameCodec, buf: &mut BytesMut) -> Option<Result<Frame, DecodeError>> {
        codec.decode(buf).unwrap()
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&br#"{"kind":"command","tok"#[..]);

        assert!(decode_next(&mut codec, &mut buf).is_none());

        buf.extend_from_slice(b"en\":\"logoff\"}\n\n{\"kind\":\"status\",\"text\":\"ok\"}\n");
        let first = decode_next(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(first.as_command(), Some(Command::Logoff));

        // blank line in between is skipped
        let second = decode_next(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(second, Frame::status("ok"));
        assert!(decode_next(&mut codec, &mut buf).is_none());
    }

    #[test]
    fn test_malformed_line_does_not_poison_stream() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"not json\n{\"kind\":\"login\",\"identity\":\"a@x\"}\n"[..]);

        assert!(matches!(
            decode_next(&mut codec, &mut buf),
            Some(Err(DecodeError::Json(_)))
        ));
        assert_eq!(
            decode_next(&mut codec, &mut buf).unwrap().unwrap(),
            Frame::login("a@x")
        );
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut codec = FrameCodec::with_max_length(32);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 100]);
        buf.extend_from_slice(b"\n{\"kind\":\"status\",\"text\":\"ok\"}\n");

        assert!(matches!(
            decode_next(&mut codec, &mut buf),
            Some(Err(DecodeError::FrameTooLong(32)))
        ));
        assert_eq!(
            decode_next(&mut codec, &mut buf).unwrap().unwrap(),
            Frame::status("ok")
        );
    }

    #[test]
    fn test_invalid_utf8_is_a_decode_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"\xff\xfe\n"[..]);

        assert!(matches!(
            decode_next(&mut codec, &mut buf),
            Some(Err(DecodeError::InvalidUtf8))
        ));
    }

    #[test]
    fn test_encode_refuses_oversized_frame() {
        let mut codec = FrameCodec::with_max_length(16);
        let mut buf = BytesMut::new();

        let err = codec
            .encode(Frame::status("this status text is far too long"), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_read_frame_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(client, FrameCodec::new());
        let mut reader = FramedRead::new(server, FrameCodec::new());

        writer.send(Frame::command(Command::SendMessage)).await.unwrap();
        let frame = read_frame(&mut reader, Some(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_command(), Some(Command::SendMessage));

        drop(writer);
        assert!(read_frame(&mut reader, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_idle_timeout() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = FramedRead::new(server, FrameCodec::new());

        let result = read_frame(&mut reader, Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(TransportError::IdleTimeout(_))));
    }
}
