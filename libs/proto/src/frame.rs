//! Fixed-size control frames.
//!
//! Every frame is exactly [`FRAME_LEN`] bytes: ASCII content of the form
//! `TYPE;VALUE;`, NUL-padded to the frame length. Commands flow from the
//! controller to the dispatcher and carry a worker address; replies flow
//! back and carry no value.
//!
//! Encoding and decoding are pure functions over immutable frame values.
//! Nothing here touches a shared buffer.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of every control frame on the wire, in bytes.
pub const FRAME_LEN: usize = 50;

/// Frame encode/decode and transport errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Buffer was not exactly [`FRAME_LEN`] bytes.
    #[error("frame length {0} != {FRAME_LEN}")]
    Length(usize),

    /// Frame content was not ASCII.
    #[error("frame contains non-ASCII bytes")]
    NonAscii,

    /// A `;` field terminator was missing.
    #[error("missing field terminator")]
    MissingTerminator,

    /// Unrecognized TYPE field.
    #[error("unknown frame type {0:?}")]
    UnknownType(String),

    /// A command frame carried an empty address.
    #[error("command frame with empty value")]
    EmptyValue,

    /// Encoded content would not fit in [`FRAME_LEN`] bytes.
    #[error("frame content {0} bytes exceeds {FRAME_LEN}")]
    Oversize(usize),

    /// Transport failure while reading or writing a frame.
    #[error("frame io: {0}")]
    Io(#[from] std::io::Error),
}

/// A scale command, controller to dispatcher. The value is the worker's
/// network address (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register a newly activated worker.
    ScaleOut(String),
    /// Deregister a worker being shut down.
    ScaleIn(String),
    /// Re-confirm a worker the controller believes is active.
    Consistent(String),
}

impl Command {
    /// The worker address this command is about.
    pub fn address(&self) -> &str {
        match self {
            Command::ScaleOut(addr) | Command::ScaleIn(addr) | Command::Consistent(addr) => addr,
        }
    }

    fn type_tag(&self) -> &'static str {
        match self {
            Command::ScaleOut(_) => "SCALE_OUT",
            Command::ScaleIn(_) => "SCALE_IN",
            Command::Consistent(_) => "CONSISTENT",
        }
    }
}

/// A reply, dispatcher to controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success,
    Failed,
}

impl Reply {
    fn type_tag(&self) -> &'static str {
        match self {
            Reply::Success => "SUCCESS",
            Reply::Failed => "FAILED",
        }
    }
}

/// Any frame the control channel can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command(Command),
    Reply(Reply),
}

impl From<Command> for Frame {
    fn from(cmd: Command) -> Self {
        Frame::Command(cmd)
    }
}

impl From<Reply> for Frame {
    fn from(reply: Reply) -> Self {
        Frame::Reply(reply)
    }
}

impl Frame {
    /// Encode into a fixed-size wire frame.
    pub fn encode(&self) -> Result<[u8; FRAME_LEN], FrameError> {
        let (tag, value) = match self {
            Frame::Command(cmd) => {
                if cmd.address().is_empty() {
                    return Err(FrameError::EmptyValue);
                }
                (cmd.type_tag(), cmd.address())
            }
            Frame::Reply(reply) => (reply.type_tag(), ""),
        };

        let content = format!("{tag};{value};");
        if !content.is_ascii() {
            return Err(FrameError::NonAscii);
        }
        if content.len() > FRAME_LEN {
            return Err(FrameError::Oversize(content.len()));
        }

        let mut buf = [0u8; FRAME_LEN];
        buf[..content.len()].copy_from_slice(content.as_bytes());
        Ok(buf)
    }

    /// Decode a wire frame. The buffer must be exactly [`FRAME_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() != FRAME_LEN {
            return Err(FrameError::Length(buf.len()));
        }

        let end = buf.iter().position(|&b| b == 0).unwrap_or(FRAME_LEN);
        let content = &buf[..end];
        if !content.is_ascii() {
            return Err(FrameError::NonAscii);
        }
        let content = std::str::from_utf8(content).map_err(|_| FrameError::NonAscii)?;

        let mut fields = content.split(';');
        let tag = fields.next().ok_or(FrameError::MissingTerminator)?;
        let value = fields.next().ok_or(FrameError::MissingTerminator)?;
        // Both fields are semicolon-terminated, so a well-formed frame
        // yields one final empty segment.
        if fields.next() != Some("") {
            return Err(FrameError::MissingTerminator);
        }

        match tag {
            "SCALE_OUT" | "SCALE_IN" | "CONSISTENT" => {
                if value.is_empty() {
                    return Err(FrameError::EmptyValue);
                }
                let addr = value.to_string();
                Ok(Frame::Command(match tag {
                    "SCALE_OUT" => Command::ScaleOut(addr),
                    "SCALE_IN" => Command::ScaleIn(addr),
                    _ => Command::Consistent(addr),
                }))
            }
            "SUCCESS" => Ok(Frame::Reply(Reply::Success)),
            "FAILED" => Ok(Frame::Reply(Reply::Failed)),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

/// Write one frame to the stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one full frame from the stream.
///
/// A short read (peer closed mid-frame) surfaces as an I/O error, never as
/// a truncated frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FRAME_LEN];
    reader.read_exact(&mut buf).await?;
    Frame::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Command::ScaleOut("192.168.122.89:8080".to_string()))]
    #[case(Command::ScaleIn("192.168.122.89:8080".to_string()))]
    #[case(Command::Consistent("10.0.0.7:9000".to_string()))]
    fn command_round_trip(#[case] cmd: Command) {
        let buf = Frame::Command(cmd.clone()).encode().unwrap();
        assert_eq!(buf.len(), FRAME_LEN);
        assert_eq!(Frame::decode(&buf).unwrap(), Frame::Command(cmd));
    }

    #[rstest]
    #[case(Reply::Success)]
    #[case(Reply::Failed)]
    fn reply_round_trip(#[case] reply: Reply) {
        let buf = Frame::Reply(reply).encode().unwrap();
        assert_eq!(Frame::decode(&buf).unwrap(), Frame::Reply(reply));
    }

    #[test]
    fn encode_is_nul_padded() {
        let buf = Frame::Reply(Reply::Success).encode().unwrap();
        assert_eq!(&buf[..9], b"SUCCESS;;");
        assert!(buf[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = Frame::decode(&[0u8; 49]).unwrap_err();
        assert!(matches!(err, FrameError::Length(49)));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = [0u8; FRAME_LEN];
        buf[..9].copy_from_slice(b"RESIZE;x;");
        let err = Frame::decode(&buf).unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(t) if t == "RESIZE"));
    }

    #[test]
    fn decode_rejects_missing_terminator() {
        let mut buf = [0u8; FRAME_LEN];
        // No trailing semicolon after the value.
        buf[..15].copy_from_slice(b"SCALE_OUT;host1");
        let err = Frame::decode(&buf).unwrap_err();
        assert!(matches!(err, FrameError::MissingTerminator));
    }

    #[test]
    fn decode_rejects_non_ascii() {
        let mut buf = [0u8; FRAME_LEN];
        buf[..8].copy_from_slice(b"SUCCESS;");
        buf[8] = 0xC3;
        buf[9] = 0xA9;
        buf[10] = b';';
        assert!(matches!(Frame::decode(&buf), Err(FrameError::NonAscii)));
    }

    #[test]
    fn encode_rejects_empty_address() {
        let err = Frame::Command(Command::ScaleOut(String::new()))
            .encode()
            .unwrap_err();
        assert!(matches!(err, FrameError::EmptyValue));
    }

    #[test]
    fn encode_rejects_oversize_address() {
        let long = "a".repeat(FRAME_LEN);
        let err = Frame::Command(Command::ScaleOut(long)).encode().unwrap_err();
        assert!(matches!(err, FrameError::Oversize(_)));
    }

    #[tokio::test]
    async fn frame_io_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(FRAME_LEN * 2);

        let cmd = Frame::Command(Command::Consistent("worker-1:8080".to_string()));
        write_frame(&mut a, &cmd).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), cmd);

        write_frame(&mut b, &Frame::Reply(Reply::Failed)).await.unwrap();
        assert_eq!(
            read_frame(&mut a).await.unwrap(),
            Frame::Reply(Reply::Failed)
        );
    }

    #[tokio::test]
    async fn read_frame_short_read_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(FRAME_LEN * 2);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"SUCCESS;;")
            .await
            .unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await.unwrap_err(),
            FrameError::Io(_)
        ));
    }
}
