use std::{io, time::Duration};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    sync::mpsc,
    time,
};

mod control;

pub use control::{ControlFrame, ControlType};

use control::MAX_CONTROL_FRAME_LENGTH;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub content_type: Bytes,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum FramestreamError {
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("unexpected control frame {got:?}, expected {expected:?}")]
    UnexpectedControl {
        expected: ControlType,
        got: ControlType,
    },
    #[error("unknown control frame type {0:#x}")]
    UnknownControl(u32),
    #[error("malformed control frame: {0}")]
    MalformedControl(String),
    #[error("content type {0:?} not offered by peer")]
    ContentType(String),
    #[error("frame of {0} bytes exceeds the {1} bytes limit")]
    FrameTooLarge(usize, usize),
    #[error("data frame must not be empty")]
    EmptyFrame,
    #[error("frame receiver closed")]
    ReceiverClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FramestreamError {
    pub fn is_closed_connection(&self) -> bool {
        match self {
            FramestreamError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub struct FrameStream<S> {
    stream: BufStream<S>,
    content_type: Bytes,
    timeout: Duration,
    bidirectional: bool,
    max_frame_length: usize,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        content_type: impl Into<Bytes>,
        timeout: Duration,
        bidirectional: bool,
    ) -> Self {
        Self {
            stream: BufStream::new(stream),
            content_type: content_type.into(),
            timeout,
            bidirectional,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub async fn init_receiver(&mut self) -> Result<(), FramestreamError> {
        let timeout = self.timeout;
        time::timeout(timeout, self.receiver_handshake())
            .await
            .map_err(|_| FramestreamError::HandshakeTimeout(timeout))?
    }

    async fn receiver_handshake(&mut self) -> Result<(), FramestreamError> {
        if self.bidirectional {
            let ready = self.read_control().await?;
            self.expect_control(&ready, ControlType::Ready)?;
            let accept =
                ControlFrame::new(ControlType::Accept).with_content_type(self.content_type.clone());
            self.write_control(&accept).await?;
        }
        let start = self.read_control().await?;
        self.expect_control(&start, ControlType::Start)
    }

    /// Reads data frames into `output` until the peer sends STOP or the
    /// stream fails. `output` is dropped on return, so its receiver always
    /// observes the end of the stream.
    pub async fn process_frames(
        &mut self,
        output: mpsc::Sender<Frame>,
    ) -> Result<(), FramestreamError> {
        loop {
            let length = self.stream.read_u32().await? as usize;
            if length == 0 {
                let control = self.read_control_body().await?;
                return match control.kind {
                    ControlType::Stop => {
                        if self.bidirectional {
                            self.write_control(&ControlFrame::new(ControlType::Finish))
                                .await?;
                        }
                        Ok(())
                    }
                    got => Err(FramestreamError::UnexpectedControl {
                        expected: ControlType::Stop,
                        got,
                    }),
                };
            }
            if length > self.max_frame_length {
                return Err(FramestreamError::FrameTooLarge(
                    length,
                    self.max_frame_length,
                ));
            }
            let mut payload = BytesMut::zeroed(length);
            self.stream.read_exact(&mut payload).await?;
            let frame = Frame {
                content_type: self.content_type.clone(),
                payload: payload.freeze(),
            };
            if output.send(frame).await.is_err() {
                return Err(FramestreamError::ReceiverClosed);
            }
        }
    }

    pub async fn init_sender(&mut self) -> Result<(), FramestreamError> {
        let timeout = self.timeout;
        time::timeout(timeout, self.sender_handshake())
            .await
            .map_err(|_| FramestreamError::HandshakeTimeout(timeout))?
    }

    async fn sender_handshake(&mut self) -> Result<(), FramestreamError> {
        if self.bidirectional {
            let ready =
                ControlFrame::new(ControlType::Ready).with_content_type(self.content_type.clone());
            self.write_control(&ready).await?;
            let accept = self.read_control().await?;
            self.expect_control(&accept, ControlType::Accept)?;
        }
        let start =
            ControlFrame::new(ControlType::Start).with_content_type(self.content_type.clone());
        self.write_control(&start).await
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), FramestreamError> {
        if payload.is_empty() {
            return Err(FramestreamError::EmptyFrame);
        }
        if payload.len() > self.max_frame_length {
            return Err(FramestreamError::FrameTooLarge(
                payload.len(),
                self.max_frame_length,
            ));
        }
        self.stream.write_u32(payload.len() as u32).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn finish(&mut self) -> Result<(), FramestreamError> {
        self.write_control(&ControlFrame::new(ControlType::Stop))
            .await?;
        if self.bidirectional {
            let timeout = self.timeout;
            let finish = time::timeout(timeout, self.read_control())
                .await
                .map_err(|_| FramestreamError::HandshakeTimeout(timeout))??;
            self.expect_control(&finish, ControlType::Finish)?;
        }
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    fn expect_control(
        &self,
        frame: &ControlFrame,
        expected: ControlType,
    ) -> Result<(), FramestreamError> {
        if frame.kind != expected {
            return Err(FramestreamError::UnexpectedControl {
                expected,
                got: frame.kind,
            });
        }
        if matches!(expected, ControlType::Ready | ControlType::Start | ControlType::Accept)
            && !frame.offers(&self.content_type)
        {
            return Err(FramestreamError::ContentType(
                String::from_utf8_lossy(&self.content_type).into_owned(),
            ));
        }
        Ok(())
    }

    async fn read_control(&mut self) -> Result<ControlFrame, FramestreamError> {
        let escape = self.stream.read_u32().await?;
        if escape != 0 {
            return Err(FramestreamError::MalformedControl(format!(
                "expected control frame escape, got data frame of {} bytes",
                escape
            )));
        }
        self.read_control_body().await
    }

    async fn read_control_body(&mut self) -> Result<ControlFrame, FramestreamError> {
        let length = self.stream.read_u32().await? as usize;
        if length < 4 || length > MAX_CONTROL_FRAME_LENGTH {
            return Err(FramestreamError::MalformedControl(format!(
                "control frame length {} out of bounds",
                length
            )));
        }
        let mut body = vec![0; length];
        self.stream.read_exact(&mut body).await?;
        ControlFrame::parse(&body)
    }

    async fn write_control(&mut self, frame: &ControlFrame) -> Result<(), FramestreamError> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::{io::duplex, sync::mpsc};

    use super::{FrameStream, FramestreamError};

    const CONTENT_TYPE: &[u8] = b"protobuf:dnstap.Dnstap";
    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn should_receive_every_frame_unmodified() -> Result<()> {
        let (client, server) = duplex(64 * 1024);
        let payloads = vec![
            b"first".to_vec(),
            vec![0u8; 3000],
            b"\x00\x01\x02third".to_vec(),
        ];
        let sent = payloads.clone();
        let sender = tokio::spawn(async move {
            let mut fs = FrameStream::new(client, CONTENT_TYPE, TIMEOUT, true);
            fs.init_sender().await?;
            for payload in &sent {
                fs.send_frame(payload).await?;
            }
            fs.finish().await?;
            Ok::<_, FramestreamError>(())
        });

        let mut fs = FrameStream::new(server, CONTENT_TYPE, TIMEOUT, true);
        fs.init_receiver().await?;
        let (tx, mut rx) = mpsc::channel(16);
        fs.process_frames(tx).await?;
        sender.await??;

        let mut received = Vec::new();
        while let Some(frame) = rx.recv().await {
            assert_eq!(frame.content_type, Bytes::from_static(CONTENT_TYPE));
            received.push(frame.payload.to_vec());
        }
        assert_eq!(received, payloads);
        Ok(())
    }

    #[tokio::test]
    async fn should_support_unidirectional_streams() -> Result<()> {
        let (client, server) = duplex(1024);
        let sender = tokio::spawn(async move {
            let mut fs = FrameStream::new(client, CONTENT_TYPE, TIMEOUT, false);
            fs.init_sender().await?;
            fs.send_frame(b"only").await?;
            fs.finish().await
        });

        let mut fs = FrameStream::new(server, CONTENT_TYPE, TIMEOUT, false);
        fs.init_receiver().await?;
        let (tx, mut rx) = mpsc::channel(4);
        fs.process_frames(tx).await?;
        sender.await??;

        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"only"));
        assert!(rx.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn should_reject_other_content_type() {
        let (client, server) = duplex(1024);
        tokio::spawn(async move {
            let mut fs = FrameStream::new(client, &b"protobuf:other"[..], TIMEOUT, true);
            let _ = fs.init_sender().await;
        });

        let mut fs = FrameStream::new(server, CONTENT_TYPE, TIMEOUT, true);
        let err = fs.init_receiver().await.unwrap_err();

        assert!(matches!(err, FramestreamError::ContentType(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn should_time_out_silent_handshake() {
        let (_client, server) = duplex(1024);
        let timeout = Duration::from_millis(50);

        let mut fs = FrameStream::new(server, CONTENT_TYPE, timeout, true);
        let err = fs.init_receiver().await.unwrap_err();

        assert!(matches!(err, FramestreamError::HandshakeTimeout(t) if t == timeout));
    }

    #[tokio::test]
    async fn should_report_peer_close_as_closed_connection() -> Result<()> {
        let (client, server) = duplex(1024);
        let sender = tokio::spawn(async move {
            let mut fs = FrameStream::new(client, CONTENT_TYPE, TIMEOUT, true);
            fs.init_sender().await?;
            fs.send_frame(b"one").await?;
            drop(fs);
            Ok::<_, FramestreamError>(())
        });

        let mut fs = FrameStream::new(server, CONTENT_TYPE, TIMEOUT, true);
        fs.init_receiver().await?;
        let (tx, mut rx) = mpsc::channel(4);
        let err = fs.process_frames(tx).await.unwrap_err();
        sender.await??;

        assert!(err.is_closed_connection(), "{:?}", err);
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"one"));
        assert!(rx.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn should_refuse_oversized_frames() -> Result<()> {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(async move {
            let mut fs = FrameStream::new(client, CONTENT_TYPE, TIMEOUT, true);
            fs.init_sender().await?;
            fs.send_frame(&[7u8; 100]).await?;
            Ok::<_, FramestreamError>(())
        });

        let mut fs =
            FrameStream::new(server, CONTENT_TYPE, TIMEOUT, true).with_max_frame_length(64);
        fs.init_receiver().await?;
        let (tx, _rx) = mpsc::channel(4);
        let err = fs.process_frames(tx).await.unwrap_err();

        assert!(matches!(err, FramestreamError::FrameTooLarge(100, 64)));
        Ok(())
    }

    #[tokio::test]
    async fn should_refuse_to_send_empty_frame() -> Result<()> {
        let (client, _server) = duplex(1024);
        let mut fs = FrameStream::new(client, CONTENT_TYPE, TIMEOUT, false);

        let err = fs.send_frame(b"").await.unwrap_err();

        assert!(matches!(err, FramestreamError::EmptyFrame), "{:?}", err);
        Ok(())
    }
}
