use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use objmux_transport::IpcStream;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
/// Bytes read past the end of one frame stay buffered for the next call,
/// so a reader can be handed from the handshake to the connection loop
/// without losing data.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// A zero-byte read yields `Err(FrameError::ConnectionClosed)`, whether or
    /// not a frame was partially received.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    ///
    /// Any buffered bytes that did not form a complete frame are lost.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout of the underlying stream.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}

pub(crate) fn transport_to_frame_error(err: objmux_transport::TransportError) -> FrameError {
    match err {
        objmux_transport::TransportError::Io(io)
        | objmux_transport::TransportError::Accept(io) => FrameError::Io(io),
        objmux_transport::TransportError::Bind { source, .. }
        | objmux_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::encode_frame;
    use crate::writer::FrameWriter;

    fn wire(frames: &[(i32, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (channel, payload) in frames {
            encode_frame(*channel, payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn reads_frames_in_order() {
        let bytes = wire(&[(1, b"one"), (2, b"two"), (3, b"three")]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!((f1.channel, f1.payload.as_ref()), (1, b"one".as_ref()));
        assert_eq!((f2.channel, f2.payload.as_ref()), (2, b"two".as_ref()));
        assert_eq!((f3.channel, f3.payload.as_ref()), (3, b"three".as_ref()));
    }

    #[test]
    fn large_payload_spans_many_reads() {
        let payload = vec![0xAB; 64 * 1024];
        let bytes = wire(&[(9, &payload)]);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.channel, 9);
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn byte_by_byte_source() {
        let reader = ByteByByteReader {
            bytes: wire(&[(4, b"slow")]),
            pos: 0,
        };
        let mut reader = FrameReader::new(reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel, 4);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn eof_is_connection_closed() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn eof_mid_frame_is_connection_closed() {
        let mut partial = BytesMut::new();
        partial.put_i32_le(2);
        partial.put_i32_le(16);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let mut bytes = BytesMut::new();
        bytes.put_i32_le(1);
        bytes.put_i32_le(1024);

        let cfg = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes.to_vec()), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedOnce {
            interrupted: false,
            inner: Cursor::new(wire(&[(8, b"ok")])),
        };
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();

        assert_eq!(frame.channel, 8);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn timed_out_read_propagates() {
        let mut framed = FrameReader::new(AlwaysTimedOut);
        let err = framed.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::TimedOut));
    }

    #[test]
    #[cfg(unix)]
    fn per_channel_order_over_socket_pair() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let sender = std::thread::spawn(move || {
            for i in 0..64i32 {
                writer
                    .send(i % 3 + 1, format!("msg-{i}").as_bytes())
                    .unwrap();
            }
        });

        let mut last_seen = [-1i32; 3];
        for _ in 0..64 {
            let frame = reader.read_frame().unwrap();
            let text = std::str::from_utf8(&frame.payload).unwrap();
            let n: i32 = text.trim_start_matches("msg-").parse().unwrap();
            let slot = (frame.channel - 1) as usize;
            assert!(n > last_seen[slot], "channel {} went backwards", frame.channel);
            last_seen[slot] = n;
        }
        sender.join().unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn applies_read_timeout_for_ipc_stream() {
        let (left, _right) = IpcStream::pair().unwrap();
        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };

        let mut reader = FrameReader::with_config_ipc(left, cfg).unwrap();
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Io(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
        ));

        reader.set_read_timeout(None).unwrap();
        assert!(reader.config().read_timeout.is_none());
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedOnce {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedOnce {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }

    struct AlwaysTimedOut;

    impl Read for AlwaysTimedOut {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::TimedOut))
        }
    }
}
