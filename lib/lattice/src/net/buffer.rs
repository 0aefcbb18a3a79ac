use bytes::{Buf, BytesMut};
use std::io;

const INGRESS_CHUNK: usize = 4096;

/// A growable byte FIFO sitting between the framing layer and a non-blocking
/// byte pipe. Data is appended at the tail and consumed from the head;
/// `ingress`/`egress` shuttle bytes to and from the transport, stopping at
/// `WouldBlock` so the service loop never stalls on the socket.
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer { data: BytesMut::new() }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Discard `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.data.advance(count);
    }

    /// Append raw bytes at the tail.
    #[inline]
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Read all currently available data from the reader into the buffer.
    /// Stops cleanly on `WouldBlock`; a zero-length read means the peer closed
    /// the pipe and is reported as `UnexpectedEof`.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut scratch = [0u8; INGRESS_CHUNK];
        let mut total = 0;

        loop {
            match reader.read(&mut scratch) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(count) => {
                    self.data.extend_from_slice(&scratch[..count]);
                    total += count;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Write as much buffered data to the writer as it will take, advancing
    /// the head. Stops cleanly on `WouldBlock`; a zero-length write is an
    /// error so a stuck sink cannot spin the loop.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.data.advance(count);
                    total += count;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Byte pipe that serves reads and accepts writes in fixed chunks and
    /// raises `WouldBlock` at its limits, like a non-blocking socket.
    struct MockPipe {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockPipe {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockPipe {
            MockPipe {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl io::Read for MockPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..self.cursor + offset]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ingress_until_wouldblock() {
        let payload: Vec<u8> = (0..10_000).map(|i| i as u8).collect();
        let mut pipe = MockPipe::new(payload.clone(), 512, 0);
        let mut buffer = Buffer::new();

        let count = buffer.ingress(&mut pipe).unwrap();

        assert_eq!(count, payload.len());
        assert_eq!(buffer.data(), &payload[..]);
    }

    #[test]
    fn test_ingress_eof() {
        let mut buffer = Buffer::new();
        // An empty Cursor reads zero bytes, which means a closed peer.
        let result = buffer.ingress(io::Cursor::new(Vec::<u8>::new()));

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_egress_partial_then_drain() {
        let mut buffer = Buffer::new();
        buffer.put_slice(&[7u8; 1000]);

        let mut pipe = MockPipe::new(Vec::new(), 300, 400);
        let count = buffer.egress(&mut pipe).unwrap();

        // The sink filled up at 400 bytes and signalled WouldBlock.
        assert_eq!(count, 400);
        assert_eq!(buffer.len(), 600);

        pipe.max_size = 2000;
        let count = buffer.egress(&mut pipe).unwrap();
        assert_eq!(count, 600);
        assert!(buffer.is_empty());
        assert_eq!(pipe.data, vec![7u8; 1000]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        struct ZeroSink;
        impl io::Write for ZeroSink {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::new();
        buffer.put_slice(&[1]);

        let result = buffer.egress(ZeroSink);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_consume() {
        let mut buffer = Buffer::new();
        buffer.put_slice(&[1, 2, 3, 4, 5]);
        buffer.consume(2);
        assert_eq!(buffer.data(), &[3, 4, 5]);
    }
}
