//! Byte pipes the connection multiplexer runs over. A transport is any
//! non-blocking full-duplex `Read + Write` endpoint: reads and writes raise
//! `WouldBlock` instead of stalling, and a zero-length read means the peer
//! hung up.

use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait Transport: io::Read + io::Write + Send {
    /// Best-effort teardown of the underlying pipe.
    fn shutdown(&mut self);

    /// Human-readable endpoint description for logging.
    fn describe(&self) -> String;
}

/// TCP transport with a bounded connect and non-blocking I/O thereafter.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(address: A, timeout: Duration) -> io::Result<TcpTransport> {
        let peer = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"))?;

        let stream = TcpStream::connect_timeout(&peer, timeout)?;
        Self::from_stream(stream)
    }

    /// Wraps an accepted or pre-connected stream.
    pub fn from_stream(stream: TcpStream) -> io::Result<TcpTransport> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(TcpTransport { stream, peer })
    }
}

impl io::Read for TcpTransport {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl io::Write for TcpTransport {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn shutdown(&mut self) {
        drop(self.stream.shutdown(Shutdown::Both));
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.peer)
    }
}

struct PipeState {
    data: Vec<u8>,
    closed: bool,
}

struct PipeLane {
    state: Mutex<PipeState>,
}

impl PipeLane {
    fn new() -> Arc<PipeLane> {
        Arc::new(PipeLane {
            state: Mutex::new(PipeState {
                data: Vec::new(),
                closed: false,
            }),
        })
    }
}

/// One end of an in-memory duplex pipe. Used to run a loopback connection
/// pair inside a single process, which is how the protocol machinery is
/// exercised without a network.
pub struct PipeTransport {
    label: &'static str,
    incoming: Arc<PipeLane>,
    outgoing: Arc<PipeLane>,
}

/// Creates a connected pair of in-memory transports.
pub fn pipe() -> (PipeTransport, PipeTransport) {
    let a_to_b = PipeLane::new();
    let b_to_a = PipeLane::new();

    (
        PipeTransport {
            label: "pipe:a",
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
        },
        PipeTransport {
            label: "pipe:b",
            incoming: a_to_b,
            outgoing: b_to_a,
        },
    )
}

impl io::Read for PipeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.incoming.state.lock().unwrap();

        if state.data.is_empty() {
            return if state.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }

        let count = buf.len().min(state.data.len());
        buf[..count].copy_from_slice(&state.data[..count]);
        state.data.drain(..count);
        Ok(count)
    }
}

impl io::Write for PipeTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.outgoing.state.lock().unwrap();

        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        state.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for PipeTransport {
    fn shutdown(&mut self) {
        for lane in &[&self.incoming, &self.outgoing] {
            lane.state.lock().unwrap().closed = true;
        }
    }

    fn describe(&self) -> String {
        self.label.to_string()
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
