//! Tuple ingress.
//!
//! The routing stage pulls quotes through the [`TupleSource`] trait, so the
//! same stage code runs against the production TCP feed and against in-memory
//! streams in tests. Sources yield decoded tuples including the reserved
//! sentinel keys; interpreting them is the routing stage's job.

use std::collections::VecDeque;
use std::io::Read;
use std::net::{TcpListener, TcpStream};

use tracing::info;

use riptide_core::{Tuple, RECORD_SIZE};

use crate::error::PipelineResult;

pub trait TupleSource: Send {
    /// Next tuple, or `None` when the feed closed without an explicit EOS.
    fn next(&mut self) -> PipelineResult<Option<Tuple>>;

    /// Tuples known to be waiting behind the last one delivered, if the
    /// transport can tell. Used as a scale-up hint when the backlog grows.
    fn backlog(&mut self) -> Option<usize> {
        None
    }
}

/// One TCP connection of fixed 64-byte records.
pub struct SocketSource {
    listener: Option<TcpListener>,
    conn: Option<TcpStream>,
    port: u16,
}

impl SocketSource {
    pub fn bind(port: u16) -> PipelineResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Ok(Self {
            listener: Some(listener),
            conn: None,
            port,
        })
    }

    fn connection(&mut self) -> PipelineResult<&mut TcpStream> {
        if self.conn.is_none() {
            // Single producer; the first connection is the feed.
            let listener = match self.listener.take() {
                Some(l) => l,
                None => TcpListener::bind(("0.0.0.0", self.port))?,
            };
            info!(port = self.port, "waiting for feed connection");
            let (stream, peer) = listener.accept()?;
            stream.set_nodelay(true)?;
            info!(%peer, "feed connected");
            self.conn = Some(stream);
        }
        match self.conn.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no feed connection",
            )
            .into()),
        }
    }
}

impl TupleSource for SocketSource {
    fn next(&mut self) -> PipelineResult<Option<Tuple>> {
        let stream = self.connection()?;
        let mut buf = [0u8; RECORD_SIZE];
        let mut read = 0;
        while read < RECORD_SIZE {
            match stream.read(&mut buf[read..])? {
                0 if read == 0 => return Ok(None),
                0 => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "feed closed mid-record",
                    )
                    .into())
                }
                n => read += n,
            }
        }
        Ok(Some(Tuple::from_bytes(&buf)))
    }
}

/// In-memory source for tests and replay.
pub struct VecSource {
    tuples: VecDeque<Tuple>,
}

impl VecSource {
    pub fn new(tuples: impl IntoIterator<Item = Tuple>) -> Self {
        Self {
            tuples: tuples.into_iter().collect(),
        }
    }
}

impl TupleSource for VecSource {
    fn next(&mut self) -> PipelineResult<Option<Tuple>> {
        Ok(self.tuples.pop_front())
    }

    fn backlog(&mut self) -> Option<usize> {
        Some(self.tuples.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::{KEY_EOS, KEY_SYNC};
    use std::io::Write;

    #[test]
    fn test_vec_source_drains() {
        let mut src = VecSource::new([
            Tuple {
                key: 1,
                ..Default::default()
            },
            Tuple {
                key: KEY_EOS,
                ..Default::default()
            },
        ]);
        assert_eq!(src.backlog(), Some(2));
        assert_eq!(src.next().unwrap().unwrap().key, 1);
        assert!(src.next().unwrap().unwrap().is_eos());
        assert!(src.next().unwrap().is_none());
    }

    #[test]
    fn test_socket_source_records() {
        let mut src = SocketSource::bind(0).unwrap();
        let port = src
            .listener
            .as_ref()
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let feeder = std::thread::spawn(move || {
            let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let sync = Tuple {
                key: KEY_SYNC,
                ..Default::default()
            };
            conn.write_all(&sync.to_bytes()).unwrap();
            let quote = Tuple {
                key: 3,
                id: 9,
                bid_price: 50.0,
                ..Default::default()
            };
            conn.write_all(&quote.to_bytes()).unwrap();
        });

        let first = src.next().unwrap().unwrap();
        assert!(first.is_sync());
        let second = src.next().unwrap().unwrap();
        assert_eq!(second.key, 3);
        assert_eq!(second.id, 9);
        feeder.join().unwrap();
        assert!(src.next().unwrap().is_none());
    }
}
