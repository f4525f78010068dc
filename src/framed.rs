//! Turns an async byte source into a sequence of complete DNS messages.
//!
//! TCP/TLS mode reads a growable buffer and tracks `data_offset`/`data_size`/
//! `expected_message_size` the way the reference message reader does; it
//! compacts live bytes to the front when the tail runs out of room and
//! grows the buffer only when a single message exceeds current capacity.
//! UDP mode is a single fixed-capacity datagram read.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;

const INITIAL_CAPACITY: usize = 4096;

/// Why a framed read stopped.
pub enum StopReason {
    IoError(io::Error),
    /// Clean EOF or a cancelled read; not an error.
    Stopped,
}

/// Reads length-prefixed DNS messages off an async byte stream (TCP or TLS).
///
/// Yields the full framed message (2-byte prefix + body) on each call to
/// [`FramedReader::next_message`]; the caller decides whether to keep the
/// prefix (it does, for `QueryContext::query_framed`) or strip it.
pub struct FramedReader<S> {
    stream: S,
    buf: Vec<u8>,
    data_offset: usize,
    data_size: usize,
}

impl<S: AsyncRead + Unpin> FramedReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: vec![0u8; INITIAL_CAPACITY],
            data_offset: 0,
            data_size: 0,
        }
    }

    /// Read until one complete framed message is available, returning a copy
    /// of it (prefix included). Returns `Ok(None)` on clean end-of-stream.
    pub async fn next_message(&mut self) -> Result<Option<Vec<u8>>, StopReason> {
        loop {
            if let Some(len) = self.complete_message_len() {
                let start = self.data_offset;
                let message = self.buf[start..start + len].to_vec();
                self.data_offset += len;
                self.data_size -= len;
                return Ok(Some(message));
            }

            self.make_room();

            let tail_start = self.data_offset + self.data_size;
            let n = self
                .stream
                .read(&mut self.buf[tail_start..])
                .await
                .map_err(StopReason::IoError)?;
            if n == 0 {
                return Ok(None);
            }
            self.data_size += n;
        }
    }

    /// Length (prefix + body) of a complete message sitting at the front of
    /// the live data, if one has fully arrived.
    fn complete_message_len(&self) -> Option<usize> {
        if self.data_size < 2 {
            return None;
        }
        let start = self.data_offset;
        let body_len = u16::from_be_bytes([self.buf[start], self.buf[start + 1]]) as usize;
        let framed_len = 2 + body_len;
        if self.data_size >= framed_len {
            Some(framed_len)
        } else {
            None
        }
    }

    /// Ensure there is room at the tail for at least one more read,
    /// compacting live data to offset 0 first, then growing the buffer if a
    /// single message still would not fit.
    fn make_room(&mut self) {
        if self.data_offset > 0 && self.data_offset + self.data_size == self.buf.len() {
            self.buf.copy_within(self.data_offset..self.data_offset + self.data_size, 0);
            self.data_offset = 0;
        }

        let needed = if self.data_size >= 2 {
            let start = self.data_offset;
            2 + u16::from_be_bytes([self.buf[start], self.buf[start + 1]]) as usize
        } else {
            2
        };

        if self.data_offset + needed > self.buf.len() {
            self.buf.resize(self.data_offset + needed, 0);
        }
    }
}

/// A single UDP datagram read into a fixed-capacity buffer sized to the
/// configured payload limit.
pub async fn read_datagram(
    socket: &UdpSocket,
    capacity: usize,
) -> io::Result<(Vec<u8>, std::net::SocketAddr)> {
    let mut buf = vec![0u8; capacity];
    let (len, source) = socket.recv_from(&mut buf).await?;
    buf.truncate(len);
    Ok((buf, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn reads_one_message_delivered_in_one_write() {
        let (mut client, server) = duplex(4096);
        let message = framed(b"hello");
        client.write_all(&message).await.unwrap();
        drop(client);

        let mut reader = FramedReader::new(server);
        let got = reader.next_message().await.ok().flatten().unwrap();
        assert_eq!(got, message);
    }

    #[tokio::test]
    async fn reads_messages_split_across_many_small_writes() {
        let (mut client, server) = duplex(4096);
        let message = framed(b"split across chunks");
        let writer = tokio::spawn(async move {
            for chunk in message.chunks(3) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let mut reader = FramedReader::new(server);
        let got = reader.next_message().await.ok().flatten().unwrap();
        assert_eq!(got, framed(b"split across chunks"));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn two_concatenated_messages_yield_two_reads_in_order() {
        let (mut client, server) = duplex(4096);
        let mut both = framed(b"first");
        both.extend_from_slice(&framed(b"second"));
        client.write_all(&both).await.unwrap();
        drop(client);

        let mut reader = FramedReader::new(server);
        assert_eq!(reader.next_message().await.ok().flatten().unwrap(), framed(b"first"));
        assert_eq!(reader.next_message().await.ok().flatten().unwrap(), framed(b"second"));
    }

    #[tokio::test]
    async fn clean_eof_mid_message_yields_none_not_an_error() {
        let (mut client, server) = duplex(4096);
        client.write_all(&[0, 10, b'o', b'n', b'l', b'y']).await.unwrap();
        drop(client);

        let mut reader = FramedReader::new(server);
        assert!(matches!(reader.next_message().await, Ok(None)));
    }

    #[tokio::test]
    async fn message_larger_than_initial_capacity_grows_the_buffer() {
        let body = vec![0x42u8; INITIAL_CAPACITY * 2];
        let message = framed(&body);
        let (mut client, server) = duplex(INITIAL_CAPACITY * 4);
        client.write_all(&message).await.unwrap();
        drop(client);

        let mut reader = FramedReader::new(server);
        let got = reader.next_message().await.ok().flatten().unwrap();
        assert_eq!(got, message);
    }
}
