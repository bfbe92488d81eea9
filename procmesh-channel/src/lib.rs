//! Framed message channels connecting the processes of a cluster.
//!
//! A channel carries *frames*: a fixed 32-byte header (four little-endian
//! `i64` values naming the response and notify reference ids of the message),
//! a serialized body, and a fixed 10-byte boundary. The body is not length
//! prefixed: a reader that fails to deserialize a body scans forward to the
//! boundary and resynchronizes, so a single corrupt body does not poison the
//! stream. The header of such a frame is still meaningful and lets the
//! recipient report the failure to the sender.
//!
//! Two transports implement the same interface:
//!
//! - local channels ([`new_local_channel`]) move frames through an in-memory
//!   queue, used when several cluster processes are simulated inside a single
//!   OS process (mainly in tests);
//! - TCP channels write to / read from a `TcpStream` pair, used for real
//!   clusters.
//!
//! TCP connections start with a short preamble (a 16-byte cookie and a
//! 16-byte version string) validated by the accepting side before any frame
//! is exchanged. [`ChannelServer`] yields one channel pair per accepted and
//! validated connection.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

use std::io::{BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use anyhow::{bail, Context, Error};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size in bytes of a frame header: four little-endian `i64`.
pub const HEADER_LEN: usize = 32;

/// Byte sequence closing every frame. A reader that lost track of the stream
/// scans forward to this sequence to find the next frame start.
pub const MSG_BOUNDARY: [u8; 10] = [
    0x79, 0x8e, 0x8e, 0xf5, 0x6e, 0x9b, 0x2e, 0x97, 0xd5, 0x7d,
];

/// Width of the cookie field of the connection preamble.
pub const COOKIE_LEN: usize = 16;

/// Width of the version field of the connection preamble.
pub const VERSION_LEN: usize = 16;

/// The version string sent in the connection preamble. Both ends of a
/// connection must agree on it exactly.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Raw frame header: `response.whence`, `response.id`, `notify.whence`,
/// `notify.id`. The zero pair means "no reference".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader(pub [i64; 4]);

impl FrameHeader {
    /// Encode the header as it appears on the wire.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        for (i, v) in self.0.iter().enumerate() {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    /// Decode a header from its wire form.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> FrameHeader {
        let mut vals = [0i64; 4];
        for (i, v) in vals.iter_mut().enumerate() {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
            *v = i64::from_le_bytes(b);
        }
        FrameHeader(vals)
    }
}

/// A frame as it travels through the in-memory transport: the body is kept
/// serialized so both transports share the same decode path.
#[derive(Debug)]
struct LocalFrame {
    header: FrameHeader,
    body: Vec<u8>,
}

/// The channel is gone: the peer hung up, the process is shutting down, or
/// the underlying socket failed. Not recoverable on this channel.
#[derive(Debug, thiserror::Error)]
#[error("channel disconnected: {0}")]
pub struct RecvError(pub String);

/// The body of a frame could not be deserialized. The stream has already been
/// resynchronized to the next boundary; the frame header is still valid.
#[derive(Debug, thiserror::Error)]
#[error("malformed message body: {0}")]
pub struct BodyError(pub String);

enum SenderInner {
    Local(Sender<LocalFrame>),
    Remote(BufWriter<TcpStream>),
}

/// The sending half of a framed channel.
///
/// Sends take `&mut self`: callers that share a sender across threads wrap it
/// in a mutex, which also lets them write several frames back to back and
/// flush them as one unit.
pub struct FrameSender<T> {
    inner: SenderInner,
    _msg: PhantomData<fn(&T)>,
}

impl<T> FrameSender<T>
where
    T: Serialize,
{
    /// Serialize a message and write it as a frame, returning the frame size
    /// in bytes. The frame is buffered; call [`flush`](FrameSender::flush) to
    /// push it out.
    pub fn send(&mut self, header: FrameHeader, msg: &T) -> Result<usize, Error> {
        let body = bincode::serialize(msg).context("Failed to serialize message body")?;
        self.send_raw(header, &body)
    }

    /// Write a frame with an already-serialized (or deliberately malformed)
    /// body, returning the frame size in bytes.
    pub fn send_raw(&mut self, header: FrameHeader, body: &[u8]) -> Result<usize, Error> {
        let frame_len = HEADER_LEN + body.len() + MSG_BOUNDARY.len();
        match &mut self.inner {
            SenderInner::Local(sender) => sender
                .send(LocalFrame {
                    header,
                    body: body.to_vec(),
                })
                .map_err(|_| Error::from(RecvError("peer receiver dropped".into())))?,
            SenderInner::Remote(writer) => {
                writer
                    .write_all(&header.to_bytes())
                    .context("Failed to write frame header")?;
                writer.write_all(body).context("Failed to write frame body")?;
                writer
                    .write_all(&MSG_BOUNDARY)
                    .context("Failed to write frame boundary")?;
            }
        }
        Ok(frame_len)
    }

    /// Flush buffered frames to the peer. A no-op on the local transport.
    pub fn flush(&mut self) -> Result<(), Error> {
        match &mut self.inner {
            SenderInner::Local(_) => Ok(()),
            SenderInner::Remote(writer) => writer.flush().context("Failed to flush the stream"),
        }
    }

    /// Shut down the underlying transport, waking up a peer blocked on
    /// `recv`. Dropping the sender has the same effect on the local
    /// transport.
    pub fn shutdown(&mut self) {
        if let SenderInner::Remote(writer) = &mut self.inner {
            let _ = writer.get_ref().shutdown(Shutdown::Both);
        }
    }
}

enum ReceiverInner {
    Local(Receiver<LocalFrame>),
    Remote(BufReader<TcpStream>),
}

/// The receiving half of a framed channel.
pub struct FrameReceiver<T> {
    inner: ReceiverInner,
    _msg: PhantomData<fn() -> T>,
}

impl<T> FrameReceiver<T>
where
    T: DeserializeOwned,
{
    /// Receive the next frame.
    ///
    /// The outer error means the channel is dead. The inner result reports a
    /// body that failed to deserialize: the stream has been resynchronized
    /// past the frame boundary and the header is still usable, typically to
    /// report the failure back to the sender.
    #[allow(clippy::type_complexity)]
    pub fn recv(&mut self) -> Result<(FrameHeader, Result<T, BodyError>), RecvError> {
        match &mut self.inner {
            ReceiverInner::Local(receiver) => {
                let frame = receiver
                    .recv()
                    .map_err(|_| RecvError("peer sender dropped".into()))?;
                let body = bincode::deserialize(&frame.body)
                    .map_err(|e| BodyError(e.to_string()));
                Ok((frame.header, body))
            }
            ReceiverInner::Remote(reader) => {
                let mut hdr = [0u8; HEADER_LEN];
                reader
                    .read_exact(&mut hdr)
                    .map_err(|e| RecvError(e.to_string()))?;
                let header = FrameHeader::from_bytes(&hdr);
                match bincode::deserialize_from::<_, T>(&mut *reader) {
                    Ok(msg) => {
                        let mut boundary = [0u8; MSG_BOUNDARY.len()];
                        reader
                            .read_exact(&mut boundary)
                            .map_err(|e| RecvError(e.to_string()))?;
                        if boundary == MSG_BOUNDARY {
                            Ok((header, Ok(msg)))
                        } else {
                            // The body decoded but did not end where the
                            // frame does: the stream content is not
                            // trustworthy, drop the message.
                            scan_to_boundary(reader, &boundary)?;
                            Ok((header, Err(BodyError("missing frame boundary".into()))))
                        }
                    }
                    Err(e) => {
                        scan_to_boundary(reader, &[])?;
                        Ok((header, Err(BodyError(e.to_string()))))
                    }
                }
            }
        }
    }
}

/// Consume bytes until a full `MSG_BOUNDARY` has been read. `consumed` holds
/// bytes already pulled off the stream that must be rescanned first.
fn scan_to_boundary(reader: &mut impl Read, consumed: &[u8]) -> Result<(), RecvError> {
    let mut matched = 0usize;
    let mut advance = |b: u8| -> bool {
        if b == MSG_BOUNDARY[matched] {
            matched += 1;
        } else {
            // The first boundary byte appears nowhere else in the sequence,
            // so a failed match can only restart at offset 0 or 1.
            matched = usize::from(b == MSG_BOUNDARY[0]);
        }
        matched == MSG_BOUNDARY.len()
    };
    for &b in consumed {
        if advance(b) {
            return Ok(());
        }
    }
    let mut byte = [0u8; 1];
    loop {
        reader
            .read_exact(&mut byte)
            .map_err(|e| RecvError(e.to_string()))?;
        if advance(byte[0]) {
            return Ok(());
        }
    }
}

/// Make a new in-memory framed channel.
pub fn new_local_channel<T>() -> (FrameSender<T>, FrameReceiver<T>) {
    let (tx, rx) = unbounded();
    (
        FrameSender {
            inner: SenderInner::Local(tx),
            _msg: PhantomData,
        },
        FrameReceiver {
            inner: ReceiverInner::Local(rx),
            _msg: PhantomData,
        },
    )
}

/// Pad a string into a fixed-width field of the connection preamble.
fn pad_field<const N: usize>(value: &str) -> [u8; N] {
    let mut buf = [b' '; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

/// Listener for framed connections on a TCP socket.
///
/// `S` and `R` are the types of message sent and received respectively. Every
/// accepted connection must present the expected cookie and version in its
/// preamble; connections that do not are dropped with a warning and the
/// iterator moves on to the next one.
pub struct ChannelServer<S, R> {
    listener: TcpListener,
    cookie: String,
    _sender: PhantomData<fn(&S)>,
    _receiver: PhantomData<fn() -> R>,
}

impl<S, R> ChannelServer<S, R> {
    /// Bind a socket and create a new `ChannelServer`.
    pub fn bind<A: ToSocketAddrs>(addr: A, cookie: &str) -> Result<ChannelServer<S, R>, Error> {
        Ok(ChannelServer {
            listener: TcpListener::bind(addr).context("Failed to bind listener")?,
            cookie: cookie.into(),
            _sender: PhantomData,
            _receiver: PhantomData,
        })
    }

    /// The address this server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Read and validate the preamble of an incoming connection.
    fn check_preamble(&self, stream: &mut TcpStream) -> Result<(), Error> {
        let mut cookie = [0u8; COOKIE_LEN];
        stream
            .read_exact(&mut cookie)
            .context("Connection closed during preamble")?;
        if cookie != pad_field::<COOKIE_LEN>(&self.cookie) {
            bail!("Invalid cookie");
        }
        let mut version = [0u8; VERSION_LEN];
        stream
            .read_exact(&mut version)
            .context("Connection closed during preamble")?;
        if version != pad_field::<VERSION_LEN>(VERSION) {
            bail!(
                "Version mismatch: peer sent {:?}, expected {:?}",
                String::from_utf8_lossy(&version),
                VERSION
            );
        }
        Ok(())
    }
}

impl<S, R> Iterator for ChannelServer<S, R> {
    type Item = (FrameSender<S>, FrameReceiver<R>, SocketAddr);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next = self
                .listener
                .incoming()
                .next()
                .expect("TcpListener::incoming returned None");
            if let Ok(mut stream) = next {
                let peer_addr = match stream.peer_addr() {
                    Ok(addr) => addr,
                    Err(_) => continue,
                };
                if let Err(e) = self.check_preamble(&mut stream) {
                    warn!("Rejecting connection from {}: {:?}", peer_addr, e);
                    continue;
                }
                let stream2 = stream.try_clone().expect("Failed to clone the stream");
                return Some((
                    FrameSender {
                        inner: SenderInner::Remote(BufWriter::new(stream)),
                        _msg: PhantomData,
                    },
                    FrameReceiver {
                        inner: ReceiverInner::Remote(BufReader::new(stream2)),
                        _msg: PhantomData,
                    },
                    peer_addr,
                ));
            }
        }
    }
}

/// Connect to a remote [`ChannelServer`], sending the preamble.
pub fn connect_channel<A: ToSocketAddrs, S, R>(
    addr: A,
    cookie: &str,
) -> Result<(FrameSender<S>, FrameReceiver<R>), Error> {
    let mut stream = TcpStream::connect(addr).context("Failed to connect")?;
    stream
        .write_all(&pad_field::<COOKIE_LEN>(cookie))
        .context("Failed to send cookie")?;
    stream
        .write_all(&pad_field::<VERSION_LEN>(VERSION))
        .context("Failed to send version")?;
    let stream2 = stream.try_clone().context("Failed to clone the stream")?;
    Ok((
        FrameSender {
            inner: SenderInner::Remote(BufWriter::new(stream)),
            _msg: PhantomData,
        },
        FrameReceiver {
            inner: ReceiverInner::Remote(BufReader::new(stream2)),
            _msg: PhantomData,
        },
    ))
}

#[cfg(test)]
mod tests {
    extern crate pretty_assertions;

    use std::thread;

    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Thing {
        x: u32,
        y: String,
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader([1, -42, i64::MAX, 0]);
        assert_eq!(FrameHeader::from_bytes(&header.to_bytes()), header);
    }

    #[test]
    fn test_local_channel() {
        let (mut tx, mut rx) = new_local_channel();
        tx.send(
            FrameHeader([1, 2, 0, 0]),
            &Thing {
                x: 42,
                y: "foobar".into(),
            },
        )
        .unwrap();
        let (header, body) = rx.recv().unwrap();
        assert_eq!(header, FrameHeader([1, 2, 0, 0]));
        assert_eq!(
            body.unwrap(),
            Thing {
                x: 42,
                y: "foobar".into()
            }
        );
    }

    #[test]
    fn test_local_channel_bad_body() {
        let (mut tx, mut rx) = new_local_channel::<Thing>();
        tx.send_raw(FrameHeader([3, 4, 0, 0]), &[0xff; 3]).unwrap();
        let (header, body) = rx.recv().unwrap();
        assert_eq!(header, FrameHeader([3, 4, 0, 0]));
        assert!(body.is_err());
    }

    #[test]
    fn test_remote_channels() {
        let mut server = ChannelServer::bind(("127.0.0.1", 0), "sesame").unwrap();
        let addr = server.local_addr().unwrap();
        let client_thread = thread::spawn(move || {
            let (mut sender, mut receiver) = connect_channel(addr, "sesame").unwrap();
            sender
                .send(FrameHeader([1, 1, 0, 0]), &vec![1, 2, 3, 4])
                .unwrap();
            sender.flush().unwrap();
            let (_, data) = receiver.recv().unwrap();
            let data: Vec<i32> = data.unwrap();
            assert_eq!(data, vec![5, 6, 7, 8]);
        });

        let (mut sender, mut receiver, _addr) = server.next().unwrap();
        let (header, data) = receiver.recv().unwrap();
        assert_eq!(header, FrameHeader([1, 1, 0, 0]));
        let data: Vec<i32> = data.unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
        sender
            .send(FrameHeader::default(), &vec![5, 6, 7, 8])
            .unwrap();
        sender.flush().unwrap();

        client_thread.join().unwrap();
    }

    /// A tagged body type: the variant index bounds-checks, so a malformed
    /// body fails to decode inside the frame instead of running past it.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum TestMsg {
        Ping(u8),
        Data(Vec<u8>),
    }

    #[test]
    fn test_remote_resync_after_bad_body() {
        let mut server = ChannelServer::bind(("127.0.0.1", 0), "sesame").unwrap();
        let addr = server.local_addr().unwrap();
        let client_thread = thread::spawn(move || {
            let (mut sender, _receiver) =
                connect_channel::<_, TestMsg, ()>(addr, "sesame").unwrap();
            // an impossible variant index: decoding fails within the body
            sender
                .send_raw(FrameHeader([9, 9, 0, 0]), &[0xff, 0xee, 0xdd, 0xcc])
                .unwrap();
            sender
                .send(FrameHeader([1, 2, 3, 4]), &TestMsg::Data(vec![7, 8]))
                .unwrap();
            sender.flush().unwrap();
        });

        let (_sender, mut receiver, _addr) = server.next().unwrap();
        let receiver: &mut FrameReceiver<TestMsg> = &mut receiver;
        let (header, body) = receiver.recv().unwrap();
        assert_eq!(header, FrameHeader([9, 9, 0, 0]));
        assert!(body.is_err());
        // the stream recovered: the next frame decodes normally
        let (header, body) = receiver.recv().unwrap();
        assert_eq!(header, FrameHeader([1, 2, 3, 4]));
        assert_eq!(body.unwrap(), TestMsg::Data(vec![7, 8]));

        client_thread.join().unwrap();
    }

    #[test]
    fn test_wrong_cookie_rejected() {
        let mut server = ChannelServer::<(), Thing>::bind(("127.0.0.1", 0), "sesame").unwrap();
        let addr = server.local_addr().unwrap();
        let client_thread = thread::spawn(move || {
            let (mut sender, mut receiver) =
                connect_channel::<_, Thing, ()>(addr, "wrong").unwrap();
            let _ = sender.send(
                FrameHeader::default(),
                &Thing {
                    x: 1,
                    y: "nope".into(),
                },
            );
            let _ = sender.flush();
            // the server drops us without answering
            assert!(receiver.recv().is_err());
            // a well-behaved client can still get through
            let (mut sender, _) = connect_channel::<_, Thing, ()>(addr, "sesame").unwrap();
            sender
                .send(
                    FrameHeader::default(),
                    &Thing {
                        x: 2,
                        y: "yes".into(),
                    },
                )
                .unwrap();
            sender.flush().unwrap();
        });

        let (_sender, mut receiver, _addr) = server.next().unwrap();
        let (_, body) = receiver.recv().unwrap();
        assert_eq!(body.unwrap().y, "yes");

        client_thread.join().unwrap();
    }
}
