//! Per-channel Unix domain socket endpoints
//!
//! Listener channels own a socket at `<base-dir>/<index>`; a live inbound
//! connection is what "locally enabled" means for them, and its closure
//! re-arms the listener. The USB channel is the one client-style endpoint:
//! the daemon connects outward to `<base-dir>/usb` when it observes the
//! peer's enabled bit turn on.
//!
//! Socket failures are local by design: they close one channel and never
//! touch the transaction loop.

use crate::error::{DaemonError, Result};

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use spibridge_icd::MAX_PAYLOAD;

enum Endpoint {
    /// Accepts one inbound connection at a time.
    Listener(UnixListener),
    /// Connects outward when the peer enables the channel.
    Client(PathBuf),
}

/// Socket endpoint plus cycle book-keeping for one channel.
pub(crate) struct ChannelPort {
    endpoint: Endpoint,
    conn: Option<UnixStream>,
    /// Bytes drained from the socket, waiting to cross the bridge.
    pub out_buf: [u8; MAX_PAYLOAD],
    /// Length of `out_buf`, 0 when nothing is pending.
    pub out_len: u8,
    /// Bytes received from the peer in the data phase.
    pub in_buf: [u8; MAX_PAYLOAD],
    /// POLLOUT observed and not yet consumed by a write.
    pub writable: bool,
    /// Poll the connection for readability. Dropped while a drained buffer
    /// waits to be sent, which is the bridge's inbound flow control.
    pub want_read: bool,
    /// Poll the connection for writability.
    pub want_pollout: bool,
}

impl ChannelPort {
    fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            conn: None,
            out_buf: [0; MAX_PAYLOAD],
            out_len: 0,
            in_buf: [0; MAX_PAYLOAD],
            writable: false,
            want_read: false,
            want_pollout: false,
        }
    }

    /// Bind a listener endpoint, unlinking any stale socket file first.
    pub fn listener(path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|e| DaemonError::Socket {
            path: path.to_owned(),
            source: e,
        })?;
        log::debug!("channel: listening on {}", path.display());
        Ok(Self::with_endpoint(Endpoint::Listener(listener)))
    }

    /// A client endpoint; no I/O happens until [`connect`](Self::connect).
    pub fn client(path: PathBuf) -> Self {
        Self::with_endpoint(Endpoint::Client(path))
    }

    /// Whether a connection is live, which is the channel's local enabled
    /// state.
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn conn(&self) -> Option<&UnixStream> {
        self.conn.as_ref()
    }

    /// The listener to poll for inbound connections, when accepting.
    pub fn acceptor(&self) -> Option<&UnixListener> {
        if self.conn.is_some() {
            return None;
        }
        match &self.endpoint {
            Endpoint::Listener(l) => Some(l),
            Endpoint::Client(_) => None,
        }
    }

    fn arm(&mut self, conn: UnixStream) {
        self.conn = Some(conn);
        self.writable = false;
        self.want_read = true;
        self.want_pollout = true;
    }

    /// Take the pending inbound connection off the listener.
    pub fn accept(&mut self) -> io::Result<()> {
        let Endpoint::Listener(listener) = &self.endpoint else {
            return Ok(());
        };
        let (conn, _) = listener.accept()?;
        self.arm(conn);
        Ok(())
    }

    /// Connect the client endpoint outward.
    pub fn connect(&mut self) -> io::Result<()> {
        let Endpoint::Client(path) = &self.endpoint else {
            return Ok(());
        };
        let conn = UnixStream::connect(path)?;
        self.arm(conn);
        Ok(())
    }

    /// Drop the connection and reset all transient state. A listener
    /// endpoint goes back to accepting.
    pub fn close(&mut self) {
        self.conn = None;
        self.out_len = 0;
        self.writable = false;
        self.want_read = false;
        self.want_pollout = false;
    }

    /// Read one buffer's worth from the socket into `out_buf`. Returns the
    /// byte count; 0 means end of stream. Readability polling stops until
    /// the buffer has crossed the bridge.
    pub fn drain(&mut self) -> io::Result<usize> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };
        let n = conn.read(&mut self.out_buf)?;
        if n > 0 {
            self.out_len = n as u8;
            self.want_read = false;
        }
        Ok(n)
    }

    /// Split borrows for building the data-phase segments: the pending
    /// outgoing bytes and the receive buffer.
    pub fn bufs_mut(&mut self) -> (&[u8], &mut [u8; MAX_PAYLOAD]) {
        (&self.out_buf, &mut self.in_buf)
    }

    /// Write `len` bytes of `in_buf` out to the socket and re-arm the
    /// writability poll.
    pub fn send(&mut self, len: usize) -> io::Result<()> {
        self.writable = false;
        self.want_pollout = true;
        if let Some(conn) = self.conn.as_mut() {
            let written = conn.write(&self.in_buf[..len])?;
            if written < len {
                log::warn!("channel: short write ({} of {} bytes)", written, len);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spibridge-chan-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn listener_replaces_stale_socket_file() {
        let path = scratch_path("stale");
        // First bind leaves a socket file behind when dropped without
        // cleanup; a rebind must still succeed.
        let first = ChannelPort::listener(&path).unwrap();
        drop(first);
        assert!(path.exists());
        ChannelPort::listener(&path).unwrap();
    }

    #[test]
    fn accept_and_close_rearm_the_listener() {
        let path = scratch_path("accept");
        let mut port = ChannelPort::listener(&path).unwrap();
        assert!(port.acceptor().is_some());

        let client = UnixStream::connect(&path).unwrap();
        port.accept().unwrap();
        assert!(port.is_open());
        assert!(port.acceptor().is_none());
        assert!(port.want_read && port.want_pollout);

        drop(client);
        port.close();
        assert!(!port.is_open());
        assert!(port.acceptor().is_some());
        assert_eq!(port.out_len, 0);
    }

    #[test]
    fn drain_fills_out_buf_and_pauses_reading() {
        let path = scratch_path("drain");
        let mut port = ChannelPort::listener(&path).unwrap();
        let mut client = UnixStream::connect(&path).unwrap();
        port.accept().unwrap();

        client.write_all(b"payload").unwrap();
        let n = port.drain().unwrap();
        assert_eq!(n, 7);
        assert_eq!(port.out_len, 7);
        assert_eq!(&port.out_buf[..7], b"payload");
        assert!(!port.want_read);
    }
}
