//! Virtual interface contract and implementations.
//!
//! The platform integration establishes the per-process virtual interface
//! (address `10.0.0.2/24`, default route, app filter) and hands over a
//! file descriptor. The tunnel core only needs two operations on it:
//! read one complete IPv4 datagram, write one complete IPv4 datagram.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A packet-level interface delivering IP datagrams produced by the
/// captured client application, and accepting IP datagrams to deliver
/// back to it.
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Reads one complete IPv4 datagram into `buf`, returning its length.
    ///
    /// Returns `Ok(0)` on end-of-stream and an error once [`close`] has
    /// been called, which is how a blocked reader gets unstuck during
    /// shutdown.
    ///
    /// [`close`]: VirtualInterface::close
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one complete IPv4 datagram.
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Unblocks any pending [`recv`] and makes subsequent calls fail.
    ///
    /// [`recv`]: VirtualInterface::recv
    fn close(&self);
}

/// Exempts a socket from the tunnel's own routing so the relay channel
/// itself is not captured.
pub trait SocketProtector: Send + Sync {
    /// Marks the socket behind `fd` as non-tunneled. Called after the
    /// socket is created and before it connects.
    fn protect(&self, fd: std::os::fd::RawFd) -> io::Result<()>;
}

/// Protector for hosts where the tunnel routing is not active (tests,
/// development relays).
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: std::os::fd::RawFd) -> io::Result<()> {
        Ok(())
    }
}

/// Serializes outbound datagram writes to a shared interface.
///
/// SYN-ACKs and ACKs are written from the interface reader task while
/// PSH-ACK data segments are written from the relay response dispatcher;
/// a single lock keeps whole datagrams from interleaving.
pub struct PacketWriter {
    iface: Arc<dyn VirtualInterface>,
    lock: Mutex<()>,
}

impl PacketWriter {
    pub fn new(iface: Arc<dyn VirtualInterface>) -> Self {
        Self {
            iface,
            lock: Mutex::new(()),
        }
    }

    /// Writes one datagram, excluding all other writers for its duration.
    pub async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        self.iface.send(datagram).await
    }
}

#[cfg(unix)]
mod fd {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use async_trait::async_trait;
    use tokio::io::unix::AsyncFd;
    use tokio_util::sync::CancellationToken;

    use super::VirtualInterface;

    /// Production [`VirtualInterface`] over an externally established
    /// packet-interface file descriptor.
    pub struct FdInterface {
        fd: AsyncFd<OwnedFd>,
        closed: CancellationToken,
    }

    impl FdInterface {
        /// Wraps an owned descriptor, switching it to non-blocking mode.
        pub fn new(fd: OwnedFd) -> io::Result<Self> {
            set_nonblocking(fd.as_raw_fd())?;
            Ok(Self {
                fd: AsyncFd::new(fd)?,
                closed: CancellationToken::new(),
            })
        }

        /// Takes ownership of a raw descriptor handed over by the
        /// platform integration.
        ///
        /// # Safety
        ///
        /// `raw` must be a valid, open descriptor that nothing else will
        /// close.
        pub unsafe fn from_raw_fd(raw: RawFd) -> io::Result<Self> {
            // Safety: forwarded from the caller's contract.
            Self::new(unsafe { OwnedFd::from_raw_fd(raw) })
        }
    }

    #[async_trait]
    impl VirtualInterface for FdInterface {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                tokio::select! {
                    () = self.closed.cancelled() => {
                        return Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "virtual interface closed",
                        ));
                    }
                    guard = self.fd.readable() => {
                        let mut guard = guard?;
                        match guard.try_io(|inner| read_fd(inner.get_ref().as_raw_fd(), buf)) {
                            Ok(result) => return result,
                            Err(_would_block) => {}
                        }
                    }
                }
            }
        }

        async fn send(&self, datagram: &[u8]) -> io::Result<()> {
            loop {
                if self.closed.is_cancelled() {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "virtual interface closed",
                    ));
                }
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| write_fd(inner.get_ref().as_raw_fd(), datagram)) {
                    Ok(result) => return result.map(|_| ()),
                    Err(_would_block) => {}
                }
            }
        }

        fn close(&self) {
            self.closed.cancel();
        }
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        // Safety: plain fcntl on a descriptor we own.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        // Safety: buf is valid for buf.len() writable bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        // Safety: buf is valid for buf.len() readable bytes.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(unix)]
pub use fd::FdInterface;

/// In-memory [`VirtualInterface`] backed by channels.
///
/// Datagrams pushed into the inject sender come out of [`recv`]; every
/// [`send`] lands on the outbound receiver. Used by the test suites on
/// both sides of the synthesizer.
///
/// [`recv`]: VirtualInterface::recv
/// [`send`]: VirtualInterface::send
pub struct MemoryInterface {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

impl MemoryInterface {
    /// Creates an interface plus its two test-side endpoints: a sender
    /// for injecting inbound datagrams and a receiver collecting
    /// everything the tunnel writes out.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (inject_tx, inject_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let iface = Arc::new(Self {
            inbound: Mutex::new(inject_rx),
            outbound: out_tx,
            closed: CancellationToken::new(),
        });
        (iface, inject_tx, out_rx)
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "virtual interface closed",
            )),
            datagram = inbound.recv() => match datagram {
                Some(datagram) => {
                    let len = datagram.len().min(buf.len());
                    buf[..len].copy_from_slice(&datagram[..len]);
                    Ok(len)
                }
                None => Ok(0),
            },
        }
    }

    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "virtual interface closed",
            ));
        }
        self.outbound
            .send(datagram.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "outbound receiver dropped"))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
