use std::{
    io,
    net::SocketAddr,
    os::fd::RawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::{debug, error, warn};

use crate::{buffer::ElasticBuffer, event_loop::Attachment};

/// Hard cap on bytes queued for one connection's outbound side. Sends that
/// would overflow are rejected, not buffered.
pub const MAX_BUF_SIZE: usize = 4 * 1024 * 1024;

const READ_HINT_START: usize = 8 * 1024;
const READ_HINT_MAX: usize = 1024 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection callback hooks. All methods have defaults so a handler
/// implements only what it cares about; the read loop, write loop and
/// timeout scan invoke them from their owning threads.
pub trait SocketHandler: Send + Sync {
    /// Called with everything buffered so far; returns how many bytes were
    /// consumed. Must not call back into the socket's receive side.
    fn on_read(&self, sock: &Arc<Socket>, data: &[u8]) -> usize;

    /// Outbound buffer fully drained. Returning `false` forbids further
    /// sends and half-closes once nothing is left to flush.
    fn on_send(&self, _sock: &Arc<Socket>) -> bool {
        true
    }

    /// Fatal I/O error; the socket closes right after this returns.
    fn on_error(&self, _sock: &Arc<Socket>) {}

    /// Peer closed the connection (clean EOF).
    fn on_close(&self, _sock: &Arc<Socket>) {}

    /// Soft deadline elapsed. Return `false` to drop the timeout instead of
    /// keeping it armed.
    fn on_timeout(&self, _sock: &Arc<Socket>) -> bool {
        false
    }
}

struct RecvState {
    inbuf: ElasticBuffer,
    /// Per-socket read size hint; doubles whenever a single read fills it.
    hint: usize,
}

struct SendState {
    /// Drained to the wire by the write loop only.
    outbuf: ElasticBuffer,
    /// Appended by any thread; merged into `outbuf` on the write loop.
    pending: Vec<u8>,
    /// Our write side is still healthy (no shutdown yet).
    writeable: bool,
    /// The application still permits appends.
    allow_more_send: bool,
}

struct TimeoutState {
    deadline: Instant,
    renew: Duration,
    enabled: bool,
}

/// A shared, non-blocking TCP connection.
///
/// The accept loop, the event loops and the forwarding workers may all hold
/// an `Arc` to the same socket. Inbound bytes are drained edge-triggered
/// into `inbuf` until `WouldBlock`; outbound bytes go through a pending
/// buffer that the write loop merges and drains the same way. `close` is
/// idempotent and parks the descriptor on `/dev/null` so a stale handle can
/// never read another connection's bytes; the descriptor itself is released
/// when the last `Arc` drops.
pub struct Socket {
    id: u64,
    fd: AtomicI32,
    closed: AtomicBool,
    last_err: AtomicI32,
    /// Deduplicates write-interest requests posted to the write loop.
    write_interest: AtomicBool,
    /// Set by successful reads/writes, consumed by the timeout scan.
    renew_pending: AtomicBool,
    peer: Mutex<Option<SocketAddr>>,
    handler: Mutex<Option<Arc<dyn SocketHandler>>>,
    recv: Mutex<RecvState>,
    send: Mutex<SendState>,
    timeout: Mutex<TimeoutState>,
    attachment: Mutex<Option<Attachment>>,
}

impl Socket {
    fn with_fd(fd: RawFd, peer: Option<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            fd: AtomicI32::new(fd),
            closed: AtomicBool::new(false),
            last_err: AtomicI32::new(0),
            write_interest: AtomicBool::new(false),
            renew_pending: AtomicBool::new(false),
            peer: Mutex::new(peer),
            handler: Mutex::new(None),
            recv: Mutex::new(RecvState {
                inbuf: ElasticBuffer::new(),
                hint: READ_HINT_START,
            }),
            send: Mutex::new(SendState {
                outbuf: ElasticBuffer::new(),
                pending: Vec::new(),
                writeable: true,
                allow_more_send: true,
            }),
            timeout: Mutex::new(TimeoutState {
                deadline: Instant::now(),
                renew: Duration::ZERO,
                enabled: false,
            }),
            attachment: Mutex::new(None),
        })
    }

    /// Wraps a descriptor handed over by an accept loop.
    pub fn from_accepted(fd: RawFd, peer: SocketAddr) -> io::Result<Arc<Self>> {
        let sock = Self::with_fd(fd, Some(peer));
        sock.set_non_block()?;
        sock.set_close_on_exec()?;
        Ok(sock)
    }

    /// Non-blocking connect with a bounded wait: issues the connect, waits
    /// for write-readiness up to `timeout`, then checks `SO_ERROR`.
    /// IPv4 only, like the rest of the wire plane.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Arc<Self>> {
        let SocketAddr::V4(v4) = addr else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "ipv4 addresses only"));
        };

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Self::with_fd(fd, Some(addr));
        sock.set_close_on_exec()?;
        sock.set_non_block()?;

        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = v4.port().to_be();
        sa.sin_addr = libc::in_addr { s_addr: u32::from(*v4.ip()).to_be() };

        let rc = unsafe {
            libc::connect(
                fd,
                std::ptr::from_ref(&sa).cast::<libc::sockaddr>(),
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                sock.record_err(&err);
                sock.close();
                return Err(err);
            }
            Self::await_writable(fd, timeout).inspect_err(|e| {
                sock.record_err(e);
                sock.close();
            })?;
            let so_err = socket_error(fd);
            if so_err != 0 {
                let err = io::Error::from_raw_os_error(so_err);
                sock.record_err(&err);
                sock.close();
                return Err(err);
            }
        }
        debug!(id = sock.id, %addr, "sock: connected");
        Ok(sock)
    }

    fn await_writable(fd: RawFd, timeout: Duration) -> io::Result<()> {
        let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let rc = unsafe { libc::poll(&mut pfd, 1, left.as_millis() as libc::c_int) };
            match rc {
                0 => return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                1 => return Ok(()),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Errno of the most recent failure; `0` after an overflow rejection.
    pub fn last_err(&self) -> i32 {
        self.last_err.load(Ordering::Relaxed)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap()
    }

    pub fn set_handler(&self, handler: Arc<dyn SocketHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn SocketHandler>> {
        self.handler.lock().unwrap().clone()
    }

    pub fn set_non_block(&self) -> io::Result<()> {
        let fd = self.live_fd().ok_or(io::ErrorKind::NotConnected)?;
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(self.record_os_err());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(self.record_os_err());
        }
        Ok(())
    }

    pub fn set_close_on_exec(&self) -> io::Result<()> {
        let fd = self.live_fd().ok_or(io::ErrorKind::NotConnected)?;
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(self.record_os_err());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            return Err(self.record_os_err());
        }
        Ok(())
    }

    /// Arms (or with `None` disarms) the idle deadline. Renewal afterwards
    /// is lazy: reads and writes set a flag that the scan consumes.
    pub fn set_timeout(&self, after: Option<Duration>) {
        let mut to = self.timeout.lock().unwrap();
        match after {
            None => to.enabled = false,
            Some(d) => {
                if d < Duration::from_secs(1) {
                    debug!(id = self.id, ?d, "sock: sub-second timeout, consider a timer");
                }
                to.renew = d;
                to.deadline = Instant::now() + d;
                to.enabled = true;
            }
        }
    }

    /// Queues bytes for the write loop. Returns `false` without queueing
    /// anything when the socket is closed/half-closed (`EPIPE` recorded) or
    /// the outbound cap would be exceeded (errno `0` recorded).
    pub fn send_data(self: &Arc<Self>, data: &[u8]) -> bool {
        if data.is_empty() {
            error!(id = self.id, "sock: refusing empty send");
            return false;
        }
        {
            let mut send = self.send.lock().unwrap();
            if self.is_closed() || !send.writeable || !send.allow_more_send {
                self.last_err.store(libc::EPIPE, Ordering::Relaxed);
                return false;
            }
            let queued = send.pending.len() + send.outbuf.len();
            if queued + data.len() > MAX_BUF_SIZE {
                self.last_err.store(0, Ordering::Relaxed);
                warn!(id = self.id, queued, "sock: send buffer overflow, slow down");
                return false;
            }
            send.pending.extend_from_slice(data);
        }
        if !self.write_interest.swap(true, Ordering::AcqRel) {
            if let Some(att) = self.attachment_clone() {
                att.arm_write(self);
            }
        }
        true
    }

    /// Forbids further appends; half-closes now if nothing is left to
    /// flush, otherwise after the drain.
    pub fn disallow_send(self: &Arc<Self>) {
        let mut send = self.send.lock().unwrap();
        send.allow_more_send = false;
        if send.outbuf.is_empty() && send.pending.is_empty() {
            drop(send);
            self.shutdown_write();
        }
    }

    /// Half-closes the write side, discarding anything still queued.
    pub fn shutdown_write(&self) {
        let mut send = self.send.lock().unwrap();
        send.writeable = false;
        if !send.outbuf.is_empty() || !send.pending.is_empty() {
            warn!(id = self.id, "sock: write side shut down with unsent bytes");
        }
        send.outbuf.clear();
        send.pending.clear();
        if let Some(fd) = self.live_fd() {
            unsafe { libc::shutdown(fd, libc::SHUT_WR) };
        }
    }

    /// Idempotent teardown. The descriptor is atomically replaced by
    /// `/dev/null` (closing the socket) rather than freed, so a concurrent
    /// `socket()` elsewhere can never be handed this number while references
    /// remain; the parked descriptor is released by the last drop.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut send = self.send.lock().unwrap();
            if !send.outbuf.is_empty() || !send.pending.is_empty() {
                warn!(id = self.id, "sock: closing with unsent bytes");
            }
            send.outbuf.clear();
            send.pending.clear();
            send.writeable = false;
            send.allow_more_send = false;
        }
        // The read loop may be closing from inside on_read with the receive
        // lock held; the buffer dies with the socket either way.
        if let Ok(mut recv) = self.recv.try_lock() {
            recv.inbuf.clear();
        }
        self.timeout.lock().unwrap().enabled = false;
        *self.peer.lock().unwrap() = None;

        let fd = self.fd.load(Ordering::Acquire);
        if fd >= 0 {
            unsafe {
                let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
                if devnull >= 0 {
                    libc::dup2(devnull, fd);
                    libc::close(devnull);
                } else {
                    libc::close(fd);
                    self.fd.store(-1, Ordering::Release);
                }
            }
        }

        if let Some(att) = self.attachment.lock().unwrap().take() {
            att.notify_closed();
        }
        debug!(id = self.id, "sock: closed");
    }

    pub(crate) fn bind_loop(&self, att: Attachment) {
        *self.attachment.lock().unwrap() = Some(att);
    }

    pub(crate) fn attachment_clone(&self) -> Option<Attachment> {
        self.attachment.lock().unwrap().clone()
    }

    /// `Some(fd)` while the live phase lasts; `None` once closing.
    pub(crate) fn live_fd(&self) -> Option<RawFd> {
        if self.is_closed() {
            return None;
        }
        let fd = self.fd.load(Ordering::Acquire);
        (fd >= 0).then_some(fd)
    }

    pub(crate) fn wants_write(&self) -> bool {
        let send = self.send.lock().unwrap();
        !send.outbuf.is_empty() || !send.pending.is_empty()
    }

    /// Clears the queued write-interest marker; returns whether data is
    /// still pending (caller then re-arms instead of disarming).
    pub(crate) fn release_write_interest(&self) -> bool {
        self.write_interest.store(false, Ordering::Release);
        if self.wants_write() && !self.is_closed() {
            !self.write_interest.swap(true, Ordering::AcqRel)
        } else {
            false
        }
    }

    /// Edge-triggered read drain: keeps reading into the buffer tail until
    /// `WouldBlock`, handing the accumulated bytes to `on_read` after every
    /// successful chunk. A zero-length read is a clean peer close.
    pub(crate) fn handle_read_event(self: &Arc<Self>) {
        loop {
            let Some(fd) = self.live_fd() else { return };
            let mut recv = self.recv.lock().unwrap();
            let hint = recv.hint;
            recv.inbuf.ensure_writable(hint);
            let tail = recv.inbuf.writable_begin();
            let n = unsafe { libc::read(fd, tail.as_mut_ptr().cast(), hint) };
            match n {
                0 => {
                    drop(recv);
                    if let Some(h) = self.handler() {
                        h.on_close(self);
                    }
                    self.close();
                    return;
                }
                n if n > 0 => {
                    let n = n as usize;
                    recv.inbuf.commit(n);
                    if n == hint {
                        recv.hint = (hint * 2).min(READ_HINT_MAX);
                    }
                    self.renew_pending.store(true, Ordering::Relaxed);
                    if let Some(h) = self.handler() {
                        let consumed = h.on_read(self, recv.inbuf.data());
                        if consumed > recv.inbuf.len() {
                            debug!(id = self.id, "sock: on_read consumed more than buffered");
                        }
                        let consumed = consumed.min(recv.inbuf.len());
                        recv.inbuf.pop_front(consumed);
                    } else {
                        let len = recv.inbuf.len();
                        recv.inbuf.pop_front(len);
                    }
                    if self.is_closed() {
                        return;
                    }
                }
                _ => {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        io::ErrorKind::WouldBlock => return,
                        io::ErrorKind::Interrupted => {}
                        _ => {
                            drop(recv);
                            self.record_err(&err);
                            if let Some(h) = self.handler() {
                                h.on_error(self);
                            }
                            error!(id = self.id, ?err, "sock: read failed");
                            self.close();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Write drain: merges cross-thread pending bytes, then writes until
    /// `WouldBlock` or empty. On a full drain fires `on_send` and performs
    /// the deferred half-close if sends were disallowed meanwhile.
    pub(crate) fn handle_write_event(self: &Arc<Self>) {
        let Some(fd) = self.live_fd() else { return };
        let mut send = self.send.lock().unwrap();
        if !send.pending.is_empty() {
            let pending = std::mem::take(&mut send.pending);
            send.outbuf.push_back(&pending);
        }
        if !send.writeable {
            return;
        }
        while !send.outbuf.is_empty() {
            let data = send.outbuf.data();
            let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
            if n > 0 {
                send.outbuf.pop_front(n as usize);
                self.renew_pending.store(true, Ordering::Relaxed);
            } else if n == 0 {
                break;
            } else {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return,
                    io::ErrorKind::Interrupted => {}
                    _ => {
                        drop(send);
                        self.record_err(&err);
                        if let Some(h) = self.handler() {
                            h.on_error(self);
                        }
                        error!(id = self.id, ?err, "sock: write failed");
                        self.close();
                        return;
                    }
                }
            }
        }
        drop(send);

        let keep_sending = self.handler().is_none_or(|h| h.on_send(self));
        if !keep_sending {
            self.disallow_send();
            return;
        }
        let send = self.send.lock().unwrap();
        if !send.allow_more_send && send.outbuf.is_empty() && send.pending.is_empty() {
            drop(send);
            self.shutdown_write();
        }
    }

    /// Exceptional readiness (`HUP`/error): surface `SO_ERROR`, notify, close.
    pub(crate) fn handle_error_event(self: &Arc<Self>) {
        if let Some(fd) = self.live_fd() {
            let so_err = socket_error(fd);
            if so_err != 0 {
                self.last_err.store(so_err, Ordering::Relaxed);
            }
        }
        if let Some(h) = self.handler() {
            h.on_error(self);
        }
        error!(id = self.id, errno = self.last_err(), "sock: exceptional condition");
        self.close();
    }

    /// Called from the owning loop's periodic scan. Consumes the renew flag
    /// set by the hot paths so deadline extension never races the scan.
    pub(crate) fn update_timeout(self: &Arc<Self>) {
        let fire = {
            let mut to = self.timeout.lock().unwrap();
            if !to.enabled {
                return;
            }
            if self.renew_pending.swap(false, Ordering::Relaxed) {
                to.deadline = Instant::now() + to.renew;
                return;
            }
            if Instant::now() <= to.deadline {
                return;
            }
            to.deadline = Instant::now() + to.renew;
            true
        };
        if fire {
            let handled = self.handler().is_some_and(|h| h.on_timeout(self));
            if !handled {
                self.timeout.lock().unwrap().enabled = false;
            }
        }
    }

    fn record_err(&self, err: &io::Error) {
        self.last_err.store(err.raw_os_error().unwrap_or(0), Ordering::Relaxed);
    }

    fn record_os_err(&self) -> io::Error {
        let err = io::Error::last_os_error();
        self.record_err(&err);
        err
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let fd = *self.fd.get_mut();
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

fn socket_error(fd: RawFd) -> i32 {
    let mut so_err: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::from_mut(&mut so_err).cast(),
            &mut len,
        )
    };
    if rc == 0 { so_err } else { 0 }
}
