//! Event loops driving the sockets. Each loop pins two threads: a read
//! thread (read/error readiness, socket registration, timeout scan) and a
//! write thread (write readiness, deferred drains). Cross-thread work
//! reaches a thread through its bounded task channel plus a `mio::Waker`.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc::{Receiver, SyncSender, TryRecvError, sync_channel},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use busbar_utils::Repeater;
use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::socket::Socket;

const WAKER: Token = Token(0);
const QUEUE_DEPTH: usize = 1024;
const POLL_TICK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum NetError {
    #[error("event loop stopped")]
    LoopStopped,
    #[error(transparent)]
    Io(#[from] io::Error),
}

type LoopFn = Box<dyn FnOnce() + Send + 'static>;

enum ReadTask {
    Attach(Arc<Socket>),
    Run(LoopFn),
    Stop,
}

enum WriteTask {
    Arm(Arc<Socket>),
    Run(LoopFn),
    Stop,
}

/// A socket's link back to its owning loop. Cloned freely; all clones talk
/// to the same two threads.
#[derive(Clone)]
pub(crate) struct Attachment {
    token: Token,
    read_tx: SyncSender<ReadTask>,
    read_waker: Arc<Waker>,
    write_tx: SyncSender<WriteTask>,
    write_waker: Arc<Waker>,
}

impl Attachment {
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    /// Asks the write thread to register write interest and drain.
    pub(crate) fn arm_write(&self, sock: &Arc<Socket>) {
        if self.write_tx.send(WriteTask::Arm(Arc::clone(sock))).is_ok() {
            let _ = self.write_waker.wake();
        }
    }

    /// Wakes both threads so they notice a closed socket and drop their
    /// references; actual cleanup stays serialized on the loop threads.
    pub(crate) fn notify_closed(&self) {
        let _ = self.read_waker.wake();
        let _ = self.write_waker.wake();
    }
}

/// One read thread plus one write thread around two `mio::Poll` instances.
pub struct EventLoop {
    read_tx: SyncSender<ReadTask>,
    read_waker: Arc<Waker>,
    write_tx: SyncSender<WriteTask>,
    write_waker: Arc<Waker>,
    next_token: AtomicUsize,
    read_thread: Option<JoinHandle<()>>,
    write_thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn named(name: &str) -> io::Result<Self> {
        let read_poll = Poll::new()?;
        let read_waker = Arc::new(Waker::new(read_poll.registry(), WAKER)?);
        let (read_tx, read_rx) = sync_channel(QUEUE_DEPTH);

        let write_poll = Poll::new()?;
        let write_waker = Arc::new(Waker::new(write_poll.registry(), WAKER)?);
        let (write_tx, write_rx) = sync_channel(QUEUE_DEPTH);

        let loop_name = name.to_string();
        let read_thread = thread::Builder::new()
            .name(format!("{name}-read"))
            .spawn(move || read_loop(read_poll, &read_rx, &loop_name))?;

        let loop_name = name.to_string();
        let write_thread = thread::Builder::new()
            .name(format!("{name}-write"))
            .spawn(move || write_loop(write_poll, &write_rx, &loop_name))?;

        Ok(Self {
            read_tx,
            read_waker,
            write_tx,
            write_waker,
            next_token: AtomicUsize::new(1),
            read_thread: Some(read_thread),
            write_thread: Some(write_thread),
        })
    }

    /// Binds the socket to this loop and registers it for read readiness.
    pub fn attach(&self, sock: &Arc<Socket>) -> Result<(), NetError> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        sock.bind_loop(Attachment {
            token,
            read_tx: self.read_tx.clone(),
            read_waker: Arc::clone(&self.read_waker),
            write_tx: self.write_tx.clone(),
            write_waker: Arc::clone(&self.write_waker),
        });
        self.read_tx
            .send(ReadTask::Attach(Arc::clone(sock)))
            .map_err(|_| NetError::LoopStopped)?;
        self.read_waker.wake()?;
        Ok(())
    }

    /// Runs `f` on the read thread, after any readiness currently being
    /// dispatched. Must not be called from the loop's own threads.
    pub fn post<F>(&self, f: F) -> Result<(), NetError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.read_tx.send(ReadTask::Run(Box::new(f))).map_err(|_| NetError::LoopStopped)?;
        self.read_waker.wake()?;
        Ok(())
    }

    /// Same as [`post`](Self::post) for the write thread.
    pub fn post_write<F>(&self, f: F) -> Result<(), NetError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.write_tx.send(WriteTask::Run(Box::new(f))).map_err(|_| NetError::LoopStopped)?;
        self.write_waker.wake()?;
        Ok(())
    }

    /// Stops both threads; the read thread closes every socket it still
    /// owns on the way out.
    pub fn shutdown(&mut self) {
        let _ = self.read_tx.send(ReadTask::Stop);
        let _ = self.read_waker.wake();
        let _ = self.write_tx.send(WriteTask::Stop);
        let _ = self.write_waker.wake();
        if let Some(handle) = self.read_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.write_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Round-robin set of event loops; sockets are bound to a loop at accept.
/// Shareable across threads (the accept loop attaches while the owner may
/// later shut down).
pub struct LoopPool {
    loops: Mutex<Vec<EventLoop>>,
    next: AtomicUsize,
}

impl LoopPool {
    pub fn new(count: usize) -> io::Result<Self> {
        let count = count.max(1);
        let mut loops = Vec::with_capacity(count);
        for i in 0..count {
            loops.push(EventLoop::named(&format!("busbar-ev{i}"))?);
        }
        Ok(Self { loops: Mutex::new(loops), next: AtomicUsize::new(0) })
    }

    pub fn attach(&self, sock: &Arc<Socket>) -> Result<(), NetError> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return Err(NetError::LoopStopped);
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[i].attach(sock)
    }

    /// Drains per-loop queues and closes owned sockets; idempotent.
    pub fn shutdown(&self) {
        let mut loops = self.loops.lock().unwrap();
        for l in loops.iter_mut() {
            l.shutdown();
        }
        loops.clear();
    }
}

fn read_loop(mut poll: Poll, rx: &Receiver<ReadTask>, name: &str) {
    let mut sockets: HashMap<Token, Arc<Socket>> = HashMap::new();
    let mut events = Events::with_capacity(256);
    let mut scan = Repeater::every(POLL_TICK);
    loop {
        if let Err(err) = poll.poll(&mut events, Some(POLL_TICK)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(name, ?err, "loop: read poll failed");
            return;
        }
        for ev in events.iter() {
            if ev.token() == WAKER {
                continue;
            }
            let Some(sock) = sockets.get(&ev.token()).cloned() else { continue };
            if ev.is_error() {
                sock.handle_error_event();
            } else if ev.is_readable() || ev.is_read_closed() {
                sock.handle_read_event();
            }
        }
        loop {
            match rx.try_recv() {
                Ok(ReadTask::Attach(sock)) => attach_read(&poll, &mut sockets, sock, name),
                Ok(ReadTask::Run(f)) => f(),
                Ok(ReadTask::Stop) | Err(TryRecvError::Disconnected) => {
                    for sock in sockets.values() {
                        sock.close();
                    }
                    sockets.clear();
                    debug!(name, "loop: read side stopped");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        // A closed socket's fd was parked on /dev/null, which also removed
        // the old registration; dropping the reference is all that is left.
        sockets.retain(|_, sock| !sock.is_closed());
        scan.maybe(|_| {
            for sock in sockets.values() {
                sock.update_timeout();
            }
        });
    }
}

fn attach_read(
    poll: &Poll,
    sockets: &mut HashMap<Token, Arc<Socket>>,
    sock: Arc<Socket>,
    name: &str,
) {
    let Some(att) = sock.attachment_clone() else { return };
    let Some(fd) = sock.live_fd() else { return };
    let token = att.token();
    match poll.registry().register(&mut SourceFd(&fd), token, Interest::READABLE) {
        Ok(()) => {
            // bytes queued before the attach still need a write-side kick
            if sock.wants_write() {
                att.arm_write(&sock);
            }
            sockets.insert(token, sock);
        }
        Err(err) => {
            warn!(name, ?err, "loop: socket register failed");
            sock.close();
        }
    }
}

fn write_loop(mut poll: Poll, rx: &Receiver<WriteTask>, name: &str) {
    let mut armed: HashMap<Token, Arc<Socket>> = HashMap::new();
    let mut events = Events::with_capacity(256);
    loop {
        if let Err(err) = poll.poll(&mut events, Some(POLL_TICK)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(name, ?err, "loop: write poll failed");
            return;
        }
        for ev in events.iter() {
            if ev.token() == WAKER {
                continue;
            }
            let Some(sock) = armed.get(&ev.token()).cloned() else { continue };
            if ev.is_writable() || ev.is_error() || ev.is_write_closed() {
                sock.handle_write_event();
            }
            maybe_disarm(&poll, &mut armed, ev.token(), &sock);
        }
        loop {
            match rx.try_recv() {
                Ok(WriteTask::Arm(sock)) => arm_write(&poll, &mut armed, &sock, name),
                Ok(WriteTask::Run(f)) => f(),
                Ok(WriteTask::Stop) | Err(TryRecvError::Disconnected) => {
                    debug!(name, "loop: write side stopped");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        armed.retain(|_, sock| !sock.is_closed());
    }
}

/// Registers write interest if absent, then drains immediately; epoll will
/// report the next writable edge for whatever is left.
fn arm_write(
    poll: &Poll,
    armed: &mut HashMap<Token, Arc<Socket>>,
    sock: &Arc<Socket>,
    name: &str,
) {
    let Some(att) = sock.attachment_clone() else { return };
    let token = att.token();
    if !armed.contains_key(&token) {
        let Some(fd) = sock.live_fd() else { return };
        if let Err(err) = poll.registry().register(&mut SourceFd(&fd), token, Interest::WRITABLE) {
            warn!(name, ?err, "loop: write register failed");
            return;
        }
        armed.insert(token, Arc::clone(sock));
    }
    sock.handle_write_event();
    maybe_disarm(poll, armed, token, sock);
}

/// Drops write interest once the socket has nothing queued; a send racing
/// this re-arms through the task channel.
fn maybe_disarm(
    poll: &Poll,
    armed: &mut HashMap<Token, Arc<Socket>>,
    token: Token,
    sock: &Arc<Socket>,
) {
    if sock.is_closed() {
        armed.remove(&token);
        return;
    }
    if !sock.release_write_interest() {
        if armed.remove(&token).is_some()
            && let Some(fd) = sock.live_fd()
        {
            let _ = poll.registry().deregister(&mut SourceFd(&fd));
        }
    }
}
