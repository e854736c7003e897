use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use busbar_network::{EventLoop, LoopPool, MAX_BUF_SIZE, Socket, SocketHandler};

#[derive(Default)]
struct Collector {
    received: Mutex<Vec<u8>>,
    closed: AtomicBool,
    timed_out: AtomicBool,
}

impl SocketHandler for Collector {
    fn on_read(&self, _sock: &Arc<Socket>, data: &[u8]) -> usize {
        self.received.lock().unwrap().extend_from_slice(data);
        data.len()
    }

    fn on_close(&self, _sock: &Arc<Socket>) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn on_timeout(&self, sock: &Arc<Socket>) -> bool {
        self.timed_out.store(true, Ordering::SeqCst);
        sock.close();
        true
    }
}

fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn local_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind test listener");
    let addr = listener.local_addr().expect("failed to fetch listener addr");
    (listener, addr)
}

#[test]
fn echo_roundtrip() {
    let (listener, addr) = local_listener();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept failed");
        let mut buf = [0_u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => stream.write_all(&buf[..n]).expect("echo write failed"),
            }
        }
    });

    let pool = LoopPool::new(1).expect("loop pool failed");
    let sock = Socket::connect(addr, Duration::from_secs(2)).expect("connect failed");
    let collector = Arc::new(Collector::default());
    sock.set_handler(Arc::clone(&collector) as Arc<dyn SocketHandler>);
    pool.attach(&sock).expect("attach failed");

    assert!(sock.send_data(b"hello busbar"));
    wait_until("echoed bytes", || collector.received.lock().unwrap().len() == 12);
    assert_eq!(collector.received.lock().unwrap().as_slice(), b"hello busbar");

    sock.close();
    server.join().expect("echo server panicked");
    pool.shutdown();
}

#[test]
fn deferred_writes_survive_backpressure() {
    let (listener, addr) = local_listener();
    let collector_thread = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept failed");
        // let the sender hit EAGAIN and park bytes in its outbuf first
        thread::sleep(Duration::from_millis(300));
        let mut all = Vec::new();
        stream.read_to_end(&mut all).expect("drain failed");
        all
    });

    let pool = LoopPool::new(1).expect("loop pool failed");
    let sock = Socket::connect(addr, Duration::from_secs(2)).expect("connect failed");
    sock.set_handler(Arc::new(Collector::default()) as Arc<dyn SocketHandler>);
    pool.attach(&sock).expect("attach failed");

    let chunk: Vec<u8> = (0..=255_u8).cycle().take(64 * 1024).collect();
    for _ in 0..8 {
        assert!(sock.send_data(&chunk));
    }
    // Half-close after the last append: everything queued still drains, and
    // the peer's read_to_end terminates on the deferred shutdown.
    sock.disallow_send();

    let all = collector_thread.join().expect("collector panicked");
    assert_eq!(all.len(), chunk.len() * 8);
    for (i, window) in all.chunks(chunk.len()).enumerate() {
        assert_eq!(window, chunk.as_slice(), "chunk {i} corrupted in transit");
    }
    sock.close();
    pool.shutdown();
}

#[test]
fn peer_close_fires_on_close() {
    let (listener, addr) = local_listener();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept failed");
        drop(stream);
    });

    let pool = LoopPool::new(1).expect("loop pool failed");
    let sock = Socket::connect(addr, Duration::from_secs(2)).expect("connect failed");
    let collector = Arc::new(Collector::default());
    sock.set_handler(Arc::clone(&collector) as Arc<dyn SocketHandler>);
    pool.attach(&sock).expect("attach failed");

    wait_until("on_close", || collector.closed.load(Ordering::SeqCst));
    assert!(sock.is_closed());
    server.join().expect("server panicked");
    pool.shutdown();
}

#[test]
fn idle_deadline_fires_and_closes() {
    let (listener, addr) = local_listener();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept failed");
        // hold the peer open well past the client's deadline
        thread::sleep(Duration::from_secs(4));
        drop(stream);
    });

    let pool = LoopPool::new(1).expect("loop pool failed");
    let sock = Socket::connect(addr, Duration::from_secs(2)).expect("connect failed");
    let collector = Arc::new(Collector::default());
    sock.set_handler(Arc::clone(&collector) as Arc<dyn SocketHandler>);
    pool.attach(&sock).expect("attach failed");
    sock.set_timeout(Some(Duration::from_millis(200)));

    wait_until("on_timeout", || collector.timed_out.load(Ordering::SeqCst));
    assert!(sock.is_closed());
    server.join().expect("server panicked");
    pool.shutdown();
}

#[test]
fn oversized_send_is_rejected_not_buffered() {
    let (listener, addr) = local_listener();
    let sock = Socket::connect(addr, Duration::from_secs(2)).expect("connect failed");

    let huge = vec![0_u8; MAX_BUF_SIZE + 1];
    assert!(!sock.send_data(&huge));
    assert_eq!(sock.last_err(), 0);

    // a sane send still goes through afterwards
    assert!(sock.send_data(b"ok"));
    sock.close();
    assert!(!sock.send_data(b"dead"));
    assert_eq!(sock.last_err(), libc::EPIPE);
    drop(listener);
}

#[test]
fn posted_tasks_run_on_the_loop_threads() {
    let ev = EventLoop::named("post-test").expect("event loop failed");
    let read_hit = Arc::new(AtomicBool::new(false));
    let write_hit = Arc::new(AtomicBool::new(false));

    let hit = Arc::clone(&read_hit);
    ev.post(move || hit.store(true, Ordering::SeqCst)).expect("post failed");
    let hit = Arc::clone(&write_hit);
    ev.post_write(move || hit.store(true, Ordering::SeqCst)).expect("post_write failed");

    wait_until("posted tasks", || {
        read_hit.load(Ordering::SeqCst) && write_hit.load(Ordering::SeqCst)
    });
}
