//! Broker assembly: the accept loop, the event-loop pool, the forwarding
//! workers and the shutdown ordering, all threaded through one context
//! value — the only shared state in the process.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    os::fd::IntoRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use busbar_network::{LoopPool, Socket};
use busbar_utils::{PoolError, WorkerPool};
use mio::{Events, Interest, Poll, Token, net::TcpListener};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    forward::Forwarder,
    handlers::BrokerConn,
    registry::Registry,
    typed::{
        QUERY_SERVICES_REQ, QUERY_SERVICES_RSP, QueryServicesReq, QueryServicesRsp,
        TypedDispatch, send_typed_response,
    },
};

pub const DEFAULT_PORT: u16 = 19000;

const LISTENER: Token = Token(0);
const KEEP_ALIVE: Duration = Duration::from_secs(90);
const ACCEPT_TICK: Duration = Duration::from_secs(2);
const IDLE_QUIT_TICKS: u32 = 15;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Listen port; 0 binds an ephemeral port.
    pub port: u16,
    /// Event loops in the pool; each runs a read and a write thread.
    pub loops: usize,
    /// Forwarding workers draining the unicast/broadcast queues.
    pub forward_workers: usize,
    /// Pooled request-handler threads; 0 sizes from the machine.
    pub pool_workers: usize,
    /// Per-connection idle deadline, renewed by any traffic.
    pub keep_alive: Duration,
    /// Self-terminate after [`idle_quit_ticks`](Self::idle_quit_ticks)
    /// accept ticks without a single registered client. Convenient for
    /// single-host developer setups; production disables it.
    pub idle_quit: bool,
    pub idle_tick: Duration,
    pub idle_quit_ticks: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            loops: 2,
            forward_workers: 2,
            pool_workers: 0,
            keep_alive: KEEP_ALIVE,
            idle_quit: true,
            idle_tick: ACCEPT_TICK,
            idle_quit_ticks: IDLE_QUIT_TICKS,
        }
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("bind/listen on port {0} failed: {1}")]
    Bind(u16, io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything the handlers share, threaded in by reference; no globals.
pub struct BrokerCtx {
    pub registry: Arc<Registry>,
    pub forwarder: Forwarder,
    pub pool: WorkerPool,
    pub typed: TypedDispatch,
    pub terminate: Arc<AtomicBool>,
}

pub struct Broker {
    ctx: Arc<BrokerCtx>,
    loops: Arc<LoopPool>,
    local_addr: SocketAddr,
}

impl Broker {
    /// Binds the listen socket and starts every thread; returns serving.
    pub fn start(cfg: BrokerConfig) -> Result<Self, BrokerError> {
        let pool = WorkerPool::new(cfg.pool_workers)?;
        let registry = Arc::new(Registry::default());

        let mut typed = TypedDispatch::default();
        let query_registry = Arc::clone(&registry);
        typed.register_json::<QueryServicesReq, _>(QUERY_SERVICES_REQ, move |sock, head, req| {
            debug!(prefix = %req.match_prefix, "broker: query services");
            let rsp = QueryServicesRsp {
                service_names: query_registry.query_services(&req.match_prefix),
            };
            if !send_typed_response(sock, head.msg_id, QUERY_SERVICES_RSP, &rsp) {
                debug!("broker: query services response dropped");
            }
        });

        let ctx = Arc::new(BrokerCtx {
            registry,
            forwarder: Forwarder::default(),
            pool,
            typed,
            terminate: Arc::new(AtomicBool::new(false)),
        });

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port));
        let listener = TcpListener::bind(addr).map_err(|err| BrokerError::Bind(cfg.port, err))?;
        let local_addr = listener.local_addr()?;

        let loops = Arc::new(LoopPool::new(cfg.loops)?);

        for i in 0..cfg.forward_workers.max(1) {
            let worker_ctx = Arc::clone(&ctx);
            ctx.pool.queue_to_named(&format!("forward-{i}"), move || {
                worker_ctx.forwarder.run_worker(&worker_ctx.registry);
            })?;
        }

        let accept_ctx = Arc::clone(&ctx);
        let accept_loops = Arc::clone(&loops);
        let accept_cfg = cfg.clone();
        ctx.pool.queue_to_named("accept", move || {
            accept_loop(listener, &accept_ctx, &accept_loops, &accept_cfg);
        })?;

        info!(port = local_addr.port(), "broker: waiting for clients");
        Ok(Self { ctx, loops, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag suitable for `signal_hook::flag::register`.
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ctx.terminate)
    }

    pub fn terminate(&self) {
        self.ctx.terminate.store(true, Ordering::Relaxed);
    }

    /// Blocks until the terminate flag is set (signal, idle-quit or
    /// [`terminate`](Self::terminate)), then tears everything down.
    pub fn run(self) {
        while !self.ctx.terminate.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(100));
        }
        self.shutdown();
    }

    /// Ordered teardown: wake the forwarders, join the accept loop, drain
    /// the event loops (closing their sockets), then stop the pool.
    pub fn shutdown(self) {
        self.terminate();
        self.ctx.forwarder.shutdown();
        if self.ctx.pool.has_named("accept") {
            let _ = self.ctx.pool.terminate_named("accept");
        }
        self.loops.shutdown();
        self.ctx.pool.shutdown();
        info!("broker: shut down");
    }
}

fn accept_loop(
    mut listener: TcpListener,
    ctx: &Arc<BrokerCtx>,
    loops: &Arc<LoopPool>,
    cfg: &BrokerConfig,
) {
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            error!(?err, "broker: accept poll setup failed");
            ctx.terminate.store(true, Ordering::Relaxed);
            return;
        }
    };
    if let Err(err) = poll.registry().register(&mut listener, LISTENER, Interest::READABLE) {
        error!(?err, "broker: listener register failed");
        ctx.terminate.store(true, Ordering::Relaxed);
        return;
    }

    let mut events = Events::with_capacity(16);
    let mut idle_ticks = 0_u32;
    loop {
        if let Err(err) = poll.poll(&mut events, Some(cfg.idle_tick)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(?err, "broker: accept poll failed");
            ctx.terminate.store(true, Ordering::Relaxed);
            return;
        }
        if cfg.idle_quit {
            if ctx.registry.has_clients() {
                idle_ticks = 0;
            } else {
                idle_ticks += 1;
                if idle_ticks > cfg.idle_quit_ticks {
                    warn!("broker: no registered clients for a while, shutting down");
                    ctx.terminate.store(true, Ordering::Relaxed);
                }
            }
        }
        if ctx.terminate.load(Ordering::Relaxed) {
            debug!("broker: accept loop exiting");
            return;
        }
        for ev in events.iter() {
            if ev.token() == LISTENER {
                drain_accepts(&mut listener, ctx, loops, cfg);
            }
        }
    }
}

fn drain_accepts(
    listener: &mut TcpListener,
    ctx: &Arc<BrokerCtx>,
    loops: &Arc<LoopPool>,
    cfg: &BrokerConfig,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                match Socket::from_accepted(stream.into_raw_fd(), peer) {
                    Ok(sock) => {
                        sock.set_handler(Arc::new(BrokerConn::new(Arc::clone(ctx))));
                        sock.set_timeout(Some(cfg.keep_alive));
                        if let Err(err) = loops.attach(&sock) {
                            warn!(%peer, ?err, "broker: could not attach client");
                            sock.close();
                            continue;
                        }
                        debug!(id = sock.id(), %peer, "broker: client connected");
                    }
                    Err(err) => warn!(%peer, ?err, "broker: fd setup failed"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(?err, "broker: accept failed");
                return;
            }
        }
    }
}
