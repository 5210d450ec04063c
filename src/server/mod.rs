//! Server bootstrap.
//!
//! One listening socket is shared by `threads` shards. Each shard owns a
//! multiplexer and the connections it accepted; connections never move
//! between shards. Route handlers run on the tokio blocking pool and hand
//! their replies back through the owning shard's waker.
//!
//! # Example
//!
//! ```ignore
//! let config = Config::load()?;
//! let hosts = config.host_table()?;
//! let server = Server::bind(config, hosts)?;
//! let shutdown = server.shutdown_handle();
//! std::thread::spawn(move || server.run());
//! // later
//! shutdown.shutdown();
//! ```

pub mod listener;
pub mod shard;

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::config::Config;
use crate::connection::Environment;
use crate::domain::HostTable;
use crate::mux::{MioMultiplexer, Notify};
use crate::tls::TlsAcceptor;
use shard::Shard;

/// Requests a graceful stop from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    notifiers: Arc<Mutex<Vec<Arc<dyn Notify>>>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notifiers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Stops accepting and lets live connections finish.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        for notifier in self.notifiers.lock().iter() {
            let _ = notifier.notify();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub struct Server {
    config: Config,
    listener: TcpListener,
    env: Arc<Environment>,
    tls: Option<Arc<dyn TlsAcceptor>>,
    shutdown: ShutdownHandle,
    live: Arc<AtomicUsize>,
}

impl Server {
    /// Binds `config.listen_addr`. Must be called inside a tokio runtime,
    /// whose blocking pool runs the handlers.
    pub fn bind(config: Config, hosts: HostTable) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("server must be created inside a tokio runtime")?;
        Self::with_runtime(config, hosts, runtime)
    }

    pub fn with_runtime(
        config: Config,
        hosts: HostTable,
        runtime: tokio::runtime::Handle,
    ) -> anyhow::Result<Self> {
        let listener = listener::bind(&config.listen_addr)
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        info!(addr = %config.listen_addr, threads = config.threads, "listening");

        let env = Arc::new(Environment {
            hosts: Arc::new(hosts),
            limits: config.limits(),
            runtime,
        });

        Ok(Self {
            config,
            listener,
            env,
            tls: None,
            shutdown: ShutdownHandle::new(),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Serves TLS on this listener; every connection starts with a handshake.
    pub fn with_tls(mut self, acceptor: Arc<dyn TlsAcceptor>) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Live-connection counter shared by all shards.
    pub fn connection_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Starts the shards and blocks until they have all stopped.
    pub fn run(self) -> anyhow::Result<()> {
        let threads = self.config.threads.max(1);
        let mut workers = Vec::with_capacity(threads);

        for id in 0..threads {
            match self.spawn_shard(id) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    self.shutdown.shutdown();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e);
                }
            }
        }

        let mut result = Ok(());
        for (id, handle) in workers.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(shard = id, error = %e, "event loop failed");
                    result = Err(anyhow!(e).context(format!("shard {} failed", id)));
                }
                Err(_) => {
                    error!(shard = id, "event loop panicked");
                    result = Err(anyhow!("shard {} panicked", id));
                }
            }
        }

        info!("server stopped");
        result
    }

    fn spawn_shard(&self, id: usize) -> anyhow::Result<thread::JoinHandle<io::Result<()>>> {
        let mux = MioMultiplexer::new(shard::WAKER, Arc::clone(&self.live))
            .context("failed to create poller")?;
        let listener = listener::clone_for_shard(&self.listener).context("failed to clone listener")?;
        let shard = Shard::new(
            id,
            Box::new(mux),
            listener,
            Arc::clone(&self.env),
            self.tls.clone(),
            &self.config,
        )
        .context("failed to register listener")?;

        self.shutdown.notifiers.lock().push(shard.notifier());

        let shutdown = self.shutdown.clone();
        thread::Builder::new()
            .name(format!("polyserve-shard-{}", id))
            .spawn(move || {
                let result = shard.run(&shutdown.flag);
                if result.is_err() {
                    shutdown.shutdown();
                }
                result
            })
            .context("failed to spawn shard thread")
    }
}
