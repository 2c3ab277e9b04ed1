//! `proxyd`: the filtering bus proxy binary (spec §6).
//!
//! Parses one or more `<bus-address> <socket-path> [options...]` groups
//! from the command line, binds a listening socket per group, and spawns
//! one [`bus_proxy::connection::run`] task per accepted client.

use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::unix::AsyncFd;
use tokio::net::{UnixListener, UnixStream};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bus_proxy::cli::{self, Cli, ProxySpec};

fn main() -> Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let cli = match cli::parse(&argv, read_nul_separated_fd) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("proxyd: {e}");
            std::process::exit(1);
        }
    };

    let filter = if cli.verbose_log {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    // Single-threaded cooperative runtime: no client's task ever touches
    // another's state (spec §5), so there is nothing for a second worker
    // thread to parallelize.
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    let result = runtime.block_on(run(cli));
    if let Err(e) = result {
        tracing::error!(error = %e, "proxyd exiting with error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut listeners = Vec::new();
    for proxy in cli.proxies {
        let listener = bind_listener(proxy.socket_path.clone())
            .with_context(|| format!("binding {:?}", proxy.socket_path))?;
        tracing::info!(socket = %proxy.socket_path, bus = %proxy.bus_address, filtering = proxy.filtering, "proxy listening");
        listeners.push((listener, proxy));
    }

    let accept_loops = listeners.into_iter().map(|(listener, proxy)| tokio::spawn(accept_loop(listener, proxy)));

    let sync_wait = async {
        if let Some(fd) = cli.sync_fd {
            wait_for_sync_pipe_close(fd).await;
            tracing::info!("sync pipe closed, shutting down");
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = sync_wait => {}
        _ = futures_join_all(accept_loops) => {}
    }

    Ok(())
}

async fn futures_join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// A listening socket that unlinks its path from the filesystem when
/// dropped, so the socket is removed before bind and again on stop
/// (spec §6) regardless of which path causes the accept loop to end.
struct BoundListener {
    listener: UnixListener,
    socket_path: String,
}

impl std::ops::Deref for BoundListener {
    type Target = UnixListener;

    fn deref(&self) -> &UnixListener {
        &self.listener
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn bind_listener(socket_path: String) -> Result<BoundListener> {
    let path = Path::new(&socket_path);
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("removing stale socket {socket_path:?}"))?;
    }
    let listener = UnixListener::bind(path)?;
    Ok(BoundListener { listener, socket_path })
}

async fn accept_loop(listener: BoundListener, proxy: ProxySpec) {
    let policy = Arc::new(proxy.policy);
    let bus_address = proxy.bus_address;
    let filtering = proxy.filtering;
    let sloppy_names = proxy.sloppy_names;

    loop {
        let (client, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        let bus_address = bus_address.clone();
        let policy = Arc::clone(&policy);

        tokio::spawn(async move {
            let bus = match connect_bus(&bus_address).await {
                Ok(bus) => bus,
                Err(e) => {
                    tracing::warn!(error = %e, bus = %bus_address, "failed to connect upstream bus");
                    return;
                }
            };

            if let Err(e) = bus_proxy::connection::run(client, bus, policy, filtering, sloppy_names).await {
                tracing::debug!(error = %e, "connection closed");
            }
        });
    }
}

/// Connect to the upstream bus address. Only `unix:path=...` and bare
/// filesystem paths are supported (spec §6); abstract-namespace and TCP
/// addresses are out of scope.
async fn connect_bus(bus_address: &str) -> Result<UnixStream> {
    let path = bus_address.strip_prefix("unix:path=").unwrap_or(bus_address);
    let stream = UnixStream::connect(path).await.with_context(|| format!("connecting to {path:?}"))?;
    Ok(stream)
}

/// Read the `--args=N` descriptor as NUL-separated extra arguments.
fn read_nul_separated_fd(fd: i32) -> std::io::Result<Vec<String>> {
    use std::io::Read;
    // SAFETY: `fd` was handed to us by our parent process specifically for
    // this purpose; it is valid for the process's lifetime.
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    std::mem::forget(file);

    Ok(buf
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect())
}

/// An unowned file descriptor, borrowed only for the lifetime of the
/// sync-pipe wait below; it is never closed through this wrapper.
struct BorrowedRawFd(RawFd);

impl std::os::unix::io::AsRawFd for BorrowedRawFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Block until `fd`'s peer closes (EOF on a read), then return. This is
/// the `--fd=N` synchronization pipe (spec §6): its closure is the
/// process's cue to exit cleanly.
async fn wait_for_sync_pipe_close(fd: RawFd) {
    let Ok(async_fd) = AsyncFd::new(BorrowedRawFd(fd)) else {
        return;
    };

    loop {
        let Ok(mut guard) = async_fd.readable().await else {
            return;
        };
        let mut buf = [0u8; 64];
        // SAFETY: reading from a borrowed fd we don't own; we never close it.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n <= 0 {
            return;
        }
        guard.clear_ready();
    }
}
