//! Motion bridge: serves motion clips to live web viewers.
//!
//! Three execution contexts share the work:
//!
//! 1. **Event context** (the main thread, a single-threaded runtime): the
//!    broadcast hub, the viewer WebSocket server and generation runs.
//! 2. **Control plane** (its own thread and runtime): the HTTP API. It only
//!    talks to the event context through channels.
//! 3. **Tunnel watchdog** (a plain thread): restarts the SSH forward.

pub mod broadcasting;
pub mod config;
pub mod control;
pub mod error;
pub mod generation;
pub mod library;
pub mod logging;
pub mod motion;
pub mod settings;
pub mod tunnel;

use std::future::Future;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use config::Cli;
use control::ControlState;
use generation::{GenerationContext, TunnelBackend};
use library::ArtifactLibrary;
use motion::ClipConverter;
use settings::RemotePortStore;
use tunnel::{SshForward, TunnelSupervisor, TunnelTiming};

/// Parses the command line and runs the bridge until SIGINT or SIGTERM.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let library = ArtifactLibrary::open(&cli.data_dir)
        .with_context(|| format!("failed to create data directory {}", cli.data_dir.display()))?;
    let converter = Arc::new(ClipConverter::humanoid());

    let forward = SshForward {
        program: cli.ssh_program.clone(),
        host: cli.tunnel_host.clone(),
        local_port: cli.tunnel_local_port,
    };
    let tunnel = Arc::new(TunnelSupervisor::new(
        Box::new(forward),
        RemotePortStore::in_dir(&cli.data_dir),
        TunnelTiming::default(),
    ));
    info!(
        host = %cli.tunnel_host,
        local_port = cli.tunnel_local_port,
        remote_port = tunnel.remote_port(),
        "Starting motion bridge"
    );
    if !tunnel.start() {
        warn!("Continuing without tunnel, the watchdog will keep retrying");
    }
    tunnel
        .spawn_watchdog()
        .context("failed to spawn tunnel watchdog")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build event runtime")?;
    let result = runtime.block_on(serve(&cli, library, converter, Arc::clone(&tunnel)));

    tunnel.stop();
    result
}

/// The event context: hub, viewer server and generation dispatcher.
async fn serve(
    cli: &Cli,
    library: ArtifactLibrary,
    converter: Arc<ClipConverter>,
    tunnel: Arc<TunnelSupervisor>,
) -> anyhow::Result<()> {
    let ws_listener = TcpListener::bind(cli.ws_addr())
        .await
        .with_context(|| format!("failed to bind viewer socket on {}", cli.ws_addr()))?;
    let http_listener = std::net::TcpListener::bind(cli.http_addr())
        .with_context(|| format!("failed to bind control plane on {}", cli.http_addr()))?;
    http_listener.set_nonblocking(true)?;

    let (hub, hub_handle) = broadcasting::hub::channel();
    tokio::spawn(hub.run());

    let (orchestrator, jobs) = generation::channel();
    let generation = Arc::new(GenerationContext {
        hub: hub_handle.clone(),
        backend: Arc::new(TunnelBackend::new(
            cli.tunnel_local_port,
            cli.connect_timeout(),
            cli.response_timeout(),
        )),
        converter: Arc::clone(&converter),
        library: library.clone(),
    });
    tokio::spawn(generation::run_dispatcher(jobs, generation));

    spawn_control_plane(
        http_listener,
        ControlState {
            hub: hub_handle.clone(),
            orchestrator,
            library,
            converter,
            tunnel,
        },
    )?;

    let shutdown = shutdown_signal().context("failed to install shutdown signal handlers")?;
    tokio::select! {
        result = broadcasting::server::serve_viewers(ws_listener, hub_handle) => {
            result.context("viewer server stopped")?;
        }
        signal = shutdown => {
            info!(signal, "Shutting down");
        }
    }
    Ok(())
}

/// Resolves with the signal's name on SIGINT or SIGTERM.
///
/// The handlers are registered before this returns, so a signal that arrives
/// before the future is first polled is still observed.
#[cfg(unix)]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

/// Resolves on Ctrl-C.
#[cfg(not(unix))]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    let mut ctrl_c = tokio::signal::windows::ctrl_c()?;
    Ok(async move {
        ctrl_c.recv().await;
        "Ctrl-C"
    })
}

/// Runs the HTTP API on a dedicated thread with its own runtime.
fn spawn_control_plane(listener: std::net::TcpListener, state: ControlState) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-plane".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "Failed to build control-plane runtime");
                    return;
                }
            };

            runtime.block_on(async move {
                let listener = match TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!(error = %e, "Failed to register control-plane listener");
                        return;
                    }
                };
                if let Err(e) = control::serve_control(listener, state).await {
                    error!(error = %e, "Control plane stopped");
                }
            });
        })
        .context("failed to spawn control-plane thread")?;
    Ok(())
}
