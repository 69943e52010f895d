mod cli;
mod config;
mod control;
mod driver;
mod hooks;
mod ipc;
mod kms;
mod ramp;
mod session;
mod wayland;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use nix::sys::signal::Signal;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing_subscriber::EnvFilter;

use cli::Opts;
use config::ConfigStore;
use control::{Controller, Flow, LogStatus};
use driver::{DisplayDriver, open_driver};
use hooks::{ExitHooks, ShutdownSignals, signal_exit_code, signal_trigger};
use ipc::{Request, handle_stdin_commands, start_socket_server};
use session::{ExitTrigger, GammaSession};

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gammatune={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    let store = ConfigStore::new(opts.config.clone().unwrap_or_else(config::default_path));
    let (saved, load_err) = store.load_or_default();
    let initial = opts.startup_params(saved);

    let driver = open_driver(opts.backend, opts.output.as_deref(), &opts.card)
        .context("open display driver")?;
    let mut session = GammaSession::new(driver);
    session
        .start()
        .context("capture original gamma ramp, refusing to touch the display")?;
    let session = session.into_shared();
    let hooks = ExitHooks::install(&session);
    let mut signals = ShutdownSignals::register().context("setup signal handlers")?;

    let mut controller = Controller::new(
        Arc::clone(&session),
        store,
        saved,
        initial,
        Box::new(LogStatus),
    );
    if let Some(err) = load_err {
        controller.config_notice(&err);
    }
    controller.refresh();

    let (request_tx, request_rx) = mpsc::unbounded_channel::<Request>();

    let server = opts.socket.clone().map(|socket_path| {
        let tx = request_tx.clone();
        tokio::spawn(async move { start_socket_server(tx, &socket_path).await })
    });

    if !opts.no_stdin {
        let tx = request_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stdin_commands(tx).await {
                tracing::warn!("{e:#}");
            }
        });
    }

    // With no command source at all, only a signal ends the session.
    let _idle = (opts.no_stdin && opts.socket.is_none()).then(|| request_tx.clone());
    drop(request_tx);

    let result = run(&mut controller, &mut signals, request_rx, server).await;

    if let Some(path) = &opts.socket {
        let _ = std::fs::remove_file(path);
    }

    exit_status(result, &hooks).map(ExitCode::from)
}

/// Maps the loop outcome to the process exit status. A loop error restores
/// the display before it is returned.
fn exit_status<D: DisplayDriver + Send + 'static>(
    result: Result<Option<Signal>>,
    hooks: &ExitHooks<D>,
) -> Result<u8> {
    match result {
        Ok(Some(sig)) => Ok(signal_exit_code(sig)),
        Ok(None) => Ok(0),
        Err(err) => {
            hooks.restore(ExitTrigger::Error);
            Err(err)
        }
    }
}

/// The control loop. Returns the signal that ended it, if any.
async fn run<D: DisplayDriver>(
    controller: &mut Controller<D>,
    signals: &mut ShutdownSignals,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut server: Option<JoinHandle<Result<()>>>,
) -> Result<Option<Signal>> {
    loop {
        tokio::select! {
            sig = signals.recv() => {
                tracing::info!(signal = sig.as_str(), "shutdown requested");
                controller.shutdown(signal_trigger(sig));
                return Ok(Some(sig));
            }
            request = requests.recv() => {
                let Some(Request { command, reply }) = request else {
                    tracing::info!("command input closed");
                    return Ok(None);
                };
                let (response, flow) = controller.handle(command);
                let _ = reply.send(response);
                if flow == Flow::Quit {
                    return Ok(None);
                }
            }
            joined = wait_server(&mut server) => {
                return match joined {
                    Ok(Ok(())) => Err(anyhow!("control socket server stopped")),
                    Ok(Err(e)) => Err(e.context("control socket server failed")),
                    Err(e) => Err(anyhow!(e).context("control socket task")),
                };
            }
        }
    }
}

async fn wait_server(server: &mut Option<JoinHandle<Result<()>>>) -> Result<Result<()>, JoinError> {
    match server {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
