use anyhow::Result;
use bracelet_controller::domain::models::AppEvent;
use bracelet_controller::domain::settings::SettingsService;
use bracelet_controller::infrastructure::bluetooth::adapter::BleAdapter;
use bracelet_controller::infrastructure::bluetooth::loopback::{LoopbackAdapter, VirtualPeripheral};
use bracelet_controller::infrastructure::bluetooth::{CoordinatorHandle, SessionCoordinator};
use bracelet_controller::infrastructure::logging;
use bracelet_controller::presentation::console::{self, ConsoleCommand};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "bracelet_controller", version, about = "Drive a BLE light bracelet from a breathing sensor")]
struct Args {
    /// Settings file to load instead of the per-user one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against in-memory peripherals with a synthetic breathing signal
    #[arg(long)]
    simulate: bool,

    /// Override the scan timeout
    #[arg(long)]
    scan_timeout_ms: Option<u64>,
}

const SIMULATED_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => SettingsService::from_path(path)?,
        None => SettingsService::new()?,
    };
    if let Some(ms) = args.scan_timeout_ms {
        settings.get_mut().scan_timeout_ms = ms;
    }

    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!(
        "Starting bracelet controller (settings: {})",
        settings.path().display()
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    if args.simulate {
        let (coordinator, handle) =
            SessionCoordinator::new(settings.get(), event_tx, LoopbackAdapter::new)?;
        let adapter = coordinator.adapter().clone();
        adapter.add_peripheral(VirtualPeripheral::bracelet("C2:11:22:33:44:55"));
        adapter.add_peripheral(VirtualPeripheral::mantra("D4:66:77:88:99:AA"));
        let breathing = adapter.spawn_breathing(SIMULATED_SAMPLE_INTERVAL);
        info!("Simulation mode: virtual Bracelet and Mantra are advertising");

        let result = run_shell(coordinator, handle, event_rx).await;
        breathing.abort();
        return result;
    }

    run_platform(&settings, event_tx, event_rx).await
}

#[cfg(windows)]
async fn run_platform(
    settings: &SettingsService,
    event_tx: mpsc::UnboundedSender<AppEvent>,
    event_rx: mpsc::UnboundedReceiver<AppEvent>,
) -> Result<()> {
    use bracelet_controller::infrastructure::bluetooth::winrt::WinRtAdapter;

    let runtime = tokio::runtime::Handle::try_current()?;
    let (coordinator, handle) = SessionCoordinator::new(settings.get(), event_tx, |events| {
        WinRtAdapter::new(runtime, events)
    })?;
    run_shell(coordinator, handle, event_rx).await
}

#[cfg(not(windows))]
async fn run_platform(
    _settings: &SettingsService,
    _event_tx: mpsc::UnboundedSender<AppEvent>,
    _event_rx: mpsc::UnboundedReceiver<AppEvent>,
) -> Result<()> {
    use bracelet_controller::domain::error::AdapterError;

    Err(anyhow::Error::new(AdapterError::AdapterUnavailable)
        .context("no Bluetooth backend on this platform; run with --simulate"))
}

async fn run_shell<A: BleAdapter + 'static>(
    coordinator: SessionCoordinator<A>,
    handle: CoordinatorHandle,
    mut events: mpsc::UnboundedReceiver<AppEvent>,
) -> Result<()> {
    let coordinator = tokio::spawn(coordinator.run());
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = console::render_event(&event) {
                println!("{}", line);
            }
        }
    });

    println!("{}", console::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match console::parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("error: {:#}", e);
                continue;
            }
        };

        match command {
            ConsoleCommand::Toggle(role) => handle.connect(role)?,
            ConsoleCommand::Color { .. } => {
                let last = handle.snapshot().await?.color;
                if let Some(color) = command.color_with(last) {
                    handle.set_color(color)?;
                }
            }
            ConsoleCommand::Status => {
                println!("{}", console::render_snapshot(&handle.snapshot().await?));
            }
            ConsoleCommand::Help => println!("{}", console::HELP),
            ConsoleCommand::Quit => break,
        }
    }

    if let Err(e) = handle.shutdown() {
        warn!("{}", e);
    }
    coordinator.await?;
    // The event channel closes with the coordinator.
    printer.await?;
    info!("Bracelet controller stopped");
    Ok(())
}
