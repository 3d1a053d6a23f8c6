use std::sync::Arc;

use anyhow::{Context, Result};
use clap::CommandFactory as _;
use dbus_tree::ZbusTransport;
use network_manager::NetworkManager;
use opts::{Action, Toggle};

mod network_manager;
mod opts;
mod wifi;

fn main() {
    let opts: opts::Opt = opts::Opt::from_env();

    let log_level_filter = if opts.log_debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::init_timed();
    } else {
        pretty_env_logger::formatted_timed_builder()
            .filter(Some("kiosk"), log_level_filter)
            .filter(Some("dbus_tree"), log_level_filter)
            .init();
    }

    if let Action::ShellCompletions { shell } = opts.action {
        clap_complete::generate(shell, &mut opts::RawOpt::command(), "kiosk", &mut std::io::stdout());
        return;
    }

    let result = tokio::runtime::Builder::new_current_thread()
        .thread_name("kiosk")
        .enable_all()
        .build()
        .context("Failed to initialize tokio runtime")
        .and_then(|rt| rt.block_on(run(opts)));

    if let Err(err) = result {
        log::error!("{:?}", err);
        std::process::exit(1);
    }
}

async fn run(opts: opts::Opt) -> Result<()> {
    let transport = ZbusTransport::system().await.context("Failed to connect to the system bus")?;
    let nm = NetworkManager::open(Arc::new(transport), &opts.service, opts.scan_interval).await?;
    let result = handle_action(&nm, opts.action).await;
    nm.destroy();
    result
}

async fn handle_action(nm: &NetworkManager<ZbusTransport>, action: Action) -> Result<()> {
    match action {
        Action::ShellCompletions { .. } => unreachable!(),
        Action::Wifi { watch: false } => print_json(&nm.panel()?)?,
        Action::Wifi { watch: true } => watch_panel(nm).await?,
        Action::Connections => print_json(&nm.connections()?)?,
        Action::Wireless { state } => nm.set_wireless_enabled(state == Toggle::On).await?,
        Action::Connect { ssid, passphrase } => nm.connect(&ssid, passphrase.as_deref()).await?,
        Action::Forget { ssid } => nm.forget(&ssid).await?,
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Print the panel whenever either tree changes, until interrupted.
async fn watch_panel(nm: &NetworkManager<ZbusTransport>) -> Result<()> {
    let (send, mut recv) = tokio::sync::mpsc::unbounded_channel();
    for root in [&nm.manager, &nm.settings] {
        let send = send.clone();
        root.on_properties_changed(move |_| {
            let _ = send.send(());
        });
    }

    let mut last = nm.panel()?;
    print_json(&last)?;
    loop {
        tokio::select! {
            Some(()) = recv.recv() => {
                // a single change batch can notify several times
                while recv.try_recv().is_ok() {}
                let panel = nm.panel()?;
                if panel != last {
                    print_json(&panel)?;
                    last = panel;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                return Ok(());
            }
        }
    }
}
