//! mqtt-shell binary entry point.

mod cli;
mod config;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::info;

use mshell_core::broker::{Broker, MqttWorker, MqttWorkerConfig};
use mshell_core::constants::{cp_reply_topic, cp_topic, HISTORY_SIZE};
use mshell_core::protocol::mft::Progress;
use mshell_core::session::SessionTopics;
use mshell_core::Result;

use mshell_client::{scan, ClientShell, ClientShellConfig, CpClient};
use mshell_server::bridge::{SshBridge, TelnetBridge};
use mshell_server::{CpServer, ServerConfig, ServerShell};

use crate::cli::{Cli, Command, CopyCommand};
use crate::config::Settings;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = mshell_core::init_logging(cli.verbose, cli.log_file.as_deref(), cli.log_format.into()) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let settings = match Settings::load(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if matches!(cli.command, Command::Gui) {
        eprintln!("this build carries no GUI front-end");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn broker_for(settings: &Settings) -> Result<Arc<dyn Broker>> {
    let host = settings.require_broker()?;
    let mut config = MqttWorkerConfig::new(host, settings.broker_port);
    if let (Some(user), Some(pass)) = (&settings.broker_user, &settings.broker_password) {
        config = config.with_credentials(user.clone(), pass.clone());
    }
    Ok(Arc::new(MqttWorker::new(config)))
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    match cli.command {
        Command::Gui => unreachable!("handled before the runtime starts"),
        Command::Server => run_server(&settings).await,
        Command::Client => run_client(&settings).await,
        Command::Beacon => run_beacon(&settings).await,
        Command::Copy(copy) => run_copy(&settings, copy).await,
    }
}

async fn run_server(settings: &Settings) -> Result<()> {
    let node_id = settings.server_id()?;
    info!(%node_id, "Starting server..");

    let broker = broker_for(settings)?;
    let server = ServerShell::start(
        broker,
        SessionTopics::server(&node_id),
        ServerConfig {
            inactivity_timeout: settings.inactivity_timeout,
            cmd_timeout: settings.cmd_timeout,
            net_interface: settings.network_interface.clone(),
            ..Default::default()
        },
    )
    .await?;

    if settings.telnet_plugin.enabled {
        server.add_plugin(TelnetBridge::new(
            settings.telnet_plugin.max_connections,
            settings.telnet_plugin.keyword.clone(),
            server.output(),
        ));
    }
    if settings.ssh_plugin.enabled {
        server.add_plugin(SshBridge::new(
            settings.ssh_plugin.max_connections,
            settings.ssh_plugin.keyword.clone(),
            server.output(),
        ));
    }

    let cp_server = if settings.cp_server_enabled {
        let cp_broker = broker_for(settings)?;
        Some(CpServer::start(cp_broker, cp_topic(&node_id), cp_reply_topic(&node_id)).await?)
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(cp_server) = cp_server {
        let _ = cp_server.stop().await;
    }
    server.stop().await
}

async fn run_client(settings: &Settings) -> Result<()> {
    let node_id = settings.require_id()?;
    info!(node_id, "Starting client..");

    let broker = broker_for(settings)?;
    let shell = ClientShell::connect(
        broker,
        node_id,
        ClientShellConfig {
            history_file: settings.history_file.clone(),
            history_size: HISTORY_SIZE,
            color_prompt: settings.color_prompt,
            ..Default::default()
        },
    )
    .await?;
    shell.run().await
}

async fn run_beacon(settings: &Settings) -> Result<()> {
    info!("Starting beacon discovery..");
    let broker = broker_for(settings)?;
    let nodes = scan::run_scan(broker, settings.beacon_timeout).await?;
    info!(count = nodes.len(), "scan finished");
    Ok(())
}

async fn run_copy(settings: &Settings, copy: CopyCommand) -> Result<()> {
    let node_id = settings.require_id()?;
    let broker = broker_for(settings)?;
    let client = CpClient::connect(broker, cp_reply_topic(node_id), cp_topic(node_id)).await?;

    let (progress_tx, progress_rx) = mpsc::channel::<Progress>(64);
    let bar = tokio::spawn(render_progress(progress_rx));

    let outcome = match copy {
        CopyCommand::Local2Remote {
            source,
            destination,
        } => client
            .copy_local_to_remote(&source, &destination, Some(progress_tx))
            .await
            .map(|status| println!("success: {status}")),
        CopyCommand::Remote2Local {
            source,
            destination,
        } => client
            .copy_remote_to_local(&source, &destination, Some(progress_tx))
            .await
            .map(|path| println!("file received with success: {}", path.display())),
    };

    let _ = bar.await;
    let _ = client.stop().await;
    outcome
}

async fn render_progress(mut rx: mpsc::Receiver<Progress>) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} frames {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    while let Some(progress) = rx.recv().await {
        bar.set_length(progress.frame_total as u64);
        bar.set_position(progress.frame_received as u64);
        bar.set_message(format!("{:.0}%", progress.percent));
    }
    bar.finish_and_clear();
}
