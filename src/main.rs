use clap::Parser;
use color_eyre::Result;
use serial_portal::{
    cli,
    config::Config,
    hotplug::{self, WatchSettings},
    logging,
    mock::MockOpener,
    portal::Portal,
    serial::TtyOpener,
    server,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument, Level};

#[cfg(unix)]
async fn hangup() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    signal(SignalKind::hangup())?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn hangup() -> Result<()> {
    futures::future::pending().await
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return Ok(());
    }

    logging::init(
        cli.log_level,
        cli.log_dir.map(|dir| (Level::DEBUG, dir)),
    )
    .await;

    let config = if let Some(config_path) = cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };
    config.validate()?;

    let token = CancellationToken::new();

    let portal = if cli.mock.is_empty() {
        let portal = Portal::new(&config, TtyOpener::new(&config.device_dir));

        let watcher_portal = portal.clone();
        let watcher_config = config.clone();
        let watcher_token = token.child_token();
        tokio::spawn(
            async move {
                let settings = WatchSettings {
                    dir: &watcher_config.device_dir,
                    prefixes: &watcher_config.device_prefixes,
                    period: watcher_config.poll_interval(),
                };
                hotplug::watch(watcher_portal, settings, watcher_token).await
            }
            .instrument(info_span!("hotplug")),
        );

        portal
    } else {
        let portal = Portal::new(&config, MockOpener::loopback());
        for name in &cli.mock {
            portal.notify_device_appeared(name)?;
        }
        portal
    };

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting");
            Ok(())
        }
        _ = hangup() => {
            info!("Told to hang up, quitting");
            Ok(())
        }
        served = server::run_on_port(portal.clone(), config, cli.port) => {
            error!("Server returned");
            match served {
                Ok(()) => Err(color_eyre::eyre::eyre!("Server stopped unexpectedly")),
                Err(e) => Err(e.into()),
            }
        }
    };

    token.cancel();
    portal.shutdown();
    logging::shutdown();

    outcome
}
