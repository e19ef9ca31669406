use anyhow::Result;
use clap::Parser;
use sipswitch::{
    app::{self, AppStateBuilder},
    config::{Cli, Config},
    version,
};
use std::fs::File;
use tokio::select;
use tracing::{info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.conf {
        Some(ref conf) if std::path::Path::new(conf).exists() => Config::load(conf)?,
        _ => Config::default(),
    };

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let mut _guard = None;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)
            .map_err(|e| anyhow::anyhow!("failed to create log file {}: {}", log_file, e))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _guard = Some(guard);
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    info!("{}", version::get_version_info());
    let (state, callrecord) = AppStateBuilder::new().config(config).build().await?;
    info!(
        "Starting sipswitch on udp {}",
        state.proxy.local_addr()
    );

    let token = state.token.clone();
    select! {
        r = app::run(state, callrecord) => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down");
            token.cancel();
        }
    }
    Ok(())
}
