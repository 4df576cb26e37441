//! imgated - the imgate daemon.
//!
//! Serves the JSON-lines control protocol on stdin/stdout. Logs go to
//! stderr.

use imgate::config::{self, Config};
use imgate::control::Control;
use imgate::network::Gateway;
use imgate::telemetry;
use tokio::io::BufReader;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "imgate.toml".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    telemetry::init(config.log.format);
    info!(path = %config_path, accounts = config.accounts.len(), "Starting imgated");

    if let Err(errors) = config::validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        anyhow::bail!("{} configuration error(s) in {config_path}", errors.len());
    }

    let gateway = Gateway::loopback(&config);
    let (control, lines) = Control::new(gateway.clone());

    // Start configured accounts
    for block in &config.accounts {
        match gateway.request_connection(&block.protocol, &block.params) {
            Ok(handle) => {
                control.watch(&handle);
                if let Err(e) = handle.connect().await {
                    warn!(account = %handle.account(), error = %e, "Auto-connect failed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to create configured connection"),
        }
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = control.run(lines, stdin, stdout) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; disconnecting");
            gateway.quit().await;
        }
    }

    info!("imgated stopped");
    Ok(())
}
