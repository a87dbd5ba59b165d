//! Relay daemon entry point.
//!
//! This binary is what the lifecycle supervisor spawns detached. It reads
//! its configuration from the environment, binds the port before any other
//! work, and serves until killed.
//!
//! Exit codes: 0 clean shutdown, 2 bind collision, 1 other fatal
//! initialization error.

use cdp_relay::config::RelayConfig;
use cdp_relay::error::Error;
use cdp_relay::logging::init_logging;
use cdp_relay::server::serve;

#[tokio::main]
async fn main() {
    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cdp-relay: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("cdp-relay: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = serve(config).await {
        tracing::error!(error = %e, "Relay failed");
        let code = match e {
            Error::PortInUse { .. } => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}
