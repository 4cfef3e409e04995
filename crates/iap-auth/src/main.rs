//! iap-verify
//!
//! Validates one IAP assertion with the same configuration a service would
//! use and prints the caller's identity. The assertion is taken from the
//! first argument, or read from stdin when no argument is given.

use iap_auth::auth::AssertionValidator;
use iap_auth::config::Config;
use std::io::Read;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "iap_auth=info,iap_verify=info".into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json");
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        public_key_url = %config.public_key_url,
        fixed_audience = config.expected_audience.is_some(),
        clock_skew_seconds = config.clock_skew.as_secs(),
        "Configuration loaded"
    );

    let assertion = match std::env::args().nth(1) {
        Some(arg) => arg,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let validator = AssertionValidator::from_config(&config);
    match validator.validate(assertion.trim()).await {
        Ok(identity) => {
            println!("{}", serde_json::to_string(&identity)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(reason = e.reason(), unavailable = e.is_unavailable(), "{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
