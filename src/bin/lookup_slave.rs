//! The lookup helper executable.
//!
//! Spawned by the server with a connected datagram socketpair on
//! descriptors 0 and 1. With no arguments it runs the long-lived helper
//! loop; the hidden one-shot argument turns it into a sub-worker that
//! handles a single request from stdin and exits. Log output goes to
//! stderr — stdout is the response channel.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mudnet::slave;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let oneshot = std::env::args()
        .nth(1)
        .is_some_and(|arg| arg == slave::ONESHOT_ARG);

    let result = if oneshot {
        slave::run_oneshot()
    } else {
        slave::run()
    };

    match result {
        Ok(()) => {
            if !oneshot {
                info!("shutting down");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
