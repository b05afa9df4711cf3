use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `verbose`; otherwise
/// the level is `info`, or `debug` for this crate when `verbose` is set.
/// Logs go to stderr so command output on stdout stays clean.
pub fn init(verbose: bool) -> Result<()> {
    let default_directive = if verbose { "info,ticketsync=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install logger: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info};

    #[test]
    fn init_is_safe_to_call_twice() {
        // Only the first call in a process can install the subscriber.
        let _ = init(true);
        assert!(init(false).is_err());

        info!("logging ready");
        debug!(verbose = true, "debug line");
    }
}
