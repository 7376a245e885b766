use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber for the `kiln` target.
///
/// `RUST_LOG` takes precedence when set, otherwise `verbosity` selects the
/// level: 0 = warn, 1 = info, 2+ = debug.
pub fn init(verbosity: u8) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbosity));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

fn default_filter(verbosity: u8) -> EnvFilter {
    match verbosity {
        0 => EnvFilter::new("kiln=warn"),
        1 => EnvFilter::new("kiln=info"),
        _ => EnvFilter::new("kiln=debug"),
    }
}
