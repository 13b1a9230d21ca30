use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` wins when set; otherwise the engine
/// logs at debug level when the host enabled `debug`.
///
/// Returns false if the host already installed a global subscriber.
pub fn init(debug: bool) -> bool {
    let default_directive = if debug { "pageflow=debug" } else { "pageflow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_leaves_existing_subscriber() {
        let _ = init(true);
        assert!(!init(false));
    }
}
