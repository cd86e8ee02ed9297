use tracing_subscriber::{fmt, EnvFilter};

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `warn`). Only the first call in a
/// process has an effect, so every test may call it.
pub fn init_logging() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
  let _ = fmt()
    .with_env_filter(filter)
    .with_test_writer()
    .with_target(true)
    .try_init();
}

#[test]
fn test_init_logging_twice() {
  init_logging();
  init_logging();
  tracing::debug!("logging initialized");
}
