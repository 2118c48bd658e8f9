/// Install the process-wide `tracing` subscriber (stderr, `RUST_LOG` aware).
///
/// Called at the start of `TokenTalkApp::new()`. Safe to call more than once; only the
/// first call installs anything.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokentalk_core=debug,info".into()),
        )
        .with_target(true)
        .try_init();
}
