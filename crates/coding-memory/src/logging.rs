//! Structured logging setup.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! The filter honours `RUST_LOG`; without it the crate logs at `info`
//! (`debug` with `--verbose`).

use tracing_subscriber::EnvFilter;

pub fn init(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for krate in ["coding_memory", "coding_memory_core"] {
        if let Ok(directive) = format!("{}={}", krate, level).parse() {
            filter = filter.add_directive(directive);
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
