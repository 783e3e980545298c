//! Tracing subscriber setup for the command-line tool.
//!
//! `RUST_LOG` overrides the default filter:
//!
//! ```bash
//! RUST_LOG=ewfacq=debug ewfacq acquire ...
//! RUST_LOG=ewfacq::report=info,warn ewfacq acquire ...
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "ewfacq=info";
const VERBOSE_FILTER: &str = "ewfacq=debug";

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER }));

    if verbose {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        );
        let _ = tracing::subscriber::set_global_default(subscriber);
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact());
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}
