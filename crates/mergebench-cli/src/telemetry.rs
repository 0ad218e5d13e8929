//! Telemetry initialization.
//!
//! Controlled by `MERGEBENCH_LOG`:
//! - unset or `"pretty"` → compact human-readable events on stderr
//! - `"json"` → JSON spans/events on stderr, span close events included
//!
//! `RUST_LOG` selects what is recorded (default `info`).

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Hold this in `main()` until exit.
#[must_use = "telemetry stops when the guard is dropped"]
pub struct TelemetryGuard {
    _private: (),
}

/// Initialize telemetry based on `MERGEBENCH_LOG`.
pub fn init() -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match std::env::var("MERGEBENCH_LOG").as_deref() {
        Ok("json") => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init(),
        Ok("pretty" | "") | Err(_) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
        Ok(other) => {
            registry
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .init();
            tracing::warn!(value = other, "unknown MERGEBENCH_LOG value, using compact output");
        }
    }

    TelemetryGuard { _private: () }
}
