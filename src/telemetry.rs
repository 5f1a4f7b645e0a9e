//! Tracing setup helpers.

use std::sync::Once;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Install a global tracing subscriber.
///
/// Honors `RUST_LOG`; falls back to `warn,ragline=info`. Safe to call more
/// than once (tests, embedded use); only the first call installs anything.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("warn,ragline=info"))
            .expect("static filter directive parses");

        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE);

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    });
}
