use std::{num::NonZeroU8, panic, path::Path};

use time::format_description::well_known::{iso8601, Iso8601};
use tracing::{error, Level};
use tracing_subscriber::{
    fmt::{time::LocalTime, writer::MakeWriterExt},
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer,
};

const MY_CONFIG: iso8601::EncodedConfig = iso8601::Config::DEFAULT
    .set_time_precision(iso8601::TimePrecision::Second {
        decimal_digits: NonZeroU8::new(3),
    })
    .encode();

/// The webrtc crates report every failed ICE check at WARN; only their
/// errors reach the log file.
const DEFAULT_FILTER: &str = if cfg!(debug_assertions) {
    concat!(
        env!("CARGO_CRATE_NAME"),
        "=trace,sendrecv_lib=trace,webrtc=info,webrtc_ice=error"
    )
} else {
    concat!(
        env!("CARGO_CRATE_NAME"),
        "=info,sendrecv_lib=info,webrtc=warn,webrtc_ice=error"
    )
};

/// `RUST_LOG` replaces the console filter. The file keeps the default one.
fn console_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Logs to the console and, from WARN up, to `<dir>/<file_name>`.
pub fn init_tracing(dir: &Path, file_name: &str, ansi: bool) {
    let fmt_layer = || {
        const WITH_FILE_PATH: bool = cfg!(debug_assertions);
        tracing_subscriber::fmt::layer()
            .compact()
            .with_file(WITH_FILE_PATH)
            .with_line_number(WITH_FILE_PATH)
            .with_target(!WITH_FILE_PATH)
            .with_thread_ids(true)
            .with_timer(LocalTime::new(Iso8601::<MY_CONFIG>))
    };
    let log_file = tracing_appender::rolling::never(dir, file_name).with_max_level(Level::WARN);
    let file_layer = fmt_layer()
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(DEFAULT_FILTER));
    let console_layer = fmt_layer().with_ansi(ansi).with_filter(console_filter());

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(file_layer.and_then(console_layer)),
    )
    .unwrap();

    panic::set_hook(Box::new(|panic| error!("{}", panic)));
}
