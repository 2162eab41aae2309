use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::{
    fmt::{
        format::{Format, Writer},
        time::FormatTime,
    },
    EnvFilter,
};

/// Overrides `RUST_LOG` for this crate's subscriber when set.
pub const LOG_ENV_VAR: &str = "RBULK_LOG";

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, writer: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "{} - {}", now.format("%d %B"), now.format("%H:%M:%S%.3f"))
    }
}

fn env_filter(log_level: LevelFilter) -> EnvFilter {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::from_default_env());

    let filter = filter.add_directive(log_level.into());
    // the driver logs every statement at debug
    match "tokio_postgres=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

pub fn setup_logger(log_level: LevelFilter) {
    let format = Format::default().with_timer(LocalTimer).with_level(true).with_target(false);

    let subscriber =
        tracing_subscriber::fmt().with_env_filter(env_filter(log_level)).event_format(format).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("Logger has already been set up, continuing...");
    }
}

pub fn setup_info_logger() {
    setup_logger(LevelFilter::INFO);
}
