use std::{path::Path, time::Duration};

use tracing::debug;

/// Loads `.env` from the project directory when there is one.
pub fn load_env_from_project_path(project_path: &Path) {
    let env_path = project_path.join(".env");
    if dotenv::from_path(&env_path).is_err() {
        debug!("No .env loaded from {}", env_path.display());
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    let secs = duration.as_secs();
    let minutes = secs / 60;
    let seconds = secs % 60;
    let ms = total_ms % 1000;

    match (minutes, secs) {
        (m, _) if m > 0 => format!("{}m {}s", m, seconds),
        (0, s) if s >= 10 => format!("{}s", s),
        (0, s) if s > 0 => format!("{}s {}ms", s, ms),
        _ if total_ms > 0 => format!("{}ms", total_ms),
        _ => format!("{}µs", duration.as_micros()),
    }
}
