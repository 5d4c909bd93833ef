//! Request and state-transition logging.
//!
//! Provides the [`vlog!`] macro for consistent log output in the format:
//!
//! ```text
//! [02-08-2026 14:33:12] Friend request sent from alice to bob
//! ```
//!
//! Every line goes to stdout and is appended to `v3kn.log` at the data root
//! plus a day-sharded file under `logs/YYYY/MM/DD.log`.  Call [`init`] once at
//! startup; before that, lines only reach stdout.  Write failures are
//! swallowed so a full disk never takes a handler down with it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();
static LOG_LOCK: Mutex<()> = Mutex::new(());

/// Record the data root and truncate the previous `v3kn.log`.
/// Call once at startup before serving requests.
pub fn init(root: &Path) {
    let _ = fs::create_dir_all(root);
    let _ = fs::File::create(root.join("v3kn.log"));
    let _ = LOG_ROOT.set(root.to_path_buf());
}

/// Civil date/time (UTC) split out of a Unix timestamp.
struct Civil {
    year: i64,
    month: u64,
    day: u64,
    hours: u64,
    minutes: u64,
    seconds: u64,
}

/// Civil date from days since epoch (Howard Hinnant's algorithm).
fn civil_from_unix(secs: u64) -> Civil {
    let time_secs = secs % 86400;

    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    Civil {
        year: y,
        month: m,
        day: d,
        hours: time_secs / 3600,
        minutes: (time_secs % 3600) / 60,
        seconds: time_secs % 60,
    }
}

fn now_civil() -> Civil {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    civil_from_unix(secs)
}

fn append_line(path: &Path, line: &str) {
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{line}");
    }
}

/// Write a single log line to stdout and the log files.
///
/// Called by the [`vlog!`] macro; not intended for direct use.
pub fn emit(msg: &str) {
    let t = now_civil();
    let line = format!(
        "[{:02}-{:02}-{:04} {:02}:{:02}:{:02}] {msg}",
        t.day, t.month, t.year, t.hours, t.minutes, t.seconds
    );

    let _guard = LOG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    println!("{line}");

    let Some(root) = LOG_ROOT.get() else {
        return;
    };
    append_line(&root.join("v3kn.log"), &line);

    let folder = root
        .join("logs")
        .join(format!("{:04}", t.year))
        .join(format!("{:02}", t.month));
    if fs::create_dir_all(&folder).is_ok() {
        append_line(&folder.join(format!("{:02}.log", t.day)), &line);
    }
}

/// Emit a timestamped log line to stdout, `v3kn.log`, and the day shard.
///
/// # Usage
///
/// ```ignore
/// vlog!("User {} logged in.", npid);
/// ```
#[macro_export]
macro_rules! vlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(&format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_conversion_epoch() {
        let t = civil_from_unix(0);
        assert_eq!((t.year, t.month, t.day), (1970, 1, 1));
        assert_eq!((t.hours, t.minutes, t.seconds), (0, 0, 0));
    }

    #[test]
    fn civil_conversion_known_date() {
        // 2026-08-02 14:33:12 UTC
        let t = civil_from_unix(1_785_681_192);
        assert_eq!((t.year, t.month, t.day), (2026, 8, 2));
        assert_eq!((t.hours, t.minutes, t.seconds), (14, 33, 12));
    }

    #[test]
    fn civil_conversion_leap_day() {
        // 2024-02-29 00:00:00 UTC
        let t = civil_from_unix(1_709_164_800);
        assert_eq!((t.year, t.month, t.day), (2024, 2, 29));
    }
}
