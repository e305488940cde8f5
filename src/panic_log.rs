use std::{
    fs::OpenOptions,
    io::Write,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

/// Routes panic reports into `<data_dir>/panic.log`.
///
/// The stock hook prints to stderr, which may be a closed stream in a
/// windowed build; a failing print inside the hook then recurses into an
/// abort with nothing recorded anywhere. Appending to the data dir keeps
/// the report regardless, and the hook itself must never panic, so every
/// step here ignores its own failures.
pub fn install_best_effort() {
    std::panic::set_hook(Box::new(|info| {
        let Ok(dir) = crate::data_dir::data_dir() else {
            return;
        };
        append_report(&dir, &info.to_string());
    }));
}

fn append_report(dir: &Path, detail: &str) {
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let backtrace = std::backtrace::Backtrace::force_capture();

    let _ = std::fs::create_dir_all(dir);
    let Ok(mut f) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("panic.log"))
    else {
        return;
    };
    let _ = writeln!(f, "ts_ms={ts_ms}");
    let _ = writeln!(f, "panic={detail}");
    let _ = writeln!(f, "backtrace={backtrace}");
    let _ = writeln!(f, "---");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_appended_with_timestamp_and_backtrace() {
        let td = tempfile::tempdir().expect("tempdir");
        append_report(td.path(), "boom at src/somewhere.rs:1");
        append_report(td.path(), "second failure");

        let raw = std::fs::read_to_string(td.path().join("panic.log")).expect("panic.log");
        assert!(raw.contains("panic=boom at src/somewhere.rs:1"));
        assert!(raw.contains("panic=second failure"));
        assert!(raw.contains("ts_ms="));
        assert!(raw.contains("backtrace="));
        assert_eq!(raw.matches("---").count(), 2);
    }
}
