use std::fmt;
use std::io::Write;

/// Writes one line to stderr and swallows the outcome. Desktop builds can
/// run without an attached console, where a failed `eprintln!` would panic;
/// diagnostics must never take the process down.
pub fn stderr_line(args: fmt::Arguments<'_>) {
    let mut out = std::io::stderr().lock();
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
}

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {
        $crate::safe_print::stderr_line(core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn formats_arbitrary_arguments_without_panicking() {
        crate::safe_eprintln!("value={} path={:?}", 42, std::path::Path::new("/tmp/x"));
        crate::safe_eprintln!("plain line");
    }
}
