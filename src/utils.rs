// Leading frames that belong to the panic runtime rather than to the code
// that panicked.
const RUNTIME_FRAMES: &[&str] = &[
    "std::backtrace",
    "std::panicking",
    "std::panic::",
    "std::sys",
    "core::panicking",
    "core::panic::",
    "core::result::unwrap_failed",
    "core::option::unwrap_failed",
    "core::option::expect_failed",
    "rust_begin_unwind",
    "__rust",
    "<alloc::boxed::Box<",
];

/// frame_symbol returns the symbol of a frame header line such as
/// `   3: core::panicking::panic_fmt`, or None for any other line.
fn frame_symbol(line: &str) -> Option<&str> {
    let (index, symbol) = line.trim_start().split_once(": ")?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(symbol)
}

fn is_runtime_symbol(symbol: &str, hook_frame: &str) -> bool {
    symbol.starts_with(hook_frame) || RUNTIME_FRAMES.iter().any(|p| symbol.starts_with(p))
}

/// A frame is its header line, optional unnumbered lines for symbols inlined
/// into it, and `at file:line` lines. It belongs to the runtime only if every
/// symbol in it does.
fn is_runtime_frame(frame: &[&str], hook_frame: &str) -> bool {
    let header = match frame_symbol(frame[0]) {
        Some(symbol) => symbol,
        None => return true,
    };
    is_runtime_symbol(header, hook_frame)
        && frame[1..]
            .iter()
            .map(|line| line.trim_start())
            .filter(|line| !line.starts_with("at "))
            .all(|symbol| is_runtime_symbol(symbol, hook_frame))
}

/// trim_backtrace drops the leading frames of a rendered backtrace up to the
/// frame that actually panicked. `hook_frame` is the symbol prefix of the panic
/// hook that captured the trace. A trace with no recognisable frame after the
/// runtime frames is returned as is.
pub fn trim_backtrace(trace: &str, hook_frame: &str) -> String {
    let mut frames: Vec<Vec<&str>> = Vec::new();
    for line in trace.lines() {
        match frames.last_mut() {
            Some(frame) if frame_symbol(line).is_none() => frame.push(line),
            _ => frames.push(vec![line]),
        }
    }

    let skip = frames
        .iter()
        .take_while(|frame| is_runtime_frame(frame, hook_frame))
        .count();
    if skip == frames.len() {
        return trace.to_owned();
    }
    frames[skip..].concat().join("\n")
}

#[cfg(test)]
mod tests {
    use super::{frame_symbol, trim_backtrace};

    const HOOK: &str = "app::recover::install_hook";

    const TRACE: &str = "   0: std::backtrace_rs::backtrace::libunwind::trace
             at /rustc/abc/library/std/src/../../backtrace/src/backtrace/libunwind.rs:116:5
   1: std::backtrace::Backtrace::force_capture
             at /rustc/abc/library/std/src/backtrace.rs:312:9
   2: app::recover::install_hook::{{closure}}::{{closure}}
             at ./src/recover.rs:47:33
   3: <alloc::boxed::Box<F,A> as core::ops::function::Fn<Args>>::call
             at /rustc/abc/library/alloc/src/boxed.rs:2245:9
   4: std::panicking::rust_panic_with_hook
             at /rustc/abc/library/std/src/panicking.rs:809:13
   5: std::panicking::begin_panic_handler::{{closure}}
             at /rustc/abc/library/std/src/panicking.rs:674:13
   6: std::sys::backtrace::__rust_end_short_backtrace
             at /rustc/abc/library/std/src/sys/backtrace.rs:170:18
   7: rust_begin_unwind
             at /rustc/abc/library/std/src/panicking.rs:665:5
   8: core::panicking::panic_fmt
             at /rustc/abc/library/core/src/panicking.rs:74:14
   9: app::loader::load_user
             at ./src/loader.rs:12:9
  10: app::main
             at ./src/main.rs:4:5";

    #[test]
    fn test_frame_symbol() {
        assert_eq!(
            frame_symbol("   8: core::panicking::panic_fmt"),
            Some("core::panicking::panic_fmt")
        );
        assert_eq!(frame_symbol("             at ./src/main.rs:4:5"), None);
        assert_eq!(frame_symbol("note: run with RUST_BACKTRACE"), None);
    }

    #[test]
    fn test_trim_backtrace() {
        let trimmed = trim_backtrace(TRACE, HOOK);
        assert!(trimmed.starts_with("   9: app::loader::load_user"));
        assert!(trimmed.ends_with("at ./src/main.rs:4:5"));
        assert_eq!(trimmed.lines().count(), 4);
    }

    #[test]
    fn test_trim_backtrace_keeps_inlined_user_frame() {
        let trace = "   0: std::panicking::begin_panic
   1: core::panicking::panic_fmt
      app::loader::load_user
             at ./src/loader.rs:12:9
   2: app::main";
        let trimmed = trim_backtrace(trace, HOOK);
        assert!(trimmed.starts_with("   1: core::panicking::panic_fmt"));
        assert_eq!(trimmed.lines().count(), 4);
    }

    #[test]
    fn test_trim_backtrace_needs_hook_prefix() {
        let trimmed = trim_backtrace(TRACE, "other::install_hook");
        assert!(trimmed.starts_with("   2: app::recover::install_hook"));
    }

    #[test]
    fn test_trim_backtrace_without_user_frames() {
        let only_runtime = "   0: std::panicking::begin_panic\n   1: rust_begin_unwind";
        assert_eq!(trim_backtrace(only_runtime, HOOK), only_runtime);
        assert_eq!(trim_backtrace("", HOOK), "");
    }
}
