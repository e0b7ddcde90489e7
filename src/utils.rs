//! Shared helpers for spawning children and cleaning up their output.

use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        // ESC followed by a single-char sequence, or a CSI sequence
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("static ANSI pattern")
    })
}

/// Remove terminal control sequences (colors, cursor movement) from a line.
pub fn strip_ansi(line: &str) -> String {
    ansi_regex().replace_all(line, "").into_owned()
}

/// Decode one raw output line. Non-UTF8 bytes are replaced rather than
/// rejected, then control sequences and surrounding whitespace are removed.
/// Returns `None` for lines that end up empty.
pub fn clean_line(raw: &[u8]) -> Option<String> {
    let decoded = String::from_utf8_lossy(raw);
    let cleaned = strip_ansi(decoded.trim());
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}
