use std::sync::OnceLock;

use regex::Regex;

/// Remove ANSI escape sequences (colour codes, cursor movement) from compiler output.
pub fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-Z\\-_]").expect("static ANSI pattern")
    });
    re.replace_all(text, "").into_owned()
}

/// Decode process output as UTF-8, replacing invalid sequences.
pub fn utf8_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Take at most `limit` characters, for log lines and previews.
pub fn preview(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
