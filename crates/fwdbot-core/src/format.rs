//! Outbound message formatting helpers.

/// Escape Telegram Markdown (legacy) special characters in user-controlled
/// text so error strings and names can't break out of notification bodies.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '_' | '*' | '`' | '[' | ']') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Human timestamp used in notification bodies.
pub fn now_display() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
