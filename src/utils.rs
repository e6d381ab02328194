/// Longest payload excerpt written to the log for a rejected message.
pub const PAYLOAD_PREVIEW_CHARS: usize = 512;

/// Render an optional reading the way operators expect to see it in logs and
/// anomaly messages: integral values without a fractional part, `null` when absent.
pub fn fmt_reading(value: Option<f64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "null".to_string(),
    }
}

/// Lossy, length-capped view of a raw payload for diagnostics.
pub fn payload_preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PAYLOAD_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}… ({} bytes)", payload.len())
    } else {
        head
    }
}
