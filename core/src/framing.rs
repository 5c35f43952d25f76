//! Line framing for raw socket reads
//!
//! Each read is framed on its own: carriage returns are stripped, one
//! trailing line feed is removed, and the remainder is split on line
//! feeds. A line fragment that spans two reads is not reassembled; the
//! fragments surface as separate (truncated) lines. Servers flush
//! line-at-a-time in practice, so this matches observed traffic.

/// Maximum number of bytes consumed from the socket in one read.
pub const MAX_TRANSFER: usize = 4096;

/// Maximum length of a line carried on a raw-receive event.
pub const MAX_RAW_EVENT_LEN: usize = MAX_TRANSFER / 8;

/// Frame the bytes of a single read into discrete IRC lines.
///
/// Empty lines are discarded. Bytes that are not valid UTF-8 are
/// replaced rather than dropped so a single bad byte cannot swallow
/// the rest of the read.
pub fn frame_read(data: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(data);
    let mut buffer: String = text.chars().filter(|&c| c != '\r').collect();
    if buffer.ends_with('\n') {
        buffer.pop();
    }
    buffer
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}

/// Cap a framed line for use as a raw-receive event payload.
///
/// Parsing always operates on the untruncated line; only the event
/// payload is bounded.
pub fn truncate_for_raw(line: &str) -> &str {
    if line.len() <= MAX_RAW_EVENT_LEN {
        return line;
    }
    // Back off to a char boundary so the cut is valid UTF-8.
    let mut end = MAX_RAW_EVENT_LEN;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}
