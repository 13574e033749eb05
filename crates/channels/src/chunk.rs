//! Outbound message segmentation.
//!
//! Channels have hard message-size limits; replies can be arbitrarily long.
//! Segmentation must never split a multi-byte character, and prefers to
//! break on a newline (then a space) near the limit so chunks stay readable.

/// Split `content` into chunks of at most `limit` bytes, on char boundaries.
///
/// With `limit == 0` the whole content comes back as one chunk.
pub fn chunk_text(content: &str, limit: usize) -> Vec<String> {
    if limit == 0 || content.len() <= limit {
        return vec![content.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut rest = content;

    while rest.len() > limit {
        let cut = break_point(rest, limit);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_owned());
        // Drop a single leading break character so continuation chunks don't
        // start with the separator we broke on.
        rest = tail.strip_prefix(['\n', ' ']).unwrap_or(tail);
    }

    if !rest.is_empty() {
        chunks.push(rest.to_owned());
    }
    chunks
}

/// Largest cut index `<= limit` that lands on a char boundary, preferring
/// the last newline, then the last space, in the window.
fn break_point(s: &str, limit: usize) -> usize {
    let mut hard = limit;
    while hard > 0 && !s.is_char_boundary(hard) {
        hard -= 1;
    }
    if hard == 0 {
        // A single character wider than the limit; emit it whole.
        return s.chars().next().map_or(s.len(), char::len_utf8);
    }

    let window = &s[..hard];
    if let Some(nl) = window.rfind('\n') {
        if nl > 0 {
            return nl;
        }
    }
    if let Some(sp) = window.rfind(' ') {
        if sp > 0 {
            return sp;
        }
    }
    hard
}
