use std::str;

pub const MAX_INPUT_SIZE: usize = 64 * 1024;

/// Returns a UTF-8 view of `data`, capped at `MAX_INPUT_SIZE`.
///
/// Real accounting files are a few kilobytes, so the cap costs no coverage
/// while keeping pathological inputs cheap. When the cap lands inside a
/// multibyte codepoint, up to 3 trailing bytes are trimmed to recover a
/// valid boundary.
#[inline]
pub fn truncate_utf8(data: &[u8]) -> Option<&str> {
    let cap = data.len().min(MAX_INPUT_SIZE);
    for trim in 0..=3 {
        if cap < trim {
            break;
        }
        let slice = &data[..cap - trim];
        if let Ok(text) = str::from_utf8(slice) {
            return Some(text);
        }
    }
    None
}
