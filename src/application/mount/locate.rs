//! Finds the embedded mount-config object inside an HTML document.

use std::ops::Range;

/// Assignment target that introduces the embedded config object.
pub const MOUNT_CONFIG_MARKER: &str = "window.__MARIMO_MOUNT_CONFIG__";

/// Byte span `[start, end)` of the config object, if present and balanced.
///
/// Scans from the first `{` after the marker, tracking brace depth and
/// treating double-quoted strings as opaque. The scan works on bytes: every
/// delimiter it looks at is ASCII and cannot occur inside a multi-byte UTF-8
/// sequence, so the returned bounds are always char boundaries.
pub fn locate(html: &str) -> Option<Range<usize>> {
    let marker = html.find(MOUNT_CONFIG_MARKER)?;
    let start = marker + html[marker..].find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in html.as_bytes()[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start..start + offset + 1);
                }
            }
            _ => {}
        }
    }

    None
}
