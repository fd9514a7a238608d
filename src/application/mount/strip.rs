//! Textual code removal for cached exports served without code.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use super::locate::locate;

static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)(<marimo-code[^>]*>)(.*?)(</marimo-code>)").expect("valid code block pattern")
});
static SHOW_APP_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"("showAppCode"\s*:\s*)(true|false)"#).expect("valid showAppCode pattern")
});
static CODE_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"("code"\s*:\s*)"(?:\\.|[^"\\])*""#).expect("valid code field pattern")
});

/// Empty the `<marimo-code>` block, force `showAppCode` off and blank every
/// `code` string inside the mount config, without decoding it.
pub fn strip_code(html: &str) -> Cow<'_, str> {
    let html = CODE_BLOCK.replacen(html, 1, "${1}${3}");

    let Some(span) = locate(&html) else {
        return html;
    };

    let config = &html[span.clone()];
    let config = SHOW_APP_CODE.replacen(config, 1, "${1}false");
    let config = CODE_FIELD.replace_all(&config, r#"${1}"""#);

    let mut output = String::with_capacity(html.len());
    output.push_str(&html[..span.start]);
    output.push_str(&config);
    output.push_str(&html[span.end..]);
    Cow::Owned(output)
}
