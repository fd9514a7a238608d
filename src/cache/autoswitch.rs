//! Client-side switch from the cached export to the live page.

use std::cell::Cell;

use lol_html::html_content::ContentType;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use tracing::warn;

use crate::application::resolve::query_param;

/// Query parameter marking a request that must reach the live backend.
pub const LIVE_SKIP_PARAM: &str = "__marimo_live";

const TEMPLATE: &str = include_str!("../../static/autoswitch.js");

pub fn is_live_request(query: Option<&str>) -> bool {
    query_param(query, LIVE_SKIP_PARAM).is_some()
}

/// The polling script with its settings filled in.
#[derive(Debug, Clone)]
pub struct AutoswitchScript {
    source: String,
}

impl AutoswitchScript {
    pub fn new(ready_path: &str, include_code: bool) -> Self {
        let source = TEMPLATE
            .replace("__SKIP_PARAM__", &script_string(LIVE_SKIP_PARAM))
            .replace("__READY_PATH__", &script_string(ready_path))
            .replace("__INCLUDE_CODE__", if include_code { "true" } else { "false" });
        Self { source }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Append the script to `<body>`, or to the document when there is none.
    pub fn inject(&self, html: &str) -> String {
        let tag = format!("<script>{}</script>", self.source);
        let injected = Cell::new(false);

        let rewritten = rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: vec![element!("body", |el| {
                    if !injected.get() {
                        el.append(&tag, ContentType::Html);
                        injected.set(true);
                    }
                    Ok(())
                })],
                ..RewriteStrSettings::default()
            },
        );

        match rewritten {
            Ok(output) if injected.get() => output,
            Ok(mut output) => {
                output.push_str(&tag);
                output
            }
            Err(err) => {
                warn!(
                    target = "marimo_gateway::cache::autoswitch",
                    error = %err,
                    "Failed to rewrite cached export; appending script"
                );
                let mut output = html.to_string();
                output.push_str(&tag);
                output
            }
        }
    }
}

/// JSON string literal safe inside `<script>`.
fn script_string(value: &str) -> String {
    let encoded = serde_json::Value::String(value.to_string()).to_string();
    encoded
        .replace('<', "\\u003C")
        .replace('>', "\\u003E")
        .replace('&', "\\u0026")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_filled() {
        let script = AutoswitchScript::new("/apps/_api/ready", true);
        assert!(script.source().contains(r#"skipParam: "__marimo_live""#));
        assert!(script.source().contains(r#"readyPath: "/apps/_api/ready""#));
        assert!(script.source().contains("includeCode: true"));
        assert!(!script.source().contains("__READY_PATH__"));
    }

    #[test]
    fn script_lands_at_the_end_of_body() {
        let script = AutoswitchScript::new("/_api/ready", false);
        let html = "<html><body><div id=\"root\"></div></body></html>";
        let output = script.inject(html);

        let script_at = output.find("<script>").unwrap();
        assert!(script_at > output.find("<div id=\"root\"></div>").unwrap());
        assert!(output.ends_with("</script></body></html>"));
    }

    #[test]
    fn documents_without_body_get_the_script_appended() {
        let script = AutoswitchScript::new("/_api/ready", false);
        let output = script.inject("<p>fragment</p>");
        assert!(output.starts_with("<p>fragment</p><script>"));
    }

    #[test]
    fn live_requests_are_recognized() {
        assert!(is_live_request(Some("__marimo_live=1&session_id=s")));
        assert!(!is_live_request(Some("show-code=true")));
        assert!(!is_live_request(None));
    }
}
