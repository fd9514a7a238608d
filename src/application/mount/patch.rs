//! Decode, mutate and splice back the embedded mount config.

use std::borrow::Cow;
use std::ops::Range;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::warn;

use super::locate::locate;
use crate::application::backend::NotebookSource;
use crate::domain::cells::NotebookSnapshot;

pub type MountConfig = Map<String, Value>;

/// Mutations applied by [`apply_cached_html`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchOptions {
    pub include_code: bool,
    pub show_code: bool,
    /// Graft the cached config's `session` into the document.
    pub include_session: bool,
}

/// Data the patch may draw from besides the document itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchSources<'a> {
    pub cached_config: Option<&'a MountConfig>,
    pub fresh_notebook: Option<&'a NotebookSnapshot>,
}

/// Drop commas that directly precede `}` or `]` outside of strings.
pub fn strip_trailing_commas(text: &str) -> Cow<'_, str> {
    if !text.contains(',') {
        return Cow::Borrowed(text);
    }

    let bytes = text.as_bytes();
    let mut output = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut copied_until = 0;

    for (index, byte) in bytes.iter().enumerate() {
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
            b',' => {
                let closes = bytes[index + 1..]
                    .iter()
                    .find(|next| !next.is_ascii_whitespace())
                    .is_some_and(|next| matches!(next, b'}' | b']'));
                if closes {
                    output.push_str(&text[copied_until..index]);
                    copied_until = index + 1;
                }
            }
            _ => {}
        }
    }

    if copied_until == 0 {
        return Cow::Borrowed(text);
    }
    output.push_str(&text[copied_until..]);
    Cow::Owned(output)
}

/// Locate and decode the mount config; `None` when missing or malformed.
pub fn parse_mount_config(html: &str) -> Option<(MountConfig, Range<usize>)> {
    let span = locate(html)?;
    let text = strip_trailing_commas(&html[span.clone()]);
    match serde_json::from_str::<MountConfig>(&text) {
        Ok(config) => Some((config, span)),
        Err(err) => {
            warn!(
                target = "marimo_gateway::mount",
                error = %err,
                "Failed to parse mount config"
            );
            None
        }
    }
}

/// Serialise with sorted keys and `<`, `>`, `&` escaped for a `<script>` context.
///
/// Those three characters can only appear inside JSON strings, so escaping
/// them across the whole text keeps the JSON valid.
pub fn encode_for_script(config: &MountConfig) -> String {
    let text = match serde_json::to_string(config) {
        Ok(text) => text,
        Err(err) => {
            warn!(
                target = "marimo_gateway::mount",
                error = %err,
                "Failed to encode mount config"
            );
            return String::from("{}");
        }
    };

    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => escaped.push_str("\\u003C"),
            '>' => escaped.push_str("\\u003E"),
            '&' => escaped.push_str("\\u0026"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Blank every `code` value, whatever its type, at any depth.
pub fn strip_config_code(config: &mut MountConfig) {
    for (key, value) in config.iter_mut() {
        if key == "code" {
            *value = Value::String(String::new());
        } else {
            blank_code(value);
        }
    }
}

fn blank_code(value: &mut Value) {
    match value {
        Value::Object(map) => strip_config_code(map),
        Value::Array(items) => items.iter_mut().for_each(blank_code),
        _ => {}
    }
}

/// Set `view.showAppCode` and blank code when inclusion is off.
pub fn apply_show_code(config: &mut MountConfig, include_code: bool, show_code: bool) {
    let view = config
        .entry("view")
        .or_insert_with(|| Value::Object(Map::new()));
    if !view.is_object() {
        *view = Value::Object(Map::new());
    }
    if let Value::Object(view) = view {
        view.insert(
            "showAppCode".to_string(),
            Value::Bool(include_code && show_code),
        );
    }

    if !include_code {
        strip_config_code(config);
    }
}

/// Fresh snapshot when code is included and computable, else the cached one.
pub fn resolve_notebook(sources: PatchSources<'_>, include_code: bool) -> Option<Value> {
    let fresh = sources.fresh_notebook.filter(|_| include_code);
    if let Some(snapshot) = fresh {
        match serde_json::to_value(snapshot) {
            Ok(value) => return Some(value),
            Err(err) => warn!(
                target = "marimo_gateway::mount",
                error = %err,
                "Failed to encode notebook snapshot"
            ),
        }
    }

    sources
        .cached_config
        .and_then(|config| config.get("notebook"))
        .filter(|notebook| notebook.is_object())
        .cloned()
}

/// Ask the collaborator for a fresh snapshot only when it could be used.
pub async fn fresh_notebook_snapshot(
    source: &dyn NotebookSource,
    path: Option<&Path>,
    include_code: bool,
) -> Option<NotebookSnapshot> {
    match path {
        Some(path) if include_code => source.notebook_snapshot(path).await,
        _ => None,
    }
}

/// Rewrite the mount config of `html`; every byte outside its span is kept.
///
/// Returns the input unchanged when no parseable config is present.
pub fn apply_cached_html<'h>(
    html: &'h str,
    sources: PatchSources<'_>,
    options: PatchOptions,
) -> Cow<'h, str> {
    let Some((mut config, span)) = parse_mount_config(html) else {
        return Cow::Borrowed(html);
    };

    let cached_session = sources
        .cached_config
        .and_then(|cached| cached.get("session"))
        .filter(|session| options.include_session && !session.is_null());
    if let Some(session) = cached_session {
        config.insert("session".to_string(), session.clone());
    }

    if let Some(notebook) = resolve_notebook(sources, options.include_code) {
        config.insert("notebook".to_string(), notebook);
    }

    apply_show_code(&mut config, options.include_code, options.show_code);

    let encoded = encode_for_script(&config);
    let mut output = String::with_capacity(html.len() - span.len() + encoded.len());
    output.push_str(&html[..span.start]);
    output.push_str(&encoded);
    output.push_str(&html[span.end..]);
    Cow::Owned(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::mount::locate::MOUNT_CONFIG_MARKER;
    use crate::domain::cells::{NotebookCell, SnapshotMetadata};
    use serde_json::json;

    fn page(config: &str) -> String {
        format!(
            "<html><head><script>{MOUNT_CONFIG_MARKER} = {config};</script></head>\
             <body><marimo-code hidden>print(1)</marimo-code></body></html>"
        )
    }

    fn decoded(html: &str) -> MountConfig {
        parse_mount_config(html).unwrap().0
    }

    fn cached(value: Value) -> MountConfig {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn collect_code(value: &Value, found: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if key == "code" {
                        if let Value::String(code) = child {
                            found.push(code.clone());
                        }
                    } else {
                        collect_code(child, found);
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|item| collect_code(item, found)),
            _ => {}
        }
    }

    #[test]
    fn trailing_commas_are_removed_outside_strings() {
        let text = r#"{"a": [1, 2, ], "b": "x,}", "c": {"d": 1,
        },}"#;
        let cleaned = strip_trailing_commas(text);
        let value: Value = serde_json::from_str(&cleaned).unwrap();
        assert_eq!(value["b"], "x,}");
        assert_eq!(value["a"], json!([1, 2]));
    }

    #[test]
    fn text_without_trailing_commas_is_borrowed() {
        assert!(matches!(
            strip_trailing_commas(r#"{"a": [1, 2]}"#),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn encoding_sorts_keys_and_escapes_html_characters() {
        let config = cached(json!({"z": 1, "a": "</script><b>&"}));
        assert_eq!(
            encode_for_script(&config),
            r#"{"a":"\u003C/script\u003E\u003Cb\u003E\u0026","z":1}"#
        );
    }

    #[test]
    fn only_the_config_span_changes() {
        let html = page(r#"{"view": {"showAppCode": true}, "code": "x = 1",}"#);
        let patched = apply_cached_html(&html, PatchSources::default(), PatchOptions::default());

        let span = locate(&html).unwrap();
        let new_span = locate(&patched).unwrap();
        assert_eq!(&patched[..new_span.start], &html[..span.start]);
        assert_eq!(&patched[new_span.end..], &html[span.end..]);
        assert_eq!(
            &patched[new_span],
            r#"{"code":"","view":{"showAppCode":false}}"#
        );
    }

    #[test]
    fn excluded_code_is_blank_at_every_depth() {
        let html = page(
            r#"{
                "code": "top",
                "notebook": {"cells": [{"id": "a", "code": "x = 1"}, {"id": "b", "code": "y"}]},
                "session": {"cells": [{"id": "a", "code": "x = 1", "nested": [[{"code": "deep"}]]}]},
                "other": {"list": [{"code": "<b>"}]}
            }"#,
        );
        let options = PatchOptions {
            include_code: false,
            show_code: true,
            include_session: false,
        };
        let patched = apply_cached_html(&html, PatchSources::default(), options);
        let config = decoded(&patched);

        let mut found = Vec::new();
        collect_code(&Value::Object(config.clone()), &mut found);
        assert_eq!(found.len(), 6);
        assert!(found.iter().all(String::is_empty));
        assert_eq!(config["view"]["showAppCode"], json!(false));
    }

    #[test]
    fn patching_twice_is_byte_identical() {
        let html = page(r#"{"view": {"width": "full",}, "notebook": {"cells": [{"code": "a < b"}]}}"#);
        let cached_config = cached(json!({"session": {"cells": [{"id": "a"}]}}));
        let sources = PatchSources {
            cached_config: Some(&cached_config),
            fresh_notebook: None,
        };
        let options = PatchOptions {
            include_code: true,
            show_code: true,
            include_session: true,
        };

        let once = apply_cached_html(&html, sources, options).into_owned();
        let twice = apply_cached_html(&once, sources, options).into_owned();
        assert_eq!(once, twice);
    }

    #[test]
    fn cached_session_is_grafted_when_requested() {
        let html = page(r#"{"session": null}"#);
        let cached_config = cached(json!({"session": {"version": "1", "cells": []}}));
        let sources = PatchSources {
            cached_config: Some(&cached_config),
            fresh_notebook: None,
        };

        let without = decoded(&apply_cached_html(&html, sources, PatchOptions::default()));
        assert_eq!(without["session"], Value::Null);

        let options = PatchOptions {
            include_session: true,
            ..PatchOptions::default()
        };
        let with = decoded(&apply_cached_html(&html, sources, options));
        assert_eq!(with["session"]["version"], "1");
    }

    #[test]
    fn code_values_of_any_type_are_blanked() {
        let mut config = cached(json!({
            "code": {"source": "secret = 1"},
            "cells": [{"code": ["secret", "lines"]}, {"code": 42}, {"code": null}],
        }));
        strip_config_code(&mut config);

        assert_eq!(config["code"], "");
        assert_eq!(
            config["cells"],
            json!([{"code": ""}, {"code": ""}, {"code": ""}])
        );
        assert!(!encode_for_script(&config).contains("secret"));
    }

    #[test]
    fn fresh_notebook_wins_only_when_code_is_included() {
        let html = page(r#"{"notebook": {"cells": []}}"#);
        let cached_config = cached(json!({"notebook": {"version": "1", "cells": [{"id": "old", "code": ""}]}}));
        let fresh = NotebookSnapshot {
            version: "1".to_string(),
            metadata: SnapshotMetadata::default(),
            cells: vec![NotebookCell::new("new", "x = 1")],
        };
        let sources = PatchSources {
            cached_config: Some(&cached_config),
            fresh_notebook: Some(&fresh),
        };

        let included = PatchOptions {
            include_code: true,
            show_code: false,
            include_session: false,
        };
        let config = decoded(&apply_cached_html(&html, sources, included));
        assert_eq!(config["notebook"]["cells"][0]["id"], "new");
        assert_eq!(config["notebook"]["cells"][0]["code"], "x = 1");
        assert_eq!(config["view"]["showAppCode"], json!(false));

        let config = decoded(&apply_cached_html(&html, sources, PatchOptions::default()));
        assert_eq!(config["notebook"]["cells"][0]["id"], "old");
    }

    #[test]
    fn show_code_requires_code_inclusion() {
        let mut config = cached(json!({"view": "broken"}));
        apply_show_code(&mut config, false, true);
        assert_eq!(config["view"], json!({"showAppCode": false}));

        let mut config = cached(json!({}));
        apply_show_code(&mut config, true, true);
        assert_eq!(config["view"]["showAppCode"], json!(true));
    }

    #[test]
    fn malformed_config_leaves_document_untouched() {
        let html = page(r#"{"view": nope}"#);
        let patched = apply_cached_html(&html, PatchSources::default(), PatchOptions::default());
        assert!(matches!(patched, Cow::Borrowed(_)));
        assert_eq!(patched, html);
    }

    #[test]
    fn reencoded_config_is_pinned() {
        let html = page(r#"{"mode": "read", "view": {"showAppCode": true}, "notebook": {"cells": [{"id": "Hbol", "code": "import marimo as mo",}]}}"#);
        let patched = apply_cached_html(&html, PatchSources::default(), PatchOptions::default());
        let span = locate(&patched).unwrap();
        insta::assert_snapshot!(&patched[span], @r#"{"mode":"read","notebook":{"cells":[{"code":"","id":"Hbol"}]},"view":{"showAppCode":false}}"#);
    }
}
