//! The embedded mount config: locating, patching and code stripping.

mod locate;
mod patch;
mod strip;

pub use locate::{MOUNT_CONFIG_MARKER, locate};
pub use patch::{
    MountConfig, PatchOptions, PatchSources, apply_cached_html, apply_show_code,
    encode_for_script, fresh_notebook_snapshot, parse_mount_config, resolve_notebook,
    strip_config_code, strip_trailing_commas,
};
pub use strip::strip_code;
