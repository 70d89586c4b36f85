//! Store key construction.

use crate::config::Dimension;

/// Separator between key segments.
pub const KEY_SEPARATOR: char = ':';

/// Build `prefix:dimension:id`.
pub fn limiter_key(prefix: &str, dimension: Dimension, id: &str) -> String {
    format!("{}{sep}{}{sep}{}", prefix, dimension, id, sep = KEY_SEPARATOR)
}

/// Resolve the key a limiter stores state under.
///
/// A caller-supplied key that already contains a separator is taken to be
/// fully qualified and used verbatim.
pub fn resolve_key(prefix: &str, dimension: Dimension, key: &str) -> String {
    if key.contains(KEY_SEPARATOR) {
        key.to_string()
    } else {
        limiter_key(prefix, dimension, key)
    }
}

/// Derive a companion key such as `base:ts`.
pub(crate) fn sub_key(base: &str, suffix: &str) -> String {
    format!("{base}{KEY_SEPARATOR}{suffix}")
}
