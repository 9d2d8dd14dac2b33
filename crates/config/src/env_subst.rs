use std::borrow::Cow;

use {
    once_cell::sync::Lazy,
    regex::{Captures, Regex},
};

#[allow(clippy::unwrap_used)]
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replace `${ENV_VAR}` placeholders in raw config text.
///
/// Unset variables and malformed placeholders are left untouched.
pub fn substitute_env(input: &str) -> Cow<'_, str> {
    PLACEHOLDER.replace_all(input, |caps: &Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
}
