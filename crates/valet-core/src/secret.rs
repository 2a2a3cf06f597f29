//! `env:VAR_NAME` secret references in config strings.
//!
//! Resolution happens once at config load. A reference whose variable is
//! unset resolves to the empty string with a warning rather than failing
//! startup; the connector call that needed it will fail with a clear error.

use std::collections::HashMap;

use tracing::warn;

/// Resolve a single config value. Non-references pass through unchanged.
pub fn resolve(value: &str) -> String {
    match value.strip_prefix("env:") {
        Some(var) => match std::env::var(var) {
            Ok(v) => v,
            Err(_) => {
                warn!(var, "secret reference points at unset variable");
                String::new()
            }
        },
        None => value.to_string(),
    }
}

/// Resolve every value in a string map (headers, process env).
pub fn resolve_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), resolve(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_pass_through() {
        assert_eq!(resolve("Bearer abc"), "Bearer abc");
    }

    #[test]
    fn env_reference_resolves() {
        std::env::set_var("VALET_SECRET_TEST_VAR", "hunter2");
        assert_eq!(resolve("env:VALET_SECRET_TEST_VAR"), "hunter2");
    }

    #[test]
    fn unset_reference_is_empty() {
        std::env::remove_var("VALET_SECRET_MISSING_VAR");
        assert_eq!(resolve("env:VALET_SECRET_MISSING_VAR"), "");
    }
}
