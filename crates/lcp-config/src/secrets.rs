//! Source-database secret resolution.
//!
//! Configuration YAML never stores a password, only the **name** of the
//! environment variable holding it. `Debug` redacts values; error
//! messages reference the env var name, never its value.

/// A resolved source-database password, keyed by `source_code`.
///
/// By convention the holding env var is named
/// `LCP_SOURCE_{source_code}_PASSWORD` (uppercased `source_code`).
#[derive(Clone)]
pub struct ResolvedSourcePassword {
    pub source_code: String,
    pub env_var_name: String,
    value: Option<String>,
}

impl std::fmt::Debug for ResolvedSourcePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSourcePassword")
            .field("source_code", &self.source_code)
            .field("env_var_name", &self.env_var_name)
            .field("value", &self.value.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl ResolvedSourcePassword {
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

/// Resolve the password for `source_code` from its conventionally-named
/// environment variable. Returns `None` in the `value` field (not an
/// error) when the variable is unset or blank — callers that require a
/// password decide whether that is fatal.
pub fn resolve_source_password(source_code: &str) -> ResolvedSourcePassword {
    let env_var_name = format!(
        "LCP_SOURCE_{}_PASSWORD",
        source_code.to_ascii_uppercase().replace('-', "_")
    );
    let value = std::env::var(&env_var_name)
        .ok()
        .filter(|v| !v.trim().is_empty());

    ResolvedSourcePassword {
        source_code: source_code.to_string(),
        env_var_name,
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sentinel source codes: globally unique, guaranteed unset in any CI or
    // dev environment, so these tests never need `std::env::set_var` and
    // sidestep parallel-test races on env-var mutation.

    #[test]
    fn missing_env_var_resolves_to_none_not_error() {
        let resolved = resolve_source_password("LCP_S1_SENTINEL_NOPE");
        assert!(resolved.value().is_none());
        assert_eq!(
            resolved.env_var_name,
            "LCP_SOURCE_LCP_S1_SENTINEL_NOPE_PASSWORD"
        );
    }

    #[test]
    fn debug_output_never_echoes_a_value_even_when_none() {
        let resolved = resolve_source_password("LCP_S1_SENTINEL_DBG");
        let dbg = format!("{resolved:?}");
        assert!(dbg.contains("None"));
        assert!(!dbg.contains("<REDACTED>") || resolved.value().is_some());
    }

    #[test]
    fn source_code_with_hyphen_normalizes_to_env_var_safe_name() {
        let resolved = resolve_source_password("src-east-1");
        assert_eq!(resolved.env_var_name, "LCP_SOURCE_SRC_EAST_1_PASSWORD");
    }
}
