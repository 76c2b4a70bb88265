//! Helper for resolving env vars

use regex::Regex;
use std::{env, env::VarError, error::Error, fmt, sync::LazyLock};

/// A regex that matches `${val}` placeholders
pub static RE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)(?P<outer>\$\{\s*(?P<inner>.*?)\s*})").unwrap());

/// Error when we failed to resolve an env var
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedEnvVarError {
    /// The unresolved input string
    pub unresolved: String,
    /// Var that couldn't be resolved
    pub var: String,
    /// the `env::var` error
    pub source: VarError,
}

impl fmt::Display for UnresolvedEnvVarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to resolve env var `{}` in `{}`: {}", self.var, self.unresolved, self.source)
    }
}

impl Error for UnresolvedEnvVarError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Replaces all `${VAR}` placeholders in `input` with the value of the matching env var.
pub fn interpolate(input: &str) -> Result<String, UnresolvedEnvVarError> {
    let mut res = input.to_string();

    for caps in RE_PLACEHOLDER.captures_iter(input) {
        let var = &caps["inner"];
        let value = env::var(var).map_err(|source| UnresolvedEnvVarError {
            unresolved: input.to_string(),
            var: var.to_string(),
            source,
        })?;

        res = res.replacen(&caps["outer"], &value, 1);
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_find_placeholders() {
        assert!(RE_PLACEHOLDER.is_match("${INFURA_KEY}"));
        assert!(RE_PLACEHOLDER.is_match("https://rpc.example.org/${ KEY }"));
        assert!(!RE_PLACEHOLDER.is_match("https://rpc.example.org/v1"));
    }

    #[test]
    fn interpolates_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BRIDGE_TEST_KEY", "abc");
            assert_eq!(interpolate("https://a.b/${BRIDGE_TEST_KEY}").unwrap(), "https://a.b/abc");

            let err = interpolate("https://a.b/${BRIDGE_MISSING_KEY}").unwrap_err();
            assert_eq!(err.var, "BRIDGE_MISSING_KEY");
            assert_eq!(err.source, VarError::NotPresent);
            Ok(())
        });
    }
}
