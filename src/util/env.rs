//! Environment variable helpers.

use std::time::Duration;

/// Check if an environment variable is set to a truthy value.
#[must_use]
pub fn is_env_truthy(var: &str) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Read a non-empty, trimmed environment variable.
#[must_use]
pub fn env_non_empty(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read an environment variable holding a duration in milliseconds.
///
/// Unparsable values are logged and ignored.
#[must_use]
pub fn env_millis(var: &str) -> Option<Duration> {
    let raw = env_non_empty(var)?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!(var, value = %raw, error = %e, "Ignoring invalid millisecond value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[allow(unsafe_code)]
    fn with_env_var(key: &str, value: &str, f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().unwrap();
        let prior = std::env::var(key).ok();
        unsafe {
            std::env::set_var(key, value);
        }
        f();
        match prior {
            Some(val) => unsafe {
                std::env::set_var(key, val);
            },
            None => unsafe {
                std::env::remove_var(key);
            },
        }
    }

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "YES", " on "] {
            with_env_var("ACCOUNTS_TEST_TRUTHY", value, || {
                assert!(is_env_truthy("ACCOUNTS_TEST_TRUTHY"), "{value} should be truthy");
            });
        }
        with_env_var("ACCOUNTS_TEST_TRUTHY", "0", || {
            assert!(!is_env_truthy("ACCOUNTS_TEST_TRUTHY"));
        });
        assert!(!is_env_truthy("ACCOUNTS_TEST_NEVER_SET"));
    }

    #[test]
    fn millis_parsing_ignores_garbage() {
        with_env_var("ACCOUNTS_TEST_MILLIS", "250", || {
            assert_eq!(env_millis("ACCOUNTS_TEST_MILLIS"), Some(Duration::from_millis(250)));
        });
        with_env_var("ACCOUNTS_TEST_MILLIS", "soon", || {
            assert_eq!(env_millis("ACCOUNTS_TEST_MILLIS"), None);
        });
        with_env_var("ACCOUNTS_TEST_MILLIS", "  ", || {
            assert_eq!(env_millis("ACCOUNTS_TEST_MILLIS"), None);
        });
    }
}
