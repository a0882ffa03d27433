//! Runtime settings read from the environment once at startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::persist::DEFAULT_DEBOUNCE;

const DEFAULT_PORT: u16 = 3000;
/// Snapshot file used when `PERSIST_PATH` is unset or empty.
const DEFAULT_PERSIST_PATH: &str = "team-state.json";

const PORT_ENV: &str = "PORT";
const PERSIST_PATH_ENV: &str = "PERSIST_PATH";
const DEBOUNCE_ENV: &str = "PERSIST_DEBOUNCE_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub persist_path: PathBuf,
    pub debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            persist_path: PathBuf::from(DEFAULT_PERSIST_PATH),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Unparseable values are
    /// logged and replaced by their defaults.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let port = parse_or(PORT_ENV, lookup(PORT_ENV), defaults.port);
        let persist_path = lookup(PERSIST_PATH_ENV)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.persist_path);
        let debounce_ms = parse_or(
            DEBOUNCE_ENV,
            lookup(DEBOUNCE_ENV),
            defaults.debounce.as_millis() as u64,
        );
        let debounce = Duration::from_millis(debounce_ms);

        Self {
            port,
            persist_path,
            debounce,
        }
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, fallback: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = raw else {
        return fallback;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, fallback = %fallback, "ignoring invalid setting");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config_from(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 3000);
        assert_eq!(config.persist_path, PathBuf::from("team-state.json"));
        assert_eq!(config.debounce, Duration::from_millis(50));
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("PORT", "8081"),
            ("PERSIST_PATH", "/tmp/ctf.json"),
            ("PERSIST_DEBOUNCE_MS", "250"),
        ]);
        assert_eq!(config.port, 8081);
        assert_eq!(config.persist_path, PathBuf::from("/tmp/ctf.json"));
        assert_eq!(config.debounce, Duration::from_millis(250));
    }

    #[test]
    fn invalid_port_and_empty_path_fall_back() {
        let config = config_from(&[
            ("PORT", "eighty"),
            ("PERSIST_PATH", "  "),
            ("PERSIST_DEBOUNCE_MS", "-5"),
        ]);
        assert_eq!(config, Config::default());
    }
}
