//! Reads the outbound [`Config`] from the environment.

use crate::Config;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub const ENV_RETRY_THREADS: &str = "LIVEMESH_OUTBOUND_RETRY_THREADS";
pub const ENV_DEFAULT_RETRY_INTERVAL: &str = "LIVEMESH_OUTBOUND_DEFAULT_RETRY_INTERVAL";
pub const ENV_DEFAULT_RETRY_TIMEOUT: &str = "LIVEMESH_OUTBOUND_DEFAULT_RETRY_TIMEOUT";
pub const ENV_COUNTER_CLEAN_INTERVAL: &str = "LIVEMESH_OUTBOUND_COUNTER_CLEAN_INTERVAL";
pub const ENV_MAX_RESELECTS: &str = "LIVEMESH_OUTBOUND_MAX_RESELECTS";

/// The strings used to build a configuration.
pub trait Strings {
    /// Retrieves the value for the key `key`.
    ///
    /// `key` must be one of the `ENV_` values above.
    fn get(&self, key: &str) -> Result<Option<String>, EnvError>;
}

/// An implementation of `Strings` that reads the values from environment variables.
pub struct Env;

/// Errors produced when loading a `Config` struct.
#[derive(Clone, Debug, Error)]
pub enum EnvError {
    #[error("invalid environment variable")]
    InvalidEnvVar,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("not a valid duration")]
    NotADuration,
    #[error("not an integer: {0}")]
    NotAnInteger(
        #[from]
        #[source]
        std::num::ParseIntError,
    ),
}

// === impl Env ===

impl Strings for Env {
    fn get(&self, key: &str) -> Result<Option<String>, EnvError> {
        use std::env;

        match env::var(key) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(env::VarError::NotUnicode(_)) => {
                error!("{key} is not encoded in Unicode");
                Err(EnvError::InvalidEnvVar)
            }
        }
    }
}

impl Env {
    pub fn try_config(&self) -> Result<Config, EnvError> {
        parse_config(self)
    }
}

// === Parsing ===

pub fn parse_config<S: Strings>(strings: &S) -> Result<Config, EnvError> {
    let retry_threads = parse(strings, ENV_RETRY_THREADS, parse_number);
    let retry_interval = parse(strings, ENV_DEFAULT_RETRY_INTERVAL, parse_duration);
    let retry_timeout = parse(strings, ENV_DEFAULT_RETRY_TIMEOUT, parse_duration);
    let clean_interval = parse(strings, ENV_COUNTER_CLEAN_INTERVAL, parse_duration);
    let max_reselects = parse(strings, ENV_MAX_RESELECTS, parse_number);

    let defaults = Config::default();
    let config = Config {
        retry_threads: retry_threads?.unwrap_or(defaults.retry_threads),
        default_retry_interval: retry_interval?.unwrap_or(defaults.default_retry_interval),
        default_retry_timeout: retry_timeout?.unwrap_or(defaults.default_retry_timeout),
        counter_clean_interval: clean_interval?.unwrap_or(defaults.counter_clean_interval),
        max_reselects: max_reselects?.unwrap_or(defaults.max_reselects),
    };

    if config.default_retry_timeout < config.default_retry_interval {
        error!("{ENV_DEFAULT_RETRY_TIMEOUT} must not be less than {ENV_DEFAULT_RETRY_INTERVAL}");
        return Err(EnvError::InvalidEnvVar);
    }

    Ok(config)
}

fn parse<S, T, Parse>(strings: &S, name: &str, parse: Parse) -> Result<Option<T>, EnvError>
where
    S: Strings + ?Sized,
    Parse: FnOnce(&str) -> Result<T, ParseError>,
{
    match strings.get(name)? {
        Some(ref s) if s.trim().is_empty() => Ok(None),
        Some(ref s) => {
            let r = parse(s).map_err(|parse_error| {
                error!("{name}={s:?} is not valid: {parse_error:?}");
                EnvError::InvalidEnvVar
            })?;
            Ok(Some(r))
        }
        None => Ok(None),
    }
}

fn parse_number<T>(s: &str) -> Result<T, ParseError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    s.trim().parse().map_err(Into::into)
}

pub fn parse_duration(s: &str) -> Result<Duration, ParseError> {
    use regex::Regex;

    let re = Regex::new(r"^\s*(\d+)(ms|s|m|h)?\s*$").map_err(|_| ParseError::NotADuration)?;
    let cap = re.captures(s).ok_or(ParseError::NotADuration)?;

    let magnitude: u64 = parse_number(&cap[1])?;
    match cap.get(2).map(|m| m.as_str()) {
        None if magnitude == 0 => Ok(Duration::from_secs(0)),
        Some("ms") => Ok(Duration::from_millis(magnitude)),
        Some("s") => Ok(Duration::from_secs(magnitude)),
        Some("m") => Ok(Duration::from_secs(magnitude * 60)),
        Some("h") => Ok(Duration::from_secs(magnitude * 60 * 60)),
        _ => Err(ParseError::NotADuration),
    }
}

#[cfg(test)]
impl Strings for std::collections::HashMap<&'static str, &'static str> {
    fn get(&self, key: &str) -> Result<Option<String>, EnvError> {
        Ok(self.get(key).map(ToString::to_string))
    }
}
