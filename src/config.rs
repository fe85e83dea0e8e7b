use std::{collections::HashMap, time::Duration};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::{Error, Result},
    schema::Platform,
};

/// Every option accepted in a DSN query string or an options map.
pub const OPTION_NAMES: &[&str] = &[
    "table_name",
    "queue_name",
    "redeliver_timeout",
    "auto_setup",
    "skip_locked",
    "check_delayed_interval",
    "get_notify_timeout",
];

/// Longest queue name that still fits the indexed `VARCHAR(190)` column.
pub const MAX_QUEUE_NAME_LEN: usize = 190;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Name of the table, optionally qualified with a schema (`jobs.messages`)
    pub table_name: String,
    /// Logical queue served by this connection
    pub queue_name: String,
    /// Seconds after which a delivered but unacknowledged message is handed out again
    pub redeliver_timeout: u64,
    /// Create the table on first use when it is missing
    pub auto_setup: bool,
    /// Let concurrent consumers skip rows locked by another transaction
    /// instead of waiting on them (PostgreSQL only)
    pub skip_locked: bool,
    /// Milliseconds between polls for delayed messages while waiting on
    /// notifications (PostgreSQL only)
    pub check_delayed_interval: u64,
    /// Milliseconds to block waiting for a notification, 0 only checks what has
    /// already arrived (PostgreSQL only)
    pub get_notify_timeout: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            table_name: "messenger_messages".to_owned(),
            queue_name: "default".to_owned(),
            redeliver_timeout: 3600,
            auto_setup: true,
            skip_locked: true,
            check_delayed_interval: 60_000,
            get_notify_timeout: 0,
        }
    }
}

/// A parsed transport DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    /// The DSN with transport options removed, ready to hand to the driver
    pub database_url: String,
    pub platform: Platform,
    pub configuration: Configuration,
}

impl Configuration {
    /// Loads options from `TABLEMQ_*` environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let configuration = envy::prefixed("TABLEMQ_")
            .from_env::<Self>()
            .map_err(|e| Error::invalid_configuration(e.to_string()))?;

        configuration.validate()?;

        Ok(configuration)
    }

    /// Builds a configuration from a database URL such as
    /// `postgres://app@db/app?queue_name=mail&sslmode=require`.
    ///
    /// Transport options are taken out of the query string, anything else is
    /// left on the URL for the driver. Values from the DSN win over `options`.
    /// Unknown keys in `options` are rejected.
    pub fn from_dsn(dsn: &str, options: &HashMap<String, String>) -> Result<Dsn> {
        let mut url = Url::parse(dsn)
            .map_err(|e| Error::invalid_configuration(format!("invalid DSN: {e}")))?;

        let platform = Platform::from_scheme(url.scheme()).ok_or_else(|| {
            Error::invalid_configuration(format!("unsupported DSN scheme \"{}\"", url.scheme()))
        })?;

        let mut unknown: Vec<&str> = options
            .keys()
            .map(String::as_str)
            .filter(|key| !OPTION_NAMES.contains(key))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(Error::invalid_configuration(format!(
                "Unknown option found: [{}]. Allowed options are [{}].",
                unknown.join(", "),
                OPTION_NAMES.join(", ")
            )));
        }

        let (ours, theirs): (Vec<_>, Vec<_>) = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .partition(|(k, _)| OPTION_NAMES.contains(&k.as_str()));

        if theirs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(theirs);
        }

        let mut configuration = Self::default();
        for (key, value) in options {
            configuration.set(key, value)?;
        }
        for (key, value) in &ours {
            configuration.set(key, value)?;
        }
        configuration.validate()?;

        Ok(Dsn {
            database_url: url.into(),
            platform,
            configuration,
        })
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "table_name" => self.table_name = value.to_owned(),
            "queue_name" => self.queue_name = value.to_owned(),
            "redeliver_timeout" => self.redeliver_timeout = parse_number(key, value)?,
            "auto_setup" => self.auto_setup = parse_bool(key, value)?,
            "skip_locked" => self.skip_locked = parse_bool(key, value)?,
            "check_delayed_interval" => self.check_delayed_interval = parse_number(key, value)?,
            "get_notify_timeout" => self.get_notify_timeout = parse_number(key, value)?,
            _ => {
                return Err(Error::invalid_configuration(format!(
                    "Unknown option found: [{key}]. Allowed options are [{}].",
                    OPTION_NAMES.join(", ")
                )))
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_table_name(&self.table_name) {
            return Err(Error::invalid_configuration(format!(
                "table_name \"{}\" is not a valid identifier",
                self.table_name
            )));
        }

        if self.queue_name.is_empty() || self.queue_name.len() > MAX_QUEUE_NAME_LEN {
            return Err(Error::invalid_configuration(format!(
                "queue_name must be between 1 and {MAX_QUEUE_NAME_LEN} bytes"
            )));
        }

        Ok(())
    }

    /// Saturates at [`TimeDelta::MAX`] for timeouts chrono cannot represent.
    pub fn redeliver_window(&self) -> TimeDelta {
        i64::try_from(self.redeliver_timeout)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn delayed_check_interval(&self) -> TimeDelta {
        i64::try_from(self.check_delayed_interval)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.get_notify_timeout)
    }
}

/// Table names are interpolated into SQL, so only plain identifiers with an
/// optional schema qualifier are accepted.
fn is_valid_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();

    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::invalid_configuration(format!(
            "{key} expects a boolean, got \"{value}\""
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        Error::invalid_configuration(format!("{key} expects a non-negative integer, got \"{value}\""))
    })
}
