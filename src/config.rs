use crate::db::changes::{OPTION_CHANGE_SOURCE, OPTION_UPDATED, POLL_CHANGE_SOURCE, POLL_UPDATED};
use crate::services::fanout::{ChangeFilter, FanoutSettings};
use crate::services::queue::QueueSettings;
use color_eyre::eyre::{eyre, Report, WrapErr};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Without a database the server runs on the in-memory store.
    pub database_url: Option<String>,
    pub bind_address: String,
    pub vote_workers: usize,
    pub store_timeout: Duration,
    pub publish_timeout: Duration,
    pub queue: QueueSettings,
    pub fanout: FanoutSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_address: "127.0.0.1:8080".to_owned(),
            vote_workers: 4,
            store_timeout: Duration::from_millis(2000),
            publish_timeout: Duration::from_millis(1000),
            queue: QueueSettings::default(),
            fanout: FanoutSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Report> {
        dotenv().ok();
        Self::from_vars(|name| env::var(name).ok())
    }

    pub fn from_vars<F>(lookup: F) -> Result<Self, Report>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Config::default();

        let vote_workers = parse(&var, "VOTE_WORKERS")?.unwrap_or(defaults.vote_workers);
        if vote_workers == 0 {
            return Err(eyre!("VOTE_WORKERS must be at least 1"));
        }
        let millis = |name: &str, default: Duration| -> Result<Duration, Report> {
            Ok(parse(&var, name)?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };

        Ok(Self {
            database_url: var("DATABASE_URL"),
            bind_address: var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            vote_workers,
            store_timeout: millis("STORE_TIMEOUT_MS", defaults.store_timeout)?,
            publish_timeout: millis("PUBLISH_TIMEOUT_MS", defaults.publish_timeout)?,
            queue: QueueSettings {
                max_redeliveries: parse(&var, "MAX_REDELIVERIES")?
                    .unwrap_or(defaults.queue.max_redeliveries),
                redelivery_delay: millis("REDELIVERY_DELAY_MS", defaults.queue.redelivery_delay)?,
            },
            fanout: FanoutSettings {
                options: ChangeFilter::new(
                    var("OPTION_CHANGE_SOURCE").unwrap_or_else(|| OPTION_CHANGE_SOURCE.to_owned()),
                    var("OPTION_CHANGE_DETAIL_TYPE").unwrap_or_else(|| OPTION_UPDATED.to_owned()),
                ),
                polls: ChangeFilter::new(
                    var("POLL_CHANGE_SOURCE").unwrap_or_else(|| POLL_CHANGE_SOURCE.to_owned()),
                    var("POLL_CHANGE_DETAIL_TYPE").unwrap_or_else(|| POLL_UPDATED.to_owned()),
                ),
                notify_archive: flag(&var, "NOTIFY_ARCHIVE")?
                    .unwrap_or(defaults.fanout.notify_archive),
            },
        })
    }
}

fn parse<T, F>(var: &F, name: &str) -> Result<Option<T>, Report>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .wrap_err_with(|| format!("Invalid value {:?} for {}", value, name))
        })
        .transpose()
}

/// Accepts `true`/`false`, `1`/`0`, `yes`/`no` and `on`/`off` in any case.
fn flag<F>(var: &F, name: &str) -> Result<Option<bool>, Report>
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(eyre!(
                "Invalid value {:?} for {}, expected true or false",
                value,
                name
            )),
        })
        .transpose()
}
