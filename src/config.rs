use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
  pub bot_token: String,
  pub data_dir: PathBuf,
  pub admins: Vec<i64>,
  pub trial_days: i64,
  pub plan_duration_days: i64,
  pub deletion_grace: chrono::Duration,
  pub scheduler_interval: Duration,
  pub alert_interval: Duration,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let bot_token = env::var("BOT_TOKEN")
      .or_else(|_| env::var("TELOXIDE_TOKEN"))
      .context("BOT_TOKEN or TELOXIDE_TOKEN must be set")?;
    let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let admins = parse_operator_ids(&env::var("ADMIN_IDS").unwrap_or_default());
    let trial_days = env_or("TRIAL_DAYS", 14i64)?;
    let plan_duration_days = env_or("PLAN_DURATION_DAYS", 30i64)?;
    if !(1 ..= 3650).contains(&plan_duration_days) {
      bail!("PLAN_DURATION_DAYS must be between 1 and 3650, got {plan_duration_days}");
    }
    let grace_hours = env_or("DELETION_GRACE_HOURS", 24i64)?;
    let scheduler_secs = env_or("SCHEDULER_INTERVAL_SECS", 30u64)?;
    let alert_secs = env_or("ALERT_INTERVAL_SECS", 1800u64)?;
    Ok(Self {
      bot_token,
      data_dir: PathBuf::from(data_dir),
      admins,
      trial_days,
      plan_duration_days,
      deletion_grace: chrono::Duration::hours(grace_hours),
      scheduler_interval: Duration::from_secs(scheduler_secs.max(1)),
      alert_interval: Duration::from_secs(alert_secs.max(60)),
    })
  }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match env::var(name) {
    Ok(raw) if !raw.trim().is_empty() => raw
      .trim()
      .parse::<T>()
      .with_context(|| format!("{name} has an invalid value: {raw}")),
    _ => Ok(default),
  }
}

/// Operator ids separated by commas or whitespace; bad entries are logged and dropped.
fn parse_operator_ids(raw: &str) -> Vec<i64> {
  let mut ids: Vec<i64> = raw
    .split(|c: char| c == ',' || c.is_whitespace())
    .filter(|entry| !entry.is_empty())
    .filter_map(|entry| match entry.parse::<i64>() {
      Ok(id) if id > 0 => Some(id),
      Ok(id) => {
        warn!(id, "ADMIN_IDS entry is not a user id");
        None
      },
      Err(err) => {
        warn!(value = entry, error = %err, "invalid ADMIN_IDS entry");
        None
      },
    })
    .collect();
  ids.sort_unstable();
  ids.dedup();
  ids
}

#[cfg(test)]
mod tests {
  use super::env_or;
  use super::parse_operator_ids;

  #[test]
  fn operator_ids_accept_commas_and_spaces() {
    assert_eq!(
      parse_operator_ids("512034771, 98211003\n 77001"),
      vec![77001, 98211003, 512034771]
    );
  }

  #[test]
  fn operator_ids_drop_garbage_groups_and_repeats() {
    assert_eq!(parse_operator_ids("512034771,@ops,-1001234,512034771"), vec![512034771]);
    assert!(parse_operator_ids("").is_empty());
  }

  #[test]
  fn missing_numeric_setting_uses_default() {
    let value: u64 = env_or("BOTFORGE_TEST_UNSET_SETTING", 30).unwrap();
    assert_eq!(value, 30);
  }
}
