use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::models::UserRecord;

/// Bots a user may link while the trial is running, whatever the plan.
pub const TRIAL_BOT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
  #[default]
  Basic,
  Advanced,
  Premium,
  Pro,
  Ultimate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
  pub bots: Option<usize>,
  pub groups: Option<usize>,
  pub channels: Option<usize>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitError {
  #[error("bot limit of {limit} reached for plan {plan}")]
  Bots { plan: Plan, limit: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown plan {0:?}")]
pub struct UnknownPlan(pub String);

impl Plan {
  pub const ALL: [Plan; 5] = [Plan::Basic, Plan::Advanced, Plan::Premium, Plan::Pro, Plan::Ultimate];

  pub fn limits(self) -> PlanLimits {
    let (bots, groups, channels) = match self {
      Plan::Basic => (Some(1), Some(2), Some(1)),
      Plan::Advanced => (Some(2), Some(5), Some(2)),
      Plan::Premium => (Some(3), Some(10), Some(3)),
      Plan::Pro => (Some(5), Some(20), Some(5)),
      Plan::Ultimate => (None, None, None),
    };
    PlanLimits { bots, groups, channels }
  }

  /// Monthly price in euro cents.
  pub fn monthly_price_cents(self) -> i64 {
    match self {
      Plan::Basic => 0,
      Plan::Advanced => 999,
      Plan::Premium => 1999,
      Plan::Pro => 2999,
      Plan::Ultimate => 4999,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Plan::Basic => "basic",
      Plan::Advanced => "advanced",
      Plan::Premium => "premium",
      Plan::Pro => "pro",
      Plan::Ultimate => "ultimate",
    }
  }

  pub fn is_paid(self) -> bool {
    self != Plan::Basic
  }
}

impl fmt::Display for Plan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Plan {
  type Err = UnknownPlan;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    let needle = raw.trim().to_ascii_lowercase();
    Plan::ALL
      .into_iter()
      .find(|plan| plan.as_str() == needle)
      .ok_or_else(|| UnknownPlan(raw.to_string()))
  }
}

pub fn in_trial(user: &UserRecord, now: DateTime<Utc>) -> bool {
  user.trial_ends_at > now
}

/// The plan that currently applies: an expired paid plan counts as basic.
pub fn effective_plan(user: &UserRecord, now: DateTime<Utc>) -> Plan {
  match user.plan_expires_at {
    Some(expires) if expires <= now => Plan::Basic,
    _ => user.plan,
  }
}

pub fn bot_limit(user: &UserRecord, now: DateTime<Utc>) -> Option<usize> {
  let plan_limit = effective_plan(user, now).limits().bots;
  if in_trial(user, now) {
    plan_limit.map(|limit| limit.max(TRIAL_BOT_LIMIT))
  } else {
    plan_limit
  }
}

/// `active_bots` must not include bots that are scheduled for deletion.
pub fn can_link_bot(user: &UserRecord, active_bots: usize, now: DateTime<Utc>) -> Result<(), LimitError> {
  match bot_limit(user, now) {
    Some(limit) if active_bots >= limit => Err(LimitError::Bots {
      plan: effective_plan(user, now),
      limit,
    }),
    _ => Ok(()),
  }
}

fn owner_plan(owner: Option<&UserRecord>, now: DateTime<Utc>) -> Plan {
  owner.map_or(Plan::Basic, |owner| effective_plan(owner, now))
}

/// Groups each bot of `owner` may serve; a missing owner record gets basic limits.
pub fn group_limit(owner: Option<&UserRecord>, now: DateTime<Utc>) -> Option<usize> {
  owner_plan(owner, now).limits().groups
}

pub fn channel_limit(owner: Option<&UserRecord>, now: DateTime<Utc>) -> Option<usize> {
  owner_plan(owner, now).limits().channels
}

#[cfg(test)]
mod tests {
  use chrono::Duration;
  use chrono::Utc;

  use super::LimitError;
  use super::Plan;
  use super::TRIAL_BOT_LIMIT;
  use super::channel_limit;
  use super::can_link_bot;
  use super::effective_plan;
  use super::group_limit;
  use crate::models::UserRecord;

  fn user(trial_days: i64) -> UserRecord {
    UserRecord::new(1, None, "Ada".to_string(), Utc::now() + Duration::days(trial_days))
  }

  #[test]
  fn parses_plan_names() {
    assert_eq!("Premium".parse::<Plan>(), Ok(Plan::Premium));
    assert!("gold".parse::<Plan>().is_err());
  }

  #[test]
  fn trial_raises_bot_limit() {
    let now = Utc::now();
    let trial = user(14);
    assert!(can_link_bot(&trial, TRIAL_BOT_LIMIT - 1, now).is_ok());
    assert!(can_link_bot(&trial, TRIAL_BOT_LIMIT, now).is_err());

    let expired = user(-1);
    assert!(can_link_bot(&expired, 0, now).is_ok());
    assert_eq!(
      can_link_bot(&expired, 1, now),
      Err(LimitError::Bots {
        plan: Plan::Basic,
        limit: 1
      })
    );
  }

  #[test]
  fn expired_paid_plan_falls_back_to_basic() {
    let now = Utc::now();
    let mut record = user(-1);
    record.plan = Plan::Pro;
    record.plan_expires_at = Some(now - Duration::hours(1));
    assert_eq!(effective_plan(&record, now), Plan::Basic);
    assert_eq!(group_limit(Some(&record), now), Some(2));

    record.plan_expires_at = Some(now + Duration::days(3));
    assert_eq!(effective_plan(&record, now), Plan::Pro);
    assert_eq!(group_limit(Some(&record), now), Some(20));
  }

  #[test]
  fn ultimate_is_unlimited() {
    let now = Utc::now();
    let mut record = user(-1);
    record.plan = Plan::Ultimate;
    assert!(can_link_bot(&record, 500, now).is_ok());
    assert_eq!(group_limit(Some(&record), now), None);
    assert_eq!(channel_limit(Some(&record), now), None);
    assert_eq!(channel_limit(None, now), Some(1));
  }
}
