//! Periodic background jobs: deletions, captchas, scheduled posts, plans and operator alerts.

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::types::MessageId;
use teloxide::types::UserId;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::Config;
use crate::db::Db;
use crate::models::BotRecord;
use crate::models::BotStatus;
use crate::models::LogKind;
use crate::models::PlanRequest;
use crate::models::UserRecord;
use crate::notifier::Notifier;
use crate::plans::Plan;
use crate::supervisor::Supervisor;

const LAST_ALERT_KEY: &str = "last_alert_digest";
const EXPIRY_WARNING_DAYS: i64 = 3;

pub struct Scheduler {
  db: Db,
  supervisor: Supervisor,
  notifier: Notifier,
  deletion_grace: Duration,
  interval: StdDuration,
  alert_interval: StdDuration,
}

impl Scheduler {
  pub fn new(db: Db, supervisor: Supervisor, notifier: Notifier, config: &Config) -> Self {
    Self {
      db,
      supervisor,
      notifier,
      deletion_grace: config.deletion_grace,
      interval: config.scheduler_interval,
      alert_interval: config.alert_interval,
    }
  }

  /// Runs forever; the caller aborts the task on shutdown.
  pub async fn run(self) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_alert: Option<Instant> = None;
    info!(interval_secs = self.interval.as_secs(), "scheduler started");
    loop {
      ticker.tick().await;
      let now = Utc::now();
      self.tick(now).await;
      if last_alert.is_none_or(|at| at.elapsed() >= self.alert_interval) {
        last_alert = Some(Instant::now());
        self.supervisor.check_health().await;
        if let Err(err) = self.send_alerts(now).await {
          warn!(error = %format!("{err:#}"), "alert job failed");
        }
      }
    }
  }

  /// One pass over the short-period jobs; a failing job does not stop the others.
  #[instrument(skip(self))]
  pub async fn tick(&self, now: DateTime<Utc>) {
    if let Err(err) = self.finalize_deletions(now).await {
      warn!(error = %format!("{err:#}"), "deletion job failed");
    }
    if let Err(err) = self.expire_captchas(now).await {
      warn!(error = %format!("{err:#}"), "captcha job failed");
    }
    if let Err(err) = self.send_due_posts(now).await {
      warn!(error = %format!("{err:#}"), "scheduled post job failed");
    }
    if let Err(err) = self.downgrade_plans(now).await {
      warn!(error = %format!("{err:#}"), "plan expiry job failed");
    }
  }

  async fn finalize_deletions(&self, now: DateTime<Utc>) -> Result<usize> {
    let due = self.db.due_bot_deletions(now, self.deletion_grace).await?;
    for record in &due {
      self.supervisor.stop(&record.username).await;
      self.db.delete_bot(&record.username).await?;
      info!(bot = %record.username, owner_id = record.owner_id, "bot deletion finalized");
      self
        .notifier
        .record(
          LogKind::Deletion,
          &format!("@{} of user {} was deleted", record.username, record.owner_id),
        )
        .await;
      self
        .notifier
        .notify_user(
          record.owner_id,
          &format!("🗑️ @{} and its data were deleted.", record.username),
        )
        .await;
    }
    Ok(due.len())
  }

  async fn expire_captchas(&self, now: DateTime<Utc>) -> Result<usize> {
    let expired = self.db.expired_captchas(now).await?;
    let mut handled = 0;
    for captcha in &expired {
      // Challenges of stopped bots stay stored until the bot runs again.
      let Some(bot) = self.supervisor.bot(&captcha.bot).await else {
        debug!(bot = %captcha.bot, "captcha expired for a stopped bot");
        continue;
      };
      if self
        .db
        .take_captcha(&captcha.bot, captcha.chat_id, captcha.user_id)
        .await?
        .is_none()
      {
        continue;
      }
      handled += 1;
      let chat = ChatId(captcha.chat_id);
      let user = UserId(captcha.user_id as u64);
      let kicked = async {
        bot.ban_chat_member(chat, user).await?;
        bot.unban_chat_member(chat, user).only_if_banned(true).await?;
        if let Some(message_id) = captcha.message_id {
          bot.delete_message(chat, MessageId(message_id)).await?;
        }
        Ok::<(), teloxide::RequestError>(())
      }
      .await;
      match kicked {
        Ok(()) => info!(bot = %captcha.bot, chat_id = captcha.chat_id, user_id = captcha.user_id, "kicked unverified member"),
        Err(err) => warn!(bot = %captcha.bot, error = %err, "failed to kick unverified member"),
      }
    }
    Ok(handled)
  }

  async fn send_due_posts(&self, now: DateTime<Utc>) -> Result<usize> {
    let due = self.db.due_schedules(now).await?;
    let mut sent = 0usize;
    for post in &due {
      // delivery is best effort; a missed post waits for its next slot
      self.db.mark_schedule_sent(&post.bot, post.id, now).await?;
      let Some(bot) = self.supervisor.bot(&post.bot).await else {
        continue;
      };
      match bot.send_message(ChatId(post.chat_id), post.text.clone()).await {
        Ok(_) => sent += 1,
        Err(err) => warn!(bot = %post.bot, schedule_id = post.id, error = %err, "failed to send scheduled post"),
      }
    }
    if sent > 0 {
      info!(sent, "scheduled posts delivered");
    }
    Ok(sent)
  }

  async fn downgrade_plans(&self, now: DateTime<Utc>) -> Result<usize> {
    let expired = self.db.expired_plans(now).await?;
    for user in &expired {
      self.db.set_plan(user.id, Plan::Basic, None).await?;
      info!(user_id = user.id, previous = %user.plan, "plan expired");
      self
        .notifier
        .record(
          LogKind::Plan,
          &format!("plan {} of user {} expired; back to basic", user.plan, user.id),
        )
        .await;
      self
        .notifier
        .notify_user(
          user.id,
          &format!("⌛ Your {} plan expired. You are back on basic; /planinfo to renew.", user.plan),
        )
        .await;
    }
    Ok(expired.len())
  }

  async fn send_alerts(&self, now: DateTime<Utc>) -> Result<bool> {
    let bots = self.db.all_bots().await?;
    let requests = self.db.plan_requests().await?;
    let users = self.db.list_users().await?;
    let Some(digest) = compose_alert(&bots, &requests, &users, now) else {
      return Ok(false);
    };
    if self.db.get_meta(LAST_ALERT_KEY).await?.as_deref() == Some(digest.as_str()) {
      debug!("alert unchanged since last send");
      return Ok(false);
    }
    self.notifier.notify_admins(&digest).await;
    self.db.set_meta(LAST_ALERT_KEY, &digest).await?;
    Ok(true)
  }
}

/// Builds the operator digest, or `None` when there is nothing to report.
fn compose_alert(
  bots: &[BotRecord],
  requests: &[PlanRequest],
  users: &[UserRecord],
  now: DateTime<Utc>,
) -> Option<String> {
  let mut sections = Vec::new();

  let failed: Vec<String> = bots
    .iter()
    .filter(|bot| bot.status == BotStatus::Failed)
    .map(|bot| format!("• @{} (owner {})", bot.username, bot.owner_id))
    .collect();
  if !failed.is_empty() {
    sections.push(format!("🔴 Failed bots:\n{}", failed.join("\n")));
  }

  if !requests.is_empty() {
    let lines: Vec<String> = requests
      .iter()
      .map(|request| format!("• user {} wants {}", request.user_id, request.plan))
      .collect();
    sections.push(format!("💳 Pending plan requests:\n{}", lines.join("\n")));
  }

  let horizon = now + Duration::days(EXPIRY_WARNING_DAYS);
  let mut expiring: Vec<&UserRecord> = users
    .iter()
    .filter(|user| {
      user.plan.is_paid() && user.plan_expires_at.is_some_and(|at| at > now && at <= horizon)
    })
    .collect();
  expiring.sort_by_key(|user| user.id);
  if !expiring.is_empty() {
    let lines: Vec<String> = expiring
      .iter()
      .filter_map(|user| {
        let at = user.plan_expires_at?;
        Some(format!("• user {} ({}) on {}", user.id, user.plan, at.format("%Y-%m-%d")))
      })
      .collect();
    sections.push(format!("⌛ Plans expiring soon:\n{}", lines.join("\n")));
  }

  (!sections.is_empty()).then(|| format!("📣 Platform alerts\n\n{}", sections.join("\n\n")))
}

#[cfg(test)]
mod tests {
  use chrono::Duration;
  use chrono::Utc;

  use teloxide::Bot;

  use super::Scheduler;
  use super::compose_alert;
  use crate::db::Db;
  use crate::models::BotRecord;
  use crate::models::BotSettings;
  use crate::models::BotStatus;
  use crate::models::PendingCaptcha;
  use crate::models::PlanRequest;
  use crate::notifier::Notifier;
  use crate::supervisor::Supervisor;
  use crate::models::UserRecord;
  use crate::plans::Plan;

  fn bot(username: &str, status: BotStatus) -> BotRecord {
    BotRecord {
      username: username.to_string(),
      bot_id: 1,
      name: username.to_string(),
      token: "1:token".to_string(),
      owner_id: 7,
      created_at: Utc::now(),
      status,
      deletion_requested_at: None,
      groups: vec![],
      channels: vec![],
      settings: BotSettings::default(),
    }
  }

  #[tokio::test]
  async fn captchas_of_stopped_bots_are_kept() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path()).await.unwrap();
    let notifier = Notifier::new(Bot::new("1:test"), db.clone(), vec![]);
    let scheduler = Scheduler {
      db: db.clone(),
      supervisor: Supervisor::new(db.clone(), notifier.clone()),
      notifier,
      deletion_grace: Duration::hours(24),
      interval: std::time::Duration::from_secs(30),
      alert_interval: std::time::Duration::from_secs(3600),
    };
    let now = Utc::now();
    db.save_captcha(&PendingCaptcha {
      bot: "paused_bot".to_string(),
      chat_id: -9,
      user_id: 5,
      message_id: None,
      deadline: now - Duration::minutes(1),
    })
    .await
    .unwrap();
    assert_eq!(scheduler.expire_captchas(now).await.unwrap(), 0);
    assert_eq!(db.expired_captchas(now).await.unwrap().len(), 1);
    assert!(db.take_captcha("paused_bot", -9, 5).await.unwrap().is_some());
  }

  #[test]
  fn quiet_platform_has_no_alert() {
    let now = Utc::now();
    let bots = vec![bot("fine_bot", BotStatus::Active)];
    assert_eq!(compose_alert(&bots, &[], &[], now), None);
  }

  #[test]
  fn alert_lists_failures_requests_and_expiring_plans() {
    let now = Utc::now();
    let bots = vec![bot("fine_bot", BotStatus::Active), bot("dead_bot", BotStatus::Failed)];
    let requests = vec![PlanRequest {
      user_id: 9,
      plan: Plan::Pro,
      requested_at: now,
    }];
    let mut soon = UserRecord::new(11, None, "Ana".to_string(), now);
    soon.plan = Plan::Premium;
    soon.plan_expires_at = Some(now + Duration::days(2));
    let mut later = UserRecord::new(12, None, "Bo".to_string(), now);
    later.plan = Plan::Premium;
    later.plan_expires_at = Some(now + Duration::days(20));

    let alert = compose_alert(&bots, &requests, &[soon, later], now).unwrap();
    assert!(alert.contains("@dead_bot"));
    assert!(!alert.contains("@fine_bot"));
    assert!(alert.contains("user 9 wants pro"));
    assert!(alert.contains("user 11 (premium)"));
    assert!(!alert.contains("user 12"));
  }
}
