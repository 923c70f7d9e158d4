use std::collections::HashSet;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bot::ui::broadcast_text;
use crate::db::Db;
use crate::models::LogKind;

/// Delivers operator alerts and owner notices through the parent bot.
#[derive(Clone)]
pub struct Notifier {
  bot: Bot,
  db: Db,
  admins: Arc<HashSet<i64>>,
}

impl Notifier {
  pub fn new(bot: Bot, db: Db, admins: Vec<i64>) -> Self {
    Self {
      bot,
      db,
      admins: Arc::new(admins.into_iter().collect()),
    }
  }

  pub fn bot(&self) -> &Bot {
    &self.bot
  }

  pub fn is_admin(&self, tg_id: i64) -> bool {
    self.admins.contains(&tg_id)
  }

  pub fn admin_ids(&self) -> Vec<i64> {
    let mut ids: Vec<i64> = self.admins.iter().copied().collect();
    ids.sort_unstable();
    ids
  }

  #[instrument(skip(self, text))]
  pub async fn notify_admins(&self, text: &str) -> usize {
    let delivered = broadcast_text(&self.bot, &self.admin_ids(), text).await;
    info!(delivered, "notified operators");
    delivered
  }

  /// Logs the event for the dashboard and forwards it to operators.
  #[instrument(skip(self, text))]
  pub async fn record(&self, kind: LogKind, text: &str) {
    if let Err(err) = self.db.append_log(kind, text).await {
      warn!(error = %err, "failed to append operator log");
    }
    if matches!(kind, LogKind::Violation | LogKind::Error | LogKind::Plan) {
      self.notify_admins(&format!("🚨 {text}")).await;
    }
  }

  #[instrument(skip(self, text))]
  pub async fn notify_user(&self, user_id: i64, text: &str) -> bool {
    match self.bot.send_message(ChatId(user_id), text.to_string()).await {
      Ok(_) => true,
      Err(err) => {
        warn!(error = %err, target_user_id = user_id, "failed to notify user");
        false
      },
    }
  }
}
