use anyhow::Context;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::Message;
use teloxide::types::MessageId;
use teloxide::utils::html;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::ParentDialogue;
use super::ParentState;
use super::SharedParent;
use super::menu;
use super::subscription;
use crate::bot::HandlerResult;
use crate::bot::i18n::Text;
use crate::bot::i18n::tr;
use crate::bot::ui;
use crate::models::BotStatus;
use crate::models::LogEntry;
use crate::models::LogKind;
use crate::models::PlatformStats;
use crate::models::UserRecord;
use crate::plans::Plan;
use crate::util::truncate_text;

const RECENT_LOGS: usize = 20;
const MAX_LISTED_BOTS: usize = 60;
const MAX_PLAN_DAYS: i64 = 3650;

fn dashboard_keyboard(account: &UserRecord) -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![
    vec![
      ui::button("🤖 Bots", "admin:bots"),
      ui::button("📜 Logs", "admin:logs"),
    ],
    vec![ui::button(tr(account.language, Text::Back), "menu:main")],
  ])
}

fn admin_back_keyboard() -> InlineKeyboardMarkup {
  ui::single_button("⬅️", "admin:main")
}

fn render_stats(stats: &PlatformStats, running: usize, pending_requests: usize) -> String {
  let mut text = format!(
    "🛠️ <b>Dashboard</b>\n\n👤 Users: {}\n🤖 Bots: {} ({running} running, {} failed)\n🗑️ Pending deletions: {}\n👥 Groups: {}\n💳 Plan requests: {pending_requests}\n",
    stats.users, stats.bots, stats.failed_bots, stats.pending_deletions, stats.groups
  );
  for (plan, count) in &stats.plans {
    text.push_str(&format!("\n{plan}: {count}"));
  }
  text
}

fn log_icon(kind: LogKind) -> &'static str {
  match kind {
    LogKind::Info => "ℹ️",
    LogKind::Violation => "🚨",
    LogKind::Deletion => "🗑️",
    LogKind::Plan => "💳",
    LogKind::Error => "❌",
  }
}

fn render_logs(entries: &[LogEntry]) -> String {
  if entries.is_empty() {
    return "📜 No events yet.".to_string();
  }
  let mut text = "📜 <b>Recent events</b>\n".to_string();
  for entry in entries {
    text.push_str(&format!(
      "\n{} {} {}",
      log_icon(entry.kind),
      entry.at.format("%m-%d %H:%M"),
      html::escape(&truncate_text(&entry.text, 160))
    ));
  }
  text
}

#[instrument(skip(bot, ctx, account), fields(user_id = account.id))]
pub async fn show_dashboard(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  target: Option<MessageId>,
  account: &UserRecord,
) -> HandlerResult {
  if !ctx.is_admin(account.id) {
    warn!("non-operator asked for the dashboard");
    return Ok(());
  }
  let stats = ctx.db().platform_stats().await?;
  let running = ctx.supervisor().running().await.len();
  let requests = ctx.db().plan_requests().await?.len();
  ui::show_menu(
    bot,
    chat,
    target,
    render_stats(&stats, running, requests),
    dashboard_keyboard(account),
  )
  .await
}

#[instrument(skip(bot, ctx, account), fields(user_id = account.id))]
pub async fn on_admin_callback(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  value: &str,
) -> HandlerResult {
  if !ctx.is_admin(account.id) {
    warn!("non-operator pressed an operator button");
    return Ok(());
  }
  match value {
    "main" => show_dashboard(bot, ctx, chat, Some(message_id), account).await,
    "bots" => {
      let records = ctx.db().all_bots().await?;
      let running = ctx.supervisor().running().await;
      let mut text = format!("🤖 <b>Bots</b> ({})\n", records.len());
      for record in records.iter().take(MAX_LISTED_BOTS) {
        let state = if record.is_pending_deletion() {
          "🗑️"
        } else if record.status == BotStatus::Failed {
          "🔴"
        } else if running.contains(&record.username) {
          "🟢"
        } else {
          "⚪"
        };
        text.push_str(&format!(
          "\n{state} @{} · owner <code>{}</code> · 👥 {}",
          html::escape(&record.username),
          record.owner_id,
          record.groups.len()
        ));
      }
      ui::edit_menu(bot, chat, message_id, text, admin_back_keyboard()).await
    },
    "logs" => {
      let entries = ctx.db().recent_logs(RECENT_LOGS).await?;
      ui::edit_menu(bot, chat, message_id, render_logs(&entries), admin_back_keyboard()).await
    },
    _ => Ok(()),
  }
}

pub async fn start_broadcast(
  bot: &Bot,
  dialogue: &ParentDialogue,
  ctx: &SharedParent,
  chat: ChatId,
  account: &UserRecord,
) -> HandlerResult {
  if !ctx.is_admin(account.id) {
    return Ok(());
  }
  dialogue
    .update(ParentState::Broadcast { admin_id: account.id })
    .await?;
  bot
    .send_message(chat, "📣 Send the announcement text for every user (or /cancel).")
    .await?;
  Ok(())
}

#[instrument(skip(bot, dialogue, ctx, msg))]
pub async fn receive_broadcast(
  bot: &Bot,
  dialogue: &ParentDialogue,
  ctx: &SharedParent,
  msg: &Message,
  admin_id: i64,
) -> HandlerResult {
  let Some(text) = ui::trimmed_text(msg) else {
    bot.send_message(msg.chat.id, "Text only, please (or /cancel).").await?;
    return Ok(());
  };
  dialogue.reset().await?;
  if ui::is_cancel(text) {
    let user = msg.from.as_ref().context("message missing sender")?;
    let account = menu::account_for(ctx, user).await?;
    bot.send_message(msg.chat.id, tr(account.language, Text::Cancelled)).await?;
    return Ok(());
  }
  if !ctx.is_admin(admin_id) {
    return Ok(());
  }
  let recipients: Vec<i64> = ctx
    .db()
    .list_users()
    .await?
    .into_iter()
    .map(|user| user.id)
    .collect();
  let delivered = ui::broadcast_text(bot, &recipients, text).await;
  info!(delivered, total = recipients.len(), "broadcast sent");
  ctx
    .notifier()
    .record(
      LogKind::Info,
      &format!("broadcast by {admin_id} delivered to {delivered}/{}", recipients.len()),
    )
    .await;
  bot
    .send_message(
      msg.chat.id,
      format!("📣 Delivered to {delivered}/{} users.", recipients.len()),
    )
    .await?;
  Ok(())
}

fn parse_set_plan(args: &str) -> Option<(i64, Plan, Option<i64>)> {
  let mut parts = args.split_whitespace();
  let user_id = parts.next()?.parse().ok()?;
  let plan = parts.next()?.parse().ok()?;
  let days = match parts.next() {
    Some(raw) => Some(
      raw
        .parse::<i64>()
        .ok()
        .filter(|days| (1 ..= MAX_PLAN_DAYS).contains(days))?,
    ),
    None => None,
  };
  if parts.next().is_some() {
    return None;
  }
  Some((user_id, plan, days))
}

/// `/setplan <user_id> <plan> [days]`
#[instrument(skip(bot, ctx, account), fields(user_id = account.id))]
pub async fn set_plan(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  account: &UserRecord,
  args: &str,
) -> HandlerResult {
  if !ctx.is_admin(account.id) {
    return Ok(());
  }
  let Some((user_id, plan, days)) = parse_set_plan(args) else {
    let plans: Vec<&str> = Plan::ALL.into_iter().map(Plan::as_str).collect();
    bot
      .send_message(
        chat,
        format!(
          "Usage: /setplan <user_id> <plan> [1-{MAX_PLAN_DAYS} days]\nPlans: {}",
          plans.join(", ")
        ),
      )
      .await?;
    return Ok(());
  };
  let summary = subscription::grant_plan(ctx, account, user_id, plan, days).await?;
  bot.send_message(chat, summary).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use uuid::Uuid;

  use super::parse_set_plan;
  use super::render_logs;
  use super::render_stats;
  use crate::models::LogEntry;
  use crate::models::LogKind;
  use crate::models::PlatformStats;
  use crate::plans::Plan;

  #[test]
  fn set_plan_arguments() {
    assert_eq!(parse_set_plan("42 pro"), Some((42, Plan::Pro, None)));
    assert_eq!(parse_set_plan("42 premium 90"), Some((42, Plan::Premium, Some(90))));
    assert_eq!(parse_set_plan("42 premium 0"), None);
    assert_eq!(parse_set_plan("42 pro 3650"), Some((42, Plan::Pro, Some(3650))));
    assert_eq!(parse_set_plan("42 pro 3651"), None);
    assert_eq!(parse_set_plan("42 pro 100000000"), None);
    assert_eq!(parse_set_plan("42"), None);
    assert_eq!(parse_set_plan("abc pro"), None);
    assert_eq!(parse_set_plan("42 pro 30 extra"), None);
  }

  #[test]
  fn stats_list_plans_and_running_bots() {
    let stats = PlatformStats {
      users: 3,
      bots: 2,
      failed_bots: 1,
      pending_deletions: 0,
      groups: 4,
      plans: vec![(Plan::Basic, 2), (Plan::Pro, 1)],
    };
    let text = render_stats(&stats, 1, 0);
    assert!(text.contains("1 running"));
    assert!(text.contains("pro: 1"));
  }

  #[test]
  fn logs_are_escaped() {
    let entries = vec![LogEntry {
      id: Uuid::new_v4(),
      kind: LogKind::Violation,
      text: "<script>".to_string(),
      at: Utc::now(),
    }];
    let text = render_logs(&entries);
    assert!(text.contains("&lt;script&gt;"));
    assert!(text.starts_with("📜"));
  }
}
