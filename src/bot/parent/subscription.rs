use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardButton;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::MessageId;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::SharedParent;
use super::menu;
use crate::bot::HandlerResult;
use crate::bot::i18n::Text;
use crate::bot::i18n::tr;
use crate::bot::ui;
use crate::models::Language;
use crate::models::LogKind;
use crate::models::UserRecord;
use crate::plans;
use crate::plans::Plan;
use crate::util::format_cents;

fn limit_label(limit: Option<usize>) -> String {
  limit.map_or_else(|| "∞".to_string(), |limit| limit.to_string())
}

fn plan_summary(account: &UserRecord, active_bots: usize, groups: usize, channels: usize) -> String {
  let now = Utc::now();
  let plan = plans::effective_plan(account, now);
  let limits = plan.limits();
  let mut lines = match account.language {
    Language::Fr => vec![format!("💳 Offre actuelle : <b>{plan}</b>")],
    Language::En => vec![format!("💳 Current plan: <b>{plan}</b>")],
  };
  if plan.is_paid()
    && let Some(expires) = account.plan_expires_at
  {
    lines.push(match account.language {
      Language::Fr => format!("Expire le {}", expires.format("%Y-%m-%d")),
      Language::En => format!("Expires {}", expires.format("%Y-%m-%d")),
    });
  }
  if plans::in_trial(account, now) {
    lines.push(match account.language {
      Language::Fr => format!("🎁 Essai jusqu'au {}", account.trial_ends_at.format("%Y-%m-%d")),
      Language::En => format!("🎁 Trial until {}", account.trial_ends_at.format("%Y-%m-%d")),
    });
  }
  lines.push(String::new());
  lines.push(format!(
    "🤖 {active_bots}/{}   👥 {groups}/{}   📢 {channels}/{}",
    limit_label(plans::bot_limit(account, now)),
    limit_label(limits.groups),
    limit_label(limits.channels)
  ));
  lines.join("\n")
}

fn upgrade_text(language: Language) -> String {
  let mut text = match language {
    Language::Fr => "⬆️ <b>Offres disponibles</b> (par mois)\n".to_string(),
    Language::En => "⬆️ <b>Available plans</b> (monthly)\n".to_string(),
  };
  for plan in Plan::ALL.into_iter().filter(|plan| plan.is_paid()) {
    let limits = plan.limits();
    text.push_str(&format!(
      "\n<b>{plan}</b> · {} €\n  🤖 {}  👥 {}  📢 {}",
      format_cents(plan.monthly_price_cents()),
      limit_label(limits.bots),
      limit_label(limits.groups),
      limit_label(limits.channels)
    ));
  }
  text
}

fn upgrade_keyboard(language: Language) -> InlineKeyboardMarkup {
  let mut rows: Vec<Vec<InlineKeyboardButton>> = Plan::ALL
    .into_iter()
    .filter(|plan| plan.is_paid())
    .map(|plan| vec![ui::button(format!("⭐ {plan}"), format!("plan:req:{plan}"))])
    .collect();
  rows.push(vec![ui::button(tr(language, Text::Back), "menu:plan")]);
  InlineKeyboardMarkup::new(rows)
}

pub async fn show_plan(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  target: Option<MessageId>,
  account: &UserRecord,
) -> HandlerResult {
  let language = account.language;
  let owned = ctx.db().bots_of_owner(account.id).await?;
  let active = owned.iter().filter(|record| !record.is_pending_deletion()).count();
  let groups = owned.iter().map(|record| record.groups.len()).max().unwrap_or(0);
  let channels = owned.iter().map(|record| record.channels.len()).max().unwrap_or(0);
  let upgrade = match language {
    Language::Fr => "⬆️ Changer d'offre",
    Language::En => "⬆️ Upgrade",
  };
  let keyboard = InlineKeyboardMarkup::new(vec![
    vec![ui::button(upgrade, "plan:upgrade")],
    vec![ui::button(tr(language, Text::Back), "menu:main")],
  ]);
  ui::show_menu(
    bot,
    chat,
    target,
    plan_summary(account, active, groups, channels),
    keyboard,
  )
  .await
}

fn parse_approval(value: &str) -> Option<(i64, Plan)> {
  let (user, plan) = value.split_once(':')?;
  Some((user.parse().ok()?, plan.parse().ok()?))
}

/// Handles `plan:*` callbacks: the upgrade list, a user's request and an operator's approval.
#[instrument(skip(bot, ctx, account))]
pub async fn on_plan_callback(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  value: &str,
) -> anyhow::Result<Option<String>> {
  let language = account.language;
  if value == "upgrade" {
    ui::edit_menu(bot, chat, message_id, upgrade_text(language), upgrade_keyboard(language)).await?;
    return Ok(None);
  }
  if let Some(raw) = value.strip_prefix("req:") {
    let Ok(plan) = raw.parse::<Plan>() else {
      return Ok(None);
    };
    if !plan.is_paid() {
      return Ok(None);
    }
    return request_plan(bot, ctx, chat, message_id, account, plan).await.map(Some);
  }
  if let Some(raw) = value.strip_prefix("ok:") {
    if !ctx.is_admin(account.id) {
      warn!(user_id = account.id, "non-operator tried to approve a plan");
      return Ok(None);
    }
    let Some((user_id, plan)) = parse_approval(raw) else {
      return Ok(None);
    };
    return approve_plan(bot, ctx, chat, message_id, account, user_id, plan).await.map(Some);
  }
  Ok(None)
}

async fn request_plan(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  plan: Plan,
) -> anyhow::Result<String> {
  let language = account.language;
  ctx.db().create_plan_request(account.id, plan).await?;
  info!(user_id = account.id, plan = %plan, "plan upgrade requested");
  let who = account
    .username
    .as_deref()
    .map_or_else(|| account.first_name.clone(), |name| format!("@{name}"));
  let request = format!(
    "💳 {who} ({}) requests the {plan} plan ({} €/month).",
    account.id,
    format_cents(plan.monthly_price_cents())
  );
  let approve = ui::single_button(format!("✅ Approve {plan}"), format!("plan:ok:{}:{plan}", account.id));
  for admin in ctx.notifier().admin_ids() {
    if let Err(err) = ctx
      .notifier()
      .bot()
      .send_message(ChatId(admin), request.clone())
      .reply_markup(approve.clone())
      .await
    {
      warn!(error = %err, admin_id = admin, "failed to forward plan request");
    }
  }
  if let Err(err) = ctx.db().append_log(LogKind::Plan, &request).await {
    warn!(error = %err, "failed to log plan request");
  }
  let text = match language {
    Language::Fr => format!("📨 Demande envoyée pour l'offre {plan}. Un opérateur vous contactera pour le paiement."),
    Language::En => format!("📨 Request sent for the {plan} plan. An operator will contact you about payment."),
  };
  ui::edit_menu(bot, chat, message_id, text.clone(), menu::back_keyboard(language)).await?;
  Ok(text)
}

async fn approve_plan(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  admin: &UserRecord,
  user_id: i64,
  plan: Plan,
) -> anyhow::Result<String> {
  let summary = grant_plan(ctx, admin, user_id, plan, None).await?;
  ui::edit_menu(bot, chat, message_id, summary.clone(), InlineKeyboardMarkup::default()).await?;
  Ok(summary)
}

fn paid_until(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
  Duration::try_days(days).and_then(|span| now.checked_add_signed(span))
}

/// Applies a plan change and tells the user; `days` defaults to the configured plan duration.
#[instrument(skip(ctx, admin), fields(admin_id = admin.id))]
pub async fn grant_plan(
  ctx: &SharedParent,
  admin: &UserRecord,
  user_id: i64,
  plan: Plan,
  days: Option<i64>,
) -> anyhow::Result<String> {
  let expires_at = if plan.is_paid() {
    let days = days.unwrap_or(ctx.config().plan_duration_days);
    let Some(until) = paid_until(Utc::now(), days) else {
      warn!(user_id, days, "plan duration out of range");
      return Ok(format!("❌ A plan of {days} days cannot be granted."));
    };
    Some(until)
  } else {
    None
  };
  let Some(user) = ctx.db().set_plan(user_id, plan, expires_at).await? else {
    return Ok(format!("❓ Unknown user {user_id}"));
  };
  ctx.db().take_plan_request(user_id).await?;
  info!(user_id, plan = %plan, "plan granted");
  let until = expires_at.map(|at| at.format("%Y-%m-%d").to_string());
  let notice = match (user.language, &until) {
    (Language::Fr, Some(until)) => format!("🎉 Votre offre {plan} est active jusqu'au {until}."),
    (Language::En, Some(until)) => format!("🎉 Your {plan} plan is active until {until}."),
    (Language::Fr, None) => format!("Votre offre est maintenant {plan}."),
    (Language::En, None) => format!("Your plan is now {plan}."),
  };
  ctx.notifier().notify_user(user_id, &notice).await;
  let summary = format!(
    "✅ {plan} granted to {user_id}{}",
    until.map(|until| format!(" until {until}")).unwrap_or_default()
  );
  if let Err(err) = ctx
    .db()
    .append_log(LogKind::Plan, &format!("{summary} by {}", admin.id))
    .await
  {
    warn!(error = %err, "failed to log plan change");
  }
  Ok(summary)
}

#[cfg(test)]
mod tests {
  use chrono::Duration;
  use chrono::Utc;

  use super::paid_until;
  use super::parse_approval;
  use super::plan_summary;
  use super::upgrade_keyboard;
  use crate::models::Language;
  use crate::models::UserRecord;
  use crate::plans::Plan;

  #[test]
  fn approval_payload_parses_user_and_plan() {
    assert_eq!(parse_approval("42:pro"), Some((42, Plan::Pro)));
    assert_eq!(parse_approval("x:pro"), None);
    assert_eq!(parse_approval("42:gold"), None);
  }

  #[test]
  fn paid_period_rejects_unrepresentable_lengths() {
    let now = Utc::now();
    assert_eq!(paid_until(now, 30), Some(now + Duration::days(30)));
    assert_eq!(paid_until(now, 100_000_000), None);
    assert_eq!(paid_until(now, i64::MAX), None);
  }

  #[test]
  fn upgrade_offers_only_paid_plans() {
    let data: Vec<String> = upgrade_keyboard(Language::En)
      .inline_keyboard
      .into_iter()
      .flatten()
      .filter_map(|button| match button.kind {
        teloxide::types::InlineKeyboardButtonKind::CallbackData(data) => Some(data),
        _ => None,
      })
      .collect();
    assert!(!data.contains(&"plan:req:basic".to_string()));
    assert!(data.contains(&"plan:req:ultimate".to_string()));
  }

  #[test]
  fn summary_shows_trial_limit() {
    let user = UserRecord::new(1, None, "Ann".to_string(), Utc::now() + Duration::days(3));
    let text = plan_summary(&user, 2, 0, 0);
    assert!(text.contains("basic"));
    assert!(text.contains("2/10"));
  }
}
