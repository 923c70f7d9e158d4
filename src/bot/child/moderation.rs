use std::time::Instant;

use anyhow::Context;
use chrono::Duration;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::sugar::request::RequestReplyExt;
use teloxide::types::CallbackQuery;
use teloxide::types::ChatId;
use teloxide::types::ChatPermissions;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::Me;
use teloxide::types::Message;
use teloxide::types::MessageId;
use teloxide::types::UserId;
use teloxide::utils::html;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::SharedChild;
use crate::bot::HandlerResult;
use crate::bot::ui;
use crate::db::Registration;
use crate::models::GroupRecord;
use crate::models::LogKind;
use crate::models::PendingCaptcha;
use crate::moderation::CAPTCHA_TIMEOUT_SECS;
use crate::moderation::DEFAULT_MUTE_MINUTES;
use crate::moderation::find_banned_word;
use crate::moderation::format_duration;
use crate::moderation::is_low_variety;
use crate::moderation::normalize_banned_word;
use crate::moderation::parse_moderation_args;
use crate::plans;

const MAX_WARN_LIMIT: u32 = 20;

fn is_group_chat(msg: &Message) -> bool {
  msg.chat.is_group() || msg.chat.is_supergroup()
}

fn uid(user_id: i64) -> UserId {
  UserId(user_id as u64)
}

async fn is_privileged(bot: &Bot, chat: ChatId, user_id: i64) -> anyhow::Result<bool> {
  let member = bot.get_chat_member(chat, uid(user_id)).await?;
  Ok(member.is_privileged())
}

/// Replies and returns `false` unless this is a group and the sender administers it.
async fn require_group_admin(bot: &Bot, msg: &Message) -> anyhow::Result<bool> {
  if !is_group_chat(msg) {
    bot
      .send_message(msg.chat.id, "This command only works in groups.")
      .await?;
    return Ok(false);
  }
  let user_id = ui::sender_id(msg).context("message missing sender")?;
  if is_privileged(bot, msg.chat.id, user_id).await? {
    return Ok(true);
  }
  bot
    .send_message(msg.chat.id, "🛡️ Only group admins can do that.")
    .reply_to(msg.id)
    .await?;
  Ok(false)
}

/// Explicit id in the arguments wins over the replied-to message's author.
fn resolve_target(msg: &Message, explicit: Option<i64>) -> Option<(i64, String)> {
  if let Some(id) = explicit {
    return Some((id, id.to_string()));
  }
  let author = msg.reply_to_message()?.from.as_ref()?;
  Some((author.id.0 as i64, author.first_name.clone()))
}

/// Looks up the target and refuses to act on other admins.
async fn target_or_usage(
  bot: &Bot,
  msg: &Message,
  explicit: Option<i64>,
  usage: &str,
) -> anyhow::Result<Option<(i64, String)>> {
  let Some((target, name)) = resolve_target(msg, explicit) else {
    bot.send_message(msg.chat.id, usage).await?;
    return Ok(None);
  };
  if is_privileged(bot, msg.chat.id, target).await.unwrap_or(false) {
    bot
      .send_message(msg.chat.id, "I will not act against an admin.")
      .await?;
    return Ok(None);
  }
  Ok(Some((target, name)))
}

async fn group_settings(ctx: &SharedChild, msg: &Message) -> anyhow::Result<GroupRecord> {
  let chat_id = msg.chat.id.0;
  if let Some(group) = ctx.db().get_group(ctx.username(), chat_id).await? {
    return Ok(group);
  }
  Ok(GroupRecord::new(
    ctx.username(),
    chat_id,
    msg.chat.title().unwrap_or_default().to_string(),
  ))
}

#[instrument(skip(bot, ctx, msg))]
pub async fn kick(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let parsed = parse_moderation_args(args);
  let Some((target, name)) = target_or_usage(bot, msg, parsed.target, "Reply to a message or use /kick <user id>.").await?
  else {
    return Ok(());
  };
  bot.ban_chat_member(msg.chat.id, uid(target)).await?;
  bot
    .unban_chat_member(msg.chat.id, uid(target))
    .only_if_banned(true)
    .await?;
  info!(bot = ctx.username(), target_id = target, "kicked member");
  bot
    .send_message(msg.chat.id, format!("👢 {name} was removed from the group."))
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn ban(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let parsed = parse_moderation_args(args);
  let Some((target, name)) = target_or_usage(
    bot,
    msg,
    parsed.target,
    "Reply to a message or use /ban <user id> [1d] [reason].",
  )
  .await?
  else {
    return Ok(());
  };
  let mut request = bot.ban_chat_member(msg.chat.id, uid(target));
  if let Some(duration) = parsed.duration {
    request = request.until_date(Utc::now() + duration);
  }
  request.await?;
  ctx
    .db()
    .clear_warnings(ctx.username(), msg.chat.id.0, target)
    .await?;
  info!(target_id = target, duration = ?parsed.duration, "banned member");
  let span = parsed
    .duration
    .map(|duration| format!(" for {}", format_duration(duration)))
    .unwrap_or_default();
  let reason = parsed
    .reason
    .map(|reason| format!("\nReason: {reason}"))
    .unwrap_or_default();
  bot
    .send_message(msg.chat.id, format!("🔨 {name} was banned{span}.{reason}"))
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn unban(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let Some(target) = args.trim().parse::<i64>().ok() else {
    bot.send_message(msg.chat.id, "Usage: /unban <user id>").await?;
    return Ok(());
  };
  bot
    .unban_chat_member(msg.chat.id, uid(target))
    .only_if_banned(true)
    .await?;
  info!(bot = ctx.username(), target_id = target, "unbanned member");
  bot
    .send_message(msg.chat.id, format!("✅ {target} may join again."))
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn mute(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let parsed = parse_moderation_args(args);
  let Some((target, name)) = target_or_usage(
    bot,
    msg,
    parsed.target,
    "Reply to a message or use /mute <user id> [30m].",
  )
  .await?
  else {
    return Ok(());
  };
  let duration = parsed
    .duration
    .unwrap_or_else(|| Duration::minutes(DEFAULT_MUTE_MINUTES));
  bot
    .restrict_chat_member(msg.chat.id, uid(target), ChatPermissions::empty())
    .until_date(Utc::now() + duration)
    .await?;
  info!(bot = ctx.username(), target_id = target, minutes = duration.num_minutes(), "muted member");
  bot
    .send_message(
      msg.chat.id,
      format!("🔇 {name} is muted for {}.", format_duration(duration)),
    )
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn unmute(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let parsed = parse_moderation_args(args);
  let Some((target, name)) = resolve_target(msg, parsed.target) else {
    bot
      .send_message(msg.chat.id, "Reply to a message or use /unmute <user id>.")
      .await?;
    return Ok(());
  };
  bot
    .restrict_chat_member(msg.chat.id, uid(target), ChatPermissions::all())
    .await?;
  info!(bot = ctx.username(), target_id = target, "unmuted member");
  bot
    .send_message(msg.chat.id, format!("🔊 {name} can talk again."))
    .await?;
  Ok(())
}

/// Adds a warning and bans once the group's limit is reached.
async fn apply_warning(
  bot: &Bot,
  ctx: &SharedChild,
  chat: ChatId,
  group: &GroupRecord,
  target: i64,
  name: &str,
  reason: &str,
) -> HandlerResult {
  let count = ctx
    .db()
    .add_warning(ctx.username(), chat.0, target, reason)
    .await?;
  info!(target_id = target, count, limit = group.max_warnings, "warned member");
  if count >= group.max_warnings {
    bot.ban_chat_member(chat, uid(target)).await?;
    ctx.db().clear_warnings(ctx.username(), chat.0, target).await?;
    bot
      .send_message(
        chat,
        format!("🔨 {name} reached {count} warnings and was banned."),
      )
      .await?;
  } else {
    bot
      .send_message(
        chat,
        format!("⚠️ {name} warned ({count}/{}): {reason}", group.max_warnings),
      )
      .await?;
  }
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn warn_member(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let parsed = parse_moderation_args(args);
  let Some((target, name)) = target_or_usage(
    bot,
    msg,
    parsed.target,
    "Reply to a message or use /warn <user id> [reason].",
  )
  .await?
  else {
    return Ok(());
  };
  let group = group_settings(ctx, msg).await?;
  let reason = parsed.reason.unwrap_or_else(|| "no reason given".to_string());
  apply_warning(bot, ctx, msg.chat.id, &group, target, &name, &reason).await
}

#[instrument(skip(bot, ctx, msg))]
pub async fn clear_warns(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let parsed = parse_moderation_args(args);
  let Some((target, name)) = resolve_target(msg, parsed.target) else {
    bot
      .send_message(msg.chat.id, "Reply to a message or use /clearwarns <user id>.")
      .await?;
    return Ok(());
  };
  ctx
    .db()
    .clear_warnings(ctx.username(), msg.chat.id.0, target)
    .await?;
  bot
    .send_message(msg.chat.id, format!("🧹 Warnings of {name} cleared."))
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn ban_word(bot: &Bot, ctx: &SharedChild, msg: &Message, word: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let Some(word) = normalize_banned_word(word) else {
    bot
      .send_message(msg.chat.id, "Usage: /banword <single word>")
      .await?;
    return Ok(());
  };
  if !ensure_group(bot, ctx, msg).await? {
    return Ok(());
  }
  let stored = word.clone();
  ctx
    .db()
    .update_group(ctx.username(), msg.chat.id.0, |group| {
      if !group.banned_words.contains(&stored) {
        group.banned_words.push(stored);
      }
    })
    .await?;
  bot
    .send_message(msg.chat.id, format!("🚫 Messages containing \"{word}\" will be removed."))
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn unban_word(bot: &Bot, ctx: &SharedChild, msg: &Message, word: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let Some(word) = normalize_banned_word(word) else {
    bot
      .send_message(msg.chat.id, "Usage: /unbanword <single word>")
      .await?;
    return Ok(());
  };
  let updated = ctx
    .db()
    .update_group(ctx.username(), msg.chat.id.0, |group| {
      group.banned_words.retain(|banned| banned != &word);
    })
    .await?;
  let reply = if updated.is_some() {
    format!("✅ \"{word}\" is allowed again.")
  } else {
    "This group has no banned words.".to_string()
  };
  bot.send_message(msg.chat.id, reply).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn set_warn_limit(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let Some(limit) = args
    .trim()
    .parse::<u32>()
    .ok()
    .filter(|limit| (1 ..= MAX_WARN_LIMIT).contains(limit))
  else {
    bot
      .send_message(msg.chat.id, format!("Usage: /setwarnlimit <1-{MAX_WARN_LIMIT}>"))
      .await?;
    return Ok(());
  };
  if !ensure_group(bot, ctx, msg).await? {
    return Ok(());
  }
  ctx
    .db()
    .update_group(ctx.username(), msg.chat.id.0, |group| group.max_warnings = limit)
    .await?;
  bot
    .send_message(msg.chat.id, format!("✅ Members are banned after {limit} warnings."))
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn set_captcha(bot: &Bot, ctx: &SharedChild, msg: &Message, mode: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let enabled = match mode.trim().to_ascii_lowercase().as_str() {
    "on" => true,
    "off" => false,
    _ => {
      bot.send_message(msg.chat.id, "Usage: /captcha on|off").await?;
      return Ok(());
    },
  };
  if !ensure_group(bot, ctx, msg).await? {
    return Ok(());
  }
  ctx
    .db()
    .update_group(ctx.username(), msg.chat.id.0, |group| group.captcha = enabled)
    .await?;
  let reply = if enabled {
    "🤖 New members must now confirm they are human."
  } else {
    "Captcha disabled."
  };
  bot.send_message(msg.chat.id, reply).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn rules(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let group = group_settings(ctx, msg).await?;
  let words = if group.banned_words.is_empty() {
    "none".to_string()
  } else {
    html::escape(&group.banned_words.join(", "))
  };
  let text = format!(
    "🛡️ <b>Moderation</b>\n\nWarnings before ban: {}\nCaptcha: {}\nBanned words: {}",
    group.max_warnings,
    if group.captcha { "on" } else { "off" },
    words
  );
  ui::send_html(bot, msg.chat.id, text).await
}

#[instrument(skip(bot, ctx, msg))]
pub async fn pin(bot: &Bot, ctx: &SharedChild, msg: &Message, text: &str) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  let message_id = if let Some(reply) = msg.reply_to_message() {
    reply.id
  } else if !text.trim().is_empty() {
    bot.send_message(msg.chat.id, text.trim().to_string()).await?.id
  } else {
    bot
      .send_message(msg.chat.id, "Reply to a message with /pin, or use /pin <text>.")
      .await?;
    return Ok(());
  };
  bot.pin_chat_message(msg.chat.id, message_id).await?;
  info!(bot = ctx.username(), message_id = message_id.0, "pinned message");
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn unpin(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  if !require_group_admin(bot, msg).await? {
    return Ok(());
  }
  bot.unpin_chat_message(msg.chat.id).await?;
  info!(bot = ctx.username(), "unpinned message");
  bot.send_message(msg.chat.id, "📌 Unpinned.").await?;
  Ok(())
}

/// Registers the group under the owner's plan; leaves it when the plan is full.
async fn ensure_group(bot: &Bot, ctx: &SharedChild, msg: &Message) -> anyhow::Result<bool> {
  let chat_id = msg.chat.id.0;
  let now = Utc::now();
  let owner = ctx.db().get_user(ctx.owner_id()).await?;
  let limit = plans::group_limit(owner.as_ref(), now);
  let title = msg.chat.title().unwrap_or_default();
  let registration = ctx
    .db()
    .register_group(ctx.username(), chat_id, title, limit)
    .await?;
  match registration {
    Registration::Existing => Ok(true),
    Registration::New => {
      info!(chat_id, title, "registered group");
      Ok(true)
    },
    Registration::LimitReached => {
      let limit = limit.unwrap_or_default();
      bot
        .send_message(
          msg.chat.id,
          format!(
            "This bot's plan allows {limit} groups. The owner can upgrade from the platform bot. Leaving now."
          ),
        )
        .await?;
      bot.leave_chat(msg.chat.id).await?;
      ctx
        .notifier()
        .record(
          LogKind::Violation,
          &format!(
            "@{} (owner {}) exceeded its group limit of {limit} with chat {chat_id} \"{title}\"",
            ctx.username(),
            ctx.owner_id()
          ),
        )
        .await;
      ctx
        .notifier()
        .notify_user(
          ctx.owner_id(),
          &format!(
            "⚠️ @{} left \"{title}\": your plan allows {limit} groups. Use /planinfo to upgrade.",
            ctx.username()
          ),
        )
        .await;
      Ok(false)
    },
  }
}

/// Forgets a group once this bot is removed from it, freeing a slot of the owner's plan.
#[instrument(skip(ctx, me, msg))]
pub async fn on_left_member(ctx: &SharedChild, me: &Me, msg: &Message) -> HandlerResult {
  let Some(left) = msg.left_chat_member() else {
    return Ok(());
  };
  if left.id != me.id {
    return Ok(());
  }
  if ctx.db().remove_group(ctx.username(), msg.chat.id.0).await? {
    info!(chat_id = msg.chat.id.0, "bot removed from group");
  }
  Ok(())
}

#[instrument(skip(bot, ctx, me, msg))]
pub async fn on_new_members(bot: &Bot, ctx: &SharedChild, me: &Me, msg: &Message) -> HandlerResult {
  if !is_group_chat(msg) {
    return Ok(());
  }
  let Some(members) = msg.new_chat_members() else {
    return Ok(());
  };
  if members.iter().any(|member| member.id == me.id) {
    if ensure_group(bot, ctx, msg).await? {
      bot
        .send_message(
          msg.chat.id,
          "👋 Hello! Make me an admin so I can moderate. Group admins can use /rules, /captcha on, /banword.",
        )
        .await?;
    }
    return Ok(());
  }
  if !ensure_group(bot, ctx, msg).await? {
    return Ok(());
  }
  let group = group_settings(ctx, msg).await?;
  if !group.captcha {
    return Ok(());
  }
  for member in members.iter().filter(|member| !member.is_bot) {
    let user_id = member.id.0 as i64;
    bot
      .restrict_chat_member(msg.chat.id, member.id, ChatPermissions::empty())
      .await?;
    let keyboard = InlineKeyboardMarkup::new(vec![vec![ui::button(
      "✅ I am human",
      format!("verify:{}:{user_id}", msg.chat.id.0),
    )]]);
    let sent = bot
      .send_message(
        msg.chat.id,
        format!(
          "👋 Welcome {}! Press the button within {} minutes to be able to write.",
          member.first_name,
          CAPTCHA_TIMEOUT_SECS / 60
        ),
      )
      .reply_markup(keyboard)
      .await?;
    ctx
      .db()
      .save_captcha(&PendingCaptcha {
        bot: ctx.username().to_string(),
        chat_id: msg.chat.id.0,
        user_id,
        message_id: Some(sent.id.0),
        deadline: Utc::now() + Duration::seconds(CAPTCHA_TIMEOUT_SECS),
      })
      .await?;
    info!(user_id, "captcha issued");
  }
  Ok(())
}

fn parse_verify(value: &str) -> Option<(i64, i64)> {
  let (chat, user) = value.split_once(':')?;
  Some((chat.parse().ok()?, user.parse().ok()?))
}

#[instrument(skip(bot, ctx, query))]
pub async fn on_verify(
  bot: &Bot,
  ctx: &SharedChild,
  query: &CallbackQuery,
  value: &str,
) -> anyhow::Result<Option<String>> {
  let Some((chat_id, user_id)) = parse_verify(value) else {
    return Ok(None);
  };
  if query.from.id.0 as i64 != user_id {
    return Ok(Some("This button is not for you.".to_string()));
  }
  let Some(captcha) = ctx.db().take_captcha(ctx.username(), chat_id, user_id).await? else {
    return Ok(Some("Nothing to verify.".to_string()));
  };
  let chat = ChatId(chat_id);
  bot
    .restrict_chat_member(chat, uid(user_id), ChatPermissions::all())
    .await?;
  if let Some(message_id) = captcha.message_id
    && let Err(err) = bot.delete_message(chat, MessageId(message_id)).await
  {
    warn!(error = %err, "failed to delete captcha prompt");
  }
  info!(chat_id, user_id, "captcha solved");
  Ok(Some("✅ Welcome!".to_string()))
}

/// Auto-moderation of ordinary group messages.
#[instrument(skip(bot, ctx, me, msg))]
pub async fn on_group_message(bot: &Bot, ctx: &SharedChild, me: &Me, msg: &Message) -> HandlerResult {
  let Some(user) = msg.from.as_ref() else {
    return Ok(());
  };
  if user.id == me.id || user.is_bot {
    return Ok(());
  }
  if !ensure_group(bot, ctx, msg).await? {
    return Ok(());
  }
  let user_id = user.id.0 as i64;
  let chat = msg.chat.id;
  let flooding = ctx.flood().hit(chat.0, user_id, Instant::now());
  let text = ui::message_text(msg).unwrap_or_default();
  let group = group_settings(ctx, msg).await?;
  let banned = find_banned_word(text, &group.banned_words).map(str::to_string);
  let mashing = is_low_variety(text);
  if !flooding && banned.is_none() && !mashing {
    return Ok(());
  }
  if is_privileged(bot, chat, user_id).await.unwrap_or(false) {
    return Ok(());
  }
  if let Err(err) = bot.delete_message(chat, msg.id).await {
    warn!(error = %err, "failed to delete offending message; am I an admin?");
    return Ok(());
  }
  if let Some(word) = banned {
    info!(user_id, word = %word, "removed message with banned word");
    apply_warning(
      bot,
      ctx,
      chat,
      &group,
      user_id,
      &user.first_name,
      &format!("banned word \"{word}\""),
    )
    .await?;
  } else {
    info!(user_id, flooding, mashing, "removed spam message");
  }
  Ok(())
}

/// Channel posts only serve to register the channel against the plan limit.
#[instrument(skip(bot, ctx, msg))]
pub async fn on_channel_post(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  let now = Utc::now();
  let owner = ctx.db().get_user(ctx.owner_id()).await?;
  let limit = plans::channel_limit(owner.as_ref(), now);
  let registration = ctx
    .db()
    .register_channel(ctx.username(), msg.chat.id.0, limit)
    .await?;
  match registration {
    Registration::New => info!(chat_id = msg.chat.id.0, "registered channel"),
    Registration::Existing => {},
    Registration::LimitReached => {
      bot.leave_chat(msg.chat.id).await?;
      ctx
        .notifier()
        .record(
          LogKind::Violation,
          &format!(
            "@{} (owner {}) exceeded its channel limit of {} with channel {}",
            ctx.username(),
            ctx.owner_id(),
            limit.unwrap_or_default(),
            msg.chat.id.0
          ),
        )
        .await;
    },
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::parse_verify;

  #[test]
  fn parses_verify_payload() {
    assert_eq!(parse_verify("-1001:42"), Some((-1001, 42)));
    assert_eq!(parse_verify("-1001"), None);
    assert_eq!(parse_verify("a:b"), None);
  }
}
