use chrono::Duration;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::Message;
use teloxide::utils::html;
use tracing::info;
use tracing::instrument;

use super::SharedChild;
use super::account::require_owner;
use crate::bot::HandlerResult;
use crate::bot::ui;
use crate::models::ScheduledPost;
use crate::moderation::format_duration;
use crate::moderation::parse_duration;
use crate::util::truncate_text;

const MIN_INTERVAL_MINUTES: i64 = 5;
const USAGE: &str = "Usage: /schedule <interval> <text>, e.g. /schedule 6h Read the rules!";

#[derive(Debug, PartialEq, Eq)]
enum ScheduleArgsError {
  Usage,
  TooFrequent,
}

fn parse_schedule_args(args: &str) -> Result<(Duration, String), ScheduleArgsError> {
  let (interval, text) = args
    .trim()
    .split_once(char::is_whitespace)
    .ok_or(ScheduleArgsError::Usage)?;
  let interval = parse_duration(interval).map_err(|_| ScheduleArgsError::Usage)?;
  let text = text.trim();
  if text.is_empty() {
    return Err(ScheduleArgsError::Usage);
  }
  if interval < Duration::minutes(MIN_INTERVAL_MINUTES) {
    return Err(ScheduleArgsError::TooFrequent);
  }
  Ok((interval, text.to_string()))
}

#[instrument(skip(bot, ctx, msg))]
pub async fn create(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  let Some(owner_id) = require_owner(bot, ctx, msg).await? else {
    return Ok(());
  };
  if !(msg.chat.is_group() || msg.chat.is_supergroup()) {
    bot
      .send_message(msg.chat.id, "Run /schedule inside the group that should receive the post.")
      .await?;
    return Ok(());
  }
  let (interval, text) = match parse_schedule_args(args) {
    Ok(parsed) => parsed,
    Err(ScheduleArgsError::Usage) => {
      bot.send_message(msg.chat.id, USAGE).await?;
      return Ok(());
    },
    Err(ScheduleArgsError::TooFrequent) => {
      bot
        .send_message(
          msg.chat.id,
          format!("The shortest interval is {MIN_INTERVAL_MINUTES} minutes."),
        )
        .await?;
      return Ok(());
    },
  };
  let post = ctx
    .db()
    .create_schedule(ScheduledPost {
      id: 0,
      bot: ctx.username().to_string(),
      chat_id: msg.chat.id.0,
      text,
      interval_secs: interval.num_seconds().unsigned_abs(),
      next_at: Utc::now() + interval,
      created_by: owner_id,
      last_sent_at: None,
    })
    .await?;
  info!(schedule_id = post.id, "scheduled post created");
  bot
    .send_message(
      msg.chat.id,
      format!(
        "⏰ Post #{} will be sent every {}. Remove it with /unschedule {}.",
        post.id,
        format_duration(interval),
        post.id
      ),
    )
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn list(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  if require_owner(bot, ctx, msg).await?.is_none() {
    return Ok(());
  }
  let posts = ctx.db().schedules_of_bot(ctx.username()).await?;
  if posts.is_empty() {
    bot.send_message(msg.chat.id, "No scheduled posts.").await?;
    return Ok(());
  }
  let mut text = String::from("⏰ <b>Scheduled posts</b>");
  for post in &posts {
    text.push_str(&format!(
      "\n\n#{} · every {} · chat {}\nnext: {}\n{}",
      post.id,
      format_duration(Duration::seconds(post.interval_secs as i64)),
      post.chat_id,
      post.next_at.format("%Y-%m-%d %H:%M UTC"),
      html::escape(&truncate_text(&post.text, 120))
    ));
  }
  ui::send_long(bot, msg.chat.id, &text).await
}

#[instrument(skip(bot, ctx, msg))]
pub async fn remove(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if require_owner(bot, ctx, msg).await?.is_none() {
    return Ok(());
  }
  let Some(id) = args.trim().trim_start_matches('#').parse::<u64>().ok() else {
    bot.send_message(msg.chat.id, "Usage: /unschedule <id>").await?;
    return Ok(());
  };
  let reply = if ctx.db().delete_schedule(ctx.username(), id).await? {
    info!(schedule_id = id, "scheduled post removed");
    format!("🗑️ Post #{id} unscheduled.")
  } else {
    format!("No scheduled post #{id}.")
  };
  bot.send_message(msg.chat.id, reply).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use chrono::Duration;

  use super::ScheduleArgsError;
  use super::parse_schedule_args;

  #[test]
  fn parses_interval_and_text() {
    let (interval, text) = parse_schedule_args("2h Daily reminder: be kind").unwrap();
    assert_eq!(interval, Duration::hours(2));
    assert_eq!(text, "Daily reminder: be kind");
  }

  #[test]
  fn rejects_short_or_incomplete_schedules() {
    assert_eq!(parse_schedule_args("1m spam"), Err(ScheduleArgsError::TooFrequent));
    assert_eq!(parse_schedule_args("2h"), Err(ScheduleArgsError::Usage));
    assert_eq!(parse_schedule_args("often hello"), Err(ScheduleArgsError::Usage));
  }
}
