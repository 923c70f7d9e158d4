use anyhow::Context;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::Me;
use teloxide::types::Message;
use teloxide::types::User;
use teloxide::utils::html;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::ChildDialogue;
use super::SharedChild;
use crate::bot::HandlerResult;
use crate::bot::ui;
use crate::db::CreditError;
use crate::db::MemberJoin;
use crate::models::MemberRecord;
use crate::models::OrderStatus;
use crate::models::Transaction;
use crate::referral::NEWCOMER_REWARD;
use crate::referral::REFERRER_REWARD;
use crate::referral::invite_link;
use crate::referral::parse_referral;

const DEFAULT_WELCOME: &str = "👋 Welcome! Browse the shop, search our documents and invite friends to earn credits.";

/// Replies and returns `None` unless the sender owns this bot.
pub(super) async fn require_owner(bot: &Bot, ctx: &SharedChild, msg: &Message) -> anyhow::Result<Option<i64>> {
  let user_id = ui::sender_id(msg).context("message missing sender")?;
  if ctx.is_owner(user_id) {
    return Ok(Some(user_id));
  }
  bot
    .send_message(msg.chat.id, "🔒 Only the owner of this bot can do that.")
    .await?;
  Ok(None)
}

/// Registers the sender as a member of this bot if needed.
pub(super) async fn member_for(ctx: &SharedChild, user: &User) -> anyhow::Result<MemberRecord> {
  let join = ctx
    .db()
    .ensure_member(
      ctx.username(),
      user.id.0 as i64,
      user.username.clone(),
      user.first_name.clone(),
      None,
    )
    .await?;
  Ok(join.member)
}

fn start_keyboard() -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![vec![ui::button("🛍️ Shop", "shop:list")]])
}

#[instrument(skip(bot, dialogue, ctx, msg))]
pub async fn start(
  bot: &Bot,
  dialogue: &ChildDialogue,
  ctx: &SharedChild,
  msg: &Message,
  payload: &str,
) -> HandlerResult {
  dialogue.reset().await?;
  let user = msg.from.as_ref().context("message missing sender")?;
  let user_id = user.id.0 as i64;
  let referrer = parse_referral(payload, user_id);
  let MemberJoin {
    member,
    is_new,
    referred_by,
  } = ctx
    .db()
    .ensure_member(
      ctx.username(),
      user_id,
      user.username.clone(),
      user.first_name.clone(),
      referrer,
    )
    .await?;
  info!(user_id, is_new, referred_by = ?referred_by, "member started bot");

  let settings = ctx
    .db()
    .get_bot(ctx.username())
    .await?
    .map(|record| record.settings)
    .unwrap_or_default();
  let mut text = settings.welcome.unwrap_or_else(|| DEFAULT_WELCOME.to_string());
  if let Some(referrer_id) = referred_by {
    text.push_str(&format!("\n\n🎁 You joined through an invite and received {NEWCOMER_REWARD} credits."));
    let note = format!(
      "🎉 {} joined through your invite link. You earned {REFERRER_REWARD} credits!",
      user.first_name
    );
    if let Err(err) = bot.send_message(ChatId(referrer_id), note).await {
      warn!(error = %err, referrer_id, "failed to notify referrer");
    }
  }
  if ctx.is_owner(user_id) {
    text.push_str("\n\n🛠️ You own this bot. /help lists the owner commands.");
  }
  text.push_str(&format!("\n\n💰 Balance: {} credits", member.credits));
  bot
    .send_message(msg.chat.id, text)
    .reply_markup(start_keyboard())
    .await?;
  Ok(())
}

fn render_transactions(transactions: &[Transaction]) -> String {
  if transactions.is_empty() {
    return "No activity yet.".to_string();
  }
  transactions
    .iter()
    .map(|tx| {
      format!(
        "{} {:+} · {} ({})",
        tx.at.format("%Y-%m-%d"),
        tx.amount,
        html::escape(&tx.reason),
        tx.balance_after
      )
    })
    .collect::<Vec<_>>()
    .join("\n")
}

#[instrument(skip(bot, ctx, msg))]
pub async fn credits(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let member = member_for(ctx, user).await?;
  let recent = ctx
    .db()
    .transactions(ctx.username(), member.user_id, 5)
    .await?;
  let text = format!(
    "💰 <b>{} credits</b>\n\nRecent activity:\n{}",
    member.credits,
    render_transactions(&recent)
  );
  ui::send_html(bot, msg.chat.id, text).await
}

#[instrument(skip(bot, ctx, me, msg))]
pub async fn invite(bot: &Bot, ctx: &SharedChild, me: &Me, msg: &Message) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  member_for(ctx, user).await?;
  let link = invite_link(me.username(), user.id.0 as i64);
  bot
    .send_message(
      msg.chat.id,
      format!(
        "🔗 Your invite link:\n{link}\n\nEvery friend who joins earns you {REFERRER_REWARD} credits and gives them {NEWCOMER_REWARD}."
      ),
    )
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn referrals(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let member = member_for(ctx, user).await?;
  let invited = ctx
    .db()
    .referrals_of(ctx.username(), member.user_id)
    .await?;
  let leaders = ctx.db().referral_leaderboard(ctx.username(), 5).await?;
  let mut text = format!(
    "👥 <b>Referrals</b>\n\nInvited: {}\nEarned: {} credits",
    invited.len(),
    member.referral_earnings
  );
  if !leaders.is_empty() {
    text.push_str("\n\n🏆 Top inviters:");
    for (rank, leader) in leaders.iter().enumerate() {
      text.push_str(&format!(
        "\n{}. {} · {}",
        rank + 1,
        html::escape(&leader.first_name),
        leader.referral_count
      ));
    }
  }
  ui::send_html(bot, msg.chat.id, text).await
}

fn parse_grant(args: &str) -> Option<(i64, i64)> {
  let mut parts = args.split_whitespace();
  let user_id = parts.next()?.parse::<i64>().ok()?;
  let amount = parts.next()?.parse::<i64>().ok()?;
  (parts.next().is_none() && amount > 0).then_some((user_id, amount))
}

#[instrument(skip(bot, ctx, msg))]
pub async fn grant(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if require_owner(bot, ctx, msg).await?.is_none() {
    return Ok(());
  }
  let Some((user_id, amount)) = parse_grant(args) else {
    bot
      .send_message(msg.chat.id, "Usage: /grant <user id> <amount>")
      .await?;
    return Ok(());
  };
  match ctx
    .db()
    .credit(ctx.username(), user_id, amount, "granted by owner")
    .await
  {
    Ok(balance) => {
      info!(user_id, amount, balance, "owner granted credits");
      bot
        .send_message(
          msg.chat.id,
          format!("✅ Granted {amount} credits to {user_id}. New balance: {balance}."),
        )
        .await?;
      if let Err(err) = bot
        .send_message(ChatId(user_id), format!("🎁 You received {amount} credits."))
        .await
      {
        warn!(error = %err, user_id, "failed to notify credited member");
      }
    },
    Err(CreditError::UnknownMember) => {
      bot
        .send_message(msg.chat.id, "That user has not started this bot yet.")
        .await?;
    },
    Err(err) => return Err(err.into()),
  }
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn set_welcome(bot: &Bot, ctx: &SharedChild, msg: &Message, text: &str) -> HandlerResult {
  if require_owner(bot, ctx, msg).await?.is_none() {
    return Ok(());
  }
  let welcome = text.trim();
  let value = (!welcome.is_empty()).then(|| welcome.to_string());
  let reset = value.is_none();
  ctx
    .db()
    .update_bot_settings(ctx.username(), |settings| settings.welcome = value)
    .await?;
  let reply = if reset {
    "✅ Greeting reset to the default."
  } else {
    "✅ Greeting updated."
  };
  bot.send_message(msg.chat.id, reply).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn stats(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  if require_owner(bot, ctx, msg).await?.is_none() {
    return Ok(());
  }
  let db = ctx.db();
  let bot_name = ctx.username();
  let members = db.members_of_bot(bot_name).await?;
  let products = db.list_products(bot_name).await?;
  let orders = db.orders_for_bot(bot_name, usize::MAX).await?;
  let documents = db.documents_of_bot(bot_name).await?;
  let groups = db.groups_of_bot(bot_name).await?;
  let schedules = db.schedules_of_bot(bot_name).await?;
  let circulating: i64 = members.iter().map(|member| member.credits).sum();
  let pending = orders
    .iter()
    .filter(|order| order.status == OrderStatus::Pending)
    .count();
  let text = format!(
    "📊 <b>@{}</b>\n\nMembers: {}\nCredits in circulation: {}\nProducts: {}\nOrders: {} ({} pending)\nDocuments: {}\nGroups: {}\nScheduled posts: {}",
    html::escape(bot_name),
    members.len(),
    circulating,
    products.len(),
    orders.len(),
    pending,
    documents.len(),
    groups.len(),
    schedules.len()
  );
  ui::send_html(bot, msg.chat.id, text).await
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use uuid::Uuid;

  use super::parse_grant;
  use super::render_transactions;
  use crate::models::Transaction;

  #[test]
  fn parses_grant_arguments() {
    assert_eq!(parse_grant("42 100"), Some((42, 100)));
    assert_eq!(parse_grant("42"), None);
    assert_eq!(parse_grant("42 -5"), None);
    assert_eq!(parse_grant("42 5 extra"), None);
  }

  #[test]
  fn renders_signed_transactions() {
    let tx = Transaction {
      id: Uuid::new_v4(),
      bot: "shop".to_string(),
      user_id: 1,
      amount: -30,
      balance_after: 70,
      reason: "purchase <#3>".to_string(),
      at: Utc::now(),
    };
    let text = render_transactions(&[tx]);
    assert!(text.contains("-30"));
    assert!(text.contains("&lt;#3&gt;"));
    assert_eq!(render_transactions(&[]), "No activity yet.");
  }
}
