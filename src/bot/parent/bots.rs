use anyhow::Context;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardButton;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::Message;
use teloxide::types::MessageId;
use teloxide::utils::html;
use tracing::info;
use tracing::instrument;

use super::ParentDialogue;
use super::ParentState;
use super::SharedParent;
use super::menu;
use super::pin;
use crate::bot::HandlerResult;
use crate::bot::i18n::Text;
use crate::bot::i18n::tr;
use crate::bot::ui;
use crate::models::BotRecord;
use crate::models::BotStatus;
use crate::models::Language;
use crate::models::LogKind;
use crate::models::UserRecord;
use crate::security::PinError;
use crate::security::mask_token;

fn status_badge(record: &BotRecord, running: bool) -> &'static str {
  if record.is_pending_deletion() {
    "🗑️"
  } else if record.status == BotStatus::Failed {
    "🔴"
  } else if running {
    "🟢"
  } else {
    "⚪"
  }
}

/// Fetches a bot only if `account` owns it.
async fn owned_bot(ctx: &SharedParent, account: &UserRecord, name: &str) -> anyhow::Result<Option<BotRecord>> {
  Ok(
    ctx
      .db()
      .get_bot(name)
      .await?
      .filter(|record| record.owner_id == account.id),
  )
}

async fn not_found(bot: &Bot, chat: ChatId, message_id: MessageId, language: Language) -> HandlerResult {
  let text = match language {
    Language::Fr => "Ce bot n'existe plus.",
    Language::En => "This bot no longer exists.",
  };
  ui::edit_menu(bot, chat, message_id, text, menu::back_keyboard(language)).await
}

pub async fn show_list(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  target: Option<MessageId>,
  account: &UserRecord,
) -> HandlerResult {
  let language = account.language;
  let records = ctx.db().bots_of_owner(account.id).await?;
  if records.is_empty() {
    return ui::show_menu(bot, chat, target, tr(language, Text::NoBots), menu::back_keyboard(language)).await;
  }
  let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
  for record in &records {
    let running = ctx.supervisor().is_running(&record.username).await;
    rows.push(vec![ui::button(
      format!("{} @{}", status_badge(record, running), record.username),
      format!("bot:{}", record.username),
    )]);
  }
  rows.push(vec![ui::button(tr(language, Text::Back), "menu:main")]);
  ui::show_menu(
    bot,
    chat,
    target,
    tr(language, Text::BotsHeader),
    InlineKeyboardMarkup::new(rows),
  )
  .await
}

#[instrument(skip(bot, ctx, account))]
pub async fn show_detail(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  name: &str,
) -> HandlerResult {
  let language = account.language;
  let Some(record) = owned_bot(ctx, account, name).await? else {
    return not_found(bot, chat, message_id, language).await;
  };
  let running = ctx.supervisor().is_running(name).await;
  let mut text = format!(
    "{} <b>@{}</b> ({})\n\n👥 {} · 📢 {}",
    status_badge(&record, running),
    html::escape(&record.username),
    html::escape(&record.name),
    record.groups.len(),
    record.channels.len()
  );
  let delete_row = if let Some(requested) = record.deletion_requested_at {
    let due = requested + ctx.config().deletion_grace;
    text.push_str(&match language {
      Language::Fr => format!("\n\n🗑️ Suppression prévue le {}", due.format("%Y-%m-%d %H:%M UTC")),
      Language::En => format!("\n\n🗑️ Deletion due {}", due.format("%Y-%m-%d %H:%M UTC")),
    });
    let label = match language {
      Language::Fr => "↩️ Annuler la suppression",
      Language::En => "↩️ Cancel deletion",
    };
    ui::button(label, format!("undel:{name}"))
  } else {
    let label = match language {
      Language::Fr => "🗑️ Supprimer",
      Language::En => "🗑️ Delete",
    };
    ui::button(label, format!("del:{name}"))
  };
  let keyboard = InlineKeyboardMarkup::new(vec![
    vec![ui::button("ℹ️ Info", format!("botinfo:{name}")), delete_row],
    vec![ui::button(tr(language, Text::Back), "bots:list")],
  ]);
  ui::edit_menu(bot, chat, message_id, text, keyboard).await
}

#[instrument(skip(bot, ctx, account))]
pub async fn show_info(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  name: &str,
) -> HandlerResult {
  let language = account.language;
  let Some(record) = owned_bot(ctx, account, name).await? else {
    return not_found(bot, chat, message_id, language).await;
  };
  let text = format!(
    "ℹ️ <b>@{}</b>\n\nID: <code>{}</code>\nToken: <code>{}</code>\nStatus: {:?}\nLinked: {}\nGroups: {}\nChannels: {}\nSearch cost: {}",
    html::escape(&record.username),
    record.bot_id,
    html::escape(&mask_token(&record.token)),
    record.status,
    record.created_at.format("%Y-%m-%d"),
    record.groups.len(),
    record.channels.len(),
    record.settings.search_cost
  );
  let keyboard = ui::single_button(tr(language, Text::Back), format!("bot:{name}"));
  ui::edit_menu(bot, chat, message_id, text, keyboard).await
}

/// First deletion step: the owner must type the bot's username.
#[instrument(skip(bot, dialogue, ctx, account))]
pub async fn start_deletion(
  bot: &Bot,
  dialogue: &ParentDialogue,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  name: &str,
) -> HandlerResult {
  let language = account.language;
  let Some(record) = owned_bot(ctx, account, name).await? else {
    return not_found(bot, chat, message_id, language).await;
  };
  if record.is_pending_deletion() {
    return show_detail(bot, ctx, chat, message_id, account, name).await;
  }
  dialogue
    .update(ParentState::ConfirmDeletion {
      bot: record.username.clone(),
    })
    .await?;
  let text = match language {
    Language::Fr => format!(
      "⚠️ Supprimer <b>@{}</b> effacera ses produits, membres, documents et réglages.\n\nTapez <code>{}</code> pour confirmer (ou /cancel).",
      html::escape(&record.username),
      html::escape(&record.username)
    ),
    Language::En => format!(
      "⚠️ Deleting <b>@{}</b> erases its products, members, documents and settings.\n\nType <code>{}</code> to confirm (or /cancel).",
      html::escape(&record.username),
      html::escape(&record.username)
    ),
  };
  ui::edit_menu(bot, chat, message_id, text, InlineKeyboardMarkup::default()).await
}

fn username_matches(typed: &str, username: &str) -> bool {
  typed.trim().trim_start_matches('@').eq_ignore_ascii_case(username)
}

#[instrument(skip(bot, dialogue, ctx, msg))]
pub async fn confirm_username(
  bot: &Bot,
  dialogue: &ParentDialogue,
  ctx: &SharedParent,
  msg: &Message,
  name: &str,
) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let account = menu::account_for(ctx, user).await?;
  let language = account.language;
  dialogue.reset().await?;
  let typed = ui::trimmed_text(msg).unwrap_or_default();
  if !username_matches(typed, name) {
    let text = match language {
      Language::Fr => "Le nom ne correspond pas ; suppression abandonnée.",
      Language::En => "The name does not match; deletion aborted.",
    };
    bot.send_message(msg.chat.id, text).await?;
    return Ok(());
  }
  let (text, confirm, keep) = match language {
    Language::Fr => (
      format!("Dernière confirmation : supprimer @{name} ?"),
      "🗑️ Oui, supprimer",
      "↩️ Non",
    ),
    Language::En => (format!("Final confirmation: delete @{name}?"), "🗑️ Yes, delete", "↩️ No"),
  };
  let keyboard = InlineKeyboardMarkup::new(vec![vec![
    ui::button(confirm, format!("delok:{name}")),
    ui::button(keep, format!("bot:{name}")),
  ]]);
  bot.send_message(msg.chat.id, text).reply_markup(keyboard).await?;
  Ok(())
}

/// Final confirmation leads to the PIN prompt; a user without a PIN must set one first.
#[instrument(skip(bot, dialogue, ctx, account))]
pub async fn final_confirm(
  bot: &Bot,
  dialogue: &ParentDialogue,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  name: &str,
) -> anyhow::Result<Option<String>> {
  let language = account.language;
  if owned_bot(ctx, account, name).await?.is_none() {
    not_found(bot, chat, message_id, language).await?;
    return Ok(None);
  }
  if account.pin_hash.is_none() {
    ui::edit_menu(
      bot,
      chat,
      message_id,
      tr(language, Text::PinRequired),
      menu::back_keyboard(language),
    )
    .await?;
    return Ok(Some(PinError::NotSet.user_message(language).to_string()));
  }
  if account.is_locked(Utc::now()) {
    return Ok(Some(PinError::Locked.user_message(language).to_string()));
  }
  dialogue
    .update(ParentState::AwaitingDeletionPin { bot: name.to_string() })
    .await?;
  ui::edit_menu(
    bot,
    chat,
    message_id,
    tr(language, Text::PinPromptDeletion),
    InlineKeyboardMarkup::default(),
  )
  .await?;
  Ok(None)
}

#[instrument(skip(bot, dialogue, ctx, msg))]
pub async fn receive_deletion_pin(
  bot: &Bot,
  dialogue: &ParentDialogue,
  ctx: &SharedParent,
  msg: &Message,
  name: &str,
) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let account = menu::account_for(ctx, user).await?;
  let language = account.language;
  let text = ui::trimmed_text(msg).unwrap_or_default().to_string();
  if ui::is_cancel(&text) {
    dialogue.reset().await?;
    bot.send_message(msg.chat.id, tr(language, Text::Cancelled)).await?;
    return Ok(());
  }
  pin::scrub(bot, msg).await;
  match pin::check_pin(ctx, &account, &text).await? {
    Ok(()) => {},
    Err(err) => {
      if matches!(err, PinError::Locked | PinError::NotSet) {
        dialogue.reset().await?;
      }
      bot.send_message(msg.chat.id, err.user_message(language)).await?;
      return Ok(());
    },
  }
  dialogue.reset().await?;
  let Some(record) = owned_bot(ctx, &account, name).await? else {
    bot.send_message(msg.chat.id, "❓").await?;
    return Ok(());
  };
  let now = Utc::now();
  ctx.db().schedule_bot_deletion(&record.username, now).await?;
  let due = now + ctx.config().deletion_grace;
  info!(bot = %record.username, due = %due, "bot deletion scheduled");
  ctx
    .notifier()
    .record(
      LogKind::Deletion,
      &format!("user {} scheduled deletion of @{} for {}", account.id, record.username, due.format("%Y-%m-%d %H:%M UTC")),
    )
    .await;
  let (text, undo) = match language {
    Language::Fr => (
      format!(
        "🗑️ @{} sera supprimé le {}. Vous pouvez annuler d'ici là avec /canceldeletion.",
        record.username,
        due.format("%Y-%m-%d %H:%M UTC")
      ),
      "↩️ Annuler la suppression",
    ),
    Language::En => (
      format!(
        "🗑️ @{} will be deleted on {}. You can undo this until then with /canceldeletion.",
        record.username,
        due.format("%Y-%m-%d %H:%M UTC")
      ),
      "↩️ Cancel deletion",
    ),
  };
  bot
    .send_message(msg.chat.id, text)
    .reply_markup(ui::single_button(undo, format!("undel:{}", record.username)))
    .await?;
  Ok(())
}

async fn restore(ctx: &SharedParent, account: &UserRecord, name: &str) -> anyhow::Result<bool> {
  let Some(record) = owned_bot(ctx, account, name).await? else {
    return Ok(false);
  };
  if !record.is_pending_deletion() {
    return Ok(false);
  }
  ctx.db().cancel_bot_deletion(name).await?;
  info!(bot = name, "bot deletion cancelled");
  ctx
    .notifier()
    .record(
      LogKind::Deletion,
      &format!("user {} cancelled deletion of @{name}", account.id),
    )
    .await;
  Ok(true)
}

fn restored_text(language: Language, name: &str) -> String {
  match language {
    Language::Fr => format!("✅ @{name} est conservé."),
    Language::En => format!("✅ @{name} is kept."),
  }
}

#[instrument(skip(bot, ctx, account))]
pub async fn undo_deletion(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  name: &str,
) -> anyhow::Result<Option<String>> {
  if !restore(ctx, account, name).await? {
    return Ok(None);
  }
  let text = restored_text(account.language, name);
  ui::edit_menu(
    bot,
    chat,
    message_id,
    text.clone(),
    ui::single_button("🤖", format!("bot:{name}")),
  )
  .await?;
  Ok(Some(text))
}

/// `/canceldeletion [username]`; without a name the only pending bot is picked.
#[instrument(skip(bot, ctx, msg, account))]
pub async fn cancel_deletion_command(
  bot: &Bot,
  ctx: &SharedParent,
  msg: &Message,
  account: &UserRecord,
  args: &str,
) -> HandlerResult {
  let language = account.language;
  let requested = args.trim().trim_start_matches('@');
  let name = if requested.is_empty() {
    let pending: Vec<String> = ctx
      .db()
      .bots_of_owner(account.id)
      .await?
      .into_iter()
      .filter(BotRecord::is_pending_deletion)
      .map(|record| record.username)
      .collect();
    match pending.as_slice() {
      [only] => only.clone(),
      [] => {
        let text = match language {
          Language::Fr => "Aucune suppression en attente.",
          Language::En => "No deletion is pending.",
        };
        bot.send_message(msg.chat.id, text).await?;
        return Ok(());
      },
      many => {
        let text = match language {
          Language::Fr => format!("Précisez le bot : /canceldeletion <nom>\n{}", many.join(", ")),
          Language::En => format!("Name the bot: /canceldeletion <username>\n{}", many.join(", ")),
        };
        bot.send_message(msg.chat.id, text).await?;
        return Ok(());
      },
    }
  } else {
    requested.to_string()
  };
  let text = if restore(ctx, account, &name).await? {
    restored_text(language, &name)
  } else {
    match language {
      Language::Fr => format!("@{name} n'est pas en cours de suppression."),
      Language::En => format!("@{name} is not pending deletion."),
    }
  };
  bot.send_message(msg.chat.id, text).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::status_badge;
  use super::username_matches;
  use crate::models::BotRecord;
  use crate::models::BotSettings;
  use crate::models::BotStatus;

  #[test]
  fn typed_username_ignores_at_and_case() {
    assert!(username_matches("@My_Shop_Bot ", "my_shop_bot"));
    assert!(username_matches("my_shop_bot", "my_shop_bot"));
    assert!(!username_matches("other_bot", "my_shop_bot"));
  }

  #[test]
  fn badge_reflects_deletion_then_failure() {
    let mut record = BotRecord {
      username: "b".to_string(),
      bot_id: 1,
      name: "B".to_string(),
      token: "1:x".to_string(),
      owner_id: 1,
      created_at: Utc::now(),
      status: BotStatus::Failed,
      deletion_requested_at: None,
      groups: vec![],
      channels: vec![],
      settings: BotSettings::default(),
    };
    assert_eq!(status_badge(&record, false), "🔴");
    record.deletion_requested_at = Some(Utc::now());
    assert_eq!(status_badge(&record, true), "🗑️");
    record.deletion_requested_at = None;
    record.status = BotStatus::Active;
    assert_eq!(status_badge(&record, true), "🟢");
  }
}
