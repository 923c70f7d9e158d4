use anyhow::Context;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::types::Message;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::ParentDialogue;
use super::ParentState;
use super::SharedParent;
use super::menu;
use super::state::PinDraft;
use super::state::PinStage;
use crate::bot::HandlerResult;
use crate::bot::i18n::Text;
use crate::bot::i18n::tr;
use crate::bot::ui;
use crate::models::UserRecord;
use crate::security::PinError;
use crate::security::hash_pin_offloaded;
use crate::security::validate_pin;
use crate::security::verify_pin_offloaded;

/// Checks `pin` against the stored hash, counting failures toward the lockout.
#[instrument(skip(ctx, account, pin), fields(user_id = account.id))]
pub async fn check_pin(ctx: &SharedParent, account: &UserRecord, pin: &str) -> anyhow::Result<Result<(), PinError>> {
  let now = Utc::now();
  if account.is_locked(now) {
    return Ok(Err(PinError::Locked));
  }
  let Some(stored) = account.pin_hash.as_deref() else {
    return Ok(Err(PinError::NotSet));
  };
  if let Err(err) = validate_pin(pin) {
    return Ok(Err(err));
  }
  if verify_pin_offloaded(pin.to_string(), stored.to_string()).await? {
    if account.pin_failures > 0 {
      ctx.db().reset_pin_failures(account.id).await?;
    }
    return Ok(Ok(()));
  }
  let failure = ctx.db().record_pin_failure(account.id, now).await?;
  warn!(attempts = failure.attempts, locked = failure.locked_until.is_some(), "wrong PIN");
  if failure.locked_until.is_some() {
    return Ok(Err(PinError::Locked));
  }
  Ok(Err(PinError::Mismatch))
}

/// Deletes the message carrying a PIN from the chat.
pub async fn scrub(bot: &Bot, msg: &Message) {
  if let Err(err) = bot.delete_message(msg.chat.id, msg.id).await {
    warn!(error = %err, "failed to delete PIN message");
  }
}

pub async fn begin(bot: &Bot, dialogue: &ParentDialogue, chat: ChatId, account: &UserRecord) -> HandlerResult {
  if account.is_locked(Utc::now()) {
    bot.send_message(chat, tr(account.language, Text::PinLocked)).await?;
    return Ok(());
  }
  let draft = PinDraft::new(account.pin_hash.is_some());
  let prompt = match draft.stage {
    PinStage::Current => Text::PinPromptOld,
    _ => Text::PinPromptNew,
  };
  dialogue.update(ParentState::SetPin(draft)).await?;
  bot.send_message(chat, tr(account.language, prompt)).await?;
  Ok(())
}

#[instrument(skip(bot, dialogue, ctx, msg, draft), fields(stage = ?draft.stage))]
pub async fn receive(
  bot: &Bot,
  dialogue: &ParentDialogue,
  ctx: &SharedParent,
  msg: &Message,
  mut draft: PinDraft,
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
  scrub(bot, msg).await;

  match draft.stage {
    PinStage::Current => match check_pin(ctx, &account, &text).await? {
      Ok(()) => {
        draft.stage = PinStage::New;
        dialogue.update(ParentState::SetPin(draft)).await?;
        bot.send_message(msg.chat.id, tr(language, Text::PinPromptNew)).await?;
      },
      Err(err) => {
        if err == PinError::Locked {
          dialogue.reset().await?;
        }
        bot.send_message(msg.chat.id, err.user_message(language)).await?;
      },
    },
    PinStage::New => match hash_pin_offloaded(text.clone()).await? {
      Ok(hash) => {
        draft.stage = PinStage::Confirm;
        draft.pending_hash = Some(hash);
        dialogue.update(ParentState::SetPin(draft)).await?;
        bot.send_message(msg.chat.id, tr(language, Text::PinPromptConfirm)).await?;
      },
      Err(err) => {
        bot.send_message(msg.chat.id, err.user_message(language)).await?;
      },
    },
    PinStage::Confirm => {
      dialogue.reset().await?;
      let confirmed = match draft.pending_hash {
        Some(hash) => verify_pin_offloaded(text.clone(), hash.clone()).await?.then_some(hash),
        None => None,
      };
      let Some(hash) = confirmed else {
        bot.send_message(msg.chat.id, tr(language, Text::PinMismatch)).await?;
        return Ok(());
      };
      ctx.db().set_pin_hash(account.id, hash).await?;
      info!(user_id = account.id, "PIN updated");
      bot.send_message(msg.chat.id, tr(language, Text::PinSaved)).await?;
    },
  }
  Ok(())
}
