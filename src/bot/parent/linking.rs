use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::Message;
use teloxide::types::MessageId;
use thiserror::Error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::ParentDialogue;
use super::ParentState;
use super::SharedParent;
use super::menu;
use crate::bot::HandlerResult;
use crate::bot::i18n::Text;
use crate::bot::i18n::tr;
use crate::bot::ui;
use crate::models::BotRecord;
use crate::models::BotSettings;
use crate::models::BotStatus;
use crate::models::Language;
use crate::models::LogKind;
use crate::models::UserRecord;
use crate::plans;
use crate::plans::LimitError;
use crate::security::looks_like_token;
use crate::security::mask_token;

#[derive(Debug, Error)]
pub enum LinkError {
  #[error("text does not look like a bot token")]
  InvalidFormat,
  #[error("bot @{0} is already linked to this account")]
  AlreadyLinked(String),
  #[error("bot is linked to another account")]
  LinkedElsewhere,
  #[error(transparent)]
  Limit(#[from] LimitError),
  #[error("telegram rejected the token: {0}")]
  Rejected(String),
  #[error(transparent)]
  Storage(#[from] anyhow::Error),
}

impl LinkError {
  pub fn user_message(&self, language: Language) -> String {
    match (self, language) {
      (Self::InvalidFormat, Language::Fr) => {
        "Ce texte ne ressemble pas à un token. Format attendu : 123456789:AA... (ou /cancel).".to_string()
      },
      (Self::InvalidFormat, Language::En) => {
        "That does not look like a token. Expected format: 123456789:AA... (or /cancel).".to_string()
      },
      (Self::AlreadyLinked(name), Language::Fr) => format!("@{name} est déjà lié à votre compte."),
      (Self::AlreadyLinked(name), Language::En) => format!("@{name} is already linked to your account."),
      (Self::LinkedElsewhere, Language::Fr) => "Ce bot est déjà lié à un autre compte.".to_string(),
      (Self::LinkedElsewhere, Language::En) => "This bot is already linked to another account.".to_string(),
      (Self::Limit(err), Language::Fr) => {
        format!("🚫 Limite atteinte ({err}). Passez à une offre supérieure avec /planinfo.")
      },
      (Self::Limit(err), Language::En) => format!("🚫 Limit reached ({err}). Upgrade with /planinfo."),
      (Self::Rejected(_), Language::Fr) => "Telegram refuse ce token. Vérifiez-le auprès de @BotFather.".to_string(),
      (Self::Rejected(_), Language::En) => "Telegram rejected this token. Check it with @BotFather.".to_string(),
      (Self::Storage(_), Language::Fr) => "La liaison a échoué, réessayez plus tard.".to_string(),
      (Self::Storage(_), Language::En) => "Linking failed, please try again later.".to_string(),
    }
  }

  /// Only a malformed token keeps the user in the token prompt.
  fn keeps_prompt(&self) -> bool {
    matches!(self, Self::InvalidFormat)
  }
}

fn have_token_keyboard(language: Language) -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![
    vec![
      ui::button(tr(language, Text::HaveTokenYes), "link:yes"),
      ui::button(tr(language, Text::HaveTokenNo), "link:no"),
    ],
    vec![ui::button(tr(language, Text::Back), "menu:main")],
  ])
}

pub async fn ask_have_token(
  bot: &Bot,
  chat: ChatId,
  target: Option<MessageId>,
  account: &UserRecord,
) -> HandlerResult {
  ui::show_menu(
    bot,
    chat,
    target,
    tr(account.language, Text::HaveToken),
    have_token_keyboard(account.language),
  )
  .await
}

#[instrument(skip(bot, dialogue, account))]
pub async fn on_link_callback(
  bot: &Bot,
  dialogue: &ParentDialogue,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  value: &str,
) -> HandlerResult {
  let language = account.language;
  match value {
    "start" => ask_have_token(bot, chat, Some(message_id), account).await,
    "yes" => {
      dialogue.update(ParentState::AwaitingToken).await?;
      ui::edit_menu(
        bot,
        chat,
        message_id,
        tr(language, Text::SendToken),
        InlineKeyboardMarkup::default(),
      )
      .await
    },
    "no" => {
      ui::edit_menu(
        bot,
        chat,
        message_id,
        tr(language, Text::TokenGuide),
        menu::back_keyboard(language),
      )
      .await
    },
    _ => Ok(()),
  }
}

/// Validates and stores a token for `account`, enforcing uniqueness and the plan limit.
#[instrument(skip(ctx, account, token), fields(user_id = account.id))]
pub async fn link_token(ctx: &SharedParent, account: &UserRecord, token: &str) -> Result<BotRecord, LinkError> {
  if !looks_like_token(token) {
    return Err(LinkError::InvalidFormat);
  }
  if let Some(existing) = ctx.db().find_bot_by_token(token).await? {
    if existing.owner_id == account.id {
      return Err(LinkError::AlreadyLinked(existing.username));
    }
    ctx
      .notifier()
      .record(
        LogKind::Violation,
        &format!(
          "user {} tried to link @{} owned by {}",
          account.id, existing.username, existing.owner_id
        ),
      )
      .await;
    return Err(LinkError::LinkedElsewhere);
  }

  let now = Utc::now();
  let active = ctx
    .db()
    .bots_of_owner(account.id)
    .await?
    .iter()
    .filter(|record| !record.is_pending_deletion())
    .count();
  if let Err(err) = plans::can_link_bot(account, active, now) {
    ctx
      .notifier()
      .record(
        LogKind::Violation,
        &format!("user {} hit the bot limit: {err}", account.id),
      )
      .await;
    return Err(err.into());
  }

  let me = Bot::new(token.to_string())
    .get_me()
    .await
    .map_err(|err| LinkError::Rejected(err.to_string()))?;
  let username = me.username().to_string();
  if let Some(existing) = ctx.db().get_bot(&username).await?
    && existing.owner_id != account.id
  {
    ctx
      .notifier()
      .record(
        LogKind::Violation,
        &format!("user {} tried to take over @{username} from {}", account.id, existing.owner_id),
      )
      .await;
    return Err(LinkError::LinkedElsewhere);
  }

  let record = ctx
    .db()
    .save_bot(BotRecord {
      username,
      bot_id: me.user.id.0 as i64,
      name: me.user.first_name.clone(),
      token: token.to_string(),
      owner_id: account.id,
      created_at: now,
      status: BotStatus::Active,
      deletion_requested_at: None,
      groups: Vec::new(),
      channels: Vec::new(),
      settings: BotSettings::default(),
    })
    .await?;
  info!(bot = %record.username, token = %mask_token(token), "bot linked");
  Ok(record)
}

#[instrument(skip(bot, dialogue, ctx, msg))]
pub async fn receive_token(bot: &Bot, dialogue: &ParentDialogue, ctx: &SharedParent, msg: &Message) -> HandlerResult {
  let Some(account) = menu::require_account(bot, ctx, msg).await? else {
    dialogue.reset().await?;
    return Ok(());
  };
  let language = account.language;
  let Some(text) = ui::trimmed_text(msg) else {
    bot.send_message(msg.chat.id, tr(language, Text::SendToken)).await?;
    return Ok(());
  };
  if ui::is_cancel(text) {
    dialogue.reset().await?;
    bot.send_message(msg.chat.id, tr(language, Text::Cancelled)).await?;
    return Ok(());
  }
  let token = text.to_string();
  // the token should not linger in the chat history
  if let Err(err) = bot.delete_message(msg.chat.id, msg.id).await {
    warn!(error = %err, "failed to delete token message");
  }

  match link_token(ctx, &account, &token).await {
    Ok(record) => {
      dialogue.reset().await?;
      let started = match ctx.supervisor().start(&record).await {
        Ok(()) => true,
        Err(err) => {
          warn!(bot = %record.username, error = %format!("{err:#}"), "linked bot failed to start");
          ctx.db().set_bot_status(&record.username, BotStatus::Failed).await?;
          false
        },
      };
      ctx
        .notifier()
        .record(
          LogKind::Info,
          &format!("user {} linked @{}", account.id, record.username),
        )
        .await;
      let text = match (language, started) {
        (Language::Fr, true) => format!(
          "🎉 @{} est lié et démarré !\nOuvrez-le et envoyez /start, puis /help pour ses commandes.",
          record.username
        ),
        (Language::En, true) => format!(
          "🎉 @{} is linked and running!\nOpen it and send /start, then /help for its commands.",
          record.username
        ),
        (Language::Fr, false) => format!("@{} est lié mais n'a pas pu démarrer ; les opérateurs sont prévenus.", record.username),
        (Language::En, false) => format!("@{} is linked but could not start; operators were told.", record.username),
      };
      bot
        .send_message(msg.chat.id, text)
        .reply_markup(ui::single_button(
          tr(language, Text::MenuBots),
          format!("bot:{}", record.username),
        ))
        .await?;
    },
    Err(LinkError::Storage(err)) => {
      dialogue.reset().await?;
      return Err(err);
    },
    Err(err) => {
      info!(error = %err, "link refused");
      if !err.keeps_prompt() {
        dialogue.reset().await?;
      }
      bot.send_message(msg.chat.id, err.user_message(language)).await?;
    },
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::LinkError;
  use crate::models::Language;
  use crate::plans::LimitError;
  use crate::plans::Plan;

  #[test]
  fn only_malformed_tokens_keep_the_prompt() {
    assert!(LinkError::InvalidFormat.keeps_prompt());
    assert!(!LinkError::LinkedElsewhere.keeps_prompt());
    assert!(!LinkError::Rejected("401".to_string()).keeps_prompt());
  }

  #[test]
  fn limit_message_mentions_upgrade() {
    let err = LinkError::Limit(LimitError::Bots {
      plan: Plan::Basic,
      limit: 1,
    });
    assert!(err.user_message(Language::En).contains("/planinfo"));
    assert!(err.user_message(Language::Fr).contains("/planinfo"));
  }
}
