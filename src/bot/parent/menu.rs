use anyhow::Context;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::Message;
use teloxide::types::MessageId;
use teloxide::types::User;
use tracing::info;
use tracing::instrument;

use super::ParentDialogue;
use super::SharedParent;
use super::admin;
use super::bots;
use super::linking;
use super::pin;
use super::subscription;
use crate::bot::HandlerResult;
use crate::bot::i18n::Text;
use crate::bot::i18n::tr;
use crate::bot::ui;
use crate::models::Language;
use crate::models::LogKind;
use crate::models::UserRecord;

/// Loads the sender's platform account, creating it with a trial on first contact.
pub async fn account_for(ctx: &SharedParent, user: &User) -> anyhow::Result<UserRecord> {
  let (account, _) = ctx
    .db()
    .ensure_user(
      user.id.0 as i64,
      user.username.clone(),
      user.first_name.clone(),
      ctx.config().trial_days,
    )
    .await?;
  Ok(account)
}

/// Returns the account once terms are accepted; otherwise shows the terms and returns `None`.
pub async fn require_account(bot: &Bot, ctx: &SharedParent, msg: &Message) -> anyhow::Result<Option<UserRecord>> {
  let user = msg.from.as_ref().context("message missing sender")?;
  let account = account_for(ctx, user).await?;
  if account.terms_accepted {
    return Ok(Some(account));
  }
  show_terms(bot, msg.chat.id, None, account.language).await?;
  Ok(None)
}

fn language_keyboard() -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![vec![
    ui::button("🇫🇷 Français", "lang:fr"),
    ui::button("🇬🇧 English", "lang:en"),
  ]])
}

fn terms_keyboard(language: Language) -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![vec![
    ui::button(tr(language, Text::TermsAccept), "terms:accept"),
    ui::button(tr(language, Text::TermsDecline), "terms:decline"),
  ]])
}

pub fn main_menu_keyboard(language: Language, is_admin: bool) -> InlineKeyboardMarkup {
  let mut rows = vec![
    vec![ui::button(tr(language, Text::MenuLink), "link:start")],
    vec![
      ui::button(tr(language, Text::MenuBots), "bots:list"),
      ui::button(tr(language, Text::MenuPlan), "menu:plan"),
    ],
    vec![
      ui::button(tr(language, Text::MenuPin), "menu:pin"),
      ui::button(tr(language, Text::MenuLanguage), "menu:lang"),
    ],
    vec![ui::button(tr(language, Text::MenuHelp), "menu:help")],
  ];
  if is_admin {
    rows.push(vec![ui::button(tr(language, Text::MenuDashboard), "admin:main")]);
  }
  InlineKeyboardMarkup::new(rows)
}

pub fn back_keyboard(language: Language) -> InlineKeyboardMarkup {
  ui::single_button(tr(language, Text::Back), "menu:main")
}

#[instrument(skip(bot, dialogue, ctx, msg))]
pub async fn start(bot: &Bot, dialogue: &ParentDialogue, ctx: &SharedParent, msg: &Message) -> HandlerResult {
  dialogue.reset().await?;
  let user = msg.from.as_ref().context("message missing sender")?;
  let (account, created) = ctx
    .db()
    .ensure_user(
      user.id.0 as i64,
      user.username.clone(),
      user.first_name.clone(),
      ctx.config().trial_days,
    )
    .await?;
  info!(user_id = account.id, created, "received /start command");
  if created {
    ctx
      .notifier()
      .record(
        LogKind::Info,
        &format!("new user {} ({})", account.id, account.first_name),
      )
      .await;
    return ask_language(bot, msg.chat.id, None).await;
  }
  if !account.terms_accepted {
    return show_terms(bot, msg.chat.id, None, account.language).await;
  }
  send_main_menu(bot, ctx, msg.chat.id, &account).await
}

pub async fn ask_language(bot: &Bot, chat: ChatId, target: Option<MessageId>) -> HandlerResult {
  ui::show_menu(
    bot,
    chat,
    target,
    tr(Language::Fr, Text::ChooseLanguage),
    language_keyboard(),
  )
  .await
}

pub async fn show_terms(bot: &Bot, chat: ChatId, target: Option<MessageId>, language: Language) -> HandlerResult {
  ui::show_menu(bot, chat, target, tr(language, Text::Terms), terms_keyboard(language)).await
}

pub async fn send_main_menu(bot: &Bot, ctx: &SharedParent, chat: ChatId, account: &UserRecord) -> HandlerResult {
  show_main_menu(bot, ctx, chat, None, account).await
}

pub async fn show_main_menu(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  target: Option<MessageId>,
  account: &UserRecord,
) -> HandlerResult {
  ui::show_menu(
    bot,
    chat,
    target,
    tr(account.language, Text::MainMenu),
    main_menu_keyboard(account.language, ctx.is_admin(account.id)),
  )
  .await
}

pub async fn help(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  target: Option<MessageId>,
  account: &UserRecord,
) -> HandlerResult {
  let mut text = tr(account.language, Text::Help).to_string();
  if ctx.is_admin(account.id) {
    text.push_str("\n\n🛠️ /dashboard /broadcast /setplan");
  }
  ui::show_menu(bot, chat, target, text, back_keyboard(account.language)).await
}

/// Saves the language, then continues onboarding where the user stands.
#[instrument(skip(bot, ctx, account))]
pub async fn on_language(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  code: &str,
) -> anyhow::Result<Option<String>> {
  let Some(language) = Language::from_code(code) else {
    return Ok(None);
  };
  let account = ctx
    .db()
    .set_language(account.id, language)
    .await?
    .context("user vanished while choosing language")?;
  info!(user_id = account.id, language = language.code(), "language chosen");
  if account.terms_accepted {
    show_main_menu(bot, ctx, chat, Some(message_id), &account).await?;
  } else {
    show_terms(bot, chat, Some(message_id), language).await?;
  }
  Ok(Some(tr(language, Text::LanguageSaved).to_string()))
}

#[instrument(skip(bot, ctx, account))]
pub async fn on_terms(
  bot: &Bot,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  choice: &str,
) -> HandlerResult {
  match choice {
    "accept" => {
      let account = ctx
        .db()
        .accept_terms(account.id)
        .await?
        .context("user vanished while accepting terms")?;
      info!(user_id = account.id, "terms accepted");
      show_main_menu(bot, ctx, chat, Some(message_id), &account).await
    },
    "decline" => {
      info!(user_id = account.id, "terms declined");
      ui::edit_menu(
        bot,
        chat,
        message_id,
        tr(account.language, Text::TermsDeclined),
        InlineKeyboardMarkup::default(),
      )
      .await
    },
    _ => Ok(()),
  }
}

#[instrument(skip(bot, dialogue, ctx, account))]
pub async fn on_menu(
  bot: &Bot,
  dialogue: &ParentDialogue,
  ctx: &SharedParent,
  chat: ChatId,
  message_id: MessageId,
  account: &UserRecord,
  value: &str,
) -> HandlerResult {
  match value {
    "main" => {
      dialogue.reset().await?;
      show_main_menu(bot, ctx, chat, Some(message_id), account).await
    },
    "help" => help(bot, ctx, chat, Some(message_id), account).await,
    "lang" => ask_language(bot, chat, Some(message_id)).await,
    "plan" => subscription::show_plan(bot, ctx, chat, Some(message_id), account).await,
    "pin" => pin::begin(bot, dialogue, chat, account).await,
    "bots" => bots::show_list(bot, ctx, chat, Some(message_id), account).await,
    "link" => linking::ask_have_token(bot, chat, Some(message_id), account).await,
    "dashboard" => admin::show_dashboard(bot, ctx, chat, Some(message_id), account).await,
    _ => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::main_menu_keyboard;
  use crate::models::Language;

  fn callbacks(is_admin: bool) -> Vec<String> {
    main_menu_keyboard(Language::En, is_admin)
      .inline_keyboard
      .into_iter()
      .flatten()
      .filter_map(|button| match button.kind {
        teloxide::types::InlineKeyboardButtonKind::CallbackData(data) => Some(data),
        _ => None,
      })
      .collect()
  }

  #[test]
  fn dashboard_button_only_for_operators() {
    assert!(!callbacks(false).contains(&"admin:main".to_string()));
    assert!(callbacks(true).contains(&"admin:main".to_string()));
    assert!(callbacks(false).contains(&"link:start".to_string()));
  }
}
