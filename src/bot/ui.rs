use std::future::Future;

use teloxide::ApiError;
use teloxide::RequestError;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardButton;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::Message;
use teloxide::types::MessageId;
use teloxide::types::ParseMode;
use tracing::info;
use tracing::warn;

use crate::bot::HandlerResult;
use crate::util::MESSAGE_CHUNK_CHARS;
use crate::util::split_message;

pub fn message_text(msg: &Message) -> Option<&str> {
  msg.text().or_else(|| msg.caption())
}

/// Trimmed, non-empty text of a message.
pub fn trimmed_text(msg: &Message) -> Option<&str> {
  message_text(msg).map(str::trim).filter(|text| !text.is_empty())
}

pub fn sender_id(msg: &Message) -> Option<i64> {
  msg.from.as_ref().map(|user| user.id.0 as i64)
}

pub fn is_cancel(text: &str) -> bool {
  text.eq_ignore_ascii_case("cancel") || text.eq_ignore_ascii_case("annuler") || text == "/cancel"
}

/// Chat and message a callback was attached to, when Telegram still has it.
pub fn callback_target(query: &CallbackQuery) -> Option<(ChatId, MessageId)> {
  query.message.as_ref().map(|message| (message.chat().id, message.id()))
}

pub fn button(label: impl Into<String>, data: impl Into<String>) -> InlineKeyboardButton {
  InlineKeyboardButton::callback(label.into(), data.into())
}

pub fn single_button(label: impl Into<String>, data: impl Into<String>) -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![vec![button(label, data)]])
}

/// Edits a menu in place; an unchanged menu is not an error.
pub async fn edit_menu(
  bot: &Bot,
  chat: ChatId,
  message_id: MessageId,
  text: impl Into<String>,
  keyboard: InlineKeyboardMarkup,
) -> HandlerResult {
  let request = bot
    .edit_message_text(chat, message_id, text.into())
    .parse_mode(ParseMode::Html)
    .reply_markup(keyboard);
  match request.await {
    Ok(_) => info!(chat_id = %chat, message_id = %message_id, "updated menu message"),
    Err(RequestError::Api(ApiError::MessageNotModified)) => {
      info!(chat_id = %chat, message_id = %message_id, "menu message already current");
    },
    Err(err) => return Err(err.into()),
  }
  Ok(())
}

/// Edits the callback's message when there is one, otherwise sends a fresh message.
pub async fn show_menu(
  bot: &Bot,
  chat: ChatId,
  target: Option<MessageId>,
  text: impl Into<String>,
  keyboard: InlineKeyboardMarkup,
) -> HandlerResult {
  let text = text.into();
  match target {
    Some(message_id) => edit_menu(bot, chat, message_id, text, keyboard).await,
    None => {
      bot
        .send_message(chat, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await?;
      Ok(())
    },
  }
}

pub async fn send_html(bot: &Bot, chat: ChatId, text: impl Into<String>) -> HandlerResult {
  bot.send_message(chat, text.into()).parse_mode(ParseMode::Html).await?;
  Ok(())
}

/// Sends long text as several messages below Telegram's size limit.
pub async fn send_long(bot: &Bot, chat: ChatId, text: &str) -> HandlerResult {
  for chunk in split_message(text, MESSAGE_CHUNK_CHARS) {
    bot.send_message(chat, chunk).parse_mode(ParseMode::Html).await?;
  }
  Ok(())
}

pub async fn broadcast_text(bot: &Bot, user_ids: &[i64], text: &str) -> usize {
  let mut delivered = 0usize;
  for user_id in user_ids {
    match bot.send_message(ChatId(*user_id), text.to_string()).await {
      Ok(_) => {
        delivered += 1;
      },
      Err(err) => {
        warn!(error = %err, target_user_id = user_id, "failed to deliver broadcast");
      },
    }
  }
  delivered
}

/// Runs a handler body; a failure is logged and the chat gets `apology` instead of silence.
pub async fn reply_on_error<F>(bot: &Bot, chat: ChatId, apology: &str, body: F) -> HandlerResult
where
  F: Future<Output = HandlerResult>,
{
  if let Err(err) = body.await {
    warn!(chat_id = %chat, error = %format!("{err:#}"), "handler failed");
    if let Err(send_err) = bot.send_message(chat, apology.to_string()).await {
      warn!(chat_id = %chat, error = %send_err, "failed to report handler failure");
    }
  }
  Ok(())
}

/// Answers a callback query, optionally with a toast.
pub async fn answer(bot: &Bot, query: &CallbackQuery, toast: Option<String>) -> HandlerResult {
  let request = bot.answer_callback_query(query.id.clone());
  match toast {
    Some(text) => request.text(text).await?,
    None => request.await?,
  };
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::is_cancel;

  #[test]
  fn recognises_cancel_words() {
    assert!(is_cancel("Cancel"));
    assert!(is_cancel("annuler"));
    assert!(!is_cancel("cancelled order"));
  }
}
