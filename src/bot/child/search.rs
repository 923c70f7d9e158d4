use anyhow::Context;
use chrono::Utc;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::types::InlineKeyboardButton;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::InputFile;
use teloxide::types::Message;
use teloxide::utils::html;
use tracing::info;
use tracing::instrument;

use super::SharedChild;
use super::account::member_for;
use super::account::require_owner;
use crate::bot::HandlerResult;
use crate::bot::ui;
use crate::db::CreditError;
use crate::models::IndexedDocument;
use crate::search::INDEXABLE_EXTENSIONS;
use crate::search::MAX_DOCUMENT_BYTES;
use crate::search::SearchHit;
use crate::search::excerpt;
use crate::search::extract_keywords;
use crate::search::is_indexable;
use crate::search::parse_query;
use crate::search::search as rank_documents;
use crate::util::truncate_text;

const EXCERPT_WIDTH: usize = 100;
const MAX_SEARCH_COST: i64 = 1000;

fn document_title(file_name: &str, caption: Option<&str>) -> String {
  caption
    .map(str::trim)
    .filter(|caption| !caption.is_empty())
    .map(|caption| truncate_text(caption, 80))
    .unwrap_or_else(|| {
      file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| file_name.to_string())
    })
}

/// Owners upload text documents in private chat to make them searchable.
#[instrument(skip(bot, ctx, msg))]
pub async fn index_upload(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  if !msg.chat.is_private() {
    return Ok(());
  }
  let Some(owner_id) = require_owner(bot, ctx, msg).await? else {
    return Ok(());
  };
  let doc = msg.document().context("message missing document")?;
  let file_name = doc.file_name.clone().unwrap_or_else(|| "document.txt".to_string());
  if !is_indexable(&file_name) {
    bot
      .send_message(
        msg.chat.id,
        format!("Only text files can be indexed ({}).", INDEXABLE_EXTENSIONS.join(", ")),
      )
      .await?;
    return Ok(());
  }
  if doc.file.size > MAX_DOCUMENT_BYTES {
    bot
      .send_message(
        msg.chat.id,
        format!("File too large: the limit is {} KiB.", MAX_DOCUMENT_BYTES / 1024),
      )
      .await?;
    return Ok(());
  }

  let file = bot.get_file(doc.file.id.clone()).await?;
  let mut buffer = Vec::new();
  bot.download_file(&file.path, &mut buffer).await?;
  let content = String::from_utf8_lossy(&buffer).into_owned();
  if content.trim().is_empty() {
    bot.send_message(msg.chat.id, "That file is empty.").await?;
    return Ok(());
  }
  let keywords = extract_keywords(&content);
  let document = ctx
    .db()
    .index_document(IndexedDocument {
      id: 0,
      bot: ctx.username().to_string(),
      title: document_title(&file_name, msg.caption()),
      file_name,
      file_id: doc.file.id.clone(),
      uploaded_by: owner_id,
      content,
      keywords,
      indexed_at: Utc::now(),
    })
    .await?;
  info!(document_id = document.id, bytes = buffer.len(), "document uploaded");
  let preview = if document.keywords.is_empty() {
    "none".to_string()
  } else {
    document.keywords.iter().take(8).cloned().collect::<Vec<_>>().join(", ")
  };
  ui::send_html(
    bot,
    msg.chat.id,
    format!(
      "📚 Indexed <b>{}</b> as #{}.\nKeywords: {}",
      html::escape(&document.title),
      document.id,
      html::escape(&preview)
    ),
  )
  .await
}

fn render_hits(hits: &[SearchHit<'_>], raw_query: &str) -> String {
  let query = parse_query(raw_query);
  let mut text = format!("🔎 <b>{} result(s)</b> for <i>{}</i>", hits.len(), html::escape(raw_query));
  for hit in hits {
    text.push_str(&format!(
      "\n\n#{} <b>{}</b> ({})\n{}",
      hit.document.id,
      html::escape(&hit.document.title),
      hit.score,
      html::escape(&excerpt(&hit.document.content, &query, EXCERPT_WIDTH))
    ));
  }
  text
}

fn results_keyboard(hits: &[SearchHit<'_>]) -> InlineKeyboardMarkup {
  let rows: Vec<Vec<InlineKeyboardButton>> = hits
    .iter()
    .map(|hit| {
      vec![ui::button(
        format!("📄 {}", truncate_text(&hit.document.title, 40)),
        format!("doc:{}", hit.document.id),
      )]
    })
    .collect();
  InlineKeyboardMarkup::new(rows)
}

#[instrument(skip(bot, ctx, msg))]
pub async fn search(bot: &Bot, ctx: &SharedChild, msg: &Message, raw_query: &str) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let raw_query = raw_query.trim();
  let query = parse_query(raw_query);
  if query.is_empty() {
    bot
      .send_message(
        msg.chat.id,
        "Usage: /search <words>\nUse \"quotes\" for phrases, tag:word for keywords and -word to exclude.",
      )
      .await?;
    return Ok(());
  }
  let member = member_for(ctx, user).await?;
  let cost = ctx
    .db()
    .get_bot(ctx.username())
    .await?
    .map(|record| record.settings.search_cost)
    .unwrap_or_default();
  if cost > 0 && !ctx.is_owner(member.user_id) {
    match ctx
      .db()
      .debit(ctx.username(), member.user_id, cost, "document search")
      .await
    {
      Ok(balance) => info!(cost, balance, "charged for search"),
      Err(CreditError::Insufficient { balance, needed }) => {
        bot
          .send_message(
            msg.chat.id,
            format!("💰 A search costs {needed} credits; you have {balance}. /invite friends to earn more."),
          )
          .await?;
        return Ok(());
      },
      Err(err) => return Err(err.into()),
    }
  }

  let documents = ctx.db().documents_of_bot(ctx.username()).await?;
  let hits = rank_documents(&documents, &query);
  info!(results = hits.len(), "search finished");
  if hits.is_empty() {
    bot.send_message(msg.chat.id, "No document matches your search.").await?;
    return Ok(());
  }
  let text = render_hits(&hits, raw_query);
  ui::send_long(bot, msg.chat.id, &text).await?;
  bot
    .send_message(msg.chat.id, "Open a document:")
    .reply_markup(results_keyboard(&hits))
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn list_documents(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  let documents = ctx.db().documents_of_bot(ctx.username()).await?;
  if documents.is_empty() {
    bot
      .send_message(msg.chat.id, "📚 No documents yet.")
      .await?;
    return Ok(());
  }
  let mut text = format!("📚 <b>{} document(s)</b>", documents.len());
  for document in &documents {
    text.push_str(&format!(
      "\n#{} {} · {}",
      document.id,
      html::escape(&document.title),
      document.indexed_at.format("%Y-%m-%d")
    ));
  }
  ui::send_long(bot, msg.chat.id, &text).await
}

#[instrument(skip(bot, ctx, msg))]
pub async fn delete_document(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if require_owner(bot, ctx, msg).await?.is_none() {
    return Ok(());
  }
  let Some(id) = args.trim().trim_start_matches('#').parse::<u64>().ok() else {
    bot.send_message(msg.chat.id, "Usage: /deldoc <id>").await?;
    return Ok(());
  };
  let reply = if ctx.db().delete_document(ctx.username(), id).await? {
    info!(document_id = id, "document removed");
    format!("🗑️ Document #{id} removed.")
  } else {
    format!("No document #{id}.")
  };
  bot.send_message(msg.chat.id, reply).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn set_search_cost(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if require_owner(bot, ctx, msg).await?.is_none() {
    return Ok(());
  }
  let Some(cost) = args
    .trim()
    .parse::<i64>()
    .ok()
    .filter(|cost| (0 ..= MAX_SEARCH_COST).contains(cost))
  else {
    bot
      .send_message(msg.chat.id, format!("Usage: /setsearchcost <0-{MAX_SEARCH_COST}>"))
      .await?;
    return Ok(());
  };
  ctx
    .db()
    .update_bot_settings(ctx.username(), |settings| settings.search_cost = cost)
    .await?;
  let reply = if cost == 0 {
    "✅ Searching is now free.".to_string()
  } else {
    format!("✅ Each search now costs {cost} credits.")
  };
  bot.send_message(msg.chat.id, reply).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, query))]
pub async fn on_document_callback(
  bot: &Bot,
  ctx: &SharedChild,
  query: &CallbackQuery,
  value: &str,
) -> anyhow::Result<Option<String>> {
  let Some(id) = value.parse::<u64>().ok() else {
    return Ok(None);
  };
  let Some(document) = ctx.db().get_document(ctx.username(), id).await? else {
    return Ok(Some("This document was removed.".to_string()));
  };
  let Some((chat, _)) = ui::callback_target(query) else {
    return Ok(None);
  };
  bot
    .send_document(chat, InputFile::file_id(document.file_id.clone()))
    .caption(document.title.clone())
    .await?;
  Ok(None)
}

#[cfg(test)]
mod tests {
  use super::document_title;

  #[test]
  fn title_prefers_caption_then_file_stem() {
    assert_eq!(document_title("guide.md", Some("  Setup guide ")), "Setup guide");
    assert_eq!(document_title("guide.md", Some("   ")), "guide");
    assert_eq!(document_title("notes", None), "notes");
  }
}
