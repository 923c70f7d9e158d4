//! Handlers of the bots run on behalf of platform users.
//!
//! Every child bot shares this schema; a [`ChildContext`] tells the handlers
//! which bot they serve and who owns it.

use std::sync::Arc;

use teloxide::dispatching::UpdateHandler;
use teloxide::dispatching::dialogue::Dialogue;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::types::Me;
use teloxide::types::Message;
use teloxide::utils::command::BotCommands;
use tracing::info;
use tracing::instrument;

use crate::bot::HandlerResult;
use crate::bot::ui;
use crate::db::Db;
use crate::notifier::Notifier;
use crate::security::FloodGuard;

pub mod account;
pub mod commands;
pub mod moderation;
pub mod schedule;
pub mod search;
pub mod shop;
pub mod state;

pub use commands::ChildCommand;
pub use state::ChildState;
pub use state::ProductDraft;

pub type ChildDialogueStorage = InMemStorage<ChildState>;
pub type ChildDialogue = Dialogue<ChildState, ChildDialogueStorage>;
pub type SharedChild = Arc<ChildContext>;

pub const APOLOGY: &str = "⚠️ Something went wrong, please try again later.";

pub struct ChildContext {
  db: Db,
  username: String,
  owner_id: i64,
  notifier: Notifier,
  flood: FloodGuard,
}

impl ChildContext {
  pub fn new(db: Db, username: String, owner_id: i64, notifier: Notifier) -> Self {
    Self {
      db,
      username,
      owner_id,
      notifier,
      flood: FloodGuard::default(),
    }
  }

  pub fn db(&self) -> &Db {
    &self.db
  }

  /// Username of the bot these handlers serve; the storage scope of all its data.
  pub fn username(&self) -> &str {
    &self.username
  }

  pub fn owner_id(&self) -> i64 {
    self.owner_id
  }

  pub fn is_owner(&self, user_id: i64) -> bool {
    self.owner_id == user_id
  }

  pub fn notifier(&self) -> &Notifier {
    &self.notifier
  }

  pub fn flood(&self) -> &FloodGuard {
    &self.flood
  }
}

pub fn build_schema() -> UpdateHandler<anyhow::Error> {
  let message_handler = Update::filter_message()
    .enter_dialogue::<Message, ChildDialogueStorage, ChildState>()
    .branch(
      dptree::entry()
        .filter_command::<ChildCommand>()
        .endpoint(handle_command),
    )
    .branch(dptree::filter(|msg: Message| msg.new_chat_members().is_some()).endpoint(handle_new_members))
    .branch(dptree::filter(|msg: Message| msg.left_chat_member().is_some()).endpoint(handle_left_member))
    .branch(dptree::case![ChildState::AddProduct(draft)].endpoint(handle_product_draft))
    .branch(dptree::filter(|msg: Message| msg.document().is_some()).endpoint(handle_document))
    .branch(dptree::endpoint(handle_plain_message));

  let callback_handler = Update::filter_callback_query()
    .enter_dialogue::<CallbackQuery, ChildDialogueStorage, ChildState>()
    .endpoint(handle_callback_query);

  let channel_handler = Update::filter_channel_post().endpoint(handle_channel_post);

  dptree::entry()
    .branch(message_handler)
    .branch(callback_handler)
    .branch(channel_handler)
}

#[instrument(skip_all, fields(bot = %ctx.username(), chat_id = %msg.chat.id))]
async fn handle_command(
  bot: Bot,
  dialogue: ChildDialogue,
  ctx: SharedChild,
  me: Me,
  msg: Message,
  cmd: ChildCommand,
) -> HandlerResult {
  info!(command = ?cmd, "received command");
  let chat = msg.chat.id;
  ui::reply_on_error(&bot, chat, APOLOGY, async {
    match cmd {
      ChildCommand::Start(payload) => account::start(&bot, &dialogue, &ctx, &msg, &payload).await,
      ChildCommand::Help => {
        bot
          .send_message(chat, ChildCommand::descriptions().to_string())
          .await?;
        Ok(())
      },
      ChildCommand::Credits => account::credits(&bot, &ctx, &msg).await,
      ChildCommand::Invite => account::invite(&bot, &ctx, &me, &msg).await,
      ChildCommand::Referrals => account::referrals(&bot, &ctx, &msg).await,
      ChildCommand::Grant(args) => account::grant(&bot, &ctx, &msg, &args).await,
      ChildCommand::SetWelcome(text) => account::set_welcome(&bot, &ctx, &msg, &text).await,
      ChildCommand::Stats => account::stats(&bot, &ctx, &msg).await,
      ChildCommand::Cancel => {
        dialogue.reset().await?;
        bot.send_message(chat, "❌ Cancelled.").await?;
        Ok(())
      },
      ChildCommand::Shop => shop::show_shop(&bot, &ctx, chat, None).await,
      ChildCommand::Orders => shop::orders(&bot, &ctx, &msg).await,
      ChildCommand::AddProduct => shop::start_wizard(&bot, &dialogue, &ctx, &msg).await,
      ChildCommand::DelProduct(args) => shop::delete_product(&bot, &ctx, &msg, &args).await,
      ChildCommand::Deliver(args) => shop::mark_delivered(&bot, &ctx, &msg, &args).await,
      ChildCommand::Search(query) => search::search(&bot, &ctx, &msg, &query).await,
      ChildCommand::Docs => search::list_documents(&bot, &ctx, &msg).await,
      ChildCommand::DelDoc(args) => search::delete_document(&bot, &ctx, &msg, &args).await,
      ChildCommand::SetSearchCost(args) => search::set_search_cost(&bot, &ctx, &msg, &args).await,
      ChildCommand::Schedule(args) => schedule::create(&bot, &ctx, &msg, &args).await,
      ChildCommand::Schedules => schedule::list(&bot, &ctx, &msg).await,
      ChildCommand::Unschedule(args) => schedule::remove(&bot, &ctx, &msg, &args).await,
      ChildCommand::Kick(args) => moderation::kick(&bot, &ctx, &msg, &args).await,
      ChildCommand::Ban(args) => moderation::ban(&bot, &ctx, &msg, &args).await,
      ChildCommand::Unban(args) => moderation::unban(&bot, &ctx, &msg, &args).await,
      ChildCommand::Mute(args) => moderation::mute(&bot, &ctx, &msg, &args).await,
      ChildCommand::Unmute(args) => moderation::unmute(&bot, &ctx, &msg, &args).await,
      ChildCommand::Warn(args) => moderation::warn_member(&bot, &ctx, &msg, &args).await,
      ChildCommand::ClearWarns(args) => moderation::clear_warns(&bot, &ctx, &msg, &args).await,
      ChildCommand::BanWord(word) => moderation::ban_word(&bot, &ctx, &msg, &word).await,
      ChildCommand::UnbanWord(word) => moderation::unban_word(&bot, &ctx, &msg, &word).await,
      ChildCommand::SetWarnLimit(args) => moderation::set_warn_limit(&bot, &ctx, &msg, &args).await,
      ChildCommand::Pin(text) => moderation::pin(&bot, &ctx, &msg, &text).await,
      ChildCommand::Unpin => moderation::unpin(&bot, &ctx, &msg).await,
      ChildCommand::Captcha(mode) => moderation::set_captcha(&bot, &ctx, &msg, &mode).await,
      ChildCommand::Rules => moderation::rules(&bot, &ctx, &msg).await,
    }
  })
  .await
}

#[instrument(skip_all, fields(bot = %ctx.username(), chat_id = %msg.chat.id))]
async fn handle_new_members(bot: Bot, ctx: SharedChild, me: Me, msg: Message) -> HandlerResult {
  let chat = msg.chat.id;
  ui::reply_on_error(&bot, chat, APOLOGY, moderation::on_new_members(&bot, &ctx, &me, &msg)).await
}

#[instrument(skip_all, fields(bot = %ctx.username(), chat_id = %msg.chat.id))]
async fn handle_left_member(ctx: SharedChild, me: Me, msg: Message) -> HandlerResult {
  if let Err(err) = moderation::on_left_member(&ctx, &me, &msg).await {
    tracing::warn!(error = %format!("{err:#}"), "failed to forget group");
  }
  Ok(())
}

#[instrument(skip_all, fields(bot = %ctx.username(), chat_id = %msg.chat.id))]
async fn handle_product_draft(
  bot: Bot,
  dialogue: ChildDialogue,
  ctx: SharedChild,
  msg: Message,
  draft: ProductDraft,
) -> HandlerResult {
  let chat = msg.chat.id;
  ui::reply_on_error(
    &bot,
    chat,
    APOLOGY,
    shop::handle_draft_message(&bot, &dialogue, &ctx, &msg, draft),
  )
  .await
}

#[instrument(skip_all, fields(bot = %ctx.username(), chat_id = %msg.chat.id))]
async fn handle_document(bot: Bot, ctx: SharedChild, msg: Message) -> HandlerResult {
  let chat = msg.chat.id;
  ui::reply_on_error(&bot, chat, APOLOGY, search::index_upload(&bot, &ctx, &msg)).await
}

/// Group chatter goes through auto-moderation; private chatter gets a hint.
#[instrument(skip_all, fields(bot = %ctx.username(), chat_id = %msg.chat.id))]
async fn handle_plain_message(bot: Bot, ctx: SharedChild, me: Me, msg: Message) -> HandlerResult {
  let chat = msg.chat.id;
  if msg.chat.is_group() || msg.chat.is_supergroup() {
    if let Err(err) = moderation::on_group_message(&bot, &ctx, &me, &msg).await {
      tracing::warn!(error = %format!("{err:#}"), "auto-moderation failed");
    }
    return Ok(());
  }
  if msg.chat.is_private() && ui::trimmed_text(&msg).is_some() {
    bot
      .send_message(chat, "🤖 Use /help to see what I can do, or /shop to browse.")
      .await?;
  }
  Ok(())
}

#[instrument(skip_all, fields(bot = %ctx.username(), chat_id = %msg.chat.id))]
async fn handle_channel_post(bot: Bot, ctx: SharedChild, msg: Message) -> HandlerResult {
  if let Err(err) = moderation::on_channel_post(&bot, &ctx, &msg).await {
    tracing::warn!(error = %format!("{err:#}"), "channel registration failed");
  }
  Ok(())
}

#[instrument(skip_all, fields(bot = %ctx.username(), user_id = query.from.id.0))]
async fn handle_callback_query(
  bot: Bot,
  dialogue: ChildDialogue,
  ctx: SharedChild,
  query: CallbackQuery,
) -> HandlerResult {
  let callback_data = query.data.as_deref().unwrap_or("<empty>");
  info!(callback = callback_data, "handling callback query");
  let mut toast: Option<String> = None;

  let outcome = async {
    let Some((prefix, value)) = query.data.as_deref().and_then(|data| data.split_once(':')) else {
      return Ok(());
    };
    match prefix {
      "shop" => {
        let target = ui::callback_target(&query);
        if let Some((chat, message_id)) = target {
          shop::show_shop(&bot, &ctx, chat, Some(message_id)).await?;
        }
      },
      "prod" => toast = shop::on_product_callback(&bot, &ctx, &query, value).await?,
      "buy" => toast = shop::on_buy_callback(&bot, &ctx, &query, value).await?,
      "buyok" => toast = shop::on_confirm_purchase(&bot, &ctx, &query, value).await?,
      "cur" | "dlv" => toast = shop::on_wizard_choice(&bot, &dialogue, &ctx, &query, prefix, value).await?,
      "verify" => toast = moderation::on_verify(&bot, &ctx, &query, value).await?,
      "doc" => toast = search::on_document_callback(&bot, &ctx, &query, value).await?,
      _ => {},
    }
    Ok::<(), anyhow::Error>(())
  }
  .await;

  if let Err(err) = outcome {
    tracing::warn!(error = %format!("{err:#}"), callback = callback_data, "callback failed");
    toast = Some(APOLOGY.to_string());
  }
  ui::answer(&bot, &query, toast).await
}
