//! The platform bot: onboarding, bot linking, plans and operator tools.

use std::sync::Arc;

use anyhow::Context;
use teloxide::dispatching::UpdateHandler;
use teloxide::dispatching::dialogue::Dialogue;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::types::Message;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bot::HandlerResult;
use crate::bot::i18n::Text;
use crate::bot::i18n::tr;
use crate::bot::ui;
use crate::config::Config;
use crate::db::Db;
use crate::notifier::Notifier;
use crate::supervisor::Supervisor;

pub mod admin;
pub mod bots;
pub mod commands;
pub mod linking;
pub mod menu;
pub mod pin;
pub mod state;
pub mod subscription;

pub use commands::ParentCommand;
pub use state::ParentState;
pub use state::PinDraft;

pub type ParentDialogueStorage = InMemStorage<ParentState>;
pub type ParentDialogue = Dialogue<ParentState, ParentDialogueStorage>;
pub type SharedParent = Arc<ParentContext>;

pub const APOLOGY: &str = "⚠️ Une erreur est survenue, réessayez plus tard. / Something went wrong, please try again later.";

pub struct ParentContext {
  db: Db,
  supervisor: Supervisor,
  notifier: Notifier,
  config: Config,
}

impl ParentContext {
  pub fn new(db: Db, supervisor: Supervisor, notifier: Notifier, config: Config) -> Self {
    Self {
      db,
      supervisor,
      notifier,
      config,
    }
  }

  pub fn db(&self) -> &Db {
    &self.db
  }

  pub fn supervisor(&self) -> &Supervisor {
    &self.supervisor
  }

  pub fn notifier(&self) -> &Notifier {
    &self.notifier
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn is_admin(&self, user_id: i64) -> bool {
    self.notifier.is_admin(user_id)
  }
}

pub fn build_schema() -> UpdateHandler<anyhow::Error> {
  let message_handler = Update::filter_message()
    .filter(|msg: Message| msg.chat.is_private())
    .enter_dialogue::<Message, ParentDialogueStorage, ParentState>()
    .branch(
      dptree::entry()
        .filter_command::<ParentCommand>()
        .endpoint(handle_command),
    )
    .branch(dptree::case![ParentState::AwaitingToken].endpoint(handle_token_message))
    .branch(dptree::case![ParentState::ConfirmDeletion { bot }].endpoint(handle_deletion_username))
    .branch(dptree::case![ParentState::AwaitingDeletionPin { bot }].endpoint(handle_deletion_pin))
    .branch(dptree::case![ParentState::SetPin(draft)].endpoint(handle_pin_message))
    .branch(dptree::case![ParentState::Broadcast { admin_id }].endpoint(handle_broadcast_message))
    .branch(dptree::endpoint(handle_idle_text));

  let callback_handler = Update::filter_callback_query()
    .enter_dialogue::<CallbackQuery, ParentDialogueStorage, ParentState>()
    .endpoint(handle_callback_query);

  dptree::entry().branch(message_handler).branch(callback_handler)
}

#[instrument(skip_all, fields(chat_id = %msg.chat.id))]
async fn handle_command(
  bot: Bot,
  dialogue: ParentDialogue,
  ctx: SharedParent,
  msg: Message,
  cmd: ParentCommand,
) -> HandlerResult {
  info!(command = ?cmd, "received command");
  let chat = msg.chat.id;
  ui::reply_on_error(&bot, chat, APOLOGY, async {
    let user = msg.from.as_ref().context("message missing sender")?;
    match cmd {
      ParentCommand::Start => return menu::start(&bot, &dialogue, &ctx, &msg).await,
      ParentCommand::Lang => return menu::ask_language(&bot, chat, None).await,
      ParentCommand::Cancel => {
        dialogue.reset().await?;
        let account = menu::account_for(&ctx, user).await?;
        bot.send_message(chat, tr(account.language, Text::Cancelled)).await?;
        return Ok(());
      },
      _ => {},
    }
    let Some(account) = menu::require_account(&bot, &ctx, &msg).await? else {
      return Ok(());
    };
    dialogue.reset().await?;
    match cmd {
      ParentCommand::Help => menu::help(&bot, &ctx, chat, None, &account).await,
      ParentCommand::NewBot => linking::ask_have_token(&bot, chat, None, &account).await,
      ParentCommand::MyBots => bots::show_list(&bot, &ctx, chat, None, &account).await,
      ParentCommand::PlanInfo => subscription::show_plan(&bot, &ctx, chat, None, &account).await,
      ParentCommand::SetPin => pin::begin(&bot, &dialogue, chat, &account).await,
      ParentCommand::CancelDeletion(args) => bots::cancel_deletion_command(&bot, &ctx, &msg, &account, &args).await,
      ParentCommand::Dashboard => admin::show_dashboard(&bot, &ctx, chat, None, &account).await,
      ParentCommand::Broadcast => admin::start_broadcast(&bot, &dialogue, &ctx, chat, &account).await,
      ParentCommand::SetPlan(args) => admin::set_plan(&bot, &ctx, chat, &account, &args).await,
      ParentCommand::Start | ParentCommand::Lang | ParentCommand::Cancel => Ok(()),
    }
  })
  .await
}

#[instrument(skip_all, fields(chat_id = %msg.chat.id))]
async fn handle_token_message(bot: Bot, dialogue: ParentDialogue, ctx: SharedParent, msg: Message) -> HandlerResult {
  let chat = msg.chat.id;
  ui::reply_on_error(&bot, chat, APOLOGY, linking::receive_token(&bot, &dialogue, &ctx, &msg)).await
}

#[instrument(skip_all, fields(chat_id = %msg.chat.id, bot = %bot_name))]
async fn handle_deletion_username(
  bot: Bot,
  dialogue: ParentDialogue,
  ctx: SharedParent,
  msg: Message,
  bot_name: String,
) -> HandlerResult {
  let chat = msg.chat.id;
  ui::reply_on_error(
    &bot,
    chat,
    APOLOGY,
    bots::confirm_username(&bot, &dialogue, &ctx, &msg, &bot_name),
  )
  .await
}

#[instrument(skip_all, fields(chat_id = %msg.chat.id, bot = %bot_name))]
async fn handle_deletion_pin(
  bot: Bot,
  dialogue: ParentDialogue,
  ctx: SharedParent,
  msg: Message,
  bot_name: String,
) -> HandlerResult {
  let chat = msg.chat.id;
  ui::reply_on_error(
    &bot,
    chat,
    APOLOGY,
    bots::receive_deletion_pin(&bot, &dialogue, &ctx, &msg, &bot_name),
  )
  .await
}

#[instrument(skip_all, fields(chat_id = %msg.chat.id))]
async fn handle_pin_message(
  bot: Bot,
  dialogue: ParentDialogue,
  ctx: SharedParent,
  msg: Message,
  draft: PinDraft,
) -> HandlerResult {
  let chat = msg.chat.id;
  ui::reply_on_error(&bot, chat, APOLOGY, pin::receive(&bot, &dialogue, &ctx, &msg, draft)).await
}

#[instrument(skip_all, fields(chat_id = %msg.chat.id, admin_id = admin_id))]
async fn handle_broadcast_message(
  bot: Bot,
  dialogue: ParentDialogue,
  ctx: SharedParent,
  msg: Message,
  admin_id: i64,
) -> HandlerResult {
  let chat = msg.chat.id;
  ui::reply_on_error(
    &bot,
    chat,
    APOLOGY,
    admin::receive_broadcast(&bot, &dialogue, &ctx, &msg, admin_id),
  )
  .await
}

#[instrument(skip_all, fields(chat_id = %msg.chat.id))]
async fn handle_idle_text(bot: Bot, ctx: SharedParent, msg: Message) -> HandlerResult {
  let chat = msg.chat.id;
  ui::reply_on_error(&bot, chat, APOLOGY, async {
    let Some(account) = menu::require_account(&bot, &ctx, &msg).await? else {
      return Ok(());
    };
    menu::send_main_menu(&bot, &ctx, chat, &account).await
  })
  .await
}

#[instrument(skip_all, fields(user_id = query.from.id.0))]
async fn handle_callback_query(
  bot: Bot,
  dialogue: ParentDialogue,
  ctx: SharedParent,
  query: CallbackQuery,
) -> HandlerResult {
  let callback_data = query.data.as_deref().unwrap_or("<empty>");
  info!(callback = callback_data, "handling callback query");
  let mut toast: Option<String> = None;

  let outcome = async {
    let Some((prefix, value)) = query.data.as_deref().and_then(|data| data.split_once(':')) else {
      return Ok(());
    };
    let Some((chat, message_id)) = ui::callback_target(&query) else {
      return Ok(());
    };
    let account = menu::account_for(&ctx, &query.from).await?;
    match prefix {
      "lang" => toast = menu::on_language(&bot, &ctx, chat, message_id, &account, value).await?,
      "terms" => menu::on_terms(&bot, &ctx, chat, message_id, &account, value).await?,
      _ if !account.terms_accepted => menu::show_terms(&bot, chat, Some(message_id), account.language).await?,
      "menu" => menu::on_menu(&bot, &dialogue, &ctx, chat, message_id, &account, value).await?,
      "link" => linking::on_link_callback(&bot, &dialogue, chat, message_id, &account, value).await?,
      "bots" => bots::show_list(&bot, &ctx, chat, Some(message_id), &account).await?,
      "bot" => bots::show_detail(&bot, &ctx, chat, message_id, &account, value).await?,
      "botinfo" => bots::show_info(&bot, &ctx, chat, message_id, &account, value).await?,
      "del" => bots::start_deletion(&bot, &dialogue, &ctx, chat, message_id, &account, value).await?,
      "delok" => toast = bots::final_confirm(&bot, &dialogue, &ctx, chat, message_id, &account, value).await?,
      "undel" => toast = bots::undo_deletion(&bot, &ctx, chat, message_id, &account, value).await?,
      "plan" => toast = subscription::on_plan_callback(&bot, &ctx, chat, message_id, &account, value).await?,
      "admin" => admin::on_admin_callback(&bot, &ctx, chat, message_id, &account, value).await?,
      _ => warn!(prefix, "unknown callback prefix"),
    }
    Ok::<(), anyhow::Error>(())
  }
  .await;

  if let Err(err) = outcome {
    warn!(error = %format!("{err:#}"), callback = callback_data, "callback failed");
    toast = Some(APOLOGY.to_string());
  }
  ui::answer(&bot, &query, toast).await
}
