use anyhow::Context;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::InputFile;
use teloxide::types::Message;
use teloxide::types::MessageId;
use teloxide::types::ParseMode;
use teloxide::types::User;
use teloxide::utils::html;
use thiserror::Error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::ChildDialogue;
use super::ChildState;
use super::ProductDraft;
use super::SharedChild;
use super::account::member_for;
use super::account::require_owner;
use super::state::ProductStage;
use crate::bot::HandlerResult;
use crate::bot::ui;
use crate::db::CreditError;
use crate::models::Currency;
use crate::models::DeliveryMode;
use crate::models::Order;
use crate::models::OrderStatus;
use crate::models::Product;
use crate::util::MoneyError;
use crate::util::format_price;
use crate::util::parse_money_to_cents;
use crate::util::truncate_text;

const MAX_NAME_CHARS: usize = 64;
const MAX_DESCRIPTION_CHARS: usize = 900;
const BUTTON_LABEL_CHARS: usize = 40;
const ORDER_LIST_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum PurchaseError {
  #[error("product not found")]
  NotFound,
  #[error("owners cannot buy their own products")]
  OwnProduct,
  #[error(transparent)]
  Credits(#[from] CreditError),
  #[error(transparent)]
  Storage(#[from] anyhow::Error),
}

impl PurchaseError {
  fn user_message(&self) -> String {
    match self {
      Self::NotFound => "This product is no longer available.".to_string(),
      Self::OwnProduct => "You cannot buy your own product.".to_string(),
      Self::Credits(CreditError::Insufficient { balance, needed }) => {
        format!("Not enough credits: you have {balance}, this costs {needed}.")
      },
      Self::Credits(_) | Self::Storage(_) => "Purchase failed, try again later.".to_string(),
    }
  }
}

pub fn render_product(product: &Product) -> String {
  let delivery = match product.delivery {
    DeliveryMode::Instant => "⚡ Instant delivery",
    DeliveryMode::Manual => "📬 Delivered by the seller",
  };
  format!(
    "🛍️ <b>{}</b> (#{})\n\n{}\n\n💵 {}\n{}",
    html::escape(&product.name),
    product.id,
    html::escape(&product.description),
    format_price(product.price_cents, product.currency),
    delivery
  )
}

fn shop_keyboard(products: &[Product]) -> InlineKeyboardMarkup {
  let rows = products
    .iter()
    .map(|product| {
      let label = format!(
        "{} · {}",
        truncate_text(&product.name, BUTTON_LABEL_CHARS),
        format_price(product.price_cents, product.currency)
      );
      vec![ui::button(label, format!("prod:{}", product.id))]
    })
    .collect::<Vec<_>>();
  InlineKeyboardMarkup::new(rows)
}

fn product_keyboard(product_id: u64) -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![
    vec![ui::button("🛒 Buy", format!("buy:{product_id}"))],
    vec![ui::button("⬅️ Back to shop", "shop:list")],
  ])
}

fn confirm_keyboard(product_id: u64) -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![vec![
    ui::button("✅ Confirm", format!("buyok:{product_id}")),
    ui::button("❌ Cancel", "shop:list"),
  ]])
}

fn currency_keyboard() -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![vec![
    ui::button("€ EUR", "cur:eur"),
    ui::button("$ USD", "cur:usd"),
    ui::button("🪙 Credits", "cur:credits"),
  ]])
}

fn delivery_keyboard() -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![vec![
    ui::button("⚡ Instant", "dlv:instant"),
    ui::button("📬 Manual", "dlv:manual"),
  ]])
}

#[instrument(skip(bot, ctx))]
pub async fn show_shop(bot: &Bot, ctx: &SharedChild, chat: ChatId, target: Option<MessageId>) -> HandlerResult {
  let products = ctx.db().list_products(ctx.username()).await?;
  if products.is_empty() {
    bot
      .send_message(chat, "🛍️ The shop is empty for now. Come back soon!")
      .await?;
    return Ok(());
  }
  let text = format!("🛍️ <b>Shop</b>\n\n{} products available. Pick one:", products.len());
  ui::show_menu(bot, chat, target, text, shop_keyboard(&products)).await
}

fn parse_id(value: &str) -> Option<u64> {
  value.trim().trim_start_matches('#').parse::<u64>().ok()
}

#[instrument(skip(bot, ctx, query))]
pub async fn on_product_callback(
  bot: &Bot,
  ctx: &SharedChild,
  query: &CallbackQuery,
  value: &str,
) -> anyhow::Result<Option<String>> {
  let Some((chat, _)) = ui::callback_target(query) else {
    return Ok(None);
  };
  let product = match parse_id(value) {
    Some(id) => ctx.db().get_product(ctx.username(), id).await?,
    None => None,
  };
  let Some(product) = product else {
    return Ok(Some("This product is no longer available.".to_string()));
  };
  let caption = render_product(&product);
  match &product.photo {
    Some(photo) => {
      bot
        .send_photo(chat, InputFile::file_id(photo.clone()))
        .caption(caption)
        .parse_mode(ParseMode::Html)
        .reply_markup(product_keyboard(product.id))
        .await?;
    },
    None => {
      bot
        .send_message(chat, caption)
        .parse_mode(ParseMode::Html)
        .reply_markup(product_keyboard(product.id))
        .await?;
    },
  }
  Ok(None)
}

#[instrument(skip(bot, ctx, query))]
pub async fn on_buy_callback(
  bot: &Bot,
  ctx: &SharedChild,
  query: &CallbackQuery,
  value: &str,
) -> anyhow::Result<Option<String>> {
  let Some((chat, _)) = ui::callback_target(query) else {
    return Ok(None);
  };
  let product = match parse_id(value) {
    Some(id) => ctx.db().get_product(ctx.username(), id).await?,
    None => None,
  };
  let Some(product) = product else {
    return Ok(Some("This product is no longer available.".to_string()));
  };
  let mut text = format!(
    "🧾 Buy <b>{}</b> for {}?",
    html::escape(&product.name),
    format_price(product.price_cents, product.currency)
  );
  if product.currency == Currency::Credits {
    let member = member_for(ctx, &query.from).await?;
    text.push_str(&format!("\n\n💰 Your balance: {} credits", member.credits));
  } else {
    text.push_str("\n\nThe seller will contact you to arrange payment.");
  }
  bot
    .send_message(chat, text)
    .parse_mode(ParseMode::Html)
    .reply_markup(confirm_keyboard(product.id))
    .await?;
  Ok(None)
}

/// Credit-priced products are paid on the spot; the rest become pending orders.
async fn purchase(ctx: &SharedChild, buyer: &User, product_id: u64) -> Result<(Product, Order), PurchaseError> {
  let buyer_id = buyer.id.0 as i64;
  let product = ctx
    .db()
    .get_product(ctx.username(), product_id)
    .await?
    .ok_or(PurchaseError::NotFound)?;
  if ctx.is_owner(buyer_id) {
    return Err(PurchaseError::OwnProduct);
  }
  member_for(ctx, buyer).await?;
  let order = Order {
    id: 0,
    bot: ctx.username().to_string(),
    product_id: product.id,
    product_name: product.name.clone(),
    buyer_id,
    price_cents: product.price_cents,
    currency: product.currency,
    status: OrderStatus::Pending,
    created_at: Utc::now(),
  };
  let order = if product.currency == Currency::Credits {
    ctx.db().place_paid_order(order, product.credit_cost()).await?
  } else {
    ctx.db().create_order(order).await?
  };
  Ok((product, order))
}

#[instrument(skip(bot, ctx, query))]
pub async fn on_confirm_purchase(
  bot: &Bot,
  ctx: &SharedChild,
  query: &CallbackQuery,
  value: &str,
) -> anyhow::Result<Option<String>> {
  let Some((chat, message_id)) = ui::callback_target(query) else {
    return Ok(None);
  };
  let Some(product_id) = parse_id(value) else {
    return Ok(None);
  };
  let (product, order) = match purchase(ctx, &query.from, product_id).await {
    Ok(result) => result,
    Err(PurchaseError::Storage(err)) => return Err(err),
    Err(err) => {
      info!(error = %err, product_id, "purchase refused");
      return Ok(Some(err.user_message()));
    },
  };
  info!(order_id = order.id, product_id, status = ?order.status, "order placed");
  ui::edit_menu(
    bot,
    chat,
    message_id,
    format!("✅ Order #{} for <b>{}</b> placed.", order.id, html::escape(&product.name)),
    InlineKeyboardMarkup::default(),
  )
  .await?;

  if order.status == OrderStatus::Paid && product.delivery == DeliveryMode::Instant {
    bot
      .send_message(chat, format!("📦 Your item:\n\n{}", product.description))
      .await?;
    ctx
      .db()
      .set_order_status(ctx.username(), order.id, OrderStatus::Delivered)
      .await?;
  } else if order.status == OrderStatus::Pending {
    bot
      .send_message(
        chat,
        "📝 The seller has been notified and will contact you to arrange payment.",
      )
      .await?;
  } else {
    bot
      .send_message(chat, "📝 Paid. The seller has been notified and will deliver soon.")
      .await?;
  }

  let buyer = match &query.from.username {
    Some(username) => format!("@{username}"),
    None => query.from.first_name.clone(),
  };
  let note = format!(
    "🛒 New order #{} on @{}: {} for {} by {} (id {}). Status: {:?}.",
    order.id,
    ctx.username(),
    product.name,
    format_price(order.price_cents, order.currency),
    buyer,
    order.buyer_id,
    order.status
  );
  notify_owner(bot, ctx, &note).await;
  Ok(Some("Order placed".to_string()))
}

/// Tries the child bot first; the owner may never have opened it.
async fn notify_owner(bot: &Bot, ctx: &SharedChild, text: &str) {
  if let Err(err) = bot.send_message(ChatId(ctx.owner_id()), text.to_string()).await {
    warn!(error = %err, "owner unreachable through child bot, using parent bot");
    ctx.notifier().notify_user(ctx.owner_id(), text).await;
  }
}

fn render_orders(orders: &[Order]) -> String {
  orders
    .iter()
    .map(|order| {
      format!(
        "#{} · {} · {} · {:?} · buyer {} · {}",
        order.id,
        html::escape(&order.product_name),
        format_price(order.price_cents, order.currency),
        order.status,
        order.buyer_id,
        order.created_at.format("%Y-%m-%d")
      )
    })
    .collect::<Vec<_>>()
    .join("\n")
}

#[instrument(skip(bot, ctx, msg))]
pub async fn orders(bot: &Bot, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  let user_id = ui::sender_id(msg).context("message missing sender")?;
  let (title, orders) = if ctx.is_owner(user_id) {
    (
      "📋 <b>Latest orders</b>",
      ctx.db().orders_for_bot(ctx.username(), ORDER_LIST_LIMIT).await?,
    )
  } else {
    (
      "📋 <b>Your orders</b>",
      ctx
        .db()
        .orders_for_buyer(ctx.username(), user_id, ORDER_LIST_LIMIT)
        .await?,
    )
  };
  if orders.is_empty() {
    bot.send_message(msg.chat.id, "No orders yet.").await?;
    return Ok(());
  }
  ui::send_long(bot, msg.chat.id, &format!("{title}\n\n{}", render_orders(&orders))).await
}

#[instrument(skip(bot, ctx, msg))]
pub async fn mark_delivered(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if require_owner(bot, ctx, msg).await?.is_none() {
    return Ok(());
  }
  let Some(order_id) = parse_id(args) else {
    bot.send_message(msg.chat.id, "Usage: /deliver <order id>").await?;
    return Ok(());
  };
  match ctx
    .db()
    .set_order_status(ctx.username(), order_id, OrderStatus::Delivered)
    .await?
  {
    Some(order) => {
      bot
        .send_message(msg.chat.id, format!("✅ Order #{order_id} marked delivered."))
        .await?;
      if let Err(err) = bot
        .send_message(
          ChatId(order.buyer_id),
          format!("📦 Your order #{order_id} ({}) has been delivered.", order.product_name),
        )
        .await
      {
        warn!(error = %err, order_id, "failed to notify buyer");
      }
    },
    None => {
      bot.send_message(msg.chat.id, "Order not found.").await?;
    },
  }
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
pub async fn delete_product(bot: &Bot, ctx: &SharedChild, msg: &Message, args: &str) -> HandlerResult {
  if require_owner(bot, ctx, msg).await?.is_none() {
    return Ok(());
  }
  let Some(product_id) = parse_id(args) else {
    bot.send_message(msg.chat.id, "Usage: /delproduct <id>").await?;
    return Ok(());
  };
  let reply = if ctx.db().delete_product(ctx.username(), product_id).await? {
    info!(product_id, "deleted product");
    format!("🗑 Product #{product_id} removed.")
  } else {
    "Product not found.".to_string()
  };
  bot.send_message(msg.chat.id, reply).await?;
  Ok(())
}

#[instrument(skip(bot, dialogue, ctx, msg))]
pub async fn start_wizard(bot: &Bot, dialogue: &ChildDialogue, ctx: &SharedChild, msg: &Message) -> HandlerResult {
  let Some(owner_id) = require_owner(bot, ctx, msg).await? else {
    return Ok(());
  };
  if !msg.chat.is_private() {
    bot
      .send_message(msg.chat.id, "Add products in a private chat with me.")
      .await?;
    return Ok(());
  }
  dialogue
    .update(ChildState::AddProduct(ProductDraft::new(owner_id)))
    .await?;
  bot
    .send_message(msg.chat.id, "📦 New product. Send its name (or cancel to stop):")
    .await?;
  Ok(())
}

#[instrument(skip(bot, dialogue, ctx, msg, draft), fields(stage = ?draft.stage))]
pub async fn handle_draft_message(
  bot: &Bot,
  dialogue: &ChildDialogue,
  ctx: &SharedChild,
  msg: &Message,
  mut draft: ProductDraft,
) -> HandlerResult {
  let chat = msg.chat.id;
  if ui::sender_id(msg) != Some(draft.owner_id) {
    return Ok(());
  }
  let text = ui::trimmed_text(msg);
  if text.is_some_and(ui::is_cancel) {
    dialogue.reset().await?;
    bot.send_message(chat, "❌ Product creation cancelled.").await?;
    return Ok(());
  }

  match draft.stage {
    ProductStage::Name => {
      let Some(name) = text else {
        bot.send_message(chat, "📝 Please send the product name.").await?;
        return Ok(());
      };
      draft.name = Some(truncate_text(name, MAX_NAME_CHARS));
      draft.stage = ProductStage::Description;
      dialogue.update(ChildState::AddProduct(draft)).await?;
      bot
        .send_message(
          chat,
          "🧾 Send the description. For instant delivery this is what buyers receive.",
        )
        .await?;
    },
    ProductStage::Description => {
      let Some(description) = text else {
        bot.send_message(chat, "🧾 Please send a description.").await?;
        return Ok(());
      };
      draft.description = Some(truncate_text(description, MAX_DESCRIPTION_CHARS));
      draft.stage = ProductStage::Price;
      dialogue.update(ChildState::AddProduct(draft)).await?;
      bot.send_message(chat, "💵 Send the price, e.g. 9.99:").await?;
    },
    ProductStage::Price => {
      let Some(raw) = text else {
        bot.send_message(chat, "💵 Please send the price, e.g. 9.99.").await?;
        return Ok(());
      };
      match parse_money_to_cents(raw) {
        Ok(cents) => {
          draft.price_cents = Some(cents);
          draft.stage = ProductStage::Currency;
          dialogue.update(ChildState::AddProduct(draft)).await?;
          bot
            .send_message(chat, "💱 Pick the currency:")
            .reply_markup(currency_keyboard())
            .await?;
        },
        Err(err) => {
          let reply = match err {
            MoneyError::NotPositive => "The price must be greater than zero.",
            MoneyError::OutOfRange => "That price is too large.",
            MoneyError::InvalidFormat => "Use the 0.00 format, e.g. 9.99.",
          };
          bot.send_message(chat, reply).await?;
        },
      }
    },
    ProductStage::Currency => match text.and_then(|raw| Currency::from_code(&raw.to_ascii_lowercase())) {
      Some(currency) => apply_currency(bot, dialogue, chat, draft, currency).await?,
      None => {
        bot
          .send_message(chat, "💱 Pick the currency with the buttons:")
          .reply_markup(currency_keyboard())
          .await?;
      },
    },
    ProductStage::Photo => {
      if let Some(photo) = msg.photo().and_then(|photos| photos.last()) {
        draft.photo = Some(photo.file.id.clone());
      } else if !text.is_some_and(|value| value.eq_ignore_ascii_case("skip")) {
        bot
          .send_message(chat, "🖼️ Send a photo, or type skip.")
          .await?;
        return Ok(());
      }
      draft.stage = ProductStage::Delivery;
      dialogue.update(ChildState::AddProduct(draft)).await?;
      bot
        .send_message(chat, "🚚 How is it delivered?")
        .reply_markup(delivery_keyboard())
        .await?;
    },
    ProductStage::Delivery => match text.and_then(|raw| DeliveryMode::from_code(&raw.to_ascii_lowercase())) {
      Some(delivery) => finish_product(bot, dialogue, ctx, chat, draft, delivery).await?,
      None => {
        bot
          .send_message(chat, "🚚 Pick the delivery mode with the buttons:")
          .reply_markup(delivery_keyboard())
          .await?;
      },
    },
  }
  Ok(())
}

async fn apply_currency(
  bot: &Bot,
  dialogue: &ChildDialogue,
  chat: ChatId,
  mut draft: ProductDraft,
  currency: Currency,
) -> HandlerResult {
  draft.currency = Some(currency);
  draft.stage = ProductStage::Photo;
  dialogue.update(ChildState::AddProduct(draft)).await?;
  bot
    .send_message(chat, "🖼️ Send a product photo, or type skip.")
    .await?;
  Ok(())
}

async fn finish_product(
  bot: &Bot,
  dialogue: &ChildDialogue,
  ctx: &SharedChild,
  chat: ChatId,
  draft: ProductDraft,
  delivery: DeliveryMode,
) -> HandlerResult {
  let (Some(name), Some(description), Some(price_cents), Some(currency)) =
    (draft.name, draft.description, draft.price_cents, draft.currency)
  else {
    dialogue.reset().await?;
    bot
      .send_message(chat, "The draft was incomplete, start again with /addproduct.")
      .await?;
    return Ok(());
  };
  let product = ctx
    .db()
    .create_product(Product {
      id: 0,
      bot: ctx.username().to_string(),
      name,
      description,
      price_cents,
      currency,
      photo: draft.photo,
      delivery,
      created_at: Utc::now(),
    })
    .await?;
  dialogue.reset().await?;
  info!(product_id = product.id, "product created through wizard");
  ui::send_html(bot, chat, format!("✅ Product saved.\n\n{}", render_product(&product))).await
}

/// Button presses of the product wizard.
#[instrument(skip(bot, dialogue, ctx, query))]
pub async fn on_wizard_choice(
  bot: &Bot,
  dialogue: &ChildDialogue,
  ctx: &SharedChild,
  query: &CallbackQuery,
  prefix: &str,
  value: &str,
) -> anyhow::Result<Option<String>> {
  let Some((chat, _)) = ui::callback_target(query) else {
    return Ok(None);
  };
  let Some(ChildState::AddProduct(draft)) = dialogue.get().await? else {
    return Ok(Some("This wizard has expired.".to_string()));
  };
  if draft.owner_id != query.from.id.0 as i64 {
    return Ok(None);
  }
  match (prefix, draft.stage) {
    ("cur", ProductStage::Currency) => {
      let Some(currency) = Currency::from_code(value) else {
        return Ok(None);
      };
      apply_currency(bot, dialogue, chat, draft, currency).await?;
    },
    ("dlv", ProductStage::Delivery) => {
      let Some(delivery) = DeliveryMode::from_code(value) else {
        return Ok(None);
      };
      finish_product(bot, dialogue, ctx, chat, draft, delivery).await?;
    },
    _ => return Ok(Some("That step is already done.".to_string())),
  }
  Ok(None)
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::PurchaseError;
  use super::parse_id;
  use super::render_product;
  use super::shop_keyboard;
  use crate::db::CreditError;
  use crate::models::Currency;
  use crate::models::DeliveryMode;
  use crate::models::Product;

  fn product(id: u64, name: &str) -> Product {
    Product {
      id,
      bot: "shop".to_string(),
      name: name.to_string(),
      description: "A <rare> item".to_string(),
      price_cents: 1250,
      currency: Currency::Eur,
      photo: None,
      delivery: DeliveryMode::Manual,
      created_at: Utc::now(),
    }
  }

  #[test]
  fn renders_escaped_product_card() {
    let text = render_product(&product(3, "Ebook & notes"));
    assert!(text.contains("Ebook &amp; notes"));
    assert!(text.contains("&lt;rare&gt;"));
    assert!(text.contains("€12.50"));
    assert!(text.contains("#3"));
  }

  #[test]
  fn shop_keyboard_has_one_row_per_product() {
    let keyboard = shop_keyboard(&[product(1, "One"), product(2, "Two")]);
    assert_eq!(keyboard.inline_keyboard.len(), 2);
  }

  #[test]
  fn parses_ids_with_optional_hash() {
    assert_eq!(parse_id("#12"), Some(12));
    assert_eq!(parse_id(" 7 "), Some(7));
    assert_eq!(parse_id("x"), None);
  }

  #[test]
  fn insufficient_credits_message_mentions_both_amounts() {
    let err = PurchaseError::Credits(CreditError::Insufficient { balance: 3, needed: 10 });
    let message = err.user_message();
    assert!(message.contains('3'));
    assert!(message.contains("10"));
  }
}
