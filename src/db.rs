use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use uuid::Uuid;

use crate::models::BotRecord;
use crate::models::BotSettings;
use crate::models::BotStatus;
use crate::models::GroupRecord;
use crate::models::IndexedDocument;
use crate::models::Language;
use crate::models::LogEntry;
use crate::models::LogKind;
use crate::models::MemberRecord;
use crate::models::Order;
use crate::models::OrderStatus;
use crate::models::PendingCaptcha;
use crate::models::PlanRequest;
use crate::models::PlatformStats;
use crate::models::Product;
use crate::models::ScheduledPost;
use crate::models::Transaction;
use crate::models::UserRecord;
use crate::models::WarningEntry;
use crate::plans::Plan;
use crate::referral::NEWCOMER_REWARD;
use crate::referral::REFERRER_REWARD;
use crate::security::MAX_PIN_FAILURES;
use crate::security::PIN_LOCK_MINUTES;
use crate::store::JsonStore;
use crate::store::StoreError;

const USERS: &str = "users";
const BOTS: &str = "bots";
const GROUPS: &str = "groups";
const MEMBERS: &str = "members";
const TRANSACTIONS: &str = "transactions";
const PRODUCTS: &str = "products";
const ORDERS: &str = "orders";
const DOCUMENTS: &str = "documents";
const WARNINGS: &str = "warnings";
const CAPTCHAS: &str = "captchas";
const SCHEDULES: &str = "schedules";
const LOGS: &str = "logs";
const PLAN_REQUESTS: &str = "plan_requests";
const COUNTERS: &str = "counters";
const META: &str = "meta";

/// Collections whose keys start with `<bot username>:`.
const PER_BOT_COLLECTIONS: [&str; 9] = [
  GROUPS,
  MEMBERS,
  TRANSACTIONS,
  PRODUCTS,
  ORDERS,
  DOCUMENTS,
  WARNINGS,
  CAPTCHAS,
  SCHEDULES,
];

#[derive(Debug, Error)]
pub enum CreditError {
  #[error("insufficient credits: balance {balance}, needed {needed}")]
  Insufficient { balance: i64, needed: i64 },
  #[error("member not found")]
  UnknownMember,
  #[error("amount must be positive")]
  InvalidAmount,
  #[error(transparent)]
  Storage(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
  New,
  Existing,
  LimitReached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberJoin {
  pub member: MemberRecord,
  pub is_new: bool,
  pub referred_by: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinFailure {
  pub attempts: u32,
  pub locked_until: Option<DateTime<Utc>>,
}

fn scoped(bot: &str, id: impl std::fmt::Display) -> String {
  format!("{bot}:{id}")
}

fn numbered(bot: &str, id: u64) -> String {
  format!("{bot}:{id:010}")
}

#[derive(Clone)]
pub struct Db {
  store: JsonStore,
}

impl Db {
  pub async fn open(data_dir: &Path) -> Result<Self> {
    let store = JsonStore::open(data_dir)
      .await
      .with_context(|| format!("failed to open data directory {}", data_dir.display()))?;
    Ok(Self { store })
  }

  async fn values<T: DeserializeOwned>(&self, collection: &str, prefix: &str) -> Result<Vec<T>> {
    let records = self.store.list_prefix(collection, prefix).await?;
    Ok(records.into_iter().map(|(_, record)| record).collect())
  }

  async fn modify<T, F>(&self, collection: &str, key: &str, apply: F) -> Result<Option<T>>
  where
    T: Serialize + DeserializeOwned + Clone,
    F: FnOnce(&mut T),
  {
    let updated = self
      .store
      .update(collection, key, |record: &mut Option<T>| {
        record.as_mut().map(|record| {
          apply(record);
          record.clone()
        })
      })
      .await?;
    Ok(updated)
  }

  #[instrument(skip(self))]
  pub async fn next_id(&self, counter: &str) -> Result<u64> {
    Ok(self.bump_counter(counter).await?)
  }

  async fn bump_counter(&self, counter: &str) -> Result<u64, StoreError> {
    self
      .store
      .update(COUNTERS, counter, |value: &mut Option<u64>| {
        let next = value.unwrap_or(0) + 1;
        *value = Some(next);
        next
      })
      .await
  }

  // users

  #[instrument(skip(self))]
  pub async fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
    Ok(self.store.get(USERS, &id.to_string()).await?)
  }

  /// Creates the account on first contact; refreshes the display names otherwise.
  #[instrument(skip(self))]
  pub async fn ensure_user(
    &self,
    id: i64,
    username: Option<String>,
    first_name: String,
    trial_days: i64,
  ) -> Result<(UserRecord, bool)> {
    let result = self
      .store
      .update(USERS, &id.to_string(), |record: &mut Option<UserRecord>| match record {
        Some(user) => {
          user.username = username;
          user.first_name = first_name;
          (user.clone(), false)
        },
        None => {
          let user = UserRecord::new(id, username, first_name, Utc::now() + Duration::days(trial_days));
          *record = Some(user.clone());
          (user, true)
        },
      })
      .await?;
    if result.1 {
      info!(user_id = id, "registered platform user");
    }
    Ok(result)
  }

  #[instrument(skip(self))]
  pub async fn set_language(&self, id: i64, language: Language) -> Result<Option<UserRecord>> {
    self
      .modify(USERS, &id.to_string(), |user: &mut UserRecord| user.language = language)
      .await
  }

  #[instrument(skip(self))]
  pub async fn accept_terms(&self, id: i64) -> Result<Option<UserRecord>> {
    self
      .modify(USERS, &id.to_string(), |user: &mut UserRecord| user.terms_accepted = true)
      .await
  }

  #[instrument(skip(self, pin_hash))]
  pub async fn set_pin_hash(&self, id: i64, pin_hash: String) -> Result<Option<UserRecord>> {
    self
      .modify(USERS, &id.to_string(), |user: &mut UserRecord| {
        user.pin_hash = Some(pin_hash);
        user.pin_failures = 0;
        user.locked_until = None;
      })
      .await
  }

  /// Counts a wrong PIN; the fifth consecutive failure locks the account for an hour.
  #[instrument(skip(self))]
  pub async fn record_pin_failure(&self, id: i64, now: DateTime<Utc>) -> Result<PinFailure> {
    let updated = self
      .modify(USERS, &id.to_string(), |user: &mut UserRecord| {
        user.pin_failures += 1;
        if user.pin_failures >= MAX_PIN_FAILURES {
          user.locked_until = Some(now + Duration::minutes(PIN_LOCK_MINUTES));
          user.pin_failures = 0;
        }
      })
      .await?
      .context("user not found")?;
    let attempts = if updated.locked_until.is_some_and(|until| until > now) {
      MAX_PIN_FAILURES
    } else {
      updated.pin_failures
    };
    Ok(PinFailure {
      attempts,
      locked_until: updated.locked_until.filter(|until| *until > now),
    })
  }

  #[instrument(skip(self))]
  pub async fn reset_pin_failures(&self, id: i64) -> Result<()> {
    self
      .modify(USERS, &id.to_string(), |user: &mut UserRecord| {
        user.pin_failures = 0;
        user.locked_until = None;
      })
      .await?;
    Ok(())
  }

  #[instrument(skip(self))]
  pub async fn set_plan(&self, id: i64, plan: Plan, expires_at: Option<DateTime<Utc>>) -> Result<Option<UserRecord>> {
    let updated = self
      .modify(USERS, &id.to_string(), |user: &mut UserRecord| {
        user.plan = plan;
        user.plan_expires_at = expires_at;
      })
      .await?;
    if updated.is_some() {
      info!(user_id = id, plan = %plan, "changed user plan");
    }
    Ok(updated)
  }

  #[instrument(skip(self))]
  pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
    self.values(USERS, "").await
  }

  #[instrument(skip(self))]
  pub async fn expired_plans(&self, now: DateTime<Utc>) -> Result<Vec<UserRecord>> {
    let users = self.list_users().await?;
    Ok(
      users
        .into_iter()
        .filter(|user| user.plan.is_paid() && user.plan_expires_at.is_some_and(|at| at <= now))
        .collect(),
    )
  }

  // bots

  /// Inserts a linked bot, or refreshes token and name when it is re-linked.
  #[instrument(skip(self, record), fields(bot = %record.username, owner_id = record.owner_id))]
  pub async fn save_bot(&self, record: BotRecord) -> Result<BotRecord> {
    let owner_id = record.owner_id;
    let username = record.username.clone();
    let saved = self
      .store
      .update(BOTS, &username, |existing: &mut Option<BotRecord>| {
        let saved = match existing.take() {
          Some(mut current) => {
            current.token = record.token;
            current.name = record.name;
            current.bot_id = record.bot_id;
            current.owner_id = record.owner_id;
            current.status = BotStatus::Active;
            current.deletion_requested_at = None;
            current
          },
          None => record,
        };
        *existing = Some(saved.clone());
        saved
      })
      .await?;
    self
      .modify(USERS, &owner_id.to_string(), |user: &mut UserRecord| {
        if !user.bots.contains(&username) {
          user.bots.push(username.clone());
        }
      })
      .await?;
    info!("saved bot record");
    Ok(saved)
  }

  #[instrument(skip(self))]
  pub async fn get_bot(&self, username: &str) -> Result<Option<BotRecord>> {
    Ok(self.store.get(BOTS, username).await?)
  }

  #[instrument(skip(self))]
  pub async fn all_bots(&self) -> Result<Vec<BotRecord>> {
    self.values(BOTS, "").await
  }

  #[instrument(skip(self))]
  pub async fn bots_of_owner(&self, owner_id: i64) -> Result<Vec<BotRecord>> {
    let bots = self.all_bots().await?;
    Ok(bots.into_iter().filter(|bot| bot.owner_id == owner_id).collect())
  }

  #[instrument(skip(self, token))]
  pub async fn find_bot_by_token(&self, token: &str) -> Result<Option<BotRecord>> {
    let bots = self.all_bots().await?;
    Ok(bots.into_iter().find(|bot| bot.token == token))
  }

  #[instrument(skip(self))]
  pub async fn schedule_bot_deletion(&self, username: &str, at: DateTime<Utc>) -> Result<Option<BotRecord>> {
    self
      .modify(BOTS, username, |bot: &mut BotRecord| bot.deletion_requested_at = Some(at))
      .await
  }

  #[instrument(skip(self))]
  pub async fn cancel_bot_deletion(&self, username: &str) -> Result<Option<BotRecord>> {
    self
      .modify(BOTS, username, |bot: &mut BotRecord| bot.deletion_requested_at = None)
      .await
  }

  #[instrument(skip(self))]
  pub async fn set_bot_status(&self, username: &str, status: BotStatus) -> Result<Option<BotRecord>> {
    self
      .modify(BOTS, username, |bot: &mut BotRecord| bot.status = status)
      .await
  }

  #[instrument(skip(self, apply))]
  pub async fn update_bot_settings<F>(&self, username: &str, apply: F) -> Result<Option<BotRecord>>
  where
    F: FnOnce(&mut BotSettings),
  {
    self
      .modify(BOTS, username, |bot: &mut BotRecord| apply(&mut bot.settings))
      .await
  }

  #[instrument(skip(self))]
  pub async fn due_bot_deletions(&self, now: DateTime<Utc>, grace: Duration) -> Result<Vec<BotRecord>> {
    let bots = self.all_bots().await?;
    Ok(
      bots
        .into_iter()
        .filter(|bot| bot.deletion_requested_at.is_some_and(|at| at + grace <= now))
        .collect(),
    )
  }

  /// Removes the bot and every record scoped to it.
  #[instrument(skip(self))]
  pub async fn delete_bot(&self, username: &str) -> Result<Option<BotRecord>> {
    let Some(record) = self.get_bot(username).await? else {
      return Ok(None);
    };
    let prefix = format!("{username}:");
    let mut removed = 0usize;
    for collection in PER_BOT_COLLECTIONS {
      for key in self.store.keys(collection).await? {
        if key.starts_with(&prefix) && self.store.delete(collection, &key).await? {
          removed += 1;
        }
      }
    }
    self.store.delete(BOTS, username).await?;
    self
      .modify(USERS, &record.owner_id.to_string(), |user: &mut UserRecord| {
        user.bots.retain(|name| name != username);
      })
      .await?;
    info!(removed_records = removed, "deleted bot and its data");
    Ok(Some(record))
  }

  // groups and channels

  /// Registers a group unless the owner's plan limit is reached.
  #[instrument(skip(self))]
  pub async fn register_group(
    &self,
    bot: &str,
    chat_id: i64,
    title: &str,
    limit: Option<usize>,
  ) -> Result<Registration> {
    if self.get_group(bot, chat_id).await?.is_some() {
      return Ok(Registration::Existing);
    }
    let registration = self
      .store
      .update(BOTS, bot, |record: &mut Option<BotRecord>| {
        let Some(record) = record.as_mut() else {
          return Registration::LimitReached;
        };
        if record.groups.contains(&chat_id) {
          return Registration::Existing;
        }
        if limit.is_some_and(|limit| record.groups.len() >= limit) {
          return Registration::LimitReached;
        }
        record.groups.push(chat_id);
        Registration::New
      })
      .await?;
    if registration != Registration::LimitReached {
      let group = GroupRecord::new(bot, chat_id, title.to_string());
      self.store.put(GROUPS, &scoped(bot, chat_id), &group).await?;
    }
    Ok(registration)
  }

  #[instrument(skip(self))]
  pub async fn register_channel(&self, bot: &str, chat_id: i64, limit: Option<usize>) -> Result<Registration> {
    let registration = self
      .store
      .update(BOTS, bot, |record: &mut Option<BotRecord>| {
        let Some(record) = record.as_mut() else {
          return Registration::LimitReached;
        };
        if record.channels.contains(&chat_id) {
          return Registration::Existing;
        }
        if limit.is_some_and(|limit| record.channels.len() >= limit) {
          return Registration::LimitReached;
        }
        record.channels.push(chat_id);
        Registration::New
      })
      .await?;
    Ok(registration)
  }

  #[instrument(skip(self))]
  pub async fn get_group(&self, bot: &str, chat_id: i64) -> Result<Option<GroupRecord>> {
    Ok(self.store.get(GROUPS, &scoped(bot, chat_id)).await?)
  }

  #[instrument(skip(self, apply))]
  pub async fn update_group<F>(&self, bot: &str, chat_id: i64, apply: F) -> Result<Option<GroupRecord>>
  where
    F: FnOnce(&mut GroupRecord),
  {
    self.modify(GROUPS, &scoped(bot, chat_id), apply).await
  }

  #[instrument(skip(self))]
  pub async fn groups_of_bot(&self, bot: &str) -> Result<Vec<GroupRecord>> {
    self.values(GROUPS, &format!("{bot}:")).await
  }

  #[instrument(skip(self))]
  pub async fn remove_group(&self, bot: &str, chat_id: i64) -> Result<bool> {
    let removed = self.store.delete(GROUPS, &scoped(bot, chat_id)).await?;
    self
      .modify(BOTS, bot, |record: &mut BotRecord| {
        record.groups.retain(|id| *id != chat_id);
        record.channels.retain(|id| *id != chat_id);
      })
      .await?;
    Ok(removed)
  }

  // members, credits, referrals

  /// Registers a member on first contact and pays out the referral bonuses once.
  #[instrument(skip(self))]
  pub async fn ensure_member(
    &self,
    bot: &str,
    user_id: i64,
    username: Option<String>,
    first_name: String,
    referrer: Option<i64>,
  ) -> Result<MemberJoin> {
    let key = scoped(bot, user_id);
    let (member, is_new) = self
      .store
      .update(MEMBERS, &key, |record: &mut Option<MemberRecord>| match record {
        Some(member) => {
          member.username = username;
          member.first_name = first_name;
          (member.clone(), false)
        },
        None => {
          let member = MemberRecord {
            bot: bot.to_string(),
            user_id,
            username,
            first_name,
            credits: 0,
            referred_by: None,
            referral_count: 0,
            referral_earnings: 0,
            joined_at: Utc::now(),
          };
          *record = Some(member.clone());
          (member, true)
        },
      })
      .await?;
    if !is_new {
      return Ok(MemberJoin {
        member,
        is_new,
        referred_by: None,
      });
    }

    let referrer = match referrer.filter(|id| *id != user_id) {
      Some(id) if self.get_member(bot, id).await?.is_some() => Some(id),
      _ => None,
    };
    let Some(referrer) = referrer else {
      return Ok(MemberJoin {
        member,
        is_new,
        referred_by: None,
      });
    };

    self
      .modify(MEMBERS, &key, |member: &mut MemberRecord| member.referred_by = Some(referrer))
      .await?;
    self
      .credit(bot, user_id, NEWCOMER_REWARD, "referral welcome bonus")
      .await?;
    self
      .credit(bot, referrer, REFERRER_REWARD, &format!("referral of {user_id}"))
      .await?;
    self
      .modify(MEMBERS, &scoped(bot, referrer), |member: &mut MemberRecord| {
        member.referral_count += 1;
        member.referral_earnings += REFERRER_REWARD;
      })
      .await?;
    info!(referrer_id = referrer, "applied referral");
    let member = self.get_member(bot, user_id).await?.context("member vanished")?;
    Ok(MemberJoin {
      member,
      is_new,
      referred_by: Some(referrer),
    })
  }

  #[instrument(skip(self))]
  pub async fn get_member(&self, bot: &str, user_id: i64) -> Result<Option<MemberRecord>> {
    Ok(self.store.get(MEMBERS, &scoped(bot, user_id)).await?)
  }

  #[instrument(skip(self))]
  pub async fn members_of_bot(&self, bot: &str) -> Result<Vec<MemberRecord>> {
    self.values(MEMBERS, &format!("{bot}:")).await
  }

  /// Returns the new balance.
  #[instrument(skip(self))]
  pub async fn credit(&self, bot: &str, user_id: i64, amount: i64, reason: &str) -> Result<i64, CreditError> {
    if amount <= 0 {
      return Err(CreditError::InvalidAmount);
    }
    self.apply_credits(bot, user_id, amount, reason).await
  }

  /// Fails without writing anything when the balance is too low.
  #[instrument(skip(self))]
  pub async fn debit(&self, bot: &str, user_id: i64, amount: i64, reason: &str) -> Result<i64, CreditError> {
    if amount <= 0 {
      return Err(CreditError::InvalidAmount);
    }
    self.apply_credits(bot, user_id, -amount, reason).await
  }

  async fn apply_credits(&self, bot: &str, user_id: i64, delta: i64, reason: &str) -> Result<i64, CreditError> {
    let balance = self
      .store
      .update(MEMBERS, &scoped(bot, user_id), |record: &mut Option<MemberRecord>| {
        let member = record.as_mut().ok_or(CreditError::UnknownMember)?;
        let next = member.credits + delta;
        if next < 0 {
          return Err(CreditError::Insufficient {
            balance: member.credits,
            needed: -delta,
          });
        }
        member.credits = next;
        Ok(next)
      })
      .await??;
    let transaction = Transaction {
      id: Uuid::new_v4(),
      bot: bot.to_string(),
      user_id,
      amount: delta,
      balance_after: balance,
      reason: reason.to_string(),
      at: Utc::now(),
    };
    let key = format!("{bot}:{user_id}:{}", transaction.id);
    self.store.put(TRANSACTIONS, &key, &transaction).await?;
    info!(delta, balance, "applied credit change");
    Ok(balance)
  }

  /// Newest first.
  #[instrument(skip(self))]
  pub async fn transactions(&self, bot: &str, user_id: i64, limit: usize) -> Result<Vec<Transaction>> {
    let mut transactions: Vec<Transaction> = self.values(TRANSACTIONS, &format!("{bot}:{user_id}:")).await?;
    transactions.sort_by(|left, right| right.at.cmp(&left.at));
    transactions.truncate(limit);
    Ok(transactions)
  }

  #[instrument(skip(self))]
  pub async fn referrals_of(&self, bot: &str, user_id: i64) -> Result<Vec<MemberRecord>> {
    let members = self.members_of_bot(bot).await?;
    Ok(
      members
        .into_iter()
        .filter(|member| member.referred_by == Some(user_id))
        .collect(),
    )
  }

  #[instrument(skip(self))]
  pub async fn referral_leaderboard(&self, bot: &str, limit: usize) -> Result<Vec<MemberRecord>> {
    let mut members: Vec<MemberRecord> = self
      .members_of_bot(bot)
      .await?
      .into_iter()
      .filter(|member| member.referral_count > 0)
      .collect();
    members.sort_by(|left, right| {
      right
        .referral_count
        .cmp(&left.referral_count)
        .then_with(|| left.joined_at.cmp(&right.joined_at))
    });
    members.truncate(limit);
    Ok(members)
  }

  // storefront

  /// Assigns the product id; whatever `product.id` held is ignored.
  #[instrument(skip(self, product), fields(bot = %product.bot))]
  pub async fn create_product(&self, mut product: Product) -> Result<Product> {
    product.id = self.next_id(PRODUCTS).await?;
    self
      .store
      .put(PRODUCTS, &numbered(&product.bot, product.id), &product)
      .await?;
    info!(product_id = product.id, "created product");
    Ok(product)
  }

  #[instrument(skip(self))]
  pub async fn list_products(&self, bot: &str) -> Result<Vec<Product>> {
    self.values(PRODUCTS, &format!("{bot}:")).await
  }

  #[instrument(skip(self))]
  pub async fn get_product(&self, bot: &str, id: u64) -> Result<Option<Product>> {
    Ok(self.store.get(PRODUCTS, &numbered(bot, id)).await?)
  }

  #[instrument(skip(self))]
  pub async fn delete_product(&self, bot: &str, id: u64) -> Result<bool> {
    Ok(self.store.delete(PRODUCTS, &numbered(bot, id)).await?)
  }

  #[instrument(skip(self, order), fields(bot = %order.bot, buyer_id = order.buyer_id))]
  pub async fn create_order(&self, order: Order) -> Result<Order> {
    Ok(self.insert_order(order).await?)
  }

  async fn insert_order(&self, mut order: Order) -> Result<Order, StoreError> {
    order.id = self.bump_counter(ORDERS).await?;
    self.store.put(ORDERS, &numbered(&order.bot, order.id), &order).await?;
    info!(order_id = order.id, status = ?order.status, "created order");
    Ok(order)
  }

  /// Charges `cost` credits and records the order as paid. When the order
  /// cannot be written the charge is credited back before the error returns.
  #[instrument(skip(self, order), fields(bot = %order.bot, buyer_id = order.buyer_id))]
  pub async fn place_paid_order(&self, mut order: Order, cost: i64) -> Result<Order, CreditError> {
    let reason = format!("purchase of #{} {}", order.product_id, order.product_name);
    self.debit(&order.bot, order.buyer_id, cost, &reason).await?;
    order.status = OrderStatus::Paid;
    let (bot, buyer_id) = (order.bot.clone(), order.buyer_id);
    match self.insert_order(order).await {
      Ok(order) => Ok(order),
      Err(err) => {
        warn!(error = %err, cost, "order write failed after charge, refunding");
        if let Err(refund_err) = self
          .credit(&bot, buyer_id, cost, &format!("refund: {reason}"))
          .await
        {
          warn!(error = %refund_err, cost, "refund failed");
        }
        Err(err.into())
      },
    }
  }

  /// Newest first.
  #[instrument(skip(self))]
  pub async fn orders_for_bot(&self, bot: &str, limit: usize) -> Result<Vec<Order>> {
    let mut orders: Vec<Order> = self.values(ORDERS, &format!("{bot}:")).await?;
    orders.reverse();
    orders.truncate(limit);
    Ok(orders)
  }

  #[instrument(skip(self))]
  pub async fn orders_for_buyer(&self, bot: &str, buyer_id: i64, limit: usize) -> Result<Vec<Order>> {
    let mut orders: Vec<Order> = self
      .values::<Order>(ORDERS, &format!("{bot}:"))
      .await?
      .into_iter()
      .filter(|order| order.buyer_id == buyer_id)
      .collect();
    orders.reverse();
    orders.truncate(limit);
    Ok(orders)
  }

  #[instrument(skip(self))]
  pub async fn set_order_status(&self, bot: &str, id: u64, status: OrderStatus) -> Result<Option<Order>> {
    self
      .modify(ORDERS, &numbered(bot, id), |order: &mut Order| order.status = status)
      .await
  }

  // documents

  #[instrument(skip(self, document), fields(bot = %document.bot, file_name = %document.file_name))]
  pub async fn index_document(&self, mut document: IndexedDocument) -> Result<IndexedDocument> {
    document.id = self.next_id(DOCUMENTS).await?;
    self
      .store
      .put(DOCUMENTS, &numbered(&document.bot, document.id), &document)
      .await?;
    info!(document_id = document.id, keywords = document.keywords.len(), "indexed document");
    Ok(document)
  }

  #[instrument(skip(self))]
  pub async fn documents_of_bot(&self, bot: &str) -> Result<Vec<IndexedDocument>> {
    self.values(DOCUMENTS, &format!("{bot}:")).await
  }

  #[instrument(skip(self))]
  pub async fn get_document(&self, bot: &str, id: u64) -> Result<Option<IndexedDocument>> {
    Ok(self.store.get(DOCUMENTS, &numbered(bot, id)).await?)
  }

  #[instrument(skip(self))]
  pub async fn delete_document(&self, bot: &str, id: u64) -> Result<bool> {
    Ok(self.store.delete(DOCUMENTS, &numbered(bot, id)).await?)
  }

  // moderation

  /// Returns the warning count after this one.
  #[instrument(skip(self))]
  pub async fn add_warning(&self, bot: &str, chat_id: i64, user_id: i64, reason: &str) -> Result<u32> {
    let key = format!("{bot}:{chat_id}:{user_id}");
    let count = self
      .store
      .update(WARNINGS, &key, |record: &mut Option<WarningEntry>| {
        let entry = record.get_or_insert_with(WarningEntry::default);
        entry.count += 1;
        entry.reasons.push(reason.to_string());
        entry.last_at = Some(Utc::now());
        entry.count
      })
      .await?;
    Ok(count)
  }

  #[instrument(skip(self))]
  pub async fn clear_warnings(&self, bot: &str, chat_id: i64, user_id: i64) -> Result<bool> {
    Ok(
      self
        .store
        .delete(WARNINGS, &format!("{bot}:{chat_id}:{user_id}"))
        .await?,
    )
  }

  #[instrument(skip(self, captcha), fields(bot = %captcha.bot, chat_id = captcha.chat_id, user_id = captcha.user_id))]
  pub async fn save_captcha(&self, captcha: &PendingCaptcha) -> Result<()> {
    let key = format!("{}:{}:{}", captcha.bot, captcha.chat_id, captcha.user_id);
    self.store.put(CAPTCHAS, &key, captcha).await?;
    Ok(())
  }

  /// Removes and returns the pending challenge, if any.
  #[instrument(skip(self))]
  pub async fn take_captcha(&self, bot: &str, chat_id: i64, user_id: i64) -> Result<Option<PendingCaptcha>> {
    let key = format!("{bot}:{chat_id}:{user_id}");
    let taken = self
      .store
      .update(CAPTCHAS, &key, |record: &mut Option<PendingCaptcha>| record.take())
      .await?;
    Ok(taken)
  }

  #[instrument(skip(self))]
  pub async fn expired_captchas(&self, now: DateTime<Utc>) -> Result<Vec<PendingCaptcha>> {
    let captchas: Vec<PendingCaptcha> = self.values(CAPTCHAS, "").await?;
    Ok(
      captchas
        .into_iter()
        .filter(|captcha| captcha.deadline <= now)
        .collect(),
    )
  }

  // scheduled posts

  #[instrument(skip(self, post), fields(bot = %post.bot, chat_id = post.chat_id))]
  pub async fn create_schedule(&self, mut post: ScheduledPost) -> Result<ScheduledPost> {
    post.id = self.next_id(SCHEDULES).await?;
    self.store.put(SCHEDULES, &numbered(&post.bot, post.id), &post).await?;
    info!(schedule_id = post.id, interval_secs = post.interval_secs, "created scheduled post");
    Ok(post)
  }

  #[instrument(skip(self))]
  pub async fn schedules_of_bot(&self, bot: &str) -> Result<Vec<ScheduledPost>> {
    self.values(SCHEDULES, &format!("{bot}:")).await
  }

  #[instrument(skip(self))]
  pub async fn delete_schedule(&self, bot: &str, id: u64) -> Result<bool> {
    Ok(self.store.delete(SCHEDULES, &numbered(bot, id)).await?)
  }

  #[instrument(skip(self))]
  pub async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledPost>> {
    let posts: Vec<ScheduledPost> = self.values(SCHEDULES, "").await?;
    Ok(posts.into_iter().filter(|post| post.next_at <= now).collect())
  }

  /// Moves `next_at` forward by whole intervals until it is in the future.
  #[instrument(skip(self))]
  pub async fn mark_schedule_sent(&self, bot: &str, id: u64, now: DateTime<Utc>) -> Result<Option<ScheduledPost>> {
    self
      .modify(SCHEDULES, &numbered(bot, id), |post: &mut ScheduledPost| {
        let interval = Duration::seconds(post.interval_secs.max(1) as i64);
        while post.next_at <= now {
          post.next_at += interval;
        }
        post.last_sent_at = Some(now);
      })
      .await
  }

  // operator log and plan requests

  #[instrument(skip(self, text))]
  pub async fn append_log(&self, kind: LogKind, text: &str) -> Result<LogEntry> {
    let entry = LogEntry {
      id: Uuid::new_v4(),
      kind,
      text: text.to_string(),
      at: Utc::now(),
    };
    let key = format!("{:015}-{}", entry.at.timestamp_millis(), entry.id);
    self.store.put(LOGS, &key, &entry).await?;
    Ok(entry)
  }

  /// Newest first.
  #[instrument(skip(self))]
  pub async fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>> {
    let keys = self.store.keys(LOGS).await?;
    let mut entries = Vec::new();
    for key in keys.iter().rev().take(limit) {
      if let Some(entry) = self.store.get(LOGS, key).await? {
        entries.push(entry);
      }
    }
    Ok(entries)
  }

  #[instrument(skip(self))]
  pub async fn create_plan_request(&self, user_id: i64, plan: Plan) -> Result<PlanRequest> {
    let request = PlanRequest {
      user_id,
      plan,
      requested_at: Utc::now(),
    };
    self.store.put(PLAN_REQUESTS, &user_id.to_string(), &request).await?;
    Ok(request)
  }

  #[instrument(skip(self))]
  pub async fn take_plan_request(&self, user_id: i64) -> Result<Option<PlanRequest>> {
    let taken = self
      .store
      .update(PLAN_REQUESTS, &user_id.to_string(), |record: &mut Option<PlanRequest>| {
        record.take()
      })
      .await?;
    Ok(taken)
  }

  #[instrument(skip(self))]
  pub async fn plan_requests(&self) -> Result<Vec<PlanRequest>> {
    self.values(PLAN_REQUESTS, "").await
  }

  #[instrument(skip(self))]
  pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
    Ok(self.store.get(META, key).await?)
  }

  #[instrument(skip(self, value))]
  pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self.store.put(META, key, &value).await?;
    Ok(())
  }

  #[instrument(skip(self))]
  pub async fn platform_stats(&self) -> Result<PlatformStats> {
    let users = self.list_users().await?;
    let bots = self.all_bots().await?;
    let now = Utc::now();
    let plans = Plan::ALL
      .into_iter()
      .map(|plan| {
        let count = users
          .iter()
          .filter(|user| crate::plans::effective_plan(user, now) == plan)
          .count();
        (plan, count)
      })
      .collect();
    Ok(PlatformStats {
      users: users.len(),
      bots: bots.len(),
      failed_bots: bots.iter().filter(|bot| bot.status == BotStatus::Failed).count(),
      pending_deletions: bots.iter().filter(|bot| bot.is_pending_deletion()).count(),
      groups: bots.iter().map(|bot| bot.groups.len()).sum(),
      plans,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration;
  use chrono::Utc;
  use tempfile::TempDir;

  use super::CreditError;
  use super::Db;
  use super::Registration;
  use crate::models::BotRecord;
  use crate::models::BotSettings;
  use crate::models::BotStatus;
  use crate::models::Currency;
  use crate::models::LogKind;
  use crate::models::Order;
  use crate::models::OrderStatus;
  use crate::models::PendingCaptcha;
  use crate::models::ScheduledPost;
  use crate::plans::Plan;
  use crate::referral::NEWCOMER_REWARD;
  use crate::referral::REFERRER_REWARD;

  async fn open() -> (TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path()).await.unwrap();
    (dir, db)
  }

  fn bot(username: &str, owner_id: i64) -> BotRecord {
    BotRecord {
      username: username.to_string(),
      bot_id: 100,
      name: "Shop".to_string(),
      token: format!("100:{username}-secret-token-value-0123456789"),
      owner_id,
      created_at: Utc::now(),
      status: BotStatus::Active,
      deletion_requested_at: None,
      groups: Vec::new(),
      channels: Vec::new(),
      settings: BotSettings::default(),
    }
  }

  fn credit_order(bot: &str, buyer_id: i64) -> Order {
    Order {
      id: 0,
      bot: bot.to_string(),
      product_id: 4,
      product_name: "Sticker pack".to_string(),
      buyer_id,
      price_cents: 700,
      currency: Currency::Credits,
      status: OrderStatus::Pending,
      created_at: Utc::now(),
    }
  }

  #[tokio::test]
  async fn ensure_user_creates_once_with_trial() {
    let (_dir, db) = open().await;
    let (user, created) = db.ensure_user(1, None, "Ada".to_string(), 14).await.unwrap();
    assert!(created);
    assert!(user.trial_ends_at > Utc::now() + Duration::days(13));
    let (again, created) = db
      .ensure_user(1, Some("ada".to_string()), "Ada".to_string(), 14)
      .await
      .unwrap();
    assert!(!created);
    assert_eq!(again.username.as_deref(), Some("ada"));
    assert_eq!(again.trial_ends_at, user.trial_ends_at);
  }

  #[tokio::test]
  async fn fifth_pin_failure_locks_account() {
    let (_dir, db) = open().await;
    db.ensure_user(1, None, "Ada".to_string(), 14).await.unwrap();
    let now = Utc::now();
    for attempt in 1 .. 5 {
      let failure = db.record_pin_failure(1, now).await.unwrap();
      assert_eq!(failure.attempts, attempt);
      assert!(failure.locked_until.is_none());
    }
    let failure = db.record_pin_failure(1, now).await.unwrap();
    assert!(failure.locked_until.is_some());
    let user = db.get_user(1).await.unwrap().unwrap();
    assert!(user.is_locked(now));
    assert!(!user.is_locked(now + Duration::minutes(61)));
  }

  #[tokio::test]
  async fn referral_pays_both_sides_once() {
    let (_dir, db) = open().await;
    db.ensure_member("shop", 1, None, "Ref".to_string(), None).await.unwrap();
    let join = db
      .ensure_member("shop", 2, None, "New".to_string(), Some(1))
      .await
      .unwrap();
    assert!(join.is_new);
    assert_eq!(join.referred_by, Some(1));
    assert_eq!(join.member.credits, NEWCOMER_REWARD);

    let referrer = db.get_member("shop", 1).await.unwrap().unwrap();
    assert_eq!(referrer.credits, REFERRER_REWARD);
    assert_eq!(referrer.referral_count, 1);

    let again = db
      .ensure_member("shop", 2, None, "New".to_string(), Some(1))
      .await
      .unwrap();
    assert!(!again.is_new);
    let referrer = db.get_member("shop", 1).await.unwrap().unwrap();
    assert_eq!(referrer.credits, REFERRER_REWARD);
    assert_eq!(db.referrals_of("shop", 1).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn unknown_referrer_is_ignored() {
    let (_dir, db) = open().await;
    let join = db
      .ensure_member("shop", 2, None, "New".to_string(), Some(99))
      .await
      .unwrap();
    assert_eq!(join.referred_by, None);
    assert_eq!(join.member.credits, 0);
  }

  #[tokio::test]
  async fn debit_refuses_overdraft_without_writing() {
    let (_dir, db) = open().await;
    db.ensure_member("shop", 1, None, "A".to_string(), None).await.unwrap();
    db.credit("shop", 1, 10, "top up").await.unwrap();
    let result = db.debit("shop", 1, 15, "purchase").await;
    assert!(matches!(result, Err(CreditError::Insufficient { balance: 10, needed: 15 })));
    assert_eq!(db.debit("shop", 1, 4, "purchase").await.unwrap(), 6);
    let history = db.transactions("shop", 1, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(matches!(db.debit("shop", 9, 1, "x").await, Err(CreditError::UnknownMember)));
  }

  #[tokio::test]
  async fn group_registration_respects_limit() {
    let (_dir, db) = open().await;
    db.ensure_user(1, None, "Owner".to_string(), 0).await.unwrap();
    db.save_bot(bot("shop", 1)).await.unwrap();
    assert_eq!(db.register_group("shop", -1, "A", Some(1)).await.unwrap(), Registration::New);
    assert_eq!(db.register_group("shop", -1, "A", Some(1)).await.unwrap(), Registration::Existing);
    assert_eq!(
      db.register_group("shop", -2, "B", Some(1)).await.unwrap(),
      Registration::LimitReached
    );
    assert!(db.get_group("shop", -2).await.unwrap().is_none());
    assert_eq!(db.get_bot("shop").await.unwrap().unwrap().groups, vec![-1]);
  }

  #[tokio::test]
  async fn delete_bot_removes_scoped_records_only() {
    let (_dir, db) = open().await;
    db.ensure_user(1, None, "Owner".to_string(), 14).await.unwrap();
    db.save_bot(bot("shop", 1)).await.unwrap();
    db.save_bot(bot("shopping", 1)).await.unwrap();
    db.ensure_member("shop", 5, None, "M".to_string(), None).await.unwrap();
    db.ensure_member("shopping", 5, None, "M".to_string(), None).await.unwrap();

    let removed = db.delete_bot("shop").await.unwrap();
    assert!(removed.is_some());
    assert!(db.get_bot("shop").await.unwrap().is_none());
    assert!(db.get_member("shop", 5).await.unwrap().is_none());
    assert!(db.get_member("shopping", 5).await.unwrap().is_some());
    let owner = db.get_user(1).await.unwrap().unwrap();
    assert_eq!(owner.bots, vec!["shopping".to_string()]);
  }

  #[tokio::test]
  async fn deletion_becomes_due_after_grace() {
    let (_dir, db) = open().await;
    db.ensure_user(1, None, "Owner".to_string(), 14).await.unwrap();
    db.save_bot(bot("shop", 1)).await.unwrap();
    let requested = Utc::now() - Duration::hours(2);
    db.schedule_bot_deletion("shop", requested).await.unwrap();
    assert!(db.due_bot_deletions(Utc::now(), Duration::hours(24)).await.unwrap().is_empty());
    assert_eq!(db.due_bot_deletions(Utc::now(), Duration::hours(1)).await.unwrap().len(), 1);
    db.cancel_bot_deletion("shop").await.unwrap();
    assert!(db.due_bot_deletions(Utc::now(), Duration::hours(1)).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn schedules_advance_past_now() {
    let (_dir, db) = open().await;
    let now = Utc::now();
    let post = db
      .create_schedule(ScheduledPost {
        id: 0,
        bot: "shop".to_string(),
        chat_id: -10,
        text: "hello".to_string(),
        interval_secs: 600,
        next_at: now - Duration::minutes(25),
        created_by: 1,
        last_sent_at: None,
      })
      .await
      .unwrap();
    assert_eq!(db.due_schedules(now).await.unwrap().len(), 1);
    let sent = db.mark_schedule_sent("shop", post.id, now).await.unwrap().unwrap();
    assert!(sent.next_at > now);
    assert!(sent.next_at <= now + Duration::minutes(10));
    assert!(db.due_schedules(now).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn logs_come_back_newest_first() {
    let (_dir, db) = open().await;
    db.append_log(LogKind::Info, "first").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    db.append_log(LogKind::Violation, "second").await.unwrap();
    let logs = db.recent_logs(10).await.unwrap();
    let texts: Vec<&str> = logs.iter().map(|entry| entry.text.as_str()).collect();
    assert_eq!(texts, vec!["second", "first"]);
  }

  #[tokio::test]
  async fn plan_requests_are_taken_once() {
    let (_dir, db) = open().await;
    db.create_plan_request(3, Plan::Pro).await.unwrap();
    assert_eq!(db.plan_requests().await.unwrap().len(), 1);
    assert_eq!(db.take_plan_request(3).await.unwrap().map(|request| request.plan), Some(Plan::Pro));
    assert!(db.take_plan_request(3).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn channel_registration_respects_limit() {
    let (_dir, db) = open().await;
    db.ensure_user(1, None, "Owner".to_string(), 0).await.unwrap();
    db.save_bot(bot("shop", 1)).await.unwrap();
    assert_eq!(db.register_channel("shop", -100, Some(1)).await.unwrap(), Registration::New);
    assert_eq!(db.register_channel("shop", -100, Some(1)).await.unwrap(), Registration::Existing);
    assert_eq!(
      db.register_channel("shop", -200, Some(1)).await.unwrap(),
      Registration::LimitReached
    );
    assert_eq!(db.register_channel("shop", -200, None).await.unwrap(), Registration::New);
    assert_eq!(db.get_bot("shop").await.unwrap().unwrap().channels, vec![-100, -200]);
    assert_eq!(
      db.register_channel("gone", -300, None).await.unwrap(),
      Registration::LimitReached
    );
  }

  #[tokio::test]
  async fn captchas_expire_and_are_taken_once() {
    let (_dir, db) = open().await;
    let now = Utc::now();
    for (user_id, deadline) in [(7, now - Duration::minutes(1)), (8, now + Duration::minutes(4))] {
      db.save_captcha(&PendingCaptcha {
        bot: "shop".to_string(),
        chat_id: -5,
        user_id,
        message_id: Some(11),
        deadline,
      })
      .await
      .unwrap();
    }
    let expired = db.expired_captchas(now).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].user_id, 7);
    assert!(db.take_captcha("shop", -5, 7).await.unwrap().is_some());
    assert!(db.take_captcha("shop", -5, 7).await.unwrap().is_none());
    assert!(db.expired_captchas(now).await.unwrap().is_empty());
    assert_eq!(db.expired_captchas(now + Duration::minutes(5)).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn paid_order_charges_buyer() {
    let (_dir, db) = open().await;
    db.ensure_member("shop", 2, None, "Buyer".to_string(), None).await.unwrap();
    db.credit("shop", 2, 10, "top up").await.unwrap();
    let order = db.place_paid_order(credit_order("shop", 2), 7).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(db.get_member("shop", 2).await.unwrap().unwrap().credits, 3);
    assert_eq!(db.orders_for_buyer("shop", 2, 10).await.unwrap().len(), 1);

    let result = db.place_paid_order(credit_order("shop", 2), 7).await;
    assert!(matches!(result, Err(CreditError::Insufficient { balance: 3, needed: 7 })));
    assert_eq!(db.orders_for_buyer("shop", 2, 10).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn failed_order_write_refunds_the_charge() {
    let (dir, db) = open().await;
    db.ensure_member("shop", 2, None, "Buyer".to_string(), None).await.unwrap();
    db.credit("shop", 2, 10, "top up").await.unwrap();
    let counters = dir.path().join("counters");
    std::fs::create_dir_all(&counters).unwrap();
    std::fs::write(counters.join("orders.json"), b"not json").unwrap();

    let result = db.place_paid_order(credit_order("shop", 2), 7).await;
    assert!(matches!(result, Err(CreditError::Storage(_))));
    assert_eq!(db.get_member("shop", 2).await.unwrap().unwrap().credits, 10);
    let history = db.transactions("shop", 2, 10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().any(|entry| entry.amount == 7 && entry.reason.starts_with("refund")));
  }
}
