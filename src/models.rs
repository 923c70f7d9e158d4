use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use teloxide::types::FileId;
use uuid::Uuid;

use crate::plans::Plan;
use crate::util::cents_to_credits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
  #[default]
  Fr,
  En,
}

impl Language {
  pub fn code(self) -> &'static str {
    match self {
      Language::Fr => "fr",
      Language::En => "en",
    }
  }

  pub fn from_code(code: &str) -> Option<Self> {
    match code {
      "fr" => Some(Language::Fr),
      "en" => Some(Language::En),
      _ => None,
    }
  }
}

/// Platform account of somebody talking to the parent bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
  pub id: i64,
  pub username: Option<String>,
  pub first_name: String,
  #[serde(default)]
  pub language: Language,
  #[serde(default)]
  pub terms_accepted: bool,
  pub pin_hash: Option<String>,
  #[serde(default)]
  pub pin_failures: u32,
  pub locked_until: Option<DateTime<Utc>>,
  #[serde(default)]
  pub plan: Plan,
  pub plan_expires_at: Option<DateTime<Utc>>,
  pub trial_ends_at: DateTime<Utc>,
  #[serde(default)]
  pub bots: Vec<String>,
  pub created_at: DateTime<Utc>,
}

impl UserRecord {
  pub fn new(id: i64, username: Option<String>, first_name: String, trial_ends_at: DateTime<Utc>) -> Self {
    Self {
      id,
      username,
      first_name,
      language: Language::default(),
      terms_accepted: false,
      pin_hash: None,
      pin_failures: 0,
      locked_until: None,
      plan: Plan::Basic,
      plan_expires_at: None,
      trial_ends_at,
      bots: Vec::new(),
      created_at: Utc::now(),
    }
  }

  pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
    self.locked_until.is_some_and(|until| until > now)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
  #[default]
  Active,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSettings {
  /// Credits charged per `/search`.
  #[serde(default)]
  pub search_cost: i64,
  pub welcome: Option<String>,
}

impl Default for BotSettings {
  fn default() -> Self {
    Self {
      search_cost: 0,
      welcome: None,
    }
  }
}

/// A child bot linked by a platform user. Keyed by username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotRecord {
  pub username: String,
  pub bot_id: i64,
  pub name: String,
  pub token: String,
  pub owner_id: i64,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub status: BotStatus,
  pub deletion_requested_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub groups: Vec<i64>,
  #[serde(default)]
  pub channels: Vec<i64>,
  #[serde(default)]
  pub settings: BotSettings,
}

impl BotRecord {
  pub fn is_pending_deletion(&self) -> bool {
    self.deletion_requested_at.is_some()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
  pub bot: String,
  pub chat_id: i64,
  pub title: String,
  #[serde(default)]
  pub banned_words: Vec<String>,
  pub max_warnings: u32,
  #[serde(default)]
  pub captcha: bool,
  pub added_at: DateTime<Utc>,
}

pub const DEFAULT_MAX_WARNINGS: u32 = 3;

impl GroupRecord {
  pub fn new(bot: &str, chat_id: i64, title: String) -> Self {
    Self {
      bot: bot.to_string(),
      chat_id,
      title,
      banned_words: Vec::new(),
      max_warnings: DEFAULT_MAX_WARNINGS,
      captcha: false,
      added_at: Utc::now(),
    }
  }
}

/// Somebody who started a child bot; holds that bot's credit balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
  pub bot: String,
  pub user_id: i64,
  pub username: Option<String>,
  pub first_name: String,
  pub credits: i64,
  pub referred_by: Option<i64>,
  #[serde(default)]
  pub referral_count: u32,
  #[serde(default)]
  pub referral_earnings: i64,
  pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
  pub id: Uuid,
  pub bot: String,
  pub user_id: i64,
  /// Positive for credits received, negative for credits spent.
  pub amount: i64,
  pub balance_after: i64,
  pub reason: String,
  pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
  Eur,
  Usd,
  Credits,
}

impl Currency {
  pub const ALL: [Currency; 3] = [Currency::Eur, Currency::Usd, Currency::Credits];

  pub fn code(self) -> &'static str {
    match self {
      Currency::Eur => "eur",
      Currency::Usd => "usd",
      Currency::Credits => "credits",
    }
  }

  pub fn from_code(code: &str) -> Option<Self> {
    Currency::ALL.into_iter().find(|currency| currency.code() == code)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
  /// The seller delivers by hand after being notified.
  Manual,
  /// The description is sent to the buyer as soon as payment clears.
  Instant,
}

impl DeliveryMode {
  pub fn from_code(code: &str) -> Option<Self> {
    match code {
      "manual" => Some(DeliveryMode::Manual),
      "instant" => Some(DeliveryMode::Instant),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: u64,
  pub bot: String,
  pub name: String,
  pub description: String,
  pub price_cents: i64,
  pub currency: Currency,
  pub photo: Option<FileId>,
  pub delivery: DeliveryMode,
  pub created_at: DateTime<Utc>,
}

impl Product {
  /// Whole credits charged for a credit-priced product, rounded up.
  pub fn credit_cost(&self) -> i64 {
    cents_to_credits(self.price_cents)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
  Pending,
  Paid,
  Delivered,
  Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
  pub id: u64,
  pub bot: String,
  pub product_id: u64,
  pub product_name: String,
  pub buyer_id: i64,
  pub price_cents: i64,
  pub currency: Currency,
  pub status: OrderStatus,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
  pub id: u64,
  pub bot: String,
  pub title: String,
  pub file_name: String,
  pub file_id: FileId,
  pub uploaded_by: i64,
  pub content: String,
  pub keywords: Vec<String>,
  pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WarningEntry {
  pub count: u32,
  pub reasons: Vec<String>,
  pub last_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCaptcha {
  pub bot: String,
  pub chat_id: i64,
  pub user_id: i64,
  pub message_id: Option<i32>,
  pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledPost {
  pub id: u64,
  pub bot: String,
  pub chat_id: i64,
  pub text: String,
  pub interval_secs: u64,
  pub next_at: DateTime<Utc>,
  pub created_by: i64,
  pub last_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
  Info,
  Violation,
  Deletion,
  Plan,
  Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  pub id: Uuid,
  pub kind: LogKind,
  pub text: String,
  pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
  pub user_id: i64,
  pub plan: Plan,
  pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlatformStats {
  pub users: usize,
  pub bots: usize,
  pub failed_bots: usize,
  pub pending_deletions: usize,
  pub groups: usize,
  pub plans: Vec<(Plan, usize)>,
}
