use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

use crate::bot::i18n::Text;
use crate::bot::i18n::tr;
use crate::models::Language;

static TOKEN_PATTERN: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^\d{5,16}:[A-Za-z0-9_-]{30,64}$").expect("valid regex"));

pub const PIN_ITERATIONS: u32 = 100_000;
pub const MAX_PIN_FAILURES: u32 = 5;
pub const PIN_LOCK_MINUTES: i64 = 60;
const SALT_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PinError {
  #[error("PIN must be exactly 4 digits")]
  InvalidFormat,
  #[error("no PIN configured")]
  NotSet,
  #[error("wrong PIN")]
  Mismatch,
  #[error("PIN entry locked")]
  Locked,
}

impl PinError {
  pub fn user_message(&self, language: Language) -> &'static str {
    let text = match self {
      Self::InvalidFormat => Text::PinInvalidFormat,
      Self::NotSet => Text::PinRequired,
      Self::Mismatch => Text::PinWrong,
      Self::Locked => Text::PinLocked,
    };
    tr(language, text)
  }
}

pub fn validate_pin(pin: &str) -> Result<(), PinError> {
  if pin.len() == 4 && pin.bytes().all(|b| b.is_ascii_digit()) {
    Ok(())
  } else {
    Err(PinError::InvalidFormat)
  }
}

/// Produces `salt$iterations$digest`, all hex except the iteration count.
pub fn hash_pin(pin: &str) -> Result<String, PinError> {
  validate_pin(pin)?;
  let salt: [u8; SALT_LEN] = rand::random();
  let digest = stretch(&salt, pin, PIN_ITERATIONS);
  Ok(format!("{}${}${}", hex::encode(salt), PIN_ITERATIONS, hex::encode(digest)))
}

/// [`hash_pin`] on the blocking pool, off the async workers.
pub async fn hash_pin_offloaded(pin: String) -> anyhow::Result<Result<String, PinError>> {
  Ok(tokio::task::spawn_blocking(move || hash_pin(&pin)).await?)
}

/// [`verify_pin`] on the blocking pool, off the async workers.
pub async fn verify_pin_offloaded(pin: String, stored: String) -> anyhow::Result<bool> {
  Ok(tokio::task::spawn_blocking(move || verify_pin(&pin, &stored)).await?)
}

pub fn verify_pin(pin: &str, stored: &str) -> bool {
  let mut parts = stored.split('$');
  let (Some(salt), Some(iterations), Some(expected), None) = (parts.next(), parts.next(), parts.next(), parts.next())
  else {
    return false;
  };
  let (Ok(salt), Ok(iterations), Ok(expected)) = (hex::decode(salt), iterations.parse::<u32>(), hex::decode(expected))
  else {
    return false;
  };
  if iterations == 0 {
    return false;
  }
  let actual = stretch(&salt, pin, iterations);
  constant_time_eq(&actual, &expected)
}

fn stretch(salt: &[u8], pin: &str, iterations: u32) -> [u8; 32] {
  let mut hasher = Sha256::new();
  hasher.update(salt);
  hasher.update(pin.as_bytes());
  let mut digest: [u8; 32] = hasher.finalize().into();
  for _ in 1 .. iterations {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(digest);
    digest = hasher.finalize().into();
  }
  digest
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
  if left.len() != right.len() {
    return false;
  }
  left.iter().zip(right).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

pub fn looks_like_token(candidate: &str) -> bool {
  TOKEN_PATTERN.is_match(candidate.trim())
}

/// Bot id in full, secret reduced to its first and last two characters.
pub fn mask_token(token: &str) -> String {
  match token.split_once(':') {
    Some((id, secret)) if secret.len() > 4 => {
      format!("{id}:{}…{}", &secret[.. 2], &secret[secret.len() - 2 ..])
    },
    _ => "…".to_string(),
  }
}

/// Sliding-window message counter per `(chat, user)`.
pub struct FloodGuard {
  limit: usize,
  window: Duration,
  hits: Mutex<HashMap<(i64, i64), VecDeque<Instant>>>,
}

impl FloodGuard {
  pub fn new(limit: usize, window: Duration) -> Self {
    Self {
      limit,
      window,
      hits: Mutex::new(HashMap::new()),
    }
  }

  /// Records a message and reports whether the sender is over the limit.
  pub fn hit(&self, chat_id: i64, user_id: i64, now: Instant) -> bool {
    let Ok(mut hits) = self.hits.lock() else {
      return false;
    };
    let window = self.window;
    let entry = hits.entry((chat_id, user_id)).or_default();
    while entry
      .front()
      .is_some_and(|first| now.saturating_duration_since(*first) > window)
    {
      entry.pop_front();
    }
    entry.push_back(now);
    let flooding = entry.len() > self.limit;
    if hits.len() > 10_000 {
      hits.retain(|_, stamps| stamps.back().is_some_and(|last| now.saturating_duration_since(*last) <= window));
    }
    flooding
  }
}

impl Default for FloodGuard {
  fn default() -> Self {
    Self::new(6, Duration::from_secs(10))
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;
  use std::time::Instant;

  use super::FloodGuard;
  use super::PinError;
  use super::hash_pin;
  use super::hash_pin_offloaded;
  use super::looks_like_token;
  use super::mask_token;
  use super::verify_pin;
  use super::verify_pin_offloaded;

  #[test]
  fn pin_hash_verifies_only_the_original_pin() {
    let stored = hash_pin("4821").unwrap();
    assert_eq!(stored.split('$').count(), 3);
    assert!(verify_pin("4821", &stored));
    assert!(!verify_pin("4822", &stored));
    assert!(!verify_pin("4821", "garbage"));
  }

  #[tokio::test]
  async fn offloaded_hashing_matches_inline_verification() {
    let stored = hash_pin_offloaded("7305".to_string()).await.unwrap().unwrap();
    assert!(verify_pin("7305", &stored));
    assert!(verify_pin_offloaded("7305".to_string(), stored.clone()).await.unwrap());
    assert!(!verify_pin_offloaded("7306".to_string(), stored).await.unwrap());
    assert_eq!(
      hash_pin_offloaded("73".to_string()).await.unwrap(),
      Err(PinError::InvalidFormat)
    );
  }

  #[test]
  fn salts_differ_between_hashes() {
    assert_ne!(hash_pin("0000").unwrap(), hash_pin("0000").unwrap());
  }

  #[test]
  fn rejects_malformed_pins() {
    assert_eq!(hash_pin("12a4"), Err(PinError::InvalidFormat));
    assert_eq!(hash_pin("12345"), Err(PinError::InvalidFormat));
  }

  #[test]
  fn recognises_token_shape() {
    assert!(looks_like_token("123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsawq"));
    assert!(!looks_like_token("hello there"));
    assert!(!looks_like_token("123:short"));
  }

  #[test]
  fn masks_token_secret() {
    let masked = mask_token("123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsawq");
    assert_eq!(masked, "123456789:AA…wq");
  }

  #[test]
  fn flood_guard_trips_after_limit_and_recovers() {
    let guard = FloodGuard::new(3, Duration::from_secs(10));
    let start = Instant::now();
    for offset in 0 .. 3 {
      assert!(!guard.hit(1, 2, start + Duration::from_secs(offset)));
    }
    assert!(guard.hit(1, 2, start + Duration::from_secs(3)));
    assert!(!guard.hit(1, 3, start + Duration::from_secs(3)));
    assert!(!guard.hit(1, 2, start + Duration::from_secs(30)));
  }
}
