use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::models::Currency;

static PRICE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(?:[.,]\d{1,2})?$").expect("valid regex"));

/// Upper bound for any price, in cents.
pub const MAX_PRICE_CENTS: i64 = 1_000_000_00;

/// Telegram rejects messages above 4096 characters; stay clear of it.
pub const MESSAGE_CHUNK_CHARS: usize = 4000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
  #[error("amount must match 0.00 format")]
  InvalidFormat,
  #[error("amount exceeds supported range")]
  OutOfRange,
  #[error("amount must be greater than zero")]
  NotPositive,
}

pub fn parse_money_to_cents(input: &str) -> Result<i64, MoneyError> {
  let normalized = input.trim().replace(',', ".");
  if !PRICE_PATTERN.is_match(&normalized) {
    return Err(MoneyError::InvalidFormat);
  }

  let (major, minor) = match normalized.split_once('.') {
    Some((major, minor)) => (major, minor),
    None => (normalized.as_str(), ""),
  };
  let major = major.parse::<i64>().map_err(|_| MoneyError::OutOfRange)?;
  let minor = match minor.len() {
    0 => 0,
    1 => minor.parse::<i64>().map_err(|_| MoneyError::InvalidFormat)? * 10,
    _ => minor.parse::<i64>().map_err(|_| MoneyError::InvalidFormat)?,
  };

  let cents = major
    .checked_mul(100)
    .and_then(|value| value.checked_add(minor))
    .ok_or(MoneyError::OutOfRange)?;
  if cents == 0 {
    return Err(MoneyError::NotPositive);
  }
  if cents > MAX_PRICE_CENTS {
    return Err(MoneyError::OutOfRange);
  }
  Ok(cents)
}

pub fn format_cents(amount: i64) -> String {
  format!("{}.{:02}", amount / 100, (amount % 100).abs())
}

/// Whole credits for a price in cents, rounded up.
pub fn cents_to_credits(amount_cents: i64) -> i64 {
  let credits = amount_cents.max(0).unsigned_abs().div_ceil(100);
  i64::try_from(credits).unwrap_or(i64::MAX)
}

pub fn format_price(amount_cents: i64, currency: Currency) -> String {
  match currency {
    Currency::Eur => format!("€{}", format_cents(amount_cents)),
    Currency::Usd => format!("${}", format_cents(amount_cents)),
    Currency::Credits => format!("{} credits", cents_to_credits(amount_cents)),
  }
}

/// Splits on line boundaries where possible so each chunk fits one message.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
  let mut chunks = Vec::new();
  let mut current = String::new();
  let mut current_len = 0usize;
  for line in text.split_inclusive('\n') {
    let line_len = line.chars().count();
    if current_len + line_len > max_chars && !current.is_empty() {
      chunks.push(std::mem::take(&mut current));
      current_len = 0;
    }
    if line_len > max_chars {
      let chars: Vec<char> = line.chars().collect();
      for piece in chars.chunks(max_chars) {
        chunks.push(piece.iter().collect());
      }
      continue;
    }
    current.push_str(line);
    current_len += line_len;
  }
  if !current.is_empty() {
    chunks.push(current);
  }
  chunks
}

pub fn truncate_text(text: &str, max_chars: usize) -> String {
  if text.chars().count() <= max_chars {
    return text.to_string();
  }
  let mut truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
  truncated.push('…');
  truncated
}

#[cfg(test)]
mod tests {
  use super::MAX_PRICE_CENTS;
  use super::MoneyError;
  use super::cents_to_credits;
  use super::format_cents;
  use super::format_price;
  use super::parse_money_to_cents;
  use super::split_message;
  use super::truncate_text;
  use crate::models::Currency;

  #[test]
  fn parses_valid_amounts() {
    assert_eq!(parse_money_to_cents("10"), Ok(1000));
    assert_eq!(parse_money_to_cents("10.5"), Ok(1050));
    assert_eq!(parse_money_to_cents("10,55"), Ok(1055));
  }

  #[test]
  fn rejects_invalid_formats() {
    assert_eq!(parse_money_to_cents("abc"), Err(MoneyError::InvalidFormat));
    assert_eq!(parse_money_to_cents("10.555"), Err(MoneyError::InvalidFormat));
    assert_eq!(parse_money_to_cents("-3"), Err(MoneyError::InvalidFormat));
    assert_eq!(parse_money_to_cents("0.00"), Err(MoneyError::NotPositive));
  }

  #[test]
  fn caps_prices_at_one_million() {
    assert_eq!(parse_money_to_cents("1000000"), Ok(MAX_PRICE_CENTS));
    assert_eq!(parse_money_to_cents("1000000.01"), Err(MoneyError::OutOfRange));
    assert_eq!(
      parse_money_to_cents("92233720368547758.07"),
      Err(MoneyError::OutOfRange)
    );
    assert_eq!(parse_money_to_cents("99999999999999999999"), Err(MoneyError::OutOfRange));
  }

  #[test]
  fn credit_prices_round_up_without_overflow() {
    assert_eq!(cents_to_credits(1), 1);
    assert_eq!(cents_to_credits(100), 1);
    assert_eq!(cents_to_credits(101), 2);
    assert_eq!(cents_to_credits(i64::MAX), i64::MAX / 100 + 1);
    assert_eq!(format_price(i64::MAX, Currency::Credits), format!("{} credits", i64::MAX / 100 + 1));
  }

  #[test]
  fn formats_prices_per_currency() {
    assert_eq!(format_cents(1234), "12.34");
    assert_eq!(format_price(999, Currency::Eur), "€9.99");
    assert_eq!(format_price(500, Currency::Usd), "$5.00");
    assert_eq!(format_price(250, Currency::Credits), "3 credits");
  }

  #[test]
  fn splits_long_text_on_lines() {
    let text = "aaaa\nbbbb\ncccc\n";
    let chunks = split_message(text, 10);
    assert_eq!(chunks, vec!["aaaa\nbbbb\n", "cccc\n"]);
    let long = "x".repeat(25);
    assert_eq!(split_message(&long, 10).len(), 3);
  }

  #[test]
  fn truncates_with_ellipsis() {
    assert_eq!(truncate_text("short", 10), "short");
    assert_eq!(truncate_text("a long product name", 8), "a long …");
  }
}
