use std::collections::HashSet;

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static DURATION_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,4})([mhd])$").expect("valid regex"));

pub const DEFAULT_MUTE_MINUTES: i64 = 60;
pub const CAPTCHA_TIMEOUT_SECS: i64 = 180;
/// Messages shorter than this are never judged on character variety.
const VARIETY_MIN_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
  #[error("duration must look like 30m, 2h or 1d")]
  InvalidFormat,
  #[error("duration must be longer than zero")]
  Zero,
}

pub fn parse_duration(raw: &str) -> Result<Duration, DurationError> {
  let trimmed = raw.trim().to_ascii_lowercase();
  let captures = DURATION_PATTERN
    .captures(&trimmed)
    .ok_or(DurationError::InvalidFormat)?;
  let amount: i64 = captures[1].parse().map_err(|_| DurationError::InvalidFormat)?;
  if amount == 0 {
    return Err(DurationError::Zero);
  }
  let duration = match &captures[2] {
    "m" => Duration::minutes(amount),
    "h" => Duration::hours(amount),
    _ => Duration::days(amount),
  };
  Ok(duration)
}

pub fn format_duration(duration: Duration) -> String {
  let minutes = duration.num_minutes();
  if minutes % (24 * 60) == 0 {
    format!("{}d", minutes / (24 * 60))
  } else if minutes % 60 == 0 {
    format!("{}h", minutes / 60)
  } else {
    format!("{minutes}m")
  }
}

/// Parsed arguments of `/ban`, `/mute`, `/warn` and friends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModerationArgs {
  /// Explicit numeric target; callers fall back to the replied-to user.
  pub target: Option<i64>,
  pub duration: Option<Duration>,
  pub reason: Option<String>,
}

/// Accepts `[user_id] [duration] [reason...]` in that order, each part optional.
pub fn parse_moderation_args(raw: &str) -> ModerationArgs {
  let mut args = ModerationArgs::default();
  let mut parts = raw.split_whitespace().peekable();
  if let Some(first) = parts.peek()
    && let Ok(id) = first.parse::<i64>()
  {
    args.target = Some(id);
    parts.next();
  }
  if let Some(next) = parts.peek()
    && let Ok(duration) = parse_duration(next)
  {
    args.duration = Some(duration);
    parts.next();
  }
  let reason = parts.collect::<Vec<_>>().join(" ");
  if !reason.is_empty() {
    args.reason = Some(reason);
  }
  args
}

/// First banned word present in `text` as a whole word, case-insensitive.
pub fn find_banned_word<'a>(text: &str, banned: &'a [String]) -> Option<&'a str> {
  if banned.is_empty() {
    return None;
  }
  let words: HashSet<String> = text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|word| !word.is_empty())
    .map(|word| word.to_lowercase())
    .collect();
  banned
    .iter()
    .find(|word| words.contains(&word.to_lowercase()))
    .map(String::as_str)
}

/// Long messages made of very few distinct characters, e.g. keyboard mashing.
pub fn is_low_variety(text: &str) -> bool {
  let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
  if chars.len() < VARIETY_MIN_LEN {
    return false;
  }
  let distinct: HashSet<&char> = chars.iter().collect();
  distinct.len() * 10 < chars.len() * 3
}

pub fn normalize_banned_word(raw: &str) -> Option<String> {
  let word = raw.trim().to_lowercase();
  if word.is_empty() || word.chars().any(|c| !c.is_alphanumeric()) {
    None
  } else {
    Some(word)
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration;

  use super::DurationError;
  use super::find_banned_word;
  use super::format_duration;
  use super::is_low_variety;
  use super::normalize_banned_word;
  use super::parse_duration;
  use super::parse_moderation_args;

  #[test]
  fn parses_duration_units() {
    assert_eq!(parse_duration("30m"), Ok(Duration::minutes(30)));
    assert_eq!(parse_duration("2H"), Ok(Duration::hours(2)));
    assert_eq!(parse_duration("1d"), Ok(Duration::days(1)));
    assert_eq!(parse_duration("0h"), Err(DurationError::Zero));
    assert_eq!(parse_duration("soon"), Err(DurationError::InvalidFormat));
  }

  #[test]
  fn formats_durations_compactly() {
    assert_eq!(format_duration(Duration::days(2)), "2d");
    assert_eq!(format_duration(Duration::hours(5)), "5h");
    assert_eq!(format_duration(Duration::minutes(90)), "90m");
  }

  #[test]
  fn splits_moderation_arguments() {
    let args = parse_moderation_args("12345 2h spamming links");
    assert_eq!(args.target, Some(12345));
    assert_eq!(args.duration, Some(Duration::hours(2)));
    assert_eq!(args.reason.as_deref(), Some("spamming links"));

    let reply_style = parse_moderation_args("1d");
    assert_eq!(reply_style.target, None);
    assert_eq!(reply_style.duration, Some(Duration::days(1)));
    assert!(reply_style.reason.is_none());

    assert_eq!(parse_moderation_args("").reason, None);
  }

  #[test]
  fn banned_words_match_whole_words_only() {
    let banned = vec!["scam".to_string()];
    assert_eq!(find_banned_word("This is a SCAM!", &banned), Some("scam"));
    assert_eq!(find_banned_word("scampi for dinner", &banned), None);
  }

  #[test]
  fn detects_keyboard_mashing() {
    assert!(is_low_variety("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
    assert!(!is_low_variety("The quick brown fox jumps over the lazy dog"));
    assert!(!is_low_variety("ok ok"));
  }

  #[test]
  fn normalizes_banned_words() {
    assert_eq!(normalize_banned_word("  Casino "), Some("casino".to_string()));
    assert_eq!(normalize_banned_word("two words"), None);
  }
}
