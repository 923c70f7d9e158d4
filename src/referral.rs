/// Credits granted to the member whose link was used.
pub const REFERRER_REWARD: i64 = 100;
/// Credits granted to the newcomer who joined through a link.
pub const NEWCOMER_REWARD: i64 = 50;

const PAYLOAD_PREFIX: &str = "ref_";

pub fn referral_payload(user_id: i64) -> String {
  format!("{PAYLOAD_PREFIX}{user_id}")
}

/// Extracts the referrer from a `/start` payload, ignoring self-referrals.
pub fn parse_referral(payload: &str, joining_user: i64) -> Option<i64> {
  let referrer = payload.trim().strip_prefix(PAYLOAD_PREFIX)?.parse::<i64>().ok()?;
  (referrer > 0 && referrer != joining_user).then_some(referrer)
}

pub fn invite_link(bot_username: &str, user_id: i64) -> String {
  format!("https://t.me/{bot_username}?start={}", referral_payload(user_id))
}

#[cfg(test)]
mod tests {
  use super::invite_link;
  use super::parse_referral;

  #[test]
  fn round_trips_payload_through_link() {
    let link = invite_link("shopbot", 42);
    assert_eq!(link, "https://t.me/shopbot?start=ref_42");
    let payload = link.rsplit('=').next().unwrap();
    assert_eq!(parse_referral(payload, 7), Some(42));
  }

  #[test]
  fn rejects_self_and_garbage_referrals() {
    assert_eq!(parse_referral("ref_7", 7), None);
    assert_eq!(parse_referral("ref_abc", 7), None);
    assert_eq!(parse_referral("promo", 7), None);
    assert_eq!(parse_referral("", 7), None);
  }
}
