use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum ParentState {
  #[default]
  Idle,
  AwaitingToken,
  ConfirmDeletion {
    bot: String,
  },
  AwaitingDeletionPin {
    bot: String,
  },
  SetPin(PinDraft),
  Broadcast {
    admin_id: i64,
  },
}

/// The new PIN is kept hashed while waiting for its confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinDraft {
  pub stage: PinStage,
  pub pending_hash: Option<String>,
}

impl PinDraft {
  pub fn new(has_pin: bool) -> Self {
    Self {
      stage: if has_pin { PinStage::Current } else { PinStage::New },
      pending_hash: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PinStage {
  Current,
  New,
  Confirm,
}

#[cfg(test)]
mod tests {
  use super::PinDraft;
  use super::PinStage;

  #[test]
  fn pin_draft_asks_current_pin_only_when_one_exists() {
    assert_eq!(PinDraft::new(true).stage, PinStage::Current);
    assert_eq!(PinDraft::new(false).stage, PinStage::New);
    assert!(PinDraft::new(false).pending_hash.is_none());
  }
}
