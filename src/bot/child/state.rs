use serde::Deserialize;
use serde::Serialize;
use teloxide::types::FileId;

use crate::models::Currency;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum ChildState {
  #[default]
  Idle,
  AddProduct(ProductDraft),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductDraft {
  pub stage: ProductStage,
  pub owner_id: i64,
  pub name: Option<String>,
  pub description: Option<String>,
  pub price_cents: Option<i64>,
  pub currency: Option<Currency>,
  pub photo: Option<FileId>,
}

impl ProductDraft {
  pub fn new(owner_id: i64) -> Self {
    Self {
      stage: ProductStage::Name,
      owner_id,
      name: None,
      description: None,
      price_cents: None,
      currency: None,
      photo: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProductStage {
  Name,
  Description,
  Price,
  Currency,
  Photo,
  Delivery,
}

#[cfg(test)]
mod tests {
  use super::ProductDraft;
  use super::ProductStage;

  #[test]
  fn new_draft_starts_with_name_stage() {
    let draft = ProductDraft::new(1);
    assert_eq!(draft.stage, ProductStage::Name);
    assert_eq!(draft.owner_id, 1);
    assert!(draft.photo.is_none());
  }
}
