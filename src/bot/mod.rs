pub mod child;
pub mod i18n;
pub mod parent;
pub mod ui;

pub type HandlerResult = anyhow::Result<()>;
