mod app;
mod bot;
mod config;
mod db;
mod models;
mod moderation;
mod notifier;
mod plans;
mod referral;
mod scheduler;
mod search;
mod security;
mod store;
mod supervisor;
mod telemetry;
mod util;

use anyhow::Result;
use teloxide::prelude::Bot;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
  telemetry::init()?;
  let config = config::Config::from_env()?;
  info!(
    admin_count = config.admins.len(),
    data_dir = %config.data_dir.display(),
    "starting platform bot"
  );

  let bot = Bot::new(config.bot_token.clone());
  let db = db::Db::open(&config.data_dir).await?;
  let app = app::App::new(bot, db, config);
  app.run().await
}
