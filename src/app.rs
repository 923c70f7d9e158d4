use std::sync::Arc;

use teloxide::dispatching::UpdateHandler;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dptree;
use teloxide::error_handlers::LoggingErrorHandler;
use teloxide::prelude::*;
use tracing::info;
use tracing::warn;

use crate::bot::parent;
use crate::bot::parent::ParentContext;
use crate::bot::parent::ParentDialogueStorage;
use crate::config::Config;
use crate::db::Db;
use crate::notifier::Notifier;
use crate::scheduler::Scheduler;
use crate::supervisor::Supervisor;

/// The platform bot plus every child bot and the background jobs.
pub struct App {
  bot: Bot,
  context: Arc<ParentContext>,
  supervisor: Supervisor,
  scheduler: Scheduler,
  handler: UpdateHandler<anyhow::Error>,
}

impl App {
  pub fn new(bot: Bot, db: Db, config: Config) -> Self {
    let notifier = Notifier::new(bot.clone(), db.clone(), config.admins.clone());
    let supervisor = Supervisor::new(db.clone(), notifier.clone());
    let scheduler = Scheduler::new(db.clone(), supervisor.clone(), notifier.clone(), &config);
    let context = Arc::new(ParentContext::new(db, supervisor.clone(), notifier, config));
    let handler = parent::build_schema();
    Self {
      bot,
      context,
      supervisor,
      scheduler,
      handler,
    }
  }

  pub async fn run(self) -> anyhow::Result<()> {
    let storage: Arc<ParentDialogueStorage> = InMemStorage::new();
    let me = self.bot.get_me().await?;
    info!(username = %me.username(), "platform bot authenticated");

    match self.supervisor.start_all().await {
      Ok(started) => info!(started, "child bots started"),
      Err(err) => warn!(error = %format!("{err:#}"), "failed to start child bots"),
    }
    let jobs = tokio::spawn(self.scheduler.run());

    Dispatcher::builder(self.bot.clone(), self.handler)
      .dependencies(dptree::deps![self.context.clone(), storage.clone(), me])
      .default_handler(|_| async {})
      .error_handler(LoggingErrorHandler::with_custom_text("platform dispatcher error"))
      .enable_ctrlc_handler()
      .build()
      .dispatch()
      .await;

    info!("platform bot stopped, shutting down");
    jobs.abort();
    self.supervisor.shutdown_all().await;
    Ok(())
  }
}
