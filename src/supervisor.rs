//! Runs one teloxide dispatcher per linked bot inside this process.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use futures::future::join_all;
use teloxide::ApiError;
use teloxide::RequestError;
use teloxide::dispatching::ShutdownToken;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dptree;
use teloxide::error_handlers::LoggingErrorHandler;
use teloxide::prelude::*;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bot::child;
use crate::bot::child::ChildContext;
use crate::bot::child::ChildState;
use crate::db::Db;
use crate::models::BotRecord;
use crate::models::BotStatus;
use crate::models::LogKind;
use crate::notifier::Notifier;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct ChildHandle {
  generation: u64,
  bot: Bot,
  shutdown: ShutdownToken,
  task: JoinHandle<()>,
  stopping: Arc<AtomicBool>,
}

/// Removes `username` only while its entry still belongs to `generation`.
fn remove_current<T>(
  children: &mut HashMap<String, T>,
  username: &str,
  generation: u64,
  generation_of: impl Fn(&T) -> u64,
) -> Option<T> {
  if children.get(username).map(&generation_of) != Some(generation) {
    return None;
  }
  children.remove(username)
}

#[derive(Clone)]
pub struct Supervisor {
  children: Arc<Mutex<HashMap<String, ChildHandle>>>,
  generations: Arc<AtomicU64>,
  db: Db,
  notifier: Notifier,
}

impl Supervisor {
  pub fn new(db: Db, notifier: Notifier) -> Self {
    Self {
      children: Arc::new(Mutex::new(HashMap::new())),
      generations: Arc::new(AtomicU64::new(0)),
      db,
      notifier,
    }
  }

  /// Starts polling for `record`; a bot that is already running is left alone.
  #[instrument(skip(self, record), fields(bot = %record.username))]
  pub async fn start(&self, record: &BotRecord) -> Result<()> {
    if self.children.lock().await.contains_key(&record.username) {
      return Ok(());
    }
    let bot = Bot::new(record.token.clone());
    let me = bot
      .get_me()
      .await
      .with_context(|| format!("@{} rejected its token", record.username))?;

    let context = Arc::new(ChildContext::new(
      self.db.clone(),
      record.username.clone(),
      record.owner_id,
      self.notifier.clone(),
    ));
    let storage: Arc<child::ChildDialogueStorage> = InMemStorage::<ChildState>::new();
    let mut dispatcher = Dispatcher::builder(bot.clone(), child::build_schema())
      .dependencies(dptree::deps![context, storage, me])
      .default_handler(|_| async {})
      .error_handler(LoggingErrorHandler::with_custom_text("child bot handler failed"))
      .build();
    let shutdown = dispatcher.shutdown_token();
    let stopping = Arc::new(AtomicBool::new(false));
    let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;

    let task = {
      let stopping = stopping.clone();
      let supervisor = self.clone();
      let username = record.username.clone();
      tokio::spawn(async move {
        dispatcher.dispatch().await;
        if stopping.load(Ordering::SeqCst) {
          info!(bot = %username, "child bot stopped");
          return;
        }
        let removed = remove_current(&mut *supervisor.children.lock().await, &username, generation, |handle| {
          handle.generation
        });
        if removed.is_none() {
          warn!(bot = %username, generation, "stale dispatcher exited; a newer one is running");
          return;
        }
        supervisor
          .mark_failed(&username, "its dispatcher exited unexpectedly")
          .await;
      })
    };

    let mut children = self.children.lock().await;
    if children.contains_key(&record.username) {
      // lost a race with a concurrent start of the same bot
      stopping.store(true, Ordering::SeqCst);
      task.abort();
      return Ok(());
    }
    children.insert(
      record.username.clone(),
      ChildHandle {
        generation,
        bot,
        shutdown,
        task,
        stopping,
      },
    );
    info!("child bot started");
    Ok(())
  }

  /// Stops a running bot and waits for its dispatcher to finish.
  #[instrument(skip(self))]
  pub async fn stop(&self, username: &str) -> bool {
    let Some(handle) = self.children.lock().await.remove(username) else {
      return false;
    };
    handle.stopping.store(true, Ordering::SeqCst);
    match handle.shutdown.shutdown() {
      Ok(stopped) => {
        if tokio::time::timeout(STOP_TIMEOUT, stopped).await.is_err() {
          warn!("child dispatcher did not stop in time; aborting");
          handle.task.abort();
        }
      },
      // not dispatching yet, nothing to drain
      Err(_) => handle.task.abort(),
    }
    info!("child bot stopped");
    true
  }

  pub async fn bot(&self, username: &str) -> Option<Bot> {
    self
      .children
      .lock()
      .await
      .get(username)
      .map(|handle| handle.bot.clone())
  }

  pub async fn is_running(&self, username: &str) -> bool {
    self.children.lock().await.contains_key(username)
  }

  pub async fn running(&self) -> Vec<String> {
    let mut names: Vec<String> = self.children.lock().await.keys().cloned().collect();
    names.sort();
    names
  }

  /// Boots every stored bot; returns how many are running.
  #[instrument(skip(self))]
  pub async fn start_all(&self) -> Result<usize> {
    let records = self.db.all_bots().await?;
    for record in &records {
      match self.start(record).await {
        Ok(()) => {
          if record.status == BotStatus::Failed {
            self.db.set_bot_status(&record.username, BotStatus::Active).await?;
            info!(bot = %record.username, "failed bot recovered");
          }
        },
        Err(err) => {
          warn!(bot = %record.username, error = %format!("{err:#}"), "failed to start child bot");
          if record.status != BotStatus::Failed {
            self.mark_failed(&record.username, "it could not start").await;
          }
        },
      }
    }
    let running = self.children.lock().await.len();
    info!(total = records.len(), running, "child bots booted");
    Ok(running)
  }

  #[instrument(skip(self))]
  pub async fn shutdown_all(&self) {
    for username in self.running().await {
      self.stop(&username).await;
    }
  }

  /// Probes every running bot and stops those whose token Telegram rejects.
  #[instrument(skip(self))]
  pub async fn check_health(&self) -> Vec<String> {
    let probes: Vec<(String, Bot)> = self
      .children
      .lock()
      .await
      .iter()
      .map(|(name, handle)| (name.clone(), handle.bot.clone()))
      .collect();
    let results = join_all(probes.iter().map(|(_, bot)| async move { bot.get_me().await })).await;
    let mut failed = Vec::new();
    for ((username, _), result) in probes.into_iter().zip(results) {
      match result {
        Ok(_) => {},
        Err(RequestError::Api(ApiError::InvalidToken)) => {
          self.stop(&username).await;
          self.mark_failed(&username, "Telegram rejected its token").await;
          failed.push(username);
        },
        Err(err) => warn!(bot = %username, error = %err, "health probe failed"),
      }
    }
    failed
  }

  async fn mark_failed(&self, username: &str, reason: &str) {
    let record = match self.db.set_bot_status(username, BotStatus::Failed).await {
      Ok(record) => record,
      Err(err) => {
        error!(bot = username, error = %format!("{err:#}"), "failed to mark bot as failed");
        None
      },
    };
    self
      .notifier
      .record(LogKind::Error, &format!("@{username} went down: {reason}"))
      .await;
    if let Some(record) = record {
      self
        .notifier
        .notify_user(
          record.owner_id,
          &format!("⚠️ Your bot @{username} stopped: {reason}. Check its token with @BotFather, then link it again."),
        )
        .await;
    }
  }
}

#[cfg(test)]
mod tests {
  use teloxide::Bot;
  use tempfile::tempdir;

  use std::collections::HashMap;

  use super::Supervisor;
  use super::remove_current;
  use crate::db::Db;
  use crate::notifier::Notifier;

  #[test]
  fn exit_of_an_old_dispatcher_keeps_the_restarted_one() {
    let mut children: HashMap<String, u64> = HashMap::from([("shop_bot".to_string(), 2)]);
    assert_eq!(remove_current(&mut children, "shop_bot", 1, |generation| *generation), None);
    assert!(children.contains_key("shop_bot"));
    assert_eq!(remove_current(&mut children, "shop_bot", 2, |generation| *generation), Some(2));
    assert!(children.is_empty());
    assert_eq!(remove_current(&mut children, "ghost_bot", 1, |generation| *generation), None);
  }

  #[tokio::test]
  async fn stopping_unknown_bot_is_a_noop() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path()).await.unwrap();
    let notifier = Notifier::new(Bot::new("1:test"), db.clone(), vec![]);
    let supervisor = Supervisor::new(db, notifier);
    assert!(!supervisor.stop("ghost_bot").await);
    assert!(supervisor.running().await.is_empty());
    assert!(supervisor.bot("ghost_bot").await.is_none());
  }

  #[tokio::test]
  async fn start_all_with_no_bots_runs_nothing() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path()).await.unwrap();
    let notifier = Notifier::new(Bot::new("1:test"), db.clone(), vec![]);
    let supervisor = Supervisor::new(db, notifier);
    assert_eq!(supervisor.start_all().await.unwrap(), 0);
  }
}
