use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Commandes / commands:")]
pub enum ParentCommand {
  /// Open the main menu
  Start,
  /// Show the help text
  Help,
  /// Link a new bot
  NewBot,
  /// List your bots
  MyBots,
  /// Show your plan and usage
  PlanInfo,
  /// Set or change your PIN
  SetPin,
  /// Keep a bot scheduled for deletion: /canceldeletion [username]
  CancelDeletion(String),
  /// Change language
  Lang,
  /// Abort the current action
  Cancel,
  /// [operator] Platform dashboard
  Dashboard,
  /// [operator] Send the next message to every user
  Broadcast,
  /// [operator] Change a plan: /setplan <user id> <plan> [days]
  SetPlan(String),
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use teloxide::utils::command::BotCommands;

  use super::ParentCommand;

  #[test]
  fn every_listed_command_parses_to_its_own_variant() {
    let mut seen = HashSet::new();
    for entry in ParentCommand::bot_commands() {
      let name = entry.command.trim_start_matches('/').to_string();
      let parsed = ParentCommand::parse(&format!("/{name}"), "forge_bot").unwrap();
      let variant = format!("{parsed:?}");
      assert_eq!(variant.split('(').next().unwrap().to_lowercase(), name);
      assert!(seen.insert(name));
    }
    assert_eq!(seen.len(), 12);
  }

  #[test]
  fn operator_commands_keep_their_arguments() {
    assert!(matches!(
      ParentCommand::parse("/setplan 42 pro 30", "forge_bot").unwrap(),
      ParentCommand::SetPlan(args) if args == "42 pro 30"
    ));
    assert!(matches!(
      ParentCommand::parse("/canceldeletion@forge_bot my_shop_bot", "forge_bot").unwrap(),
      ParentCommand::CancelDeletion(name) if name == "my_shop_bot"
    ));
    assert!(matches!(
      ParentCommand::parse("/newbot", "forge_bot").unwrap(),
      ParentCommand::NewBot
    ));
  }

  #[test]
  fn unknown_commands_are_rejected() {
    assert!(ParentCommand::parse("/deleteall", "forge_bot").is_err());
    assert!(ParentCommand::parse("/start@another_bot", "forge_bot").is_err());
  }
}
