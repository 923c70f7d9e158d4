use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum ChildCommand {
  /// Register and show the welcome message
  Start(String),
  /// Show the help text
  Help,
  /// Show your credit balance and recent activity
  Credits,
  /// Get your personal invite link
  Invite,
  /// Show your referral statistics
  Referrals,
  /// Browse the shop
  Shop,
  /// Show orders
  Orders,
  /// Search indexed documents: /search words "exact phrase" tag:x -exclude
  Search(String),
  /// List indexed documents
  Docs,
  /// Abort the current wizard
  Cancel,
  /// [owner] Add a product to the shop
  AddProduct,
  /// [owner] Remove a product: /delproduct <id>
  DelProduct(String),
  /// [owner] Mark an order delivered: /deliver <order id>
  Deliver(String),
  /// [owner] Give credits: /grant <user id> <amount>
  Grant(String),
  /// [owner] Remove an indexed document: /deldoc <id>
  DelDoc(String),
  /// [owner] Credits charged per search: /setsearchcost <n>
  SetSearchCost(String),
  /// [owner] Set the /start greeting: /setwelcome <text>
  SetWelcome(String),
  /// [owner] Usage statistics
  Stats,
  /// [owner] Repeat a post in this group: /schedule <30m|2h|1d> <text>
  Schedule(String),
  /// [owner] List scheduled posts
  Schedules,
  /// [owner] Remove a scheduled post: /unschedule <id>
  Unschedule(String),
  /// [group admin] Remove a member
  Kick(String),
  /// [group admin] Ban a member: /ban [user id] [1d] [reason]
  Ban(String),
  /// [group admin] Lift a ban: /unban <user id>
  Unban(String),
  /// [group admin] Silence a member: /mute [user id] [30m]
  Mute(String),
  /// [group admin] Lift a mute
  Unmute(String),
  /// [group admin] Warn a member; too many warnings mean a ban
  Warn(String),
  /// [group admin] Reset a member's warnings
  ClearWarns(String),
  /// [group admin] Delete messages containing a word
  BanWord(String),
  /// [group admin] Allow a word again
  UnbanWord(String),
  /// [group admin] Warnings before an automatic ban
  SetWarnLimit(String),
  /// [group admin] Pin the replied message or post and pin text
  Pin(String),
  /// [group admin] Unpin the latest pinned message
  Unpin,
  /// [group admin] Require new members to prove they are human: /captcha on|off
  Captcha(String),
  /// [group admin] Show this group's moderation settings
  Rules,
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use teloxide::utils::command::BotCommands;

  use super::ChildCommand;

  fn variant_name(command: &ChildCommand) -> String {
    let debug = format!("{command:?}");
    debug.split('(').next().unwrap_or_default().to_lowercase()
  }

  #[test]
  fn every_listed_command_parses_to_its_own_variant() {
    let listed = ChildCommand::bot_commands();
    let mut seen = HashSet::new();
    for entry in &listed {
      let name = entry.command.trim_start_matches('/');
      let parsed = ChildCommand::parse(&format!("/{name}"), "shop_bot").unwrap();
      assert_eq!(variant_name(&parsed), name);
      assert!(seen.insert(name.to_string()), "{name} listed twice");
    }
    assert_eq!(seen.len(), 35);
  }

  #[test]
  fn arguments_reach_the_variant() {
    match ChildCommand::parse("/start ref_42", "shop_bot").unwrap() {
      ChildCommand::Start(payload) => assert_eq!(payload, "ref_42"),
      other => panic!("unexpected {other:?}"),
    }
    match ChildCommand::parse("/search \"refund policy\" -draft", "shop_bot").unwrap() {
      ChildCommand::Search(query) => assert_eq!(query, "\"refund policy\" -draft"),
      other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
      ChildCommand::parse("/setsearchcost@shop_bot 3", "shop_bot").unwrap(),
      ChildCommand::SetSearchCost(cost) if cost == "3"
    ));
  }

  #[test]
  fn unknown_or_foreign_commands_are_rejected() {
    assert!(ChildCommand::parse("/frobnicate", "shop_bot").is_err());
    assert!(ChildCommand::parse("/help@other_bot", "shop_bot").is_err());
  }
}
