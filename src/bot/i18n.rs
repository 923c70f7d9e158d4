//! French and English copy of the parent bot.

use crate::models::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Text {
  ChooseLanguage,
  LanguageSaved,
  Terms,
  TermsAccept,
  TermsDecline,
  TermsDeclined,
  MainMenu,
  MenuLink,
  MenuBots,
  MenuPlan,
  MenuPin,
  MenuHelp,
  MenuLanguage,
  MenuDashboard,
  Back,
  Help,
  Cancelled,
  HaveToken,
  HaveTokenYes,
  HaveTokenNo,
  TokenGuide,
  SendToken,
  NoBots,
  BotsHeader,
  PinPromptOld,
  PinPromptNew,
  PinPromptConfirm,
  PinMismatch,
  PinSaved,
  PinRequired,
  PinPromptDeletion,
  PinInvalidFormat,
  PinWrong,
  PinLocked,
}

pub fn tr(language: Language, text: Text) -> &'static str {
  match language {
    Language::Fr => fr(text),
    Language::En => en(text),
  }
}

fn fr(text: Text) -> &'static str {
  match text {
    Text::ChooseLanguage => "🌍 Choisissez votre langue / Choose your language",
    Text::LanguageSaved => "✅ Langue enregistrée.",
    Text::Terms => "📜 <b>Conditions d'utilisation</b>\n\nVous restez responsable des bots que vous liez et de leur contenu. Les tokens sont conservés pour faire tourner vos bots. Le spam, la fraude et les contenus illégaux entraînent la suppression du compte.\n\nAcceptez-vous ces conditions ?",
    Text::TermsAccept => "✅ J'accepte",
    Text::TermsDecline => "❌ Je refuse",
    Text::TermsDeclined => "Vous devez accepter les conditions pour utiliser la plateforme. Tapez /start pour recommencer.",
    Text::MainMenu => "🤖 <b>Menu principal</b>\n\nQue voulez-vous faire ?",
    Text::MenuLink => "➕ Lier un bot",
    Text::MenuBots => "🤖 Mes bots",
    Text::MenuPlan => "💳 Mon offre",
    Text::MenuPin => "🔐 Code PIN",
    Text::MenuHelp => "❓ Aide",
    Text::MenuLanguage => "🌍 Langue",
    Text::MenuDashboard => "📊 Tableau de bord",
    Text::Back => "⬅️ Retour",
    Text::Help => "❓ <b>Aide</b>\n\n/newbot lier un bot\n/mybots vos bots\n/planinfo votre offre\n/setpin définir le code PIN\n/canceldeletion annuler une suppression\n/lang changer de langue\n/cancel annuler l'action en cours\n\nChaque bot lié propose une boutique, des crédits, du parrainage, une recherche de documents et la modération de groupes. Envoyez /help à votre bot pour ses commandes.",
    Text::Cancelled => "❌ Action annulée.",
    Text::HaveToken => "🔑 Avez-vous déjà un token de bot fourni par @BotFather ?",
    Text::HaveTokenYes => "✅ Oui",
    Text::HaveTokenNo => "❓ Non, comment faire ?",
    Text::TokenGuide => "1. Ouvrez @BotFather\n2. Envoyez /newbot et suivez les étapes\n3. Copiez le token qu'il vous donne\n\nRevenez ensuite avec /newbot.",
    Text::SendToken => "📨 Envoyez-moi le token de votre bot (ou /cancel).",
    Text::NoBots => "Vous n'avez encore aucun bot. Utilisez /newbot pour en lier un.",
    Text::BotsHeader => "🤖 <b>Vos bots</b>",
    Text::PinPromptOld => "🔐 Entrez votre code PIN actuel.",
    Text::PinPromptNew => "🔐 Choisissez un nouveau code PIN à 4 chiffres.",
    Text::PinPromptConfirm => "🔁 Confirmez le nouveau code PIN.",
    Text::PinMismatch => "Les deux codes ne correspondent pas. Recommencez avec /setpin.",
    Text::PinSaved => "✅ Code PIN enregistré.",
    Text::PinRequired => "🔐 Définissez d'abord un code PIN avec /setpin.",
    Text::PinPromptDeletion => "🔐 Entrez votre code PIN pour confirmer la suppression.",
    Text::PinInvalidFormat => "Le code PIN doit contenir exactement 4 chiffres.",
    Text::PinWrong => "❌ Code PIN incorrect.",
    Text::PinLocked => "🔒 Trop d'essais. Réessayez plus tard.",
  }
}

fn en(text: Text) -> &'static str {
  match text {
    Text::ChooseLanguage => "🌍 Choose your language / Choisissez votre langue",
    Text::LanguageSaved => "✅ Language saved.",
    Text::Terms => "📜 <b>Terms of use</b>\n\nYou remain responsible for the bots you link and their content. Tokens are stored to run your bots. Spam, fraud and illegal content lead to account removal.\n\nDo you accept these terms?",
    Text::TermsAccept => "✅ I accept",
    Text::TermsDecline => "❌ I decline",
    Text::TermsDeclined => "You must accept the terms to use the platform. Send /start to try again.",
    Text::MainMenu => "🤖 <b>Main menu</b>\n\nWhat would you like to do?",
    Text::MenuLink => "➕ Link a bot",
    Text::MenuBots => "🤖 My bots",
    Text::MenuPlan => "💳 My plan",
    Text::MenuPin => "🔐 PIN",
    Text::MenuHelp => "❓ Help",
    Text::MenuLanguage => "🌍 Language",
    Text::MenuDashboard => "📊 Dashboard",
    Text::Back => "⬅️ Back",
    Text::Help => "❓ <b>Help</b>\n\n/newbot link a bot\n/mybots your bots\n/planinfo your plan\n/setpin set your PIN\n/canceldeletion cancel a deletion\n/lang change language\n/cancel abort the current action\n\nEvery linked bot offers a shop, credits, referrals, document search and group moderation. Send /help to your bot for its commands.",
    Text::Cancelled => "❌ Cancelled.",
    Text::HaveToken => "🔑 Do you already have a bot token from @BotFather?",
    Text::HaveTokenYes => "✅ Yes",
    Text::HaveTokenNo => "❓ No, how do I get one?",
    Text::TokenGuide => "1. Open @BotFather\n2. Send /newbot and follow the steps\n3. Copy the token it gives you\n\nThen come back with /newbot.",
    Text::SendToken => "📨 Send me your bot token (or /cancel).",
    Text::NoBots => "You have no bots yet. Use /newbot to link one.",
    Text::BotsHeader => "🤖 <b>Your bots</b>",
    Text::PinPromptOld => "🔐 Enter your current PIN.",
    Text::PinPromptNew => "🔐 Choose a new 4-digit PIN.",
    Text::PinPromptConfirm => "🔁 Confirm the new PIN.",
    Text::PinMismatch => "The two PINs differ. Start again with /setpin.",
    Text::PinSaved => "✅ PIN saved.",
    Text::PinRequired => "🔐 Set a PIN first with /setpin.",
    Text::PinPromptDeletion => "🔐 Enter your PIN to confirm the deletion.",
    Text::PinInvalidFormat => "The PIN must be exactly 4 digits.",
    Text::PinWrong => "❌ Wrong PIN.",
    Text::PinLocked => "🔒 Too many attempts. Try again later.",
  }
}

#[cfg(test)]
mod tests {
  use super::Text;
  use super::tr;
  use crate::models::Language;

  #[test]
  fn languages_have_distinct_copy() {
    assert_ne!(tr(Language::Fr, Text::MainMenu), tr(Language::En, Text::MainMenu));
    assert!(tr(Language::Fr, Text::Help).contains("/newbot"));
    assert!(tr(Language::En, Text::Help).contains("/newbot"));
  }
}
