//! Keyword extraction and relevance scoring for documents indexed by child bots.

use std::collections::HashMap;
use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::models::IndexedDocument;

pub const MAX_DOCUMENT_BYTES: u32 = 1024 * 1024;
pub const INDEXABLE_EXTENSIONS: [&str; 7] = ["txt", "md", "csv", "json", "log", "html", "xml"];
pub const MAX_KEYWORDS: usize = 20;
pub const MAX_RESULTS: usize = 10;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
  [
    // english
    "the", "and", "for", "that", "this", "with", "from", "have", "were", "will", "your", "what", "when", "where",
    "which", "their", "there", "them", "then", "than", "been", "into", "about", "would", "could", "should",
    "these", "those", "they", "also", "only", "some", "more", "most", "other", "such",
    // french
    "dans", "pour", "avec", "sans", "sous", "plus", "moins", "mais", "donc", "elle", "elles", "nous", "vous",
    "leur", "leurs", "cette", "ceux", "celui", "celle", "sont", "était", "être", "avoir", "fait", "comme",
    "tout", "tous", "toute", "toutes", "aussi", "très", "entre", "depuis", "alors", "encore",
  ]
  .into_iter()
  .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchQuery {
  pub words: Vec<String>,
  pub phrases: Vec<String>,
  pub tags: Vec<String>,
  pub excluded: Vec<String>,
}

impl SearchQuery {
  pub fn is_empty(&self) -> bool {
    self.words.is_empty() && self.phrases.is_empty() && self.tags.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit<'a> {
  pub document: &'a IndexedDocument,
  pub score: i64,
}

pub fn is_indexable(file_name: &str) -> bool {
  file_name
    .rsplit_once('.')
    .map(|(_, ext)| ext.to_ascii_lowercase())
    .is_some_and(|ext| INDEXABLE_EXTENSIONS.contains(&ext.as_str()))
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
  text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|word| !word.is_empty())
    .map(|word| word.to_lowercase())
}

/// Most frequent meaningful words; ties are broken alphabetically.
pub fn extract_keywords(text: &str) -> Vec<String> {
  let mut counts: HashMap<String, usize> = HashMap::new();
  for word in tokenize(text) {
    if word.chars().count() <= 3 || STOP_WORDS.contains(word.as_str()) {
      continue;
    }
    *counts.entry(word).or_default() += 1;
  }
  let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
  ranked.sort_by(|(left_word, left), (right_word, right)| right.cmp(left).then_with(|| left_word.cmp(right_word)));
  ranked.into_iter().take(MAX_KEYWORDS).map(|(word, _)| word).collect()
}

/// Understands `"exact phrase"`, `tag:word`, `-excluded` and plain words.
pub fn parse_query(raw: &str) -> SearchQuery {
  let mut query = SearchQuery::default();
  let mut rest = raw;
  while let Some(start) = rest.find('"') {
    let (before, after) = rest.split_at(start);
    let after = &after[1 ..];
    let Some(end) = after.find('"') else {
      break;
    };
    push_terms(&mut query, before);
    let phrase = after[.. end].trim().to_lowercase();
    if !phrase.is_empty() {
      query.phrases.push(phrase);
    }
    rest = &after[end + 1 ..];
  }
  push_terms(&mut query, &rest.replace('"', " "));
  query
}

fn push_terms(query: &mut SearchQuery, segment: &str) {
  for term in segment.split_whitespace() {
    let term = term.to_lowercase();
    if let Some(tag) = term.strip_prefix("tag:") {
      if !tag.is_empty() {
        query.tags.push(tag.to_string());
      }
    } else if let Some(excluded) = term.strip_prefix('-') {
      if !excluded.is_empty() {
        query.excluded.push(excluded.to_string());
      }
    } else {
      let cleaned: String = term.chars().filter(|c| c.is_alphanumeric()).collect();
      if !cleaned.is_empty() {
        query.words.push(cleaned);
      }
    }
  }
}

pub fn relevance(document: &IndexedDocument, query: &SearchQuery) -> i64 {
  let title = document.title.to_lowercase();
  let content = document.content.to_lowercase();
  let title_words: HashSet<String> = tokenize(&document.title).collect();
  let content_words: Vec<String> = tokenize(&document.content).collect();
  let mut score = 0i64;

  for word in &query.words {
    if title_words.contains(word) {
      score += 10;
    }
    score += content_words.iter().filter(|candidate| *candidate == word).count() as i64;
    if document.keywords.contains(word) {
      score += 5;
    }
  }
  for phrase in &query.phrases {
    if content.contains(phrase.as_str()) {
      score += 20;
    }
    if title.contains(phrase.as_str()) {
      score += 30;
    }
  }
  for tag in &query.tags {
    if document.keywords.contains(tag) {
      score += 15;
    }
  }
  for excluded in &query.excluded {
    if content_words.contains(excluded) {
      score -= 10;
    }
  }
  score.max(0)
}

/// Scores every document and keeps the best `MAX_RESULTS` with a positive score.
pub fn search<'a>(documents: &'a [IndexedDocument], query: &SearchQuery) -> Vec<SearchHit<'a>> {
  let mut hits: Vec<SearchHit<'a>> = documents
    .iter()
    .map(|document| SearchHit {
      document,
      score: relevance(document, query),
    })
    .filter(|hit| hit.score > 0)
    .collect();
  hits.sort_by(|left, right| {
    right
      .score
      .cmp(&left.score)
      .then_with(|| right.document.indexed_at.cmp(&left.document.indexed_at))
  });
  hits.truncate(MAX_RESULTS);
  hits
}

/// A window of roughly `width` characters around the first query hit.
pub fn excerpt(content: &str, query: &SearchQuery, width: usize) -> String {
  let chars: Vec<char> = content.chars().collect();
  let lowered: Vec<char> = content.to_lowercase().chars().collect();
  let needles = query.phrases.iter().chain(query.words.iter()).chain(query.tags.iter());
  // lowercase can change length for some scripts; fall back to the start then
  let position = if lowered.len() == chars.len() {
    needles
      .filter_map(|needle| find_chars(&lowered, needle))
      .min()
      .unwrap_or(0)
  } else {
    0
  };
  let start = position.saturating_sub(width / 3);
  let end = (start + width).min(chars.len());
  let mut snippet: String = chars[start .. end].iter().collect();
  snippet = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
  if start > 0 {
    snippet.insert(0, '…');
  }
  if end < chars.len() {
    snippet.push('…');
  }
  snippet
}

fn find_chars(haystack: &[char], needle: &str) -> Option<usize> {
  let needle: Vec<char> = needle.chars().collect();
  if needle.is_empty() || needle.len() > haystack.len() {
    return None;
  }
  haystack.windows(needle.len()).position(|window| window == needle.as_slice())
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use teloxide::types::FileId;

  use super::excerpt;
  use super::extract_keywords;
  use super::is_indexable;
  use super::parse_query;
  use super::relevance;
  use super::search;
  use crate::models::IndexedDocument;

  fn document(id: u64, title: &str, content: &str) -> IndexedDocument {
    IndexedDocument {
      id,
      bot: "shopbot".to_string(),
      title: title.to_string(),
      file_name: format!("{title}.txt"),
      file_id: FileId(format!("file-{id}")),
      uploaded_by: 1,
      content: content.to_string(),
      keywords: extract_keywords(content),
      indexed_at: Utc::now(),
    }
  }

  #[test]
  fn keywords_skip_short_and_stop_words() {
    let keywords = extract_keywords("The rust compiler and the rust borrow checker. Rust rules, avec plaisir.");
    assert_eq!(keywords.first().map(String::as_str), Some("rust"));
    assert!(!keywords.iter().any(|word| word == "the" || word == "and" || word == "avec"));
    assert!(keywords.contains(&"borrow".to_string()));
  }

  #[test]
  fn parses_phrases_tags_and_exclusions() {
    let query = parse_query(r#"invoice "late payment" tag:billing -draft"#);
    assert_eq!(query.words, vec!["invoice"]);
    assert_eq!(query.phrases, vec!["late payment"]);
    assert_eq!(query.tags, vec!["billing"]);
    assert_eq!(query.excluded, vec!["draft"]);
  }

  #[test]
  fn title_and_phrase_matches_weigh_more() {
    let doc = document(1, "Invoice guide", "How to pay an invoice. Every invoice has late payment fees.");
    let by_word = relevance(&doc, &parse_query("invoice"));
    // title +10, two content hits, keyword +5
    assert_eq!(by_word, 17);
    let by_phrase = relevance(&doc, &parse_query("\"late payment\""));
    assert_eq!(by_phrase, 20);
  }

  #[test]
  fn exclusions_only_penalise_content() {
    let query = parse_query("invoice -draft");
    let titled = document(1, "Draft invoice", "invoice terms");
    assert_eq!(relevance(&titled, &query), 16);
    let drafted = document(2, "Invoice", "invoice terms draft");
    assert_eq!(relevance(&drafted, &query), 6);
  }

  #[test]
  fn exclusions_never_push_below_zero() {
    let doc = document(1, "Notes", "draft draft draft");
    assert_eq!(relevance(&doc, &parse_query("-draft")), 0);
  }

  #[test]
  fn search_orders_by_score_and_drops_misses() {
    let docs = vec![
      document(1, "Shipping", "parcel tracking and parcel returns"),
      document(2, "Parcel handbook", "everything about parcel sizes"),
      document(3, "Recipes", "pasta and sauce"),
    ];
    let hits = search(&docs, &parse_query("parcel"));
    let ids: Vec<u64> = hits.iter().map(|hit| hit.document.id).collect();
    assert_eq!(ids, vec![2, 1]);
  }

  #[test]
  fn excerpt_centres_on_first_match() {
    let content = format!("{} needle {}", "hay ".repeat(60), "straw ".repeat(60));
    let snippet = excerpt(&content, &parse_query("needle"), 100);
    assert!(snippet.contains("needle"));
    assert!(snippet.starts_with('…'));
    assert!(snippet.ends_with('…'));
  }

  #[test]
  fn only_text_like_files_are_indexable() {
    assert!(is_indexable("notes.MD"));
    assert!(is_indexable("data.csv"));
    assert!(!is_indexable("photo.jpg"));
    assert!(!is_indexable("README"));
  }
}
