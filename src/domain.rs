//! Entities and collection definitions of the romance app: the posts feed,
//! the quote board, public playlists and per-post likes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::filter::{Filter, SortOrder};
use crate::likes::{LIKES_TABLE, LIKE_TARGET_COLUMN};
use crate::types::{Fields, Record};
use crate::view::{ViewBuilder, ViewConfig};

pub const POSTS_TABLE: &str = "posts";
pub const QUOTES_TABLE: &str = "quotes";
pub const PLAYLISTS_TABLE: &str = "playlists";
pub const PROFILES_TABLE: &str = "profiles";

/// Pseudo-category of the quote board that shows every quote.
pub const ALL_CATEGORIES: &str = "todos";
pub const QUOTE_CATEGORIES: [&str; 3] = ["frases", "cartas", "poemas"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub owner_id: String,
    pub created_at: i64,
    pub content_text: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub media_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub owner_id: String,
    pub created_at: i64,
    pub content_text: String,
    pub author: Option<String>,
    pub category: String,
    #[serde(default)]
    pub is_quote_of_day: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub owner_id: String,
    pub created_at: i64,
    pub title: String,
    pub description: Option<String>,
    pub cover_image_url: Option<String>,
    #[serde(default)]
    pub songs: Vec<serde_json::Value>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Like {
    pub id: String,
    pub owner_id: String,
    pub created_at: i64,
    pub post_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub owner_id: String,
    pub created_at: i64,
    pub username: Option<String>,
    pub role: Option<String>,
}

/// Newest posts first. Only admins publish or remove posts.
pub fn posts_feed() -> ViewBuilder {
    ViewConfig::builder(POSTS_TABLE)
        .order(SortOrder::new().desc("created_at"))
        .require_elevated_role(true)
}

/// The quote board: quote of the day first, then by priority, then newest.
/// `None` or "todos" shows every category.
pub fn quotes(category: Option<&str>) -> ViewBuilder {
    ViewConfig::builder(QUOTES_TABLE)
        .filter(category_filter(category))
        .order(
            SortOrder::new()
                .desc("is_quote_of_day")
                .desc("priority")
                .desc("created_at"),
        )
        .require_elevated_role(true)
}

pub fn category_filter(category: Option<&str>) -> Filter {
    match category {
        None | Some(ALL_CATEGORIES) => Filter::all(),
        Some(category) => Filter::all().eq("category", category),
    }
}

/// Shared playlists, newest first. Only admins create or edit them.
pub fn public_playlists() -> ViewBuilder {
    ViewConfig::builder(PLAYLISTS_TABLE)
        .filter(Filter::all().eq("is_public", true))
        .order(SortOrder::new().desc("created_at"))
        .require_elevated_role(true)
}

pub fn likes_for(post_id: &str) -> ViewBuilder {
    ViewConfig::builder(LIKES_TABLE)
        .filter(Filter::all().eq(LIKE_TARGET_COLUMN, post_id))
        .order(SortOrder::new().desc("created_at"))
}

/// The flagged quote with the highest priority, newest on ties.
pub fn quote_of_day(records: &[Record]) -> Option<&Record> {
    let flagged = Filter::all().eq("is_quote_of_day", true);
    let order = SortOrder::new().desc("priority").desc("created_at");
    records
        .iter()
        .filter(|r| flagged.matches(r))
        .min_by(|a, b| order.compare(a, b))
}

/// Tab counts for the quote board, keyed by category plus "todos".
pub fn category_counts(records: &[Record]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = QUOTE_CATEGORIES.iter().map(|c| (c.to_string(), 0)).collect();
    counts.insert(ALL_CATEGORIES.to_string(), records.len());
    for record in records {
        if let Some(serde_json::Value::String(category)) = record.field("category") {
            if category != ALL_CATEGORIES {
                *counts.entry(category).or_default() += 1;
            }
        }
    }
    counts
}

/// Fields for a new quote. Quotes of the day get priority 1.
pub fn new_quote_fields(
    content_text: &str,
    author: Option<&str>,
    category: &str,
    is_quote_of_day: bool,
    tags: &[&str],
) -> Fields {
    let author = author.map(str::trim).filter(|a| !a.is_empty());
    let mut fields = Fields::new();
    fields.insert("content_text".to_string(), json!(content_text.trim()));
    fields.insert("author".to_string(), json!(author));
    fields.insert("category".to_string(), json!(category));
    fields.insert("is_quote_of_day".to_string(), json!(is_quote_of_day));
    fields.insert("tags".to_string(), json!(tags));
    fields.insert("priority".to_string(), json!(if is_quote_of_day { 1 } else { 0 }));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(id: &str, created_at: i64, category: &str, of_day: bool, priority: i64) -> Record {
        let mut fields = new_quote_fields("Te amo", None, category, of_day, &[]);
        fields.insert("priority".to_string(), json!(priority));
        Record { id: id.to_string(), owner_id: "admin".to_string(), created_at, fields }
    }

    #[test]
    fn quote_board_order() {
        let mut rows = vec![
            quote("old", 1, "frases", false, 0),
            quote("pinned", 2, "frases", false, 5),
            quote("daily", 3, "cartas", true, 1),
            quote("new", 4, "poemas", false, 0),
        ];
        quotes(None).build().order.sort(&mut rows);
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["daily", "pinned", "new", "old"]);
    }

    #[test]
    fn todos_means_no_filter() {
        assert!(quotes(Some(ALL_CATEGORIES)).build().filter.is_empty());
        assert!(quotes(None).build().filter.is_empty());
        let cartas = quotes(Some("cartas")).build();
        assert!(cartas.filter.matches(&quote("q", 1, "cartas", false, 0)));
        assert!(!cartas.filter.matches(&quote("q", 1, "poemas", false, 0)));
    }

    #[test]
    fn picks_quote_of_day() {
        let rows = vec![
            quote("a", 1, "frases", true, 1),
            quote("b", 2, "frases", true, 1),
            quote("c", 3, "frases", false, 9),
        ];
        assert_eq!(quote_of_day(&rows).map(|r| r.id.as_str()), Some("b"));
        assert!(quote_of_day(&rows[2..]).is_none());
    }

    #[test]
    fn counts_per_category() {
        let rows = vec![
            quote("a", 1, "frases", false, 0),
            quote("b", 2, "frases", false, 0),
            quote("c", 3, "poemas", false, 0),
        ];
        let counts = category_counts(&rows);
        assert_eq!(counts["todos"], 3);
        assert_eq!(counts["frases"], 2);
        assert_eq!(counts["cartas"], 0);
        assert_eq!(counts["poemas"], 1);
    }

    #[test]
    fn new_quote_defaults() -> anyhow::Result<()> {
        let daily = new_quote_fields("  Siempre  ", Some("  "), "frases", true, &["amor"]);
        assert_eq!(daily["priority"], json!(1));
        assert_eq!(daily["content_text"], json!("Siempre"));
        assert!(daily["author"].is_null());
        let regular = new_quote_fields("x", Some("Neruda"), "poemas", false, &[]);
        assert_eq!(regular["priority"], json!(0));

        let record = Record { id: "q1".to_string(), owner_id: "u1".to_string(), created_at: 7, fields: daily };
        let decoded: Quote = record.decode()?;
        assert!(decoded.is_quote_of_day);
        assert_eq!(decoded.tags, vec!["amor".to_string()]);
        Ok(())
    }

    #[test]
    fn presets() {
        let feed = posts_feed().build();
        assert_eq!(feed.table, POSTS_TABLE);
        assert!(feed.require_elevated_role);
        let playlists = public_playlists().build();
        assert_eq!(playlists.filter.get("is_public"), Some(&json!(true)));
        assert!(playlists.require_elevated_role);
        assert!(!likes_for("p1").build().require_elevated_role);
        assert_eq!(likes_for("p1").build().filter.to_string(), "post_id=eq.p1");
    }
}
