use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::{CardMemoryState, Quality};

// Where a deck's cards came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeckSource {
    Manual,
    Prompt,
    Pdf,
    Youtube,
    Audio,
    Image,
    Csv,
    Text,
    Video,
}

impl DeckSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeckSource::Manual => "manual",
            DeckSource::Prompt => "prompt",
            DeckSource::Pdf => "pdf",
            DeckSource::Youtube => "youtube",
            DeckSource::Audio => "audio",
            DeckSource::Image => "image",
            DeckSource::Csv => "csv",
            DeckSource::Text => "text",
            DeckSource::Video => "video",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "manual" => Some(DeckSource::Manual),
            "prompt" => Some(DeckSource::Prompt),
            "pdf" => Some(DeckSource::Pdf),
            "youtube" => Some(DeckSource::Youtube),
            "audio" => Some(DeckSource::Audio),
            "image" => Some(DeckSource::Image),
            "csv" => Some(DeckSource::Csv),
            "text" => Some(DeckSource::Text),
            "video" => Some(DeckSource::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deck {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub source: DeckSource,
    pub is_public: bool,
    pub created_at: String,
    pub updated_at: String,
    pub card_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub deck_id: i64,
    pub front: String,
    pub back: String,
    pub memory: CardMemoryState,
    pub last_reviewed: Option<DateTime<Utc>>,
    pub created_at: String,
}

impl Card {
    pub fn is_new(&self) -> bool {
        self.last_reviewed.is_none()
    }

    pub fn stage_label(&self) -> &'static str {
        match (self.is_new(), self.memory.repetitions) {
            (true, _) => "New",
            (false, 0) => "Relearning",
            (false, 1..=2) => "Learning",
            _ => "Review",
        }
    }

    // Whole days past due, 0 if not yet due
    pub fn overdue_days(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.memory.next_review_date)
            .num_days()
            .max(0)
    }
}

// One row of the review log, with the state the scheduler produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: i64,
    pub card_id: i64,
    pub quality: Quality,
    pub reviewed_at: DateTime<Utc>,
    pub easiness_factor: f64,
    pub interval: i64,
    pub repetitions: i64,
}

// Bulk import row, field names as exported by the web app
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRow {
    #[serde(default)]
    pub set_title: Option<String>,
    #[serde(default)]
    pub front: Option<String>,
    #[serde(default)]
    pub back: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_public: bool,
}

impl ImportRow {
    // (title, front, back) when all three are present and non-blank
    pub fn fields(&self) -> Option<(&str, &str, &str)> {
        let title = self.set_title.as_deref().map(str::trim)?;
        let front = self.front.as_deref().map(str::trim)?;
        let back = self.back.as_deref().map(str::trim)?;
        if title.is_empty() || front.is_empty() || back.is_empty() {
            return None;
        }
        Some((title, front, back))
    }
}

// Spreadsheet exports give "TRUE"/"true"/"yes" as often as real booleans
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => b,
        BoolOrString::Text(s) => s.to_lowercase().contains("true") || s.eq_ignore_ascii_case("yes"),
        BoolOrString::Other(_) => false,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub decks_created: i64,
    pub cards_imported: i64,
    pub rows_skipped: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_decks: i64,
    pub total_cards: i64,
    pub total_reviews: i64,
    pub due_now: i64,
    pub lapses: i64,
    pub avg_easiness: f64,
}

impl Stats {
    pub fn success_rate(&self) -> f64 {
        if self.total_reviews == 0 {
            0.0
        } else {
            ((self.total_reviews - self.lapses) as f64 / self.total_reviews as f64) * 100.0
        }
    }
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    fn make_card(repetitions: i64, reviewed: bool) -> Card {
        let mut memory = CardMemoryState::new_card(now());
        memory.repetitions = repetitions;
        Card {
            id: 1,
            deck_id: 1,
            front: "front".to_string(),
            back: "back".to_string(),
            memory,
            last_reviewed: reviewed.then(now),
            created_at: "2024-05-01".to_string(),
        }
    }

    mod deck_source_tests {
        use super::*;

        #[test]
        fn round_trips_every_variant() {
            let all = [
                DeckSource::Manual,
                DeckSource::Prompt,
                DeckSource::Pdf,
                DeckSource::Youtube,
                DeckSource::Audio,
                DeckSource::Image,
                DeckSource::Csv,
                DeckSource::Text,
                DeckSource::Video,
            ];
            for source in all {
                assert_eq!(DeckSource::from_str(source.as_str()), Some(source));
            }
        }

        #[test]
        fn from_str_is_case_insensitive() {
            assert_eq!(DeckSource::from_str("PDF"), Some(DeckSource::Pdf));
            assert_eq!(DeckSource::from_str("YouTube"), Some(DeckSource::Youtube));
        }

        #[test]
        fn from_str_unknown() {
            assert_eq!(DeckSource::from_str("fax"), None);
        }
    }

    mod card_tests {
        use super::*;

        #[test]
        fn stage_label_new() {
            assert_eq!(make_card(0, false).stage_label(), "New");
        }

        #[test]
        fn stage_label_relearning_after_lapse() {
            assert_eq!(make_card(0, true).stage_label(), "Relearning");
        }

        #[test]
        fn stage_label_learning() {
            assert_eq!(make_card(1, true).stage_label(), "Learning");
            assert_eq!(make_card(2, true).stage_label(), "Learning");
        }

        #[test]
        fn stage_label_review() {
            assert_eq!(make_card(3, true).stage_label(), "Review");
        }

        #[test]
        fn overdue_days_counts_whole_days() {
            let card = make_card(0, false);
            assert_eq!(card.overdue_days(now()), 0);
            assert_eq!(card.overdue_days(now() + Duration::hours(47)), 1);
            assert_eq!(card.overdue_days(now() - Duration::days(3)), 0);
        }
    }

    mod import_row_tests {
        use super::*;

        #[test]
        fn parses_web_export_fields() {
            let row: ImportRow = serde_json::from_str(
                r#"{"setTitle": "Capitals", "front": "France", "back": "Paris", "isPublic": "TRUE"}"#,
            )
            .unwrap();
            assert_eq!(row.fields(), Some(("Capitals", "France", "Paris")));
            assert!(row.is_public);
        }

        #[test]
        fn is_public_accepts_booleans() {
            let row: ImportRow =
                serde_json::from_str(r#"{"setTitle": "a", "front": "b", "back": "c", "isPublic": true}"#)
                    .unwrap();
            assert!(row.is_public);
        }

        #[test]
        fn is_public_defaults_false() {
            let row: ImportRow =
                serde_json::from_str(r#"{"setTitle": "a", "front": "b", "back": "c"}"#).unwrap();
            assert!(!row.is_public);
        }

        #[test]
        fn is_public_other_json_values_are_false() {
            for value in ["null", "1", "{\"a\": true}", "[true]"] {
                let json = format!(r#"{{"setTitle": "a", "front": "b", "back": "c", "isPublic": {}}}"#, value);
                let row: ImportRow = serde_json::from_str(&json).unwrap();
                assert!(!row.is_public, "isPublic = {}", value);
                assert_eq!(row.fields(), Some(("a", "b", "c")));
            }
        }

        #[test]
        fn serializes_with_web_field_names() {
            let row = ImportRow {
                set_title: Some("Capitals".to_string()),
                front: Some("France".to_string()),
                back: Some("Paris".to_string()),
                is_public: true,
            };
            let value = serde_json::to_value(&row).unwrap();
            assert_eq!(value["setTitle"], "Capitals");
            assert_eq!(value["isPublic"], true);

            let back: ImportRow = serde_json::from_value(value).unwrap();
            assert_eq!(back, row);
        }

        #[test]
        fn missing_field_skips_row() {
            let row: ImportRow = serde_json::from_str(r#"{"setTitle": "a", "front": "b"}"#).unwrap();
            assert_eq!(row.fields(), None);
        }

        #[test]
        fn blank_field_skips_row() {
            let row: ImportRow =
                serde_json::from_str(r#"{"setTitle": "a", "front": "  ", "back": "c"}"#).unwrap();
            assert_eq!(row.fields(), None);
        }
    }

    mod stats_tests {
        use super::*;

        fn make_stats(total_reviews: i64, lapses: i64) -> Stats {
            Stats {
                total_decks: 1,
                total_cards: 1,
                total_reviews,
                due_now: 0,
                lapses,
                avg_easiness: 2.5,
            }
        }

        #[test]
        fn success_rate_no_reviews() {
            assert_eq!(make_stats(0, 0).success_rate(), 0.0);
        }

        #[test]
        fn success_rate_counts_non_lapses() {
            assert_eq!(make_stats(4, 1).success_rate(), 75.0);
            assert_eq!(make_stats(10, 10).success_rate(), 0.0);
        }
    }

    mod json_output_tests {
        use super::*;

        #[test]
        fn ok_serializes_data() {
            let json = serde_json::to_string(&JsonOutput::ok(vec![1, 2])).unwrap();
            assert_eq!(json, r#"{"success":true,"data":[1,2],"error":null}"#);
        }

        #[test]
        fn err_serializes_message() {
            let json = serde_json::to_string(&JsonOutput::<()>::err("nope")).unwrap();
            assert_eq!(json, r#"{"success":false,"data":null,"error":"nope"}"#);
        }
    }
}
