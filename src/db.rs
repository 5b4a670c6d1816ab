use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::{Card, Deck, DeckSource, ImportRow, ImportSummary, ReviewRecord, Stats};
use crate::scheduler::{self, CardMemoryState, Quality, ScheduleError};

const CARD_COLUMNS: &str = "c.id, c.deck_id, c.front, c.back, c.easiness_factor, c.interval, \
                            c.repetitions, c.next_review, c.last_reviewed, c.created_at";

const MAX_STORED_YEAR: i32 = 9999;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS decks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL UNIQUE,
                description TEXT,
                source TEXT NOT NULL DEFAULT 'manual',
                is_public INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            -- Cards carry their SM-2 memory state inline
            CREATE TABLE IF NOT EXISTS cards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                deck_id INTEGER NOT NULL,
                front TEXT NOT NULL,
                back TEXT NOT NULL,
                easiness_factor REAL NOT NULL DEFAULT 2.5 CHECK(easiness_factor >= 1.3),
                interval INTEGER NOT NULL DEFAULT 0 CHECK(interval >= 0),
                repetitions INTEGER NOT NULL DEFAULT 0 CHECK(repetitions >= 0),
                next_review TEXT NOT NULL,
                last_reviewed TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                FOREIGN KEY (deck_id) REFERENCES decks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS review_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                card_id INTEGER NOT NULL,
                quality INTEGER NOT NULL CHECK(quality BETWEEN 0 AND 5),
                reviewed_at TEXT NOT NULL,
                easiness_factor REAL NOT NULL,
                interval INTEGER NOT NULL,
                repetitions INTEGER NOT NULL,
                FOREIGN KEY (card_id) REFERENCES cards(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_cards_deck ON cards(deck_id);
            CREATE INDEX IF NOT EXISTS idx_cards_next_review ON cards(next_review);
            CREATE INDEX IF NOT EXISTS idx_review_history_card ON review_history(card_id);
            "#,
        )?;

        tracing::debug!("schema ready");
        Ok(())
    }

    // Deck operations
    pub fn add_deck(
        &self,
        title: &str,
        description: Option<&str>,
        source: DeckSource,
        is_public: bool,
    ) -> Result<i64> {
        self.add_deck_at(title, description, source, is_public, Utc::now())
    }

    pub fn add_deck_at(
        &self,
        title: &str,
        description: Option<&str>,
        source: DeckSource,
        is_public: bool,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let title = non_blank("title", title)?;
        let created = timestamp(&now);
        self.conn.execute(
            r#"
            INSERT INTO decks (title, description, source, is_public, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![title, description, source.as_str(), is_public, created],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_deck(&self, id: i64) -> Result<Option<Deck>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT d.id, d.title, d.description, d.source, d.is_public, d.created_at, d.updated_at,
                   (SELECT COUNT(*) FROM cards c WHERE c.deck_id = d.id)
            FROM decks d
            WHERE d.id = ?1
            "#,
        )?;

        match stmt.query_row(params![id], deck_from_row) {
            Ok(deck) => Ok(Some(deck)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_deck_by_title(&self, title: &str) -> Result<Option<i64>> {
        let found = self.conn.query_row(
            "SELECT id FROM decks WHERE title = ?1",
            params![title],
            |row| row.get(0),
        );

        match found {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_decks(&self) -> Result<Vec<Deck>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT d.id, d.title, d.description, d.source, d.is_public, d.created_at, d.updated_at,
                   (SELECT COUNT(*) FROM cards c WHERE c.deck_id = d.id)
            FROM decks d
            ORDER BY d.title
            "#,
        )?;

        let decks = stmt
            .query_map([], deck_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decks)
    }

    pub fn delete_deck(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM decks WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // Card operations
    pub fn add_card(&self, deck_id: i64, front: &str, back: &str) -> Result<i64> {
        self.add_card_at(deck_id, front, back, Utc::now())
    }

    pub fn add_card_at(&self, deck_id: i64, front: &str, back: &str, now: DateTime<Utc>) -> Result<i64> {
        let front = non_blank("front", front)?;
        let back = non_blank("back", back)?;
        if self.get_deck(deck_id)?.is_none() {
            return Err(Error::deck_not_found(deck_id));
        }

        let memory = CardMemoryState::new_card(now);
        self.conn.execute(
            r#"
            INSERT INTO cards (deck_id, front, back, easiness_factor, interval, repetitions, next_review, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                deck_id,
                front,
                back,
                memory.easiness_factor,
                memory.interval,
                memory.repetitions,
                timestamp(&memory.next_review_date),
                timestamp(&now)
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.touch_deck(deck_id, now)?;
        Ok(id)
    }

    pub fn get_card(&self, id: i64) -> Result<Option<Card>> {
        let query = format!("SELECT {} FROM cards c WHERE c.id = ?1", CARD_COLUMNS);
        let mut stmt = self.conn.prepare(&query)?;

        match stmt.query_row(params![id], card_from_row) {
            Ok(card) => Ok(Some(card)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_cards(&self, deck_filter: Option<i64>) -> Result<Vec<Card>> {
        let query = format!(
            "SELECT {} FROM cards c WHERE (?1 IS NULL OR c.deck_id = ?1) ORDER BY c.deck_id, c.id",
            CARD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;
        let cards = stmt
            .query_map(params![deck_filter], card_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cards)
    }

    pub fn delete_card(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM cards WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn touch_deck(&self, deck_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE decks SET updated_at = ?1 WHERE id = ?2",
            params![timestamp(&now), deck_id],
        )?;
        Ok(())
    }

    // Review operations
    pub fn record_review(&self, card_id: i64, quality: Quality) -> Result<CardMemoryState> {
        let now = chrono::Local::now();
        self.record_review_at(card_id, quality, now)
    }

    /// Run the scheduler for one review and persist the result.
    ///
    /// The read of the current state, the state update and the history row share
    /// one transaction, so two submissions for the same card cannot interleave.
    pub fn record_review_at<Tz: chrono::TimeZone>(
        &self,
        card_id: i64,
        quality: Quality,
        now: DateTime<Tz>,
    ) -> Result<CardMemoryState> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let current = self
            .get_card(card_id)?
            .ok_or_else(|| Error::card_not_found(card_id))?
            .memory;

        let reviewed_at = now.with_timezone(&Utc);
        let next = scheduler::compute_next_state_at(&current, quality, now)?;
        let next_review = storable_timestamp(&next.next_review_date)?;

        tx.execute(
            r#"
            UPDATE cards
            SET easiness_factor = ?1,
                interval = ?2,
                repetitions = ?3,
                next_review = ?4,
                last_reviewed = ?5
            WHERE id = ?6
            "#,
            params![
                next.easiness_factor,
                next.interval,
                next.repetitions,
                next_review,
                timestamp(&reviewed_at),
                card_id
            ],
        )?;

        tx.execute(
            r#"
            INSERT INTO review_history (card_id, quality, reviewed_at, easiness_factor, interval, repetitions)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                card_id,
                quality.value(),
                timestamp(&reviewed_at),
                next.easiness_factor,
                next.interval,
                next.repetitions
            ],
        )?;

        tx.commit()?;

        tracing::info!(
            card_id,
            quality = quality.value(),
            interval = next.interval,
            repetitions = next.repetitions,
            easiness = next.easiness_factor,
            "review recorded"
        );

        Ok(next)
    }

    pub fn review_history(&self, card_id: i64) -> Result<Vec<ReviewRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, card_id, quality, reviewed_at, easiness_factor, interval, repetitions
            FROM review_history
            WHERE card_id = ?1
            ORDER BY reviewed_at DESC, id DESC
            "#,
        )?;

        let rows = stmt.query_map(params![card_id], |row| {
            let raw_quality: i64 = row.get(2)?;
            let quality = Quality::new(raw_quality)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Integer, Box::new(e)))?;
            Ok(ReviewRecord {
                id: row.get(0)?,
                card_id: row.get(1)?,
                quality,
                reviewed_at: parse_timestamp(row, 3)?,
                easiness_factor: row.get(4)?,
                interval: row.get(5)?,
                repetitions: row.get(6)?,
            })
        })?;

        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Due queue
    pub fn due_cards(
        &self,
        deck_filter: Option<i64>,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Card>> {
        let query = format!(
            r#"
            SELECT {}
            FROM cards c
            WHERE c.next_review <= ?1 AND (?2 IS NULL OR c.deck_id = ?2)
            ORDER BY c.next_review ASC, c.easiness_factor ASC, c.id ASC
            LIMIT ?3
            "#,
            CARD_COLUMNS
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let mut stmt = self.conn.prepare(&query)?;
        let cards = stmt
            .query_map(params![timestamp(&now), deck_filter, limit], card_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cards)
    }

    // Stochastic selection for the next card to study
    pub fn next_card(&self, deck_filter: Option<i64>, now: DateTime<Utc>) -> Result<Option<Card>> {
        let cards = self.due_cards(deck_filter, now, None)?;

        if cards.is_empty() {
            return Ok(None);
        }

        // Weight by overdue-ness and by how hard the card is
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let weights: Vec<f64> = cards
            .iter()
            .map(|c| {
                let overdue = c.overdue_days(now) as f64 + 1.0;
                let difficulty = 1.0 / c.memory.easiness_factor;
                overdue * difficulty
            })
            .collect();

        let total_weight: f64 = weights.iter().sum();
        let mut random_point = rng.gen::<f64>() * total_weight;

        for (i, weight) in weights.iter().enumerate() {
            random_point -= weight;
            if random_point <= 0.0 {
                return Ok(Some(cards[i].clone()));
            }
        }

        Ok(cards.into_iter().next())
    }

    // Bulk import
    pub fn import_rows(&self, rows: &[ImportRow]) -> Result<ImportSummary> {
        self.import_rows_at(rows, Utc::now())
    }

    pub fn import_rows_at(&self, rows: &[ImportRow], now: DateTime<Utc>) -> Result<ImportSummary> {
        let tx = self.conn.unchecked_transaction()?;
        let mut summary = ImportSummary::default();
        let mut deck_ids: HashMap<String, i64> = HashMap::new();

        for row in rows {
            let Some((title, front, back)) = row.fields() else {
                summary.rows_skipped += 1;
                continue;
            };

            let deck_id = match deck_ids.get(title) {
                Some(id) => *id,
                None => {
                    let id = match self.find_deck_by_title(title)? {
                        Some(id) => id,
                        None => {
                            summary.decks_created += 1;
                            self.add_deck_at(title, None, DeckSource::Csv, row.is_public, now)?
                        }
                    };
                    deck_ids.insert(title.to_string(), id);
                    id
                }
            };

            self.add_card_at(deck_id, front, back, now)?;
            summary.cards_imported += 1;
        }

        tx.commit()?;

        tracing::info!(
            decks_created = summary.decks_created,
            cards_imported = summary.cards_imported,
            rows_skipped = summary.rows_skipped,
            "import finished"
        );

        Ok(summary)
    }

    /// Flatten every deck into import-shaped rows, so an export can be fed
    /// straight back into `import_rows`.
    pub fn export_rows(&self) -> Result<Vec<ImportRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT d.title, c.front, c.back, d.is_public
            FROM cards c
            JOIN decks d ON d.id = c.deck_id
            ORDER BY d.title, c.id
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(ImportRow {
                    set_title: Some(row.get(0)?),
                    front: Some(row.get(1)?),
                    back: Some(row.get(2)?),
                    is_public: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        tracing::debug!(rows = rows.len(), "export collected");
        Ok(rows)
    }

    pub fn get_stats(&self) -> Result<Stats> {
        self.get_stats_at(Utc::now())
    }

    pub fn get_stats_at(&self, now: DateTime<Utc>) -> Result<Stats> {
        let total_decks: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM decks", [], |row| row.get(0))?;

        let total_cards: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cards", [], |row| row.get(0))?;

        let total_reviews: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM review_history", [], |row| row.get(0))?;

        let lapses: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM review_history WHERE quality < 3",
            [],
            |row| row.get(0),
        )?;

        let due_now: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM cards WHERE next_review <= ?1",
            params![timestamp(&now)],
            |row| row.get(0),
        )?;

        let avg_easiness: f64 = self.conn.query_row(
            "SELECT COALESCE(AVG(easiness_factor), 0) FROM cards",
            [],
            |row| row.get(0),
        )?;

        Ok(Stats {
            total_decks,
            total_cards,
            total_reviews,
            due_now,
            lapses,
            avg_easiness,
        })
    }
}

fn non_blank<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed)
}

// Fixed-width UTC so that string order matches time order in SQL comparisons
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// Past year 9999 the text form gains a sign and width, breaking both the
// ordering above and RFC 3339 parsing on read.
fn storable_timestamp(dt: &DateTime<Utc>) -> Result<String> {
    if dt.year() > MAX_STORED_YEAR {
        return Err(Error::Schedule(ScheduleError::InvalidState(format!(
            "due date {} is past year {}",
            dt, MAX_STORED_YEAR
        ))));
    }
    Ok(timestamp(dt))
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                Box::new(Error::InvalidTimestamp(raw)),
            )
        })
}

fn deck_from_row(row: &Row<'_>) -> rusqlite::Result<Deck> {
    let source: String = row.get(3)?;
    Ok(Deck {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        source: DeckSource::from_str(&source).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                Box::new(Error::Validation(format!("unknown deck source '{}'", source))),
            )
        })?,
        is_public: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        card_count: row.get(7)?,
    })
}

fn card_from_row(row: &Row<'_>) -> rusqlite::Result<Card> {
    let last_reviewed = match row.get::<_, Option<String>>(8)? {
        Some(_) => Some(parse_timestamp(row, 8)?),
        None => None,
    };

    Ok(Card {
        id: row.get(0)?,
        deck_id: row.get(1)?,
        front: row.get(2)?,
        back: row.get(3)?,
        memory: CardMemoryState {
            easiness_factor: row.get(4)?,
            interval: row.get(5)?,
            repetitions: row.get(6)?,
            next_review_date: parse_timestamp(row, 7)?,
        },
        last_reviewed,
        created_at: row.get(9)?,
    })
}
