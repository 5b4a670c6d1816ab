use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use recall::db::Database;
use recall::models::{Card, DeckSource, ImportRow, JsonOutput};
use recall::{Quality, ScheduleError};

const DEFAULT_DB_NAME: &str = "recall.db";
const DB_ENV_VAR: &str = "RECALL_DB";
const LOG_ENV_VAR: &str = "RECALL_LOG";

// Bad quality, bad ids and blank fields exit with 2, everything else with 1
const EXIT_FAILURE: i32 = 1;
const EXIT_INPUT_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "recall")]
#[command(about = "Spaced repetition flashcards scheduled with SM-2")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Path to the SQLite database (overrides RECALL_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage decks
    #[command(subcommand)]
    Deck(DeckCommands),

    /// Manage cards
    #[command(subcommand)]
    Card(CardCommands),

    /// List cards due for review
    Due {
        /// Only cards in this deck
        #[arg(long, short)]
        deck: Option<i64>,

        /// Maximum number of cards to list
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Pick the next card to study (weighted random among due cards)
    Next {
        /// Only cards in this deck
        #[arg(long, short)]
        deck: Option<i64>,
    },

    /// Record a review for a card
    Review {
        /// Card ID
        id: i64,

        /// Recall quality from 0 (blackout) to 5 (perfect)
        #[arg(long, short, allow_hyphen_values = true)]
        quality: String,
    },

    /// Show a card's review history
    History {
        /// Card ID
        id: i64,
    },

    /// Import cards from a JSON array of {setTitle, front, back, isPublic} rows
    Import {
        /// Path to the JSON file
        file: PathBuf,
    },

    /// Export all cards as JSON rows that `import` accepts
    Export {
        /// Write to this file instead of stdout
        file: Option<PathBuf>,
    },

    /// Show review statistics
    Stats,
}

#[derive(Subcommand)]
enum DeckCommands {
    /// List all decks
    List,

    /// Add a new deck
    Add {
        /// Deck title
        title: String,

        /// Deck description
        #[arg(long, short)]
        description: Option<String>,

        /// Where the cards come from (manual, pdf, csv, ...)
        #[arg(long, short, default_value = "manual")]
        source: String,

        /// Mark the deck as public
        #[arg(long)]
        public: bool,
    },

    /// Show deck details
    Show {
        /// Deck ID
        id: i64,
    },

    /// Delete a deck and its cards
    Delete {
        /// Deck ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum CardCommands {
    /// List cards
    List {
        /// Only cards in this deck
        #[arg(long, short)]
        deck: Option<i64>,
    },

    /// Add a card to a deck
    Add {
        /// Deck ID
        deck: i64,

        /// Question side
        front: String,

        /// Answer side
        back: String,
    },

    /// Show card details and schedule
    Show {
        /// Card ID
        id: i64,
    },

    /// Delete a card
    Delete {
        /// Card ID
        id: i64,
    },
}

fn resolve_db_path(flag: Option<PathBuf>, env_value: Option<String>) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    if let Some(path) = env_value.filter(|p| !p.trim().is_empty()) {
        return PathBuf::from(path);
    }

    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("recall");

    if let Err(e) = std::fs::create_dir_all(&config_dir) {
        tracing::warn!(dir = %config_dir.display(), error = %e, "could not create config directory");
    }
    config_dir.join(DEFAULT_DB_NAME)
}

fn log_filter(verbose: bool, env_value: Option<String>) -> EnvFilter {
    match env_value {
        Some(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("warn"))
        }
        _ if verbose => EnvFilter::new("debug"),
        _ => EnvFilter::new("warn"),
    }
}

fn init_tracing(verbose: bool) {
    // stdout carries command output, logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(log_filter(verbose, std::env::var(LOG_ENV_VAR).ok()))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let json = cli.json;
    if let Err(e) = run(cli) {
        tracing::debug!(error = %e, "command failed");
        if json {
            if let Ok(out) = serde_json::to_string(&JsonOutput::<()>::err(e.to_string())) {
                println!("{}", out);
            }
        }
        eprintln!("Error: {}", e);
        std::process::exit(exit_code(e.as_ref()));
    }
}

fn exit_code(e: &(dyn std::error::Error + 'static)) -> i32 {
    if let Some(err) = e.downcast_ref::<recall::Error>() {
        if err.is_input_error() {
            return EXIT_INPUT_ERROR;
        }
    }
    if e.downcast_ref::<ScheduleError>().is_some() {
        return EXIT_INPUT_ERROR;
    }
    EXIT_FAILURE
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = resolve_db_path(cli.db, std::env::var(DB_ENV_VAR).ok());
    tracing::debug!(path = %db_path.display(), "opening database");
    let db = Database::open(&db_path)?;
    db.init()?;

    match cli.command {
        Commands::Init => {
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
            } else {
                println!("Database initialized at: {}", db_path.display());
            }
        }

        Commands::Deck(deck_cmd) => match deck_cmd {
            DeckCommands::List => {
                let decks = db.list_decks()?;
                if cli.json {
                    println!("{}", serde_json::to_string(&JsonOutput::ok(&decks))?);
                } else if decks.is_empty() {
                    println!("No decks found.");
                } else {
                    println!("{:<5} {:<40} {:<8} CARDS", "ID", "TITLE", "SOURCE");
                    println!("{}", "-".repeat(65));
                    for deck in decks {
                        println!(
                            "{:<5} {:<40} {:<8} {}",
                            deck.id,
                            truncate(&deck.title, 38),
                            deck.source.as_str(),
                            deck.card_count
                        );
                    }
                }
            }

            DeckCommands::Add {
                title,
                description,
                source,
                public,
            } => {
                let source = DeckSource::from_str(&source)
                    .ok_or_else(|| recall::Error::Validation(format!("unknown deck source '{}'", source)))?;
                let id = db.add_deck(&title, description.as_deref(), source, public)?;

                if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                            "id": id,
                            "title": title.trim()
                        })))?
                    );
                } else {
                    println!("Added deck '{}' with ID: {}", title.trim(), id);
                }
            }

            DeckCommands::Show { id } => {
                if let Some(deck) = db.get_deck(id)? {
                    let due = db.due_cards(Some(id), Utc::now(), None)?.len();
                    if cli.json {
                        println!(
                            "{}",
                            serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                                "deck": deck,
                                "due_now": due
                            })))?
                        );
                    } else {
                        println!("Deck: {}", deck.title);
                        println!("ID: {}", deck.id);
                        if let Some(desc) = &deck.description {
                            println!("Description: {}", desc);
                        }
                        println!("Source: {}", deck.source.as_str());
                        println!("Public: {}", if deck.is_public { "yes" } else { "no" });
                        println!("Cards: {} ({} due now)", deck.card_count, due);
                        println!("Created: {}", deck.created_at);
                    }
                } else if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::<()>::err("Deck not found"))?
                    );
                } else {
                    println!("Deck not found.");
                }
            }

            DeckCommands::Delete { id } => {
                if db.delete_deck(id)? {
                    if cli.json {
                        println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
                    } else {
                        println!("Deck {} deleted.", id);
                    }
                } else if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::<()>::err("Deck not found"))?
                    );
                } else {
                    println!("Deck not found.");
                }
            }
        },

        Commands::Card(card_cmd) => match card_cmd {
            CardCommands::List { deck } => {
                let cards = db.list_cards(deck)?;
                if cli.json {
                    println!("{}", serde_json::to_string(&JsonOutput::ok(&cards))?);
                } else if cards.is_empty() {
                    println!("No cards found.");
                } else {
                    print_card_table(&cards);
                }
            }

            CardCommands::Add { deck, front, back } => {
                let id = db.add_card(deck, &front, &back)?;
                if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::ok(serde_json::json!({ "id": id })))?
                    );
                } else {
                    println!("Added card {} to deck {}.", id, deck);
                }
            }

            CardCommands::Show { id } => {
                if let Some(card) = db.get_card(id)? {
                    if cli.json {
                        println!("{}", serde_json::to_string(&JsonOutput::ok(&card))?);
                    } else {
                        println!("Card {} (deck {})", card.id, card.deck_id);
                        println!("Front: {}", card.front);
                        println!("Back: {}", card.back);
                        println!();
                        println!("--- Schedule ---");
                        println!("Stage: {}", card.stage_label());
                        println!("Easiness: {:.2}", card.memory.easiness_factor);
                        println!("Interval: {} day(s)", card.memory.interval);
                        println!("Repetitions: {}", card.memory.repetitions);
                        if let Some(last) = card.last_reviewed {
                            println!("Last reviewed: {}", local_time(last));
                        }
                        println!("Next review: {}", local_time(card.memory.next_review_date));
                    }
                } else if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::<()>::err("Card not found"))?
                    );
                } else {
                    println!("Card not found.");
                }
            }

            CardCommands::Delete { id } => {
                if db.delete_card(id)? {
                    if cli.json {
                        println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
                    } else {
                        println!("Card {} deleted.", id);
                    }
                } else if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string(&JsonOutput::<()>::err("Card not found"))?
                    );
                } else {
                    println!("Card not found.");
                }
            }
        },

        Commands::Due { deck, limit } => {
            let cards = db.due_cards(deck, Utc::now(), limit)?;
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::ok(&cards))?);
            } else if cards.is_empty() {
                println!("Nothing due. Come back later!");
            } else {
                print_card_table(&cards);
            }
        }

        Commands::Next { deck } => {
            if let Some(card) = db.next_card(deck, Utc::now())? {
                if cli.json {
                    println!("{}", serde_json::to_string(&JsonOutput::ok(&card))?);
                } else {
                    println!("=== Next Card ===");
                    println!();
                    println!("Card {} (deck {})", card.id, card.deck_id);
                    println!("Front: {}", card.front);
                    println!();
                    println!("Stage: {}", card.stage_label());
                    println!("Due since: {}", local_time(card.memory.next_review_date));
                    println!();
                    println!("After answering, record how well you recalled it:");
                    println!("  recall review {} --quality <0-5>", card.id);
                }
            } else if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
            } else {
                println!("No cards due. Add some cards or come back later!");
            }
        }

        Commands::Review { id, quality } => {
            let quality: Quality = quality.parse()?;
            let state = db.record_review(id, quality)?;

            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::ok(&state))?);
            } else {
                println!(
                    "Review recorded for card {}: {} ({}).",
                    id,
                    quality,
                    quality.label()
                );
                if quality.is_lapse() {
                    println!("Lapsed - the card starts over.");
                }
                println!(
                    "Easiness: {:.2}  Interval: {} day(s)  Repetitions: {}",
                    state.easiness_factor, state.interval, state.repetitions
                );
                println!("Next review scheduled: {}", local_time(state.next_review_date));
            }
        }

        Commands::History { id } => {
            if db.get_card(id)?.is_none() {
                return Err(recall::Error::card_not_found(id).into());
            }
            let history = db.review_history(id)?;
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::ok(&history))?);
            } else if history.is_empty() {
                println!("Card {} has not been reviewed yet.", id);
            } else {
                println!("{:<20} {:<8} {:<8} {:<9} REPS", "REVIEWED", "QUALITY", "EASE", "INTERVAL");
                println!("{}", "-".repeat(55));
                for r in history {
                    println!(
                        "{:<20} {:<8} {:<8.2} {:<9} {}",
                        local_time(r.reviewed_at),
                        r.quality.value(),
                        r.easiness_factor,
                        r.interval,
                        r.repetitions
                    );
                }
            }
        }

        Commands::Import { file } => {
            let contents = std::fs::read_to_string(&file)?;
            let rows: Vec<ImportRow> = serde_json::from_str(&contents)?;
            if rows.is_empty() {
                return Err("No data provided for import.".into());
            }
            let summary = db.import_rows(&rows)?;

            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::ok(&summary))?);
            } else {
                println!(
                    "Imported {} card(s) into {} new deck(s).",
                    summary.cards_imported, summary.decks_created
                );
                if summary.rows_skipped > 0 {
                    println!("Skipped {} incomplete row(s).", summary.rows_skipped);
                }
            }
        }

        Commands::Export { file } => {
            let rows = db.export_rows()?;
            if rows.is_empty() {
                return Err("No data to export.".into());
            }
            let body = serde_json::to_string_pretty(&rows)?;

            match file {
                Some(path) => {
                    std::fs::write(&path, body)?;
                    if cli.json {
                        println!(
                            "{}",
                            serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                                "file": path.display().to_string(),
                                "rows": rows.len()
                            })))?
                        );
                    } else {
                        println!("Exported {} card(s) to {}", rows.len(), path.display());
                    }
                }
                None if cli.json => {
                    println!("{}", serde_json::to_string(&JsonOutput::ok(&rows))?);
                }
                None => println!("{}", body),
            }
        }

        Commands::Stats => {
            let stats = db.get_stats()?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                        "total_decks": stats.total_decks,
                        "total_cards": stats.total_cards,
                        "total_reviews": stats.total_reviews,
                        "due_now": stats.due_now,
                        "lapses": stats.lapses,
                        "success_rate": stats.success_rate(),
                        "avg_easiness": stats.avg_easiness
                    })))?
                );
            } else {
                println!("=== Review Statistics ===");
                println!("Decks: {}", stats.total_decks);
                println!("Cards: {}", stats.total_cards);
                println!("Reviews: {}", stats.total_reviews);
                println!("Lapses: {}", stats.lapses);
                println!("Success rate: {:.0}%", stats.success_rate());
                println!("Due for review: {}", stats.due_now);
                println!("Average easiness: {:.2}", stats.avg_easiness);
            }
        }
    }

    Ok(())
}

fn print_card_table(cards: &[Card]) {
    println!("{:<5} {:<5} {:<36} {:<11} NEXT REVIEW", "ID", "DECK", "FRONT", "STAGE");
    println!("{}", "-".repeat(80));
    for card in cards {
        println!(
            "{:<5} {:<5} {:<36} {:<11} {}",
            card.id,
            card.deck_id,
            truncate(&card.front, 34),
            card.stage_label(),
            local_time(card.memory.next_review_date)
        );
    }
}

fn local_time(dt: DateTime<Utc>) -> String {
    dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    mod truncate_tests {
        use super::*;

        #[test]
        fn truncate_short_string() {
            assert_eq!(truncate("hello", 10), "hello");
        }

        #[test]
        fn truncate_exact_length() {
            assert_eq!(truncate("hello", 5), "hello");
        }

        #[test]
        fn truncate_long_string() {
            assert_eq!(truncate("hello world", 8), "hello...");
        }

        #[test]
        fn truncate_multibyte() {
            assert_eq!(truncate("¿Dónde está la biblioteca?", 8), "¿Dónd...");
        }
    }

    mod cli_parsing_tests {
        use super::*;

        #[test]
        fn parse_init_command() {
            let cli = Cli::try_parse_from(["recall", "init"]).unwrap();
            assert!(!cli.json);
            assert!(cli.db.is_none());
            assert!(matches!(cli.command, Commands::Init));
        }

        #[test]
        fn parse_global_flags_anywhere() {
            let cli =
                Cli::try_parse_from(["recall", "stats", "--json", "--db", "/tmp/x.db", "-v"]).unwrap();
            assert!(cli.json);
            assert!(cli.verbose);
            assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        }

        #[test]
        fn parse_deck_add_defaults() {
            let cli = Cli::try_parse_from(["recall", "deck", "add", "Spanish"]).unwrap();
            match cli.command {
                Commands::Deck(DeckCommands::Add {
                    title,
                    description,
                    source,
                    public,
                }) => {
                    assert_eq!(title, "Spanish");
                    assert!(description.is_none());
                    assert_eq!(source, "manual");
                    assert!(!public);
                }
                _ => panic!("Expected Deck Add command"),
            }
        }

        #[test]
        fn parse_deck_add_with_options() {
            let cli = Cli::try_parse_from([
                "recall", "deck", "add", "Bio", "-d", "Cells", "--source", "pdf", "--public",
            ])
            .unwrap();
            match cli.command {
                Commands::Deck(DeckCommands::Add {
                    description,
                    source,
                    public,
                    ..
                }) => {
                    assert_eq!(description, Some("Cells".to_string()));
                    assert_eq!(source, "pdf");
                    assert!(public);
                }
                _ => panic!("Expected Deck Add command"),
            }
        }

        #[test]
        fn parse_card_add() {
            let cli = Cli::try_parse_from(["recall", "card", "add", "2", "perro", "dog"]).unwrap();
            match cli.command {
                Commands::Card(CardCommands::Add { deck, front, back }) => {
                    assert_eq!(deck, 2);
                    assert_eq!(front, "perro");
                    assert_eq!(back, "dog");
                }
                _ => panic!("Expected Card Add command"),
            }
        }

        #[test]
        fn parse_due_with_filters() {
            let cli = Cli::try_parse_from(["recall", "due", "-d", "3", "-l", "10"]).unwrap();
            match cli.command {
                Commands::Due { deck, limit } => {
                    assert_eq!(deck, Some(3));
                    assert_eq!(limit, Some(10));
                }
                _ => panic!("Expected Due command"),
            }
        }

        #[test]
        fn parse_review_command() {
            let cli = Cli::try_parse_from(["recall", "review", "7", "--quality", "4"]).unwrap();
            match cli.command {
                Commands::Review { id, quality } => {
                    assert_eq!(id, 7);
                    assert_eq!(quality, "4");
                }
                _ => panic!("Expected Review command"),
            }
        }

        #[test]
        fn parse_review_negative_quality_reaches_validation() {
            let cli = Cli::try_parse_from(["recall", "review", "7", "-q", "-1"]).unwrap();
            match cli.command {
                Commands::Review { quality, .. } => {
                    assert!(quality.parse::<Quality>().is_err());
                }
                _ => panic!("Expected Review command"),
            }
        }

        #[test]
        fn parse_import_command() {
            let cli = Cli::try_parse_from(["recall", "import", "cards.json"]).unwrap();
            match cli.command {
                Commands::Import { file } => assert_eq!(file, PathBuf::from("cards.json")),
                _ => panic!("Expected Import command"),
            }
        }

        #[test]
        fn parse_export_command() {
            let cli = Cli::try_parse_from(["recall", "export"]).unwrap();
            assert!(matches!(cli.command, Commands::Export { file: None }));

            let cli = Cli::try_parse_from(["recall", "--json", "export", "out.json"]).unwrap();
            assert!(cli.json);
            match cli.command {
                Commands::Export { file } => assert_eq!(file, Some(PathBuf::from("out.json"))),
                _ => panic!("Expected Export command"),
            }
        }

        #[test]
        fn parse_missing_required_arg_fails() {
            assert!(Cli::try_parse_from(["recall", "deck", "add"]).is_err());
            assert!(Cli::try_parse_from(["recall", "review", "1"]).is_err());
            assert!(Cli::try_parse_from(["recall", "card", "add", "1", "front"]).is_err());
        }

        #[test]
        fn parse_invalid_command_fails() {
            assert!(Cli::try_parse_from(["recall", "invalid"]).is_err());
        }
    }

    mod exit_code_tests {
        use super::*;

        fn code_for<E: std::error::Error + 'static>(e: E) -> i32 {
            let boxed: Box<dyn std::error::Error> = Box::new(e);
            exit_code(boxed.as_ref())
        }

        #[test]
        fn bad_quality_is_input_error() {
            let err = "6".parse::<Quality>().unwrap_err();
            assert_eq!(code_for(err), EXIT_INPUT_ERROR);
        }

        #[test]
        fn app_input_errors() {
            assert_eq!(code_for(recall::Error::card_not_found(3)), EXIT_INPUT_ERROR);
            assert_eq!(
                code_for(recall::Error::Validation("front must not be empty".into())),
                EXIT_INPUT_ERROR
            );
            assert_eq!(
                code_for(recall::Error::from(ScheduleError::InvalidState("bad".into()))),
                EXIT_INPUT_ERROR
            );
        }

        #[test]
        fn other_failures() {
            let io = std::io::Error::new(std::io::ErrorKind::NotFound, "cards.json");
            assert_eq!(code_for(io), EXIT_FAILURE);
            assert_eq!(
                code_for(recall::Error::InvalidTimestamp("yesterday".into())),
                EXIT_FAILURE
            );

            let message: Box<dyn std::error::Error> = "No data to export.".into();
            assert_eq!(exit_code(message.as_ref()), EXIT_FAILURE);
        }
    }

    mod config_tests {
        use super::*;
        use tracing_subscriber::filter::LevelFilter;

        #[test]
        fn db_flag_wins_over_env() {
            let path = resolve_db_path(
                Some(PathBuf::from("/tmp/flag.db")),
                Some("/tmp/env.db".to_string()),
            );
            assert_eq!(path, PathBuf::from("/tmp/flag.db"));
        }

        #[test]
        fn env_used_without_flag() {
            let path = resolve_db_path(None, Some("/tmp/env.db".to_string()));
            assert_eq!(path, PathBuf::from("/tmp/env.db"));
        }

        #[test]
        fn default_path_ends_with_recall_db() {
            let path = resolve_db_path(None, Some("  ".to_string()));
            assert!(path.ends_with("recall/recall.db"));
        }

        #[test]
        fn log_filter_prefers_env() {
            let filter = log_filter(true, Some("info".to_string()));
            assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
        }

        #[test]
        fn log_filter_verbose_and_default() {
            assert_eq!(log_filter(true, None).max_level_hint(), Some(LevelFilter::DEBUG));
            assert_eq!(log_filter(false, None).max_level_hint(), Some(LevelFilter::WARN));
        }
    }
}
