use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use modus_notify::{AppConfig, HistoryStore, StoreLock, load_config, load_config_from};
use modus_types::{NotificationId, NotificationRecord};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Inspect and edit the persisted notification history.
#[derive(Parser, Debug)]
#[command(name = "modus-history", version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print history records, newest first.
    List {
        /// Only records of this app.
        #[arg(long)]
        app: Option<String>,

        /// Print the records as a JSON array.
        #[arg(long)]
        json: bool,
    },

    /// Delete one record and its cached image.
    Delete { id: String },

    /// Delete every record, or only those of one app.
    Clear {
        #[arg(long)]
        app: Option<String>,
    },

    /// Show or change Do-Not-Disturb.
    Dnd {
        #[arg(value_enum, default_value_t = DndMode::Status)]
        mode: DndMode,
    },

    /// Remove cached images that no record refers to.
    Sweep,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DndMode {
    On,
    Off,
    Toggle,
    Status,
}

fn app_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => load_config_from(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(load_config()),
    }
}

fn render_list(records: &[NotificationRecord], app: Option<&str>, json: bool) -> Result<String> {
    let selected: Vec<&NotificationRecord> = records
        .iter()
        .rev()
        .filter(|record| app.is_none_or(|app| record.app_name == app))
        .collect();

    if json {
        return Ok(serde_json::to_string_pretty(&selected)?);
    }

    let lines: Vec<String> = selected
        .iter()
        .map(|record| {
            let mut line = format!(
                "{}  {}  {}",
                record.timestamp.format("%Y-%m-%d %H:%M"),
                record.app_name,
                record.summary
            );
            if !record.body.is_empty() {
                line.push_str(" - ");
                line.push_str(&record.body.replace('\n', " "));
            }
            line.push_str(&format!("  [{}]", record.id));
            line
        })
        .collect();
    Ok(lines.join("\n"))
}

fn apply_dnd(store: &mut HistoryStore, mode: DndMode) -> bool {
    match mode {
        DndMode::On => {
            store.set_dnd(true);
        }
        DndMode::Off => {
            store.set_dnd(false);
        }
        DndMode::Toggle => {
            store.toggle_dnd();
        }
        DndMode::Status => {}
    }
    store.dnd_enabled()
}

impl Command {
    fn mutates(&self) -> bool {
        match self {
            Command::List { .. } => false,
            Command::Dnd { mode } => *mode != DndMode::Status,
            Command::Delete { .. } | Command::Clear { .. } | Command::Sweep => true,
        }
    }
}

/// Runs one command and returns what to print.
///
/// Mutating commands take the history lock first, so they are refused while
/// a notification center owns the files.
fn execute(cfg: &AppConfig, command: Command) -> Result<String> {
    let _lock = if command.mutates() {
        let lock = StoreLock::acquire(&cfg.history_path())
            .context("notification history is in use, stop the notification center first")?;
        Some(lock)
    } else {
        None
    };
    let mut store = HistoryStore::open(cfg.history_config(), cfg.image_cache());

    let output = match command {
        Command::List { app, json } => render_list(store.records(), app.as_deref(), json)?,
        Command::Delete { id } => {
            if !store.delete(&NotificationId::from(id.as_str())) {
                bail!("no history record with id {id}");
            }
            info!(%id, "record deleted");
            String::new()
        }
        Command::Clear { app } => {
            let removed = match app.as_deref() {
                Some(app) => store.clear_for_app(app),
                None => store.clear_all(),
            };
            format!("removed {removed} record(s)")
        }
        Command::Dnd { mode } => {
            let enabled = apply_dnd(&mut store, mode);
            format!("do-not-disturb: {}", if enabled { "on" } else { "off" })
        }
        Command::Sweep => {
            let removed = store.sweep_orphans();
            format!("removed {removed} orphaned image(s)")
        }
    };

    Ok(output)
}

fn run(cli: Cli) -> Result<()> {
    let cfg = app_config(cli.config.as_ref())?;
    let output = execute(&cfg, cli.command)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("modus_history=warn".parse()?))
        .init();

    run(Cli::parse())
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeDelta};
    use modus_notify::{
        DEFAULT_THUMBNAIL_SIZE, HistoryConfig, ImageCache, IncomingNotification,
        NotificationCenter,
    };
    use modus_types::{CloseReason, ImagePixmap, NotificationImage};

    use super::*;

    fn record(id: &str, app: &str, summary: &str, minutes_ago: i64) -> NotificationRecord {
        NotificationRecord {
            id: NotificationId::from(id),
            app_icon: "icon".to_string(),
            summary: summary.to_string(),
            body: String::new(),
            app_name: app.to_string(),
            timestamp: Local::now() - TimeDelta::minutes(minutes_ago),
            cached_image_path: None,
        }
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["modus-history", "dnd", "toggle"]).unwrap();
        assert!(matches!(cli.command, Command::Dnd { mode: DndMode::Toggle }));

        let cli = Cli::try_parse_from(["modus-history", "dnd"]).unwrap();
        assert!(matches!(cli.command, Command::Dnd { mode: DndMode::Status }));

        let cli =
            Cli::try_parse_from(["modus-history", "list", "--app", "mail", "--config", "/c.toml"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/c.toml")));
        assert!(matches!(cli.command, Command::List { app: Some(_), json: false }));

        assert!(Cli::try_parse_from(["modus-history", "dnd", "maybe"]).is_err());
    }

    #[test]
    fn list_is_newest_first_and_filtered() {
        let records = vec![
            record("a", "mail", "old mail", 30),
            record("b", "chat", "ping", 20),
            record("c", "mail", "new mail", 10),
        ];

        let all = render_list(&records, None, false).unwrap();
        let summaries: Vec<&str> = all.lines().map(|line| line.split("  ").nth(2).unwrap()).collect();
        assert_eq!(summaries, vec!["new mail", "ping", "old mail"]);

        let mail = render_list(&records, Some("mail"), false).unwrap();
        assert_eq!(mail.lines().count(), 2);
        assert!(mail.lines().all(|line| line.contains("mail")));
    }

    #[test]
    fn list_json_is_parseable() {
        let records = vec![record("a", "mail", "hello", 1)];

        let json = render_list(&records, None, true).unwrap();
        let parsed: Vec<NotificationRecord> = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed[0].id, NotificationId::from("a"));
    }

    #[test]
    fn dnd_modes_update_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::open(
            HistoryConfig::new(
                dir.path().join("history.json"),
                dir.path().join("settings.json"),
            ),
            ImageCache::new(dir.path(), DEFAULT_THUMBNAIL_SIZE),
        );

        assert!(!apply_dnd(&mut store, DndMode::Status));
        assert!(apply_dnd(&mut store, DndMode::On));
        assert!(apply_dnd(&mut store, DndMode::On));
        assert!(!apply_dnd(&mut store, DndMode::Toggle));
        assert!(apply_dnd(&mut store, DndMode::Toggle));
        assert!(!apply_dnd(&mut store, DndMode::Off));
    }

    fn config_in(dir: &tempfile::TempDir) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.history.path = Some(dir.path().join("notification_history.json"));
        cfg.history.settings_path = Some(dir.path().join("settings.json"));
        cfg.images.dir = Some(dir.path().join("images"));
        cfg
    }

    fn pixmap() -> NotificationImage {
        NotificationImage::Pixmap(ImagePixmap {
            width: 2,
            height: 2,
            rowstride: 8,
            has_alpha: true,
            bits_per_sample: 8,
            channels: 4,
            data: vec![120; 16],
        })
    }

    #[test]
    fn mutations_are_refused_while_a_center_runs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(&dir);
        let mut center = NotificationCenter::new(&cfg);
        let first = center.notify(IncomingNotification {
            requested_timeout_ms: 0,
            ..IncomingNotification::new("mail", "first")
        });
        center.close(&first.id, CloseReason::Dismissed);
        let pic = center.notify(IncomingNotification {
            image: Some(pixmap()),
            requested_timeout_ms: 0,
            ..IncomingNotification::new("photos", "pic")
        });
        let live_image = center
            .live()
            .get(&pic.id)
            .and_then(|item| item.record().cached_image_path.clone())
            .unwrap();

        assert!(execute(&cfg, Command::Sweep).is_err());
        assert!(live_image.exists());

        let delete = Command::Delete {
            id: first.id.to_string(),
        };
        assert!(execute(&cfg, delete).is_err());
        assert!(execute(&cfg, Command::Dnd { mode: DndMode::On }).is_err());

        let listed = execute(&cfg, Command::List { app: None, json: false }).unwrap();
        assert!(listed.contains("first"));
        let status = execute(&cfg, Command::Dnd { mode: DndMode::Status }).unwrap();
        assert_eq!(status, "do-not-disturb: off");

        center.close(&pic.id, CloseReason::Dismissed);
        drop(center);

        let delete = Command::Delete {
            id: first.id.to_string(),
        };
        assert_eq!(execute(&cfg, delete).unwrap(), "");
        assert_eq!(execute(&cfg, Command::Sweep).unwrap(), "removed 0 orphaned image(s)");
        assert!(live_image.exists());

        let listed = execute(&cfg, Command::List { app: None, json: false }).unwrap();
        assert!(!listed.contains("first"));
        assert!(listed.contains("pic"));
    }
}
