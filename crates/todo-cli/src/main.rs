use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use todo_core::attachment::AttachmentKind;
use todo_core::audit::{AuditAction, AuditSource};
use todo_storage::StoreNaming;
use tracing_subscriber::EnvFilter;

mod attachments;
mod audit;
mod health;
mod migrate;

const DEFAULT_DATA_DIR_NAME: &str = "todo";

#[derive(Parser, Debug)]
#[command(name = "todo")]
#[command(about = "Operator tools for per-user todo stores", long_about = None)]
struct Cli {
    /// Directory holding the sqlite stores
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade stored documents to the current schema
    Migrate {
        #[arg(long)]
        user: String,
        #[arg(long, value_enum, default_value_t = DocumentKind::Todo)]
        kind: DocumentKind,
        /// Persist upgraded documents instead of only reporting
        #[arg(long, default_value_t = false)]
        write: bool,
        /// Audit source recorded for persisted upgrades
        #[arg(long, default_value = "web")]
        source: AuditSource,
    },
    /// Build or parse attachment keys
    Key {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Hash and validate attachment payloads
    Attachment {
        #[command(subcommand)]
        action: AttachmentCommands,
    },
    /// Read a user's audit ledger
    Audit {
        #[command(subcommand)]
        action: AuditCommands,
    },
    /// Watch store health
    Health {
        #[command(subcommand)]
        action: HealthCommands,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentKind {
    Todo,
    User,
}

#[derive(Subcommand, Debug)]
enum KeyCommands {
    Build {
        #[arg(long)]
        kind: AttachmentKind,
        #[arg(long)]
        filename: String,
        #[arg(long)]
        note_id: Option<String>,
    },
    Parse {
        key: String,
    },
}

#[derive(Subcommand, Debug)]
enum AttachmentCommands {
    Hash {
        file: PathBuf,
        #[arg(long, default_value = todo_core::attachment::DEFAULT_BLOB_NAMESPACE)]
        namespace: String,
        /// Also validate the file against the upload policy
        #[arg(long = "type")]
        content_type: Option<String>,
    },
    #[command(allow_negative_numbers = true)]
    Validate {
        #[arg(long)]
        size: i64,
        #[arg(long = "type")]
        content_type: String,
    },
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    List {
        #[arg(long)]
        user: String,
        #[arg(long)]
        source: Option<AuditSource>,
        #[arg(long)]
        action: Option<AuditAction>,
        #[arg(long)]
        entity: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum HealthCommands {
    Watch {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = todo_health::config::DEFAULT_CHECK_INTERVAL_SECS)]
        interval_secs: u64,
        /// Exit after this many checks
        #[arg(long)]
        checks: Option<usize>,
        /// Storage budget used for quota warnings
        #[arg(long, default_value_t = 50)]
        budget_mb: u64,
    },
}

#[derive(Clone, Debug)]
struct Config {
    data_dir: PathBuf,
    debug: bool,
    naming: StoreNaming,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli);
    init_logging(&config);

    match cli.command {
        Commands::Migrate {
            user,
            kind,
            write,
            source,
        } => migrate::run(&config, &user, kind, write, source),
        Commands::Key { action } => match action {
            KeyCommands::Build {
                kind,
                filename,
                note_id,
            } => attachments::build_key(kind, &filename, note_id.as_deref()),
            KeyCommands::Parse { key } => attachments::parse_key(&key),
        },
        Commands::Attachment { action } => match action {
            AttachmentCommands::Hash {
                file,
                namespace,
                content_type,
            } => attachments::hash_file(&file, &namespace, content_type.as_deref()),
            AttachmentCommands::Validate { size, content_type } => {
                attachments::validate(size, &content_type)
            }
        },
        Commands::Audit { action } => match action {
            AuditCommands::List {
                user,
                source,
                action,
                entity,
                limit,
            } => audit::list(&config, &user, source, action, entity, limit),
        },
        Commands::Health { action } => match action {
            HealthCommands::Watch {
                user,
                interval_secs,
                checks,
                budget_mb,
            } => health::watch(&config, &user, interval_secs, checks, budget_mb).await,
        },
    }
}

fn load_config(cli: &Cli) -> Config {
    let data_dir = resolve_data_dir(cli.data_dir.as_ref());
    let debug = cli.debug || env_true("TODO_DEBUG");
    Config {
        data_dir,
        debug,
        naming: StoreNaming::default(),
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("TODO_LOG_LEVEL") {
        level
    } else {
        "warn".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Reports go to stdout, so logs stay on stderr.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn resolve_data_dir(flag: Option<&PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir.clone();
    }
    if let Ok(value) = std::env::var("TODO_DATA_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    dirs::data_local_dir()
        .map(|dir| dir.join(DEFAULT_DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(".").join(DEFAULT_DATA_DIR_NAME))
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
