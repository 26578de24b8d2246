use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "habitsync")]
#[command(about = "Track daily habits offline and sync them when the network allows")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the JSON config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage habits
    Habit {
        #[command(subcommand)]
        command: HabitCommands,
    },
    /// Record daily completions
    Entry {
        #[command(subcommand)]
        command: EntryCommands,
    },
    /// Push queued changes to the remote API
    Sync {
        /// Put failed operations back in line first
        #[arg(long)]
        retry_failed: bool,
    },
    /// Show queue, conflict and connectivity state
    Status,
    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Check and repair the local store
    Integrity {
        #[command(subcommand)]
        command: IntegrityCommands,
    },
    /// Apply schema migrations, or roll back with --to
    Migrate {
        /// Target schema version (defaults to the latest)
        #[arg(long, value_name = "VERSION")]
        to: Option<u32>,
    },
    /// Manage store backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum HabitCommands {
    /// Create a new habit
    #[command(alias = "new")]
    Add {
        /// Habit name
        name: Vec<String>,
        #[arg(short, long)]
        description: Option<String>,
        /// Accent color as #RRGGBB
        #[arg(long)]
        color: Option<String>,
    },
    /// List habits
    List {
        /// Include archived habits
        #[arg(long)]
        archived: bool,
    },
    /// Show one habit with its recent entries
    Show {
        /// Habit name, id, or unique id fragment
        habit: String,
    },
    /// Update a habit
    Update {
        /// Habit name, id, or unique id fragment
        habit: String,
        #[arg(long)]
        name: Option<String>,
        /// New description (empty string clears it)
        #[arg(long)]
        description: Option<String>,
        /// New color (empty string clears it)
        #[arg(long)]
        color: Option<String>,
        #[arg(long, conflicts_with = "unarchive")]
        archive: bool,
        #[arg(long)]
        unarchive: bool,
    },
    /// Delete a habit and its entries
    Delete {
        /// Habit name, id, or unique id fragment
        habit: String,
    },
}

#[derive(Subcommand)]
pub enum EntryCommands {
    /// Flip completion of a day
    Toggle {
        /// Habit name, id, or unique id fragment
        habit: String,
        /// Day as YYYY-MM-DD, 'today' or 'yesterday'
        #[arg(long, default_value = "today")]
        date: String,
        /// Attach a note
        #[arg(long)]
        note: Option<String>,
    },
    /// List entries
    List {
        /// Only entries of this habit
        #[arg(long)]
        habit: Option<String>,
    },
    /// Delete the entry of a day
    Delete {
        /// Habit name, id, or unique id fragment
        habit: String,
        #[arg(long, default_value = "today")]
        date: String,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List unresolved conflicts
    List,
    /// Resolve one conflict, or all of them with --all
    Resolve {
        /// Conflict id
        id: Option<String>,
        #[arg(long, value_enum, default_value_t = ResolveStrategy::Server)]
        strategy: ResolveStrategy,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
}

#[derive(Subcommand)]
pub enum IntegrityCommands {
    /// Audit the store
    Check {
        /// Repair auto-fixable issues
        #[arg(long)]
        fix: bool,
        /// Delete records with unrecoverable critical issues
        #[arg(long)]
        delete_corrupted: bool,
    },
    /// Back up, then repair until the store is healthy
    Recover,
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// List backups, newest first
    List,
    /// Snapshot the store now
    Create {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Replace the store with a backup
    Restore {
        /// Backup file path
        path: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolveStrategy {
    /// Keep the local edit and push it again
    Local,
    /// Adopt the server version
    Server,
    /// Overlay local fields on the server version
    Merge,
    /// Newest modification wins
    Latest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
