use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "localdocs",
    about = "Index local folders and retrieve passages by meaning"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage collections and the folders linked into them
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },
    /// Re-index a collection with the current model
    Reindex {
        /// Collection to re-index
        collection: String,
    },
    /// Bring every collection up to date, then exit
    Index,
    /// Index and keep watching folders until interrupted
    Watch,
    /// Retrieve the passages closest to a query
    Retrieve(RetrieveArgs),
    /// Show or change indexing settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show system status and per-folder progress
    Status(StatusArgs),
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Collection subcommands --

#[derive(Debug, Subcommand)]
pub enum CollectionAction {
    /// Link a folder into a collection and index its contents
    Add {
        /// Collection name (created if missing)
        name: String,
        /// Path to the folder
        path: PathBuf,
    },
    /// Unlink a folder from a collection
    Remove {
        /// Collection name
        name: String,
        /// Path to the folder
        path: PathBuf,
    },
    /// List collections and their folders
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Config subcommands --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the current settings
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change the chunk size in characters; re-chunks everything
    ChunkSize {
        /// New chunk size
        size: usize,
    },
    /// Change the indexed file extensions
    Extensions {
        /// Extensions, comma or space separated (e.g. "txt,md,pdf")
        #[arg(required = true, num_args = 1..)]
        extensions: Vec<String>,
    },
}

// -- Retrieve --

#[derive(Debug, Parser)]
pub struct RetrieveArgs {
    /// The query text
    pub query: String,

    /// Collections to search (default: all)
    #[arg(short = 'c', long = "collection")]
    pub collections: Vec<String>,

    /// Number of passages to return
    #[arg(short = 'k', long, default_value = "5")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "localdocs",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_retrieve_defaults() {
        let cli = Cli::parse_from(["localdocs", "retrieve", "hello"]);
        match cli.command {
            Command::Retrieve(args) => {
                assert_eq!(args.query, "hello");
                assert_eq!(args.count, 5);
                assert!(args.collections.is_empty());
                assert!(!args.json);
            }
            _ => panic!("expected retrieve command"),
        }
    }

    #[test]
    fn parse_repeated_collections() {
        let cli = Cli::parse_from([
            "localdocs",
            "retrieve",
            "ownership",
            "-c",
            "notes",
            "-c",
            "papers",
            "-k",
            "3",
        ]);
        match cli.command {
            Command::Retrieve(args) => {
                assert_eq!(args.collections, vec!["notes", "papers"]);
                assert_eq!(args.count, 3);
            }
            _ => panic!("expected retrieve command"),
        }
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "localdocs",
            "collection",
            "add",
            "notes",
            "/tmp/notes",
            "--data-dir",
            "/tmp/data",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/data")));
        match cli.command {
            Command::Collection {
                action: CollectionAction::Add { name, path },
            } => {
                assert_eq!(name, "notes");
                assert_eq!(path, PathBuf::from("/tmp/notes"));
            }
            _ => panic!("expected collection add"),
        }
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(
            Cli::try_parse_from(["localdocs", "-q", "-v", "index"]).is_err()
        );
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
