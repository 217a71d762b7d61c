//! reviewtree CLI - group review requests from a JSON fixture
//!
//! Usage: reviewtree-cli [OPTIONS] <COMMAND>
//!
//! Manual groups and review marks persist in the local database, so they
//! survive between runs exactly as they would in the host application.

use clap::{Parser, Subcommand};
use reviewtree_lib::coordinator::GroupingCoordinator;
use reviewtree_lib::db::{KvStore, SqliteStore};
use reviewtree_lib::grouping::GroupingTree;
use reviewtree_lib::model::{Bucket, GroupingMode, LeafId};
use reviewtree_lib::settings::{self, Settings};
use reviewtree_lib::source::{Fixture, FixtureSource, LeafSource};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Main CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "reviewtree-cli")]
#[command(version, about = "Hierarchical review request grouping", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Fixture with leaves, links and entities (JSON)
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    /// Database path (default: from settings, else the platform data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Settings file (default: <data dir>/reviewtree/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Output as JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Detailed logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh from the fixture and print the grouping tree
    Group {
        /// author, ancestor or manual
        #[arg(long, default_value = "author", value_parser = parse_mode)]
        mode: GroupingMode,
        /// Ancestor depth (0 = the linked entity itself)
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Manual group operations
    Manual {
        #[command(subcommand)]
        cmd: ManualCommands,
    },
    /// Review status operations
    Review {
        #[command(subcommand)]
        cmd: ReviewCommands,
    },
}

#[derive(Subcommand)]
enum ManualCommands {
    /// List manual groups and their members
    List,
    /// Create a group
    Create { name: String },
    /// Rename a group
    Rename { id: String, name: String },
    /// Delete a group (members become unassigned)
    Delete { id: String },
    /// Delete every group
    Clear,
    /// Move a leaf into a group, or to "unassigned"
    Move {
        leaf: LeafId,
        /// Target group id or "unassigned"
        to: String,
    },
}

#[derive(Subcommand)]
enum ReviewCommands {
    /// Mark a leaf reviewed
    Mark { leaf: LeafId },
    /// Clear a leaf's reviewed mark
    Unmark { leaf: LeafId },
    /// List reviewed leaves
    List,
}

fn parse_mode(s: &str) -> Result<GroupingMode, String> {
    s.parse()
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run_cli(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_cli(cli: Cli) -> Result<(), String> {
    let settings_path = cli.settings.clone().unwrap_or_else(settings::default_settings_path);
    let settings = Settings::load_with_env(&settings_path);

    let db_path = cli.db.clone().unwrap_or_else(|| settings.resolve_db_path());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("Failed to create data directory: {}", e))?;
    }
    if cli.verbose {
        eprintln!("[verbose] Using database: {:?}", db_path);
    }
    let kv: Arc<dyn KvStore> =
        Arc::new(SqliteStore::new(&db_path).map_err(|e| format!("Failed to open database: {}", e))?);

    let fixture = match &cli.fixture {
        Some(path) => Fixture::load(path)?,
        None => Fixture::default(),
    };
    let source: Arc<dyn LeafSource> = Arc::new(FixtureSource::new(fixture));
    let coordinator = GroupingCoordinator::from_source(source, kv, settings.grouping_config())
        .map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Group { mode, depth } => {
            if cli.fixture.is_none() {
                return Err("--fixture is required for grouping".to_string());
            }
            handle_group(&coordinator, mode, depth, cli.json).await
        }
        Commands::Manual { cmd } => handle_manual(cmd, &coordinator, cli.json),
        Commands::Review { cmd } => handle_review(cmd, &coordinator, cli.json),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_group(
    coordinator: &GroupingCoordinator,
    mode: GroupingMode,
    depth: Option<usize>,
    json: bool,
) -> Result<(), String> {
    if let Some(depth) = depth {
        // Nothing is loaded yet, so this only sets the depth for the pass below.
        coordinator.set_depth(depth).map_err(|e| e.to_string())?;
    }

    coordinator.refresh().await.map_err(|e| e.to_string())?.wait().await;
    coordinator.set_mode(mode).map_err(|e| e.to_string())?;

    let tree = coordinator.grouping_tree();
    if json {
        println!("{}", serde_json::to_string_pretty(tree.as_ref()).map_err(|e| e.to_string())?);
    } else {
        print!("{}", render_tree(&tree));
    }
    Ok(())
}

fn handle_manual(cmd: ManualCommands, coordinator: &GroupingCoordinator, json: bool) -> Result<(), String> {
    match cmd {
        ManualCommands::List => {
            let groups = coordinator.manual_groups();
            if json {
                println!("{}", serde_json::to_string_pretty(&groups).map_err(|e| e.to_string())?);
            } else if groups.is_empty() {
                println!("No manual groups");
            } else {
                for group in groups {
                    println!("[{}] {} ({} leaves)", group.id, group.name, group.member_leaf_ids.len());
                    for leaf_id in &group.member_leaf_ids {
                        println!("    #{}", leaf_id);
                    }
                }
            }
        }
        ManualCommands::Create { name } => {
            let id = coordinator.create_group(&name).map_err(|e| e.to_string())?;
            if json {
                println!("{}", serde_json::json!({ "id": id, "name": name }));
            } else {
                println!("Created group {} ({})", id, name);
            }
        }
        ManualCommands::Rename { id, name } => {
            coordinator.rename_group(&id, &name).map_err(|e| e.to_string())?;
            println!("Renamed group {} to {}", id, name);
        }
        ManualCommands::Delete { id } => {
            coordinator.delete_group(&id).map_err(|e| e.to_string())?;
            println!("Deleted group {}", id);
        }
        ManualCommands::Clear => {
            coordinator.delete_all_groups().map_err(|e| e.to_string())?;
            println!("Deleted all manual groups");
        }
        ManualCommands::Move { leaf, to } => {
            let from = coordinator
                .manual_groups()
                .iter()
                .find(|g| g.contains(leaf))
                .map(|g| Bucket::Group(g.id.clone()))
                .unwrap_or(Bucket::Unassigned);
            let to = Bucket::parse(&to);
            if coordinator.move_leaf(leaf, &from, &to).map_err(|e| e.to_string())? {
                println!("Moved #{} to {}", leaf, bucket_label(&to));
            } else {
                println!("#{} is already in {}", leaf, bucket_label(&to));
            }
        }
    }
    Ok(())
}

fn handle_review(cmd: ReviewCommands, coordinator: &GroupingCoordinator, json: bool) -> Result<(), String> {
    match cmd {
        ReviewCommands::Mark { leaf } => {
            coordinator.mark_reviewed(leaf).map_err(|e| e.to_string())?;
            println!("Marked #{} reviewed", leaf);
        }
        ReviewCommands::Unmark { leaf } => {
            coordinator.unmark_reviewed(leaf).map_err(|e| e.to_string())?;
            println!("Cleared review mark on #{}", leaf);
        }
        ReviewCommands::List => {
            let reviewed = coordinator.reviewed_leaves();
            if json {
                println!("{}", serde_json::to_string(&reviewed).map_err(|e| e.to_string())?);
            } else if reviewed.is_empty() {
                println!("No reviewed leaves");
            } else {
                for leaf_id in reviewed {
                    println!("#{}", leaf_id);
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn bucket_label(bucket: &Bucket) -> String {
    match bucket {
        Bucket::Unassigned => "unassigned".to_string(),
        Bucket::Group(id) => format!("group {}", id),
    }
}

fn render_tree(tree: &GroupingTree) -> String {
    let mut out = String::new();
    match tree.depth {
        Some(depth) => out.push_str(&format!("Grouping: {} (depth {})\n", tree.mode, depth)),
        None => out.push_str(&format!("Grouping: {}\n", tree.mode)),
    }
    for group in &tree.groups {
        out.push_str(&format!("{} [{}] ({})\n", group.label, group.key, group.leaf_count()));
        for author in &group.authors {
            out.push_str(&format!("  {}\n", author.author_name));
            for leaf in &author.leaves {
                out.push_str(&format!("    #{} {}\n", leaf.id, leaf.title));
            }
        }
    }
    if tree.unresolved_count > 0 {
        out.push_str(&format!("{} leaves could not be resolved\n", tree.unresolved_count));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use reviewtree_lib::grouping::group_by_author;
    use reviewtree_lib::model::Leaf;

    #[test]
    fn test_group_defaults_to_author_mode() {
        let cli = Cli::try_parse_from(["reviewtree-cli", "group"]).expect("should parse without --mode");
        match cli.command {
            Commands::Group { mode, depth } => {
                assert_eq!(mode, GroupingMode::ByAuthor);
                assert_eq!(depth, None);
            }
            _ => panic!("expected Group"),
        }
    }

    #[test]
    fn test_group_ancestor_with_depth_and_globals() {
        let cli = Cli::try_parse_from([
            "reviewtree-cli", "group", "--mode", "ancestor", "--depth", "2", "--json", "--fixture", "prs.json",
        ])
        .expect("should parse ancestor mode");
        assert!(cli.json);
        assert_eq!(cli.fixture, Some(PathBuf::from("prs.json")));
        match cli.command {
            Commands::Group { mode, depth } => {
                assert_eq!(mode, GroupingMode::ByAncestorAtDepth);
                assert_eq!(depth, Some(2));
            }
            _ => panic!("expected Group"),
        }
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["reviewtree-cli", "group", "--mode", "team"]).is_err());
    }

    #[test]
    fn test_manual_move_parses_target() {
        let cli = Cli::try_parse_from(["reviewtree-cli", "manual", "move", "42", "unassigned"])
            .expect("should parse manual move");
        match cli.command {
            Commands::Manual { cmd: ManualCommands::Move { leaf, to } } => {
                assert_eq!(leaf, 42);
                assert_eq!(Bucket::parse(&to), Bucket::Unassigned);
            }
            _ => panic!("expected Manual > Move"),
        }
    }

    #[test]
    fn test_render_author_tree() {
        let tree = group_by_author(&[Leaf::new(2, "bob", "Fix login"), Leaf::new(1, "Alice", "Add cache")]);
        let text = render_tree(&tree);
        assert_eq!(
            text,
            "Grouping: author\n\
             Alice [author:Alice] (1)\n  Alice\n    #1 Add cache\n\
             bob [author:bob] (1)\n  bob\n    #2 Fix login\n"
        );
    }
}
