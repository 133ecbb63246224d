//! CircleSync CLI
//!
//! Thin wrapper around circlesync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! circlesync info
//!
//! # Set your display name
//! circlesync identity set-name alice
//!
//! # Create a circle and add a member
//! circlesync circle create friends
//! circlesync circle add friends <peer_hex>
//!
//! # Write a post (defaults to the everyone circle)
//! circlesync post "hello" --circle friends
//!
//! # Follow someone and fetch their posts
//! circlesync follow <peer_hex>
//! circlesync sync
//! circlesync feed
//!
//! # Publish local changes
//! circlesync publish
//!
//! # Publish and sync periodically until Ctrl-C
//! circlesync run
//! ```

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use circlesync_core::{
    BlobHash, Circle, CircleId, ContentStore, Node, PeerId, PeerSyncOutcome, ReactionKind,
    SyncEvent, Timestamp,
};

/// CircleSync - encrypted circles over a peer-to-peer content store
#[derive(Parser)]
#[command(name = "circlesync")]
#[command(version = "0.1.0")]
#[command(about = "CircleSync - encrypted circles over a peer-to-peer content store")]
#[command(
    long_about = "Publish posts to private circles and follow peers. Everything is encrypted per circle and synchronized through signed, versioned manifests."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.circlesync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Circle management
    Circle {
        #[command(subcommand)]
        action: CircleAction,
    },

    /// Write a post
    Post {
        /// Post text
        text: String,
        /// Circle name or ID (default: everyone)
        #[arg(short, long)]
        circle: Option<String>,
        /// Stored hash of the post this replies to
        #[arg(long)]
        reply_to: Option<String>,
        /// Files to attach
        #[arg(short, long)]
        attach: Vec<PathBuf>,
    },

    /// React to or tag a post
    React {
        /// Stored hash of the post
        post_hash: String,
        /// Reaction (emoji) or tag text
        value: String,
        /// Record as a tag instead of a reaction
        #[arg(long)]
        tag: bool,
        /// Circle that sees the reaction (default: everyone)
        #[arg(short, long)]
        circle: Option<String>,
    },

    /// Delete one of your published posts
    Delete {
        /// Stored hash of the post
        post_hash: String,
    },

    /// Introduce one peer to another
    Introduce {
        /// Peer receiving the introduction (hex)
        to: String,
        /// Peer being introduced (hex)
        peer: String,
        /// Name to introduce them by
        name: String,
    },

    /// Introductions you have received
    Introductions,

    /// Follow a peer
    Follow {
        /// Peer ID (hex)
        peer: String,
    },

    /// Stop following a peer
    Unfollow {
        /// Peer ID (hex)
        peer: String,
    },

    /// List followed peers
    Following,

    /// Show posts from you and the peers you follow
    Feed {
        /// Maximum number of posts
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Publish local changes to the network
    Publish,

    /// Fetch new content from followed peers
    Sync {
        /// Only this peer (hex)
        #[arg(short, long)]
        peer: Option<String>,
    },

    /// Publish and sync periodically until Ctrl-C
    Run,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show your peer ID and profile
    Show,
    /// Set your display name
    SetName {
        /// Display name
        name: String,
    },
    /// Set your avatar image
    SetAvatar {
        /// Image file
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum CircleAction {
    /// Create a circle
    Create {
        /// Circle name
        name: String,
    },
    /// List your circles
    List,
    /// Rename a circle
    Rename {
        /// Circle name or ID
        circle: String,
        /// New name
        name: String,
    },
    /// Add a member (rotates the circle key)
    Add {
        /// Circle name or ID
        circle: String,
        /// Peer ID (hex)
        peer: String,
    },
    /// Remove a member (rotates the circle key)
    Remove {
        /// Circle name or ID
        circle: String,
        /// Peer ID (hex)
        peer: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.circlesync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".circlesync")
        .join("data")
}

fn parse_peer(s: &str) -> Result<PeerId> {
    s.parse()
        .map_err(|e| anyhow!("Invalid peer ID '{}': {}", s, e))
}

fn parse_hash(s: &str) -> Result<BlobHash> {
    s.parse()
        .map_err(|e| anyhow!("Invalid hash '{}': {}", s, e))
}

/// Find a circle by ID or name; `None` means the everyone circle
fn find_circle<C: ContentStore>(node: &Node<C>, circle: Option<&str>) -> Result<Circle> {
    let Some(wanted) = circle else {
        return Ok(node.everyone()?);
    };
    if let Ok(id) = CircleId::from_string(wanted) {
        return Ok(node.circle(&id)?);
    }
    node.circles()?
        .into_iter()
        .find(|c| c.name == wanted)
        .ok_or_else(|| anyhow!("No circle named '{}'", wanted))
}

fn format_time(ts: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn read_file(path: &Path) -> Result<(String, Vec<u8>)> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    Ok((name, bytes))
}

fn print_circle(circle: &Circle) {
    println!("{} ({})", circle.name, circle.id);
    println!("  Members: {}", circle.members.len());
    println!("  Key generation: {}", circle.key_generation);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Publish => {
            let node = Node::open_in(&data_dir).await?;
            let result = node.publish().await;
            node.shutdown().await;
            let report = result?;
            println!("Published version {}", report.version);
            println!("  Root: {}", report.root.to_hex());
            println!("  Audience: {} peer(s)", report.audience);
            println!(
                "  Uploaded: {} post(s), {} reaction(s), {} action(s), {} attachment(s)",
                report.uploads.posts,
                report.uploads.reactions,
                report.uploads.actions,
                report.uploads.attachments
            );
        }

        Commands::Sync { peer } => {
            let node = Node::open_in(&data_dir).await?;
            let result = match peer {
                Some(peer) => match parse_peer(&peer) {
                    Ok(peer) => node
                        .sync_peer(peer)
                        .await
                        .map(|outcome| print_outcome(&peer, &outcome))
                        .map_err(anyhow::Error::from),
                    Err(e) => Err(e),
                },
                None => match node.sync().await {
                    Ok(report) => {
                        for (peer, outcome) in &report.outcomes {
                            print_outcome(peer, outcome);
                        }
                        for (peer, reason) in &report.failures {
                            println!("{}: failed ({})", peer, reason);
                        }
                        println!(
                            "Synced {} peer(s), {} failed",
                            report.synced(),
                            report.failures.len()
                        );
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                },
            };
            node.shutdown().await;
            result?;
        }

        Commands::Run => {
            let node = Node::open_in(&data_dir).await?;
            println!("Running as {}", node.peer_id().to_hex());
            println!("Press Ctrl-C to stop");

            let mut events = node.subscribe();
            let mut service = node.service();
            service.start()?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            println!("Stopping...");
            service.stop().await;
            node.shutdown().await;
        }

        command => {
            let node = Node::open_offline(&data_dir)?;
            run_local(&node, command, &data_dir).await?;
        }
    }

    Ok(())
}

/// Commands that only touch the local store
async fn run_local<C: ContentStore>(node: &Node<C>, command: Commands, data_dir: &Path) -> Result<()> {
    match command {
        Commands::Info => {
            let local = node.peer_id();
            println!("CircleSync v0.1.0");
            println!();
            println!("Identity:");
            println!("  Peer: {}", local.to_hex());
            match node.identity(&local)? {
                Some(identity) => println!("  Name: {}", identity.name),
                None => println!("  Name: (not set)"),
            }
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Circles: {}", node.circles()?.len());
            println!("Following: {}", node.following()?.len());
        }

        Commands::Identity { action } => match action {
            IdentityAction::Show => {
                let local = node.peer_id();
                println!("Peer: {}", local.to_hex());
                match node.identity(&local)? {
                    Some(identity) => {
                        println!("Name: {}", identity.name);
                        if let Some(avatar) = identity.avatar {
                            println!("Avatar: {} ({} bytes)", avatar.name, avatar.size);
                        }
                        println!(
                            "Published: {}",
                            if identity.stored_hash.is_some() { "yes" } else { "no" }
                        );
                    }
                    None => println!("Name: (not set)"),
                }
            }
            IdentityAction::SetName { name } => {
                let identity = node.set_name(&name)?;
                println!("Name set to '{}'", identity.name);
            }
            IdentityAction::SetAvatar { file } => {
                let (name, bytes) = read_file(&file)?;
                let size = bytes.len();
                node.set_avatar(&name, bytes)?;
                println!("Avatar set to {} ({} bytes)", name, size);
            }
        },

        Commands::Circle { action } => match action {
            CircleAction::Create { name } => {
                let circle = node.create_circle(&name)?;
                println!("Created circle '{}'", circle.name);
                println!("  ID: {}", circle.id);
            }
            CircleAction::List => {
                for circle in node.circles()? {
                    print_circle(&circle);
                }
            }
            CircleAction::Rename { circle, name } => {
                let circle = find_circle(node, Some(&circle))?;
                let circle = node.rename_circle(&circle.id, &name)?;
                println!("Renamed circle to '{}'", circle.name);
            }
            CircleAction::Add { circle, peer } => {
                let circle = find_circle(node, Some(&circle))?;
                let circle = node.add_member(&circle.id, parse_peer(&peer)?)?;
                println!("Added member to '{}'", circle.name);
                print_circle(&circle);
            }
            CircleAction::Remove { circle, peer } => {
                let circle = find_circle(node, Some(&circle))?;
                let circle = node.remove_member(&circle.id, &parse_peer(&peer)?)?;
                println!("Removed member from '{}'", circle.name);
                print_circle(&circle);
            }
        },

        Commands::Post {
            text,
            circle,
            reply_to,
            attach,
        } => {
            let circle = find_circle(node, circle.as_deref())?;
            let parent = reply_to.as_deref().map(parse_hash).transpose()?;
            let attachments = attach
                .iter()
                .map(|path| read_file(path))
                .collect::<Result<Vec<_>>>()?;
            let post = node.post_with(&circle.id, &text, parent, attachments)?;
            println!("Posted to '{}'", circle.name);
            println!("  ID: {}", post.id);
            if !post.files.is_empty() {
                println!("  Attachments: {}", post.files.len());
            }
        }

        Commands::React {
            post_hash,
            value,
            tag,
            circle,
        } => {
            let circle = find_circle(node, circle.as_deref())?;
            let kind = if tag { ReactionKind::Tag } else { ReactionKind::Reaction };
            let reaction = node.react(parse_hash(&post_hash)?, kind, &value, &circle.id)?;
            println!("Added {} '{}'", reaction.kind, reaction.value);
        }

        Commands::Delete { post_hash } => {
            let post = node.delete_post(&parse_hash(&post_hash)?)?;
            println!("Deleted post {}", post.id);
        }

        Commands::Introduce { to, peer, name } => {
            node.introduce(parse_peer(&to)?, parse_peer(&peer)?, &name)?;
            println!("Introduction queued; it is sent with the next publish");
        }

        Commands::Introductions => {
            let intros = node.introductions()?;
            if intros.is_empty() {
                println!("No introductions");
            }
            for intro in intros {
                println!(
                    "{} introduced {} ({})",
                    intro.from,
                    intro.name,
                    intro.peer.to_hex()
                );
            }
        }

        Commands::Follow { peer } => {
            let record = node.follow(parse_peer(&peer)?).await?;
            println!("Following {}", record.peer);
        }

        Commands::Unfollow { peer } => {
            let peer = parse_peer(&peer)?;
            if node.unfollow(&peer)? {
                println!("Unfollowed {}", peer);
            } else {
                println!("Not following {}", peer);
            }
        }

        Commands::Following => {
            let peers = node.following()?;
            if peers.is_empty() {
                println!("Not following anyone");
            }
            for record in peers {
                println!("{} ({})", record.label(), record.peer.to_hex());
                println!("  Version: {}", record.last_accepted_version);
                if let Some(at) = record.last_synced_at {
                    println!("  Last synced: {}", format_time(at));
                }
                if let Some(error) = record.last_error {
                    println!("  Last error: {}", error);
                }
            }
        }

        Commands::Feed { limit } => {
            let posts = node.feed(limit)?;
            if posts.is_empty() {
                println!("No posts");
            }
            for post in posts {
                let author = node
                    .identity(&post.author)?
                    .map(|i| i.name)
                    .unwrap_or_else(|| post.author.to_string());
                println!("[{}] {}: {}", format_time(post.timestamp), author, post.text);
                match post.stored_hash {
                    Some(hash) => println!("  Hash: {}", hash.to_hex()),
                    None => println!("  (unpublished)"),
                }
            }
        }

        Commands::Publish | Commands::Sync { .. } | Commands::Run => {
            return Err(anyhow!("this command needs a networked node"));
        }
    }
    Ok(())
}

fn print_outcome(peer: &PeerId, outcome: &PeerSyncOutcome) {
    match outcome {
        PeerSyncOutcome::UpToDate { version } => {
            println!("{}: up to date (version {})", peer, version)
        }
        PeerSyncOutcome::Synced { version, stats } => println!(
            "{}: version {} ({} post(s), {} reaction(s))",
            peer, version, stats.posts, stats.reactions
        ),
        PeerSyncOutcome::Incomplete { version, stats } => println!(
            "{}: version {} incomplete ({} post(s) so far)",
            peer, version, stats.posts
        ),
    }
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Published { version, root } => {
            println!("Published version {} ({})", version, root)
        }
        SyncEvent::PeerSynced {
            peer,
            version,
            new_posts,
            new_reactions,
        } => println!(
            "{}: version {} ({} new post(s), {} new reaction(s))",
            peer, version, new_posts, new_reactions
        ),
        SyncEvent::PeerUpToDate { .. } => {}
        SyncEvent::PeerFailed { peer, reason } => println!("{}: {}", peer, reason),
        SyncEvent::KeyInstalled {
            owner,
            generation,
            ..
        } => println!("{}: installed circle key generation {}", owner, generation),
    }
}
