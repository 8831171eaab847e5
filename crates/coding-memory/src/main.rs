//! # Coding Memory CLI (`cmem`)
//!
//! The `cmem` binary exposes every memory operation on the command line.
//! Results are printed to stdout as JSON; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! cmem --config ~/.config/coding-memory/cmem.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cmem init` | Create the database, then run the startup import pass |
//! | `cmem sync` | Import chat logs now (all sources, or `--source`) |
//! | `cmem status` | Import state of every `(source, project)` pair |
//! | `cmem search "<query>"` | Hybrid search across record types |
//! | `cmem context "<query>"` | Token-budgeted context bundle |
//! | `cmem recall decision\|bug "<query>"` | Filtered recall of past decisions or bugs |
//! | `cmem sessions` | Browse sessions |
//! | `cmem session <id>` | One session with summary and messages |
//! | `cmem project [<id>]` | Recent activity and counts for a project |
//! | `cmem save decision\|bug\|thought\|pattern` | Capture knowledge |
//! | `cmem ingest session\|message` | Capture a session or append a message |

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use coding_memory::config;
use coding_memory::logging;
use coding_memory::service::{
    MemoryService, NewBug, NewDecision, NewPattern, NewSession, NewThought, ProjectContextLimits,
    SearchQuery,
};
use coding_memory_core::context::ContextRequest;
use coding_memory_core::models::{RecordType, Role, Severity};
use coding_memory_core::scope::ScopeRequest;
use coding_memory_core::store::ListSort;

/// Coding Memory: per-project memory of AI coding sessions.
#[derive(Parser)]
#[command(
    name = "cmem",
    about = "Per-project memory of AI coding sessions",
    version,
    long_about = "Coding Memory imports chat logs from AI coding assistants, keeps decisions, \
    bugs, patterns and notes per project, and serves hybrid search and token-budgeted context."
)]
struct Cli {
    /// Path to the configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Project selection shared by retrieval commands.
#[derive(Args, Clone, Default)]
struct ScopeArgs {
    /// Project id (usually a workspace path). Defaults to the current workspace.
    #[arg(long, short)]
    project: Option<String>,

    /// Also search these projects. Repeatable.
    #[arg(long = "related")]
    related: Vec<String>,

    /// Search every project.
    #[arg(long)]
    all_projects: bool,
}

impl ScopeArgs {
    fn request(&self) -> ScopeRequest {
        ScopeRequest {
            project_id: self.project.clone().unwrap_or_default(),
            related_project_ids: if self.related.is_empty() {
                None
            } else {
                Some(self.related.clone())
            },
            include_all_projects: self.all_projects.then_some(true),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and run the startup import pass.
    ///
    /// Idempotent: running it again only imports new or changed logs.
    Init,

    /// Import chat logs now.
    Sync {
        /// Only this source (`claude-code`, `codex`, `generic-json`).
        #[arg(long)]
        source: Option<String>,

        /// Import for this project instead of the default.
        #[arg(long)]
        project: Option<String>,

        /// Ignore the cooldown.
        #[arg(long)]
        force: bool,
    },

    /// Show import state per (source, project) pair.
    Status,

    /// Hybrid search over stored records.
    Search {
        query: String,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Restrict to record types (e.g. `decision,bug`).
        #[arg(long, value_delimiter = ',')]
        types: Vec<RecordType>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        per_type_limit: Option<usize>,
    },

    /// Build a context bundle for an agent.
    Context {
        query: String,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Attach recent messages to matched sessions.
        #[arg(long)]
        messages: bool,

        #[arg(long, value_delimiter = ',')]
        types: Vec<RecordType>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        max_tokens: Option<usize>,

        /// File the request is about (repeatable).
        #[arg(long = "file")]
        files: Vec<String>,

        /// Print only the rendered context text.
        #[arg(long)]
        text: bool,
    },

    /// Recall past decisions or bugs.
    Recall {
        #[command(subcommand)]
        kind: RecallKind,
    },

    /// List sessions.
    Sessions {
        #[command(flatten)]
        scope: ScopeArgs,

        /// `created_at`, `started_at` or `message_count`.
        #[arg(long, default_value = "started_at")]
        sort: ListSort,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Show one session.
    Session {
        id: String,

        #[arg(long)]
        messages: bool,

        #[arg(long, default_value_t = 50)]
        message_limit: usize,
    },

    /// Recent activity and record counts for a project.
    Project {
        /// Defaults to the current workspace.
        project: Option<String>,
    },

    /// Save a decision, bug, thought or pattern.
    Save {
        #[command(subcommand)]
        kind: SaveKind,
    },

    /// Capture a session or append a message to one.
    Ingest {
        #[command(subcommand)]
        kind: IngestKind,
    },
}

#[derive(Subcommand)]
enum RecallKind {
    Decision {
        query: String,
        #[arg(long)]
        category: Option<String>,
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    Bug {
        query: String,
        #[arg(long)]
        severity: Option<Severity>,
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum SaveKind {
    Decision {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "")]
        category: String,
        #[arg(long, default_value = "")]
        context: String,
        #[arg(long = "alternative")]
        alternatives: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, short)]
        project: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    Bug {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "")]
        root_cause: String,
        #[arg(long = "fix", default_value = "")]
        fix_description: String,
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long = "error")]
        errors: Vec<String>,
        #[arg(long, default_value = "medium")]
        severity: Severity,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, short)]
        project: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    Thought {
        content: String,
        #[arg(long, default_value = "")]
        category: String,
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, short)]
        project: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    Pattern {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "")]
        example: String,
        #[arg(long = "use-case")]
        use_cases: Vec<String>,
        #[arg(long, default_value = "")]
        language: String,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, short)]
        project: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Subcommand)]
enum IngestKind {
    /// Store a whole session from a JSON file (`-` reads stdin).
    Session { file: PathBuf },
    /// Append one message to an existing session.
    Message {
        session_id: String,
        content: String,
        #[arg(long, default_value = "user")]
        role: String,
        #[arg(long = "tool")]
        tools: Vec<String>,
        #[arg(long)]
        ordinal: Option<i64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let cfg = config::load_config(&config_path)?;
    let service = MemoryService::open(&cfg).await?;

    match cli.command {
        Commands::Init => {
            let refresh = service.start().await;
            print_json(&serde_json::json!({
                "database": cfg.db.path,
                "startup_import": refresh,
            }))?;
        }
        Commands::Sync {
            source,
            project,
            force,
        } => {
            let runs = service
                .sync()
                .sync_now(source.as_deref(), project.as_deref(), force)
                .await?;
            print_json(&runs)?;
        }
        Commands::Status => {
            print_json(&service.sync().status().await?)?;
        }
        Commands::Search {
            query,
            scope,
            types,
            limit,
            per_type_limit,
        } => {
            let response = service
                .search(&SearchQuery {
                    query,
                    scope: scope.request(),
                    record_types: (!types.is_empty()).then_some(types),
                    limit,
                    per_type_limit,
                })
                .await?;
            print_json(&response)?;
        }
        Commands::Context {
            query,
            scope,
            messages,
            types,
            limit,
            max_tokens,
            files,
            text,
        } => {
            let bundle = service
                .context_for_request(&ContextRequest {
                    query,
                    scope: scope.request(),
                    include_messages: messages,
                    record_types: (!types.is_empty()).then_some(types),
                    limit,
                    max_tokens,
                    file_paths: files,
                    ..Default::default()
                })
                .await?;
            if text {
                println!("{}", bundle.context_text);
            } else {
                print_json(&bundle)?;
            }
        }
        Commands::Recall { kind } => {
            let response = match kind {
                RecallKind::Decision {
                    query,
                    category,
                    scope,
                    limit,
                } => {
                    service
                        .recall_decision(&query, category.as_deref(), &scope.request(), limit)
                        .await?
                }
                RecallKind::Bug {
                    query,
                    severity,
                    scope,
                    limit,
                } => {
                    service
                        .recall_bug(&query, severity, &scope.request(), limit)
                        .await?
                }
            };
            print_json(&response)?;
        }
        Commands::Sessions {
            scope,
            sort,
            limit,
            offset,
        } => {
            print_json(
                &service
                    .list_sessions(&scope.request(), sort, limit, offset)
                    .await?,
            )?;
        }
        Commands::Session {
            id,
            messages,
            message_limit,
        } => {
            print_json(&service.get_session(&id, messages, message_limit).await?)?;
        }
        Commands::Project { project } => {
            let context = service
                .project_context(
                    project.as_deref().unwrap_or_default(),
                    ProjectContextLimits::default(),
                )
                .await?;
            print_json(&context)?;
        }
        Commands::Save { kind } => {
            let id = match kind {
                SaveKind::Decision {
                    title,
                    description,
                    category,
                    context,
                    alternatives,
                    tags,
                    project,
                    session,
                } => {
                    service
                        .save_decision(NewDecision {
                            project_id: project.unwrap_or_default(),
                            title,
                            description,
                            category,
                            context,
                            alternatives,
                            tags,
                            consequences: Vec::new(),
                            source_session_id: session,
                        })
                        .await?
                }
                SaveKind::Bug {
                    title,
                    description,
                    root_cause,
                    fix_description,
                    files,
                    errors,
                    severity,
                    tags,
                    project,
                    session,
                } => {
                    service
                        .save_bug(NewBug {
                            project_id: project.unwrap_or_default(),
                            title,
                            description,
                            root_cause,
                            fix_description,
                            files_affected: files,
                            error_messages: errors,
                            severity,
                            tags,
                            source_session_id: session,
                        })
                        .await?
                }
                SaveKind::Thought {
                    content,
                    category,
                    files,
                    tags,
                    project,
                    session,
                } => {
                    service
                        .save_thought(NewThought {
                            project_id: project.unwrap_or_default(),
                            content,
                            category,
                            related_files: files,
                            tags,
                            source_session_id: session,
                        })
                        .await?
                }
                SaveKind::Pattern {
                    title,
                    description,
                    example,
                    use_cases,
                    language,
                    tags,
                    project,
                    session,
                } => {
                    service
                        .save_pattern(NewPattern {
                            project_id: project.unwrap_or_default(),
                            title,
                            description,
                            code_example: example,
                            use_cases,
                            language,
                            tags,
                            source_session_id: session,
                        })
                        .await?
                }
            };
            print_json(&serde_json::json!({ "id": id }))?;
        }
        Commands::Ingest { kind } => match kind {
            IngestKind::Session { file } => {
                let raw = if file.as_os_str() == "-" {
                    std::io::read_to_string(std::io::stdin())?
                } else {
                    std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read {}", file.display()))?
                };
                let input: NewSession =
                    serde_json::from_str(&raw).with_context(|| "Invalid session JSON")?;
                print_json(&service.ingest_session(input).await?)?;
            }
            IngestKind::Message {
                session_id,
                content,
                role,
                tools,
                ordinal,
            } => {
                let role = Role::parse(&role)
                    .with_context(|| format!("Unknown role '{}'", role))?;
                let ingested = service
                    .ingest_message(&session_id, role, &content, tools, ordinal)
                    .await?;
                print_json(&ingested)?;
            }
        },
    }

    Ok(())
}
