mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use braid_core::Engine;
use braid_core::api::{self, Request};
use braid_core::events::{EVENT_LOG_FILE, read_event_log};
use braid_core::gateway::NullGateway;
use braid_store::Store;

use config::{ConfigFile, config_path, load_config, resolve_engine_config, save_config};

#[derive(Parser)]
#[command(name = "braid", about = "Orchestrator for fleets of LLM coding agents")]
struct Cli {
    /// Data directory (overrides BRAID_DATA_DIR and the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Workspaces directory; enables git features
    #[arg(long, global = true)]
    workspaces_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a braid config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Strand (project) management
    Strand {
        #[command(subcommand)]
        command: StrandCommands,
    },
    /// Goal management
    Goal {
        #[command(subcommand)]
        command: GoalCommands,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// PM cascade operations
    Pm {
        #[command(subcommand)]
        command: PmCommands,
    },
    /// Session lifecycle
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Replay the disk-backed goal event log
    Events,
}

#[derive(Subcommand)]
enum StrandCommands {
    /// Create a strand (and its workspace when git is enabled)
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        repo_url: Option<String>,
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
    },
    /// List all strands
    List,
    /// Show one strand with its goals
    Get { strand_id: String },
    /// Update strand fields
    Update {
        strand_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_delimiter = ',')]
        keywords: Option<Vec<String>>,
    },
    /// Delete a strand, cascading its goals and killing their sessions
    Delete { strand_id: String },
}

#[derive(Subcommand)]
enum GoalCommands {
    /// Create a goal
    Create {
        title: String,
        #[arg(long)]
        strand_id: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        phase: Option<u32>,
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    /// List goals (optionally for one strand)
    List {
        #[arg(long)]
        strand_id: Option<String>,
    },
    /// Show one goal
    Get { goal_id: String },
    /// Delete a goal
    Delete { goal_id: String },
    /// Spawn sessions for the goal's unblocked tasks
    Kickoff { goal_id: String },
    /// Kill sessions, drop the worktree, and mark the goal done
    Close { goal_id: String },
    /// Show ahead/behind counts and conflict files for the goal branch
    BranchStatus { goal_id: String },
    /// Open a pull request for the goal branch
    CreatePr { goal_id: String },
    /// Push the goal branch again
    RetryPush { goal_id: String },
    /// Re-run the merge flow after resolving a conflict
    RetryMerge { goal_id: String },
    /// Push the strand's main branch
    PushMain { goal_id: String },
    /// Attach an existing session to a goal
    AttachSession {
        goal_id: String,
        session_key: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Add a task to a goal
    Add {
        goal_id: String,
        text: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    /// Update task fields
    Update {
        goal_id: String,
        task_id: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        summary: Option<String>,
    },
    /// Delete a task (its session is aborted)
    Delete { goal_id: String, task_id: String },
}

#[derive(Subcommand)]
enum PmCommands {
    /// Chat with a strand's PM and wait for the reply
    Chat { strand_id: String, message: String },
    /// Prepare (and send) a strand PM message without waiting
    StrandChat {
        strand_id: String,
        message: String,
        #[arg(long)]
        no_send: bool,
    },
    /// Start the PM cascade for one goal
    Cascade {
        goal_id: String,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        no_send: bool,
    },
    /// Start the PM cascade for every goal in a strand without tasks
    StrandCascade {
        strand_id: String,
        #[arg(long)]
        no_send: bool,
    },
    /// Save a PM response onto a goal and advance its cascade
    SaveResponse { goal_id: String, content: String },
    /// Materialize tasks from the saved plan on a goal
    CreateTasks {
        goal_id: String,
        #[arg(long)]
        mode: Option<String>,
    },
    /// Create goals on a strand from its saved plan markdown
    CreateGoals {
        strand_id: String,
        #[arg(long)]
        content: Option<String>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions in a strand with their attribution
    List { strand_id: String },
    /// Kill every session attached to a goal
    KillGoal { goal_id: String },
    /// Kill every session in a strand
    KillStrand { strand_id: String },
    /// Abort sessions attached to tasks that are neither running nor done
    Cleanup {
        #[arg(long)]
        strand_id: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = &cli.command {
        return init_config(cli.data_dir, cli.workspaces_dir, *force);
    }

    let file = load_config()?;
    let engine_config = resolve_engine_config(&file, cli.data_dir, cli.workspaces_dir)?;
    let store = Arc::new(Store::open(&engine_config.data_dir).with_context(|| {
        format!("failed to open store at {}", engine_config.data_dir.display())
    })?);
    let engine = Arc::new(Engine::new(engine_config, store, Arc::new(NullGateway)));

    if let Commands::Events = &cli.command {
        let log = read_event_log(&engine.config().data_dir.join(EVENT_LOG_FILE))?;
        println!("{}", serde_json::to_string_pretty(&log)?);
        return Ok(());
    }

    let request = build_request(cli.command)?;
    let response = api::dispatch(&engine, request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    engine.shutdown();
    if !response.ok {
        std::process::exit(1);
    }
    Ok(())
}

fn init_config(
    data_dir: Option<PathBuf>,
    workspaces_dir: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    let path = config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    let file = ConfigFile {
        data_dir,
        workspaces_dir,
        ..ConfigFile::default()
    };
    save_config(&file)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn parse_mode(mode: Option<String>) -> Result<Option<braid_store::CascadeMode>> {
    mode.map(|m| m.parse().map_err(|e| anyhow::anyhow!("{e}")))
        .transpose()
}

fn parse_status(status: Option<String>) -> Result<Option<braid_store::TaskStatus>> {
    status
        .map(|s| s.parse().map_err(|e| anyhow::anyhow!("{e}")))
        .transpose()
}

fn build_request(command: Commands) -> Result<Request> {
    use api::*;

    let request = match command {
        Commands::Init { .. } | Commands::Events => unreachable!("handled in run()"),

        Commands::Strand { command } => match command {
            StrandCommands::Create {
                name,
                description,
                repo_url,
                keywords,
            } => Request::StrandsCreate(StrandsCreateParams {
                name,
                description,
                color: None,
                keywords,
                topic_ids: Vec::new(),
                repo_url,
                cascade_mode: None,
                autonomy_mode: None,
            }),
            StrandCommands::List => Request::StrandsList,
            StrandCommands::Get { strand_id } => Request::StrandsGet(StrandIdParams { strand_id }),
            StrandCommands::Update {
                strand_id,
                name,
                description,
                keywords,
            } => Request::StrandsUpdate(StrandsUpdateParams {
                strand_id,
                name,
                description,
                color: None,
                keywords,
                cascade_mode: None,
                autonomy_mode: None,
            }),
            StrandCommands::Delete { strand_id } => {
                Request::StrandsDelete(StrandIdParams { strand_id })
            }
        },

        Commands::Goal { command } => match command {
            GoalCommands::Create {
                title,
                strand_id,
                description,
                phase,
                depends_on,
            } => Request::GoalsCreate(GoalsCreateParams {
                title,
                description,
                strand_id,
                phase,
                depends_on,
                cascade_mode: None,
                autonomy_mode: None,
                max_retries: None,
            }),
            GoalCommands::List { strand_id } => Request::GoalsList(GoalsListParams { strand_id }),
            GoalCommands::Get { goal_id } => Request::GoalsGet(GoalIdParams { goal_id }),
            GoalCommands::Delete { goal_id } => Request::GoalsDelete(GoalIdParams { goal_id }),
            GoalCommands::Kickoff { goal_id } => Request::GoalsKickoff(GoalIdParams { goal_id }),
            GoalCommands::Close { goal_id } => Request::GoalsClose(GoalIdParams { goal_id }),
            GoalCommands::BranchStatus { goal_id } => {
                Request::GoalsBranchStatus(GoalIdParams { goal_id })
            }
            GoalCommands::CreatePr { goal_id } => Request::GoalsCreatePr(GoalIdParams { goal_id }),
            GoalCommands::RetryPush { goal_id } => {
                Request::GoalsRetryPush(GoalIdParams { goal_id })
            }
            GoalCommands::RetryMerge { goal_id } => {
                Request::GoalsRetryMerge(GoalIdParams { goal_id })
            }
            GoalCommands::PushMain { goal_id } => Request::GoalsPushMain(GoalIdParams { goal_id }),
            GoalCommands::AttachSession {
                goal_id,
                session_key,
            } => Request::GoalsAttachSession(AttachSessionParams {
                goal_id,
                session_key,
            }),
        },

        Commands::Task { command } => match command {
            TaskCommands::Add {
                goal_id,
                text,
                description,
                agent,
                depends_on,
            } => Request::TasksCreate(TasksCreateParams {
                goal_id,
                text,
                description,
                agent,
                model: None,
                priority: None,
                depends_on,
                estimated_time: None,
            }),
            TaskCommands::Update {
                goal_id,
                task_id,
                status,
                summary,
            } => Request::TasksUpdate(TasksUpdateParams {
                goal_id,
                task_id,
                text: None,
                description: None,
                status: parse_status(status)?,
                summary,
                agent: None,
                priority: None,
            }),
            TaskCommands::Delete { goal_id, task_id } => {
                Request::TasksDelete(TaskIdParams { goal_id, task_id })
            }
        },

        Commands::Pm { command } => match command {
            PmCommands::Chat { strand_id, message } => {
                Request::PmChat(PmChatParams { strand_id, message })
            }
            PmCommands::StrandChat {
                strand_id,
                message,
                no_send,
            } => Request::PmStrandChat(PmStrandChatParams {
                strand_id,
                message,
                send: !no_send,
            }),
            PmCommands::Cascade {
                goal_id,
                mode,
                no_send,
            } => Request::PmGoalCascade(PmGoalCascadeParams {
                goal_id,
                mode: parse_mode(mode)?,
                send: !no_send,
            }),
            PmCommands::StrandCascade { strand_id, no_send } => {
                Request::PmStrandCascade(PmStrandCascadeParams {
                    strand_id,
                    send: !no_send,
                })
            }
            PmCommands::SaveResponse { goal_id, content } => {
                Request::PmSaveResponse(PmSaveResponseParams { goal_id, content })
            }
            PmCommands::CreateTasks { goal_id, mode } => {
                Request::PmCreateTasksFromPlan(PmCreateTasksParams {
                    goal_id,
                    content: None,
                    mode: parse_mode(mode)?,
                })
            }
            PmCommands::CreateGoals { strand_id, content } => {
                Request::PmStrandCreateGoals(PmStrandCreateGoalsParams { strand_id, content })
            }
        },

        Commands::Sessions { command } => match command {
            SessionCommands::List { strand_id } => {
                Request::SessionsListForStrand(StrandIdParams { strand_id })
            }
            SessionCommands::KillGoal { goal_id } => {
                Request::SessionsKillForGoal(GoalIdParams { goal_id })
            }
            SessionCommands::KillStrand { strand_id } => {
                Request::SessionsKillForStrand(StrandIdParams { strand_id })
            }
            SessionCommands::Cleanup { strand_id } => {
                Request::SessionsCleanupStale(CleanupStaleParams { strand_id })
            }
        },
    };

    Ok(request)
}
