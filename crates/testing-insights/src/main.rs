#[cfg(feature = "cli")]
mod cli {
    use anyhow::Context;
    use chrono::Utc;
    use clap::{Parser, Subcommand};
    use serde_json::json;
    use std::sync::Arc;
    use testing_insights::{
        classify, metrics, telemetry, CheckpointStore, Config, MemoryDatabase, MemoryManager,
        SqliteExecutor, TurnError, TurnId, TurnPipeline, UserId,
    };
    use uuid::Uuid;

    #[derive(Debug, Parser)]
    #[command(name = "testing-insights", about = "Read-only SQL gate and memory for test-data questions")]
    pub struct Cli {
        /// Account that owns the memory; registered on first use
        #[arg(long, global = true, env = "INSIGHTS_USER")]
        pub user: Option<String>,
        #[arg(long, global = true, env = "INSIGHTS_PASSWORD", hide_env_values = true)]
        pub password: Option<String>,
        #[command(subcommand)]
        pub cmd: Command,
    }

    #[derive(Debug, Subcommand)]
    pub enum Command {
        /// Classify a SQL statement without running it.
        Classify { sql: String },
        /// Run one turn: build context, gate and execute the SQL, record the turn.
        /// The session window is checkpointed so a later run can continue it.
        Run {
            #[arg(long)]
            question: String,
            /// SQL proposed for the question; omit for a turn without a query
            #[arg(long)]
            sql: Option<String>,
            /// Session to continue; a new one is started when omitted
            #[arg(long)]
            session: Option<String>,
            /// Close the session after this turn, flushing its window to long-term memory
            #[arg(long)]
            end: bool,
        },
        /// Close a checkpointed session, flushing its window to long-term memory.
        EndSession { session: String },
        /// Recall archived turns relevant to a question.
        Recall {
            question: String,
            #[arg(long)]
            limit: Option<usize>,
        },
        /// Show one archived turn.
        Show { turn_id: u64 },
        /// Long-term memory statistics.
        Stats,
    }

    fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn open_store(cfg: &Config) -> anyhow::Result<Arc<MemoryDatabase>> {
        Ok(Arc::new(MemoryDatabase::new(&cfg.long_term_db_path, cfg.db_pool_size)?))
    }

    fn login(store: &MemoryDatabase, user: Option<&str>, password: Option<&str>) -> anyhow::Result<UserId> {
        let user = user.context("--user (or INSIGHTS_USER) is required")?;
        let password = password.context("--password (or INSIGHTS_PASSWORD) is required")?;
        store.users.create_or_authenticate(user, password)
    }

    pub async fn run(cli: Cli) -> anyhow::Result<()> {
        if let Command::Classify { sql } = &cli.cmd {
            return print_json(&classify(sql));
        }

        let cfg = Config::from_env()?;
        cfg.print_config();
        metrics::init_metrics()?;
        let store = open_store(&cfg)?;
        if let Command::Stats = cli.cmd {
            return print_json(&store.get_stats()?);
        }

        let user_id = login(&store, cli.user.as_deref(), cli.password.as_deref())?;
        let memory = Arc::new(MemoryManager::new(
            Arc::clone(&store) as Arc<dyn testing_insights::LongTermStore>,
            cfg.memory_config(),
        ));

        match cli.cmd {
            Command::Classify { .. } | Command::Stats => Ok(()),
            Command::Run { question, sql, session, end } => {
                let executor = SqliteExecutor::open(
                    &cfg.database_path()?,
                    cfg.db_pool_size,
                    cfg.query_row_limit,
                    cfg.query_timeout(),
                )?;
                let checkpoints =
                    CheckpointStore::open(&cfg.short_term_checkpoint_path, cfg.db_pool_size)?;
                let pipeline = TurnPipeline::new(Arc::clone(&memory), Arc::new(executor));

                let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
                let mut session = match checkpoints.load(user_id, &session_id)? {
                    Some(saved) => memory.resume_session(saved).await,
                    None => memory.open_session(user_id, session_id.clone()),
                };
                let context = pipeline.prepare(&session, &question).await;
                let result = pipeline.complete(&mut session, &question, sql.as_deref()).await;
                if end {
                    memory.close_session(session).await;
                    checkpoints.remove(user_id, &session_id)?;
                } else {
                    checkpoints.save(&session)?;
                }

                match result {
                    Ok(report) => print_json(&json!({
                        "session_id": session_id,
                        "context": context,
                        "report": report,
                    })),
                    Err(TurnError::Execution { turn_id, source }) => {
                        print_json(&json!({
                            "session_id": session_id,
                            "context": context,
                            "turn_id": turn_id,
                            "error": source.to_string(),
                        }))?;
                        Err(anyhow::Error::new(source).context(format!("turn {} failed", turn_id)))
                    }
                }
            }
            Command::EndSession { session } => {
                let checkpoints =
                    CheckpointStore::open(&cfg.short_term_checkpoint_path, cfg.db_pool_size)?;
                let saved = checkpoints
                    .load(user_id, &session)?
                    .with_context(|| format!("session {} has no checkpoint", session))?;
                let flushed = memory.close_session(saved).await;
                checkpoints.remove(user_id, &session)?;
                print_json(&json!({ "session_id": session, "flushed": flushed }))
            }
            Command::Recall { question, limit } => {
                let limit = limit.unwrap_or(cfg.long_term_top_k);
                let records = memory.recall(user_id, &question, Utc::now(), limit).await?;
                print_json(&records)
            }
            Command::Show { turn_id } => {
                let turn = memory
                    .fetch_turn(user_id, TurnId(turn_id))
                    .await?
                    .with_context(|| format!("turn {} is not archived", turn_id))?;
                print_json(&turn)
            }
        }
    }

    pub fn init() {
        telemetry::init_tracing();
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;

    cli::init();
    cli::run(cli::Cli::parse()).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
