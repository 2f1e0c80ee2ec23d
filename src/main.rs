use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use std::sync::Arc;
use tenant_sql_cache::cache::open_backend;
use tenant_sql_cache::db::{init_pool, MySqlExecutor, MySqlGuardianResolver};
use tenant_sql_cache::llm::OpenAiTranslator;
use tenant_sql_cache::store::migrate::migrate_entries;
use tenant_sql_cache::store::TemplateBackend;
use tenant_sql_cache::telemetry::init_tracing;
use tenant_sql_cache::{
    AccessScope, Assistant, AssistantConfig, AuthorizedIds, CallerIdentity, ParameterExtractor,
    RecordOutcome, RoleScopedCache, Tier,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "tenant-sql-cache")]
#[command(about = "Tenant-scoped NL-to-SQL template cache with access validation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum TierArg {
    Admin,
    Parent,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Admin => Tier::Unrestricted,
            TierArg::Parent => Tier::Tenant,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show the parameters detected in a question
    Extract { question: String },

    /// Show the normalized template and its cache key
    Normalize { question: String },

    /// Look a question up in one tier's cache
    Lookup {
        question: String,
        #[arg(long, value_enum, default_value = "parent")]
        tier: TierArg,
        /// Authorized ids for the parent tier, e.g. 7012,7716
        #[arg(long, default_value = "")]
        ids: String,
    },

    /// Record a question and the SQL that answered it
    Record {
        question: String,
        sql: String,
        #[arg(long, value_enum, default_value = "parent")]
        tier: TierArg,
        #[arg(long, default_value = "")]
        ids: String,
    },

    /// Check whether SQL may run for a tier
    Authorize {
        sql: String,
        #[arg(long, value_enum, default_value = "parent")]
        tier: TierArg,
        #[arg(long, default_value = "")]
        ids: String,
    },

    /// Rewrite legacy entries of both stores in place
    Migrate,

    /// Entry counts and locations of both stores
    Stats,

    /// Answer a question end to end against the database
    Ask {
        question: String,
        #[arg(long)]
        user_id: u64,
        /// Role claims, e.g. ROLE_PARENT
        #[arg(long = "role", required = true)]
        roles: Vec<String>,
    },
}

fn scope(tier: TierArg, ids: &str) -> Result<AccessScope> {
    Ok(match tier {
        TierArg::Admin => AccessScope::Unrestricted,
        TierArg::Parent => {
            let ids = AuthorizedIds::parse(ids)?;
            if ids.is_empty() {
                bail!("--ids is required for the parent tier");
            }
            AccessScope::Tenant(ids)
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AssistantConfig::from_env()?;

    match cli.command {
        Command::Extract { question } => {
            let extraction = ParameterExtractor::new().extract(&question);
            println!("template: {}", extraction.template);
            for (name, value) in &extraction.variables {
                println!("  {} = {}", name, value);
            }
        }
        Command::Normalize { question } => {
            println!("{}", tenant_sql_cache::normalize(&question));
            println!("key: {}", tenant_sql_cache::template_key(&question));
        }
        Command::Lookup { question, tier, ids } => {
            let scope = scope(tier, &ids)?;
            let cache = RoleScopedCache::from_config(&config, tier.into())?;
            match cache.lookup(&question, &scope)? {
                Some(hit) => {
                    println!("{:?} hit on {}", hit.match_kind, hit.key);
                    println!(
                        "variables: {}",
                        hit.variables
                            .iter()
                            .map(|(k, v)| format!("{}={}", k, v))
                            .join(", ")
                    );
                    println!("{}", hit.sql);
                    println!("authorized: {}", scope.authorize(&hit.sql).is_allowed());
                }
                None => println!("miss"),
            }
        }
        Command::Record {
            question,
            sql,
            tier,
            ids,
        } => {
            let scope = scope(tier, &ids)?;
            let cache = RoleScopedCache::from_config(&config, tier.into())?;
            match cache.record(&question, &sql, &scope)? {
                RecordOutcome::Stored { key } => println!("stored {}", key),
                RecordOutcome::Skipped(reason) => println!("skipped: {}", reason),
            }
        }
        Command::Authorize { sql, tier, ids } => {
            let verdict = scope(tier, &ids)?.authorize(&sql);
            println!("{}: {}", verdict.is_allowed(), verdict.reason());
            if !verdict.is_allowed() {
                std::process::exit(1);
            }
        }
        Command::Migrate => {
            for (tier, path) in [
                (Tier::Unrestricted, &config.admin_cache_path),
                (Tier::Tenant, &config.parent_cache_path),
            ] {
                let backend = open_backend(config.backend, path)?;
                let loaded = backend
                    .load()
                    .with_context(|| format!("reading {}", backend.location()))?;
                let (entries, report) = migrate_entries(loaded);
                if report.changed() {
                    backend.replace_all(&entries)?;
                }
                println!(
                    "{}: {} entries, {} placeholder rewrites, {} re-keyed, {} duplicates dropped",
                    tier,
                    entries.len(),
                    report.braces_rewritten,
                    report.rekeyed,
                    report.dropped_duplicates
                );
            }
        }
        Command::Stats => {
            for tier in [Tier::Unrestricted, Tier::Tenant] {
                let stats = RoleScopedCache::from_config(&config, tier)?.stats();
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Command::Ask {
            question,
            user_id,
            roles,
        } => {
            let api_key = config
                .openai_api_key
                .clone()
                .context("OPENAI_API_KEY is not set")?;
            let database_url = config
                .database_url
                .clone()
                .context("DATABASE_URL is not set")?;
            let pool = init_pool(&database_url).await?;

            let translator = OpenAiTranslator::with_endpoint(
                api_key,
                config.openai_base_url.clone(),
                config.openai_model.clone(),
            );
            let assistant = Assistant::from_config(
                &config,
                Arc::new(translator),
                Arc::new(MySqlExecutor::new(pool.clone())),
                Arc::new(MySqlGuardianResolver::new(pool)),
            )?;

            let caller = CallerIdentity::new(user_id, roles);
            let answer = assistant.ask(&question, &caller).await?;
            info!("Answered from cache: {}", answer.from_cache());
            println!("{}", serde_json::to_string_pretty(&answer)?);
        }
    }

    Ok(())
}
