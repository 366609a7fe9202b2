use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use index_advisor::batch::BatchAnalyzer;
use index_advisor::config::{AdvisorConfig, CliConfig};
use index_advisor::ddl;
use index_advisor::gateway::{pool::PoolConfig, Gateway};

/// index_advisor - automated index recommendations for PostgreSQL
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Database port
    #[arg(long, default_value_t = 5432)]
    port: u16,

    /// Database name
    #[arg(long)]
    database: String,

    /// Database user
    #[arg(long)]
    user: String,

    /// Database password
    #[arg(long, default_value = "")]
    password: String,

    /// Minimum pooled connections
    #[arg(long, default_value_t = 2)]
    pool_min: usize,

    /// Maximum pooled connections
    #[arg(long, default_value_t = 10)]
    pool_max: usize,

    /// Statement timeout applied to every gateway round-trip, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    statement_timeout_ms: u64,

    /// Bounded worker pool size for the batch analyzer
    #[arg(long, default_value_t = 10)]
    workers: usize,

    /// Minimum call count for a query pulled from pg_stat_statements
    #[arg(long, default_value_t = 10)]
    min_calls: i64,

    /// Minimum mean execution time (ms) for a query pulled from pg_stat_statements
    #[arg(long, default_value_t = 100.0)]
    min_mean_ms: f64,

    /// Analyze a single query instead of pulling from pg_stat_statements
    #[arg(long)]
    query: Option<String>,

    /// Number of candidate queries to pull from pg_stat_statements
    #[arg(long, default_value_t = 50)]
    limit: i64,
}

impl From<Cli> for CliConfig {
    fn from(cli: Cli) -> Self {
        CliConfig {
            host: cli.host,
            port: cli.port,
            database: cli.database,
            user: cli.user,
            password: cli.password,
            pool_min: cli.pool_min,
            pool_max: cli.pool_max,
            statement_timeout_ms: cli.statement_timeout_ms,
            workers: cli.workers,
            min_calls: cli.min_calls,
            min_mean_ms: cli.min_mean_ms,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenvy::dotenv().ok();

    println!("\nindex_advisor v{}\n", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let query = cli.query.clone();
    let limit = cli.limit;
    let cli_config: CliConfig = cli.into();

    let config = match AdvisorConfig::from_cli(cli_config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config, query, limit).await {
        eprintln!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: AdvisorConfig, query: Option<String>, limit: i64) -> anyhow::Result<()> {
    let pool_config = PoolConfig {
        host: config.host.clone(),
        port: config.port,
        database: config.database.clone(),
        user: config.user.clone(),
        password: config.password.clone(),
        pool_min: config.pool_min,
        pool_max: config.pool_max,
    };

    let gateway = Arc::new(
        Gateway::connect(pool_config, Duration::from_millis(config.statement_timeout_ms)).await?,
    );
    let analyzer = BatchAnalyzer::new(gateway, config.workers);

    if let Some(sql) = query {
        let result = analyzer.analyse_one(&sql).await?;
        println!("detected {} scan(s)", result.scans.len());
        for proposal in &result.proposals {
            println!("  {}", ddl::render(proposal));
            if let Some(warning) = &proposal.warning {
                println!("    warning: {}", warning);
            }
        }
        return Ok(());
    }

    let progress = |completed: usize, total: usize| {
        log::info!("analyzed {}/{} queries", completed, total);
    };

    let mut report = analyzer
        .analyse_from_query_stats(config.min_calls, config.min_mean_ms, limit, Some(progress))
        .await?;
    report.generated_at = Some(chrono::Utc::now());

    println!("{}", report.get_summary());
    for proposal in &report.top_proposals {
        println!("  {}", ddl::render(proposal));
    }

    Ok(())
}
