use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use kpulse_metrics::RevenueQuery;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "kpulse-cli")]
#[command(about = "kpulse revenue metrics command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compute (or serve from cache) the revenue metric and print it as JSON.
    Revenue(RevenueArgs),
    /// List pipelines, stages and users of the configured account.
    Options {
        #[arg(long, default_value = "cli")]
        user: String,
    },
    Serve,
}

#[derive(Debug, Args)]
struct RevenueArgs {
    #[arg(long, default_value = "cli")]
    user: String,
    /// today, 7d, 30d, quarter or custom
    #[arg(long)]
    range: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    /// Comma separated pipeline ids
    #[arg(long)]
    pipelines: Option<String>,
    /// Comma separated responsible user ids
    #[arg(long)]
    users: Option<String>,
    /// all, won, lost or comma separated status ids
    #[arg(long)]
    stage: Option<String>,
    #[arg(long)]
    force: bool,
}

impl RevenueArgs {
    fn query(&self) -> RevenueQuery {
        RevenueQuery {
            range: self.range.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            pipelines: self.pipelines.clone(),
            users: self.users.clone(),
            stage: self.stage.clone(),
            force: self.force.then(|| "1".to_string()),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("KPULSE_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let initialized = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(err) = initialized {
        eprintln!("tracing already initialized: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Revenue(args) => {
            let orchestrator = kpulse_metrics::orchestrator_from_env().await?;
            let response = orchestrator.handle_query(&args.user, &args.query()).await?;
            tracing::info!(
                total = response.data.total,
                hit = response.cache.hit,
                "revenue ready"
            );
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Options { user } => {
            let orchestrator = kpulse_metrics::orchestrator_from_env().await?;
            let options = orchestrator.load_options(&user).await?;
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
        Commands::Serve => {
            kpulse_web::serve_from_env().await?;
        }
    }

    Ok(())
}
