use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Decision, Identity, RateLimiter, DEFAULT_ROUTE_POLICY};

/// Inspect and exercise a Turnstile rate limiter configuration.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// YAML configuration file, layered under TURNSTILE__* environment variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the policy table
    Policies,
    /// Run checks and print each decision as a JSON line
    Check(CheckArgs),
    /// Run checks and print the limiter stats
    Stats(CheckArgs),
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Named policy to check against
    #[arg(long, conflicts_with = "endpoint")]
    policy: Option<String>,

    /// Request path routed through the endpoint table
    #[arg(long)]
    endpoint: Option<String>,

    /// Client IP, or a forwarded-for list
    #[arg(long)]
    ip: Option<String>,

    /// Authenticated user id
    #[arg(long)]
    user: Option<String>,

    /// Number of checks to run
    #[arg(long, default_value_t = 1)]
    repeat: u32,
}

impl CheckArgs {
    fn identity(&self) -> Identity {
        let identity = match &self.ip {
            Some(ip) => Identity::from_ip(ip.as_str()),
            None => Identity::anonymous(),
        };
        match &self.user {
            Some(user) => identity.with_user(user.as_str()),
            None => identity,
        }
    }

    async fn run(&self, limiter: &RateLimiter) -> anyhow::Result<Vec<Decision>> {
        let identity = &self.identity();
        let checks = (0..self.repeat).map(move |_| async move {
            match &self.endpoint {
                Some(endpoint) => limiter.check_endpoint(endpoint, identity).await,
                None => {
                    let policy = self.policy.as_deref().unwrap_or(DEFAULT_ROUTE_POLICY);
                    limiter.check_typed(policy, identity).await
                }
            }
        });

        let decisions = join_all(checks)
            .await
            .into_iter()
            .collect::<turnstile::error::Result<Vec<_>>>()?;
        Ok(decisions)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    let limiter = RateLimiter::from_config(&config)?;
    info!(
        policies = limiter.policies().len(),
        external_backend = config.backend.url.is_some(),
        "Rate limiter initialized"
    );

    match &cli.command {
        Command::Policies => {
            for policy in limiter.policies().policies() {
                println!("{}", serde_json::to_string(policy)?);
            }
        }
        Command::Check(args) => {
            for decision in args.run(&limiter).await? {
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
        Command::Stats(args) => {
            args.run(&limiter).await?;
            let stats = limiter.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
