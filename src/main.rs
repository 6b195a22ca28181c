//! bankdata - bank account data sync CLI
//!
//! Thin command-line host around the sync core: it owns the timer, the
//! callback hand-off and printing, nothing else.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bankdata_sync::config::Config;
use bankdata_sync::models::{AuthState, Category, Snapshot};
use bankdata_sync::Coordinator;

#[derive(Parser)]
#[command(name = "bankdata")]
#[command(about = "Sync bank account data within provider rate limits", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Exchange API secrets for a token pair
    Login {
        /// Request a new token pair even if the stored one is valid
        #[arg(short, long)]
        force: bool,

        #[arg(long, env = "GC_SECRET_ID", hide_env_values = true)]
        secret_id: Option<String>,

        #[arg(long, env = "GC_SECRET_KEY", hide_env_values = true)]
        secret_key: Option<String>,

        /// Write the secrets to the config file after a successful login
        #[arg(long)]
        save: bool,
    },

    /// Forget stored tokens
    Logout,

    /// Show authentication, link and budget status
    Status,

    /// List institutions available in a country
    Institutions {
        /// ISO 3166 two-letter country code
        #[arg(short, long)]
        country: String,
    },

    /// Start linking a bank; prints the URL to authorize at
    Link {
        #[arg(short, long)]
        country: String,

        /// Institution id (from `institutions` output)
        #[arg(short, long)]
        institution: String,
    },

    /// Complete a link after the bank redirected back
    Callback {
        /// Link id or the reference from the redirect URL
        id: String,
    },

    /// Delete a link and forget its accounts
    Unlink {
        /// Link id (from `status` output)
        id: String,
    },

    /// Run one sync cycle and print the snapshot as JSON
    Refresh {
        /// Print immediately instead of waiting for scheduled fetches
        #[arg(long)]
        no_wait: bool,
    },

    /// Run sync cycles on a timer until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load()?;
    let coordinator = Coordinator::open(&config)?;

    match cli.command {
        Commands::Login {
            force,
            secret_id,
            secret_key,
            save,
        } => {
            login(&coordinator, config, force, save, secret_id, secret_key).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            coordinator.logout()?;
            println!("Logged out.");
        }
        Commands::Status => {
            match coordinator.tokens() {
                Some(pair) => {
                    println!("Access tok:  expires {}", pair.access.expires_at);
                    println!("Refresh tok: expires {}", pair.refresh.expires_at);
                }
                None => println!("Tokens:      none"),
            }
            print_status(&coordinator.snapshot());
        }
        Commands::Institutions { country } => {
            let institutions = coordinator
                .institutions(&country)
                .await
                .context("Failed to list institutions")?;
            for institution in institutions {
                println!(
                    "{:<40} {}{}",
                    institution.id,
                    institution.name,
                    institution
                        .bic
                        .map(|bic| format!(" ({})", bic))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Link {
            country,
            institution,
        } => {
            let url = coordinator
                .begin_link(&country, &institution)
                .await
                .context("Failed to create link")?;
            println!("Authorize access at:\n  {}", url);
            println!("Then run `bankdata callback <link id or reference>`.");
        }
        Commands::Callback { id } => {
            let status = coordinator
                .complete_link_callback(&id)
                .await
                .context("Failed to complete link")?;
            println!("Link status: {:?}", status);
            coordinator.wait_idle().await;
        }
        Commands::Unlink { id } => {
            coordinator.unlink(&id).await.context("Failed to unlink")?;
            println!("Unlinked {}.", id);
        }
        Commands::Refresh { no_wait } => {
            let mut snapshot = coordinator.refresh().await;
            if no_wait {
                coordinator.shutdown();
            } else {
                coordinator.wait_idle().await;
                snapshot = coordinator.snapshot();
            }
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Run => {
            run(&coordinator, &config).await;
        }
    }

    Ok(())
}

async fn login(
    coordinator: &Coordinator,
    mut config: Config,
    force: bool,
    save: bool,
    secret_id: Option<String>,
    secret_key: Option<String>,
) -> Result<()> {
    if !force && coordinator.auth_state() == AuthState::Valid {
        println!("Already logged in (refresh token valid). Use --force to request new tokens.");
        return Ok(());
    }

    let Some(credentials) = config.credentials(secret_id, secret_key) else {
        bail!("No API secrets: pass --secret-id/--secret-key or set GC_SECRET_ID/GC_SECRET_KEY");
    };

    tracing::info!("Starting authentication...");
    let pair = coordinator
        .bootstrap(&credentials.secret_id, &credentials.secret_key)
        .await
        .context("Login failed")?;
    println!("Logged in.");
    println!("  access expires:  {}", pair.access.expires_at);
    println!("  refresh expires: {}", pair.refresh.expires_at);

    if save {
        config.remember_credentials(&credentials);
        let path = config.save().context("Failed to save config")?;
        println!("Secrets saved to {}", path.display());
    }
    Ok(())
}

async fn run(coordinator: &Coordinator, config: &Config) {
    let period = config.refresh_interval();
    tracing::info!("Refreshing every {}s, Ctrl+C to stop", period.as_secs());
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = coordinator.refresh().await;
                tracing::info!(
                    "Cycle done: {} links, {} accounts, {} cycle errors",
                    snapshot.links.len(),
                    snapshot.accounts.len(),
                    snapshot.errors.len()
                );
                if snapshot.auth == AuthState::NeedsReauthentication {
                    tracing::warn!("Re-authentication required: run `bankdata login --force`");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping");
                break;
            }
        }
    }

    coordinator.shutdown();
}

fn print_status(snapshot: &Snapshot) {
    let auth = match snapshot.auth {
        AuthState::Valid => "valid",
        AuthState::NeedsReauthentication => "needs re-authentication",
        AuthState::Unknown => "unknown",
    };
    println!("Auth:        {}", auth);

    if snapshot.links.is_empty() {
        println!("Links:       none");
    }
    for view in &snapshot.links {
        println!(
            "Link {}  {:?}  {}  ({} accounts)",
            view.link.id,
            view.link.status,
            view.link.institution_id,
            view.link.account_ids.len()
        );
        if let Some(error) = &view.error {
            println!("  error: {}", error);
        }
    }

    for (account_id, view) in &snapshot.accounts {
        match &view.institution_name {
            Some(name) => println!("Account {}  ({})", account_id, name),
            None => println!("Account {}", account_id),
        }
        for category in Category::ALL {
            let Some(category_view) = view.categories.get(&category) else {
                continue;
            };
            let fetched = category_view
                .cached
                .as_ref()
                .map(|cached| cached.fetched_at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            let budget = category_view
                .budget
                .map(|budget| format!("{}/{} used", budget.used, budget.limit))
                .unwrap_or_else(|| "unused".to_string());
            println!("  {:<13} fetched {}  budget {}", category, fetched, budget);
            if let Some(error) = &category_view.error {
                println!("    error: {}", error);
            }
        }
    }
}
