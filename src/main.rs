//! fleetgate - session and page access server for fleet administration.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use fleetgate::access::normalize_path;
use fleetgate::auth::model::{NewAccount, Role};
use fleetgate::auth::{AuthGateway, RemoteBackend, SessionCache, SessionPolicy};
use fleetgate::clock::SystemClock;
use fleetgate::store::FleetStore;
use fleetgate::{gateway, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway
    Serve,

    /// Print the JSON schema of the config file
    ConfigSchema,

    /// Inspect or edit the page access matrix
    #[command(subcommand)]
    Pages(PageCommands),

    /// Account administration against the local database
    #[command(subcommand)]
    User(UserCommands),

    /// Sign in to a running gateway and watch the session
    Login {
        #[arg(long)]
        email: Option<String>,
    },

    /// Sign out the session held by `login`
    Logout,
}

#[derive(Subcommand, Debug)]
enum PageCommands {
    /// List pages, optionally only those open to a role
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        role: Option<Role>,
    },

    /// Allow (or with --deny, revoke) a role on a page
    Grant {
        path: String,
        role: Role,
        #[arg(long)]
        deny: bool,
    },

    /// Enable or disable a page for every role
    SetActive {
        path: String,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    /// Create an account with an explicit role (prompts for the password)
    Add {
        email: String,
        #[arg(long, default_value = "driver")]
        role: Role,
        #[arg(long, default_value = "")]
        name: String,
    },

    /// Activate or deactivate an account; deactivation ends its session
    SetActive {
        email: String,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },

    /// Issue a password reset token and print it for hand delivery
    ResetToken { email: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fleetgate=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            let store = Arc::new(open_store(&config)?);
            gateway::run_gateway(&config, store).await
        }
        Commands::ConfigSchema => {
            println!("{}", Config::json_schema()?);
            Ok(())
        }
        Commands::Pages(command) => run_pages(&config, command),
        Commands::User(command) => run_user(&config, command),
        Commands::Login { email } => login(&config, email).await,
        Commands::Logout => logout(&config).await,
    }
}

fn open_store(config: &Config) -> Result<FleetStore> {
    let path = config.database_path();
    let store = FleetStore::open(&path, Arc::new(SystemClock))
        .with_context(|| format!("Failed to open database {}", path.display()))?
        .with_reset_token_ttl(config.auth.reset_token_ttl_secs);
    store.seed_default_pages()?;
    Ok(store)
}

fn run_pages(config: &Config, command: PageCommands) -> Result<()> {
    let store = open_store(config)?;
    match command {
        PageCommands::List { role } => {
            let pages = match role {
                Some(role) => store.accessible_pages(role)?,
                None => store.list_pages()?,
            };
            for page in pages {
                let roles: Vec<&str> = page.allowed_roles.iter().map(|r| r.as_str()).collect();
                println!(
                    "{:<28} {:<24} {:<8} {}",
                    page.path,
                    page.page_name,
                    if page.is_active { "active" } else { "inactive" },
                    roles.join(",")
                );
            }
        }
        PageCommands::Grant { path, role, deny } => {
            let path = normalize_path(&path)?;
            if !store.set_role_access(Role::Admin, &path, role, !deny)? {
                return Err(anyhow!("No page registered at {path}"));
            }
            println!("{role} {} {path}", if deny { "denied" } else { "allowed" });
        }
        PageCommands::SetActive { path, active } => {
            let path = normalize_path(&path)?;
            if !store.set_page_active(Role::Admin, &path, active)? {
                return Err(anyhow!("No page registered at {path}"));
            }
            println!("{path} {}", if active { "enabled" } else { "disabled" });
        }
    }
    Ok(())
}

fn run_user(config: &Config, command: UserCommands) -> Result<()> {
    let store = open_store(config)?;
    match command {
        UserCommands::Add { email, role, name } => {
            let password = Password::new()
                .with_prompt("Password")
                .with_confirmation("Repeat password", "Passwords do not match")
                .interact()?;
            let user = store.create_account(&NewAccount {
                email,
                password,
                full_name: name,
                role,
                is_active: true,
            })?;
            println!("Created {} ({}) id={}", user.email, user.role, user.id);
        }
        UserCommands::SetActive { email, active } => {
            let user = store
                .get_user_by_email(&email)?
                .ok_or_else(|| anyhow!("No account for {email}"))?;
            store.set_user_active(&user.id, active)?;
            println!("{} {}", user.email, if active { "activated" } else { "deactivated" });
        }
        UserCommands::ResetToken { email } => {
            let issued = store.request_password_reset(&email)?;
            let (Some(token), Some(user_id)) = (issued.token, issued.user_id) else {
                return Err(anyhow!("No active account for {email}"));
            };
            println!("Reset token for {email} (id={user_id}): {token}");
        }
    }
    Ok(())
}

fn client_gateway(config: &Config) -> Result<AuthGateway> {
    let backend = RemoteBackend::from_config(&config.client)?;
    let cache = SessionCache::persistent(&config.session_cache_path());
    Ok(AuthGateway::new(
        Arc::new(backend),
        Arc::new(cache),
        Arc::new(SystemClock),
        SessionPolicy::from_config(&config.session),
    ))
}

async fn login(config: &Config, email: Option<String>) -> Result<()> {
    let gateway = client_gateway(config)?;

    let user = match gateway.get_session().await {
        Ok(user) => user,
        Err(_) => {
            let email = match email {
                Some(email) => email,
                None => Input::<String>::new().with_prompt("Email").interact_text()?,
            };
            let password = Password::new().with_prompt("Password").interact()?;
            gateway
                .sign_in(&email, &password)
                .await
                .map_err(|e| anyhow!(e.user_message()))?
        }
    };
    println!("Signed in as {} <{}> ({})", user.full_name, user.email, user.role);
    if let Some(expires) = gateway
        .local_session()
        .and_then(|s| chrono::DateTime::from_timestamp(s.expires_at, 0))
    {
        println!("Session valid until {}", expires.with_timezone(&chrono::Local).to_rfc2822());
    }

    match gateway.accessible_pages().await {
        Ok(pages) => {
            for page in pages {
                println!("  {:<28} {}", page.path, page.page_name);
            }
        }
        Err(e) => tracing::warn!(error = %e, "Could not load page list"),
    }

    println!("Watching session. Press Ctrl-C to sign out.");
    let mut events = gateway.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", event.as_error().user_message());
                    return Ok(());
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = gateway.sign_out().await {
        tracing::warn!(error = %e, "Server did not confirm sign-out; local session discarded");
    }
    println!("Signed out");
    Ok(())
}

async fn logout(config: &Config) -> Result<()> {
    let gateway = client_gateway(config)?;
    if gateway.local_session().is_none() {
        println!("Not signed in");
        return Ok(());
    }
    if let Err(e) = gateway.sign_out().await {
        tracing::warn!(error = %e, "Server did not confirm sign-out; local session discarded");
    }
    println!("Signed out");
    Ok(())
}
