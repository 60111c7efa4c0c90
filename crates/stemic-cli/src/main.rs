//! STEMIC CLI - sign in to STEMIC and keep the session alive from a terminal.
//!
//! The session lives in the cache directory, so `stemic status` after a
//! `stemic login` in another shell sees the same user.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use stemic_core::auth::{CredentialStore, FileTokenStore, ProfileCache, TokenStore};
use stemic_core::notify::{Navigator, Notifier};
use stemic_core::{ApiClient, Config, SessionManager};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: stemic <command>

Commands:
  status                          Show who is signed in
  login [email]                   Sign in with email and password
  login-token <access> [refresh]  Adopt tokens issued elsewhere (e.g. Google sign-in)
  refresh                         Exchange the refresh token for a new access token
  logout                          Forget the session
  watch                           Keep the session fresh until Ctrl-C";

/// Prints user-visible session notices to the terminal
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "\n{}", message)?;
        Ok(())
    }
}

/// A terminal cannot navigate, so point the user at the login command
struct LoginHint;

impl Navigator for LoginHint {
    fn redirect_to_login(&self) {
        eprintln!("Run `stemic login` to start a new session.");
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        }
    };
    if let Ok(url) = std::env::var("STEMIC_API_URL") {
        config.api_base_url = url;
    }

    let api = ApiClient::new(&config.api_base_url)?;
    let store = FileTokenStore::open(&config.cache_dir()?)?;
    let session = SessionManager::builder(Arc::new(store), Arc::new(api.clone()))
        .notifier(Arc::new(ConsoleNotifier))
        .navigator(Arc::new(LoginHint))
        .settings(config.session_settings())
        .build();

    session.initialize().await;

    let result = match command {
        "status" => status(&session),
        "login" => login(&session, &api, &mut config, args.get(1).cloned()).await,
        "login-token" => {
            let access = args.get(1).context("login-token needs an access token")?;
            adopt_tokens(&session, &api, access, args.get(2).map(String::as_str)).await
        }
        "refresh" => refresh(&session).await,
        "logout" => {
            session.logout();
            println!("Signed out.");
            Ok(())
        }
        "watch" => watch(&session).await,
        other => {
            println!("{}", USAGE);
            bail!("Unknown command: {}", other)
        }
    };

    session.dispose();
    result
}

fn status(session: &SessionManager) -> Result<()> {
    let state = session.state();
    let Some(claims) = state.claims.as_ref().filter(|_| state.is_authenticated()) else {
        println!("Not signed in.");
        return Ok(());
    };

    let profile = ProfileCache::new(session.store()).load().unwrap_or_default();
    let who = profile
        .as_ref()
        .map(|p| p.display_name().to_string())
        .or_else(|| claims.email.clone())
        .unwrap_or_else(|| claims.sub.clone());

    println!("Signed in as {} ({})", who, claims.role);
    println!(
        "Token expires {} ({} min left)",
        claims.expires_at().with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
        claims.minutes_until_expiry()
    );
    if session.check_expiry_soon() {
        println!("Token expires soon; it will be refreshed by `stemic watch` or `stemic refresh`.");
    }
    Ok(())
}

async fn login(
    session: &SessionManager,
    api: &ApiClient,
    config: &mut Config,
    email: Option<String>,
) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    if email.is_empty() {
        bail!("Email required");
    }

    let remembered = ProfileCache::new(session.store()).remember_me().unwrap_or(false)
        && CredentialStore::has_credentials(&email);
    let password = if remembered {
        CredentialStore::get_password(&email)?
    } else {
        rpassword::prompt_password("Password: ")?
    };

    println!("Signing in...");
    let pair = api.login(&email, &password).await.context("Login failed")?;
    let claims = session.login(&pair.access_token, pair.refresh_token.as_deref())?;

    cache_profile(session.store(), api, &pair.access_token, pair.user).await;

    if !remembered {
        let answer = prompt("Remember password on this device? [y/N]: ")?;
        let remember = answer.eq_ignore_ascii_case("y");
        if remember {
            if let Err(e) = CredentialStore::store(&email, &password) {
                warn!(error = %e, "Failed to store credentials");
            }
        } else if let Err(e) = CredentialStore::delete(&email) {
            warn!(error = %e, "Failed to forget stored credentials");
        }
        ProfileCache::new(session.store()).set_remember_me(remember)?;
    }

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    info!(role = %claims.role, "Login successful");
    println!("Signed in as {}.", claims.role);
    Ok(())
}

async fn adopt_tokens(
    session: &SessionManager,
    api: &ApiClient,
    access_token: &str,
    refresh_token: Option<&str>,
) -> Result<()> {
    let claims = session.login(access_token, refresh_token)?;
    cache_profile(session.store(), api, access_token, None).await;
    println!("Signed in as {}.", claims.role);
    Ok(())
}

async fn refresh(session: &SessionManager) -> Result<()> {
    let claims = session.refresh().await?;
    println!("Token refreshed; {} min left.", claims.minutes_until_expiry());
    Ok(())
}

async fn watch(session: &SessionManager) -> Result<()> {
    if !session.is_authenticated() {
        bail!("Not signed in");
    }

    println!(
        "Keeping the session fresh (checking every {}s). Press Ctrl-C to stop.",
        session.settings().check_interval.as_secs()
    );
    let mut changes = session.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() || !changes.borrow_and_update().is_authenticated() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Best effort: the session works without a cached profile
async fn cache_profile(
    store: &dyn TokenStore,
    api: &ApiClient,
    token: &str,
    embedded: Option<stemic_core::models::UserProfile>,
) {
    let profile = match embedded {
        Some(profile) => Some(profile),
        None => match api.fetch_current_user(token).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(error = %e, "Failed to fetch user profile");
                None
            }
        },
    };
    if let Some(profile) = profile {
        if let Err(e) = ProfileCache::new(store).save(&profile) {
            warn!(error = %e, "Failed to cache user profile");
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
