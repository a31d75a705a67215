use std::io::{self, Write};

use anyhow::{Context, Result};
use chrono::Local;
use sessionguard_core::{AuthClient, ClientError, Config, SessionEvent};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{error, warn};

pub async fn login(client: &AuthClient, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| std::env::var("SESSIONGUARD_EMAIL").ok()) {
        Some(email) => email,
        None => prompt_email(config.last_email.as_deref())?,
    };
    let password = match std::env::var("SESSIONGUARD_PASSWORD") {
        Ok(password) if !password.is_empty() => password,
        _ => prompt_password()?,
    };

    println!("\nAuthenticating...");

    match client.login(&email, &password).await {
        Ok(user) => {
            if let Err(e) = config.remember_email(&email) {
                warn!(error = %e, "Failed to save config");
            }
            println!("Logged in as {}", user.display_name());
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Login failed");
            // Provide user-friendly error messages based on error type
            let message = match e {
                ClientError::AuthFailed(msg) => msg,
                ClientError::Network(_) => {
                    "Unable to connect to server. Check your internet connection.".to_string()
                }
                other => format!("Login failed: {}", other),
            };
            Err(anyhow::anyhow!(message))
        }
    }
}

pub async fn whoami(client: &AuthClient, as_json: bool) -> Result<()> {
    if !client.is_authenticated().await {
        println!("Not logged in. Run `sessionguard login` first.");
        return Ok(());
    }

    let mut events = client.subscribe();
    let result = client.user_details().await;
    let expired = report_expiry(client, &mut events);

    let user = match result {
        Ok(user) => user,
        Err(e) if e.is_auth_error() => {
            if !expired {
                eprintln!("{}", e);
            }
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to fetch user details"),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&user)?);
        return Ok(());
    }

    println!("{}", user.display_name());
    if let Some(ref email) = user.email {
        println!("  email: {}", email);
    }
    if let Some(ref role) = user.role {
        println!("  role:  {}", role);
    }
    if client.renewal_cycles() > 0 {
        println!("  (access credential was renewed)");
    }
    Ok(())
}

pub async fn status(client: &AuthClient, config: &Config) -> Result<()> {
    println!("API:     {}", config.base_url);
    println!("Storage: {:?}", config.storage);

    match client.session().await {
        Some(session) => {
            let established = session.established_at.with_timezone(&Local);
            println!("Session: active since {}", established.format("%Y-%m-%d %H:%M"));
            println!(
                "         access credential issued {} min ago",
                session.minutes_since_issue()
            );
            println!(
                "         {}",
                if session.can_renew() {
                    "renewable"
                } else {
                    "not renewable (no refresh credential)"
                }
            );
        }
        None => println!("Session: none"),
    }
    Ok(())
}

pub async fn logout(client: &AuthClient) -> Result<()> {
    if !client.is_authenticated().await {
        println!("Not logged in.");
        return Ok(());
    }
    client.logout().await;
    println!("Logged out.");
    Ok(())
}

/// Tell the user when the session had to be dropped during this command.
/// Returns whether an expiry was reported.
fn report_expiry(client: &AuthClient, events: &mut broadcast::Receiver<SessionEvent>) -> bool {
    let mut expired = false;
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Expired { reason }) => {
                eprintln!("Session expired ({}). Run `sessionguard login` to sign in again.", reason);
                client.acknowledge_expiry();
                expired = true;
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    expired
}

fn prompt_email(last_email: Option<&str>) -> Result<String> {
    match last_email {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    match (input.is_empty(), last_email) {
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => Err(anyhow::anyhow!("Email required")),
        (false, _) => Ok(input.to_string()),
    }
}

fn prompt_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}
