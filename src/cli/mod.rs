//! Command-line interface
//!
//! A small demonstration binary that fetches a URL through the executor,
//! exercising token exchange and backoff retry end to end.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::auth::UserAccount;
use crate::error::{ExecutorError, Result};
use crate::network::NetworkExecutor;

#[derive(Parser)]
#[command(name = "library-api-executor")]
#[command(about = "Fetch a library-content API resource with automatic token refresh")]
#[command(version, author)]
pub struct Args {
    /// URL of the resource to fetch
    #[arg(help = "URL of the resource to GET")]
    pub url: String,

    /// Account username
    #[arg(long = "username", short = 'u', help = "Username for token exchange")]
    pub username: Option<String>,

    /// Account password
    #[arg(long = "password", short = 'p', help = "Password for token exchange")]
    pub password: Option<String>,

    /// Token-exchange endpoint
    #[arg(
        long = "token-url",
        help = "Token-exchange endpoint; enables bearer authentication"
    )]
    pub token_url: Option<String>,

    /// Do not attach a bearer token even when one is available
    #[arg(long = "no-token", default_value = "false")]
    pub no_token: bool,

    /// Retry attempts for transient network failures
    #[arg(long = "max-attempts", short = 'a', default_value = "3")]
    pub max_attempts: u32,

    /// Timeout in seconds for network operations
    #[arg(long = "timeout", short = 't', default_value = "30")]
    pub timeout: u64,
}

pub async fn run(args: Args) -> Result<()> {
    let url = Url::parse(&args.url)?;

    let account = UserAccount::new();
    if let Some(token_url) = &args.token_url {
        account.set_token_url(Url::parse(token_url)?);
    }
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        account.set_credentials(username.clone(), password.clone());
    }

    let executor = NetworkExecutor::builder(Arc::new(account))
        .request_timeout(Duration::from_secs(args.timeout))
        .build()?;

    let body = executor
        .get_with_retry(url, args.max_attempts.max(1), !args.no_token)
        .await?;

    std::io::stdout()
        .write_all(&body)
        .map_err(|e| ExecutorError::Configuration(format!("Failed to write output: {}", e)))?;
    Ok(())
}
