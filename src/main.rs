//! oauth-cli entry point

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use oauth_cli::auth::{Authenticator, ProviderId, TokenKind, TokenRecord, TokenStore};
use oauth_cli::browser::ChromeLauncher;
use oauth_cli::config::{self, Environment};
use oauth_cli::prompt::{InquirePrompter, Prompter};
use oauth_cli::ui;

#[derive(Parser)]
#[command(name = "oauth-cli")]
#[command(about = "Capture OAuth2 credentials for AI coding CLIs")]
#[command(version)]
struct Cli {
    /// Provider to authenticate with
    provider: Option<String>,

    /// List supported providers
    #[arg(long)]
    list: bool,

    /// Show stored credentials
    #[arg(long)]
    status: bool,

    /// Remove stored credentials for a provider
    #[arg(long, value_name = "PROVIDER")]
    logout: Option<String>,

    /// Token store location
    #[arg(long, value_name = "PATH")]
    store: Option<PathBuf>,

    /// key=value file merged under the process environment
    #[arg(long, value_name = "PATH", default_value = ".env")]
    env_file: PathBuf,

    /// Config file location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli, Box::new(InquirePrompter)).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            ui::print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

const SUCCESS: u8 = 0;
const FAILURE: u8 = 1;
const INTERRUPTED: u8 = 130;

async fn run(cli: Cli, prompter: Box<dyn Prompter>) -> Result<u8> {
    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut app_config = config::load(&config_path)?;
    if let Some(store) = cli.store {
        app_config.store_path = store;
    }

    if cli.list {
        print_providers();
        return Ok(SUCCESS);
    }

    if cli.status {
        print_status(&TokenStore::new(app_config.store_path.clone()));
        return Ok(SUCCESS);
    }

    if let Some(name) = cli.logout {
        let provider: ProviderId = name.parse()?;
        let store = TokenStore::new(app_config.store_path.clone());
        if store.remove_token(provider.as_str())? {
            ui::print_success(&format!("Removed {} credentials", provider.display_name()));
        } else {
            ui::print_warning(&format!("No stored credentials for {}", provider));
        }
        return Ok(SUCCESS);
    }

    let Some(name) = cli.provider else {
        println!("Usage: oauth-cli <provider>\n");
        print_providers();
        return Ok(FAILURE);
    };
    let provider: ProviderId = name.parse()?;

    let env = Environment::load(&cli.env_file);

    let launcher = Arc::new(ChromeLauncher::new(app_config.browser.clone()));
    let authenticator = Authenticator::new(app_config, env, prompter, launcher);

    tokio::select! {
        result = authenticator.run(provider) => {
            result?;
            Ok(SUCCESS)
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted");
            Ok(INTERRUPTED)
        }
    }
}

fn print_providers() {
    println!("Providers:");
    for provider in ProviderId::all() {
        println!("  {:<12} {}", provider.as_str(), provider.display_name());
    }
}

fn print_status(store: &TokenStore) {
    let tokens = store.load();
    if tokens.is_empty() {
        println!("No stored credentials in {}", store.path().display());
        return;
    }

    println!("Credentials in {}:\n", store.path().display());
    for (provider, record) in &tokens {
        println!("  {:<12} {}", provider, describe(record));
    }
}

fn describe(record: &TokenRecord) -> String {
    let secret = match record.kind {
        TokenKind::ApiKey => record.api_key.as_deref(),
        TokenKind::OAuth2 => record.access_token.as_deref(),
    };
    let masked = secret.map(ui::mask).unwrap_or_else(|| "-".to_string());

    let expiry = match record.expires_at {
        Some(_) if record.is_expired() => "expired".to_string(),
        Some(at) => format!("expires {}", at.format("%Y-%m-%d %H:%M UTC")),
        None => "no expiry".to_string(),
    };

    let kind = match record.kind {
        TokenKind::ApiKey => "api key",
        TokenKind::OAuth2 => "oauth2",
    };

    format!("{:<8} {}  ({})", kind, masked, expiry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oauth_cli::Error;

    /// Answers every prompt with the same text
    struct FixedAnswer(&'static str);

    impl Prompter for FixedAnswer {
        fn ask(&self, _message: &str) -> oauth_cli::Result<String> {
            Ok(self.0.to_string())
        }

        fn ask_secret(&self, _message: &str) -> oauth_cli::Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn cli(dir: &tempfile::TempDir, args: &[&str]) -> Cli {
        let store = dir.path().join("tokens.json");
        let config = dir.path().join("config.json");
        let env_file = dir.path().join(".env");
        let mut argv = vec![
            "oauth-cli".to_string(),
            "--store".to_string(),
            store.display().to_string(),
            "--config".to_string(),
            config.display().to_string(),
            "--env-file".to_string(),
            env_file.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::parse_from(argv)
    }

    #[tokio::test]
    async fn test_no_provider_is_usage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let code = run(cli(&dir, &[]), Box::new(FixedAnswer(""))).await.unwrap();
        assert_eq!(code, FAILURE);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(cli(&dir, &["nope"]), Box::new(FixedAnswer(""))).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnknownProvider(name)) if name == "nope"));
    }

    #[tokio::test]
    async fn test_api_key_provider_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let code = run(cli(&dir, &["openrouter"]), Box::new(FixedAnswer("sk-or-test"))).await.unwrap();
        assert_eq!(code, SUCCESS);

        let record = TokenStore::new(dir.path().join("tokens.json")).get_token("openrouter").unwrap();
        assert_eq!(record.api_key.as_deref(), Some("sk-or-test"));
    }

    #[tokio::test]
    async fn test_empty_api_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(cli(&dir, &["anthropic"]), Box::new(FixedAnswer(""))).await;
        assert!(result.is_err());
        assert!(!dir.path().join("tokens.json").exists());
    }

    #[tokio::test]
    async fn test_logout_and_list_succeed() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(run(cli(&dir, &["--list"]), Box::new(FixedAnswer(""))).await.unwrap(), SUCCESS);
        assert_eq!(run(cli(&dir, &["--status"]), Box::new(FixedAnswer(""))).await.unwrap(), SUCCESS);
        assert_eq!(
            run(cli(&dir, &["--logout", "openai"]), Box::new(FixedAnswer(""))).await.unwrap(),
            SUCCESS
        );
    }

    #[test]
    fn test_describe_masks_secret() {
        let record = TokenRecord::api_key("anthropic", "sk-ant-api03-abcdefgh".to_string());
        let line = describe(&record);
        assert!(line.contains("sk-ant...efgh"));
        assert!(!line.contains("api03"));
        assert!(line.contains("no expiry"));
    }
}
