use anyhow::Result;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mailvault::config::{self, AccountConfig, Settings};
use mailvault::constants;
use mailvault::credentials::CredentialStore;
use mailvault::pipeline;
use mailvault::progress::TracingProgressSink;
use mailvault::ratelimit::RateLimitCoordinator;
use mailvault::scheduler::{RunCoalescer, next_fire};
use mailvault::verify;

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailvault=debug"));

    let log_file = Settings::config_dir()
        .ok()
        .map(|dir| dir.join("mailvault.log"))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"mailvault - incremental IMAP mailbox backup engine

Usage: mailvault <command> [args]

Commands:
    backup [account-id]     Run one backup pass (all enabled accounts, or one)
    verify [account-id]     Compare local store against the server
    repair [account-id]     Verify and download/prune divergences
    schedule                Run the recurrence loop until interrupted (Ctrl-C)
    setup                   Configure an account and store its credentials
    help                    Show this help message

Configuration file: ~/.config/mailvault/settings.toml
"#
    );
}

fn accounts_to_run<'a>(settings: &'a Settings, selector: Option<&str>) -> Vec<&'a AccountConfig> {
    match selector {
        Some(id) => settings.account(id).into_iter().collect(),
        None => settings.enabled_accounts().collect(),
    }
}

async fn run_backup(selector: Option<&str>) -> Result<()> {
    setup_logging();
    let mut settings = Settings::load()?;
    settings.ensure_dirs()?;

    let rate_limit = Arc::new(RateLimitCoordinator::new());
    let progress = TracingProgressSink;
    let cancel = CancellationToken::new();

    let account_ids: Vec<String> = accounts_to_run(&settings, selector)
        .into_iter()
        .map(|a| a.id.clone())
        .collect();

    if account_ids.is_empty() {
        anyhow::bail!("no matching enabled accounts found");
    }

    for id in account_ids {
        let account = settings.account(&id).expect("account looked up by its own id").clone();
        let entry = pipeline::run_account(&account, &settings, rate_limit.clone(), &progress, cancel.clone()).await;
        settings.push_history(entry);
    }

    settings.save()?;
    Ok(())
}

async fn run_verify(selector: Option<&str>, repair: bool) -> Result<()> {
    setup_logging();
    let settings = Settings::load()?;
    settings.ensure_dirs()?;

    let rate_limit = Arc::new(RateLimitCoordinator::new());
    let cancel = CancellationToken::new();

    let accounts: Vec<AccountConfig> = accounts_to_run(&settings, selector)
        .into_iter()
        .cloned()
        .collect();

    if accounts.is_empty() {
        anyhow::bail!("no matching enabled accounts found");
    }

    for account in accounts {
        let reports = verify::verify_account(&account, &settings, rate_limit.clone(), cancel.clone(), repair).await?;
        for report in reports {
            println!(
                "{}/{}: missing_locally={} deleted_on_server={} repaired={} pruned={}",
                account.id,
                report.folder,
                report.missing_locally.len(),
                report.deleted_on_server.len(),
                report.repaired,
                report.pruned
            );
        }
    }

    Ok(())
}

async fn run_schedule() -> Result<()> {
    setup_logging();
    let coalescer = Arc::new(RunCoalescer::new());
    let rate_limit = Arc::new(RateLimitCoordinator::new());
    let progress = TracingProgressSink;

    loop {
        let mut settings = Settings::load()?;
        settings.ensure_dirs()?;

        let now = chrono::Utc::now();
        let fire_at = next_fire(&settings.schedule.mode, now, settings.schedule.anchor);

        let Some(fire_at) = fire_at else {
            tracing::info!("schedule mode is manual; exiting the schedule loop");
            return Ok(());
        };

        let wait = (fire_at - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt, stopping schedule loop");
                return Ok(());
            }
        }

        for account in settings.enabled_accounts().cloned().collect::<Vec<_>>() {
            if !coalescer.try_start(&account.id) {
                tracing::warn!(account = %account.id, "previous run still in flight, skipping this fire");
                continue;
            }
            let cancel = CancellationToken::new();
            let entry = pipeline::run_account(&account, &settings, rate_limit.clone(), &progress, cancel).await;
            settings.push_history(entry);
            coalescer.finish(&account.id);
        }
        settings.save()?;
    }
}

async fn run_setup() -> Result<()> {
    use std::io::{self, Write};

    println!("Mailvault Setup");
    println!("===============\n");

    let config_path = Settings::config_path()?;
    let mut settings = if config_path.exists() {
        Settings::load()?
    } else {
        Settings {
            accounts: vec![],
            backup_root: dirs::home_dir()
                .unwrap_or_else(|| ".".into())
                .join("mail-backup"),
            schedule: config::ScheduleConfig::default(),
            global_rate_limit: config::RateLimitPreset::default(),
            retention: config::RetentionPolicy::default(),
            stream_threshold_bytes: constants::DEFAULT_STREAM_THRESHOLD_BYTES,
            history: vec![],
            history_retention: constants::DEFAULT_HISTORY_RETENTION,
        }
    };

    print!("Account id (short, unique): ");
    io::stdout().flush()?;
    let mut id = String::new();
    io::stdin().read_line(&mut id)?;
    let id = id.trim().to_string();

    print!("Email address: ");
    io::stdout().flush()?;
    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    let email = email.trim().to_string();

    print!("IMAP server: ");
    io::stdout().flush()?;
    let mut host = String::new();
    io::stdin().read_line(&mut host)?;
    let host = host.trim().to_string();

    print!("Password: ");
    io::stdout().flush()?;
    let password = rpassword_read()?;
    println!();

    let account = AccountConfig {
        id: id.clone(),
        email,
        host,
        port: constants::DEFAULT_IMAP_PORT,
        tls: true,
        login: None,
        auth: config::AuthMethod::Password,
        enabled: true,
        last_run: None,
        rate_limit: None,
    };

    settings.accounts.retain(|a| a.id != id);
    settings.accounts.push(account);
    settings.ensure_dirs()?;
    settings.save()?;
    println!("Configuration saved to {}", config_path.display());

    let creds = CredentialStore::new(&id);
    creds.set_password(&password)?;
    if creds.has_password() {
        println!("Password stored successfully.");
    } else {
        eprintln!("Warning: failed to store credentials.");
        return Err(anyhow::anyhow!("credential storage failed"));
    }

    println!("\nSetup complete! Run 'mailvault backup {id}' to start.");
    Ok(())
}

fn rpassword_read() -> Result<String> {
    use std::io;

    let _guard = DisableEcho::new()?;
    let mut password = String::new();
    io::stdin().read_line(&mut password)?;
    Ok(password.trim().to_string())
}

struct DisableEcho {
    #[cfg(unix)]
    original: libc::termios,
}

impl DisableEcho {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use std::mem::MaybeUninit;
        use std::os::unix::io::AsRawFd;

        let fd = std::io::stdin().as_raw_fd();
        let mut termios = MaybeUninit::<libc::termios>::uninit();

        unsafe {
            if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
                anyhow::bail!("failed to get terminal attributes");
            }
            let original = termios.assume_init();
            let mut new = original;
            new.c_lflag &= !libc::ECHO;
            if libc::tcsetattr(fd, libc::TCSANOW, &new) != 0 {
                anyhow::bail!("failed to set terminal attributes");
            }
            Ok(Self { original })
        }
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }
}

#[cfg(unix)]
impl Drop for DisableEcho {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = std::io::stdin().as_raw_fd();
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &self.original);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") | None => {
            print_usage();
            Ok(())
        }
        Some("setup") => run_setup().await,
        Some("backup") => run_backup(args.get(2).map(|s| s.as_str())).await,
        Some("verify") => run_verify(args.get(2).map(|s| s.as_str()), false).await,
        Some("repair") => run_verify(args.get(2).map(|s| s.as_str()), true).await,
        Some("schedule") => run_schedule().await,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}");
            print_usage();
            std::process::exit(1);
        }
    }
}
