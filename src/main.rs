use anyhow::Result;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cmsync::clock::SystemClock;
use cmsync::config::Config;
use cmsync::constants::{CONNECTIVITY_CHECK_SECS, CONNECTIVITY_CHECK_TIMEOUT_SECS};
use cmsync::credentials::CredentialStore;
use cmsync::imap::{Credentials, SessionManager, TcpTlsConnector};
use cmsync::scheduler::Operation;
use cmsync::service::{CmsExecutor, CmsService};
use cmsync::store::LocalStore;
use cmsync::sync::model::SyncScope;

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cmsync=debug"));

    let log_file = Config::config_dir()
        .ok()
        .map(|dir| dir.join("cmsync.log"))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
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
        r#"cmsync - Converged Message Store synchronizer

Usage: cmsync <command>

Commands:
    run             Keep the local store in sync until interrupted
    sync [folder]   Run one synchronization pass, optionally for one folder
    wipe            Clear the local store and download everything again
    login           Store the IMAP password in the OS keyring
    help            Show this help message

Configuration file: ~/.config/cmsync/config.toml
Password lookup: CMSYNC_PASSWORD, then the keyring, then the config directory
"#
    );
}

async fn build_service(config: &Config) -> Result<CmsService> {
    let (password, source) = CredentialStore::new(&config.server.username).get_password()?;
    tracing::debug!("Using password from {:?}", source);

    let connector = Arc::new(TcpTlsConnector::new(
        config.server.host.clone(),
        config.server.port,
        config.server.tls,
    ));
    let sessions = SessionManager::new(
        connector,
        Credentials {
            username: config.server.username.clone(),
            password,
        },
        config.sync.command_timeout(),
    );

    let store = LocalStore::open(&config.store_path()?).await?;
    let executor = CmsExecutor::new(
        Arc::new(store),
        sessions,
        config.sync.clone(),
        Arc::new(SystemClock),
    );
    Ok(CmsService::new(executor))
}

async fn run_daemon(config: Config) -> Result<()> {
    let mut service = build_service(&config).await?;
    service.start();

    if let Some(mut events) = service.subscribe() {
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match &event.outcome {
                    Ok(report) => println!("{} ({:?}): {}", event.operation, event.trigger, report),
                    Err(e) => eprintln!("{} ({:?}) failed: {}", event.operation, event.trigger, e),
                }
            }
        });
    }

    let host = config.server.host.clone();
    let port = config.server.port;
    let check_timeout = Duration::from_secs(CONNECTIVITY_CHECK_TIMEOUT_SECS);
    let mut check_interval = tokio::time::interval(Duration::from_secs(CONNECTIVITY_CHECK_SECS));

    println!("cmsync running against {}:{}. Press Ctrl-C to stop.", host, port);
    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                let available = cmsync::scheduler::connectivity::is_reachable(&host, port, check_timeout).await;
                service.connectivity_changed(available).await;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    service.stop().await;
    Ok(())
}

async fn run_sync(config: Config, folder: Option<String>) -> Result<()> {
    let mut service = build_service(&config).await?;
    let scope = folder.map_or(SyncScope::All, SyncScope::Folder);
    let result = service.run_once(Operation::Sync(scope)).await;
    service.stop().await;

    let report = result?;
    println!("{}", report);
    Ok(())
}

async fn run_wipe(config: Config) -> Result<()> {
    let mut service = build_service(&config).await?;
    let result = service.wipe().await;
    service.stop().await;

    let report = result?;
    println!("Local store rebuilt: {}", report);
    Ok(())
}

fn run_login(config: &Config) -> Result<()> {
    use std::io::{self, Write};

    print!("IMAP password for {}: ", config.server.username);
    io::stdout().flush()?;
    let password = read_password()?;
    println!();

    if password.is_empty() {
        anyhow::bail!("Empty password, nothing stored");
    }

    let source = CredentialStore::new(&config.server.username).set_password(&password)?;
    println!("Password stored ({:?}).", source);
    Ok(())
}

fn read_password() -> Result<String> {
    let _guard = DisableEcho::new()?;

    let mut password = String::new();
    std::io::stdin().read_line(&mut password)?;
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
                anyhow::bail!("Failed to get terminal attributes");
            }
            let original = termios.assume_init();
            let mut silent = original;
            silent.c_lflag &= !libc::ECHO;
            if libc::tcsetattr(fd, libc::TCSANOW, &silent) != 0 {
                anyhow::bail!("Failed to set terminal attributes");
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

    let command = match args.get(1).map(|s| s.as_str()) {
        None | Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            return Ok(());
        }
        Some(cmd) => cmd.to_string(),
    };

    let config = Config::load()?;
    config.ensure_dirs()?;
    setup_logging();

    match command.as_str() {
        "run" => run_daemon(config).await,
        "sync" => run_sync(config, args.get(2).cloned()).await,
        "wipe" => run_wipe(config).await,
        "login" => run_login(&config),
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
