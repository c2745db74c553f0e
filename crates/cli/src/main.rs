//! treesync: keep a remote store in step with a local directory tree
//!
//! Walks the sync root once, then forwards filesystem changes as they
//! happen until interrupted.

use std::path::{Path, PathBuf};

use clap::Parser;
use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use treesync_core::watch::InotifySource;
use treesync_core::{
    ClientConfig, ContentHash, Engine, EventDispatcher, ProtocolClient, ShutdownSignal, SyncRoot,
    walk,
};
use treesync_transport::TcpTransport;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "treesync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Mirror a directory tree to a remote store and keep it live")]
#[command(long_about = r#"
treesync logs in to a remote store, sends every entry under the sync root,
then watches the tree and forwards each change until interrupted.

The config file holds key=value lines:
  name=laptop
  server=sync.example.com:12345
  user=alice
  passwd=secret
  path=/home/alice/box
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the client config file
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over -v
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let shutdown = ShutdownSignal::new();
    let mut worker = tokio::task::spawn_blocking({
        let shutdown = shutdown.clone();
        let config = cli.config;
        move || run_client(&config, &shutdown)
    });

    tokio::select! {
        result = &mut worker => result.wrap_err("sync worker panicked")??,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("cannot listen for Ctrl+C: {e}");
            }
            info!("Interrupted, shutting down...");
            shutdown.trigger();
            worker.await.wrap_err("sync worker panicked")??;
        }
    }

    Ok(())
}

/// Log in, run the initial walk, then dispatch events until `shutdown`
fn run_client(config_path: &Path, shutdown: &ShutdownSignal) -> Result<()> {
    let config = ClientConfig::load(config_path)
        .wrap_err_with(|| format!("invalid config {}", config_path.display()))?;
    debug!("{config:?}");

    let root = SyncRoot::open(&config.path)?;
    info!("{}: syncing {}", config.name, root.path().display());

    let addr = config.server_addr();
    let transport = TcpTransport::connect(&config.name, &addr)
        .wrap_err_with(|| format!("cannot connect to {addr}"))?;
    let passwd_hash = ContentHash::from_bytes(config.passwd.as_bytes());
    let client = ProtocolClient::login(transport, &config.user, &passwd_hash)
        .wrap_err_with(|| format!("login as {} failed", config.user))?;

    let source = InotifySource::new().wrap_err("cannot start inotify")?;
    let mut engine = Engine::new(root, client, source);

    let report = walk(&mut engine, shutdown)?;
    if report.interrupted {
        return Ok(());
    }
    match report.write_deepest(Path::new(".")) {
        Ok(path) => debug!("deepest directory written to {}", path.display()),
        Err(e) => warn!("cannot write deepest directory: {e}"),
    }

    if shutdown.is_triggered() {
        return Ok(());
    }
    EventDispatcher::new(&mut engine).run(shutdown)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_requires_one_config() {
        assert!(Cli::try_parse_from(["treesync"]).is_err());
        assert!(Cli::try_parse_from(["treesync", "a.conf", "b.conf"]).is_err());

        let cli = Cli::try_parse_from(["treesync", "-v", "client.conf"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("client.conf"));
    }

    #[test]
    fn test_bad_config_fails_before_connecting() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("client.conf");
        std::fs::write(&path, "name=x\n").unwrap();

        let err = run_client(&path, &ShutdownSignal::new()).unwrap_err();
        assert!(format!("{err:#}").contains("missing required key `server`"));
    }
}
