use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{oneshot, Notify};

use crate::bus::Bus;
use crate::config::Config;
use crate::control::{ControlPlane, ServedHub};
use crate::direct::DirectClient;
use crate::hooks::{HookChain, HostBlocklist};
use crate::hub::{HubConfig, HubDeps};
use crate::jar::SessionStore;
use crate::mirror::MirrorSet;
use crate::seal::{Plaintext, Sealer};
use crate::transform::{Passthrough, Transformer, XorMask};
use crate::transport::{candidates_for, ConnectOptions};
use crate::tunnel::Tunnel;
use crate::vault::Vault;

#[derive(Debug, Default)]
pub struct DaemonOptions {
    /// Overrides `log_path` from the config.
    pub log_path: Option<PathBuf>,
    /// Receives the control plane's bound address once it is listening.
    pub ready: Option<oneshot::Sender<SocketAddr>>,
}

/// Open the session store the way the daemon does. Used by the offline CLI
/// commands as well.
pub fn open_store(cfg: &Config, bus: Bus) -> Result<Arc<SessionStore>> {
    let sealer: Arc<dyn Sealer> = Arc::new(Plaintext);
    let vault = Vault::new(cfg.vault_dir(), sealer.clone());
    let store = SessionStore::open(&cfg.db_path(), vault, sealer, cfg.cookie_domain_match, bus)
        .with_context(|| format!("open session store {}", cfg.db_path().display()))?;
    Ok(Arc::new(store))
}

/// Assemble the hub from config without starting anything.
pub fn build_hub(cfg: &Config) -> Result<ServedHub> {
    let bus = Bus::new();
    let store = open_store(cfg, bus.clone())?;

    let mirrors = MirrorSet::new(cfg.mirror_urls()?);
    let tunnel = Tunnel::new(mirrors, candidates_for(cfg), ConnectOptions::from_config(cfg));

    let direct = DirectClient::new(&cfg.user_agent, Duration::from_secs(cfg.request_timeout_secs))
        .context("build direct client")?;

    let transformer: Arc<dyn Transformer> = match cfg.xor_key {
        Some(key) => Arc::new(XorMask::new(key)),
        None => Arc::new(Passthrough),
    };

    let mut pre = HookChain::new();
    if !cfg.blocked_hosts.is_empty() {
        pre.push(HostBlocklist::new(&cfg.blocked_hosts).context("blocked_hosts")?);
    }

    Ok(ServedHub::with_hooks(
        HubConfig::from_config(cfg),
        HubDeps {
            tunnel,
            store,
            bus,
            direct,
            transformer,
        },
        pre,
        HookChain::new(),
    ))
}

/// Run the hub on the *current* tokio runtime until `shutdown` is notified.
pub async fn run_daemon_with_shutdown(
    cfg: Config,
    opts: DaemonOptions,
    shutdown: Arc<Notify>,
) -> Result<()> {
    // Registered up front so a signal during startup is not lost.
    let stop = shutdown.notified();
    tokio::pin!(stop);
    stop.as_mut().enable();

    let log_path = opts.log_path.unwrap_or_else(|| cfg.log_file_path());
    crate::logging::init_log_file(&log_path, cfg.log_level)?;
    crate::logging::info(format!(
        "daemon start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        log_path.display()
    ));

    let hub = Arc::new(build_hub(&cfg)?);
    let handle = hub.activate();

    let control = ControlPlane::start_async(
        &cfg.listen_addr,
        cfg.control_token.clone(),
        hub.clone(),
        cfg.static_dir.clone(),
        Some(shutdown.clone()),
    )
    .await?;
    if let Some(ready) = opts.ready {
        let _ = ready.send(control.bound_addr);
    }

    // Best effort; requests connect lazily anyway.
    let warm = hub.tunnel().clone();
    tokio::spawn(async move {
        if let Err(e) = warm.connect().await {
            crate::logging::warn(format!("initial tunnel connect failed: {e}"));
        }
    });

    stop.await;
    crate::logging::info("daemon shutting down");
    handle.shutdown().await;
    hub.tunnel().disconnect();
    Ok(())
}
