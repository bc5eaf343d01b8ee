// Daemon lifecycle: notifier setup, initial fetch, the two periodic
// refresh tickers, signal handling and reconfigure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use sysinfo::{ProcessesToUpdate, System};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::command::{BackgroundProcess, run_command};
use crate::config::AppConfig;
use crate::diff::{compare_pool_status, compare_pool_usage};
use crate::leds::{LedRegistry, initial_led_states};
use crate::models::{Pool, PoolUsage, Snapshot};
use crate::notifier::{EmailSinkConfig, Notifier, Severity};
use crate::parser::{self, parse_list_notified, parse_status_notified};
use crate::routes::WebLog;
use crate::version;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a notifier with every sink the configuration enables. Called
/// at startup and again on each reconfigure; the web log ring is shared
/// so the recent-log history survives the swap.
pub fn build_notifier(cfg: &AppConfig, web_log: &Arc<WebLog>) -> Result<Notifier> {
    let mut notify = Notifier::new();
    if let Some(level) = cfg.main.console_level {
        notify.add_stdout(level).context("[main] console_level")?;
    }
    for (profile, p) in &cfg.logfile {
        if p.enable {
            notify
                .add_file(p.level, &p.file)
                .with_context(|| format!(r#"[logfile "{profile}"]"#))?;
        }
    }
    for (profile, p) in &cfg.syslog {
        if p.enable {
            notify
                .add_syslog(p.level, &p.server, p.facility)
                .with_context(|| format!(r#"[syslog "{profile}"]"#))?;
        }
    }
    for (profile, p) in &cfg.email {
        if p.enable {
            notify
                .add_email(
                    p.level,
                    EmailSinkConfig {
                        server: p.server.clone(),
                        username: p.username.clone(),
                        password: p.password.clone(),
                        from: p.from.clone(),
                        to: p.to.clone(),
                        subject: p.subject.clone(),
                        throttle: Duration::from_secs(p.throttle),
                    },
                )
                .with_context(|| format!(r#"[email "{profile}"]"#))?;
        }
    }
    if cfg.www.enable && cfg.www.logbuffer > 0 {
        let log = Arc::clone(web_log);
        notify
            .add_callback(cfg.www.level, Box::new(move |m| log.receive(m)))
            .context("[www]")?;
    }
    Ok(notify)
}

/// Pid file that removes itself when dropped.
struct PidFile(PathBuf);

impl PidFile {
    fn create(path: &str) -> Result<Option<Self>> {
        if path.is_empty() {
            return Ok(None);
        }
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {path}"))?;
        Ok(Some(PidFile(path.into())))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            tracing::warn!("removing pid file failed: {}", e);
        }
    }
}

fn store(snapshot: &RwLock<Snapshot>, update: impl FnOnce(&mut Snapshot)) {
    match snapshot.write() {
        Ok(mut s) => update(&mut s),
        Err(e) => tracing::error!("snapshot lock poisoned: {}", e),
    }
}

async fn initial_state(
    notify: &Notifier,
    cfg: &AppConfig,
) -> Result<(Vec<Pool>, BTreeMap<String, PoolUsage>)> {
    let out = run_command(notify, &cfg.main.zpool_status_cmd)
        .await
        .context("getting pool status failed")?;
    let pools = parse_status_notified(notify, &out)
        .await
        .context("parsing pool status failed")?;
    let out = run_command(notify, &cfg.main.zfs_list_cmd)
        .await
        .context("getting pool usage failed")?;
    let usage = parse_list_notified(notify, &out).await?;
    Ok((pools, usage))
}

async fn refresh_status(
    notify: &Notifier,
    cfg: &AppConfig,
    snapshot: &Arc<RwLock<Snapshot>>,
    leds: &LedRegistry,
) {
    let Ok(output) = run_command(notify, &cfg.main.zpool_status_cmd).await else {
        let _ = notify.send(Severity::Crit, "getting pool status failed").await;
        return;
    };
    let Ok(new_pools) = parse_status_notified(notify, &output).await else {
        let _ = notify.send(Severity::Crit, "parsing pool status failed").await;
        return;
    };
    let old_pools = match snapshot.read() {
        Ok(s) => s.pools.clone(),
        Err(e) => {
            tracing::error!("snapshot lock poisoned: {}", e);
            return;
        }
    };
    let leds_to_set = match compare_pool_status(
        notify,
        &cfg.severity,
        &cfg.leds.dev_state_map,
        &old_pools,
        &new_pools,
    )
    .await
    {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!("status diff aborted: {:#}", e);
            return;
        }
    };
    store(snapshot, |s| s.pools = new_pools);
    if cfg.leds.enable
        && !leds_to_set.is_empty()
        && let Err(e) = leds.set_leds(&leds_to_set).await
    {
        tracing::error!("LED update failed: {:#}", e);
    }
}

async fn refresh_usage(notify: &Notifier, cfg: &AppConfig, snapshot: &Arc<RwLock<Snapshot>>) {
    let Ok(output) = run_command(notify, &cfg.main.zfs_list_cmd).await else {
        let _ = notify.send(Severity::Crit, "getting pool usage failed").await;
        return;
    };
    let Ok(new_usage) = parse_list_notified(notify, &output).await else {
        return;
    };
    let old_usage = match snapshot.read() {
        Ok(s) => s.usage.clone(),
        Err(e) => {
            tracing::error!("snapshot lock poisoned: {}", e);
            return;
        }
    };
    if let Err(e) = compare_pool_usage(notify, &cfg.severity.used_space, &old_usage, &new_usage).await
    {
        tracing::warn!("usage diff aborted: {:#}", e);
        return;
    }
    store(snapshot, |s| s.usage = new_usage);
}

/// Re-reads the configuration and swaps in a freshly built notifier.
/// Either step failing keeps the old configuration in place; the old
/// notifier is drained and closed without holding up the loop.
async fn reconfigure(cfg: &mut AppConfig, notify: &mut Notifier, web_log: &Arc<WebLog>) {
    let new_cfg = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            let _ = notify
                .send(
                    Severity::Crit,
                    format!("invalid configuration, keeping old: {e:#}"),
                )
                .await;
            return;
        }
    };
    let new_notify = match build_notifier(&new_cfg, web_log) {
        Ok(n) => n,
        Err(e) => {
            let _ = notify
                .send(
                    Severity::Crit,
                    format!("error setting up logs, keeping old configuration: {e:#}"),
                )
                .await;
            return;
        }
    };
    *cfg = new_cfg;
    let old = std::mem::replace(notify, new_notify);
    let done = old.close();
    tokio::spawn(async move {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, done).await;
    });
}

fn runtime_diagnostics(started: Instant) -> String {
    let mut sys = System::new();
    let memory = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid).map(|p| p.memory())
        })
        .unwrap_or(0);
    let load = System::load_average();
    format!(
        "running for {}s, resident memory {} bytes, load average {:.2} {:.2} {:.2}",
        started.elapsed().as_secs(),
        memory,
        load.one,
        load.five,
        load.fifteen
    )
}

async fn start_web(
    cfg: &AppConfig,
    snapshot: &Arc<RwLock<Snapshot>>,
    web_log: &Arc<WebLog>,
    leds: &Arc<LedRegistry>,
) -> Result<Option<JoinHandle<()>>> {
    if !cfg.www.enable {
        return Ok(None);
    }
    let listener = tokio::net::TcpListener::bind(&cfg.www.bind)
        .await
        .with_context(|| format!("binding {}", cfg.www.bind))?;
    tracing::info!("web view listening on http://{}", cfg.www.bind);
    let led_handle = cfg.leds.enable.then(|| Arc::clone(leds));
    let app = crate::routes::app(
        Arc::clone(snapshot),
        Arc::clone(web_log),
        led_handle,
        cfg.wwwuser.clone(),
    );
    Ok(Some(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("web server error: {}", e);
        }
    })))
}

async fn close_and_wait(notify: Notifier) {
    let done = notify.close();
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, done).await;
}

/// Runs the daemon until a termination signal arrives. An error return
/// means a fatal startup failure; the caller maps it to exit code 2.
pub async fn run(mut cfg: AppConfig) -> Result<()> {
    let started = Instant::now();
    let snapshot = Arc::new(RwLock::new(Snapshot::default()));
    let web_log = Arc::new(WebLog::new(cfg.www.logbuffer));
    let leds = Arc::new(LedRegistry::new(cfg.leds.ledctl_cmd.clone()));
    let mut notify = build_notifier(&cfg, &web_log)?;
    let _pidfile = PidFile::create(&cfg.main.pidfile)?;

    let _ = notify
        .send(Severity::Info, format!("{} starting", version::NAME))
        .await;

    // the first fetch must succeed: without a baseline there is nothing
    // to diff against
    let (pools, usage) = match initial_state(&notify, &cfg).await {
        Ok(v) => v,
        Err(e) => {
            let _ = notify.send(Severity::Crit, format!("exiting: {e:#}")).await;
            close_and_wait(notify).await;
            return Err(e);
        }
    };
    if cfg.leds.enable {
        let states = initial_led_states(&pools, &cfg.leds.dev_state_map);
        if let Err(e) = leds.set_leds(&states).await {
            tracing::error!("initial LED setup failed: {:#}", e);
        }
    }
    store(&snapshot, |s| {
        s.pools = pools;
        s.usage = usage;
    });

    let iostat_proc = if cfg.main.zpool_iostat_cmd.is_empty() {
        None
    } else {
        match BackgroundProcess::spawn(&cfg.main.zpool_iostat_cmd) {
            Ok((process, stdout)) => {
                tokio::spawn(parser::iostat::run_stream(stdout, Arc::clone(&snapshot)));
                Some(process)
            }
            Err(e) => {
                let _ = notify
                    .send(Severity::Err, format!("failed to start iostat command: {e:#}"))
                    .await;
                None
            }
        }
    };

    let web_task = match start_web(&cfg, &snapshot, &web_log, &leds).await {
        Ok(t) => t,
        Err(e) => {
            let _ = notify.send(Severity::Crit, format!("exiting: {e:#}")).await;
            if let Some(p) = iostat_proc {
                p.stop().await;
            }
            close_and_wait(notify).await;
            return Err(e);
        }
    };

    let status_period = Duration::from_secs(cfg.main.zpool_status_refresh);
    let usage_period = Duration::from_secs(cfg.main.zfs_list_refresh);
    let mut status_tick = interval_at(Instant::now() + status_period, status_period);
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut usage_tick = interval_at(Instant::now() + usage_period, usage_period);
    usage_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        notify.flush().await;
        tokio::select! {
            _ = status_tick.tick() => {
                refresh_status(&notify, &cfg, &snapshot, &leds).await;
            }
            _ = usage_tick.tick() => {
                refresh_usage(&notify, &cfg, &snapshot).await;
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = sighup.recv() => {
                let _ = notify.send(Severity::Debug, "reconfiguring, reopening logs").await;
                notify.reopen().await;
                reconfigure(&mut cfg, &mut notify, &web_log).await;
            }
            _ = sigusr1.recv() => {
                let _ = notify.send(Severity::Debug, runtime_diagnostics(started)).await;
            }
        }
    }

    let _ = notify
        .send(Severity::Info, format!("{} stopping", version::NAME))
        .await;
    if let Some(p) = iostat_proc {
        p.stop().await;
    }
    if let Some(t) = web_task {
        t.abort();
    }
    close_and_wait(notify).await;
    Ok(())
}
