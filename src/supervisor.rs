//! Hot reload and task supervision
//!
//! The [`Supervisor`] polls the modification times of the watched files and
//! of a sentinel file. A reload happens only when a watched file changed AND
//! the sentinel changed afterwards, so half-copied files are never read. A
//! reload parses and validates the new configuration, runs the unload hooks,
//! swaps the shared configuration and runs the reload hooks.
//!
//! Long-running tasks are wrapped by [`supervise`]: each run gets a child
//! cancellation token which is cancelled when a new configuration generation
//! is published, and the task is started again once it has wound down. Tasks
//! that fail are restarted after a backoff. Serial ports, CAN sockets and the
//! fake meter servers are never wrapped this way; they observe reloads through
//! hooks and keep running.

use crate::config::{Config, SharedConfig};
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger, get_logger_for};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Two-phase change detection over a set of files and a sentinel
#[derive(Debug)]
pub struct ReloadWatcher {
    seen: HashMap<PathBuf, Option<SystemTime>>,
    sentinel: PathBuf,
    sentinel_seen: Option<SystemTime>,
    pending: bool,
}

impl ReloadWatcher {
    pub fn new(files: Vec<PathBuf>, sentinel: PathBuf) -> Self {
        let seen = files
            .into_iter()
            .map(|f| {
                let m = mtime(&f);
                (f, m)
            })
            .collect();
        let sentinel_seen = mtime(&sentinel);
        Self {
            seen,
            sentinel,
            sentinel_seen,
            pending: false,
        }
    }

    /// A watched file changed but the sentinel has not been touched yet
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// True once per completed deploy (files changed, then sentinel)
    pub fn check(&mut self) -> bool {
        for (path, seen) in self.seen.iter_mut() {
            let current = mtime(path);
            if current != *seen {
                *seen = current;
                self.pending = true;
            }
        }
        let sentinel = mtime(&self.sentinel);
        if sentinel == self.sentinel_seen {
            return false;
        }
        self.sentinel_seen = sentinel;
        std::mem::take(&mut self.pending)
    }
}

type Hook = Box<dyn Fn(&Config) + Send + Sync>;

/// Watches the deploy files and swaps the shared configuration
pub struct Supervisor {
    shared: SharedConfig,
    path: PathBuf,
    watcher: ReloadWatcher,
    unload_hooks: Vec<Hook>,
    reload_hooks: Vec<Hook>,
    generation: watch::Sender<u64>,
    poll_interval: Duration,
    logger: StructuredLogger,
}

fn resolve(base: &Path, file: &str) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

impl Supervisor {
    /// Relative watch entries resolve against the configuration directory
    pub fn new(shared: SharedConfig, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cfg = shared.current();
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut files: Vec<PathBuf> = cfg
            .supervisor
            .watch
            .iter()
            .map(|f| resolve(&base, f))
            .collect();
        if !files.contains(&path) {
            files.push(path.clone());
        }
        let watcher = ReloadWatcher::new(files, resolve(&base, &cfg.supervisor.sentinel));
        let (generation, _) = watch::channel(shared.generation());
        Self {
            poll_interval: Duration::from_millis(cfg.supervisor.poll_interval_ms.max(10)),
            shared,
            path,
            watcher,
            unload_hooks: Vec::new(),
            reload_hooks: Vec::new(),
            generation,
            logger: get_logger("supervisor"),
        }
    }

    /// Called with the outgoing configuration before the swap
    pub fn on_unload(&mut self, hook: impl Fn(&Config) + Send + Sync + 'static) {
        self.unload_hooks.push(Box::new(hook));
    }

    /// Called with the new configuration after the swap
    pub fn on_reload(&mut self, hook: impl Fn(&Config) + Send + Sync + 'static) {
        self.reload_hooks.push(Box::new(hook));
    }

    /// Generation numbers, for [`supervise`]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Load, validate and swap in the configuration file
    ///
    /// On error the running configuration stays in place.
    pub fn reload(&mut self) -> Result<u64> {
        let config = Config::from_file(&self.path)?;
        config.validate()?;
        let old = self.shared.current();
        for hook in &self.unload_hooks {
            hook(&old);
        }
        let generation = self.shared.swap(config);
        let new = self.shared.current();
        for hook in &self.reload_hooks {
            hook(&new);
        }
        self.generation.send_replace(generation);
        self.logger
            .info(&format!("Configuration generation {} active", generation));
        Ok(generation)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        self.logger.info(&format!(
            "Watching {} for reloads",
            self.path.display()
        ));
        let mut tick = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if !self.watcher.check() {
                        continue;
                    }
                    if let Err(e) = self.reload() {
                        self.logger.error(&format!(
                            "Reload failed, keeping generation {}: {}",
                            self.shared.generation(),
                            e
                        ));
                    }
                }
            }
        }
    }
}

async fn next_generation(rx: &mut Option<watch::Receiver<u64>>) {
    match rx {
        Some(r) => {
            if r.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

enum Exit {
    Finished(Result<()>),
    Reload,
    Shutdown,
}

/// Keep a task running until `cancel` fires
///
/// `factory` builds one run of the task from a child token. With a
/// generation receiver, every new generation cancels the run and starts a
/// fresh one. Runs that fail or end on their own are restarted after
/// `backoff`.
pub async fn supervise<F, Fut>(
    name: String,
    generation: Option<watch::Receiver<u64>>,
    backoff: Duration,
    cancel: CancellationToken,
    factory: F,
) where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let logger = get_logger_for("supervisor", &name);
    let mut generation = generation;
    loop {
        let child = cancel.child_token();
        let mut task = Box::pin(factory(child.clone()));
        let exit = tokio::select! {
            res = &mut task => Exit::Finished(res),
            _ = next_generation(&mut generation) => Exit::Reload,
            _ = cancel.cancelled() => Exit::Shutdown,
        };
        match exit {
            Exit::Shutdown => {
                child.cancel();
                if let Err(e) = task.await {
                    logger.warn(&format!("Stopped with error: {}", e));
                }
                break;
            }
            Exit::Reload => {
                child.cancel();
                if let Err(e) = task.await {
                    logger.warn(&format!("Stopped with error before restart: {}", e));
                }
                logger.info("Restarting with the new configuration");
                continue;
            }
            Exit::Finished(Ok(())) if cancel.is_cancelled() => break,
            Exit::Finished(Ok(())) => logger.warn(&format!(
                "Exited unexpectedly, restarting in {:?}",
                backoff
            )),
            Exit::Finished(Err(e)) => logger.error(&format!(
                "Failed: {}, restarting in {:?}",
                e, backoff
            )),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PvError;
    use std::fs::File;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn touch(path: &Path, secs: u64) {
        let f = File::options().write(true).create(true).truncate(false).open(path).unwrap();
        f.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_watcher_needs_sentinel_after_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pvctl.yaml");
        let sentinel = dir.path().join("pvctl.reload");
        touch(&file, 1_000);
        touch(&sentinel, 1_000);
        let mut w = ReloadWatcher::new(vec![file.clone()], sentinel.clone());
        assert!(!w.check());

        // Sentinel alone does nothing
        touch(&sentinel, 2_000);
        assert!(!w.check());

        touch(&file, 3_000);
        assert!(!w.check());
        assert!(w.is_pending());

        touch(&sentinel, 4_000);
        assert!(w.check());
        assert!(!w.check());
        assert!(!w.is_pending());
    }

    #[test]
    fn test_reload_swaps_and_runs_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvctl.yaml");
        Config::default().save_to_file(&path).unwrap();
        let shared = SharedConfig::new(Config::from_file(&path).unwrap());
        let mut sup = Supervisor::new(shared.clone(), &path);

        let unloaded = Arc::new(AtomicUsize::new(0));
        let reloaded = Arc::new(AtomicUsize::new(0));
        let u = unloaded.clone();
        sup.on_unload(move |_| {
            u.fetch_add(1, Ordering::SeqCst);
        });
        let r = reloaded.clone();
        sup.on_reload(move |cfg| {
            assert_eq!(cfg.fake_meter.max_age_ignore_s, 2.0);
            r.fetch_add(1, Ordering::SeqCst);
        });
        let generations = sup.subscribe();

        let mut cfg = Config::default();
        cfg.fake_meter.max_age_ignore_s = 2.0;
        cfg.save_to_file(&path).unwrap();
        assert_eq!(sup.reload().unwrap(), 1);
        assert_eq!(shared.current().fake_meter.max_age_ignore_s, 2.0);
        assert_eq!(*generations.borrow(), 1);
        assert_eq!(unloaded.load(Ordering::SeqCst), 1);
        assert_eq!(reloaded.load(Ordering::SeqCst), 1);

        std::fs::write(&path, "mqtt: [not, a, map]").unwrap();
        assert!(sup.reload().is_err());
        assert_eq!(shared.generation(), 1);
        assert_eq!(reloaded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_new_generation_restarts_task() {
        let (tx, rx) = watch::channel(0u64);
        let cancel = CancellationToken::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let s = starts.clone();
        let handle = tokio::spawn(supervise(
            "aggregator".to_string(),
            Some(rx),
            Duration::from_millis(10),
            cancel.clone(),
            move |token| {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                    token.cancelled().await;
                    Ok(())
                }
            },
        ));
        wait_for(|| starts.load(Ordering::SeqCst) == 1).await;
        tx.send_replace(1);
        wait_for(|| starts.load(Ordering::SeqCst) == 2).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_task_restarts_after_backoff() {
        let cancel = CancellationToken::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let s = starts.clone();
        let handle = tokio::spawn(supervise(
            "canbridge".to_string(),
            None,
            Duration::from_millis(20),
            cancel.clone(),
            move |token| {
                let s = s.clone();
                async move {
                    if s.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(PvError::transport("can_bat: No such device"));
                    }
                    token.cancelled().await;
                    Ok(())
                }
            },
        ));
        wait_for(|| starts.load(Ordering::SeqCst) == 2).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }
}
