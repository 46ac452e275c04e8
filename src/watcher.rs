use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::config;
use crate::router::Router;
use crate::tags::TagHandle;
use crate::transport::Exchanger;

const RELOAD_ATTEMPTS: u32 = 3;

/// Watches `path` and swaps in a freshly compiled [`Router`] on every change.
/// A document that fails to load or compile leaves the running router in place.
pub fn spawn(
    path: PathBuf,
    router: Arc<ArcSwap<Router>>,
    exchanger: Arc<dyn Exchanger>,
    runtime: Handle,
) {
    // A blocking thread owns the watcher / 使用阻塞线程持有 watcher，避免异步生命周期问题
    thread::spawn(move || {
        let _guard = runtime.enter();
        if let Err(err) = run_watcher(&path, &router, &exchanger) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(
    path: &Path,
    router: &ArcSwap<Router>,
    exchanger: &Arc<dyn Exchanger>,
) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(event) if event.kind.is_access() => {}
            Ok(_) => {
                // Editors truncate then write, so a half-written file is retried / 编辑器先截断再写入，半写文件会重试
                let mut attempts = RELOAD_ATTEMPTS;
                loop {
                    match reload(path, router, exchanger) {
                        Ok(()) => break,
                        Err(err) => {
                            attempts -= 1;
                            if attempts == 0 {
                                warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                                break;
                            }
                            thread::sleep(Duration::from_millis(50));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Loads and compiles `path`, starts the new router, then retires the old one.
pub fn reload(
    path: &Path,
    router: &ArcSwap<Router>,
    exchanger: &Arc<dyn Exchanger>,
) -> anyhow::Result<()> {
    let cfg = config::load_config(path)?;
    let tags = TagHandle::from_config(&cfg.tags).context("compile tags")?;
    let next = Router::from_config(&cfg, tags, exchanger.clone()).context("compile zones")?;
    next.start();
    let old = router.swap(Arc::new(next));
    old.stop();
    info!(target = "watcher", path = %path.display(), zones = router.load().zones().len(), "config reloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::testing::ScriptedExchanger;
    use serde_json::json;
    use std::fs;

    fn write_config(name: &str, raw: serde_json::Value) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "zoneforward-{name}-{}.json",
            std::process::id()
        ));
        fs::write(&path, raw.to_string()).unwrap();
        path
    }

    #[tokio::test]
    async fn reload_swaps_router_and_keeps_old_on_error() {
        let exchanger: Arc<dyn Exchanger> = ScriptedExchanger::answering();
        let path = write_config(
            "reload",
            json!({ "zones": [ { "from": ["."], "to": ["10.0.0.1"] } ] }),
        );
        let cfg = config::load_config(&path).unwrap();
        let initial = Router::from_config(&cfg, TagHandle::disabled(), exchanger.clone()).unwrap();
        let router = ArcSwap::from_pointee(initial);

        fs::write(
            &path,
            json!({ "zones": [
                { "from": ["."], "to": ["10.0.0.2"], "except": ["corp.example"] },
                { "from": ["!cn"], "to": ["10.0.0.3"] }
            ] })
            .to_string(),
        )
        .unwrap();
        reload(&path, &router, &exchanger).unwrap();
        assert_eq!(router.load().zones().len(), 2);
        let metrics = Metrics::new();
        assert!(router.load().route("corp.example", &metrics).is_none());

        fs::write(&path, json!({ "zones": [ { "from": ["."] } ] }).to_string()).unwrap();
        let err = reload(&path, &router, &exchanger).unwrap_err();
        assert!(format!("{err:#}").contains("missing mandatory property"));
        assert_eq!(router.load().zones().len(), 2);

        fs::write(&path, "{ not json").unwrap();
        assert!(reload(&path, &router, &exchanger).is_err());
        assert_eq!(router.load().zones()[0].health.hosts()[0].name, "dns://10.0.0.2:53");

        router.load().stop();
        let _ = fs::remove_file(&path);
    }
}
