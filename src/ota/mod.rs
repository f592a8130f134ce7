//! OTA Orchestrator - Update Manifest Builder
//!
//! ## Responsibilities
//!
//! - Enumerate `devices/<device_id>/app/**` and `shared/**` under the source
//!   root and map them to device-relative paths
//! - Resolve each entry to a fetchable URL (raw base, or proxy when set)
//! - Publish the manifest to the device's update topic
//! - Track attempt outcomes from the device's status progression
//!
//! The bootstrap layer is never part of a manifest: the enumeration skips
//! dot-directories, the deny-list, and any `bootstrap` component. The device
//! acknowledges by walking `update_received -> updating -> updated`; there
//! are no retries at this layer.

use crate::bus::BusHandle;
use crate::clock::SharedClock;
use crate::codec::{CodecRegistry, Command};
use crate::error::{Error, Result};
use crate::models::{ManifestFile, OtaManifest};
use crate::state_store::{ChangeKind, StateStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

/// Directory names never shipped to a device
const DENY_DIRS: &[&str] = &["__pycache__", "node_modules", "target"];

/// File suffixes treated as editor backups or junk
const DENY_SUFFIXES: &[&str] = &["~", ".swp", ".swo", ".bak", ".pyc", ".orig"];

/// Orchestrator settings, lifted from [`crate::config::AppConfig`]
#[derive(Debug, Clone)]
pub struct OtaOptions {
    pub source_root: PathBuf,
    pub raw_content_base: String,
    pub proxy_base: Option<String>,
    pub default_ref: String,
}

impl OtaOptions {
    fn base(&self) -> &str {
        self.proxy_base.as_deref().unwrap_or(&self.raw_content_base)
    }
}

/// Outcome of the most recent OTA attempt per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaOutcome {
    InFlight,
    Succeeded,
    Failed,
}

/// Attempt record kept for observability
#[derive(Debug, Clone, Serialize)]
pub struct OtaAttempt {
    pub device_id: String,
    pub r#ref: String,
    pub started_at: DateTime<Utc>,
    pub outcome: OtaOutcome,
}

/// OTA orchestrator instance
pub struct OtaOrchestrator {
    options: OtaOptions,
    store: Arc<StateStore>,
    registry: Arc<CodecRegistry>,
    bus: BusHandle,
    clock: SharedClock,
    attempts: RwLock<HashMap<String, OtaAttempt>>,
}

impl OtaOrchestrator {
    pub fn new(
        options: OtaOptions,
        store: Arc<StateStore>,
        registry: Arc<CodecRegistry>,
        bus: BusHandle,
        clock: SharedClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            store,
            registry,
            bus,
            clock,
            attempts: RwLock::new(HashMap::new()),
        })
    }

    /// Build the manifest without publishing (preview)
    pub async fn build_manifest(
        &self,
        device_id: &str,
        r#ref: Option<&str>,
    ) -> Result<OtaManifest> {
        let r#ref = r#ref.unwrap_or(&self.options.default_ref);
        validate_ref(r#ref)?;
        if !self.store.has_device(device_id).await {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }

        let app_dir = self
            .options
            .source_root
            .join("devices")
            .join(device_id)
            .join("app");
        let shared_dir = self.options.source_root.join("shared");

        let mut files = Vec::new();
        for rel in collect_files(&app_dir).await? {
            files.push(self.manifest_entry(r#ref, "app", &rel, &format!("devices/{device_id}/app")));
        }
        for rel in collect_files(&shared_dir).await? {
            files.push(self.manifest_entry(r#ref, "shared", &rel, "shared"));
        }

        if files.is_empty() {
            return Err(Error::OtaEnumeration(format!(
                "no updatable files found for {device_id}"
            )));
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);

        Ok(OtaManifest {
            r#ref: r#ref.to_string(),
            files,
        })
    }

    /// Build and publish the manifest to the device's update topic
    pub async fn trigger(&self, device_id: &str, r#ref: Option<&str>) -> Result<OtaManifest> {
        let manifest = self.build_manifest(device_id, r#ref).await?;
        let (topic, payload) = self.registry.encode_command(&Command::Update {
            device_id: device_id.to_string(),
            manifest: manifest.clone(),
        });
        self.bus.publish(topic, payload)?;

        self.attempts.write().await.insert(
            device_id.to_string(),
            OtaAttempt {
                device_id: device_id.to_string(),
                r#ref: manifest.r#ref.clone(),
                started_at: self.clock.now(),
                outcome: OtaOutcome::InFlight,
            },
        );
        tracing::info!(
            device_id = %device_id,
            r#ref = %manifest.r#ref,
            files = manifest.files.len(),
            "Published update manifest"
        );
        Ok(manifest)
    }

    /// Most recent attempt per device
    pub async fn attempts(&self) -> Vec<OtaAttempt> {
        self.attempts.read().await.values().cloned().collect()
    }

    fn manifest_entry(
        &self,
        r#ref: &str,
        device_prefix: &str,
        rel: &str,
        repo_prefix: &str,
    ) -> ManifestFile {
        let base = self.options.base().trim_end_matches('/');
        ManifestFile {
            url: format!("{base}/{rev}/{repo_prefix}/{rel}", rev = r#ref),
            path: format!("{device_prefix}/{rel}"),
        }
    }

    /// Watch device status to mark attempt outcomes
    pub fn spawn_watcher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let mut changes = orchestrator.store.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = changes.recv() => match received {
                        Ok(change) if change.kind == ChangeKind::Status => {
                            orchestrator.note_status(&change.device_id, change.after.as_ref()).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    async fn note_status(&self, device_id: &str, after: Option<&serde_json::Value>) {
        let Some(status) = after.and_then(|v| v.as_str()) else {
            return;
        };
        let mut attempts = self.attempts.write().await;
        let Some(attempt) = attempts.get_mut(device_id) else {
            return;
        };
        if attempt.outcome != OtaOutcome::InFlight {
            return;
        }
        match status {
            "needs_help" => {
                attempt.outcome = OtaOutcome::Failed;
                tracing::warn!(
                    device_id = %device_id,
                    r#ref = %attempt.r#ref,
                    "OTA attempt failed, device asked for help"
                );
            }
            "online" => {
                attempt.outcome = OtaOutcome::Succeeded;
                tracing::info!(
                    device_id = %device_id,
                    r#ref = %attempt.r#ref,
                    "OTA attempt completed"
                );
            }
            _ => {}
        }
    }
}

/// Refuse refs that could escape the `{base}/{ref}/{repo_path}` layout
fn validate_ref(r#ref: &str) -> Result<()> {
    if r#ref.is_empty() {
        return Err(Error::OtaEnumeration("empty ref".to_string()));
    }
    if r#ref.contains(['/', '\\']) || r#ref.contains(char::is_whitespace) || r#ref.contains("..") {
        return Err(Error::OtaEnumeration(format!("invalid ref {:?}", r#ref)));
    }
    Ok(())
}

fn denied_file(name: &str) -> bool {
    name.starts_with('.') || DENY_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn denied_dir(name: &str) -> bool {
    name.starts_with('.') || name == "bootstrap" || DENY_DIRS.contains(&name)
}

/// Enumerate regular files under `base`, returning forward-slash relative
/// paths. A missing base yields an empty list. Symlinks are not followed.
async fn collect_files(base: &Path) -> Result<Vec<String>> {
    if tokio::fs::metadata(base).await.is_err() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut stack = vec![base.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                if denied_dir(&name) {
                    continue;
                }
                stack.push(entry.path());
            } else if !denied_file(&name) {
                let rel = entry
                    .path()
                    .strip_prefix(base)
                    .map_err(|_| Error::Internal("path outside enumeration base".to_string()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(rel);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::Event;
    use chrono::TimeZone;
    use std::time::Duration;

    async fn orchestrator_with_tree(root: &Path) -> Arc<OtaOrchestrator> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(StateStore::new(
            clock.clone(),
            Duration::from_secs(90),
            64,
        ));
        // Register the device the tests target
        store
            .apply(&Event::Version {
                device_id: "garage-controller".to_string(),
                version: "abc123".to_string(),
            })
            .await;
        let registry = Arc::new(CodecRegistry::new());
        let (_adapter, bus) = crate::bus::BusAdapter::new(
            registry.clone(),
            store.clone(),
            crate::bus::BusOptions {
                host: "localhost".to_string(),
                port: 1883,
                username: None,
                password: None,
                client_id: "test".to_string(),
                keepalive: Duration::from_secs(30),
                outbound_cap: 16,
            },
        );
        OtaOrchestrator::new(
            OtaOptions {
                source_root: root.to_path_buf(),
                raw_content_base: "https://raw.example.test/fleet".to_string(),
                proxy_base: None,
                default_ref: "main".to_string(),
            },
            store,
            registry,
            bus,
            clock,
        )
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn seed_tree(root: &Path) {
        write(root, "devices/garage-controller/app/main.py", "print('hi')");
        write(root, "devices/garage-controller/app/util/door.py", "x = 1");
        write(root, "devices/bootstrap/main.py", "bootstrap");
        write(root, "shared/mqtt_client.py", "client");
        write(root, "shared/vendor/bmp3xx.py", "driver");
        write(root, "shared/__pycache__/mqtt_client.cpython.pyc", "junk");
        write(root, "shared/.hidden/secret.py", "no");
        write(root, "shared/notes.py~", "backup");
    }

    #[tokio::test]
    async fn manifest_is_sorted_unique_and_bootstrap_free() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());
        let ota = orchestrator_with_tree(dir.path()).await;

        let manifest = ota.build_manifest("garage-controller", None).await.unwrap();
        let paths: Vec<_> = manifest.files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                "app/main.py",
                "app/util/door.py",
                "shared/mqtt_client.py",
                "shared/vendor/bmp3xx.py",
            ]
        );
        assert!(paths.iter().all(|p| !p.contains("bootstrap")));
        assert!(paths.iter().all(|p| !p.contains("__pycache__")));

        let mut sorted = paths.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(paths, sorted);
    }

    #[tokio::test]
    async fn urls_follow_the_ref_repo_path_layout() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());
        let ota = orchestrator_with_tree(dir.path()).await;

        let manifest = ota
            .build_manifest("garage-controller", Some("v1.2"))
            .await
            .unwrap();
        let main = manifest
            .files
            .iter()
            .find(|f| f.path == "app/main.py")
            .unwrap();
        assert_eq!(
            main.url,
            "https://raw.example.test/fleet/v1.2/devices/garage-controller/app/main.py"
        );
        let shared = manifest
            .files
            .iter()
            .find(|f| f.path == "shared/mqtt_client.py")
            .unwrap();
        assert_eq!(
            shared.url,
            "https://raw.example.test/fleet/v1.2/shared/mqtt_client.py"
        );
    }

    #[tokio::test]
    async fn manifest_generation_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());
        let ota = orchestrator_with_tree(dir.path()).await;
        let first = ota.build_manifest("garage-controller", None).await.unwrap();
        let second = ota.build_manifest("garage-controller", None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_device_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());
        let ota = orchestrator_with_tree(dir.path()).await;
        let err = ota.build_manifest("toaster", None).await.unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn hostile_refs_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        seed_tree(dir.path());
        let ota = orchestrator_with_tree(dir.path()).await;
        for bad in ["", "main branch", "../main", "a/b", "a\\b", "v1 "] {
            let err = ota
                .build_manifest("garage-controller", Some(bad))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::OtaEnumeration(_)), "ref {bad:?}");
        }
    }

    #[test]
    fn deny_rules() {
        assert!(denied_dir(".git"));
        assert!(denied_dir("bootstrap"));
        assert!(denied_dir("__pycache__"));
        assert!(!denied_dir("vendor"));
        assert!(denied_file("main.py~"));
        assert!(denied_file(".DS_Store"));
        assert!(denied_file("swap.swp"));
        assert!(!denied_file("main.py"));
    }
}
