//! Plugin-backed state backend
//!
//! Storage and locking live in an external plugin process. This backend
//! starts the plugin, hands it its configuration, and maps workspaces onto
//! the plugin's operations. Workspaces are created lazily the first time a
//! state manager is requested for them.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};

use crate::backend::{Backend, BackendConfig, BackendError, BackendResult, DEFAULT_WORKSPACE};
use crate::lock::{INIT_OPERATION, LockInfo};
use crate::plugin::{BackendPlugin, RpcPlugin};
use crate::remote::{RemoteState, StateClient};
use crate::state::{StateFile, StatePayload};

/// State backend delegating to a plugin
pub struct PluginBackend {
    config: BackendConfig,
    plugin: Arc<dyn BackendPlugin>,
}

impl PluginBackend {
    /// Start the plugin named by `config.source` and configure it
    ///
    /// Any failure here (bad configuration, the process not starting, a
    /// failed handshake, the plugin rejecting its settings) is fatal.
    pub async fn configure(config: BackendConfig) -> BackendResult<Self> {
        config.validate()?;
        if let Some(version) = &config.version {
            warn!(
                "plugin version constraint {:?} is ignored; {} is used as-is",
                version, config.source
            );
        }

        let plugin = RpcPlugin::spawn(&config.source).await?;
        Self::with_plugin(config, Arc::new(plugin)).await
    }

    /// Configure an already-connected plugin
    pub async fn with_plugin(
        config: BackendConfig,
        plugin: Arc<dyn BackendPlugin>,
    ) -> BackendResult<Self> {
        if let Err(err) = plugin.configure(&config.config).await {
            if let Err(close_err) = plugin.close().await {
                warn!("failed to stop plugin after configuration error: {}", close_err);
            }
            return Err(err);
        }

        info!("configured plugin backend {}", config.source);
        Ok(Self { config, plugin })
    }

    /// The configuration this backend was built from
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Stop the plugin; the backend is unusable afterwards
    pub async fn close(self) -> BackendResult<()> {
        self.plugin.close().await
    }

    /// State manager for a workspace, without creating it
    ///
    /// Unlike [`Backend::state_mgr`] this never lists or locks, so it can
    /// reach a workspace whose creation was interrupted while holding its
    /// lock.
    pub fn state_handle(&self, workspace: &str) -> RemoteState {
        RemoteState::new(Box::new(PluginStateClient::new(
            workspace,
            self.plugin.clone(),
        )))
    }
}

#[async_trait]
impl Backend for PluginBackend {
    async fn workspaces(&self) -> BackendResult<Vec<String>> {
        let reported = self.plugin.list_workspaces().await?;
        Ok(with_default_workspace(reported))
    }

    async fn state_mgr(&self, workspace: &str) -> BackendResult<RemoteState> {
        let existing = self.plugin.list_workspaces().await?;
        let mut state = self.state_handle(workspace);
        if existing.iter().any(|w| w == workspace) {
            return Ok(state);
        }

        // Not listed yet: write an empty state so that it is
        info!("creating workspace {}", workspace);
        state
            .ensure_initialized(INIT_OPERATION, || {
                StateFile::new().to_bytes().map_err(|e| {
                    BackendError::state_io(workspace, "serialize", e.to_string())
                })
            })
            .await?;
        Ok(state)
    }

    async fn delete_workspace(&self, workspace: &str, force: bool) -> BackendResult<()> {
        self.plugin.delete_workspace(workspace, force).await
    }
}

/// Drop repeated names, keeping the first occurrence, and make sure the
/// default workspace is present
fn with_default_workspace(reported: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut workspaces: Vec<String> = reported
        .into_iter()
        .filter(|w| seen.insert(w.clone()))
        .collect();

    if !seen.contains(DEFAULT_WORKSPACE) {
        workspaces.push(DEFAULT_WORKSPACE.to_string());
    }
    workspaces
}

/// [`StateClient`] for one workspace of a plugin
pub struct PluginStateClient {
    workspace: String,
    plugin: Arc<dyn BackendPlugin>,
}

impl PluginStateClient {
    pub fn new(workspace: impl Into<String>, plugin: Arc<dyn BackendPlugin>) -> Self {
        Self {
            workspace: workspace.into(),
            plugin,
        }
    }
}

#[async_trait]
impl StateClient for PluginStateClient {
    fn workspace(&self) -> &str {
        &self.workspace
    }

    async fn get(&self) -> BackendResult<Option<StatePayload>> {
        self.plugin.get_state_payload(&self.workspace).await
    }

    async fn put(&self, data: &[u8]) -> BackendResult<()> {
        self.plugin.put_state(&self.workspace, data).await
    }

    async fn delete(&self) -> BackendResult<()> {
        self.plugin.delete_state(&self.workspace).await
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        self.plugin.lock_state(&self.workspace, info).await
    }

    async fn unlock(&self, token: &str) -> BackendResult<()> {
        self.plugin.unlock_state(&self.workspace, token).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::plugin::MemoryPlugin;
    use crate::plugin::protocol::ops;

    /// Wraps a MemoryPlugin with failure injection and call tracing
    #[derive(Default)]
    struct ScriptedPlugin {
        inner: MemoryPlugin,
        listing: Option<Vec<String>>,
        fail_lock: bool,
        fail_get: bool,
        fail_unlock: bool,
        fail_configure: bool,
        /// Runs once, just before the first lock is taken
        before_lock: Mutex<Option<Box<dyn FnOnce(&MemoryPlugin) + Send>>>,
        calls: Mutex<Vec<&'static str>>,
        locks: Mutex<Vec<LockInfo>>,
        closed: AtomicUsize,
    }

    impl ScriptedPlugin {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BackendPlugin for ScriptedPlugin {
        async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
            self.record("list");
            match &self.listing {
                Some(listing) => Ok(listing.clone()),
                None => self.inner.list_workspaces().await,
            }
        }

        async fn delete_workspace(&self, workspace: &str, force: bool) -> BackendResult<()> {
            self.record("delete_workspace");
            self.inner.delete_workspace(workspace, force).await
        }

        async fn configure(&self, config: &HashMap<String, String>) -> BackendResult<()> {
            self.record("configure");
            if self.fail_configure {
                return Err(BackendError::configuration("missing required setting: path"));
            }
            self.inner.configure(config).await
        }

        async fn get_state_payload(&self, workspace: &str) -> BackendResult<Option<StatePayload>> {
            self.record("get");
            if self.fail_get {
                return Err(BackendError::state_io(workspace, ops::GET_STATE_PAYLOAD, "read timed out"));
            }
            self.inner.get_state_payload(workspace).await
        }

        async fn put_state(&self, workspace: &str, data: &[u8]) -> BackendResult<()> {
            self.record("put");
            self.inner.put_state(workspace, data).await
        }

        async fn delete_state(&self, workspace: &str) -> BackendResult<()> {
            self.record("delete_state");
            self.inner.delete_state(workspace).await
        }

        async fn lock_state(&self, workspace: &str, info: &LockInfo) -> BackendResult<String> {
            self.record("lock");
            self.locks.lock().unwrap().push(info.clone());
            let hook = self.before_lock.lock().unwrap().take();
            if let Some(hook) = hook {
                hook(&self.inner);
            }
            if self.fail_lock {
                return Err(BackendError::lock(workspace, "lock table unavailable"));
            }
            self.inner.lock_state(workspace, info).await
        }

        async fn unlock_state(&self, workspace: &str, token: &str) -> BackendResult<()> {
            self.record("unlock");
            if self.fail_unlock {
                return Err(BackendError::lock(workspace, "lock table unavailable"));
            }
            self.inner.unlock_state(workspace, token).await
        }

        async fn close(&self) -> BackendResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn backend_with(plugin: Arc<dyn BackendPlugin>) -> PluginBackend {
        PluginBackend::with_plugin(BackendConfig::new("test-plugin"), plugin)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_configure_passes_config_through() {
        let memory = Arc::new(MemoryPlugin::new());
        let config = BackendConfig::new("test-plugin")
            .with_setting("path", "/srv/state")
            .with_setting("anything", "goes");

        let backend = PluginBackend::with_plugin(config.clone(), memory.clone())
            .await
            .unwrap();
        assert_eq!(memory.configuration(), Some(config.config.clone()));
        assert_eq!(backend.config(), &config);
    }

    #[tokio::test]
    async fn test_configure_rejection_is_fatal_and_closes_plugin() {
        let plugin = Arc::new(ScriptedPlugin {
            fail_configure: true,
            ..Default::default()
        });
        let result = PluginBackend::with_plugin(BackendConfig::new("p"), plugin.clone()).await;

        match result {
            Err(BackendError::Configuration(message)) => {
                assert_eq!(message, "missing required setting: path")
            }
            Err(other) => panic!("Expected Configuration error, got {:?}", other),
            Ok(_) => panic!("Expected configuration to fail"),
        }
        assert_eq!(plugin.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configure_rejects_empty_source() {
        let result = PluginBackend::configure(BackendConfig::new("")).await;
        assert!(matches!(result, Err(BackendError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_workspaces_appends_default() {
        let memory = Arc::new(MemoryPlugin::new());
        let backend = backend_with(memory.clone()).await;
        assert_eq!(backend.workspaces().await.unwrap(), vec!["default"]);

        memory.insert_state("prod", b"{}".to_vec());
        memory.insert_state("dev", b"{}".to_vec());
        assert_eq!(
            backend.workspaces().await.unwrap(),
            vec!["dev", "prod", "default"]
        );
    }

    #[tokio::test]
    async fn test_workspaces_reports_default_exactly_once() {
        for listing in [
            vec!["default", "dev"],
            vec!["dev", "default", "default"],
            vec!["default", "default"],
        ] {
            let plugin = Arc::new(ScriptedPlugin {
                listing: Some(listing.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            });
            let workspaces = backend_with(plugin).await.workspaces().await.unwrap();
            let defaults = workspaces.iter().filter(|w| *w == "default").count();
            assert_eq!(defaults, 1, "listing {:?} gave {:?}", listing, workspaces);
        }
    }

    #[tokio::test]
    async fn test_workspaces_keeps_plugin_order() {
        let plugin = Arc::new(ScriptedPlugin {
            listing: Some(vec!["zeta".into(), "alpha".into(), "zeta".into(), "mid".into()]),
            ..Default::default()
        });
        let workspaces = backend_with(plugin).await.workspaces().await.unwrap();
        assert_eq!(workspaces, vec!["zeta", "alpha", "mid", "default"]);
    }

    #[tokio::test]
    async fn test_state_mgr_creates_missing_workspace() {
        let memory = Arc::new(MemoryPlugin::new());
        let backend = backend_with(memory.clone()).await;
        assert_eq!(backend.workspaces().await.unwrap(), vec!["default"]);

        let state = backend.state_mgr("dev").await.unwrap();
        assert_eq!(state.workspace(), "dev");

        let workspaces = backend.workspaces().await.unwrap();
        assert!(workspaces.contains(&"dev".to_string()));
        assert!(workspaces.contains(&"default".to_string()));

        let payload = memory.get_state_payload("dev").await.unwrap().unwrap();
        let state_file = StateFile::from_bytes(&payload.data).unwrap();
        assert!(state_file.is_empty());
        assert_eq!(state_file.serial, 0);
        assert!(memory.lock_holder("dev").is_none());
    }

    #[tokio::test]
    async fn test_state_mgr_existing_workspace_is_untouched() {
        let plugin = Arc::new(ScriptedPlugin::default());
        plugin.inner.insert_state("dev", b"existing".to_vec());
        let backend = backend_with(plugin.clone()).await;

        let mut state = backend.state_mgr("dev").await.unwrap();
        assert_eq!(plugin.calls(), vec!["configure", "list"]);

        state.refresh_state().await.unwrap();
        assert_eq!(state.state(), Some(&b"existing"[..]));
    }

    #[tokio::test]
    async fn test_state_mgr_creation_takes_init_lock() {
        let plugin = Arc::new(ScriptedPlugin::default());
        let backend = backend_with(plugin.clone()).await;

        backend.state_mgr("dev").await.unwrap();
        assert_eq!(
            plugin.calls(),
            vec!["configure", "list", "lock", "get", "put", "unlock"]
        );
        let locks = plugin.locks.lock().unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].operation, "init");
        assert_eq!(locks[0].path, "dev");
    }

    #[tokio::test]
    async fn test_lock_failure_aborts_before_any_write() {
        let plugin = Arc::new(ScriptedPlugin {
            fail_lock: true,
            ..Default::default()
        });
        let backend = backend_with(plugin.clone()).await;

        let err = backend.state_mgr("dev").await.err().unwrap();
        assert_eq!(err, BackendError::lock("dev", "lock table unavailable"));
        assert_eq!(plugin.calls(), vec!["configure", "list", "lock"]);
        assert_eq!(plugin.inner.put_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_still_unlocks() {
        let plugin = Arc::new(ScriptedPlugin {
            fail_get: true,
            ..Default::default()
        });
        let backend = backend_with(plugin.clone()).await;

        let err = backend.state_mgr("dev").await.err().unwrap();
        assert_eq!(
            err,
            BackendError::state_io("dev", ops::GET_STATE_PAYLOAD, "read timed out")
        );
        assert_eq!(
            plugin.calls(),
            vec!["configure", "list", "lock", "get", "unlock"]
        );
        assert!(plugin.inner.lock_holder("dev").is_none());
    }

    #[tokio::test]
    async fn test_unlock_failure_takes_precedence() {
        let plugin = Arc::new(ScriptedPlugin {
            fail_get: true,
            fail_unlock: true,
            ..Default::default()
        });
        let backend = backend_with(plugin).await;

        let err = backend.state_mgr("dev").await.err().unwrap();
        assert_eq!(err, BackendError::lock("dev", "lock table unavailable"));
    }

    #[tokio::test]
    async fn test_unlock_failure_after_successful_write() {
        let plugin = Arc::new(ScriptedPlugin {
            fail_unlock: true,
            ..Default::default()
        });
        let backend = backend_with(plugin.clone()).await;

        let err = backend.state_mgr("dev").await.err().unwrap();
        assert!(err.is_lock_error());
        assert_eq!(plugin.inner.put_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_race_keeps_winner_state() {
        // Another actor finishes creating the workspace between our listing
        // and our lock
        let hook: Box<dyn FnOnce(&MemoryPlugin) + Send> = Box::new(|memory: &MemoryPlugin| {
            memory.insert_state("dev", b"winner".to_vec());
        });
        let plugin = Arc::new(ScriptedPlugin {
            before_lock: Mutex::new(Some(hook)),
            ..Default::default()
        });
        let backend = backend_with(plugin.clone()).await;

        let mut state = backend.state_mgr("dev").await.unwrap();
        assert_eq!(plugin.inner.state("dev"), Some(b"winner".to_vec()));
        assert_eq!(plugin.inner.put_count(), 0);
        assert_eq!(state.state(), Some(&b"winner"[..]));

        state.refresh_state().await.unwrap();
        assert_eq!(state.state(), Some(&b"winner"[..]));
    }

    #[tokio::test]
    async fn test_concurrent_creation_writes_once() {
        let memory = Arc::new(MemoryPlugin::new());
        let a = backend_with(memory.clone()).await;
        let b = backend_with(memory.clone()).await;

        let (ra, rb) = tokio::join!(a.state_mgr("new"), b.state_mgr("new"));

        assert!(ra.is_ok() || rb.is_ok());
        for result in [&ra, &rb] {
            if let Err(err) = result {
                assert!(err.is_lock_error(), "unexpected error: {}", err);
            }
        }
        assert_eq!(memory.put_count(), 1);
        assert!(memory.state("new").is_some());
        assert!(memory.lock_holder("new").is_none());
    }

    #[tokio::test]
    async fn test_default_to_dev_scenario() {
        let memory = Arc::new(MemoryPlugin::new());
        let backend = backend_with(memory.clone()).await;
        assert_eq!(backend.workspaces().await.unwrap(), vec!["default"]);

        backend.state_mgr("dev").await.unwrap();
        let workspaces: HashSet<String> = backend.workspaces().await.unwrap().into_iter().collect();
        assert_eq!(
            workspaces,
            HashSet::from(["default".to_string(), "dev".to_string()])
        );

        let mut dev = backend.state_mgr("dev").await.unwrap();
        dev.refresh_state().await.unwrap();
        let data = dev.state().expect("dev state should be present");
        assert!(StateFile::from_bytes(data).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_handle_get_put_and_locks() {
        let memory = Arc::new(MemoryPlugin::new());
        let client = PluginStateClient::new("dev", memory.clone());

        assert_eq!(client.get().await.unwrap(), None);

        client.put(b"payload").await.unwrap();
        let payload = client.get().await.unwrap().unwrap();
        assert_eq!(payload.data, b"payload");
        assert_eq!(payload, StatePayload::new(b"payload".to_vec()));

        let token = client.lock(&LockInfo::new("apply")).await.unwrap();
        assert!(client.unlock("arbitrary").await.is_err());
        client.unlock(&token).await.unwrap();
        assert!(client.unlock(&token).await.is_err());

        client.delete().await.unwrap();
        assert_eq!(client.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_workspace_rejection_is_unchanged() {
        let memory = Arc::new(MemoryPlugin::new());
        let backend = backend_with(memory.clone()).await;

        let mut dev = backend.state_mgr("dev").await.unwrap();
        dev.write_state(br#"{"version":1,"serial":1,"lineage":"l","drydock_version":"0.1.0","resources":[{"name":"vpc"}]}"#.to_vec());
        dev.persist_state().await.unwrap();

        let expected = memory.delete_workspace("dev", false).await.unwrap_err();
        let err = backend.delete_workspace("dev", false).await.unwrap_err();
        assert_eq!(err, expected);
        assert_eq!(
            err.to_string(),
            "Plugin call delete_workspace failed: workspace dev is not empty"
        );

        backend.delete_workspace("dev", true).await.unwrap();
        assert_eq!(backend.workspaces().await.unwrap(), vec!["default"]);
    }

    #[tokio::test]
    async fn test_state_handle_reaches_interrupted_creation() {
        let plugin = Arc::new(ScriptedPlugin::default());
        let stuck = LockInfo::new(INIT_OPERATION);
        let token = plugin.inner.lock_state("staging", &stuck).await.unwrap();
        let backend = backend_with(plugin.clone()).await;

        // Creating through state_mgr runs into the leftover lock
        let err = backend.state_mgr("staging").await.err().unwrap();
        assert_eq!(err, BackendError::locked("staging", &stuck));

        let state = backend.state_handle("staging");
        state.unlock(&token).await.unwrap();
        assert!(plugin.inner.lock_holder("staging").is_none());
    }

    #[tokio::test]
    async fn test_state_handle_does_not_create_workspace() {
        let plugin = Arc::new(ScriptedPlugin::default());
        let backend = backend_with(plugin.clone()).await;

        let mut state = backend.state_handle("ghost");
        state.refresh_state().await.unwrap();
        assert_eq!(state.state(), None);

        assert_eq!(plugin.calls(), vec!["configure", "get"]);
        assert_eq!(plugin.inner.put_count(), 0);
        assert_eq!(backend.workspaces().await.unwrap(), vec!["default"]);
    }

    #[tokio::test]
    async fn test_close_releases_plugin() {
        let plugin = Arc::new(ScriptedPlugin::default());
        let backend = backend_with(plugin.clone()).await;
        backend.close().await.unwrap();
        assert_eq!(plugin.closed.load(Ordering::SeqCst), 1);
    }
}
