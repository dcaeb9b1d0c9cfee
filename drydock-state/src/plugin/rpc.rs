//! RPC client for plugins running as child processes

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::BackendPlugin;
use super::protocol::{
    ConfigureParams, DISPENSE_METHOD, DeleteWorkspaceParams, DispenseParams, Handshake,
    LockStateParams, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PLUGIN_NAME, PutStateParams, Request,
    Response, RpcError, UnlockStateParams, WirePayload, WorkspaceParams, method_name, ops,
};
use crate::backend::{BackendError, BackendResult};
use crate::lock::LockInfo;
use crate::state::StatePayload;

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A live session with a backend plugin
///
/// The session is established once (handshake, then dispense) and every call
/// reuses it. If the plugin goes away, calls fail with
/// [`BackendError::Connection`]; nothing reconnects.
pub struct RpcPlugin {
    session: Mutex<Session>,
}

struct Session {
    /// The plugin process, when we spawned it
    child: Option<Child>,
    reader: Reader,
    writer: Writer,
    next_id: u64,
    closed: bool,
}

/// Why a single request failed
enum CallFailure {
    /// The pipe broke or the plugin exited
    Connection(String),
    /// The plugin answered with an error
    Remote(RpcError),
    /// The request could not be encoded
    Malformed(String),
}

impl CallFailure {
    fn into_backend(self, operation: &str, workspace: Option<&str>) -> BackendError {
        match self {
            Self::Connection(message) => match workspace {
                Some(workspace) => BackendError::connection(format!(
                    "{} on workspace {}: {}",
                    operation, workspace, message
                )),
                None => BackendError::connection(format!("{}: {}", operation, message)),
            },
            Self::Remote(error) => error.into_backend(operation, workspace),
            Self::Malformed(message) => BackendError::protocol(operation, message),
        }
    }
}

impl RpcPlugin {
    /// Start the plugin with `sh -c <source>` and establish a session
    pub async fn spawn(source: &str) -> BackendResult<Self> {
        info!("starting backend plugin: {}", source);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(source)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::connection(format!("failed to start plugin `{}`: {}", source, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::connection("plugin stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::connection("plugin stdout was not captured"))?;

        Self::establish(Session {
            child: Some(child),
            reader: Box::new(BufReader::new(stdout)),
            writer: Box::new(stdin),
            next_id: 1,
            closed: false,
        })
        .await
    }

    /// Establish a session over already-connected streams
    pub async fn connect<R, W>(reader: R, writer: W) -> BackendResult<Self>
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(Session {
            child: None,
            reader: Box::new(reader),
            writer: Box::new(writer),
            next_id: 1,
            closed: false,
        })
        .await
    }

    async fn establish(mut session: Session) -> BackendResult<Self> {
        let result = async {
            session.handshake().await?;
            session.dispense().await
        }
        .await;

        if let Err(err) = result {
            session.shutdown().await;
            return Err(err);
        }

        info!("backend plugin session established");
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        workspace: Option<&str>,
        params: impl Serialize,
    ) -> BackendResult<T> {
        let params = serde_json::to_value(params).map_err(|e| {
            BackendError::protocol(operation, format!("failed to encode parameters: {}", e))
        })?;

        let value = {
            let mut session = self.session.lock().await;
            session
                .request(&method_name(operation), params)
                .await
                .map_err(|failure| failure.into_backend(operation, workspace))?
        };

        serde_json::from_value(value).map_err(|e| {
            BackendError::protocol(operation, format!("unexpected result from plugin: {}", e))
        })
    }
}

impl Session {
    async fn handshake(&mut self) -> BackendResult<()> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.map_err(|e| {
            BackendError::connection(format!("failed to read plugin handshake: {}", e))
        })?;
        if read == 0 {
            return Err(BackendError::connection(
                "plugin exited before completing the handshake",
            ));
        }

        let handshake = Handshake::parse(&line).map_err(|e| {
            BackendError::connection(format!("unexpected handshake from plugin: {}", e))
        })?;
        handshake
            .check_compatible()
            .map_err(BackendError::Connection)?;

        debug!("plugin handshake: {}", handshake);
        Ok(())
    }

    async fn dispense(&mut self) -> BackendResult<()> {
        let params = serde_json::to_value(DispenseParams {
            name: PLUGIN_NAME.to_string(),
        })
        .map_err(|e| BackendError::protocol("dispense", e.to_string()))?;

        self.request(DISPENSE_METHOD, params)
            .await
            .map(|_| ())
            .map_err(|failure| failure.into_backend("dispense", None))
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, CallFailure> {
        if self.closed {
            return Err(CallFailure::Connection(
                "plugin session is closed".to_string(),
            ));
        }

        let id = self.next_id;
        self.next_id += 1;

        let line = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| CallFailure::Malformed(format!("failed to encode request: {}", e)))?;

        debug!("→ {} (id {})", method, id);
        if let Err(e) = self.write_line(&line).await {
            self.closed = true;
            return Err(CallFailure::Connection(format!(
                "failed to write to plugin: {}",
                e
            )));
        }

        loop {
            let mut buf = String::new();
            let read = match self.reader.read_line(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    self.closed = true;
                    return Err(CallFailure::Connection(format!(
                        "failed to read from plugin: {}",
                        e
                    )));
                }
            };
            if read == 0 {
                self.closed = true;
                return Err(CallFailure::Connection(
                    "plugin process exited".to_string(),
                ));
            }

            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            // An unmatched line leaves the stream out of step for good
            let response: Response = match serde_json::from_str(trimmed) {
                Ok(response) => response,
                Err(e) => {
                    self.closed = true;
                    return Err(CallFailure::Connection(format!(
                        "invalid response from plugin: {}",
                        e
                    )));
                }
            };
            if response.id != Some(id) {
                self.closed = true;
                return Err(CallFailure::Connection(format!(
                    "response id {:?} does not match request id {}",
                    response.id, id
                )));
            }

            debug!("← {} (id {})", method, id);
            if let Some(error) = response.error {
                return Err(CallFailure::Remote(error));
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    async fn shutdown(&mut self) {
        self.closed = true;
        // Closing stdin lets a well-behaved plugin exit on its own
        let _ = self.writer.shutdown().await;

        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(()) => debug!("backend plugin stopped"),
                Err(e) => warn!("failed to stop backend plugin: {}", e),
            }
        }
    }
}

#[async_trait]
impl BackendPlugin for RpcPlugin {
    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        self.call(ops::LIST_WORKSPACES, None, serde_json::json!({}))
            .await
    }

    async fn delete_workspace(&self, workspace: &str, force: bool) -> BackendResult<()> {
        let params = DeleteWorkspaceParams {
            workspace: workspace.to_string(),
            force,
        };
        self.call(ops::DELETE_WORKSPACE, Some(workspace), params)
            .await
    }

    async fn configure(&self, config: &HashMap<String, String>) -> BackendResult<()> {
        let params = ConfigureParams {
            config: config.clone(),
        };
        self.call(ops::CONFIGURE, None, params).await
    }

    async fn get_state_payload(&self, workspace: &str) -> BackendResult<Option<StatePayload>> {
        let params = WorkspaceParams {
            workspace: workspace.to_string(),
        };
        let payload: Option<WirePayload> = self
            .call(ops::GET_STATE_PAYLOAD, Some(workspace), params)
            .await?;
        Ok(payload.map(StatePayload::from))
    }

    async fn put_state(&self, workspace: &str, data: &[u8]) -> BackendResult<()> {
        let params = PutStateParams {
            workspace: workspace.to_string(),
            data: data.to_vec(),
        };
        self.call(ops::PUT_STATE, Some(workspace), params).await
    }

    async fn delete_state(&self, workspace: &str) -> BackendResult<()> {
        let params = WorkspaceParams {
            workspace: workspace.to_string(),
        };
        self.call(ops::DELETE_STATE, Some(workspace), params).await
    }

    async fn lock_state(&self, workspace: &str, info: &LockInfo) -> BackendResult<String> {
        let params = LockStateParams {
            workspace: workspace.to_string(),
            info: info.clone(),
        };
        self.call(ops::LOCK_STATE, Some(workspace), params).await
    }

    async fn unlock_state(&self, workspace: &str, token: &str) -> BackendResult<()> {
        let params = UnlockStateParams {
            workspace: workspace.to_string(),
            token: token.to_string(),
        };
        self.call(ops::UNLOCK_STATE, Some(workspace), params).await
    }

    async fn close(&self) -> BackendResult<()> {
        self.session.lock().await.shutdown().await;
        Ok(())
    }
}
