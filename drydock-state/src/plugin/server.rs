//! Plugin-side request loop

use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::BackendPlugin;
use super::protocol::{
    ConfigureParams, DISPENSE_METHOD, DeleteWorkspaceParams, DispenseParams, Handshake,
    LockStateParams, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PLUGIN_NAME, PutStateParams, Request,
    Response, RpcError, UnlockStateParams, WirePayload, WorkspaceParams, codes, operation_name,
    ops,
};

/// Serve `plugin` to the Drydock process that launched us, over stdin/stdout
///
/// Refuses to run when the magic cookie is missing, which means the binary
/// was started by hand rather than by Drydock.
pub async fn serve<P: BackendPlugin + ?Sized>(plugin: &P) -> std::io::Result<()> {
    if std::env::var(MAGIC_COOKIE_KEY).as_deref() != Ok(MAGIC_COOKIE_VALUE) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "this binary is a Drydock backend plugin and is not meant to be run directly",
        ));
    }

    serve_io(
        plugin,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Serve `plugin` over arbitrary streams until the reader reaches EOF
pub async fn serve_io<P, R, W>(plugin: &P, mut reader: R, mut writer: W) -> std::io::Result<()>
where
    P: BackendPlugin + ?Sized,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_line(&mut writer, &Handshake::current().to_string()).await?;

    let mut dispensed = false;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            info!("host closed the connection");
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                warn!("invalid request: {}", e);
                let response =
                    Response::failure(None, RpcError::new(codes::PARSE_ERROR, e.to_string()));
                write_response(&mut writer, &response).await?;
                continue;
            }
        };

        debug!("← {} (id {})", request.method, request.id);
        let outcome = if request.method == DISPENSE_METHOD {
            dispense(request.params).map(|()| {
                dispensed = true;
                Value::Bool(true)
            })
        } else if let Some(operation) = operation_name(&request.method) {
            if dispensed {
                dispatch(plugin, operation, request.params).await
            } else {
                Err(RpcError::new(
                    codes::PROTOCOL,
                    "the backend has not been dispensed",
                ))
            }
        } else {
            Err(RpcError::new(
                codes::METHOD_NOT_FOUND,
                format!("unknown method: {}", request.method),
            ))
        };

        let response = match outcome {
            Ok(result) => Response::success(request.id, result),
            Err(error) => {
                debug!("{} failed: {}", request.method, error.message);
                Response::failure(Some(request.id), error)
            }
        };
        write_response(&mut writer, &response).await?;
    }
}

fn dispense(params: Value) -> Result<(), RpcError> {
    let params: DispenseParams = parse(params)?;
    if params.name != PLUGIN_NAME {
        return Err(RpcError::new(
            codes::PROTOCOL,
            format!("unknown plugin: {}", params.name),
        ));
    }
    Ok(())
}

async fn dispatch<P: BackendPlugin + ?Sized>(
    plugin: &P,
    operation: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match operation {
        ops::LIST_WORKSPACES => to_value(plugin.list_workspaces().await),
        ops::DELETE_WORKSPACE => {
            let p: DeleteWorkspaceParams = parse(params)?;
            to_value(plugin.delete_workspace(&p.workspace, p.force).await)
        }
        ops::CONFIGURE => {
            let p: ConfigureParams = parse(params)?;
            to_value(plugin.configure(&p.config).await)
        }
        ops::GET_STATE_PAYLOAD => {
            let p: WorkspaceParams = parse(params)?;
            let payload = plugin.get_state_payload(&p.workspace).await;
            to_value(payload.map(|payload| payload.map(WirePayload::from)))
        }
        ops::PUT_STATE => {
            let p: PutStateParams = parse(params)?;
            to_value(plugin.put_state(&p.workspace, &p.data).await)
        }
        ops::DELETE_STATE => {
            let p: WorkspaceParams = parse(params)?;
            to_value(plugin.delete_state(&p.workspace).await)
        }
        ops::LOCK_STATE => {
            let p: LockStateParams = parse(params)?;
            to_value(plugin.lock_state(&p.workspace, &p.info).await)
        }
        ops::UNLOCK_STATE => {
            let p: UnlockStateParams = parse(params)?;
            to_value(plugin.unlock_state(&p.workspace, &p.token).await)
        }
        other => Err(RpcError::new(
            codes::METHOD_NOT_FOUND,
            format!("unknown method: backend.{}", other),
        )),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(codes::INVALID_PARAMS, format!("invalid params: {}", e)))
}

fn to_value<T: Serialize>(
    result: crate::backend::BackendResult<T>,
) -> Result<Value, RpcError> {
    let value = result.map_err(|e| RpcError::from_backend(&e))?;
    serde_json::to_value(value)
        .map_err(|e| RpcError::new(codes::PROTOCOL, format!("failed to encode result: {}", e)))
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> std::io::Result<()> {
    let line = serde_json::to_string(response)?;
    write_line(writer, &line).await
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
