use std::time::Duration;

use marcus_core::models::Role;
use marcus_protocol::{Envelope, ToolHandler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// One request frame: newline-delimited JSON on stdin.
///
/// Authentication happens upstream; frames arrive already tagged with the
/// caller's role. `deadline_ms` is how long the caller will keep waiting.
#[derive(Debug, Deserialize)]
struct RequestFrame {
    #[serde(default)]
    id: Option<Value>,
    role: Role,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

/// One response frame: the envelope plus the echoed request id.
#[derive(Debug, Serialize)]
struct ResponseFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(flatten)]
    envelope: Envelope,
}

/// Serve newline-delimited JSON over the given reader/writer until EOF.
/// Malformed lines answer with an error envelope instead of killing the
/// session.
pub async fn serve<R, W>(handler: ToolHandler, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RequestFrame>(&line) {
            Ok(frame) => {
                let deadline = frame.deadline_ms.map(Duration::from_millis);
                let envelope = handler
                    .dispatch(frame.role, &frame.method, frame.params, deadline)
                    .await;
                ResponseFrame { id: frame.id, envelope }
            }
            Err(err) => ResponseFrame {
                id: None,
                envelope: Envelope::error(&marcus_core::CoreError::Validation(format!(
                    "malformed request frame: {err}"
                ))),
            },
        };
        let mut payload = serde_json::to_vec(&response).unwrap_or_else(|_| {
            b"{\"ok\":false,\"error_kind\":\"PersistenceFailure\"}".to_vec()
        });
        payload.push(b'\n');
        writer.write_all(&payload).await?;
        writer.flush().await?;
    }
    Ok(())
}
