//! Newline-delimited JSON-RPC over stdin/stdout.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::mcp::rpc::{json_rpc_error, PARSE_ERROR};
use crate::mcp::server::ProtocolServer;

/// Serves one protocol server over a line-oriented reader/writer pair until EOF.
pub async fn serve<R, W>(
    server: Arc<dyn ProtocolServer>,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Value>(line) {
            Ok(message) => server.handle_message(message).await,
            Err(err) => {
                debug!(error = %err, "discarding unparseable stdio frame");
                Some(json_rpc_error(None, PARSE_ERROR, "Parse error"))
            }
        };

        if let Some(reply) = reply {
            let mut frame = reply.to_string();
            frame.push('\n');
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await?;
        }
    }

    info!("stdin closed, stopping stdio transport");
    Ok(())
}

pub async fn serve_stdio(server: Arc<dyn ProtocolServer>) -> std::io::Result<()> {
    info!("AgentMail MCP Server running on stdio");
    let reader = tokio::io::BufReader::new(tokio::io::stdin());
    serve(server, reader, tokio::io::stdout()).await
}
