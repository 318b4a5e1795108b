//! Main loop of the sandboxed engine process.
//!
//! Announces readiness with one `engine-ready` frame, then answers each
//! `engine-operation` line with one `engine-response` line until stdin closes.
//! Operations are handled strictly one at a time.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use super::operation::OperationHandler;
use crate::messages::{
    EngineMessage, EngineOperation, EngineResponse, MAX_FRAME_BYTES, MessageError,
    SandboxMessage, decode_message, encode_message,
};

pub async fn serve<R, W>(reader: R, writer: W, handler: &OperationHandler) -> Result<(), MessageError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let mut sink = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

    let pid = std::process::id();
    sink.send(encode_message(&EngineMessage::EngineReady { pid })?)
        .await?;
    info!(pid, "engine ready");

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match decode_operation(&line) {
            Ok(operation) => {
                debug!(operation_type = ?operation.operation_type(), "handling operation");
                handler.handle(operation).await
            }
            Err(err) => {
                warn!(error = %err, "rejecting undecodable operation");
                EngineResponse::error(err.to_string())
            }
        };
        sink.send(encode_message(&response.into_message())?).await?;
    }

    info!("input closed, engine exiting");
    Ok(())
}

fn decode_operation(line: &str) -> Result<EngineOperation, MessageError> {
    let message: SandboxMessage = decode_message(line)?;
    EngineOperation::from_message(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FlowExecutor;
    use crate::messages::ResponseStatus;
    use crate::pieces::builtin;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn answers_each_operation_after_ready() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(async move {
            let handler = OperationHandler::new(FlowExecutor::new(builtin::registry()));
            serve(server_read, server_write, &handler).await
        });

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut replies = BufReader::new(client_read).lines();

        let ready: EngineMessage = decode_message(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(ready, EngineMessage::EngineReady { .. }));

        let request = encode_message(&EngineOperation::ExtractPieceMetadata.into_message().unwrap()).unwrap();
        client_write.write_all(format!("{request}\nnot json\n").as_bytes()).await.unwrap();

        let first: EngineMessage = decode_message(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(first, EngineMessage::EngineResponse { status: ResponseStatus::Ok, .. }));
        let second: EngineMessage = decode_message(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(second, EngineMessage::EngineResponse { status: ResponseStatus::Error, .. }));

        client_write.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
