//! flowrunner-engine - the sandboxed engine process.
//!
//! Spawned by the worker for each sandbox. Reads `engine-operation` frames from
//! stdin and writes one `engine-response` per operation to stdout. Logs go to
//! stderr, which the worker keeps for crash classification.

use anyhow::{Context, Result};
use tracing::info;

use flowrunner::engine::{FlowExecutor, OperationHandler, PieceRetryPolicy, process};
use flowrunner::observability::{self, ObservabilityOptions};
use flowrunner::pieces::builtin;

fn main() -> Result<()> {
    observability::init(ObservabilityOptions::engine());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build engine runtime")?;

    runtime.block_on(async {
        let retry_policy = PieceRetryPolicy::from_env();
        info!(piece_retry_attempts = retry_policy.max_attempts(), "engine starting");

        let executor = FlowExecutor::new(builtin::registry()).with_retry_policy(retry_policy);
        let handler = OperationHandler::new(executor);
        process::serve(tokio::io::stdin(), tokio::io::stdout(), &handler)
            .await
            .context("engine protocol loop failed")?;

        info!("stdin closed, engine exiting");
        Ok(())
    })
}
