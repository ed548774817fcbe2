use exportdesk_core::workflows::WorkflowCatalog;

use crate::commands::{finish, load_config, open_database, runtime, CommandResult, StepFailure};

/// Startup preflight: everything the server needs before it binds, without binding.
pub fn run() -> CommandResult {
    let config = match load_config("start") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("start") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        pool.close().await;
        Ok::<(), StepFailure>(())
    });

    finish("start", result, |()| {
        CommandResult::success(
            "start",
            format!(
                "preflight passed: database ready, {} workflow definitions loaded, server would bind {}",
                WorkflowCatalog::builtin().definitions().len(),
                config.server_address()
            ),
        )
    })
}
