use anyhow::Context;
use forkrpc_echo::Request;

use crate::cli::CrashArgs;
use crate::commands::print_json;
use crate::config::MergedConfig;
use crate::error::CliResult;
use crate::session::open_session;

/// Print responses until the server dies, then report how it died
pub async fn execute(args: CrashArgs, config: MergedConfig) -> CliResult<()> {
    let session = open_session(&config).await?;

    let received: forkrpc::Result<()> = session
        .converse(|conv| async move {
            conv.put(&Request::CountThenCrash {
                from: args.from,
                crash_after: args.after,
            })
            .await?;
            loop {
                let n: u32 = conv.get().await?;
                print_json(&n).map_err(|e| forkrpc::Error::application(e.to_string()))?;
            }
        })
        .await;

    // The loop only ends with an error; a dead server needs no shutdown.
    received.context("server stopped answering")
}
