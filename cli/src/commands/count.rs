use anyhow::Context;
use forkrpc_echo::Request;

use crate::cli::CountArgs;
use crate::commands::print_json;
use crate::config::MergedConfig;
use crate::error::CliResult;
use crate::session::{close_session, open_session};

pub async fn execute(args: CountArgs, config: MergedConfig) -> CliResult<()> {
    let session = open_session(&config).await?;

    let result = session
        .converse(|conv| async move {
            conv.put(&Request::Count(args.from)).await?;
            loop {
                let n: u32 = conv.get().await?;
                print_json(&n).map_err(|e| forkrpc::Error::application(e.to_string()))?;
                if n == 0 {
                    return Ok(());
                }
            }
        })
        .await
        .context("count request failed");

    close_session(session, result).await
}
