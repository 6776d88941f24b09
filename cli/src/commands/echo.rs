use anyhow::Context;
use forkrpc_echo::Request;

use crate::cli::EchoArgs;
use crate::commands::print_json;
use crate::config::MergedConfig;
use crate::error::CliResult;
use crate::session::{close_session, open_session};

pub async fn execute(args: EchoArgs, config: MergedConfig) -> CliResult<()> {
    let session = open_session(&config).await?;

    let result = async {
        for text in args.text {
            let reply: String = session
                .converse(|conv| async move { conv.call(&Request::Echo(text)).await })
                .await
                .context("echo request failed")?;
            print_json(&reply)?;
        }
        Ok(())
    }
    .await;

    close_session(session, result).await
}
