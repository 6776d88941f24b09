use anyhow::Context;
use forkrpc_echo::{Request, RunControl, RunEvent};

use crate::cli::RunArgs;
use crate::commands::print_json;
use crate::config::MergedConfig;
use crate::error::CliResult;
use crate::session::{close_session, open_session};

pub async fn execute(args: RunArgs, config: MergedConfig) -> CliResult<()> {
    let session = open_session(&config).await?;

    let result = session
        .converse(|conv| async move {
            conv.put(&Request::Run {
                ticks: args.ticks,
                tick_ms: args.tick_ms,
            })
            .await?;

            let mut lines = 0;
            loop {
                let event: RunEvent = conv.get().await?;
                print_json(&event).map_err(|e| forkrpc::Error::application(e.to_string()))?;

                match event {
                    RunEvent::Output(_) => {
                        lines += 1;
                        if args.interrupt_after == Some(lines) {
                            tracing::info!(lines, "interrupting run");
                            conv.put(&RunControl::Interrupt).await?;
                        }
                    }
                    RunEvent::Done { .. } => {
                        conv.put(&RunControl::Finish).await?;
                        return Ok(());
                    }
                }
            }
        })
        .await
        .context("run request failed");

    close_session(session, result).await
}
