use anyhow::Context;
use forkrpc_echo::Request;

use crate::cli::EnvArgs;
use crate::commands::print_json;
use crate::config::MergedConfig;
use crate::error::CliResult;
use crate::session::{close_session, open_session};

pub async fn execute(args: EnvArgs, config: MergedConfig) -> CliResult<()> {
    let session = open_session(&config).await?;

    let change = match (args.set, args.unset) {
        (Some(value), _) => Some(Some(value)),
        (None, true) => Some(None),
        (None, false) => None,
    };

    let result = async {
        if let Some(value) = change {
            let key = args.key.clone();
            let previous: Vec<Option<String>> = session
                .converse(|conv| async move { conv.call(&Request::SetEnv(vec![(key, value)])).await })
                .await
                .context("failed to change server environment")?;
            tracing::debug!(?previous, "previous value");
        }

        let key = args.key.clone();
        let value: Option<String> = session
            .converse(|conv| async move { conv.call(&Request::GetEnv(key)).await })
            .await
            .context("failed to read server environment")?;
        print_json(&value)
    }
    .await;

    close_session(session, result).await
}
