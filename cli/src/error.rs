use std::process::ExitCode;

use forkrpc::ErrorKind;

pub type CliResult<T> = anyhow::Result<T>;

/// Exit status when the server reported a fault for the request
const EXIT_REMOTE_FAULT: u8 = 2;
/// Exit status when the server process went away
const EXIT_SERVER_GONE: u8 = 3;

/// Convert a CliResult to an ExitCode, printing errors to stderr
pub fn to_exit_code(result: CliResult<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let rpc = rpc_error(&e);
            match rpc.and_then(forkrpc::Error::as_external) {
                Some(failure) if failure.exit_code().is_some() => {
                    eprintln!("error: {e}");
                    eprintln!("server stderr:");
                    for line in failure.message().lines() {
                        eprintln!("  | {line}");
                    }
                }
                _ => {
                    eprintln!("error: {e}");
                    for cause in e.chain().skip(1) {
                        eprintln!("  caused by: {cause}");
                    }
                }
            }
            ExitCode::from(exit_status(rpc.map(forkrpc::Error::kind)))
        }
    }
}

fn rpc_error(e: &anyhow::Error) -> Option<&forkrpc::Error> {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<forkrpc::Error>())
}

fn exit_status(kind: Option<ErrorKind>) -> u8 {
    match kind {
        Some(ErrorKind::RemoteDecode | ErrorKind::RemoteApplication) => EXIT_REMOTE_FAULT,
        Some(ErrorKind::ServerExited | ErrorKind::ServerKilled | ErrorKind::ChannelClosed) => {
            EXIT_SERVER_GONE
        }
        _ => 1,
    }
}
