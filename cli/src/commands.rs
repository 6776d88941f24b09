pub mod count;
pub mod crash;
pub mod echo;
pub mod env;
pub mod run;

use serde::Serialize;

use crate::error::CliResult;

/// Print one response as a JSON line
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
