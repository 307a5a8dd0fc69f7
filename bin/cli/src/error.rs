use std::fmt;

use error_stack::Context;

#[derive(Debug)]
pub struct CliError;

impl fmt::Display for CliError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("the compute fabric node encountered an error during execution")
    }
}

impl Context for CliError {}
