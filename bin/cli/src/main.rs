mod args;
mod error;
mod subcommand;

use error_stack::{Result, ResultExt};

use self::{args::Args, error::CliError, subcommand::Subcommand};

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let Args { config, subcommand } = Args::parse_args();

    config::logging::init_logger(config.log_format, &config.output_location, config.log_level)
        .change_context(CliError)
        .attach_printable("could not initialize logging")?;

    match subcommand {
        Subcommand::Worker(args) => subcommand::worker(config, args).await,
        Subcommand::Submit(args) => subcommand::submit(config, args).await,
    }
}
