mod submit;
mod worker;

pub use self::{
    submit::{submit, SubmitArgs},
    worker::{worker, WorkerArgs},
};

/// Subcommand for the program.
#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    /// Start a node that listens for connections, seeds into the mesh, and serves tasks and
    /// blocks to the rest of the fabric.
    Worker(WorkerArgs),
    /// Connect to a running worker mesh and drive a small demo job against it.
    Submit(SubmitArgs),
}
