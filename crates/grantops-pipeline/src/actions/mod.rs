//! Built-in [`ActionInterface`](crate::action::ActionInterface) implementations.

pub mod command;
pub mod dry_run;

pub use command::CommandAction;
pub use dry_run::DryRunAction;
