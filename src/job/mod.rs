//! Job scripts and the commands inside them.

mod builder;
mod command;

pub use builder::JobBuilder;
pub use command::{shell_quote, CommandSpec, TemplateVars};
