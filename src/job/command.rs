//! Argument-list commands for external tools.
//!
//! Commands are kept as a program plus a list of arguments. Templates are
//! expanded one argument at a time, so a substituted path containing spaces
//! or quotes stays a single argument. Rendering for scripts and recipes quotes
//! each argument for POSIX shells.

use crate::config::ToolConfig;
use std::borrow::Cow;
use std::fmt;
use std::process::Output;

/// Values substituted into `{name}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: Vec<(&'static str, String)>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a variable.
    pub fn set(mut self, name: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.vars.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((name, value)),
        }
        self
    }

    /// Expand every known placeholder in one argument template.
    pub fn expand(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (name, value) in &self.vars {
            let placeholder = format!("{{{}}}", name);
            if out.contains(&placeholder) {
                out = out.replace(&placeholder, value);
            }
        }
        out
    }
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build from a configured tool, expanding each argument template.
    pub fn from_tool(tool: &ToolConfig, vars: &TemplateVars) -> Self {
        Self {
            program: vars.expand(&tool.program),
            args: tool.args.iter().map(|a| vars.expand(a)).collect(),
        }
    }

    /// Shell-quoted command line.
    pub fn render(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Tokio command with the program and arguments set.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Run to completion, capturing stdout and stderr.
    pub async fn output(&self) -> std::io::Result<Output> {
        self.to_command().output().await
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote one word for a POSIX shell.
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    let safe = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"_@%+=:,./-".contains(&b));
    if safe {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}
