//! Building remote shell command lines.
//!
//! Every path that ends up inside a command string sent to the remote shell
//! goes through [`quote`], which single-quotes it POSIX-style.

use std::borrow::Cow;
use crate::config::{INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER};
use crate::error::RunError;

/// Quote one argument for a POSIX shell
pub fn quote(arg: &str) -> Result<Cow<'_, str>, RunError> {
    shlex::try_quote(arg).map_err(|_| RunError::InvalidPath(arg.to_string()))
}

/// Substitute quoted `input`/`output` paths into a conversion template
///
/// Placeholders are resolved in a single left-to-right pass over the
/// template, so text inside a substituted path is never rescanned.
pub fn render_convert_command(template: &str, input: &str, output: &str) -> Result<String, RunError> {
    let input = quote(input)?;
    let output = quote(output)?;
    let mut rendered = String::with_capacity(template.len() + input.len() + output.len());
    let mut rest = template;
    loop {
        let next = [(INPUT_PLACEHOLDER, &input), (OUTPUT_PLACEHOLDER, &output)]
            .into_iter()
            .filter_map(|(token, value)| rest.find(token).map(|at| (at, token, value)))
            .min_by_key(|(at, _, _)| *at);
        match next {
            Some((at, token, value)) => {
                rendered.push_str(&rest[..at]);
                rendered.push_str(value);
                rest = &rest[at + token.len()..];
            }
            None => {
                rendered.push_str(rest);
                return Ok(rendered);
            }
        }
    }
}

/// `rm -f` for a set of remote files
pub fn remove_files_command(paths: &[&str]) -> Result<String, RunError> {
    let mut cmd = String::from("rm -f");
    for p in paths {
        cmd.push(' ');
        cmd.push_str(&quote(p)?);
    }
    Ok(cmd)
}
