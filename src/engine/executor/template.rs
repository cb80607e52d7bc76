//! Command templates.
//!
//! Compile and run command lines are written as static token lists with
//! `{placeholder}` substitutions. A token that is exactly `{flags}` or
//! `{sources}` expands into several arguments; every other placeholder is
//! substituted inside its token.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::{JudgeError, Result};

/// Values available to a template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// Main command of the language: compiler for compiled languages,
    /// interpreter for scripted ones.
    pub command: &'a Path,
    pub runtimes: &'a BTreeMap<String, PathBuf>,
    pub sources: &'a [PathBuf],
    pub executable: &'a Path,
    pub flags: &'a [String],
    pub workdir: &'a Path,
}

pub fn expand(template: &[&str], ctx: &TemplateContext<'_>) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(template.len());
    for token in template {
        match *token {
            "{flags}" => out.extend(ctx.flags.iter().cloned()),
            "{sources}" => out.extend(ctx.sources.iter().map(|s| s.display().to_string())),
            _ => out.push(substitute(token, ctx)?),
        }
    }
    Ok(out)
}

/// Substitute every `{name}` inside one token.
pub fn substitute(token: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let end = rest[start..]
            .find('}')
            .map(|i| start + i)
            .ok_or_else(|| JudgeError::internal(format!("Unterminated placeholder in {:?}", token)))?;
        out.push_str(&lookup(&rest[start + 1..end], ctx)?);
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup(name: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    let path = match name {
        "compiler" | "runtime" => ctx.command,
        "executable" => ctx.executable,
        "workdir" => ctx.workdir,
        "source" => ctx
            .sources
            .first()
            .ok_or_else(|| JudgeError::internal("Template needs a source file but none was given"))?,
        _ => match name.strip_prefix("runtime:") {
            Some(key) => ctx
                .runtimes
                .get(key)
                .ok_or_else(|| JudgeError::internal(format!("Runtime {:?} is not configured", key)))?,
            None => {
                return Err(JudgeError::internal(format!(
                    "Unknown template placeholder {{{}}}",
                    name
                )))
            }
        },
    };
    Ok(path.display().to_string())
}
