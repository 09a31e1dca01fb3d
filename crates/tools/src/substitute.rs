//! Variable substitution for prompts, greetings and tool payloads
//!
//! A single left-to-right pass replaces `{name}` placeholders with values
//! from the variable map. Values are inserted verbatim: a value containing
//! `{...}` is never re-expanded, which keeps pre-call results (untrusted
//! data) from smuggling new placeholders into a template. Unknown
//! placeholders stay literal.
//!
//! `${VAR}` environment expansion is separate and runs per tool at request
//! build time, never globally at configuration load.

use std::collections::HashMap;

/// Substituted values are truncated to this many characters.
pub const MAX_VARIABLE_LEN: usize = 512;

fn is_placeholder_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Truncate on a char boundary.
fn truncated(value: &str) -> &str {
    match value.char_indices().nth(MAX_VARIABLE_LEN) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

/// Replace `{name}` placeholders in one pass.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];

        let name_len = after_open
            .char_indices()
            .take_while(|(_, c)| is_placeholder_char(*c))
            .count();
        let name = &after_open[..name_len];

        if name_len > 0 && after_open[name_len..].starts_with('}') {
            match vars.get(name) {
                Some(value) => output.push_str(truncated(value)),
                // Unknown placeholders remain literal.
                None => {
                    output.push('{');
                    output.push_str(name);
                    output.push('}');
                }
            }
            rest = &after_open[name_len + 1..];
        } else {
            output.push('{');
            rest = after_open;
        }
    }
    output.push_str(rest);
    output
}

/// Expand `${VAR}` from the process environment. Unset variables expand to
/// the empty string, with a warning naming the variable.
pub fn expand_env(template: &str) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("${") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];

        match after_open.find('}') {
            Some(close) => {
                let name = &after_open[..close];
                match std::env::var(name) {
                    Ok(value) => output.push_str(&value),
                    Err(_) => {
                        tracing::warn!(variable = %name, "environment variable not set for tool template");
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                output.push_str("${");
                rest = after_open;
            }
        }
    }
    output.push_str(rest);
    output
}
