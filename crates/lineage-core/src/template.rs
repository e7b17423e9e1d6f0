//! Rendering of probe program templates.
//!
//! Templates use the [leon](https://docs.rs/leon) syntax: `{name}` is replaced by
//! the variable `name`, literal braces are written `\{` and `\}`.

use std::{borrow::Cow, collections::BTreeMap, collections::HashMap};

use serde_yaml::Value;
use thiserror::Error;

/// Variables available to a program template.
pub type Variables = BTreeMap<String, Value>;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("invalid program template")]
    Parse(#[from] leon::ParseError),
    #[error("cannot render program template")]
    Render(#[from] leon::RenderError),
}

/// Render `template` replacing every placeholder with its variable.
pub fn render(template: &str, variables: &Variables) -> Result<String, TemplateError> {
    let template = leon::Template::parse(template)?;

    let values: HashMap<&str, Cow<'_, str>> = variables
        .iter()
        .map(|(name, value)| (name.as_str(), to_text(value)))
        .collect();

    Ok(template.render(&values)?)
}

/// Textual form of a configuration value inside a program.
fn to_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::Null => Cow::Borrowed(""),
        Value::Bool(b) => Cow::Owned(b.to_string()),
        Value::Number(n) => Cow::Owned(n.to_string()),
        Value::String(s) => Cow::Borrowed(s),
        Value::Sequence(_) | Value::Mapping(_) => {
            Cow::Owned(serde_json::to_string(value).unwrap_or_default())
        }
        Value::Tagged(tagged) => to_text(&tagged.value),
    }
}
