//! Input-file templating — turns a parameter set into a solver input file.
//!
//! Templates use `{{ name }}` placeholders. Rendering is a single left-to-right
//! scan, so a placeholder value containing `{{` is never re-expanded.

use std::path::Path;

use gt_types::{ParameterSet, TemplateError};
use tracing::debug;

/// Result alias for templating operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Renders job input files from a template and a parameter set.
pub trait InputTemplater: Send + Sync {
    /// Read `template`, substitute placeholders from `parameters`, and write
    /// the result to `destination`.
    fn materialize(
        &self,
        template: &Path,
        parameters: &ParameterSet,
        destination: &Path,
    ) -> TemplateResult<()>;
}

/// The default `{{ name }}` substitution engine.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderTemplater;

impl PlaceholderTemplater {
    pub fn new() -> Self {
        Self
    }

    /// Substitute every `{{ name }}` in `text` with the matching parameter.
    ///
    /// Whitespace inside the braces is ignored, so `{{x}}` and `{{ x }}` are
    /// the same placeholder. A placeholder with no matching parameter is an
    /// error; unmatched brace pairs pass through untouched.
    pub fn render(text: &str, parameters: &ParameterSet) -> TemplateResult<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            let after_open = &rest[open + 2..];
            let close = match after_open.find("}}") {
                Some(close) => close,
                None => break,
            };
            let name = after_open[..close].trim();
            let value = parameters
                .get(name)
                .ok_or_else(|| TemplateError::UnresolvedPlaceholder {
                    placeholder: name.to_string(),
                })?;
            out.push_str(&rest[..open]);
            out.push_str(&value.to_string());
            rest = &after_open[close + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl InputTemplater for PlaceholderTemplater {
    fn materialize(
        &self,
        template: &Path,
        parameters: &ParameterSet,
        destination: &Path,
    ) -> TemplateResult<()> {
        let text =
            std::fs::read_to_string(template).map_err(|_| TemplateError::TemplateMissing {
                path: template.display().to_string(),
            })?;
        let rendered = Self::render(&text, parameters)?;
        std::fs::write(destination, rendered).map_err(|err| TemplateError::WriteFailed {
            path: destination.display().to_string(),
            message: err.to_string(),
        })?;
        debug!(
            template = %template.display(),
            destination = %destination.display(),
            "materialized input file"
        );
        Ok(())
    }
}
