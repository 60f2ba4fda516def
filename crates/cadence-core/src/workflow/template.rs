//! Placeholder scanning and prompt rendering.
//!
//! Templates use `{{key}}` tokens (inner whitespace allowed). The same scanner
//! feeds the dependency analyzer and the renderer, so both agree on which
//! tokens a template contains.

use std::collections::HashMap;

use cadence_types::workflow::OUTPUT_SUFFIX;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Rendering failures. Always terminal for the unit: they indicate a
/// definition bug, not a transient condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// A token names a key that is not in the context.
    #[error("missing context key '{key}'")]
    MissingKey { key: String },

    /// Unclosed or empty placeholder.
    #[error("malformed template at byte {position}: {reason}")]
    Malformed { position: usize, reason: String },
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// One `{{key}}` occurrence in a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder<'a> {
    /// Byte offset of the opening `{{`.
    pub start: usize,
    /// Byte offset just past the closing `}}`.
    pub end: usize,
    /// Trimmed token between the braces.
    pub key: &'a str,
}

impl<'a> Placeholder<'a> {
    /// The unit name this token refers to, stripping a trailing `.output`.
    pub fn unit_name(&self) -> &'a str {
        self.key.strip_suffix(OUTPUT_SUFFIX).unwrap_or(self.key)
    }
}

/// Scan a template for placeholders, in order of appearance.
pub fn extract_placeholders(template: &str) -> Result<Vec<Placeholder<'_>>, RenderError> {
    let mut placeholders = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = template[cursor..].find("{{") {
        let start = cursor + offset;
        let inner_start = start + 2;
        let Some(close) = template[inner_start..].find("}}") else {
            return Err(RenderError::Malformed {
                position: start,
                reason: "unclosed '{{'".to_string(),
            });
        };
        let inner = &template[inner_start..inner_start + close];
        if inner.contains("{{") {
            return Err(RenderError::Malformed {
                position: start,
                reason: "nested '{{' inside placeholder".to_string(),
            });
        }
        let key = inner.trim();
        if key.is_empty() {
            return Err(RenderError::Malformed {
                position: start,
                reason: "empty placeholder".to_string(),
            });
        }
        let end = inner_start + close + 2;
        placeholders.push(Placeholder { start, end, key });
        cursor = end;
    }

    Ok(placeholders)
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Pure template renderer consumed by the unit runner, once per attempt.
pub trait PromptRenderer: Send + Sync {
    fn render(
        &self,
        template: &str,
        context: &HashMap<String, String>,
    ) -> Result<String, RenderError>;
}

/// Default renderer: substitutes every token with its context value.
///
/// Missing keys are an error, never a silent blank.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl PromptRenderer for TemplateRenderer {
    fn render(
        &self,
        template: &str,
        context: &HashMap<String, String>,
    ) -> Result<String, RenderError> {
        let placeholders = extract_placeholders(template)?;
        let mut rendered = String::with_capacity(template.len());
        let mut cursor = 0;

        for placeholder in placeholders {
            let value = context
                .get(placeholder.key)
                .ok_or_else(|| RenderError::MissingKey {
                    key: placeholder.key.to_string(),
                })?;
            rendered.push_str(&template[cursor..placeholder.start]);
            rendered.push_str(value);
            cursor = placeholder.end;
        }
        rendered.push_str(&template[cursor..]);

        Ok(rendered)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_in_order_with_whitespace() {
        let found = extract_placeholders("A {{title}} B {{ outline.output }} C {{prev_output}}")
            .unwrap();
        let keys: Vec<&str> = found.iter().map(|p| p.key).collect();
        assert_eq!(keys, vec!["title", "outline.output", "prev_output"]);
        assert_eq!(found[1].unit_name(), "outline");
        assert_eq!(found[0].unit_name(), "title");
    }

    #[test]
    fn test_extract_no_placeholders() {
        assert!(extract_placeholders("plain text { not } a token").unwrap().is_empty());
    }

    #[test]
    fn test_extract_unclosed_is_malformed() {
        let err = extract_placeholders("Hello {{name").unwrap_err();
        assert_eq!(
            err,
            RenderError::Malformed {
                position: 6,
                reason: "unclosed '{{'".to_string()
            }
        );
    }

    #[test]
    fn test_extract_empty_and_nested_are_malformed() {
        assert!(matches!(
            extract_placeholders("x {{  }} y"),
            Err(RenderError::Malformed { .. })
        ));
        assert!(matches!(
            extract_placeholders("x {{ a {{ b }} y"),
            Err(RenderError::Malformed { .. })
        ));
    }

    #[test]
    fn test_render_substitutes_all_tokens() {
        let ctx = vars(&[("title", "X"), ("outline.output", "Y")]);
        let out = TemplateRenderer
            .render("Chapter for {{title}} following {{ outline.output }}.", &ctx)
            .unwrap();
        assert_eq!(out, "Chapter for X following Y.");
    }

    #[test]
    fn test_render_repeated_token() {
        let ctx = vars(&[("a", "1")]);
        assert_eq!(TemplateRenderer.render("{{a}}+{{a}}", &ctx).unwrap(), "1+1");
    }

    #[test]
    fn test_render_missing_key_is_error() {
        let ctx = vars(&[("title", "X")]);
        let err = TemplateRenderer
            .render("{{title}} and {{outline}}", &ctx)
            .unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingKey {
                key: "outline".to_string()
            }
        );
        assert!(err.to_string().contains("outline"));
    }

    #[test]
    fn test_render_values_are_not_rescanned() {
        let ctx = vars(&[("a", "{{b}}")]);
        assert_eq!(TemplateRenderer.render("-{{a}}-", &ctx).unwrap(), "-{{b}}-");
    }

    #[test]
    fn test_render_multibyte_text() {
        let ctx = vars(&[("name", "Ünïcødé")]);
        assert_eq!(
            TemplateRenderer.render("→ {{name}} ←", &ctx).unwrap(),
            "→ Ünïcødé ←"
        );
    }
}
