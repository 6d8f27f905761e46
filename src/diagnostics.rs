/// Terminal diagnostics.
///
/// Routes every collected static error through miette's graphical renderer:
/// source context, caret under the offending span, and a category-specific
/// help line. The runtime never comes through here — uncaught exceptions
/// carry their own stack traces.

use miette::{Diagnostic as MietteDiagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::errors::{Diagnostic, Diagnostics, Severity};

#[derive(Debug, Error, MietteDiagnostic)]
#[error("[{category}] {message}")]
pub struct Report {
    pub category: &'static str,
    pub message: String,
    #[source_code]
    pub src: NamedSource,
    #[label("here")]
    pub span: SourceSpan,
    #[help]
    pub help: Option<String>,
}

fn help_for(category: &str) -> Option<String> {
    let text = match category {
        "LexError" => "Fix the literal or remove the stray character; see the token grammar.",
        "ParseError" => "The parser resynchronised at the next statement; earlier errors may cascade.",
        "TypeError" => {
            "Prism never converts implicitly. Cross int/float/string boundaries with an explicit 'as' cast."
        }
        "InitError" => "Assign the variable on every path before reading it.",
        "NameError" => "Check the spelling and that the declaration is in scope or imported with 'use'.",
        "LoadError" => "Check the 'use' path against prism.toml's namespace and the src/ layout.",
        "VerificationError" => "The emitted chunk is inconsistent; this is a compiler defect worth reporting.",
        _ => return None,
    };
    Some(text.to_string())
}

/// Converts collected diagnostics into rendered miette reports for one
/// source file.
pub struct DiagnosticEngine {
    name: String,
    source: String,
}

impl DiagnosticEngine {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        DiagnosticEngine { name: name.into(), source: source.into() }
    }

    pub fn report(&self, d: &Diagnostic) -> Report {
        let start = d.span.start.min(self.source.len());
        let len = (d.span.end.saturating_sub(d.span.start)).max(1);
        let len = len.min(self.source.len().saturating_sub(start).max(1));
        Report {
            category: d.category,
            message: d.message.clone(),
            src: NamedSource::new(self.name.clone(), self.source.clone()),
            span: SourceSpan::new(start.into(), len.into()),
            help: help_for(d.category),
        }
    }

    /// Print every diagnostic in the bag to stderr; returns whether any
    /// error-severity entries were present.
    pub fn emit_all(&self, diagnostics: &Diagnostics) -> bool {
        for d in diagnostics.iter() {
            match d.severity {
                Severity::Error => {
                    eprintln!("{:?}", miette::Report::new(self.report(d)));
                }
                Severity::Warning => {
                    eprintln!("warning: {} (at {}:{})", d.message, self.name, d.span);
                }
            }
        }
        diagnostics.has_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Span;

    #[test]
    fn report_carries_span_and_help() {
        let engine = DiagnosticEngine::new("main.prism", "echo 1 +;\n");
        let mut bag = Diagnostics::new();
        bag.error("ParseError", "expected expression".into(), Span::new(0, 8, 9, 1, 9));
        let d = bag.iter().next().expect("one diagnostic");
        let report = engine.report(d);
        assert_eq!(report.category, "ParseError");
        assert!(report.help.is_some());
        assert_eq!(report.span.offset(), 8);
    }

    #[test]
    fn emit_all_reports_error_presence() {
        let engine = DiagnosticEngine::new("x.prism", "int $x;\n");
        let mut bag = Diagnostics::new();
        bag.warning("TypeError", "unreachable code".into(), Span::default());
        assert!(!engine.emit_all(&bag));
        bag.error("InitError", "read before assigned".into(), Span::default());
        assert!(engine.emit_all(&bag));
    }
}
