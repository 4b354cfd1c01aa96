//! Structured typing diagnostics and their text rendering.
//!
//! A [`Diagnostic`] is recorded once, at the first hard failure of an
//! inference pass, and rendered on demand. The rendered text keeps the
//! banner layout tools already parse:
//!
//! ```text
//! [[ERROR]] in file "demo.rill":
//!   At line 3 : Invalid function definition --- " f() ";
//!   At line 5 : Invalid virtual machine instruction --- " ADD:0,3,4 ";
//!   At line 5 : Variable not initialized --- " x + y ";
//!     return x + y
//!            ^
//! ```
//!
//! Call failures add one block per rejected overload candidate.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::Span;
use crate::bytecode::{AnnotatedInstr, Instruction};
use crate::error::InferErrorKind;
use crate::routine::RoutineDecl;

/// Why an overload candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    TooMany,
    TooFew,
    WrongType { found: String, expected: String },
    WrongName(String),
}

impl RejectReason {
    pub fn kind(&self) -> InferErrorKind {
        match self {
            RejectReason::TooMany | RejectReason::TooFew => InferErrorKind::ParamWrongNumber,
            RejectReason::WrongType { .. } => InferErrorKind::ParamWrongType,
            RejectReason::WrongName(_) => InferErrorKind::ParamWrongName,
        }
    }

    fn detail(&self) -> String {
        match self {
            RejectReason::TooMany => "too many parameters".to_string(),
            RejectReason::TooFew => "too few parameters".to_string(),
            RejectReason::WrongType { found, expected } => format!("'{found}' for '{expected}'"),
            RejectReason::WrongName(name) => name.clone(),
        }
    }
}

/// One overload candidate that did not accept the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// `routine name(params)=>ret`.
    pub signature: String,
    pub def_line: u32,
    pub file: Arc<str>,
    pub reason: RejectReason,
}

/// Second, more precise message line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecificError {
    pub kind: InferErrorKind,
    pub found: Option<String>,
    pub expected: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: InferErrorKind,
    pub specific: Option<SpecificError>,
    pub file: Arc<str>,
    pub routine: Arc<str>,
    pub def_line: u32,
    /// Index of the failing instruction.
    pub pc: usize,
    pub instruction: Instruction,
    pub span: Span,
    /// Source text of the failing line.
    pub source: Option<Arc<str>>,
    /// Type named by "Member not exist" messages.
    pub subject: Option<String>,
    pub rejections: Vec<Rejection>,
}

impl Diagnostic {
    pub fn new(kind: InferErrorKind, decl: &RoutineDecl, pc: usize, instr: &AnnotatedInstr) -> Self {
        Diagnostic {
            kind,
            specific: None,
            file: decl.file.clone(),
            routine: decl.name.clone(),
            def_line: decl.def_line,
            pc,
            instruction: instr.instr,
            span: instr.span,
            source: decl.source_line(instr.span.line).map(Arc::from),
            subject: None,
            rejections: Vec::new(),
        }
    }

    pub fn with_specific(
        mut self,
        kind: InferErrorKind,
        found: Option<String>,
        expected: Option<String>,
    ) -> Self {
        self.specific = Some(SpecificError {
            kind,
            found,
            expected,
        });
        self
    }

    /// Shorthand for a "Types not matching" line.
    pub fn mismatch(self, found: &str, expected: &str) -> Self {
        self.with_specific(
            InferErrorKind::TypeNotMatching,
            Some(found.to_string()),
            Some(expected.to_string()),
        )
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_rejections(mut self, rejections: Vec<Rejection>) -> Self {
        self.rejections = rejections;
        self
    }

    #[inline]
    pub fn line(&self) -> u32 {
        self.span.line
    }

    /// One-line form used by `Display` of the error.
    pub fn summary(&self) -> String {
        format!(
            "{}:{}: {} in {}()",
            self.file,
            self.span.line,
            self.kind.message(),
            self.routine
        )
    }

    /// The source region the failing instruction came from.
    fn annotated_source(&self) -> String {
        let Some(line) = self.source.as_deref() else {
            return self.instruction.to_string();
        };
        if self.span.col > 0 {
            let start = self.span.col as usize - 1;
            let end = (start + self.span.len.max(1) as usize).min(line.len());
            if let Some(text) = line.get(start..end) {
                return text.to_string();
            }
        }
        line.trim().to_string()
    }

    /// Full banner text.
    pub fn render(&self) -> String {
        let line = self.span.line;
        let mut out = String::new();
        let _ = writeln!(out, "[[ERROR]] in file \"{}\":", self.file);
        let _ = writeln!(
            out,
            "  At line {} : Invalid function definition --- \" {}() \";",
            self.def_line, self.routine
        );
        let _ = writeln!(
            out,
            "  At line {line} : Invalid virtual machine instruction --- \" {} \";",
            self.instruction
        );
        let _ = write!(
            out,
            "  At line {line} : {} --- \" {}",
            self.kind.message(),
            self.annotated_source()
        );
        if let (InferErrorKind::FieldNotExist, Some(subject)) = (self.kind, &self.subject) {
            let _ = write!(out, " for {subject}");
        }
        out.push_str(" \";\n");

        if let Some(specific) = &self.specific {
            let detail = match specific.kind {
                InferErrorKind::TypeNotMatching => format!(
                    "'{}' for '{}'",
                    specific.found.as_deref().unwrap_or("none"),
                    specific.expected.as_deref().unwrap_or("?")
                ),
                _ => self.annotated_source(),
            };
            let _ = writeln!(
                out,
                "  At line {line} : {} --- \" {detail} \";",
                specific.kind.message()
            );
        }

        for rejection in &self.rejections {
            let _ = writeln!(
                out,
                "  ** {} --- \" {} \";",
                rejection.reason.kind().message(),
                rejection.reason.detail()
            );
            let _ = writeln!(out, "     Assuming  : {};", rejection.signature);
            let _ = writeln!(
                out,
                "     Reference : line {}, file \"{}\";",
                rejection.def_line, rejection.file
            );
        }

        if let Some(source) = self.source.as_deref() {
            if self.span.col > 0 {
                let _ = writeln!(out, "    {source}");
                let _ = writeln!(out, "{}", self.span.caret_line(4));
            }
        }
        out
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Diagnostics accumulated while compiling a program.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// All diagnostics, in order, as one text stream.
    pub fn render(&self) -> String {
        self.items.iter().map(Diagnostic::render).collect()
    }
}
