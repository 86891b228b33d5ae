//! oxc-based TypeScript checker.
//!
//! Parses the snippet as a TypeScript script, runs the semantic pass with
//! syntax-error checking enabled, checks primitive assignability of literal
//! values, and finally lowers the program to JavaScript.
//!
//! The checker is stateless: every call gets its own arena allocator.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_codegen::Codegen;
use oxc_diagnostics::{OxcDiagnostic, Severity as OxcSeverity};
use oxc_parser::Parser;
use oxc_semantic::{Scoping, SemanticBuilder, SymbolId};
use oxc_span::SourceType;
use oxc_transformer::{TransformOptions, Transformer};

use crate::error::CompileError;
use crate::{Diagnostic, Severity};

/// Maximum nesting depth before the checker refuses the source.
/// Deeper input could overflow the parser's stack.
const MAX_NESTING_DEPTH: usize = 256;

/// What a checker produced for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutput {
    /// No blocking diagnostics; `code` is the lowered JavaScript.
    Lowered {
        /// Emitted JavaScript.
        code: String,
        /// Non-blocking diagnostics.
        warnings: Vec<Diagnostic>,
    },
    /// Every diagnostic, in detection order; at least one is an error.
    Rejected(Vec<Diagnostic>),
}

/// A full TypeScript checker.
///
/// Returns `Err` when the checker itself cannot analyse the source; the
/// compiler then falls back to pattern stripping.
pub trait Checker: Send + Sync {
    /// Check and lower `source`.
    fn check(&self, source: &str) -> Result<CheckOutput, CompileError>;
}

/// The process-wide checker instance.
pub fn shared() -> &'static dyn Checker {
    static CHECKER: OnceLock<OxcChecker> = OnceLock::new();
    CHECKER.get_or_init(OxcChecker::default)
}

/// [`Checker`] built on the oxc parser, semantic analyser and transformer.
#[derive(Debug, Default)]
pub struct OxcChecker;

impl Checker for OxcChecker {
    fn check(&self, source: &str) -> Result<CheckOutput, CompileError> {
        check_nesting_depth(source)?;

        let allocator = Allocator::default();
        let source_type = SourceType::ts().with_module(false);
        let ret = Parser::new(&allocator, source, source_type).parse();

        if ret.panicked {
            return Err(CompileError::CheckerFault(
                "parser panicked on malformed input".into(),
            ));
        }

        // Syntax errors leave a partial tree; report them alone.
        if !ret.errors.is_empty() {
            return Ok(CheckOutput::Rejected(
                ret.errors.iter().map(to_diagnostic).collect(),
            ));
        }

        let mut program = ret.program;
        let semantic_ret = SemanticBuilder::new()
            .with_check_syntax_error(true)
            .build(&program);

        let mut diagnostics: Vec<Diagnostic> =
            semantic_ret.errors.iter().map(to_diagnostic).collect();

        let mut walker = AssignabilityWalker::new(semantic_ret.semantic.scoping());
        walker.walk_statements(&program.body);
        diagnostics.extend(walker.diagnostics);

        if diagnostics.iter().any(Diagnostic::is_error) {
            return Ok(CheckOutput::Rejected(diagnostics));
        }

        let scoping = semantic_ret.semantic.into_scoping();
        let transformed = Transformer::new(
            &allocator,
            Path::new("snippet.ts"),
            &TransformOptions::default(),
        )
        .build_with_scoping(scoping, &mut program);

        if let Some(error) = transformed.errors.first() {
            return Err(CompileError::CheckerFault(error.message.to_string()));
        }

        let code = Codegen::new().build(&program).code;
        Ok(CheckOutput::Lowered {
            code,
            warnings: diagnostics,
        })
    }
}

fn to_diagnostic(error: &OxcDiagnostic) -> Diagnostic {
    let severity = match error.severity {
        OxcSeverity::Error => Severity::Error,
        _ => Severity::Warning,
    };
    Diagnostic {
        severity,
        message: error.message.to_string(),
    }
}

#[derive(Clone, Copy)]
enum Scan {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Check nesting depth of brackets/braces/parens before parsing.
///
/// Brackets inside string and template text or comments are not counted;
/// those inside `${...}` substitutions are.
pub fn check_nesting_depth(code: &str) -> Result<(), CompileError> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    // Depth at which each open `${` substitution resumes its template.
    let mut substitutions: Vec<usize> = Vec::new();
    let mut state = Scan::Code;
    let mut chars = code.chars().peekable();

    while let Some(ch) = chars.next() {
        match state {
            Scan::Code => match ch {
                '\'' | '"' | '`' => state = Scan::Quoted(ch),
                '/' if chars.peek() == Some(&'/') => state = Scan::LineComment,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = Scan::BlockComment;
                }
                '{' | '[' | '(' => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                '}' if substitutions.last() == Some(&depth) => {
                    substitutions.pop();
                    depth = depth.saturating_sub(1);
                    state = Scan::Quoted('`');
                }
                '}' | ']' | ')' => depth = depth.saturating_sub(1),
                _ => {}
            },
            Scan::Quoted(quote) => match ch {
                '\\' => {
                    chars.next();
                }
                '$' if quote == '`' && chars.peek() == Some(&'{') => {
                    chars.next();
                    depth += 1;
                    max_depth = max_depth.max(depth);
                    substitutions.push(depth);
                    state = Scan::Code;
                }
                c if c == quote => state = Scan::Code,
                '\n' if quote != '`' => state = Scan::Code,
                _ => {}
            },
            Scan::LineComment => {
                if ch == '\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = Scan::Code;
                }
            }
        }
    }

    if max_depth > MAX_NESTING_DEPTH {
        return Err(CompileError::CheckerFault(format!(
            "nesting depth {max_depth} exceeds maximum {MAX_NESTING_DEPTH}"
        )));
    }
    Ok(())
}

/// The primitive types the assignability pass understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Primitive {
    String,
    Number,
    Boolean,
}

impl Primitive {
    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }

    fn from_annotation(annotation: Option<&TSTypeAnnotation<'_>>) -> Option<Self> {
        match &annotation?.type_annotation {
            TSType::TSStringKeyword(_) => Some(Self::String),
            TSType::TSNumberKeyword(_) => Some(Self::Number),
            TSType::TSBooleanKeyword(_) => Some(Self::Boolean),
            _ => None,
        }
    }

    /// The primitive type of a literal expression, if it is one.
    fn of_literal(expr: &Expression<'_>) -> Option<Self> {
        match expr {
            Expression::StringLiteral(_) | Expression::TemplateLiteral(_) => Some(Self::String),
            Expression::NumericLiteral(_) => Some(Self::Number),
            Expression::BooleanLiteral(_) => Some(Self::Boolean),
            Expression::UnaryExpression(unary)
                if matches!(
                    unary.operator,
                    UnaryOperator::UnaryNegation | UnaryOperator::UnaryPlus
                ) && matches!(unary.argument, Expression::NumericLiteral(_)) =>
            {
                Some(Self::Number)
            }
            Expression::ParenthesizedExpression(paren) => Self::of_literal(&paren.expression),
            _ => None,
        }
    }
}

/// Walks statements and reports literals assigned to bindings annotated with
/// a different primitive type.
///
/// Bindings are tracked by the symbol the semantic pass resolved, so loop
/// variables, catch parameters and destructured names shadow correctly.
struct AssignabilityWalker<'s> {
    scoping: &'s Scoping,
    annotated: HashMap<SymbolId, Primitive>,
    diagnostics: Vec<Diagnostic>,
}

impl<'s> AssignabilityWalker<'s> {
    fn new(scoping: &'s Scoping) -> Self {
        Self {
            scoping,
            annotated: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    fn report(&mut self, actual: Primitive, expected: Primitive) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Error,
            message: format!(
                "Type '{}' is not assignable to type '{}'.",
                actual.name(),
                expected.name()
            ),
        });
    }

    fn check(&mut self, expected: Primitive, value: &Expression<'_>) {
        if let Some(actual) = Primitive::of_literal(value) {
            if actual != expected {
                self.report(actual, expected);
            }
        }
    }

    fn declare(&mut self, pattern: &BindingPattern<'_>) {
        let BindingPatternKind::BindingIdentifier(ident) = &pattern.kind else {
            return;
        };
        let ty = Primitive::from_annotation(pattern.type_annotation.as_deref());
        if let (Some(symbol), Some(ty)) = (ident.symbol_id.get(), ty) {
            self.annotated.insert(symbol, ty);
        }
    }

    fn lookup(&self, ident: &IdentifierReference<'_>) -> Option<Primitive> {
        let reference = ident.reference_id.get()?;
        let symbol = self.scoping.get_reference(reference).symbol_id()?;
        self.annotated.get(&symbol).copied()
    }

    fn walk_statements(&mut self, statements: &[Statement<'_>]) {
        for stmt in statements {
            self.walk_statement(stmt);
        }
    }

    fn walk_declaration(&mut self, decl: &VariableDeclaration<'_>) {
        for declarator in &decl.declarations {
            let expected = Primitive::from_annotation(declarator.id.type_annotation.as_deref());
            if let Some(init) = &declarator.init {
                if let Some(expected) = expected {
                    self.check(expected, init);
                }
                self.walk_expression(init);
            }
            self.declare(&declarator.id);
        }
    }

    fn walk_function(&mut self, params: &FormalParameters<'_>, body: Option<&FunctionBody<'_>>) {
        for param in &params.items {
            self.declare(&param.pattern);
        }
        if let Some(body) = body {
            self.walk_statements(&body.statements);
        }
    }

    fn walk_for_left(&mut self, left: &ForStatementLeft<'_>) {
        if let ForStatementLeft::VariableDeclaration(decl) = left {
            self.walk_declaration(decl);
        }
    }

    fn walk_statement(&mut self, stmt: &Statement<'_>) {
        match stmt {
            Statement::VariableDeclaration(decl) => self.walk_declaration(decl),
            Statement::ExpressionStatement(es) => self.walk_expression(&es.expression),
            Statement::BlockStatement(block) => self.walk_statements(&block.body),
            Statement::IfStatement(ifs) => {
                self.walk_expression(&ifs.test);
                self.walk_statement(&ifs.consequent);
                if let Some(alt) = &ifs.alternate {
                    self.walk_statement(alt);
                }
            }
            Statement::ReturnStatement(ret) => {
                if let Some(arg) = &ret.argument {
                    self.walk_expression(arg);
                }
            }
            Statement::ForStatement(fors) => {
                if let Some(ForStatementInit::VariableDeclaration(decl)) = &fors.init {
                    self.walk_declaration(decl);
                }
                if let Some(update) = &fors.update {
                    self.walk_expression(update);
                }
                self.walk_statement(&fors.body);
            }
            Statement::ForInStatement(fis) => {
                self.walk_for_left(&fis.left);
                self.walk_expression(&fis.right);
                self.walk_statement(&fis.body);
            }
            Statement::ForOfStatement(fos) => {
                self.walk_for_left(&fos.left);
                self.walk_expression(&fos.right);
                self.walk_statement(&fos.body);
            }
            Statement::WhileStatement(ws) => {
                self.walk_expression(&ws.test);
                self.walk_statement(&ws.body);
            }
            Statement::DoWhileStatement(dws) => {
                self.walk_statement(&dws.body);
                self.walk_expression(&dws.test);
            }
            Statement::LabeledStatement(ls) => self.walk_statement(&ls.body),
            Statement::SwitchStatement(ss) => {
                self.walk_expression(&ss.discriminant);
                for case in &ss.cases {
                    self.walk_statements(&case.consequent);
                }
            }
            Statement::TryStatement(ts) => {
                self.walk_statements(&ts.block.body);
                if let Some(handler) = &ts.handler {
                    if let Some(param) = &handler.param {
                        self.declare(&param.pattern);
                    }
                    self.walk_statements(&handler.body.body);
                }
                if let Some(finalizer) = &ts.finalizer {
                    self.walk_statements(&finalizer.body);
                }
            }
            Statement::FunctionDeclaration(fd) => {
                self.walk_function(&fd.params, fd.body.as_deref());
            }
            _ => {}
        }
    }

    fn walk_expression(&mut self, expr: &Expression<'_>) {
        match expr {
            Expression::AssignmentExpression(assign) => {
                if assign.operator == AssignmentOperator::Assign {
                    if let AssignmentTarget::AssignmentTargetIdentifier(ident) = &assign.left {
                        if let Some(expected) = self.lookup(ident) {
                            self.check(expected, &assign.right);
                        }
                    }
                }
                self.walk_expression(&assign.right);
            }
            Expression::SequenceExpression(seq) => {
                for e in &seq.expressions {
                    self.walk_expression(e);
                }
            }
            Expression::ParenthesizedExpression(paren) => {
                self.walk_expression(&paren.expression);
            }
            Expression::CallExpression(call) => {
                self.walk_expression(&call.callee);
                for arg in &call.arguments {
                    if let Some(expr) = arg.as_expression() {
                        self.walk_expression(expr);
                    }
                }
            }
            Expression::ArrowFunctionExpression(arrow) => {
                self.walk_function(&arrow.params, Some(&*arrow.body));
            }
            Expression::FunctionExpression(func) => {
                self.walk_function(&func.params, func.body.as_deref());
            }
            _ => {}
        }
    }
}
