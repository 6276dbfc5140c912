//! ES module → `System.register` conversion.
//!
//! Line-oriented: import and export statements at the top level of the
//! module are recognised and rewritten, every other line passes through
//! unchanged. Imports become dependency entries with setters, exports become
//! `_export` calls. Writes to exported `let`/`var` bindings are wrapped in
//! `_export` so importers see every new value. Anything the converter cannot
//! express (destructuring exports, TypeScript-only declarations, import
//! attributes, exported bindings shadowed in a nested scope) fails the
//! conversion, and the caller serves the original code instead.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex_lite::Regex;

use super::line_map::LineMapBuilder;
use super::{ConvertError, ConvertedModule, ModuleConverter};

/// Local that holds an anonymous default export.
const DEFAULT_LOCAL: &str = "__coalesce_default";

/// Converts ES modules to named `System.register` registrations.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemConverter;

impl SystemConverter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ModuleConverter for SystemConverter {
    fn name(&self) -> &'static str {
        "system"
    }

    fn convert(&self, source: &str, _id: &str, name: &str) -> Result<ConvertedModule, ConvertError> {
        let module = parse_module(source)?;
        Ok(emit_module(&module, source, name))
    }
}

// =============================================================================
// Parsing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    /// `local = _m.imported`
    Import { imported: String, local: String },
    /// `local = _m`
    Namespace { local: String },
    /// `_export(exported, _m.imported)`
    Reexport { imported: String, exported: String },
    /// `_export(exported, _m)`
    ReexportNamespace { exported: String },
    /// every non-default export of the dependency
    ReexportAll,
}

#[derive(Debug, Default)]
struct Dependency {
    specifier: String,
    bindings: Vec<Binding>,
}

#[derive(Debug, Default)]
struct ParsedModule {
    deps: Vec<Dependency>,
    locals: Vec<String>,
    /// (0-based source line, output text)
    body: Vec<(usize, String)>,
    /// (exported name, local name), exported after the body runs.
    exports: Vec<(String, String)>,
    /// Function declarations, exported before the body runs.
    hoisted_exports: Vec<(String, String)>,
    /// Top-level `let`/`var` names.
    mutable_locals: Vec<String>,
    is_async: bool,
}

impl ParsedModule {
    fn dependency(&mut self, specifier: String) -> &mut Dependency {
        let idx = match self.deps.iter().position(|d| d.specifier == specifier) {
            Some(idx) => idx,
            None => {
                self.deps.push(Dependency {
                    specifier,
                    bindings: Vec::new(),
                });
                self.deps.len() - 1
            }
        };
        &mut self.deps[idx]
    }

    fn add_local(&mut self, local: &str) {
        if !self.locals.iter().any(|l| l == local) {
            self.locals.push(local.to_string());
        }
    }

    fn add_bindings(&mut self, specifier: String, bindings: Vec<Binding>) {
        for binding in &bindings {
            match binding {
                Binding::Import { local, .. } | Binding::Namespace { local } => self.add_local(local),
                _ => {}
            }
        }
        self.dependency(specifier).bindings.extend(bindings);
    }
}

/// Tracks whether the next line starts at the module's top level.
#[derive(Debug, Default)]
struct Scanner {
    depth: i32,
    in_template: bool,
    in_block_comment: bool,
}

impl Scanner {
    fn at_top_level(&self) -> bool {
        self.depth == 0 && !self.in_template && !self.in_block_comment
    }

    fn feed(&mut self, line: &str) {
        let mut chars = line.chars().peekable();
        let mut quote: Option<char> = None;

        while let Some(c) = chars.next() {
            if self.in_block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    self.in_block_comment = false;
                }
                continue;
            }
            if self.in_template {
                if c == '\\' {
                    chars.next();
                } else if c == '`' {
                    self.in_template = false;
                }
                continue;
            }
            if let Some(q) = quote {
                if c == '\\' {
                    chars.next();
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '\'' | '"' => quote = Some(c),
                '`' => self.in_template = true,
                '/' if chars.peek() == Some(&'/') => break,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    self.in_block_comment = true;
                }
                '{' => self.depth += 1,
                '}' => self.depth -= 1,
                _ => {}
            }
        }
    }
}

fn parse_module(source: &str) -> Result<ParsedModule, ConvertError> {
    let lines: Vec<&str> = source.lines().collect();
    let mut module = ParsedModule::default();
    let mut scanner = Scanner::default();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_start();

        if scanner.at_top_level() {
            if contains_word(line, "await") {
                module.is_async = true;
            }

            let is_import = is_import_statement(trimmed);
            if is_import || is_export_clause(trimmed) {
                let (statement, end) = collect_statement(&lines, i)?;
                for consumed in &lines[i..=end] {
                    scanner.feed(consumed);
                }
                if is_import {
                    parse_import(&statement, i + 1, &mut module)?;
                } else {
                    parse_export_clause(&statement, i + 1, &mut module)?;
                }
                i = end + 1;
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("export ") {
                let indent = &line[..line.len() - trimmed.len()];
                let declaration = parse_export_declaration(rest.trim_start(), i + 1, &mut module)?;
                let text = format!("{indent}{declaration}");
                module.body.push((i, rewrite_import_expressions(&text).into_owned()));
                scanner.feed(line);
                i += 1;
                continue;
            }

            for keyword in ["let ", "var "] {
                if let Some(declarators) = trimmed.strip_prefix(keyword) {
                    if let Ok(names) = declared_names(declarators, i + 1) {
                        module.mutable_locals.extend(names);
                    }
                }
            }
        }

        module.body.push((i, rewrite_import_expressions(line).into_owned()));
        scanner.feed(line);
        i += 1;
    }

    rewrite_live_bindings(&mut module)?;
    Ok(module)
}

fn is_import_statement(trimmed: &str) -> bool {
    trimmed
        .strip_prefix("import")
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| matches!(c, ' ' | '\t' | '{' | '*' | '"' | '\''))
}

fn is_export_clause(trimmed: &str) -> bool {
    trimmed.strip_prefix("export").is_some_and(|rest| {
        let after = rest.trim_start();
        after.starts_with('{') || after.starts_with('*')
    })
}

/// Join lines starting at `start` until the statement is complete.
fn collect_statement(lines: &[&str], start: usize) -> Result<(String, usize), ConvertError> {
    let mut statement = String::new();
    for (end, line) in lines.iter().enumerate().skip(start) {
        if !statement.is_empty() {
            statement.push(' ');
        }
        statement.push_str(line.trim());
        if statement_complete(&statement) {
            return Ok((statement, end));
        }
    }
    Err(ConvertError::Unterminated { line: start + 1 })
}

fn statement_complete(text: &str) -> bool {
    if text.matches('{').count() != text.matches('}').count() {
        return false;
    }
    if module_specifier(text).is_some() {
        return true;
    }
    let t = text.trim_end().trim_end_matches(';').trim_end();
    t.starts_with("export") && t.ends_with('}')
}

/// The quoted module specifier of an import/export statement, with the byte
/// offset of its opening quote.
fn module_specifier(text: &str) -> Option<(String, usize)> {
    let search_from = text.rfind('}').map_or(0, |i| i + 1);
    let rest = &text[search_from..];
    let open = rest.find(['\'', '"'])?;
    let quote = rest[open..].chars().next()?;
    let after = &rest[open + 1..];
    let close = after.find(quote)?;
    Some((after[..close].to_string(), search_from + open))
}

fn unsupported(line: usize, message: impl Into<String>) -> ConvertError {
    ConvertError::Unsupported {
        line,
        message: message.into(),
    }
}

fn parse_import(statement: &str, line: usize, module: &mut ParsedModule) -> Result<(), ConvertError> {
    let text = statement.trim();
    let (specifier, quote_at) =
        module_specifier(text).ok_or_else(|| unsupported(line, "import without specifier"))?;
    let clause = text["import".len()..quote_at].trim();

    if clause.is_empty() {
        module.add_bindings(specifier, Vec::new());
        return Ok(());
    }

    let clause = clause
        .strip_suffix("from")
        .ok_or_else(|| unsupported(line, "expected `from`"))?
        .trim();
    let bindings = parse_import_clause(clause, line)?;
    module.add_bindings(specifier, bindings);
    Ok(())
}

fn parse_import_clause(clause: &str, line: usize) -> Result<Vec<Binding>, ConvertError> {
    let (head, named) = match clause.find('{') {
        Some(open) => {
            let close = clause
                .rfind('}')
                .ok_or_else(|| unsupported(line, "unbalanced import braces"))?;
            (&clause[..open], Some(&clause[open + 1..close]))
        }
        None => (clause, None),
    };

    let mut bindings = Vec::new();
    for part in head.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(ns) = part.strip_prefix('*') {
            let local = ns
                .trim()
                .strip_prefix("as")
                .map(str::trim)
                .filter(|l| is_identifier(l))
                .ok_or_else(|| unsupported(line, format!("bad namespace import `{part}`")))?;
            bindings.push(Binding::Namespace {
                local: local.to_string(),
            });
        } else if is_identifier(part) {
            bindings.push(Binding::Import {
                imported: "default".to_string(),
                local: part.to_string(),
            });
        } else {
            return Err(unsupported(line, format!("bad import `{part}`")));
        }
    }

    if let Some(named) = named {
        for spec in named.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (imported, local) = parse_specifier(spec, line)?;
            bindings.push(Binding::Import { imported, local });
        }
    }

    Ok(bindings)
}

/// `a` or `a as b` → (a, b).
fn parse_specifier(spec: &str, line: usize) -> Result<(String, String), ConvertError> {
    let (left, right) = match spec.split_once(" as ") {
        Some((l, r)) => (l.trim(), r.trim()),
        None => (spec, spec),
    };
    if is_identifier(left) && is_identifier(right) {
        Ok((left.to_string(), right.to_string()))
    } else {
        Err(unsupported(line, format!("bad specifier `{spec}`")))
    }
}

fn parse_export_clause(statement: &str, line: usize, module: &mut ParsedModule) -> Result<(), ConvertError> {
    let text = statement.trim();
    let rest = text["export".len()..].trim_start();

    if let Some(star) = rest.strip_prefix('*') {
        let (specifier, _) =
            module_specifier(text).ok_or_else(|| unsupported(line, "`export *` without specifier"))?;
        let star = star.trim_start();
        let binding = match star.strip_prefix("as ") {
            Some(name) => {
                let exported = name.split_whitespace().next().unwrap_or_default();
                if !is_identifier(exported) {
                    return Err(unsupported(line, "bad `export * as` name"));
                }
                Binding::ReexportNamespace {
                    exported: exported.to_string(),
                }
            }
            None => Binding::ReexportAll,
        };
        module.add_bindings(specifier, vec![binding]);
        return Ok(());
    }

    let close = rest
        .find('}')
        .ok_or_else(|| unsupported(line, "unbalanced export braces"))?;
    let list = &rest[1..close];
    let after = rest[close + 1..].trim_start();

    let mut pairs = Vec::new();
    for spec in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        pairs.push(parse_specifier(spec, line)?);
    }

    if after.starts_with("from") {
        let (specifier, _) =
            module_specifier(text).ok_or_else(|| unsupported(line, "re-export without specifier"))?;
        let bindings = pairs
            .into_iter()
            .map(|(imported, exported)| Binding::Reexport { imported, exported })
            .collect();
        module.add_bindings(specifier, bindings);
    } else {
        module
            .exports
            .extend(pairs.into_iter().map(|(local, exported)| (exported, local)));
    }
    Ok(())
}

/// Strip `export` from a declaration line, recording what it exports.
fn parse_export_declaration(
    rest: &str,
    line: usize,
    module: &mut ParsedModule,
) -> Result<String, ConvertError> {
    if let Some(after_default) = rest.strip_prefix("default") {
        if after_default.starts_with(|c: char| is_ident_char(c)) {
            return Err(unsupported(line, "bad default export"));
        }
        let expr = after_default.trim_start();
        if let Some((name, hoisted)) = declaration_name(expr) {
            let export = ("default".to_string(), name);
            if hoisted {
                module.hoisted_exports.push(export);
            } else {
                module.exports.push(export);
            }
            return Ok(expr.to_string());
        }
        module
            .exports
            .push(("default".to_string(), DEFAULT_LOCAL.to_string()));
        return Ok(format!("const {DEFAULT_LOCAL} = {expr}"));
    }

    for keyword in ["const ", "let ", "var "] {
        if let Some(declarators) = rest.strip_prefix(keyword) {
            for name in declared_names(declarators, line)? {
                if keyword != "const " {
                    module.mutable_locals.push(name.clone());
                }
                module.exports.push((name.clone(), name));
            }
            return Ok(rest.to_string());
        }
    }

    if let Some((name, hoisted)) = declaration_name(rest) {
        if hoisted {
            module.hoisted_exports.push((name.clone(), name));
        } else {
            module.exports.push((name.clone(), name));
        }
        return Ok(rest.to_string());
    }

    Err(unsupported(line, format!("unsupported export `{}`", rest.trim_end())))
}

/// Name of a `function`/`async function`/`class` declaration, and whether it
/// is hoisted. `None` for anonymous declarations and everything else.
fn declaration_name(text: &str) -> Option<(String, bool)> {
    for (keyword, hoisted) in [("async function", true), ("function", true), ("class", false)] {
        let Some(after) = text.strip_prefix(keyword) else {
            continue;
        };
        if after.starts_with(|c: char| is_ident_char(c)) {
            continue;
        }
        let after = after.trim_start().trim_start_matches('*').trim_start();
        let name: String = after.chars().take_while(|&c| is_ident_char(c)).collect();
        return (!name.is_empty() && is_identifier(&name)).then_some((name, hoisted));
    }
    None
}

/// Names introduced by the declarators on one `const`/`let`/`var` line.
fn declared_names(declarators: &str, line: usize) -> Result<Vec<String>, ConvertError> {
    let mut names = Vec::new();
    for part in split_top_level(declarators) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.starts_with('{') || part.starts_with('[') {
            return Err(unsupported(line, "destructuring export"));
        }
        let name: String = part.chars().take_while(|&c| is_ident_char(c)).collect();
        if !is_identifier(&name) {
            return Err(unsupported(line, format!("bad declarator `{part}`")));
        }
        names.push(name);
    }
    if names.is_empty() {
        return Err(unsupported(line, "export without declarator"));
    }
    Ok(names)
}

/// Split on commas outside brackets and strings, stopping at `;` or `//`.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut prev = '\0';

    for (idx, c) in text.char_indices() {
        if let Some(q) = quote {
            if c == q && prev != '\\' {
                quote = None;
            }
            prev = c;
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&text[start..idx]);
                start = idx + 1;
            }
            ';' if depth == 0 => {
                parts.push(&text[start..idx]);
                return parts;
            }
            '/' if depth == 0 && prev == '/' => {
                parts.push(&text[start..idx - 1]);
                return parts;
            }
            _ => {}
        }
        prev = c;
    }
    parts.push(&text[start..]);
    parts
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(is_ident_char)
}

fn contains_word(line: &str, word: &str) -> bool {
    line.match_indices(word).any(|(idx, _)| {
        let before = line[..idx].chars().next_back();
        let after = line[idx + word.len()..].chars().next();
        !before.is_some_and(|c| is_ident_char(c) || c == '.') && !after.is_some_and(is_ident_char)
    })
}

/// `import.meta` → `_context.meta`, `import(` → `_context.import(`.
fn rewrite_import_expressions(line: &str) -> Cow<'_, str> {
    if !line.contains("import") {
        return Cow::Borrowed(line);
    }

    let mut out = String::with_capacity(line.len() + 16);
    let mut last = 0;
    for (idx, _) in line.match_indices("import") {
        if idx < last {
            continue;
        }
        let before = line[..idx].chars().next_back();
        if before.is_some_and(|c| is_ident_char(c) || c == '.') {
            continue;
        }
        let after = &line[idx + "import".len()..];
        if let Some(meta_rest) = after.strip_prefix(".meta") {
            if meta_rest.starts_with(is_ident_char) {
                continue;
            }
            out.push_str(&line[last..idx]);
            out.push_str("_context.meta");
            last = idx + "import.meta".len();
        } else if after.trim_start().starts_with('(') {
            out.push_str(&line[last..idx]);
            out.push_str("_context.import");
            last = idx + "import".len();
        }
    }
    out.push_str(&line[last..]);
    Cow::Owned(out)
}

// =============================================================================
// Live bindings
// =============================================================================

/// Longest first, so `>>>=` is never read as `>>=`.
const ASSIGNMENT_OPS: [&str; 16] = [
    ">>>=", "<<=", ">>=", "**=", "&&=", "||=", "??=", "+=", "-=", "*=", "/=", "%=", "&=", "|=",
    "^=", "=",
];

fn parameter_list_res() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"\bfunction\b[^(]*\(([^)]*)\)").expect("valid function regex"),
            Regex::new(r"\(([^()]*)\)\s*=>").expect("valid arrow regex"),
            Regex::new(r"\bcatch\s*\(([^)]*)\)").expect("valid catch regex"),
        ]
    })
}

fn shadowed(line: usize, name: &str) -> ConvertError {
    unsupported(line, format!("exported binding `{name}` is shadowed"))
}

/// Exported `let`/`var` locals, each with every name it is exported under.
fn live_exports(module: &ParsedModule) -> Vec<(String, Vec<String>)> {
    let mut live: Vec<(String, Vec<String>)> = Vec::new();
    for (exported, local) in &module.exports {
        if !module.mutable_locals.contains(local) {
            continue;
        }
        match live.iter_mut().find(|(l, _)| l == local) {
            Some((_, names)) => names.push(exported.clone()),
            None => live.push((local.clone(), vec![exported.clone()])),
        }
    }
    live
}

/// Route every write to an exported `let`/`var` through `_export`.
fn rewrite_live_bindings(module: &mut ParsedModule) -> Result<(), ConvertError> {
    let live = live_exports(module);
    if live.is_empty() {
        return Ok(());
    }

    let mut rewriter = LiveRewriter {
        live: &live,
        depth: 0,
        in_template: false,
        in_block_comment: false,
    };
    for (source_line, text) in &mut module.body {
        let line = *source_line + 1;
        rewriter.check_parameters(text, line)?;
        *text = rewriter.rewrite(text, line)?;
    }
    Ok(())
}

fn wrap_export(names: &[String], expr: String) -> String {
    names
        .iter()
        .rev()
        .fold(expr, |acc, name| format!("_export({}, {acc})", json_string(name)))
}

fn assignment_operator(text: &str) -> Option<&'static str> {
    let op = ASSIGNMENT_OPS.into_iter().find(|op| text.starts_with(op))?;
    if op == "=" && (text[1..].starts_with('=') || text[1..].starts_with('>')) {
        return None;
    }
    Some(op)
}

/// Byte length of the quoted literal at the start of `text`, or all of
/// `text` when the literal does not close.
fn literal_len(text: &str) -> usize {
    let mut chars = text.char_indices();
    let Some((_, quote)) = chars.next() else {
        return 0;
    };
    while let Some((idx, c)) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == quote {
            return idx + 1;
        }
    }
    text.len()
}

/// `end`, when `text[..end]` reads as a finished expression.
fn finished_at(text: &str, end: usize) -> Option<usize> {
    let expr = text[..end].trim_end();
    let last = expr.chars().next_back()?;
    let dangling = "+-*/%&|^!?:=<>,.(~".contains(last) && !expr.ends_with("++") && !expr.ends_with("--");
    (!dangling).then_some(end)
}

/// Byte length of the assignment right-hand side at the start of `text`.
/// `None` when it continues past the line.
fn expression_end(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut ternary = 0i32;
    let mut i = 0;

    while let Some(c) = text[i..].chars().next() {
        let rest = &text[i..];
        match c {
            '\'' | '"' | '`' => {
                let n = literal_len(rest);
                if n < 2 || !rest[..n].ends_with(c) {
                    return None;
                }
                i += n;
                continue;
            }
            '/' if rest.starts_with("//") || rest.starts_with("/*") => {
                return if depth == 0 { finished_at(text, i) } else { None };
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' | ',' | ';' if depth == 0 => return finished_at(text, i),
            ')' | ']' | '}' => depth -= 1,
            '?' if rest.starts_with("??") => {
                i += 2;
                continue;
            }
            '?' if depth == 0 && !rest.starts_with("?.") => ternary += 1,
            ':' if depth == 0 => {
                if ternary == 0 {
                    return finished_at(text, i);
                }
                ternary -= 1;
            }
            _ => {}
        }
        i += c.len_utf8();
    }

    if depth == 0 {
        finished_at(text, text.len())
    } else {
        None
    }
}

/// Rewrites body lines in order, carrying brace depth and open template or
/// comment state from one line to the next.
struct LiveRewriter<'a> {
    live: &'a [(String, Vec<String>)],
    depth: i32,
    in_template: bool,
    in_block_comment: bool,
}

impl<'a> LiveRewriter<'a> {
    fn names(&self, word: &str) -> Option<&'a [String]> {
        let live: &'a [(String, Vec<String>)] = self.live;
        live.iter()
            .find(|(local, _)| local == word)
            .map(|(_, names)| names.as_slice())
    }

    /// Parameters named like an exported binding hide it from the body.
    fn check_parameters(&self, text: &str, line: usize) -> Result<(), ConvertError> {
        for re in parameter_list_res() {
            for caps in re.captures_iter(text) {
                let params = caps.get(1).map_or("", |m| m.as_str());
                if let Some((local, _)) = self.live.iter().find(|(local, _)| contains_word(params, local)) {
                    return Err(shadowed(line, local));
                }
            }
        }
        Ok(())
    }

    fn rewrite(&mut self, text: &str, line: usize) -> Result<String, ConvertError> {
        let start_depth = self.depth;
        let trimmed = text.trim_start();
        let declaration = ["let ", "var ", "const "].iter().any(|k| trimmed.starts_with(k));

        let mut out = String::with_capacity(text.len() + 32);
        let mut parens = 0i32;
        let mut prev_sig: Option<char> = None;
        let mut prev_word: Option<&str> = None;
        let mut i = 0;

        while let Some(c) = text[i..].chars().next() {
            let rest = &text[i..];

            if self.in_block_comment {
                if rest.starts_with("*/") {
                    self.in_block_comment = false;
                    out.push_str("*/");
                    i += 2;
                } else {
                    out.push(c);
                    i += c.len_utf8();
                }
                continue;
            }
            if self.in_template {
                if c == '\\' {
                    let n = rest[1..].chars().next().map_or(1, |e| 1 + e.len_utf8());
                    out.push_str(&rest[..n]);
                    i += n;
                    continue;
                }
                if c == '`' {
                    self.in_template = false;
                    prev_sig = Some(c);
                    prev_word = None;
                }
                out.push(c);
                i += c.len_utf8();
                continue;
            }

            if rest.starts_with("//") {
                out.push_str(rest);
                break;
            }
            if rest.starts_with("/*") {
                self.in_block_comment = true;
                out.push_str("/*");
                i += 2;
                continue;
            }
            if c == '\'' || c == '"' {
                let n = literal_len(rest);
                out.push_str(&rest[..n]);
                i += n;
                prev_sig = Some(c);
                prev_word = None;
                continue;
            }
            if c == '`' {
                self.in_template = true;
                out.push(c);
                i += 1;
                continue;
            }

            if c.is_alphabetic() || c == '_' || c == '$' {
                let len = rest.find(|ch: char| !is_ident_char(ch)).unwrap_or(rest.len());
                let word = &rest[..len];
                i += len;

                match self.names(word).filter(|_| prev_sig != Some('.')) {
                    None => out.push_str(word),
                    Some(names) => {
                        let after = &text[i..];
                        let after_trimmed = after.trim_start();
                        let gap = after.len() - after_trimmed.len();
                        let prefix = out.trim_end();
                        let prefix_op = ["++", "--"].into_iter().find(|op| prefix.ends_with(op));
                        let prefix_len = prefix.len();

                        if prev_word.is_some_and(|w| matches!(w, "let" | "const" | "var" | "function" | "class")) {
                            if self.depth > 0 || parens > 0 {
                                return Err(shadowed(line, word));
                            }
                            out.push_str(word);
                        } else if declaration && prev_sig == Some(',') && parens == 0 && self.depth == start_depth {
                            if start_depth > 0 {
                                return Err(shadowed(line, word));
                            }
                            out.push_str(word);
                        } else if after_trimmed.starts_with("=>") {
                            return Err(shadowed(line, word));
                        } else if let Some(op) = prefix_op {
                            out.truncate(prefix_len - op.len());
                            out.push_str(&wrap_export(names, format!("{op}{word}")));
                        } else if let Some(op) = ["++", "--"].into_iter().find(|op| after_trimmed.starts_with(op)) {
                            let sign = if op == "++" { '+' } else { '-' };
                            let exports: Vec<String> = names
                                .iter()
                                .map(|name| format!("_export({}, {word} {sign} 1)", json_string(name)))
                                .collect();
                            out.push_str(&format!("({}, {word}{op})", exports.join(", ")));
                            i += gap + op.len();
                        } else if let Some(op) = assignment_operator(after_trimmed) {
                            let rhs_start = i + gap + op.len();
                            let rhs_len = expression_end(&text[rhs_start..]).ok_or_else(|| {
                                unsupported(line, format!("write to exported `{word}` continues past the line"))
                            })?;
                            let rhs_end = rhs_start + rhs_len;
                            let rhs = self.rewrite(&text[rhs_start..rhs_end], line)?;
                            out.push_str(&wrap_export(names, format!("{word}{}{rhs}", &text[i..rhs_start])));
                            i = rhs_end;
                        } else {
                            out.push_str(word);
                        }
                    }
                }

                prev_word = Some(word);
                prev_sig = word.chars().next_back();
                continue;
            }

            match c {
                '(' | '[' => parens += 1,
                ')' | ']' => parens -= 1,
                '{' => self.depth += 1,
                '}' => self.depth -= 1,
                _ => {}
            }
            out.push(c);
            if !c.is_whitespace() {
                prev_sig = Some(c);
                prev_word = None;
            }
            i += c.len_utf8();
        }

        Ok(out)
    }
}

// =============================================================================
// Emission
// =============================================================================

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn export_calls(exports: &[(String, String)]) -> String {
    exports
        .iter()
        .map(|(exported, local)| format!("_export({}, {local});", json_string(exported)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn setter(dep: &Dependency) -> String {
    if dep.bindings.is_empty() {
        return "function () {}".to_string();
    }
    let statements: Vec<String> = dep
        .bindings
        .iter()
        .map(|binding| match binding {
            Binding::Import { imported, local } => format!("{local} = _m[{}];", json_string(imported)),
            Binding::Namespace { local } => format!("{local} = _m;"),
            Binding::Reexport { imported, exported } => {
                format!("_export({}, _m[{}]);", json_string(exported), json_string(imported))
            }
            Binding::ReexportNamespace { exported } => {
                format!("_export({}, _m);", json_string(exported))
            }
            Binding::ReexportAll => "for (var _k in _m) { if (_k !== \"default\") _export(_k, _m[_k]); }"
                .to_string(),
        })
        .collect();
    format!("function (_m) {{ {} }}", statements.join(" "))
}

fn emit_module(module: &ParsedModule, source: &str, name: &str) -> ConvertedModule {
    let mut out: Vec<String> = Vec::with_capacity(module.body.len() + 12);
    let mut map = LineMapBuilder::new();

    let deps: Vec<String> = module.deps.iter().map(|d| json_string(&d.specifier)).collect();
    out.push(format!(
        "System.register({}, [{}], function (_export, _context) {{",
        json_string(name),
        deps.join(", ")
    ));
    out.push("\t\"use strict\";".to_string());
    if !module.locals.is_empty() {
        out.push(format!("\tvar {};", module.locals.join(", ")));
    }
    out.push("\treturn {".to_string());
    let setters: Vec<String> = module.deps.iter().map(setter).collect();
    out.push(format!("\t\tsetters: [{}],", setters.join(", ")));
    out.push(format!(
        "\t\texecute: {}function () {{",
        if module.is_async { "async " } else { "" }
    ));
    if !module.hoisted_exports.is_empty() {
        out.push(format!("\t\t\t{}", export_calls(&module.hoisted_exports)));
    }
    for (source_line, text) in &module.body {
        map.add_line(out.len() as u32, *source_line as u32);
        out.push(text.clone());
    }
    if !module.exports.is_empty() {
        out.push(format!("\t\t\t{}", export_calls(&module.exports)));
    }
    out.push("\t\t}".to_string());
    out.push("\t};".to_string());
    out.push("});".to_string());

    ConvertedModule {
        code: out.join("\n"),
        map: Some(map.generate(name, source)),
    }
}
