//! External solver backend speaking SMT-LIB 2 over a child process.
//!
//! [`TextSolver`] renders an [`SmtQuery`] as SMT-LIB 2 text, pipes it to a
//! solver process (`z3 -in` by default), and parses the answer. Every
//! failure mode on this path (the binary is missing, the process dies, the
//! per-query timeout fires, the output does not parse) degrades to
//! [`SmtResponse::Unknown`]: the search prunes that branch and goes on.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::smt::{Model, SmtQuery, SmtResponse, StringAtom, StringSolver, StringTerm};

/// SMT-LIB 2 process backend.
#[derive(Debug, Clone)]
pub struct TextSolver {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl TextSolver {
    /// A solver talking to `z3 -in` with the given per-query timeout.
    pub fn z3(timeout: Duration) -> Self {
        Self::new("z3", ["-in"], timeout)
    }

    pub fn new(
        program: &str,
        args: impl IntoIterator<Item = impl Into<String>>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    /// Render the query as an SMT-LIB 2 script.
    pub fn render(&self, query: &SmtQuery) -> String {
        let mut script = String::new();
        script.push_str(&format!("(set-option :timeout {})\n", self.timeout.as_millis()));
        for decl in &query.decls {
            script.push_str(&format!("(declare-const {} String)\n", decl.name));
        }
        for atom in &query.asserts {
            script.push_str(&format!("(assert {})\n", render_atom(atom)));
        }
        for model in &query.exclude {
            // The next model must differ from this one somewhere.
            script.push_str("(assert (not (and");
            for (name, value) in model {
                script.push_str(&format!(" (= {} {})", name, render_literal(value)));
            }
            script.push_str(")))\n");
        }
        script.push_str("(check-sat)\n");
        if !query.decls.is_empty() {
            script.push_str("(get-value (");
            for (i, decl) in query.decls.iter().enumerate() {
                if i > 0 {
                    script.push(' ');
                }
                script.push_str(&decl.name);
            }
            script.push_str("))\n");
        }
        script
    }

    fn run(&self, script: &str) -> Option<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| warn!("failed to spawn {}: {}", self.program, e))
            .ok()?;

        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(script.as_bytes()).is_err() {
                warn!("failed to write query to {}", self.program);
            }
            // Dropping stdin closes the pipe and lets the solver finish.
        }

        if !wait_with_timeout(&mut child, self.timeout + Duration::from_millis(100)) {
            warn!("{} exceeded the {:?} query budget, killing it", self.program, self.timeout);
            let _ = child.kill();
            let _ = child.wait();
            return None;
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            if stdout.read_to_string(&mut output).is_err() {
                return None;
            }
        }
        Some(output)
    }
}

/// Poll the child until it exits or the deadline passes.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return false,
        }
    }
}

impl StringSolver for TextSolver {
    fn solve(&self, query: &SmtQuery) -> SmtResponse {
        let script = self.render(query);
        debug!("smtlib query:\n{}", script);

        let Some(output) = self.run(&script) else {
            return SmtResponse::Unknown;
        };
        debug!("smtlib answer:\n{}", output);

        let mut lines = output.lines();
        match lines.next().map(str::trim) {
            Some("sat") => {}
            Some("unsat") => return SmtResponse::Unsat,
            Some("unknown") | Some("timeout") => return SmtResponse::Unknown,
            other => {
                warn!("unexpected solver verdict: {:?}", other);
                return SmtResponse::Unknown;
            }
        }

        if query.decls.is_empty() {
            return SmtResponse::Model(Model::new());
        }
        let rest: String = lines.collect::<Vec<_>>().join("\n");
        match parse_model(&rest) {
            Some(model) => SmtResponse::Model(model),
            None => {
                warn!("failed to parse model from solver output");
                SmtResponse::Unknown
            }
        }
    }
}

fn render_atom(atom: &StringAtom) -> String {
    match atom {
        StringAtom::Eq(a, b) => format!("(= {} {})", render_term(a), render_term(b)),
        StringAtom::Ne(a, b) => format!("(distinct {} {})", render_term(a), render_term(b)),
    }
}

fn render_term(term: &StringTerm) -> String {
    match term {
        StringTerm::Lit(text) => render_literal(text),
        StringTerm::Var(name) => name.to_string(),
        StringTerm::Concat(terms) => {
            if terms.is_empty() {
                return render_literal("");
            }
            let mut out = String::from("(str.++");
            for term in terms {
                out.push(' ');
                out.push_str(&render_term(term));
            }
            out.push(')');
            out
        }
    }
}

/// SMT-LIB string literal: double quotes are doubled.
fn render_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Parse a `get-value` answer: `((x "a") (y "b"))`.
fn parse_model(text: &str) -> Option<Model> {
    let tokens = tokenize(text)?;
    let mut model = BTreeMap::new();
    let mut i = 0;
    // Expect: ( ( name value ) ( name value ) ... )
    if tokens.get(i) != Some(&Token::Open) {
        return None;
    }
    i += 1;
    while tokens.get(i) == Some(&Token::Open) {
        i += 1;
        let name = match tokens.get(i)? {
            Token::Atom(name) => Rc::from(name.as_str()),
            _ => return None,
        };
        i += 1;
        let value = match tokens.get(i)? {
            Token::Str(value) => value.clone(),
            // Non-string values (solver quirks) are taken verbatim.
            Token::Atom(value) => value.clone(),
            Token::Open | Token::Close => return None,
        };
        i += 1;
        if tokens.get(i) != Some(&Token::Close) {
            return None;
        }
        i += 1;
        model.insert(name, value);
    }
    if tokens.get(i) != Some(&Token::Close) {
        return None;
    }
    Some(model)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Atom(String),
    Str(String),
}

fn tokenize(text: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next()? {
                        '"' => {
                            // A doubled quote is an escaped quote.
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                value.push('"');
                            } else {
                                break;
                            }
                        }
                        other => value.push(other),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }
    Some(tokens)
}
