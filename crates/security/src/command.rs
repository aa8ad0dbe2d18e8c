//! Command policy — the allow/deny gate in front of `execute_commands`.
//!
//! A command is allowed only if:
//! - it matches none of the denied patterns
//! - every pipeline segment starts with an allow-listed base command, and so
//!   does every command it embeds (`$(...)`, backticks, `<(...)`,
//!   `find -exec`, `xargs`, `env`/`nice`/`timeout` wrappers)
//! - its working directory is inside an approved directory
//! - every path it modifies resolves inside an approved directory: arguments
//!   of `cp`, `mv`, `rm`, `mkdir`, `touch` and friends, output flags such as
//!   `curl -o` or `tar -C`, redirect targets, and the start points of a
//!   `find` that deletes or runs commands
//! - no path argument falls under a forbidden path
//! - it does not background itself (`&`, `nohup`, `disown`, `daemon`)

use regex::Regex;
use std::collections::HashSet;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;
use merlin_config::PolicyConfig;
use crate::path::{is_within, normalize, resolve_against, resolve_roots, within_any};

/// Commands whose non-flag arguments are paths they create or modify.
const PATH_WRITERS: &[&str] = &[
    "cp", "mv", "rm", "rmdir", "mkdir", "touch", "cd", "ln", "tee", "truncate", "gzip", "gunzip", "zip",
];

/// Flags whose value is a path the command writes to.
const OUTPUT_FLAGS: &[(&str, &[&str])] = &[
    ("cp", &["-t", "--target-directory"]),
    ("mv", &["-t", "--target-directory"]),
    ("ln", &["-t", "--target-directory"]),
    ("curl", &["-o", "--output", "--output-dir", "-D", "--dump-header", "-c", "--cookie-jar"]),
    (
        "wget",
        &["-O", "--output-document", "-P", "--directory-prefix", "-o", "--output-file", "-a", "--append-output"],
    ),
    ("tar", &["-C", "--directory", "-f", "--file"]),
    ("unzip", &["-d"]),
    ("sort", &["-o", "--output"]),
];

/// `find` primaries that run another command on every match.
const FIND_EXEC: &[&str] = &["-exec", "-execdir", "-ok", "-okdir"];

/// `find` primaries that write a file named by the next argument.
const FIND_FILE_OUTPUTS: &[&str] = &["-fprint", "-fprint0", "-fprintf", "-fls"];

/// `xargs` flags that take a separate value.
const XARGS_VALUE_FLAGS: &[&str] = &["-a", "-d", "-E", "-I", "-L", "-n", "-P", "-s", "--arg-file", "--delimiter"];

/// Programs that run the command named in their arguments, with the flags
/// of each that take a separate value.
const WRAPPERS: &[(&str, &[&str])] = &[
    ("env", &["-u", "--unset", "-C", "--chdir"]),
    ("nice", &["-n", "--adjustment"]),
    ("timeout", &["-s", "--signal", "-k", "--kill-after"]),
    ("time", &["-f", "--format", "-o", "--output"]),
    ("command", &[]),
    ("exec", &[]),
    ("stdbuf", &[]),
];

const BACKGROUND_WORDS: &[&str] = &["nohup", "disown", "daemon", "setsid"];

/// Deepest nesting of embedded commands we are willing to follow.
const MAX_NESTING: usize = 8;

/// Errors building a policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid denied pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    Denied { reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allowed)
    }

    fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision::Denied {
            reason: reason.into(),
        }
    }
}

/// Return early with the denial if a check fails.
macro_rules! ensure_allowed {
    ($decision:expr) => {
        if let PolicyDecision::Denied { reason } = $decision {
            return PolicyDecision::Denied { reason };
        }
    };
}

/// Compiled command policy.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: HashSet<String>,
    denied: Vec<Regex>,
    approved: Vec<PathBuf>,
    forbidden: Vec<PathBuf>,
}

impl CommandPolicy {
    pub fn new(
        allowed_commands: &[String],
        denied_patterns: &[String],
        approved_directories: &[String],
        forbidden_paths: &[String],
    ) -> Result<Self, PolicyError> {
        let denied = denied_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| PolicyError::InvalidPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowed: allowed_commands.iter().cloned().collect(),
            denied,
            approved: resolve_roots(approved_directories),
            forbidden: resolve_roots(forbidden_paths),
        })
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        Self::new(
            &config.allowed_commands,
            &config.denied_patterns,
            &config.approved_directories,
            &config.forbidden_paths,
        )
    }

    /// Normalized approved directories.
    pub fn approved_directories(&self) -> &[PathBuf] {
        &self.approved
    }

    /// Where commands run when the step names no working directory.
    pub fn default_working_directory(&self) -> Option<&Path> {
        self.approved.first().map(PathBuf::as_path)
    }

    /// Check that a directory is approved and not forbidden.
    pub fn check_directory(&self, dir: &Path) -> PolicyDecision {
        let dir = normalize(dir);
        if self.is_forbidden(&dir) {
            return PolicyDecision::deny(format!("{} is a forbidden path", dir.display()));
        }
        if !within_any(&dir, &self.approved) {
            return PolicyDecision::deny(format!(
                "{} is outside the approved directories",
                dir.display()
            ));
        }
        PolicyDecision::Allowed
    }

    fn is_forbidden(&self, path: &Path) -> bool {
        self.forbidden.iter().any(|f| is_within(path, f))
    }

    /// Check one command line run from `working_directory`.
    pub fn check(&self, command: &str, working_directory: &Path) -> PolicyDecision {
        if command.trim().is_empty() {
            return PolicyDecision::deny("empty command");
        }

        if let Some(pattern) = self.denied.iter().find(|re| re.is_match(command)) {
            return PolicyDecision::deny(format!(
                "command matches denied pattern: {}",
                pattern.as_str()
            ));
        }

        let cwd = normalize(working_directory);
        if let PolicyDecision::Denied { reason } = self.check_directory(&cwd) {
            return PolicyDecision::deny(format!("working directory rejected: {reason}"));
        }

        self.check_line(command, &cwd, 0)
    }

    /// Check a command line, then every command substituted into it.
    fn check_line(&self, line: &str, cwd: &Path, depth: usize) -> PolicyDecision {
        if depth > MAX_NESTING {
            return PolicyDecision::deny("embedded commands are nested too deeply");
        }
        let lexed = match tokenize(line) {
            Ok(lexed) => lexed,
            Err(reason) => return PolicyDecision::deny(reason),
        };

        let tokens = &lexed.tokens;
        let has_pipe = tokens.iter().any(|t| t.is_op("|"));
        let backgrounds = tokens.iter().any(|t| t.is_op("&"))
            || tokens
                .iter()
                .any(|t| matches!(t, Token::Word(w) if BACKGROUND_WORDS.contains(&w.as_str())));
        if backgrounds {
            let how = if has_pipe { " with pipes" } else { "" };
            return PolicyDecision::deny(format!("command attempts background execution{how}"));
        }

        for inner in &lexed.substitutions {
            if let PolicyDecision::Denied { reason } = self.check_line(inner, cwd, depth + 1) {
                return PolicyDecision::deny(format!("command substitution rejected: {reason}"));
            }
        }

        for segment in segments(tokens) {
            ensure_allowed!(self.check_segment(&segment, cwd, depth));
        }

        PolicyDecision::Allowed
    }

    fn check_segment(&self, segment: &Segment, cwd: &Path, depth: usize) -> PolicyDecision {
        let Some((program, args)) = segment.words.split_first() else {
            return PolicyDecision::deny("empty pipeline segment");
        };
        ensure_allowed!(self.check_invocation(program, args, cwd, depth));

        for redirect in &segment.redirects {
            ensure_allowed!(self.check_write_target(redirect, cwd, "redirect"));
        }

        PolicyDecision::Allowed
    }

    /// Check one program with its arguments, following any command it runs.
    fn check_invocation(&self, program: &str, args: &[String], cwd: &Path, depth: usize) -> PolicyDecision {
        if depth > MAX_NESTING {
            return PolicyDecision::deny("embedded commands are nested too deeply");
        }
        let base = base_name(program);
        if !self.allowed.contains(base) {
            return PolicyDecision::deny(format!(
                "command '{base}' is not in the allowed command list"
            ));
        }

        for arg in args {
            let value = flag_value(arg).unwrap_or(arg.as_str());
            if looks_like_path(value) && self.is_forbidden(&resolve_against(cwd, &home_to_tilde(value))) {
                return PolicyDecision::deny(format!("'{arg}' is a forbidden path"));
            }
        }

        if PATH_WRITERS.contains(&base) {
            for arg in args.iter().filter(|a| !a.starts_with('-')) {
                ensure_allowed!(self.check_write_target(arg, cwd, base));
            }
        }

        for (flag, target) in output_targets(base, args) {
            ensure_allowed!(self.check_write_target(&target, cwd, &format!("{base} {flag}")));
        }

        match base {
            "find" => self.check_find(args, cwd, depth),
            "xargs" => self.check_xargs(args, cwd, depth),
            _ => match wrapped_command(base, args) {
                Some(inner) if !inner.is_empty() => self.check_invocation(&inner[0], &inner[1..], cwd, depth + 1),
                _ => PolicyDecision::Allowed,
            },
        }
    }

    /// A path some command writes to must be static and inside an approved
    /// directory.
    fn check_write_target(&self, arg: &str, cwd: &Path, what: &str) -> PolicyDecision {
        if arg == "-" {
            return PolicyDecision::Allowed;
        }
        let arg = home_to_tilde(arg);
        if is_dynamic(&arg) {
            return PolicyDecision::deny(format!(
                "'{what}' target '{arg}' is computed at run time and cannot be checked"
            ));
        }
        let target = resolve_against(cwd, &arg);
        if self.is_forbidden(&target) {
            return PolicyDecision::deny(format!("'{what}' targets forbidden path {}", target.display()));
        }
        if !within_any(&target, &self.approved) {
            return PolicyDecision::deny(format!(
                "'{what}' targets {} outside the approved directories",
                target.display()
            ));
        }
        PolicyDecision::Allowed
    }

    /// `find` may delete, write or run commands only under approved start
    /// points, and only run allowed commands.
    fn check_find(&self, args: &[String], cwd: &Path, depth: usize) -> PolicyDecision {
        let starts: Vec<&str> = args
            .iter()
            .take_while(|a| !a.starts_with('-') && *a != "(" && *a != "!")
            .map(String::as_str)
            .collect();
        let acts = args
            .iter()
            .any(|a| a == "-delete" || FIND_EXEC.contains(&a.as_str()) || FIND_FILE_OUTPUTS.contains(&a.as_str()));
        if acts {
            let starts = if starts.is_empty() { vec!["."] } else { starts };
            for start in starts {
                ensure_allowed!(self.check_write_target(start, cwd, "find"));
            }
        }

        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();
            if FIND_FILE_OUTPUTS.contains(&arg) {
                let Some(target) = args.get(i + 1) else {
                    return PolicyDecision::deny(format!("'find {arg}' is missing its file"));
                };
                ensure_allowed!(self.check_write_target(target, cwd, &format!("find {arg}")));
                i += 2;
            } else if FIND_EXEC.contains(&arg) {
                let command: Vec<String> = args[i + 1..]
                    .iter()
                    .take_while(|a| *a != ";" && *a != "+")
                    .cloned()
                    .collect();
                let Some((program, rest)) = command.split_first() else {
                    return PolicyDecision::deny(format!("'find {arg}' names no command"));
                };
                if let PolicyDecision::Denied { reason } = self.check_invocation(program, rest, cwd, depth + 1) {
                    return PolicyDecision::deny(format!("'find {arg}' rejected: {reason}"));
                }
                i += command.len() + 2;
            } else {
                i += 1;
            }
        }
        PolicyDecision::Allowed
    }

    /// `xargs` appends arguments read from stdin, so the command it runs must
    /// be allowed and must not write to paths.
    fn check_xargs(&self, args: &[String], cwd: &Path, depth: usize) -> PolicyDecision {
        let mut i = 0;
        while i < args.len() && args[i].starts_with('-') {
            if XARGS_VALUE_FLAGS.contains(&args[i].as_str()) {
                i += 1;
            }
            i += 1;
        }
        let Some((program, rest)) = args.get(i..).and_then(<[String]>::split_first) else {
            return PolicyDecision::Allowed;
        };

        let base = base_name(program);
        let writes = PATH_WRITERS.contains(&base)
            || OUTPUT_FLAGS.iter().any(|(p, _)| *p == base)
            || matches!(base, "find" | "xargs")
            || WRAPPERS.iter().any(|(p, _)| *p == base);
        if writes {
            return PolicyDecision::deny(format!(
                "'xargs {base}' acts on arguments that cannot be checked"
            ));
        }
        self.check_invocation(program, rest, cwd, depth + 1)
    }
}

fn base_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

fn looks_like_path(arg: &str) -> bool {
    !arg.starts_with('-') && (arg.contains('/') || arg.starts_with('~'))
}

/// The value of a `--flag=value` argument.
fn flag_value(arg: &str) -> Option<&str> {
    if arg.starts_with('-') {
        arg.split_once('=').map(|(_, value)| value)
    } else {
        None
    }
}

/// Rewrite a leading `$HOME` or `${HOME}` as `~`.
fn home_to_tilde(arg: &str) -> String {
    for prefix in ["${HOME}", "$HOME"] {
        if let Some(rest) = arg.strip_prefix(prefix)
            && (rest.is_empty() || rest.starts_with('/'))
        {
            return format!("~{rest}");
        }
    }
    arg.to_string()
}

/// Whether the shell computes this word when the command runs.
fn is_dynamic(word: &str) -> bool {
    word.contains('$') || word.contains('`') || word.starts_with("<(") || word.starts_with(">(")
}

/// Paths named by the output flags of `program`, as `(flag, path)` pairs.
///
/// Handles `-o path`, `-opath`, `--output path`, `--output=path` and short
/// flags bundled with others (`-sSLo path`). `tar`'s dashless first
/// argument (`tar czf out.tgz`) counts as a bundle.
fn output_targets(program: &str, args: &[String]) -> Vec<(String, String)> {
    let Some((_, flags)) = OUTPUT_FLAGS.iter().find(|(p, _)| *p == program) else {
        return Vec::new();
    };

    let mut targets = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        let next = args.get(i + 1);
        let dashless_tar = program == "tar" && i == 0 && arg.chars().all(|c| c.is_ascii_alphabetic());
        let cluster = if dashless_tar {
            format!("-{arg}")
        } else {
            arg.clone()
        };

        for flag in flags.iter() {
            if let Some(long) = flag.strip_prefix("--") {
                if cluster == *flag {
                    if let Some(value) = next {
                        targets.push((flag.to_string(), value.clone()));
                    }
                } else if let Some(value) = cluster
                    .strip_prefix("--")
                    .and_then(|c| c.strip_prefix(long))
                    .and_then(|c| c.strip_prefix('='))
                {
                    targets.push((flag.to_string(), value.to_string()));
                }
                continue;
            }

            let Some(letter) = flag.chars().nth(1) else {
                continue;
            };
            if cluster.starts_with("--") || !cluster.starts_with('-') {
                continue;
            }
            let short = &cluster[1..];
            if let Some(pos) = short.find(letter) {
                let rest = &short[pos + letter.len_utf8()..];
                if rest.is_empty() {
                    if let Some(value) = next {
                        targets.push((flag.to_string(), value.clone()));
                    }
                } else {
                    targets.push((flag.to_string(), rest.to_string()));
                }
            }
        }
    }
    targets
}

/// The command a wrapper such as `env` or `timeout` runs.
fn wrapped_command<'a>(program: &str, args: &'a [String]) -> Option<&'a [String]> {
    let (_, value_flags) = WRAPPERS.iter().find(|(p, _)| *p == program)?;
    let mut i = 0;
    while let Some(arg) = args.get(i) {
        if arg.starts_with('-') {
            i += if value_flags.contains(&arg.as_str()) { 2 } else { 1 };
        } else if program == "env" && arg.contains('=') {
            i += 1;
        } else {
            break;
        }
    }
    if program == "timeout" {
        i += 1;
    }
    Some(args.get(i..).unwrap_or(&[]))
}

// ── Tokenizer ──

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Op(&'static str),
}

impl Token {
    fn is_op(&self, op: &str) -> bool {
        matches!(self, Token::Op(o) if *o == op)
    }
}

/// A tokenized command line and the bodies of the commands substituted into
/// it.
#[derive(Debug, Default)]
struct Lexed {
    tokens: Vec<Token>,
    substitutions: Vec<String>,
}

/// Split a command line into words and operators, honouring quotes and
/// backslash escapes the way `sh` does for the cases we care about.
///
/// `$(...)`, backticks and `<(...)`/`>(...)` are kept verbatim in their word
/// and their bodies collected for checking. Unterminated quotes or
/// substitutions are an error.
fn tokenize(command: &str) -> Result<Lexed, String> {
    let mut lexed = Lexed::default();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    let flush = |word: &mut String, in_word: &mut bool, tokens: &mut Vec<Token>| {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                read_single_quoted(&mut chars, &mut word)?;
            }
            '"' => {
                in_word = true;
                read_double_quoted(&mut chars, &mut word, &mut lexed.substitutions)?;
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
            }
            '$' if chars.peek() == Some(&'(') => {
                in_word = true;
                chars.next();
                let body = read_parenthesized(&mut chars)?;
                word.push_str(&format!("$({body})"));
                lexed.substitutions.push(body);
            }
            '`' => {
                in_word = true;
                let body = read_backticks(&mut chars)?;
                word.push_str(&format!("`{body}`"));
                lexed.substitutions.push(body);
            }
            '<' | '>' if chars.peek() == Some(&'(') => {
                flush(&mut word, &mut in_word, &mut lexed.tokens);
                chars.next();
                let body = read_parenthesized(&mut chars)?;
                lexed.tokens.push(Token::Word(format!("{c}({body})")));
                lexed.substitutions.push(body);
            }
            ';' | '\n' => {
                flush(&mut word, &mut in_word, &mut lexed.tokens);
                lexed.tokens.push(Token::Op(";"));
            }
            '>' | '&' if matches!((c, chars.peek()), ('>', Some('&')) | ('&', Some('>'))) => {
                // `>&` duplicates a descriptor and `&>` redirects both streams
                flush(&mut word, &mut in_word, &mut lexed.tokens);
                chars.next();
                lexed.tokens.push(Token::Op(">"));
            }
            '|' | '&' | '>' => {
                flush(&mut word, &mut in_word, &mut lexed.tokens);
                let doubled = chars.peek() == Some(&c);
                if doubled {
                    chars.next();
                }
                let op = match (c, doubled) {
                    ('|', true) => "||",
                    ('|', false) => "|",
                    ('&', true) => "&&",
                    ('&', false) => "&",
                    ('>', true) => ">>",
                    _ => ">",
                };
                lexed.tokens.push(Token::Op(op));
            }
            '<' => {
                flush(&mut word, &mut in_word, &mut lexed.tokens);
                lexed.tokens.push(Token::Op("<"));
            }
            c if c.is_whitespace() => flush(&mut word, &mut in_word, &mut lexed.tokens),
            other => {
                in_word = true;
                word.push(other);
            }
        }
    }
    flush(&mut word, &mut in_word, &mut lexed.tokens);
    Ok(lexed)
}

fn read_single_quoted(chars: &mut Peekable<Chars<'_>>, out: &mut String) -> Result<(), String> {
    for c in chars.by_ref() {
        if c == '\'' {
            return Ok(());
        }
        out.push(c);
    }
    Err("unterminated single quote".into())
}

/// Read a double-quoted string after its opening quote. Substitutions inside
/// it still run, so their bodies are collected.
fn read_double_quoted(
    chars: &mut Peekable<Chars<'_>>,
    out: &mut String,
    substitutions: &mut Vec<String>,
) -> Result<(), String> {
    while let Some(c) = chars.next() {
        match c {
            '"' => return Ok(()),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '$' if chars.peek() == Some(&'(') => {
                chars.next();
                let body = read_parenthesized(chars)?;
                out.push_str(&format!("$({body})"));
                substitutions.push(body);
            }
            '`' => {
                let body = read_backticks(chars)?;
                out.push_str(&format!("`{body}`"));
                substitutions.push(body);
            }
            other => out.push(other),
        }
    }
    Err("unterminated double quote".into())
}

/// Read the body of a `(...)` group after its opening parenthesis, keeping
/// quotes and nested groups intact.
fn read_parenthesized(chars: &mut Peekable<Chars<'_>>) -> Result<String, String> {
    let mut body = String::new();
    let mut depth = 1usize;
    while let Some(c) = chars.next() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(body);
                }
            }
            '\\' => {
                body.push(c);
                if let Some(escaped) = chars.next() {
                    body.push(escaped);
                }
                continue;
            }
            '\'' => {
                body.push(c);
                read_single_quoted(chars, &mut body)?;
                body.push(c);
                continue;
            }
            '"' => {
                body.push(c);
                read_raw_double_quoted(chars, &mut body)?;
                body.push(c);
                continue;
            }
            '`' => {
                let inner = read_backticks(chars)?;
                body.push('`');
                body.push_str(&inner);
                body.push('`');
                continue;
            }
            _ => {}
        }
        body.push(c);
    }
    Err("unterminated command substitution".into())
}

/// Copy a double-quoted string verbatim, skipping over the substitutions it
/// contains so their parentheses and quotes do not end it early.
fn read_raw_double_quoted(chars: &mut Peekable<Chars<'_>>, out: &mut String) -> Result<(), String> {
    while let Some(c) = chars.next() {
        match c {
            '"' => return Ok(()),
            '\\' => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '$' if chars.peek() == Some(&'(') => {
                chars.next();
                let inner = read_parenthesized(chars)?;
                out.push_str(&format!("$({inner})"));
            }
            '`' => {
                let inner = read_backticks(chars)?;
                out.push('`');
                out.push_str(&inner);
                out.push('`');
            }
            other => out.push(other),
        }
    }
    Err("unterminated double quote".into())
}

fn read_backticks(chars: &mut Peekable<Chars<'_>>) -> Result<String, String> {
    let mut body = String::new();
    while let Some(c) = chars.next() {
        match c {
            '`' => return Ok(body),
            '\\' => match chars.next() {
                Some(escaped @ ('`' | '\\' | '$')) => body.push(escaped),
                Some(other) => {
                    body.push('\\');
                    body.push(other);
                }
                None => body.push('\\'),
            },
            other => body.push(other),
        }
    }
    Err("unterminated backtick substitution".into())
}

#[derive(Debug, Default)]
struct Segment {
    words: Vec<String>,
    redirects: Vec<String>,
}

/// Group tokens into pipeline segments.
fn segments(tokens: &[Token]) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut current = Segment::default();
    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        match token {
            Token::Word(w) => current.words.push(w.clone()),
            Token::Op(">") | Token::Op(">>") => {
                if let Some(Token::Word(target)) = iter.next() {
                    current.redirects.push(target.clone());
                }
            }
            Token::Op("<") => {
                if let Some(Token::Word(source)) = iter.next() {
                    current.words.push(source.clone());
                }
            }
            Token::Op(_) => {
                if !current.words.is_empty() || !current.redirects.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.words.is_empty() || !current.redirects.is_empty() {
        out.push(current);
    }
    out
}
