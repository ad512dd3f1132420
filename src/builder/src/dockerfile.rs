//! Dockerfile parser.
//!
//! Parses a Dockerfile into an ordered sequence of build instructions.
//! Supports line continuations (`\`), full-line comments, and both shell
//! and JSON (exec) forms for RUN/CMD/ENTRYPOINT.

use std::fmt;

use strata_core::error::{BuildError, Result};

use crate::expand::{expand, Environment};

/// Instruction keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    From,
    Run,
    Add,
    Copy,
    Env,
    Cmd,
    Entrypoint,
    Expose,
    Volume,
    User,
    Maintainer,
    Workdir,
}

impl Opcode {
    /// Look up a keyword, case-insensitively.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let op = match keyword.to_ascii_uppercase().as_str() {
            "FROM" => Opcode::From,
            "RUN" => Opcode::Run,
            "ADD" => Opcode::Add,
            "COPY" => Opcode::Copy,
            "ENV" => Opcode::Env,
            "CMD" => Opcode::Cmd,
            "ENTRYPOINT" => Opcode::Entrypoint,
            "EXPOSE" => Opcode::Expose,
            "VOLUME" => Opcode::Volume,
            "USER" => Opcode::User,
            "MAINTAINER" => Opcode::Maintainer,
            "WORKDIR" => Opcode::Workdir,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::From => "FROM",
            Opcode::Run => "RUN",
            Opcode::Add => "ADD",
            Opcode::Copy => "COPY",
            Opcode::Env => "ENV",
            Opcode::Cmd => "CMD",
            Opcode::Entrypoint => "ENTRYPOINT",
            Opcode::Expose => "EXPOSE",
            Opcode::Volume => "VOLUME",
            Opcode::User => "USER",
            Opcode::Maintainer => "MAINTAINER",
            Opcode::Workdir => "WORKDIR",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Argument form of a command-taking instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandForm {
    /// Plain string, run through `/bin/sh -c`.
    Shell(String),
    /// JSON string array, used verbatim as argv.
    Exec(Vec<String>),
}

impl CommandForm {
    /// The argv this form produces.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandForm::Shell(cmd) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()]
            }
            CommandForm::Exec(args) => args.clone(),
        }
    }

    fn expand(&self, env: &Environment) -> CommandForm {
        match self {
            CommandForm::Shell(cmd) => CommandForm::Shell(expand(cmd, env)),
            CommandForm::Exec(args) => {
                CommandForm::Exec(args.iter().map(|a| expand(a, env)).collect())
            }
        }
    }
}

impl fmt::Display for CommandForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandForm::Shell(cmd) => f.write_str(cmd),
            CommandForm::Exec(args) => {
                let json = serde_json::to_string(args).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `FROM <image>`
    From { image: String },
    /// `RUN <command>` or `RUN ["exec", "form"]`
    Run(CommandForm),
    /// `ADD <src>... <dest>`
    Add { sources: Vec<String>, dest: String },
    /// `COPY <src>... <dest>`
    Copy { sources: Vec<String>, dest: String },
    /// `ENV <key> <value>` or `ENV <key>=<value> ...`
    Env { vars: Vec<(String, String)> },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd(CommandForm),
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint(CommandForm),
    /// `EXPOSE <port>[/<proto>] ...`
    Expose { ports: Vec<String> },
    /// `VOLUME <path> ...` or `VOLUME ["<path>", ...]`
    Volume { paths: Vec<String> },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `MAINTAINER <name>`
    Maintainer { name: String },
    /// `WORKDIR <path>`
    Workdir { path: String },
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::From { .. } => Opcode::From,
            Instruction::Run(_) => Opcode::Run,
            Instruction::Add { .. } => Opcode::Add,
            Instruction::Copy { .. } => Opcode::Copy,
            Instruction::Env { .. } => Opcode::Env,
            Instruction::Cmd(_) => Opcode::Cmd,
            Instruction::Entrypoint(_) => Opcode::Entrypoint,
            Instruction::Expose { .. } => Opcode::Expose,
            Instruction::Volume { .. } => Opcode::Volume,
            Instruction::User { .. } => Opcode::User,
            Instruction::Maintainer { .. } => Opcode::Maintainer,
            Instruction::Workdir { .. } => Opcode::Workdir,
        }
    }

    /// Canonical argument text, used for cache keys and history.
    pub fn args(&self) -> String {
        match self {
            Instruction::From { image } => image.clone(),
            Instruction::Run(form) | Instruction::Cmd(form) | Instruction::Entrypoint(form) => {
                form.to_string()
            }
            Instruction::Add { sources, dest } | Instruction::Copy { sources, dest } => {
                format!("{} {}", sources.join(" "), dest)
            }
            Instruction::Env { vars } => vars
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" "),
            Instruction::Expose { ports } => ports.join(" "),
            Instruction::Volume { paths } => paths.join(" "),
            Instruction::User { user } => user.clone(),
            Instruction::Maintainer { name } => name.clone(),
            Instruction::Workdir { path } => path.clone(),
        }
    }

    /// Substitute environment references in the arguments that take them.
    ///
    /// CMD, ENTRYPOINT and MAINTAINER are kept literal; FROM has no
    /// environment to expand against.
    pub fn expand(&self, env: &Environment) -> Instruction {
        match self {
            Instruction::Run(form) => Instruction::Run(form.expand(env)),
            Instruction::Add { sources, dest } => Instruction::Add {
                sources: sources.iter().map(|s| expand(s, env)).collect(),
                dest: expand(dest, env),
            },
            Instruction::Copy { sources, dest } => Instruction::Copy {
                sources: sources.iter().map(|s| expand(s, env)).collect(),
                dest: expand(dest, env),
            },
            Instruction::Env { vars } => Instruction::Env {
                vars: vars
                    .iter()
                    .map(|(k, v)| (k.clone(), expand(v, env)))
                    .collect(),
            },
            Instruction::Expose { ports } => Instruction::Expose {
                ports: ports.iter().map(|p| expand(p, env)).collect(),
            },
            Instruction::Volume { paths } => Instruction::Volume {
                paths: paths.iter().map(|p| expand(p, env)).collect(),
            },
            Instruction::User { user } => Instruction::User {
                user: expand(user, env),
            },
            Instruction::Workdir { path } => Instruction::Workdir {
                path: expand(path, env),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.opcode(), self.args())
    }
}

/// An instruction together with the line it starts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based line number of the instruction keyword
    pub line: usize,
    pub instruction: Instruction,
}

/// Parsed Dockerfile: a list of instructions in order.
#[derive(Debug, Clone)]
pub struct Dockerfile {
    pub statements: Vec<Statement>,
}

impl Dockerfile {
    /// Parse a Dockerfile from its text content.
    ///
    /// A document with no non-whitespace content fails with
    /// [`BuildError::EmptyDockerfile`]; every other problem is a
    /// [`BuildError::Parse`].
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Err(BuildError::EmptyDockerfile);
        }

        let mut statements = Vec::new();
        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let instruction = parse_instruction(trimmed, line_num)?;
            statements.push(Statement {
                line: line_num,
                instruction,
            });
        }

        match statements.first() {
            None => {
                return Err(BuildError::Parse {
                    line: 1,
                    message: "No FROM instruction found".to_string(),
                })
            }
            Some(first) if first.instruction.opcode() != Opcode::From => {
                return Err(BuildError::Parse {
                    line: first.line,
                    message: "First instruction must be FROM".to_string(),
                })
            }
            Some(_) => {}
        }

        if let Some(extra) = statements
            .iter()
            .skip(1)
            .find(|s| s.instruction.opcode() == Opcode::From)
        {
            return Err(BuildError::Parse {
                line: extra.line,
                message: "FROM may only appear as the first instruction".to_string(),
            });
        }

        Ok(Dockerfile { statements })
    }

    /// Parse a Dockerfile from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.statements.iter().map(|s| &s.instruction)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Join lines ending with `\` into single logical lines.
///
/// Only the backslash and the newline are removed. Between instructions a
/// line starting with `#` is a comment. Inside a continued instruction only
/// a `#` in column 0 starts a comment, and never `#!`: indented or
/// shebang-like lines there are argument data.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start_line = 0;
    let mut continuing = false;

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim_end_matches('\r');

        let is_comment = if continuing {
            line.starts_with('#') && !line.starts_with("#!")
        } else {
            line.trim_start().starts_with('#')
        };
        if is_comment {
            continue;
        }

        if !continuing {
            start_line = idx + 1;
        }

        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped);
            continuing = true;
        } else {
            current.push_str(line);
            logical_lines.push((start_line, std::mem::take(&mut current)));
            continuing = false;
        }
    }

    // Handle trailing continuation without final line
    if continuing && !current.is_empty() {
        logical_lines.push((start_line, current));
    }

    logical_lines
}

/// Parse a single logical line into an Instruction.
fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, rest) = split_first_word(line);

    let opcode = Opcode::from_keyword(keyword).ok_or_else(|| BuildError::Parse {
        line: line_num,
        message: format!("Unknown instruction '{}'", keyword),
    })?;

    if rest.is_empty() {
        return Err(BuildError::Parse {
            line: line_num,
            message: format!("{} requires at least one argument", opcode),
        });
    }

    match opcode {
        Opcode::From => parse_from(rest, line_num),
        Opcode::Run => Ok(Instruction::Run(parse_command(rest))),
        Opcode::Add | Opcode::Copy => parse_add(opcode, rest, line_num),
        Opcode::Env => parse_env(rest, line_num),
        Opcode::Cmd => Ok(Instruction::Cmd(parse_command(rest))),
        Opcode::Entrypoint => Ok(Instruction::Entrypoint(parse_command(rest))),
        Opcode::Expose => Ok(Instruction::Expose {
            ports: rest.split_whitespace().map(str::to_string).collect(),
        }),
        Opcode::Volume => Ok(Instruction::Volume {
            paths: parse_list(rest),
        }),
        Opcode::User => Ok(Instruction::User {
            user: rest.to_string(),
        }),
        Opcode::Maintainer => Ok(Instruction::Maintainer {
            name: rest.to_string(),
        }),
        Opcode::Workdir => Ok(Instruction::Workdir {
            path: rest.to_string(),
        }),
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let mut words = rest.split_whitespace();
    let image = words.next().unwrap_or_default().to_string();
    if words.next().is_some() {
        return Err(BuildError::Parse {
            line: line_num,
            message: format!("FROM takes exactly one image reference, got '{}'", rest),
        });
    }
    Ok(Instruction::From { image })
}

/// JSON array form if the argument parses as one, shell form otherwise.
fn parse_command(rest: &str) -> CommandForm {
    if rest.starts_with('[') {
        if let Some(args) = parse_json_array(rest) {
            return CommandForm::Exec(args);
        }
    }
    CommandForm::Shell(rest.to_string())
}

fn parse_add(opcode: Opcode, rest: &str, line_num: usize) -> Result<Instruction> {
    let mut parts = parse_list(rest);
    if parts.len() < 2 {
        return Err(BuildError::Parse {
            line: line_num,
            message: format!("{} requires at least one source and a destination", opcode),
        });
    }

    let dest = parts.pop().unwrap_or_default();
    let sources = parts;

    Ok(match opcode {
        Opcode::Copy => Instruction::Copy { sources, dest },
        _ => Instruction::Add { sources, dest },
    })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    let (first, remainder) = split_first_word(rest);

    // Legacy form: ENV KEY VALUE (value is the rest of the line, verbatim)
    if !first.contains('=') {
        return Ok(Instruction::Env {
            vars: vec![(first.to_string(), remainder.to_string())],
        });
    }

    // ENV KEY=VALUE [KEY2="VALUE 2" ...]
    let mut vars = Vec::new();
    for word in split_quoted(rest, line_num)? {
        let (key, value) = word.split_once('=').ok_or_else(|| BuildError::Parse {
            line: line_num,
            message: format!("ENV names can not be blank: '{}' is not KEY=VALUE", word),
        })?;
        if key.is_empty() {
            return Err(BuildError::Parse {
                line: line_num,
                message: "ENV names can not be blank".to_string(),
            });
        }
        vars.push((key.to_string(), value.to_string()));
    }
    Ok(Instruction::Env { vars })
}

// --- Helpers ---

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str) -> Option<Vec<String>> {
    serde_json::from_str::<Vec<String>>(s).ok()
}

/// JSON array or whitespace-separated words.
fn parse_list(rest: &str) -> Vec<String> {
    if rest.starts_with('[') {
        if let Some(items) = parse_json_array(rest) {
            return items;
        }
    }
    rest.split_whitespace().map(str::to_string).collect()
}

/// Split on whitespace, keeping quoted sections together and removing
/// the quotes. A backslash escapes the next character outside single quotes.
fn split_quoted(s: &str, line_num: usize) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(BuildError::Parse {
            line: line_num,
            message: format!("Unterminated quote in '{}'", s),
        });
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
