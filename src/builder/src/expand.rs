//! Environment mapping and `$VAR` substitution.

use serde::{Deserialize, Serialize};

/// Ordered environment mapping.
///
/// Keys are unique; setting an existing key overwrites its value in place,
/// so the original insertion position is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a variable, replacing the value of an existing key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.vars.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.vars.push((key, value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `KEY=VALUE` strings in insertion order.
    pub fn to_strings(&self) -> Vec<String> {
        self.vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

impl From<Vec<String>> for Environment {
    fn from(list: Vec<String>) -> Self {
        let mut env = Environment::new();
        for entry in list {
            match entry.split_once('=') {
                Some((k, v)) => env.set(k, v),
                None => env.set(entry, ""),
            }
        }
        env
    }
}

impl From<Environment> for Vec<String> {
    fn from(env: Environment) -> Self {
        env.to_strings()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut env = Environment::new();
        for (k, v) in iter {
            env.set(k, v);
        }
        env
    }
}

/// Replace every `$NAME` and `${NAME}` in `input` with its value in `env`.
///
/// Unset names expand to the empty string. The output is not re-scanned.
/// `\$` is left untouched, as is any `$` not followed by a valid name
/// (`$(`, `$1`, `$?`, an unterminated `${`).
pub fn expand(input: &str, env: &Environment) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\\' && chars.get(i + 1) == Some(&'$') {
            out.push('\\');
            out.push('$');
            i += 2;
            continue;
        }

        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        if chars.get(i + 1) == Some(&'{') {
            let start = i + 2;
            let end = chars[start..].iter().position(|&ch| ch == '}');
            if let Some(len) = end {
                let name: String = chars[start..start + len].iter().collect();
                if is_valid_name(&name) {
                    out.push_str(env.get(&name).unwrap_or(""));
                    i = start + len + 1;
                    continue;
                }
            }
            out.push(c);
            i += 1;
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while end < chars.len() && is_name_char(chars[end], end == start) {
            end += 1;
        }

        if end == start {
            out.push(c);
            i += 1;
        } else {
            let name: String = chars[start..end].iter().collect();
            out.push_str(env.get(&name).unwrap_or(""));
            i = end;
        }
    }

    out
}

fn is_name_char(c: char, first: bool) -> bool {
    if first {
        c.is_ascii_alphabetic() || c == '_'
    } else {
        c.is_ascii_alphanumeric() || c == '_'
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if is_name_char(first, true) => chars.all(|c| is_name_char(c, false)),
        _ => false,
    }
}
