//! Shell-style tokenizer for dump lines.
//!
//! An explicit state machine that splits a line into words, honouring single
//! quotes, double quotes and backslash escapes the way `/bin/sh` would.
//! Adjacent quoted and unquoted segments join into one word. Each token
//! remembers whether any part of it was quoted, so the decoder can tell a
//! literal `"!"` or `"-x"` value from a negation marker or a switch.

use crate::error::{RuleError, RuleResult};

/// One word of a tokenized line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub quoted: bool,
}

impl Token {
    pub fn bare(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            quoted: false,
        }
    }

    pub fn quoted(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            quoted: true,
        }
    }

    /// An unquoted word shaped like a switch (`-s`, `--dport`).
    pub fn is_switch(&self) -> bool {
        if self.quoted {
            return false;
        }
        let mut chars = self.text.chars();
        matches!(
            (chars.next(), chars.next()),
            (Some('-'), Some(c)) if c.is_ascii_alphabetic() || c == '-'
        )
    }

    /// An unquoted `!`.
    pub fn is_negation(&self) -> bool {
        !self.quoted && self.text == "!"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Between,
    Word,
    Single,
    Double,
    DoubleEscape,
    WordEscape,
}

/// Characters a backslash escapes inside double quotes.
fn escapable_in_double(c: char) -> bool {
    matches!(c, '"' | '\\' | '$' | '`' | '\n')
}

/// Splits `line` into tokens.
pub fn tokenize(line: &str) -> RuleResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut state = State::Between;
    let mut text = String::new();
    let mut quoted = false;

    for c in line.chars() {
        state = match state {
            State::Between | State::Word => match c {
                c if c.is_whitespace() => {
                    if state == State::Word {
                        tokens.push(Token {
                            text: std::mem::take(&mut text),
                            quoted,
                        });
                        quoted = false;
                    }
                    State::Between
                }
                '\'' => {
                    quoted = true;
                    State::Single
                }
                '"' => {
                    quoted = true;
                    State::Double
                }
                '\\' => State::WordEscape,
                c => {
                    text.push(c);
                    State::Word
                }
            },
            State::Single => {
                if c == '\'' {
                    State::Word
                } else {
                    text.push(c);
                    State::Single
                }
            }
            State::Double => match c {
                '"' => State::Word,
                '\\' => State::DoubleEscape,
                c => {
                    text.push(c);
                    State::Double
                }
            },
            State::DoubleEscape => {
                if !escapable_in_double(c) {
                    text.push('\\');
                }
                text.push(c);
                State::Double
            }
            State::WordEscape => {
                text.push(c);
                State::Word
            }
        };
    }

    match state {
        State::Between => {}
        State::Word => tokens.push(Token { text, quoted }),
        State::Single | State::Double | State::DoubleEscape => {
            return Err(RuleError::MalformedQuoting {
                line: line.to_string(),
                reason: "unterminated quote".to_string(),
            })
        }
        State::WordEscape => {
            return Err(RuleError::MalformedQuoting {
                line: line.to_string(),
                reason: "trailing backslash".to_string(),
            })
        }
    }

    Ok(tokens)
}

/// Wraps `value` in single quotes so [`tokenize`] reads it back verbatim.
pub fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quotes `value` only if it would not survive as one bare word.
pub fn quote_if_needed(value: &str) -> String {
    let needs = value.is_empty()
        || value.chars().any(|c| {
            c.is_whitespace()
                || matches!(
                    c,
                    '\'' | '"' | '\\' | '$' | '`' | ';' | '&' | '|' | '<' | '>' | '(' | ')'
                        | '*' | '?' | '#' | '~' | '{' | '}' | '[' | ']'
                )
        })
        || value == "!";
    if needs {
        single_quote(value)
    } else {
        value.to_string()
    }
}
