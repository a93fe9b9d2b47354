//! Boolean filter expressions over tag names.
//!
//! Filters select candidate nodes by their tags. The grammar is small:
//! `or` over `and` over conditions, where a condition is a parenthesised
//! expression or a terminal optionally compared with `==`/`!=`. Terminals
//! are quoted strings, integers, and names; a name evaluates to its binding
//! in the environment, defaulting to false, and a leading `!` negates it.
//!
//! A blank expression accepts everything.

use std::collections::HashMap;
use thiserror::Error;

/// A filter expression could not be parsed.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A character outside the grammar's alphabet.
    #[error("unexpected character '{found}' in filter expression")]
    UnexpectedCharacter {
        /// The rejected character.
        found: char,
    },
    /// A string literal with no closing quote.
    #[error("unterminated string literal in filter expression")]
    UnterminatedString,
    /// The expression ended where a token was required.
    #[error("filter expression ended where {expected} was expected")]
    UnexpectedEnd {
        /// Description of the missing token.
        expected: &'static str,
    },
    /// A token that does not fit the grammar at this position.
    #[error("expected {expected}, found '{found}' in filter expression")]
    UnexpectedToken {
        /// Description of the acceptable tokens.
        expected: &'static str,
        /// The offending token's text.
        found: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Eq,
    Neq,
    LParen,
    RParen,
    Str(String),
    Int(i64),
    Name(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::And => "and".to_owned(),
            Self::Or => "or".to_owned(),
            Self::Eq => "==".to_owned(),
            Self::Neq => "!=".to_owned(),
            Self::LParen => "(".to_owned(),
            Self::RParen => ")".to_owned(),
            Self::Str(s) | Self::Name(s) => s.clone(),
            Self::Int(n) => n.to_string(),
        }
    }
}

/// An evaluated sub-expression.
#[derive(Debug, Clone, PartialEq)]
enum Atom {
    Bool(bool),
    Str(String),
    Int(i64),
}

impl Atom {
    fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Str(s) => !s.is_empty(),
            Self::Int(n) => *n != 0,
        }
    }
}

/// Evaluate `expression` against the boolean bindings in `env`.
///
/// Names absent from `env` are false. A blank expression is true.
///
/// # Errors
///
/// Returns [`FilterError`] when the expression is malformed.
pub fn evaluate(expression: &str, env: &HashMap<String, bool>) -> Result<bool, FilterError> {
    if expression.trim().is_empty() {
        return Ok(true);
    }
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        env,
    };
    let result = parser.expression()?;
    if let Some(extra) = parser.peek() {
        return Err(FilterError::UnexpectedToken {
            expected: "end of expression",
            found: extra.describe(),
        });
    }
    Ok(result.truthy())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '!'
}

fn tokenize(expression: &str) -> Result<Vec<Token>, FilterError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(FilterError::UnexpectedCharacter { found: '=' });
                }
                tokens.push(Token::Eq);
                i += 2;
            }
            // `!=` before the name rule; `!` otherwise opens a negated name.
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Neq);
                i += 2;
            }
            '"' | '\'' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&end) if end == c => {
                            i += 1;
                            break;
                        }
                        Some(&inner) => {
                            text.push(inner);
                            i += 1;
                        }
                        None => return Err(FilterError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(text));
            }
            _ if is_name_char(c) => {
                let mut text = String::new();
                while i < chars.len() && is_name_char(chars[i]) {
                    if chars[i] == '!' && chars.get(i + 1) == Some(&'=') && !text.is_empty() {
                        break;
                    }
                    text.push(chars[i]);
                    i += 1;
                }
                tokens.push(match text.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => text
                        .parse::<i64>()
                        .map_or(Token::Name(text), Token::Int),
                });
            }
            other => return Err(FilterError::UnexpectedCharacter { found: other }),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    env: &'a HashMap<String, bool>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            return true;
        }
        false
    }

    fn expression(&mut self) -> Result<Atom, FilterError> {
        let mut left = self.and_term()?;
        while self.eat(&Token::Or) {
            let right = self.and_term()?;
            left = if left.truthy() { left } else { right };
        }
        Ok(left)
    }

    fn and_term(&mut self) -> Result<Atom, FilterError> {
        let mut left = self.condition()?;
        while self.eat(&Token::And) {
            let right = self.condition()?;
            left = if left.truthy() { right } else { left };
        }
        Ok(left)
    }

    fn condition(&mut self) -> Result<Atom, FilterError> {
        if self.eat(&Token::LParen) {
            let inner = self.expression()?;
            if !self.eat(&Token::RParen) {
                return match self.advance() {
                    Some(token) => Err(FilterError::UnexpectedToken {
                        expected: "')'",
                        found: token.describe(),
                    }),
                    None => Err(FilterError::UnexpectedEnd { expected: "')'" }),
                };
            }
            return Ok(inner);
        }

        let left = self.terminal()?;
        let negated = match self.peek() {
            Some(Token::Eq) => false,
            Some(Token::Neq) => true,
            _ => return Ok(left),
        };
        self.position += 1;
        let right = self.terminal()?;
        Ok(Atom::Bool((left == right) != negated))
    }

    fn terminal(&mut self) -> Result<Atom, FilterError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Atom::Str(s)),
            Some(Token::Int(n)) => Ok(Atom::Int(n)),
            Some(Token::Name(name)) => {
                let (negated, name) = match name.strip_prefix('!') {
                    Some(stripped) => (true, stripped),
                    None => (false, name.as_str()),
                };
                let value = self.env.get(name).copied().unwrap_or(false);
                Ok(Atom::Bool(value != negated))
            }
            Some(token) => Err(FilterError::UnexpectedToken {
                expected: "a name, string, or number",
                found: token.describe(),
            }),
            None => Err(FilterError::UnexpectedEnd {
                expected: "a name, string, or number",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn env(names: &[&str]) -> HashMap<String, bool> {
        names.iter().map(|name| ((*name).to_owned(), true)).collect()
    }

    #[rstest]
    #[case::blank("", true)]
    #[case::whitespace_only("   ", true)]
    #[case::known_name("arch_x86", true)]
    #[case::unknown_name("arch_arm", false)]
    #[case::negated_unknown("!arch_arm", true)]
    #[case::negated_known("!arch_x86", false)]
    #[case::conjunction("arch_x86 and compiled", true)]
    #[case::conjunction_with_unknown("arch_x86 and arch_arm", false)]
    #[case::disjunction("arch_arm or compiled", true)]
    #[case::and_binds_tighter_than_or("arch_arm and ghost or compiled", true)]
    #[case::parens_override("arch_arm and (ghost or compiled)", false)]
    #[case::hyphenated_name("for-runtime", true)]
    fn evaluates_boolean_expressions(#[case] expression: &str, #[case] expected: bool) {
        let env = env(&["arch_x86", "compiled", "for-runtime"]);
        assert_eq!(evaluate(expression, &env).expect("evaluate"), expected);
    }

    #[rstest]
    #[case::equal_strings("\"abc\" == \"abc\"", true)]
    #[case::unequal_strings("\"abc\" == \"def\"", false)]
    #[case::single_quoted("'abc' == \"abc\"", true)]
    #[case::not_equal("1 != 2", true)]
    #[case::equal_ints("3 == 3", true)]
    #[case::names_compare_as_booleans("arch_x86 == compiled", true)]
    fn evaluates_comparisons(#[case] expression: &str, #[case] expected: bool) {
        let env = env(&["arch_x86", "compiled"]);
        assert_eq!(evaluate(expression, &env).expect("evaluate"), expected);
    }

    #[rstest]
    #[case::unclosed_paren("(arch_x86")]
    #[case::dangling_operator("arch_x86 ==")]
    #[case::trailing_paren("arch_x86)")]
    #[case::lone_equals("arch_x86 = compiled")]
    #[case::unterminated_string("\"abc")]
    #[case::stray_character("arch_x86 @ compiled")]
    fn malformed_expressions_are_rejected(#[case] expression: &str) {
        assert!(evaluate(expression, &env(&["arch_x86"])).is_err());
    }

    #[rstest]
    fn comparison_results_feed_connectives() {
        let env = env(&["arch_x86"]);
        assert!(evaluate("arch_x86 and \"a\" == \"a\"", &env).expect("evaluate"));
        assert!(!evaluate("arch_x86 and \"a\" == \"b\"", &env).expect("evaluate"));
    }
}
