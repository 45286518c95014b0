// File: src/lexer.rs
//
// Tokenizer for Ember source text. Produces a flat token stream with
// 1-based line/column positions for diagnostics and the chunk line table.
// Source is treated as a byte sequence; UTF-8 identifiers pass through.

use crate::errors::{EmberError, SourceLocation};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Number(f64),
    String(String),
    Operator(String),
    Punctuation(char),
    Keyword(String),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn location(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }
}

const KEYWORDS: &[&str] = &[
    "nil", "true", "false", "if", "else", "while", "for", "function", "return", "try", "catch",
    "finally", "throw", "import", "break", "continue", "and", "or", "not",
];

pub fn tokenize(source: &str) -> Result<Vec<Token>, EmberError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;
    let mut col = 1usize;

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
                col += 1;
            }
            '\n' => {
                chars.next();
                line += 1;
                col = 1;
            }
            '#' => {
                // Shell-style line comment (also swallows shebang lines)
                while let Some(&ch) = chars.peek() {
                    chars.next();
                    if ch == '\n' {
                        line += 1;
                        col = 1;
                        break;
                    }
                }
            }
            '"' => {
                let start_line = line;
                let start_col = col;
                chars.next();
                col += 1;
                let mut s = String::new();
                let mut terminated = false;
                while let Some(&ch) = chars.peek() {
                    chars.next();
                    col += 1;
                    if ch == '"' {
                        terminated = true;
                        break;
                    }
                    if ch == '\n' {
                        line += 1;
                        col = 1;
                        s.push('\n');
                        continue;
                    }
                    if ch == '\\' {
                        let esc = match chars.peek() {
                            Some(&e) => e,
                            None => break,
                        };
                        chars.next();
                        col += 1;
                        match esc {
                            'n' => s.push('\n'),
                            't' => s.push('\t'),
                            'r' => s.push('\r'),
                            '0' => s.push('\0'),
                            '\\' => s.push('\\'),
                            '"' => s.push('"'),
                            'x' => {
                                let mut hex = String::new();
                                for _ in 0..2 {
                                    if let Some(&h) = chars.peek() {
                                        if h.is_ascii_hexdigit() {
                                            hex.push(h);
                                            chars.next();
                                            col += 1;
                                        }
                                    }
                                }
                                if hex.len() == 2 {
                                    let byte = u8::from_str_radix(&hex, 16).unwrap_or(0);
                                    s.push(byte as char);
                                } else {
                                    return Err(EmberError::syntax(
                                        "Invalid \\x escape: expected two hex digits",
                                        SourceLocation::new(line, col),
                                    ));
                                }
                            }
                            other => s.push(other),
                        }
                    } else {
                        s.push(ch);
                    }
                }
                if !terminated {
                    return Err(EmberError::syntax(
                        "Unterminated string literal",
                        SourceLocation::new(start_line, start_col),
                    ));
                }
                tokens.push(Token {
                    kind: TokenKind::String(s),
                    line: start_line,
                    column: start_col,
                });
            }
            '0'..='9' => {
                let start_col = col;
                let mut num = String::new();
                let mut seen_dot = false;
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() {
                        num.push(ch);
                        chars.next();
                        col += 1;
                    } else if ch == '.' && !seen_dot {
                        // A dot only continues the number if a digit follows;
                        // otherwise it is member access on a literal.
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        match lookahead.peek() {
                            Some(d) if d.is_ascii_digit() => {
                                seen_dot = true;
                                num.push(ch);
                                chars.next();
                                col += 1;
                            }
                            _ => break,
                        }
                    } else {
                        break;
                    }
                }
                let parsed: f64 = num.parse().map_err(|_| {
                    EmberError::syntax(
                        format!("Invalid number literal '{}'", num),
                        SourceLocation::new(line, start_col),
                    )
                })?;
                tokens.push(Token { kind: TokenKind::Number(parsed), line, column: start_col });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start_col = col;
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }

                let kind = if KEYWORDS.contains(&ident.as_str()) {
                    TokenKind::Keyword(ident)
                } else {
                    TokenKind::Identifier(ident)
                };

                tokens.push(Token { kind, line, column: start_col });
            }
            '/' => {
                let start_col = col;
                chars.next();
                col += 1;
                match chars.peek() {
                    Some('/') => {
                        while let Some(&ch) = chars.peek() {
                            chars.next();
                            if ch == '\n' {
                                line += 1;
                                col = 1;
                                break;
                            }
                        }
                    }
                    Some('*') => {
                        chars.next();
                        col += 1;
                        let mut closed = false;
                        while let Some(&ch) = chars.peek() {
                            chars.next();
                            if ch == '\n' {
                                line += 1;
                                col = 1;
                            } else {
                                col += 1;
                            }
                            if ch == '*' {
                                if let Some('/') = chars.peek() {
                                    chars.next();
                                    col += 1;
                                    closed = true;
                                    break;
                                }
                            }
                        }
                        if !closed {
                            return Err(EmberError::syntax(
                                "Unterminated block comment",
                                SourceLocation::new(line, col),
                            ));
                        }
                    }
                    _ => {
                        tokens.push(Token {
                            kind: TokenKind::Operator("/".to_string()),
                            line,
                            column: start_col,
                        });
                    }
                }
            }
            '=' | '!' | '<' | '>' => {
                let start_col = col;
                chars.next();
                col += 1;
                let op = if chars.peek() == Some(&'=') {
                    chars.next();
                    col += 1;
                    format!("{}=", c)
                } else {
                    c.to_string()
                };
                tokens.push(Token { kind: TokenKind::Operator(op), line, column: start_col });
            }
            '&' | '|' => {
                let start_col = col;
                chars.next();
                col += 1;
                if chars.peek() == Some(&c) {
                    chars.next();
                    col += 1;
                    let op = if c == '&' { "&&" } else { "||" };
                    tokens.push(Token {
                        kind: TokenKind::Operator(op.to_string()),
                        line,
                        column: start_col,
                    });
                } else {
                    return Err(EmberError::syntax(
                        format!("Unexpected character '{}'", c),
                        SourceLocation::new(line, start_col),
                    ));
                }
            }
            '+' | '-' | '*' | '%' => {
                tokens.push(Token {
                    kind: TokenKind::Operator(c.to_string()),
                    line,
                    column: col,
                });
                chars.next();
                col += 1;
            }
            '(' | ')' | '{' | '}' | '[' | ']' | ',' | ':' | ';' | '.' => {
                tokens.push(Token { kind: TokenKind::Punctuation(c), line, column: col });
                chars.next();
                col += 1;
            }
            other => {
                return Err(EmberError::syntax(
                    format!("Unexpected character '{}'", other),
                    SourceLocation::new(line, col),
                ));
            }
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, line, column: col });
    Ok(tokens)
}
