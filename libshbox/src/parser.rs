// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The command line parser.
//!
//! Lines use a POSIX-ish argument syntax: whitespace separates words,
//! single and double quotes group, and backslash escapes the next
//! character no matter where it appears. The only metacharacters
//! beyond that are the two chaining operators, `;` and `&&`. There
//! are deliberately no pipes, redirections, globs or subshells.
//!
//! Parsing happens in two passes: a character scan that produces a
//! token stream (words and separators), then program construction
//! that folds separators into the operator tag carried by each
//! statement.

use shbox_protocol::{Error, ErrorCode, ShellCode};

/// How a statement is gated on the outcome of the statement before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOp {
    /// Run unconditionally (first statement, or after `;`).
    Always,
    /// Run only if the previous statement succeeded (after `&&`).
    AndIf,
}

/// One command plus its arguments, tagged with the operator that
/// gates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub op: ChainOp,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Semi,
    AndIf,
}

/// Parse a full line into an ordered program of statements.
pub fn parse(line: &str) -> Result<Vec<Statement>, Error> {
    build_program(tokenize(line)?, line)
}

/// Parse a line that must contain exactly one statement. Chained
/// input is the sandbox's business, not the runner's, so it is
/// rejected here.
pub fn parse_single(line: &str) -> Result<Statement, Error> {
    let mut program = parse(line)?;
    if program.len() > 1 {
        return Err(Error::new(
            ErrorCode::Shell(ShellCode::ChainedCommand),
            "chained commands are not allowed here",
        )
        .with("line", line));
    }
    // build_program never returns an empty program
    Ok(program.remove(0))
}

/// Reassemble a word list into a line that tokenizes back to the
/// same words. Used by the round-trip tests and for echoing history
/// lines faithfully.
pub fn quote(words: &[String]) -> String {
    words.iter().map(|w| quote_word(w)).collect::<Vec<_>>().join(" ")
}

fn quote_word(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '\'' | '"' | '\\' | ';' | '&'));
    if safe {
        return String::from(word);
    }

    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('\'');
    for c in word.chars() {
        // backslash escapes work inside quotes, so these two are the
        // only characters that need escaping
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

fn tokenize(line: &str) -> Result<Vec<Token>, Error> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut current = String::new();
    // an empty quoted string still produces a word, so track
    // "saw an opening quote" separately from "accumulated chars"
    let mut has_word = false;
    let mut open_quote: Option<char> = None;
    let mut escaped = false;

    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if escaped {
            current.push(c);
            has_word = true;
            escaped = false;
            continue;
        }

        if c == '\\' {
            escaped = true;
            continue;
        }

        if let Some(q) = open_quote {
            if c == q {
                open_quote = None;
            } else {
                current.push(c);
            }
            continue;
        }

        match c {
            '\'' | '"' => {
                open_quote = Some(c);
                has_word = true;
            }
            ' ' | '\t' => {
                flush(&mut tokens, &mut current, &mut has_word);
            }
            ';' => {
                flush(&mut tokens, &mut current, &mut has_word);
                tokens.push(Token::Semi);
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                flush(&mut tokens, &mut current, &mut has_word);
                tokens.push(Token::AndIf);
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }

    if open_quote.is_some() {
        return Err(Error::new(
            ErrorCode::Shell(ShellCode::UnclosedQuote),
            "unclosed quote in command line",
        )
        .with("line", line));
    }
    if escaped {
        return Err(Error::new(
            ErrorCode::Shell(ShellCode::DanglingEscape),
            "line ends with a dangling escape",
        )
        .with("line", line));
    }
    flush(&mut tokens, &mut current, &mut has_word);

    Ok(tokens)
}

fn flush(tokens: &mut Vec<Token>, current: &mut String, has_word: &mut bool) {
    if *has_word {
        tokens.push(Token::Word(std::mem::take(current)));
        *has_word = false;
    }
}

fn build_program(tokens: Vec<Token>, line: &str) -> Result<Vec<Statement>, Error> {
    let mut program: Vec<Statement> = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut op = ChainOp::Always;

    for token in tokens.into_iter() {
        match token {
            Token::Word(w) => words.push(w),
            sep => {
                if words.is_empty() {
                    return Err(Error::new(
                        ErrorCode::Shell(ShellCode::InvalidOperatorPosition),
                        "chaining operator with nothing before it",
                    )
                    .with("line", line));
                }
                program.push(make_statement(op, std::mem::take(&mut words)));
                op = match sep {
                    Token::Semi => ChainOp::Always,
                    _ => ChainOp::AndIf,
                };
            }
        }
    }

    if words.is_empty() {
        if program.is_empty() {
            return Err(Error::new(
                ErrorCode::Shell(ShellCode::EmptyCommand),
                "empty command line",
            ));
        }
        return Err(Error::new(
            ErrorCode::Shell(ShellCode::TrailingOperator),
            "command line ends with a chaining operator",
        )
        .with("line", line));
    }
    program.push(make_statement(op, words));

    Ok(program)
}

fn make_statement(op: ChainOp, mut words: Vec<String>) -> Statement {
    let command = words.remove(0);
    Statement { op, command, args: words }
}

//
// Unit Tests
//

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn words(line: &str) -> Vec<String> {
        let program = parse(line).unwrap();
        assert_eq!(program.len(), 1, "expected a single statement for {line:?}");
        let stmt = program.into_iter().next().unwrap();
        let mut ws = vec![stmt.command];
        ws.extend(stmt.args);
        ws
    }

    #[test]
    fn test_tokenize_words() {
        let cases = vec![
            ("echo hello", vec!["echo", "hello"]),
            ("echo  hello\t world", vec!["echo", "hello", "world"]),
            (r#"echo "a b""#, vec!["echo", "a b"]),
            (r#"echo 'a b'"#, vec!["echo", "a b"]),
            (r#"echo "it's""#, vec!["echo", "it's"]),
            (r#"echo 'say "hi"'"#, vec!["echo", r#"say "hi""#]),
            (r#"echo a\ b"#, vec!["echo", "a b"]),
            (r#"echo \;"#, vec!["echo", ";"]),
            (r#"echo ''"#, vec!["echo", ""]),
            (r#"echo """#, vec!["echo", ""]),
            (r#"echo "a"b'c'"#, vec!["echo", "abc"]),
            // the escape glues the quoted part to the bare part, and
            // the quoted semicolon is a word rather than a separator
            (r#"echo "a b"\ c ';' d"#, vec!["echo", "a b c", ";", "d"]),
            ("echo a&b", vec!["echo", "a&b"]),
        ];
        for (line, want) in cases.into_iter() {
            assert_eq!(words(line), want, "tokenizing {line:?}");
        }
    }

    #[test]
    fn test_tokenize_errors() {
        let cases = vec![
            (r#"echo "unterminated"#, ShellCode::UnclosedQuote),
            ("echo 'unterminated", ShellCode::UnclosedQuote),
            ("echo trailing\\", ShellCode::DanglingEscape),
            ("", ShellCode::EmptyCommand),
            ("   \t  ", ShellCode::EmptyCommand),
        ];
        for (line, want) in cases.into_iter() {
            let err = parse(line).unwrap_err();
            assert_eq!(err.code, ErrorCode::Shell(want), "parsing {line:?}");
        }
    }

    #[test]
    fn test_chaining() {
        let program = parse("mkdir /a; cd /a && pwd").unwrap();
        assert_eq!(
            program,
            vec![
                Statement {
                    op: ChainOp::Always,
                    command: String::from("mkdir"),
                    args: vec![String::from("/a")],
                },
                Statement {
                    op: ChainOp::Always,
                    command: String::from("cd"),
                    args: vec![String::from("/a")],
                },
                Statement {
                    op: ChainOp::AndIf,
                    command: String::from("pwd"),
                    args: vec![],
                },
            ]
        );
    }

    #[test]
    fn test_chaining_errors() {
        let cases = vec![
            ("; echo a", ShellCode::InvalidOperatorPosition),
            ("&& echo a", ShellCode::InvalidOperatorPosition),
            ("echo a; ; echo b", ShellCode::InvalidOperatorPosition),
            ("echo a;", ShellCode::TrailingOperator),
            ("echo a &&", ShellCode::TrailingOperator),
        ];
        for (line, want) in cases.into_iter() {
            let err = parse(line).unwrap_err();
            assert_eq!(err.code, ErrorCode::Shell(want), "parsing {line:?}");
        }
    }

    #[test]
    fn test_parse_single() {
        assert_matches!(parse_single("echo hello"), Ok(Statement { .. }));

        let err = parse_single("echo a; echo b").unwrap_err();
        assert_eq!(err.code, ErrorCode::Shell(ShellCode::ChainedCommand));
    }

    #[test]
    fn test_quote_round_trip() {
        let cases = vec![
            vec!["echo", "hello"],
            vec!["echo", "a b", ";", "d"],
            vec!["echo", ""],
            vec!["echo", "it's", r#"say "hi""#],
            vec!["echo", "back\\slash"],
            vec!["echo", "a&&b", "a;b"],
            vec!["echo", "tab\there"],
        ];
        for case in cases.into_iter() {
            let toks: Vec<String> = case.into_iter().map(String::from).collect();
            let line = quote(&toks);
            assert_eq!(words(&line), toks, "re-tokenizing {line:?}");
        }
    }
}
