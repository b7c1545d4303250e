//! Filter lexer for error-tolerant tokenization
//!
//! Used to remap field names inside WHERE clauses and by the in-memory
//! endpoint to evaluate filters. The lexer never panics and never rejects
//! input: unknown characters become `Unknown` tokens.
//!
//! Spans are character offsets into the input, so callers can rebuild the
//! original text around the tokens they rewrite.

use std::ops::Range;

/// Token type enumeration (case-insensitive for keywords)
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Select,
    From,
    Where,
    OrderBy,
    Limit,
    Offset,
    And,
    Or,
    Not,
    In,
    Like,
    Includes,
    Excludes,
    Null,
    True,
    False,
    Asc,
    Desc,
    Nulls,
    First,
    Last,

    // Identifiers and Literals
    /// Field path, possibly dotted (`Account.Name`)
    Ident(String),
    Number(String),
    String(String),
    /// Date or datetime literal (`2024-01-31`, `2024-01-31T10:00:00Z`)
    DateTime(String),
    /// Relative date literal (`TODAY`, `LAST_N_DAYS`)
    DateLiteral(String),

    // Operators and Symbols
    Star,
    Comma,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    LParen,
    RParen,
    Colon,
    Minus,

    // Special tokens
    EOF,
    Unknown(char),
}

impl TokenKind {
    /// Whether this token is a value literal
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            TokenKind::Number(_)
                | TokenKind::String(_)
                | TokenKind::DateTime(_)
                | TokenKind::DateLiteral(_)
                | TokenKind::Null
                | TokenKind::True
                | TokenKind::False
        )
    }
}

/// Token with position information
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Range<usize>,
}

impl Token {
    /// Create a new token
    pub fn new(kind: TokenKind, span: Range<usize>) -> Self {
        Self { kind, span }
    }
}

const DATE_LITERALS: &[&str] = &[
    "YESTERDAY",
    "TODAY",
    "TOMORROW",
    "LAST_WEEK",
    "THIS_WEEK",
    "NEXT_WEEK",
    "LAST_MONTH",
    "THIS_MONTH",
    "NEXT_MONTH",
    "LAST_90_DAYS",
    "NEXT_90_DAYS",
    "THIS_QUARTER",
    "LAST_QUARTER",
    "NEXT_QUARTER",
    "THIS_YEAR",
    "LAST_YEAR",
    "NEXT_YEAR",
    "THIS_FISCAL_QUARTER",
    "LAST_FISCAL_QUARTER",
    "NEXT_FISCAL_QUARTER",
    "THIS_FISCAL_YEAR",
    "LAST_FISCAL_YEAR",
    "NEXT_FISCAL_YEAR",
];

fn is_date_literal(upper: &str) -> bool {
    DATE_LITERALS.contains(&upper)
        || upper.starts_with("LAST_N_")
        || upper.starts_with("NEXT_N_")
        || (upper.starts_with("N_") && upper.ends_with("_AGO"))
}

/// Filter lexer - error-tolerant tokenizer
pub struct FilterLexer {
    input: Vec<char>,
    pos: usize,
}

impl FilterLexer {
    /// Create a new lexer from input string
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(input: &str) -> Vec<Token> {
        let mut lexer = Self::new(input);
        let mut tokens = Vec::new();

        loop {
            let token = lexer.next_token();
            let is_eof = matches!(token.kind, TokenKind::EOF);
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        tokens
    }

    /// Get the next token
    fn next_token(&mut self) -> Token {
        self.skip_whitespace();

        let start = self.pos;

        if self.is_at_end() {
            return Token::new(TokenKind::EOF, start..start);
        }

        let ch = self.current_char();

        match ch {
            '*' => self.single(TokenKind::Star, start),
            ',' => self.single(TokenKind::Comma, start),
            '(' => self.single(TokenKind::LParen, start),
            ')' => self.single(TokenKind::RParen, start),
            ':' => self.single(TokenKind::Colon, start),
            '-' => self.single(TokenKind::Minus, start),
            '=' => self.single(TokenKind::Eq, start),
            '!' => {
                self.advance();
                if self.current_char() == '=' {
                    self.advance();
                    Token::new(TokenKind::Ne, start..self.pos)
                } else {
                    Token::new(TokenKind::Unknown('!'), start..self.pos)
                }
            }
            '>' => {
                self.advance();
                if self.current_char() == '=' {
                    self.advance();
                    Token::new(TokenKind::Ge, start..self.pos)
                } else {
                    Token::new(TokenKind::Gt, start..self.pos)
                }
            }
            '<' => {
                self.advance();
                if self.current_char() == '=' {
                    self.advance();
                    Token::new(TokenKind::Le, start..self.pos)
                } else if self.current_char() == '>' {
                    self.advance();
                    Token::new(TokenKind::Ne, start..self.pos)
                } else {
                    Token::new(TokenKind::Lt, start..self.pos)
                }
            }

            '\'' | '"' => self.scan_string(ch, start),

            '0'..='9' => self.scan_number(start),

            'a'..='z' | 'A'..='Z' | '_' => self.scan_identifier(start),

            _ => {
                self.advance();
                Token::new(TokenKind::Unknown(ch), start..self.pos)
            }
        }
    }

    fn single(&mut self, kind: TokenKind, start: usize) -> Token {
        self.advance();
        Token::new(kind, start..self.pos)
    }

    /// Scan a string literal
    fn scan_string(&mut self, quote: char, start: usize) -> Token {
        self.advance(); // Skip opening quote

        let mut value = String::new();

        while !self.is_at_end() && self.current_char() != quote {
            let ch = self.current_char();
            if ch == '\\' && self.pos + 1 < self.input.len() {
                self.advance();
                match self.current_char() {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '\\' => value.push('\\'),
                    '\'' => value.push('\''),
                    '"' => value.push('"'),
                    ch => {
                        value.push('\\');
                        value.push(ch);
                    }
                }
            } else {
                value.push(ch);
            }
            self.advance();
        }

        // Skip closing quote if present
        if self.current_char() == quote {
            self.advance();
        }

        Token::new(TokenKind::String(value), start..self.pos)
    }

    /// Scan a number, or a date/datetime literal starting with digits
    fn scan_number(&mut self, start: usize) -> Token {
        let mut value = String::new();

        while !self.is_at_end() && self.current_char().is_ascii_digit() {
            value.push(self.current_char());
            self.advance();
        }

        // 2024-01-31 or 2024-01-31T10:00:00.000+0000
        if value.len() == 4 && self.current_char() == '-' && self.peek_char().is_ascii_digit() {
            while !self.is_at_end() {
                let ch = self.current_char();
                if ch.is_ascii_alphanumeric() || matches!(ch, '-' | ':' | '.' | '+') {
                    value.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
            return Token::new(TokenKind::DateTime(value), start..self.pos);
        }

        if self.current_char() == '.' && self.peek_char().is_ascii_digit() {
            value.push('.');
            self.advance();
            while !self.is_at_end() && self.current_char().is_ascii_digit() {
                value.push(self.current_char());
                self.advance();
            }
        }

        Token::new(TokenKind::Number(value), start..self.pos)
    }

    /// Scan an identifier (including dotted paths) or keyword
    fn scan_identifier(&mut self, start: usize) -> Token {
        let mut value = String::new();

        while !self.is_at_end() {
            let ch = self.current_char();
            let next = self.peek_char();
            if ch.is_alphanumeric() || ch == '_' {
                value.push(ch);
                self.advance();
            } else if ch == '.' && (next.is_alphabetic() || next == '_') {
                value.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let upper = value.to_uppercase();
        let kind = match upper.as_str() {
            "SELECT" => TokenKind::Select,
            "FROM" => TokenKind::From,
            "WHERE" => TokenKind::Where,
            "ORDER" => {
                let saved_pos = self.pos;
                self.skip_whitespace();
                if self.peek_word().eq_ignore_ascii_case("BY") {
                    self.skip_word();
                    TokenKind::OrderBy
                } else {
                    self.pos = saved_pos;
                    TokenKind::Ident(value)
                }
            }
            "LIMIT" => TokenKind::Limit,
            "OFFSET" => TokenKind::Offset,
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            "NOT" => TokenKind::Not,
            "IN" => TokenKind::In,
            "LIKE" => TokenKind::Like,
            "INCLUDES" => TokenKind::Includes,
            "EXCLUDES" => TokenKind::Excludes,
            "NULL" => TokenKind::Null,
            "TRUE" => TokenKind::True,
            "FALSE" => TokenKind::False,
            "ASC" => TokenKind::Asc,
            "DESC" => TokenKind::Desc,
            "NULLS" => TokenKind::Nulls,
            "FIRST" => TokenKind::First,
            "LAST" => TokenKind::Last,
            _ if is_date_literal(&upper) => TokenKind::DateLiteral(upper),
            _ => TokenKind::Ident(value),
        };

        Token::new(kind, start..self.pos)
    }

    /// Skip whitespace characters
    fn skip_whitespace(&mut self) {
        while !self.is_at_end() && self.current_char().is_whitespace() {
            self.advance();
        }
    }

    /// Peek the next word without consuming it
    fn peek_word(&self) -> String {
        self.input[self.pos..]
            .iter()
            .take_while(|ch| ch.is_alphanumeric() || **ch == '_')
            .collect()
    }

    /// Skip the next word
    fn skip_word(&mut self) {
        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Get current character
    fn current_char(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.input[self.pos]
        }
    }

    /// Peek at next character
    fn peek_char(&self) -> char {
        if self.pos + 1 >= self.input.len() {
            '\0'
        } else {
            self.input[self.pos + 1]
        }
    }

    /// Advance position
    fn advance(&mut self) {
        if !self.is_at_end() {
            self.pos += 1;
        }
    }

    /// Check if at end of input
    fn is_at_end(&self) -> bool {
        self.pos >= self.input.len()
    }
}

/// Rewrite every field identifier in `input` with `rewrite`, leaving keywords,
/// literals and the original spacing untouched.
pub fn rewrite_identifiers<F>(input: &str, mut rewrite: F) -> String
where
    F: FnMut(&str) -> String,
{
    let chars: Vec<char> = input.chars().collect();
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;

    for token in FilterLexer::tokenize(input) {
        if let TokenKind::Ident(name) = &token.kind {
            output.extend(&chars[cursor..token.span.start]);
            output.push_str(&rewrite(name));
            cursor = token.span.end;
        }
    }
    output.extend(&chars[cursor..]);

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_simple_filter() {
        let tokens = FilterLexer::tokenize("Name = 'Acme' AND Type__c != null");
        assert!(matches!(tokens[0].kind, TokenKind::Ident(ref s) if s == "Name"));
        assert!(matches!(tokens[1].kind, TokenKind::Eq));
        assert!(matches!(tokens[2].kind, TokenKind::String(ref s) if s == "Acme"));
        assert!(matches!(tokens[3].kind, TokenKind::And));
        assert!(matches!(tokens[4].kind, TokenKind::Ident(ref s) if s == "Type__c"));
        assert!(matches!(tokens[5].kind, TokenKind::Ne));
        assert!(matches!(tokens[6].kind, TokenKind::Null));
        assert!(matches!(tokens[7].kind, TokenKind::EOF));
    }

    #[test]
    fn test_tokenize_dotted_identifier() {
        let tokens = FilterLexer::tokenize("Account.Owner.Name LIKE 'A%'");
        assert!(matches!(tokens[0].kind, TokenKind::Ident(ref s) if s == "Account.Owner.Name"));
        assert!(matches!(tokens[1].kind, TokenKind::Like));
    }

    #[test]
    fn test_tokenize_datetime_and_date_literals() {
        let tokens =
            FilterLexer::tokenize("CreatedDate > 2024-01-31T10:00:00Z OR LastModifiedDate = LAST_N_DAYS:30");
        assert!(matches!(tokens[2].kind, TokenKind::DateTime(ref s) if s == "2024-01-31T10:00:00Z"));
        assert!(matches!(tokens[6].kind, TokenKind::DateLiteral(ref s) if s == "LAST_N_DAYS"));
        assert!(matches!(tokens[7].kind, TokenKind::Colon));
        assert!(matches!(tokens[8].kind, TokenKind::Number(ref s) if s == "30"));
    }

    #[test]
    fn test_tokenize_escaped_quote() {
        let tokens = FilterLexer::tokenize(r"Name = 'O\'Brien'");
        assert!(matches!(tokens[2].kind, TokenKind::String(ref s) if s == "O'Brien"));
    }

    #[test]
    fn test_rewrite_skips_literals() {
        let rewritten = rewrite_identifiers("Name = 'Name' AND (Code IN ('a','b'))", |f| {
            format!("{f}__c")
        });
        assert_eq!(rewritten, "Name__c = 'Name' AND (Code__c IN ('a','b'))");
    }

    #[test]
    fn test_tokenize_empty_input() {
        let tokens = FilterLexer::tokenize("");
        assert_eq!(tokens.len(), 1);
        assert!(matches!(tokens[0].kind, TokenKind::EOF));
    }
}
