//! Tokenizer over a SPARQL source string. Exposed as its own type rather
//! than inlined into the parser, since the
//! "no heap allocation per token" invariant is a property of
//! tokenization specifically: every `Token` is an offset/length pair into
//! the caller's source, never an owned `String`.
//!
//! Grounded on `lib/spargebra`'s tokenization needs (keyword/punctuation
//! set) as a checklist, not its implementation — spargebra tokenizes as a
//! side effect of a `peg` grammar; this is a hand-rolled scanner.

use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Iri,          // <...>
    PrefixedName, // prefix:local
    Variable,     // ?x or $x
    BlankNode,    // _:label
    String,       // "..." or '...' (incl. long forms, unescaped span)
    Number,
    Keyword,  // case-insensitive SPARQL keyword, matched against text
    Punct,    // single/double-char punctuation: { } ( ) . ; , | / ^ * + ? = != < <= > >= && || ! [ ]
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub len: usize,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.start + self.len]
    }
}

pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    column: usize,
}

const PUNCT_DOUBLE: &[&str] = &["!=", "<=", ">=", "&&", "||", "^^", "<<", ">>"];

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_byte() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(b'#') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, self.column, message)
    }

    /// Scans and returns the next token, or `Eof` at end of input.
    pub fn next_token(&mut self) -> Result<Token, ParseError> {
        self.skip_trivia();
        let start = self.pos;
        let line = self.line;
        let column = self.column;
        let Some(b) = self.peek_byte() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                start,
                len: 0,
                line,
                column,
            });
        };

        let kind = match b {
            b'<' if !matches!(self.bytes.get(self.pos + 1), Some(b'=') | Some(b'<')) => {
                self.scan_iri()?;
                TokenKind::Iri
            }
            b'?' | b'$' => {
                self.advance();
                self.scan_name_tail();
                TokenKind::Variable
            }
            b'_' if self.bytes.get(self.pos + 1) == Some(&b':') => {
                self.advance();
                self.advance();
                self.scan_name_tail();
                TokenKind::BlankNode
            }
            b'"' | b'\'' => {
                self.scan_string(b)?;
                TokenKind::String
            }
            b'0'..=b'9' => {
                self.scan_number();
                TokenKind::Number
            }
            b'-' | b'+' if matches!(self.bytes.get(self.pos + 1), Some(b'0'..=b'9')) => {
                self.advance();
                self.scan_number();
                TokenKind::Number
            }
            b if is_name_start(b) => {
                self.scan_name_tail();
                // prefix:local if immediately followed by ':'
                if self.peek_byte() == Some(b':') {
                    self.advance();
                    self.scan_name_tail();
                    TokenKind::PrefixedName
                } else {
                    TokenKind::Keyword
                }
            }
            _ => {
                self.scan_punct()?;
                TokenKind::Punct
            }
        };

        Ok(Token {
            kind,
            start,
            len: self.pos - start,
            line,
            column,
        })
    }

    fn scan_iri(&mut self) -> Result<(), ParseError> {
        self.advance(); // '<'
        while let Some(b) = self.peek_byte() {
            if b == b'>' {
                self.advance();
                return Ok(());
            }
            self.advance();
        }
        Err(self.error("unterminated IRI"))
    }

    fn scan_name_tail(&mut self) {
        while let Some(b) = self.peek_byte() {
            if is_name_char(b) {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn scan_string(&mut self, quote: u8) -> Result<(), ParseError> {
        self.advance();
        let long = self.peek_byte() == Some(quote) && self.bytes.get(self.pos + 1) == Some(&quote);
        if long {
            self.advance();
            self.advance();
        }
        loop {
            match self.peek_byte() {
                None => return Err(self.error("unterminated string literal")),
                Some(b'\\') => {
                    self.advance();
                    self.advance();
                }
                Some(b) if b == quote => {
                    self.advance();
                    if !long {
                        return Ok(());
                    }
                    if self.peek_byte() == Some(quote) && self.bytes.get(self.pos + 1) == Some(&quote)
                    {
                        self.advance();
                        self.advance();
                        return Ok(());
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn scan_number(&mut self) {
        while let Some(b) = self.peek_byte() {
            if b.is_ascii_digit() || b == b'.' || b == b'e' || b == b'E' || b == b'+' || b == b'-' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn scan_punct(&mut self) -> Result<(), ParseError> {
        let two: String = self.bytes[self.pos..]
            .iter()
            .take(2)
            .map(|&b| b as char)
            .collect();
        if PUNCT_DOUBLE.contains(&two.as_str()) {
            self.advance();
            self.advance();
            return Ok(());
        }
        self.advance();
        Ok(())
    }
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_name_char(b: u8) -> bool {
    is_name_start(b) || b.is_ascii_digit() || b == b'-' || b == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(source: &str) -> Vec<(TokenKind, &str)> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token().unwrap();
            if token.kind == TokenKind::Eof {
                break;
            }
            out.push((token.kind, token.text(source)));
        }
        out
    }

    #[test]
    fn tokenizes_select_query_shape() {
        let tokens = tokenize("SELECT ?s WHERE { ?s ?p ?o }");
        assert_eq!(tokens[0], (TokenKind::Keyword, "SELECT"));
        assert_eq!(tokens[1], (TokenKind::Variable, "?s"));
        assert_eq!(tokens[2], (TokenKind::Keyword, "WHERE"));
    }

    #[test]
    fn tokenizes_iri_and_prefixed_name() {
        let tokens = tokenize("<http://example.com/a> foaf:name");
        assert_eq!(tokens[0], (TokenKind::Iri, "<http://example.com/a>"));
        assert_eq!(tokens[1], (TokenKind::PrefixedName, "foaf:name"));
    }

    #[test]
    fn tokenizes_string_and_number_literals() {
        let tokens = tokenize(r#""hello" 42 3.14"#);
        assert_eq!(tokens[0], (TokenKind::String, "\"hello\""));
        assert_eq!(tokens[1], (TokenKind::Number, "42"));
        assert_eq!(tokens[2], (TokenKind::Number, "3.14"));
    }

    #[test]
    fn skips_comments() {
        let tokens = tokenize("?s # a comment\n?p");
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn unterminated_string_is_a_parse_error() {
        let mut lexer = Lexer::new("\"unterminated");
        assert!(lexer.next_token().is_err());
    }

    #[test]
    fn double_char_punct_is_one_token() {
        let tokens = tokenize("?a != ?b");
        assert_eq!(tokens[1], (TokenKind::Punct, "!="));
    }

    #[test]
    fn quoted_triple_delimiters_are_not_confused_with_iris() {
        let tokens = tokenize("<< <a> <b> <c> >>");
        assert_eq!(tokens[0], (TokenKind::Punct, "<<"));
        assert_eq!(tokens[1], (TokenKind::Iri, "<a>"));
        assert_eq!(tokens.last().unwrap(), &(TokenKind::Punct, ">>"));
    }
}
