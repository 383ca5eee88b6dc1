//! Hand-written lexer over preprocessed C source.
//!
//! The lexer is a lazy single pass with a shallow push-back stack, which is
//! all the recursive-descent parser needs. It can also swap the active
//! source buffer while preserving a position stack — the hook a macro
//! expander uses to splice substituted text — though the core pipeline
//! feeds it one preprocessed buffer.

use crate::diag::Pos;

/// Token kinds. Literal-carrying variants hold the decoded value; the
/// spelling is recoverable through the token's span.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    /// Identifier (not a keyword).
    Ident(String),
    /// Integer literal with its suffix information.
    IntLit {
        /// Decoded value.
        value: i64,
        /// `l`/`L` suffix (or a value that does not fit `int`).
        long: bool,
        /// `u`/`U` suffix.
        unsigned: bool,
    },
    /// Floating literal; `single` is set by an `f` suffix.
    FloLit {
        /// Decoded value.
        value: f64,
        /// `f`/`F` suffix.
        single: bool,
    },
    /// String literal, decoded, without the terminating NUL.
    StrLit(Vec<u8>),
    /// Character literal, decoded.
    CharLit(i64),

    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `;`
    Semicolon,
    /// `:`
    Colon,
    /// `,`
    Comma,
    /// `.`
    Dot,
    /// `->`
    Arrow,
    /// `...`
    Ellipsis,
    /// `?`
    Question,
    /// `=`
    Assign,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `&`
    Amp,
    /// `|`
    Pipe,
    /// `^`
    Caret,
    /// `~`
    Tilde,
    /// `!`
    Bang,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `++`
    PlusPlus,
    /// `--`
    MinusMinus,
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `<=`
    LtEq,
    /// `>=`
    GtEq,
    /// `<<`
    LShift,
    /// `>>`
    RShift,
    /// `&&`
    AmpAmp,
    /// `||`
    PipePipe,
    /// `+=`
    PlusAssign,
    /// `-=`
    MinusAssign,
    /// `*=`
    StarAssign,
    /// `/=`
    SlashAssign,
    /// `%=`
    PercentAssign,
    /// `&=`
    AmpAssign,
    /// `|=`
    PipeAssign,
    /// `^=`
    CaretAssign,
    /// `<<=`
    LShiftAssign,
    /// `>>=`
    RShiftAssign,

    /// `void`
    KwVoid,
    /// `char`
    KwChar,
    /// `short`
    KwShort,
    /// `int`
    KwInt,
    /// `long`
    KwLong,
    /// `unsigned`
    KwUnsigned,
    /// `signed`
    KwSigned,
    /// `float`
    KwFloat,
    /// `double`
    KwDouble,
    /// `struct`
    KwStruct,
    /// `union`
    KwUnion,
    /// `enum`
    KwEnum,
    /// `typedef`
    KwTypedef,
    /// `static`
    KwStatic,
    /// `extern`
    KwExtern,
    /// `const`
    KwConst,
    /// `volatile`
    KwVolatile,
    /// `if`
    KwIf,
    /// `else`
    KwElse,
    /// `while`
    KwWhile,
    /// `do`
    KwDo,
    /// `for`
    KwFor,
    /// `switch`
    KwSwitch,
    /// `case`
    KwCase,
    /// `default`
    KwDefault,
    /// `break`
    KwBreak,
    /// `continue`
    KwContinue,
    /// `return`
    KwReturn,
    /// `goto`
    KwGoto,
    /// `sizeof`
    KwSizeof,

    /// End of input.
    Eof,
}

/// One token: kind, position, and the `[begin, end)` byte span in the
/// buffer it was scanned from.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    /// What it is, plus decoded payload.
    pub kind: TokenKind,
    /// Start of the token in the source.
    pub pos: Pos,
    /// Byte span `[begin, end)` in the active buffer.
    pub span: (u32, u32),
}

/// A lexical error with its location; the parser turns these into
/// diagnostics.
#[derive(Debug)]
pub struct LexError {
    /// Where the bad text starts.
    pub pos: Pos,
    /// Description.
    pub message: String,
}

struct SourceState {
    text: Vec<u8>,
    idx: usize,
    line: u32,
    col: u32,
}

/// The lexer.
pub struct Lexer {
    src: SourceState,
    stack: Vec<SourceState>,
    pushed_back: Vec<Token>,
    no_flonum: bool,
}

impl Lexer {
    /// Create a lexer over `text`. With `no_flonum`, floating literals are
    /// rejected.
    pub fn new(text: &str, no_flonum: bool) -> Self {
        Self {
            src: SourceState { text: text.as_bytes().to_vec(), idx: 0, line: 1, col: 1 },
            stack: Vec::new(),
            pushed_back: Vec::new(),
            no_flonum,
        }
    }

    /// Swap in a new active buffer, saving the current position for
    /// [`Lexer::pop_source`].
    pub fn push_source(&mut self, text: &str) {
        let fresh = SourceState { text: text.as_bytes().to_vec(), idx: 0, line: 1, col: 1 };
        self.stack.push(std::mem::replace(&mut self.src, fresh));
    }

    /// Return to the buffer saved by the matching [`Lexer::push_source`].
    /// Returns `false` when the stack is empty.
    pub fn pop_source(&mut self) -> bool {
        match self.stack.pop() {
            Some(prev) => {
                self.src = prev;
                true
            }
            None => false,
        }
    }

    /// Push a token back; tokens return in LIFO order. The parser needs at
    /// most two slots (declarator lookahead).
    pub fn unget(&mut self, token: Token) {
        debug_assert!(self.pushed_back.len() < 2, "push-back deeper than two tokens");
        self.pushed_back.push(token);
    }

    /// Current position (for diagnostics about the upcoming token).
    pub fn pos(&self) -> Pos {
        Pos::new(self.src.line, self.src.col)
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.text.get(self.src.idx).cloned()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.text.get(self.src.idx + ahead).cloned()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.src.idx += 1;
        if b == b'\n' {
            self.src.line += 1;
            self.src.col = 1;
        } else {
            self.src.col += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_byte() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some(b'*') if self.peek_byte() == Some(b'/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Scan the next token.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        if let Some(tok) = self.pushed_back.pop() {
            return Ok(tok);
        }
        self.skip_trivia();
        let pos = self.pos();
        let begin = self.src.idx as u32;

        let b = match self.peek_byte() {
            None => {
                return Ok(Token { kind: TokenKind::Eof, pos, span: (begin, begin) });
            }
            Some(b) => b,
        };

        let kind = if b.is_ascii_alphabetic() || b == b'_' {
            self.ident_or_keyword()
        } else if b.is_ascii_digit() {
            self.number(pos)?
        } else if b == b'"' {
            self.string(pos)?
        } else if b == b'\'' {
            self.character(pos)?
        } else {
            self.punct(pos)?
        };

        Ok(Token { kind, pos, span: (begin, self.src.idx as u32) })
    }

    fn ident_or_keyword(&mut self) -> TokenKind {
        let mut name = String::new();
        while let Some(b) = self.peek_byte() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                name.push(b as char);
                self.bump();
            } else {
                break;
            }
        }
        match name.as_str() {
            "void" => TokenKind::KwVoid,
            "char" => TokenKind::KwChar,
            "short" => TokenKind::KwShort,
            "int" => TokenKind::KwInt,
            "long" => TokenKind::KwLong,
            "unsigned" => TokenKind::KwUnsigned,
            "signed" => TokenKind::KwSigned,
            "float" => TokenKind::KwFloat,
            "double" => TokenKind::KwDouble,
            "struct" => TokenKind::KwStruct,
            "union" => TokenKind::KwUnion,
            "enum" => TokenKind::KwEnum,
            "typedef" => TokenKind::KwTypedef,
            "static" => TokenKind::KwStatic,
            "extern" => TokenKind::KwExtern,
            "const" => TokenKind::KwConst,
            "volatile" => TokenKind::KwVolatile,
            "if" => TokenKind::KwIf,
            "else" => TokenKind::KwElse,
            "while" => TokenKind::KwWhile,
            "do" => TokenKind::KwDo,
            "for" => TokenKind::KwFor,
            "switch" => TokenKind::KwSwitch,
            "case" => TokenKind::KwCase,
            "default" => TokenKind::KwDefault,
            "break" => TokenKind::KwBreak,
            "continue" => TokenKind::KwContinue,
            "return" => TokenKind::KwReturn,
            "goto" => TokenKind::KwGoto,
            "sizeof" => TokenKind::KwSizeof,
            _ => TokenKind::Ident(name),
        }
    }

    fn number(&mut self, pos: Pos) -> Result<TokenKind, LexError> {
        let start = self.src.idx;
        let mut radix = 10u32;
        if self.peek_byte() == Some(b'0') {
            match self.peek_at(1) {
                Some(b'x') | Some(b'X') => {
                    radix = 16;
                    self.bump();
                    self.bump();
                }
                Some(b) if b.is_ascii_digit() => {
                    radix = 8;
                    self.bump();
                }
                _ => {}
            }
        }
        let digits_start = self.src.idx;
        while let Some(b) = self.peek_byte() {
            if (b as char).is_digit(radix) {
                self.bump();
            } else {
                break;
            }
        }

        // Floating literal?
        let is_float = radix == 10
            && match self.peek_byte() {
                Some(b'.') => self.peek_at(1) != Some(b'.'),
                Some(b'e') | Some(b'E') => true,
                _ => false,
            };
        if is_float {
            if self.peek_byte() == Some(b'.') {
                self.bump();
                while self.peek_byte().map_or(false, |b| b.is_ascii_digit()) {
                    self.bump();
                }
            }
            if matches!(self.peek_byte(), Some(b'e') | Some(b'E')) {
                self.bump();
                if matches!(self.peek_byte(), Some(b'+') | Some(b'-')) {
                    self.bump();
                }
                while self.peek_byte().map_or(false, |b| b.is_ascii_digit()) {
                    self.bump();
                }
            }
            let single = matches!(self.peek_byte(), Some(b'f') | Some(b'F'));
            let text = std::str::from_utf8(&self.src.text[start..self.src.idx])
                .unwrap()
                .to_string();
            if single {
                self.bump();
            }
            if self.no_flonum {
                return Err(LexError {
                    pos,
                    message: "floating-point literals are disabled".to_string(),
                });
            }
            let value: f64 = text
                .parse()
                .map_err(|_| LexError { pos, message: format!("malformed number `{}`", text) })?;
            return Ok(TokenKind::FloLit { value, single });
        }

        if self.src.idx == digits_start && radix == 16 {
            return Err(LexError { pos, message: "malformed hexadecimal literal".to_string() });
        }
        let text = std::str::from_utf8(&self.src.text[digits_start..self.src.idx]).unwrap();
        let digits = if text.is_empty() { "0" } else { text };
        let value = u64::from_str_radix(digits, radix)
            .map_err(|_| LexError { pos, message: format!("malformed number `{}`", digits) })?;

        let mut long = false;
        let mut unsigned = false;
        loop {
            match self.peek_byte() {
                Some(b'l') | Some(b'L') => {
                    long = true;
                    self.bump();
                }
                Some(b'u') | Some(b'U') => {
                    unsigned = true;
                    self.bump();
                }
                _ => break,
            }
        }
        if value > i64::from(i32::max_value()) as u64 {
            long = true;
        }
        Ok(TokenKind::IntLit { value: value as i64, long, unsigned })
    }

    fn escape(&mut self, pos: Pos) -> Result<u8, LexError> {
        let b = self
            .bump()
            .ok_or_else(|| LexError { pos, message: "unterminated escape".to_string() })?;
        Ok(match b {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            b'a' => 7,
            b'b' => 8,
            b'f' => 12,
            b'v' => 11,
            b'x' => {
                let mut v = 0u32;
                let mut seen = false;
                while let Some(h) = self.peek_byte() {
                    match (h as char).to_digit(16) {
                        Some(d) => {
                            v = v * 16 + d;
                            seen = true;
                            self.bump();
                        }
                        None => break,
                    }
                }
                if !seen {
                    return Err(LexError { pos, message: "invalid \\x escape".to_string() });
                }
                v as u8
            }
            b'\\' | b'\'' | b'"' | b'?' => b,
            other => {
                return Err(LexError {
                    pos,
                    message: format!("invalid escape `\\{}`", other as char),
                });
            }
        })
    }

    fn string(&mut self, pos: Pos) -> Result<TokenKind, LexError> {
        self.bump(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => {
                    return Err(LexError { pos, message: "unterminated string".to_string() });
                }
                Some(b'"') => break,
                Some(b'\\') => bytes.push(self.escape(pos)?),
                Some(b) => bytes.push(b),
            }
        }
        Ok(TokenKind::StrLit(bytes))
    }

    fn character(&mut self, pos: Pos) -> Result<TokenKind, LexError> {
        self.bump(); // opening quote
        let value = match self.bump() {
            None | Some(b'\n') => {
                return Err(LexError { pos, message: "unterminated character".to_string() });
            }
            Some(b'\\') => i64::from(self.escape(pos)?),
            Some(b) => i64::from(b),
        };
        if self.bump() != Some(b'\'') {
            return Err(LexError { pos, message: "unterminated character".to_string() });
        }
        Ok(TokenKind::CharLit(value))
    }

    fn punct(&mut self, pos: Pos) -> Result<TokenKind, LexError> {
        use TokenKind::*;
        let b = self.bump().unwrap();
        let two = self.peek_byte();
        let kind = match (b, two) {
            (b'-', Some(b'>')) => {
                self.bump();
                Arrow
            }
            (b'+', Some(b'+')) => {
                self.bump();
                PlusPlus
            }
            (b'-', Some(b'-')) => {
                self.bump();
                MinusMinus
            }
            (b'=', Some(b'=')) => {
                self.bump();
                EqEq
            }
            (b'!', Some(b'=')) => {
                self.bump();
                NotEq
            }
            (b'<', Some(b'=')) => {
                self.bump();
                LtEq
            }
            (b'>', Some(b'=')) => {
                self.bump();
                GtEq
            }
            (b'&', Some(b'&')) => {
                self.bump();
                AmpAmp
            }
            (b'|', Some(b'|')) => {
                self.bump();
                PipePipe
            }
            (b'+', Some(b'=')) => {
                self.bump();
                PlusAssign
            }
            (b'-', Some(b'=')) => {
                self.bump();
                MinusAssign
            }
            (b'*', Some(b'=')) => {
                self.bump();
                StarAssign
            }
            (b'/', Some(b'=')) => {
                self.bump();
                SlashAssign
            }
            (b'%', Some(b'=')) => {
                self.bump();
                PercentAssign
            }
            (b'&', Some(b'=')) => {
                self.bump();
                AmpAssign
            }
            (b'|', Some(b'=')) => {
                self.bump();
                PipeAssign
            }
            (b'^', Some(b'=')) => {
                self.bump();
                CaretAssign
            }
            (b'<', Some(b'<')) => {
                self.bump();
                if self.peek_byte() == Some(b'=') {
                    self.bump();
                    LShiftAssign
                } else {
                    LShift
                }
            }
            (b'>', Some(b'>')) => {
                self.bump();
                if self.peek_byte() == Some(b'=') {
                    self.bump();
                    RShiftAssign
                } else {
                    RShift
                }
            }
            (b'.', Some(b'.')) if self.peek_at(1) == Some(b'.') => {
                self.bump();
                self.bump();
                Ellipsis
            }
            (b'(', _) => LParen,
            (b')', _) => RParen,
            (b'{', _) => LBrace,
            (b'}', _) => RBrace,
            (b'[', _) => LBracket,
            (b']', _) => RBracket,
            (b';', _) => Semicolon,
            (b':', _) => Colon,
            (b',', _) => Comma,
            (b'.', _) => Dot,
            (b'?', _) => Question,
            (b'=', _) => Assign,
            (b'+', _) => Plus,
            (b'-', _) => Minus,
            (b'*', _) => Star,
            (b'/', _) => Slash,
            (b'%', _) => Percent,
            (b'&', _) => Amp,
            (b'|', _) => Pipe,
            (b'^', _) => Caret,
            (b'~', _) => Tilde,
            (b'!', _) => Bang,
            (b'<', _) => Lt,
            (b'>', _) => Gt,
            (other, _) => {
                return Err(LexError {
                    pos,
                    message: format!("stray `{}` in program", other as char),
                });
            }
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lx = Lexer::new(src, false);
        let mut out = Vec::new();
        loop {
            let t = lx.next_token().unwrap();
            let end = t.kind == TokenKind::Eof;
            out.push(t.kind);
            if end {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_operators_longest_first() {
        use TokenKind::*;
        assert_eq!(
            kinds("a >>= b >> c > d"),
            vec![
                Ident("a".into()),
                RShiftAssign,
                Ident("b".into()),
                RShift,
                Ident("c".into()),
                Gt,
                Ident("d".into()),
                Eof
            ]
        );
    }

    #[test]
    fn number_bases_and_suffixes() {
        assert_eq!(
            kinds("0x10 010 42u 7L"),
            vec![
                TokenKind::IntLit { value: 16, long: false, unsigned: false },
                TokenKind::IntLit { value: 8, long: false, unsigned: false },
                TokenKind::IntLit { value: 42, long: false, unsigned: true },
                TokenKind::IntLit { value: 7, long: true, unsigned: false },
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn wide_literal_is_implicitly_long() {
        match &kinds("4294967296")[0] {
            TokenKind::IntLit { value, long, .. } => {
                assert_eq!(*value, 4294967296);
                assert!(long);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn string_and_char_escapes() {
        assert_eq!(
            kinds(r#""a\nb" '\t' '\x41'"#),
            vec![
                TokenKind::StrLit(vec![b'a', b'\n', b'b']),
                TokenKind::CharLit(9),
                TokenKind::CharLit(0x41),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn dot_vs_ellipsis() {
        use TokenKind::*;
        assert_eq!(kinds(". ... ."), vec![Dot, Ellipsis, Dot, Eof]);
    }

    #[test]
    fn comments_are_trivia() {
        assert_eq!(
            kinds("1 // line\n/* block\n*/ 2"),
            vec![
                TokenKind::IntLit { value: 1, long: false, unsigned: false },
                TokenKind::IntLit { value: 2, long: false, unsigned: false },
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn pushback_round_trip() {
        let mut lx = Lexer::new("x y", false);
        let x = lx.next_token().unwrap();
        lx.unget(x.clone());
        assert_eq!(lx.next_token().unwrap(), x);
        assert_eq!(lx.next_token().unwrap().kind, TokenKind::Ident("y".into()));
    }

    #[test]
    fn source_stack_swaps_and_restores() {
        let mut lx = Lexer::new("tail", false);
        lx.push_source("1 2");
        assert_eq!(
            lx.next_token().unwrap().kind,
            TokenKind::IntLit { value: 1, long: false, unsigned: false }
        );
        assert_eq!(
            lx.next_token().unwrap().kind,
            TokenKind::IntLit { value: 2, long: false, unsigned: false }
        );
        assert_eq!(lx.next_token().unwrap().kind, TokenKind::Eof);
        assert!(lx.pop_source());
        assert_eq!(lx.next_token().unwrap().kind, TokenKind::Ident("tail".into()));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut lx = Lexer::new("\"abc", false);
        assert!(lx.next_token().is_err());
    }

    #[test]
    fn no_flonum_rejects_float_literals() {
        let mut lx = Lexer::new("1.5", true);
        assert!(lx.next_token().is_err());
    }
}
