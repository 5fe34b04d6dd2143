//! Lambda表达式的词法分析器

use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'a> {
    input: &'a str,
    /// 输入字符串中的当前位置（字节索引）
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, position: 0 }
    }

    /// 返回当前位置的字符，不推进位置
    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    /// 返回下一个位置的字符，不推进位置
    fn peek_next(&self) -> Option<char> {
        self.input[self.position..].chars().nth(1)
    }

    /// 推进位置一个字符并返回该字符
    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += c.len_utf8();
        }
        c
    }

    /// 跳过空白字符
    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn token(&self, kind: TokenKind<'a>, start: usize) -> Token<'a> {
        Token {
            kind,
            span: Span::new(start, self.position),
        }
    }

    /// 下一个字符为 `next` 时消费它并产生 `matched`，否则产生 `single`
    fn either(&mut self, next: char, matched: TokenKind<'a>, single: TokenKind<'a>, start: usize) -> Token<'a> {
        if self.peek() == Some(next) {
            self.bump();
            self.token(matched, start)
        } else {
            self.token(single, start)
        }
    }

    /// 读取数字字面量，包含小数点时为浮点数
    fn read_number(&mut self, start: usize) -> Token<'a> {
        self.skip_digits();
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.bump(); // 消费 '.'
            self.skip_digits();
        }

        let literal = &self.input[start..self.position];
        let kind = if is_float {
            literal.parse::<f64>().map(TokenKind::Float)
                .unwrap_or(TokenKind::Illegal)
        } else {
            // 超出i64范围的整数视为非法
            literal.parse::<i64>().map(TokenKind::Number)
                .unwrap_or(TokenKind::Illegal)
        };
        self.token(kind, start)
    }

    fn skip_digits(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else {
                break;
            }
        }
    }

    /// 读取双引号包围的字符串字面量
    /// 注意：开始的引号已经被调用者消费
    fn read_string(&mut self, start: usize) -> Token<'a> {
        let content_start = self.position;
        while let Some(c) = self.peek() {
            if c == '"' {
                break;
            }
            self.bump();
        }
        let content_end = self.position;
        if self.bump().is_none() {
            // 缺少结束引号
            return self.token(TokenKind::Illegal, start);
        }

        let content = &self.input[content_start..content_end];
        self.token(TokenKind::String(content), start)
    }

    /// 读取标识符或关键字
    /// 标识符可以包含字母、数字和下划线
    fn read_identifier(&mut self, start: usize) -> Token<'a> {
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let literal = &self.input[start..self.position];
        self.token(match_keyword(literal), start)
    }
}

fn match_keyword(s: &str) -> TokenKind<'_> {
    match s {
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        _ => TokenKind::Identifier(s),
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_whitespace();
        let start = self.position;

        let c = self.bump()?; // 到达输入末尾

        let token = match c {
            '(' => self.token(TokenKind::LParen, start),
            ')' => self.token(TokenKind::RParen, start),
            '[' => self.token(TokenKind::LBracket, start),
            ']' => self.token(TokenKind::RBracket, start),
            '.' => self.token(TokenKind::Dot, start),
            ',' => self.token(TokenKind::Comma, start),
            '+' => self.token(TokenKind::Plus, start),
            '-' => self.token(TokenKind::Minus, start),
            '*' => self.token(TokenKind::Star, start),
            '/' => self.token(TokenKind::Slash, start),
            '<' => self.either('=', TokenKind::Lte, TokenKind::Lt, start),
            '>' => self.either('=', TokenKind::Gte, TokenKind::Gt, start),
            '!' => self.either('=', TokenKind::NotEq, TokenKind::Bang, start),
            '=' => match self.peek() {
                Some('=') => {
                    self.bump();
                    self.token(TokenKind::Eq, start)
                }
                Some('>') => {
                    self.bump();
                    self.token(TokenKind::Arrow, start)
                }
                _ => self.token(TokenKind::Illegal, start),
            },
            '&' => self.either('&', TokenKind::AndAlso, TokenKind::Illegal, start),
            '|' => self.either('|', TokenKind::OrElse, TokenKind::Illegal, start),
            '"' => self.read_string(start),
            c if c.is_ascii_digit() => self.read_number(start),
            c if c.is_alphabetic() || c == '_' => self.read_identifier(start),
            _ => self.token(TokenKind::Illegal, start),
        };
        Some(token)
    }
}
