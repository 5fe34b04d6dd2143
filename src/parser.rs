//! Lambda表达式的语法分析器
//!
//! ## 解析流程图
//!
//! ```text
//! parse_lambda()
//!   ├─ 解析参数名 (Identifier)
//!   ├─ 期望 '=>'
//!   └─ parse_expression() (递归下降解析)
//!        └─ parse_or_expression()            ||
//!             └─ parse_and_expression()       &&
//!                  └─ parse_equality()        == !=
//!                       └─ parse_relational() < <= > >=
//!                            └─ parse_additive()       + -
//!                                 └─ parse_multiplicative()  * /
//!                                      └─ parse_unary()       ! -
//!                                           └─ parse_postfix()
//!                                                ├─ parse_primary()
//!                                                │    ├─ 字面值 / 列表 / 分组
//!                                                │    ├─ 参数名 → Parameter
//!                                                │    ├─ 函数名( → 静态调用
//!                                                │    └─ 其他标识符 → 从绑定中取值
//!                                                └─ ('.' 成员 ('(' 参数 ')')?)*
//! ```
//!
//! ## 语法优先级（从高到低）
//!
//! 1. **成员访问与调用** `x.Name`, `x.Name.StartsWith("A")`
//! 2. **一元运算** `!expr`, `-expr`
//! 3. **乘除** `*`, `/`
//! 4. **加减** `+`, `-`
//! 5. **关系比较** `<`, `<=`, `>`, `>=`
//! 6. **相等比较** `==`, `!=`
//! 7. **逻辑与** `&&`
//! 8. **逻辑或** `||`
//!
//! ## 字面值类型
//! - **字符串**: `"quoted string"`
//! - **数字**: `123`, `-456`, `2.5`
//! - **布尔**: `true`, `false`
//! - **空值**: `null`
//! - **列表**: `[1, 2, 3]`
//!
//! ## 解析示例
//!
//! ```text
//! x => x.Age > 18 && x.Name.StartsWith("A")
//! u => !(u.Status == 0) || [1, 2, 3].Contains(u.Id)
//! u => u.Score >= limit * 2        // limit 来自绑定
//! ```

use crate::error::ParseError;
use crate::expr::{BinaryOp, Bindings, Expr, Lambda};
use crate::token::{Token, TokenKind};
use crate::value::Value;

pub struct Parser<'a> {
    tokens: &'a [Token<'a>],
    position: usize,
    bindings: &'a Bindings,
    parameter: Option<&'a str>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token<'a>], bindings: &'a Bindings) -> Self {
        Self {
            tokens,
            position: 0,
            bindings,
            parameter: None,
        }
    }

    /// 返回当前 token，不推进位置
    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position)
    }

    /// 返回当前 token 并推进位置
    fn advance(&mut self) -> Option<&'a Token<'a>> {
        let token = self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }

    /// 期望特定类型的 token 并推进，否则返回错误
    fn expect(&mut self, expected: TokenKind) -> Result<&'a Token<'a>, ParseError> {
        match self.peek() {
            Some(token)
                if std::mem::discriminant(&token.kind) == std::mem::discriminant(&expected) =>
            {
                self.position += 1;
                Ok(token)
            }
            Some(token) => Err(ParseError::at_position(
                format!("Expected {:?}, found {:?}", expected, token.kind),
                token.span,
            )),
            None => Err(ParseError::new(
                format!("Expected {:?}, but reached end of input", expected),
                None,
            )),
        }
    }

    /// 检查当前 token 是否匹配给定类型
    fn match_token(&self, kind: &TokenKind) -> bool {
        self.peek()
            .is_some_and(|token| std::mem::discriminant(&token.kind) == std::mem::discriminant(kind))
    }

    /// 当前 token 匹配时消费它
    fn consume(&mut self, kind: &TokenKind) -> bool {
        let matched = self.match_token(kind);
        if matched {
            self.position += 1;
        }
        matched
    }

    /// 解析完整的 lambda：`参数 => 表达式`
    pub fn parse_lambda(&mut self) -> Result<Lambda, ParseError> {
        let parameter_token = self.expect(TokenKind::Identifier(""))?;
        let TokenKind::Identifier(parameter) = parameter_token.kind else {
            return Err(ParseError::at_position(
                "Expected lambda parameter".to_string(),
                parameter_token.span,
            ));
        };
        self.parameter = Some(parameter);
        self.expect(TokenKind::Arrow)?;

        let body = self.parse_expression()?;
        if let Some(token) = self.peek() {
            return Err(ParseError::at_position(
                format!("Unexpected token: {:?}", token.kind),
                token.span,
            ));
        }
        Ok(Lambda::new(parameter, body))
    }

    /// 解析表达式的入口点
    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_or_expression()
    }

    /// 解析OR表达式 (最低优先级)
    ///
    /// 语法: `and_expr (|| and_expr)*`
    fn parse_or_expression(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and_expression()?;
        while self.consume(&TokenKind::OrElse) {
            let right = self.parse_and_expression()?;
            left = Expr::binary(BinaryOp::OrElse, left, right);
        }
        Ok(left)
    }

    /// 解析AND表达式
    ///
    /// 语法: `equality (&& equality)*`
    fn parse_and_expression(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.consume(&TokenKind::AndAlso) {
            let right = self.parse_equality()?;
            left = Expr::binary(BinaryOp::AndAlso, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek().map(|token| &token.kind) {
                Some(TokenKind::Eq) => BinaryOp::Equal,
                Some(TokenKind::NotEq) => BinaryOp::NotEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_relational()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek().map(|token| &token.kind) {
                Some(TokenKind::Lt) => BinaryOp::LessThan,
                Some(TokenKind::Lte) => BinaryOp::LessThanOrEqual,
                Some(TokenKind::Gt) => BinaryOp::GreaterThan,
                Some(TokenKind::Gte) => BinaryOp::GreaterThanOrEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().map(|token| &token.kind) {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Subtract,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|token| &token.kind) {
                Some(TokenKind::Star) => BinaryOp::Multiply,
                Some(TokenKind::Slash) => BinaryOp::Divide,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    /// 解析一元运算：`!expr` 与 `-expr`
    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.consume(&TokenKind::Bang) {
            return Ok(!self.parse_unary()?);
        }
        if self.consume(&TokenKind::Minus) {
            // 负数字面量直接折叠为常量
            return Ok(match self.parse_unary()? {
                Expr::Constant(Value::Int(n)) => match n.checked_neg() {
                    Some(n) => Expr::Constant(Value::Int(n)),
                    None => Expr::Negate(Box::new(Expr::Constant(Value::Int(n)))),
                },
                Expr::Constant(Value::Float(f)) => Expr::Constant(Value::Float(-f)),
                other => Expr::Negate(Box::new(other)),
            });
        }
        self.parse_postfix()
    }

    /// 解析成员访问与方法调用链
    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        while self.consume(&TokenKind::Dot) {
            let name = self.parse_identifier()?;
            if self.consume(&TokenKind::LParen) {
                let args = self.parse_arguments(TokenKind::RParen)?;
                expr = expr.call(name, args);
            } else {
                expr = expr.member(name);
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.advance() else {
            return Err(ParseError::new(
                "Expected expression, but reached end of input".to_string(),
                None,
            ));
        };

        match &token.kind {
            TokenKind::Number(n) => Ok(Expr::constant(*n)),
            TokenKind::Float(f) => Ok(Expr::constant(*f)),
            TokenKind::String(s) => Ok(Expr::constant(*s)),
            TokenKind::True => Ok(Expr::constant(true)),
            TokenKind::False => Ok(Expr::constant(false)),
            TokenKind::Null => Ok(Expr::Constant(Value::Null)),
            TokenKind::LParen => {
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                let items = self.parse_arguments(TokenKind::RBracket)?;
                Ok(Expr::list(items))
            }
            TokenKind::Identifier(name) => {
                if self.parameter == Some(*name) {
                    return Ok(Expr::param(*name));
                }
                if self.consume(&TokenKind::LParen) {
                    let args = self.parse_arguments(TokenKind::RParen)?;
                    return Ok(Expr::static_call(*name, args));
                }
                // 其他标识符视为捕获变量
                match self.bindings.get(*name) {
                    Some(value) => Ok(Expr::Constant(value.clone())),
                    None => Err(ParseError::at_position(
                        format!("Unbound identifier '{}'", name),
                        token.span,
                    )),
                }
            }
            TokenKind::Illegal => Err(ParseError::at_position(
                "Illegal character".to_string(),
                token.span,
            )),
            other => Err(ParseError::at_position(
                format!("Unexpected token: {:?}", other),
                token.span,
            )),
        }
    }

    fn parse_identifier(&mut self) -> Result<&'a str, ParseError> {
        let token = self.expect(TokenKind::Identifier(""))?;
        match token.kind {
            TokenKind::Identifier(name) => Ok(name),
            _ => Err(ParseError::at_position(
                "Expected identifier".to_string(),
                token.span,
            )),
        }
    }

    /// 解析以逗号分隔的表达式列表，直到 `close`
    /// 注意：开始的括号已经被调用者消费
    fn parse_arguments(&mut self, close: TokenKind) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        if self.consume(&close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_expression()?);
            if !self.consume(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(close)?;
        Ok(items)
    }
}
