//! Recursive-descent parser for the filter language.
//!
//! ```text
//! query     := ( "select" ( "*" | field ("," field)* ) [ "where" expr ] | expr ) [ order ]
//! order     := "order" "by" field [ "asc" | "desc" ] ( "," field [ "asc" | "desc" ] )*
//! expr      := and_expr [ ("or" | "||") expr ]
//! and_expr  := unary [ ("and" | "&&") and_expr ]
//! unary     := "not" unary | "(" expr ")" | predicate
//! predicate := prop op literal
//!            | prop "contains" string
//!            | prop "within" number "of" number "," number
//! literal   := number | string | "true" | "false"
//! ```
//!
//! `and` and `or` chains associate to the right. Keywords are matched
//! case-insensitively. `order`, `by`, `asc` and `desc` are only keywords in
//! the ordering clause and remain usable as property names.

use crate::query::ast::{CompareOp, Operand, Predicate, QueryAst, Selection};
use crate::query::errors::ParseError;
use crate::query::lexer::{tokenize, Spanned, Token};
use crate::query::slice::RangeValue;
use crate::query::sort::SortPredicate;

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "contains", "within", "of", "select", "where", "eq", "lt", "lte", "gt",
    "gte", "true", "false",
];

/// Parses a full query, with or without a `select` prefix.
pub fn parse(text: &str) -> Result<QueryAst, ParseError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: text.len(),
    };
    let ast = parser.query()?;
    parser.expect_end()?;
    Ok(ast)
}

/// Parses a bare filter expression.
pub fn parse_filter(text: &str) -> Result<Operand, ParseError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: text.len(),
    };
    let expr = parser.expr()?;
    parser.expect_end()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        self.peek().map_or(false, |t| t.is_keyword(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &'static str) -> ParseError {
        match self.tokens.get(self.pos) {
            Some(spanned) => ParseError::UnexpectedToken {
                offset: spanned.offset,
                found: spanned.token.to_string(),
                expected,
            },
            None => ParseError::UnexpectedEnd {
                offset: self.end,
                expected,
            },
        }
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), ParseError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_keyword(&mut self, kw: &str, expected: &'static str) -> Result<(), ParseError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        if self.pos < self.tokens.len() {
            Err(self.unexpected("end of input"))
        } else {
            Ok(())
        }
    }

    fn query(&mut self) -> Result<QueryAst, ParseError> {
        if !self.eat_keyword("select") {
            let filter = self.expr()?;
            let order_by = self.order_by()?;
            return Ok(QueryAst {
                select: Selection::All,
                filter: Some(filter),
                order_by,
            });
        }
        let select = if self.peek() == Some(&Token::Star) {
            self.pos += 1;
            Selection::All
        } else {
            let mut fields = vec![self.field()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                fields.push(self.field()?);
            }
            Selection::Fields(fields)
        };
        let filter = if self.eat_keyword("where") {
            Some(self.expr()?)
        } else {
            None
        };
        let order_by = self.order_by()?;
        Ok(QueryAst {
            select,
            filter,
            order_by,
        })
    }

    fn order_by(&mut self) -> Result<Vec<SortPredicate>, ParseError> {
        if !self.eat_keyword("order") {
            return Ok(Vec::new());
        }
        self.expect_keyword("by", "'by'")?;
        let mut terms = vec![self.sort_term()?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            terms.push(self.sort_term()?);
        }
        Ok(terms)
    }

    fn sort_term(&mut self) -> Result<SortPredicate, ParseError> {
        let property = self.field()?;
        if self.eat_keyword("desc") {
            return Ok(SortPredicate::desc(property));
        }
        self.eat_keyword("asc");
        Ok(SortPredicate::asc(property))
    }

    fn field(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token::Ident(name)) if !is_keyword(name) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("field name")),
        }
    }

    fn expr(&mut self) -> Result<Operand, ParseError> {
        let left = self.and_expr()?;
        if self.peek() == Some(&Token::OrOr) || self.at_keyword("or") {
            self.pos += 1;
            let right = self.expr()?;
            return Ok(Operand::or(left, right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Operand, ParseError> {
        let left = self.unary()?;
        if self.peek() == Some(&Token::AndAnd) || self.at_keyword("and") {
            self.pos += 1;
            let right = self.and_expr()?;
            return Ok(Operand::and(left, right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Operand, ParseError> {
        if self.eat_keyword("not") {
            return Ok(Operand::not(self.unary()?));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(Token::RParen, "')'")?;
            return Ok(inner);
        }
        self.predicate().map(Operand::Predicate)
    }

    fn predicate(&mut self) -> Result<Predicate, ParseError> {
        let property = match self.peek() {
            Some(Token::Ident(name)) if !is_keyword(name) => name.clone(),
            _ => return Err(self.unexpected("property name")),
        };
        self.pos += 1;

        if self.eat_keyword("contains") {
            let text = match self.peek() {
                Some(Token::Str(text)) => text.clone(),
                _ => return Err(self.unexpected("quoted string")),
            };
            self.pos += 1;
            return Ok(Predicate::Contains { property, text });
        }
        if self.eat_keyword("within") {
            let distance = self.number("distance")?;
            self.expect_keyword("of", "'of'")?;
            let lat = self.number("latitude")?;
            self.expect(Token::Comma, "','")?;
            let lon = self.number("longitude")?;
            return Ok(Predicate::Within {
                property,
                distance,
                lat,
                lon,
            });
        }

        let op = self.compare_op()?;
        let value = self.literal()?;
        Ok(Predicate::Compare {
            property,
            op,
            value,
        })
    }

    fn compare_op(&mut self) -> Result<CompareOp, ParseError> {
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Lte) => CompareOp::Lte,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Gte) => CompareOp::Gte,
            Some(t) if t.is_keyword("eq") => CompareOp::Eq,
            Some(t) if t.is_keyword("lt") => CompareOp::Lt,
            Some(t) if t.is_keyword("lte") => CompareOp::Lte,
            Some(t) if t.is_keyword("gt") => CompareOp::Gt,
            Some(t) if t.is_keyword("gte") => CompareOp::Gte,
            _ => return Err(self.unexpected("comparison operator")),
        };
        self.pos += 1;
        Ok(op)
    }

    fn literal(&mut self) -> Result<RangeValue, ParseError> {
        let value = match self.peek() {
            Some(Token::Int(v)) => RangeValue::Int(*v),
            Some(Token::Float(v)) => RangeValue::Float(*v),
            Some(Token::Str(s)) => RangeValue::Str(s.clone()),
            Some(t) if t.is_keyword("true") => RangeValue::Bool(true),
            Some(t) if t.is_keyword("false") => RangeValue::Bool(false),
            _ => return Err(self.unexpected("literal")),
        };
        self.pos += 1;
        Ok(value)
    }

    fn number(&mut self, expected: &'static str) -> Result<f64, ParseError> {
        let value = match self.peek() {
            Some(Token::Int(v)) => *v as f64,
            Some(Token::Float(v)) => *v,
            _ => return Err(self.unexpected(expected)),
        };
        self.pos += 1;
        Ok(value)
    }
}

fn is_keyword(name: &str) -> bool {
    KEYWORDS.iter().any(|kw| name.eq_ignore_ascii_case(kw))
}
