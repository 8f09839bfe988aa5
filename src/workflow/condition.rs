// =============================================================================
// Edge Conditions — boolean expressions over the cycle state
// =============================================================================
//
// Grammar (precedence low to high):
//
//   expr   :=  and ( "||" and )*
//   and    :=  term ( "&&" term )*
//   term   :=  "(" expr ")"  |  comparison
//   comparison := path op literal
//   op     :=  == | != | >= | <= | > | <
//   path   :=  dotted identifiers into the JSON view of CycleState,
//              e.g. `decision.total_allocation_pct` or
//              `runs.BTC/USDT.quant.passed` — a segment may be any text
//              without '.', whitespace, or an operator character.
//   literal := number | 'string' | "string" | true | false
//
// Evaluation is total: a missing path, a type mismatch, or a parse error
// makes the condition false (never an abort) — a mis-edited edge must not
// kill the cycle. Parse errors are additionally reported to the caller at
// snapshot time via `parse` so the control plane can reject bad edits.
// =============================================================================

use serde_json::Value;

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare {
        path: Vec<String>,
        op: CompareOp,
        literal: Literal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
    Bool(bool),
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Text(String),
    Op(CompareOp),
    AndAnd,
    OrOr,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CompareOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CompareOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Lt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(EngineError::Validation(format!(
                        "unterminated string in condition: {input}"
                    )));
                }
                tokens.push(Token::Text(chars[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().filter(|&&c| c != '_').collect();
                let number = text.parse::<f64>().map_err(|_| {
                    EngineError::Validation(format!("bad number '{text}' in condition"))
                })?;
                tokens.push(Token::Number(number));
            }
            _ => {
                // Identifier / path segment: anything up to whitespace, an
                // operator character, or a parenthesis.
                let start = i;
                while i < chars.len()
                    && !matches!(
                        chars[i],
                        ' ' | '\t' | '\n' | '\r' | '(' | ')' | '&' | '|' | '=' | '!' | '>' | '<'
                    )
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser (recursive descent)
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> EngineResult<Expr> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> EngineResult<Expr> {
        let mut left = self.term()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.term()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> EngineResult<Expr> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.expr()?;
            match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(EngineError::Validation("missing ')' in condition".into())),
            }
        } else {
            self.comparison()
        }
    }

    fn comparison(&mut self) -> EngineResult<Expr> {
        let path = match self.next() {
            Some(Token::Ident(text)) => text.split('.').map(str::to_string).collect(),
            other => {
                return Err(EngineError::Validation(format!(
                    "expected a state path in condition, got {other:?}"
                )))
            }
        };
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(EngineError::Validation(format!(
                    "expected a comparison operator, got {other:?}"
                )))
            }
        };
        let literal = match self.next() {
            Some(Token::Number(n)) => Literal::Number(n),
            Some(Token::Text(s)) => Literal::Text(s),
            Some(Token::Ident(word)) if word == "true" => Literal::Bool(true),
            Some(Token::Ident(word)) if word == "false" => Literal::Bool(false),
            // Bare words compare as strings, so `state == running` reads
            // naturally in the editor.
            Some(Token::Ident(word)) => Literal::Text(word),
            other => {
                return Err(EngineError::Validation(format!(
                    "expected a literal in condition, got {other:?}"
                )))
            }
        };
        Ok(Expr::Compare { path, op, literal })
    }
}

/// Parse a condition expression. Used at workflow-edit time to reject bad
/// expressions, and lazily at evaluation time.
pub fn parse(input: &str) -> EngineResult<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(EngineError::Validation("empty condition".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::Validation(format!(
            "trailing tokens in condition: {input}"
        )));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn lookup<'a>(scope: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = scope;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

fn compare(value: &Value, op: CompareOp, literal: &Literal) -> bool {
    match (value, literal) {
        (Value::Number(n), Literal::Number(rhs)) => {
            let Some(lhs) = n.as_f64() else { return false };
            match op {
                CompareOp::Eq => lhs == *rhs,
                CompareOp::Ne => lhs != *rhs,
                CompareOp::Gt => lhs > *rhs,
                CompareOp::Ge => lhs >= *rhs,
                CompareOp::Lt => lhs < *rhs,
                CompareOp::Le => lhs <= *rhs,
            }
        }
        (Value::String(lhs), Literal::Text(rhs)) => match op {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
        },
        (Value::Bool(lhs), Literal::Bool(rhs)) => match op {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            _ => false,
        },
        _ => false,
    }
}

impl Expr {
    /// Evaluate against the JSON view of the cycle state. Total: missing
    /// paths and type mismatches are simply false.
    pub fn evaluate(&self, scope: &Value) -> bool {
        match self {
            Expr::Or(left, right) => left.evaluate(scope) || right.evaluate(scope),
            Expr::And(left, right) => left.evaluate(scope) && right.evaluate(scope),
            Expr::Compare { path, op, literal } => match lookup(scope, path) {
                Some(value) => compare(value, *op, literal),
                None => false,
            },
        }
    }
}

/// One-shot convenience: parse and evaluate, treating a malformed
/// expression as false.
pub fn evaluate(input: &str, scope: &Value) -> bool {
    match parse(input) {
        Ok(expr) => expr.evaluate(scope),
        Err(_) => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "cycle_id": 7,
            "pause_reason": null,
            "balance": {"total_usd": 9500.5, "available_usd": 8000.0},
            "decision": {"total_allocation_pct": 12.5},
            "runs": {
                "BTC/USDT": {"quant": {"total": 75.0, "passed": true}}
            },
            "mode": "paper"
        })
    }

    #[test]
    fn numeric_comparisons() {
        assert!(evaluate("cycle_id == 7", &scope()));
        assert!(evaluate("balance.total_usd > 9000", &scope()));
        assert!(evaluate("decision.total_allocation_pct <= 12.5", &scope()));
        assert!(!evaluate("cycle_id > 7", &scope()));
    }

    #[test]
    fn string_and_bool_comparisons() {
        assert!(evaluate("mode == 'paper'", &scope()));
        assert!(evaluate("mode != \"live\"", &scope()));
        assert!(evaluate("mode == paper", &scope())); // bare word as string
        assert!(evaluate("runs.BTC/USDT.quant.passed == true", &scope()));
    }

    #[test]
    fn conjunction_and_disjunction() {
        assert!(evaluate("cycle_id == 7 && mode == 'paper'", &scope()));
        assert!(evaluate("cycle_id == 99 || mode == 'paper'", &scope()));
        assert!(!evaluate("cycle_id == 99 && mode == 'paper'", &scope()));
        assert!(evaluate(
            "(cycle_id == 99 || cycle_id == 7) && balance.total_usd > 0",
            &scope()
        ));
    }

    #[test]
    fn missing_path_is_false() {
        assert!(!evaluate("no.such.path == 1", &scope()));
        assert!(!evaluate("pause_reason == 'x'", &scope())); // null never matches
    }

    #[test]
    fn type_mismatch_is_false() {
        assert!(!evaluate("mode > 5", &scope()));
        assert!(!evaluate("cycle_id == 'seven'", &scope()));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("cycle_id ==").is_err());
        assert!(parse("cycle_id == 7 extra").is_err());
        assert!(parse("(cycle_id == 7").is_err());
        assert!(parse("'unterminated").is_err());
    }

    #[test]
    fn malformed_expression_evaluates_false() {
        assert!(!evaluate("&&", &scope()));
    }

    #[test]
    fn negative_numbers() {
        let scope = json!({"pnl": -3.5});
        assert!(evaluate("pnl < 0", &scope));
        assert!(evaluate("pnl == -3.5", &scope));
    }
}
