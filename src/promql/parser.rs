// ============================================================================
// PROMQL PARSER
// ============================================================================
// Precedence-climbing parser over the lexer's token stream. It checks syntax
// and selector validity only; no type checking beyond what is needed to
// reject ranges on non-selectors.
// ============================================================================

use std::time::Duration;


use super::ast::{
    AtModifier, BinaryOp, Expr, Grouping, LabelMatcher, MatchOp, UnaryOp, VectorMatching, VectorSelector,
};
use super::lexer::{tokenize, Token, TokenKind};
use crate::constants::METRIC_NAME_LABEL;
use crate::error::ParseError;

/// Aggregation operators; the second group takes a leading parameter.
const AGGREGATIONS: &[&str] = &["sum", "avg", "count", "min", "max", "group", "stddev", "stdvar"];
const PARAM_AGGREGATIONS: &[&str] = &["topk", "bottomk", "quantile", "count_values", "limitk", "limit_ratio"];

/// Known functions with their (min, max) argument counts.
const FUNCTIONS: &[(&str, usize, usize)] = &[
    ("abs", 1, 1),
    ("absent", 1, 1),
    ("absent_over_time", 1, 1),
    ("acos", 1, 1),
    ("acosh", 1, 1),
    ("asin", 1, 1),
    ("asinh", 1, 1),
    ("atan", 1, 1),
    ("atanh", 1, 1),
    ("avg_over_time", 1, 1),
    ("ceil", 1, 1),
    ("changes", 1, 1),
    ("clamp", 3, 3),
    ("clamp_max", 2, 2),
    ("clamp_min", 2, 2),
    ("cos", 1, 1),
    ("cosh", 1, 1),
    ("count_over_time", 1, 1),
    ("day_of_month", 0, 1),
    ("day_of_week", 0, 1),
    ("day_of_year", 0, 1),
    ("days_in_month", 0, 1),
    ("deg", 1, 1),
    ("delta", 1, 1),
    ("deriv", 1, 1),
    ("double_exponential_smoothing", 3, 3),
    ("exp", 1, 1),
    ("floor", 1, 1),
    ("histogram_avg", 1, 1),
    ("histogram_count", 1, 1),
    ("histogram_fraction", 3, 3),
    ("histogram_quantile", 2, 2),
    ("histogram_stddev", 1, 1),
    ("histogram_stdvar", 1, 1),
    ("histogram_sum", 1, 1),
    ("holt_winters", 3, 3),
    ("hour", 0, 1),
    ("idelta", 1, 1),
    ("increase", 1, 1),
    ("irate", 1, 1),
    ("label_join", 3, usize::MAX),
    ("label_replace", 5, 5),
    ("last_over_time", 1, 1),
    ("ln", 1, 1),
    ("log10", 1, 1),
    ("log2", 1, 1),
    ("mad_over_time", 1, 1),
    ("max_over_time", 1, 1),
    ("min_over_time", 1, 1),
    ("minute", 0, 1),
    ("month", 0, 1),
    ("pi", 0, 0),
    ("predict_linear", 2, 2),
    ("present_over_time", 1, 1),
    ("quantile_over_time", 2, 2),
    ("rad", 1, 1),
    ("rate", 1, 1),
    ("resets", 1, 1),
    ("round", 1, 2),
    ("scalar", 1, 1),
    ("sgn", 1, 1),
    ("sin", 1, 1),
    ("sinh", 1, 1),
    ("sort", 1, 1),
    ("sort_by_label", 1, usize::MAX),
    ("sort_by_label_desc", 1, usize::MAX),
    ("sort_desc", 1, 1),
    ("sqrt", 1, 1),
    ("stddev_over_time", 1, 1),
    ("stdvar_over_time", 1, 1),
    ("sum_over_time", 1, 1),
    ("tan", 1, 1),
    ("tanh", 1, 1),
    ("time", 0, 0),
    ("timestamp", 1, 1),
    ("vector", 1, 1),
    ("year", 0, 1),
];

/// Identifiers that can never start an operand.
const RESERVED: &[&str] = &["and", "or", "unless", "atan2", "offset", "bool"];

/// Parse one expression. Trailing input is an error.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, idx: 0 };
    if parser.peek() == &TokenKind::Eof {
        return Err(ParseError::new(0, "no expression found in input"));
    }
    let expr = parser.parse_binary(0)?;
    match parser.peek() {
        TokenKind::Eof => Ok(expr),
        other => Err(parser.error(format!("unexpected {}", other.describe()))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser {
    // ---- Token cursor ----

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.idx.min(self.tokens.len() - 1)].kind
    }

    fn peek_nth(&self, n: usize) -> &TokenKind {
        &self.tokens[(self.idx + n).min(self.tokens.len() - 1)].kind
    }

    fn pos(&self) -> usize {
        self.tokens[self.idx.min(self.tokens.len() - 1)].pos
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if kind != TokenKind::Eof {
            self.idx += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.pos(), message)
    }

    fn expect(&mut self, want: TokenKind, context: &str) -> Result<(), ParseError> {
        if self.peek() == &want {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("unexpected {} {context}", self.peek().describe())))
        }
    }

    /// Lowercased identifier at the cursor, for keyword checks.
    fn keyword(&self) -> Option<String> {
        match self.peek() {
            TokenKind::Ident(s) => Some(s.to_ascii_lowercase()),
            _ => None,
        }
    }

    fn expect_duration(&mut self, context: &str) -> Result<Duration, ParseError> {
        match self.peek().clone() {
            TokenKind::Duration(d) => {
                self.advance();
                Ok(d)
            }
            other => Err(self.error(format!("unexpected {} {context}, expected duration", other.describe()))),
        }
    }

    // ---- Binary expressions ----

    fn binary_op(&self) -> Option<BinaryOp> {
        let op = match self.peek() {
            TokenKind::Add => BinaryOp::Add,
            TokenKind::Sub => BinaryOp::Sub,
            TokenKind::Mul => BinaryOp::Mul,
            TokenKind::Div => BinaryOp::Div,
            TokenKind::Mod => BinaryOp::Mod,
            TokenKind::Pow => BinaryOp::Pow,
            TokenKind::Eql => BinaryOp::Eql,
            TokenKind::Neq => BinaryOp::Neq,
            TokenKind::Lss => BinaryOp::Lss,
            TokenKind::Lte => BinaryOp::Lte,
            TokenKind::Gtr => BinaryOp::Gtr,
            TokenKind::Gte => BinaryOp::Gte,
            TokenKind::Ident(_) => match self.keyword().as_deref() {
                Some("and") => BinaryOp::And,
                Some("or") => BinaryOp::Or,
                Some("unless") => BinaryOp::Unless,
                Some("atan2") => BinaryOp::Atan2,
                _ => return None,
            },
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.binary_op() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let matching = self.parse_matching(op)?;
            let next_min = if op.is_right_associative() { prec } else { prec + 1 };
            let rhs = self.parse_binary(next_min)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                matching,
            };
        }
        Ok(lhs)
    }

    fn parse_matching(&mut self, op: BinaryOp) -> Result<VectorMatching, ParseError> {
        let mut matching = VectorMatching::default();

        if self.keyword().as_deref() == Some("bool") {
            if !op.is_comparison() {
                return Err(self.error("bool modifier can only be used on comparison operators"));
            }
            self.advance();
            matching.return_bool = true;
        }

        match self.keyword().as_deref() {
            Some("on") => {
                self.advance();
                matching.on = Some(self.parse_label_list()?);
            }
            Some("ignoring") => {
                self.advance();
                matching.ignoring = Some(self.parse_label_list()?);
            }
            _ => return Ok(matching),
        }

        let group = self.keyword();
        if matches!(group.as_deref(), Some("group_left") | Some("group_right")) {
            if op.is_set_operator() {
                return Err(self.error("no grouping allowed for set operations"));
            }
            self.advance();
            let labels = if self.peek() == &TokenKind::LParen {
                self.parse_label_list()?
            } else {
                Vec::new()
            };
            if group.as_deref() == Some("group_left") {
                matching.group_left = Some(labels);
            } else {
                matching.group_right = Some(labels);
            }
        }
        Ok(matching)
    }

    fn parse_label_list(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(TokenKind::LParen, "in grouping opts")?;
        let mut labels = Vec::new();
        loop {
            match self.advance() {
                TokenKind::RParen => return Ok(labels),
                TokenKind::Ident(name) | TokenKind::Str(name) => {
                    labels.push(name);
                    match self.advance() {
                        TokenKind::Comma => continue,
                        TokenKind::RParen => return Ok(labels),
                        other => {
                            return Err(self.error(format!("unexpected {} in grouping opts", other.describe())))
                        }
                    }
                }
                other => return Err(self.error(format!("unexpected {} in grouping opts", other.describe()))),
            }
        }
    }

    // ---- Unary and postfix ----

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            TokenKind::Add => UnaryOp::Pos,
            TokenKind::Sub => UnaryOp::Neg,
            _ => {
                let primary = self.parse_primary()?;
                return self.parse_postfix(primary);
            }
        };
        self.advance();
        let operand = self.parse_binary(BinaryOp::Pow.precedence())?;
        Ok(match (op, operand) {
            (UnaryOp::Neg, Expr::Number(n)) => Expr::Number(-n),
            (UnaryOp::Pos, Expr::Number(n)) => Expr::Number(n),
            (op, expr) => Expr::Unary {
                op,
                expr: Box::new(expr),
            },
        })
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        loop {
            if self.peek() == &TokenKind::LBracket {
                self.advance();
                let range = self.expect_duration("in range")?;
                if self.peek() == &TokenKind::Colon {
                    self.advance();
                    let step = match self.peek() {
                        TokenKind::Duration(_) => Some(self.expect_duration("in subquery step")?),
                        _ => None,
                    };
                    self.expect(TokenKind::RBracket, "in subquery")?;
                    if matches!(expr, Expr::Matrix { .. }) {
                        return Err(self.error("subquery is only allowed on instant vector"));
                    }
                    expr = Expr::Subquery {
                        expr: Box::new(expr),
                        range,
                        step,
                    };
                } else {
                    self.expect(TokenKind::RBracket, "in range")?;
                    expr = match expr {
                        Expr::Selector(selector) => Expr::Matrix { selector, range },
                        _ => return Err(self.error("ranges only allowed for vector selectors")),
                    };
                }
                continue;
            }

            if self.keyword().as_deref() == Some("offset") {
                self.advance();
                let negative = if self.peek() == &TokenKind::Sub {
                    self.advance();
                    true
                } else {
                    false
                };
                let offset = self.expect_duration("in offset")?;
                expr = Expr::Offset {
                    expr: Box::new(expr),
                    offset,
                    negative,
                };
                continue;
            }

            if self.peek() == &TokenKind::At {
                self.advance();
                let at = self.parse_at()?;
                expr = Expr::At {
                    expr: Box::new(expr),
                    at,
                };
                continue;
            }

            return Ok(expr);
        }
    }

    fn parse_at(&mut self) -> Result<AtModifier, ParseError> {
        let sign = if self.peek() == &TokenKind::Sub {
            self.advance();
            -1.0
        } else {
            1.0
        };
        match self.advance() {
            TokenKind::Number(ts) => Ok(AtModifier::Timestamp(sign * ts)),
            TokenKind::Ident(name) if sign > 0.0 => {
                let at = match name.as_str() {
                    "start" => AtModifier::Start,
                    "end" => AtModifier::End,
                    _ => return Err(self.error(format!("unexpected identifier \"{name}\" in @"))),
                };
                self.expect(TokenKind::LParen, "in @")?;
                self.expect(TokenKind::RParen, "in @")?;
                Ok(at)
            }
            other => Err(self.error(format!("unexpected {} in @", other.describe()))),
        }
    }

    // ---- Primary expressions ----

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_binary(0)?;
                self.expect(TokenKind::RParen, "in paren expression")?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            TokenKind::LBrace => {
                self.advance();
                let selector = self.parse_selector(None)?;
                Ok(Expr::Selector(selector))
            }
            TokenKind::Ident(name) => self.parse_identifier(name),
            TokenKind::Eof => Err(self.error("unexpected end of input")),
            other => Err(self.error(format!("unexpected {}", other.describe()))),
        }
    }

    fn parse_identifier(&mut self, name: String) -> Result<Expr, ParseError> {
        let lower = name.to_ascii_lowercase();
        if RESERVED.contains(&lower.as_str()) {
            return Err(self.error(format!("unexpected keyword \"{name}\"")));
        }
        if lower == "inf" || lower == "nan" {
            self.advance();
            return Ok(Expr::Number(if lower == "inf" { f64::INFINITY } else { f64::NAN }));
        }

        let next = self.peek_nth(1).clone();
        let is_aggregation = AGGREGATIONS.contains(&lower.as_str()) || PARAM_AGGREGATIONS.contains(&lower.as_str());
        let grouping_follows = matches!(
            &next,
            TokenKind::Ident(k) if matches!(k.to_ascii_lowercase().as_str(), "by" | "without")
        );

        if is_aggregation && (next == TokenKind::LParen || grouping_follows) {
            self.advance();
            return self.parse_aggregation(lower);
        }

        self.advance();
        match next {
            TokenKind::LParen => self.parse_call(name),
            TokenKind::LBrace => {
                self.advance();
                let selector = self.parse_selector(Some(name))?;
                Ok(Expr::Selector(selector))
            }
            _ => Ok(Expr::Selector(VectorSelector {
                name: Some(name),
                matchers: Vec::new(),
            })),
        }
    }

    fn parse_aggregation(&mut self, op: String) -> Result<Expr, ParseError> {
        let mut grouping = self.parse_grouping()?;

        self.expect(TokenKind::LParen, "in aggregation")?;
        if self.peek() == &TokenKind::RParen {
            return Err(self.error("no arguments for aggregate expression provided"));
        }
        let param = if PARAM_AGGREGATIONS.contains(&op.as_str()) {
            let param = self.parse_binary(0)?;
            self.expect(TokenKind::Comma, "in aggregation, expected parameter")?;
            Some(Box::new(param))
        } else {
            None
        };
        let expr = self.parse_binary(0)?;
        if self.peek() == &TokenKind::Comma {
            self.advance();
        }
        self.expect(TokenKind::RParen, "in aggregation")?;

        if grouping.is_none() {
            grouping = self.parse_grouping()?;
        }

        Ok(Expr::Aggregate {
            op,
            param,
            expr: Box::new(expr),
            grouping,
        })
    }

    fn parse_grouping(&mut self) -> Result<Option<Grouping>, ParseError> {
        match self.keyword().as_deref() {
            Some("by") => {
                self.advance();
                Ok(Some(Grouping::By(self.parse_label_list()?)))
            }
            Some("without") => {
                self.advance();
                Ok(Some(Grouping::Without(self.parse_label_list()?)))
            }
            _ => Ok(None),
        }
    }

    fn parse_call(&mut self, func: String) -> Result<Expr, ParseError> {
        let Some(&(_, min, max)) = FUNCTIONS.iter().find(|(name, _, _)| *name == func) else {
            return Err(self.error(format!("unknown function with name \"{func}\"")));
        };

        self.expect(TokenKind::LParen, "in function call")?;
        let mut args = Vec::new();
        if self.peek() != &TokenKind::RParen {
            loop {
                args.push(self.parse_binary(0)?);
                if self.peek() == &TokenKind::Comma {
                    self.advance();
                    if self.peek() == &TokenKind::RParen {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RParen, "in function call")?;

        if args.len() < min || args.len() > max {
            let expected = if min == max {
                min.to_string()
            } else if max == usize::MAX {
                format!("at least {min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(self.error(format!(
                "expected {expected} argument(s) in call to \"{func}\", got {}",
                args.len()
            )));
        }
        Ok(Expr::Call { func, args })
    }

    // ---- Vector selectors ----

    /// Parse the matcher list after `{` and validate the resulting selector.
    fn parse_selector(&mut self, mut name: Option<String>) -> Result<VectorSelector, ParseError> {
        let start = self.pos();
        let mut matchers = Vec::new();

        loop {
            match self.advance() {
                TokenKind::RBrace => break,
                TokenKind::Str(quoted) if matches!(self.peek(), TokenKind::Comma | TokenKind::RBrace) => {
                    if name.is_some() {
                        return Err(self.error("metric name must not be set twice"));
                    }
                    name = Some(quoted);
                }
                TokenKind::Ident(label) | TokenKind::Str(label) => {
                    let op = match self.advance() {
                        TokenKind::Assign => MatchOp::Equal,
                        TokenKind::Neq => MatchOp::NotEqual,
                        TokenKind::EqlRegex => MatchOp::Regex,
                        TokenKind::NeqRegex => MatchOp::NotRegex,
                        other => {
                            return Err(self.error(format!(
                                "unexpected {} in label matching, expected label matching operator",
                                other.describe()
                            )))
                        }
                    };
                    let value = match self.advance() {
                        TokenKind::Str(value) => value,
                        other => {
                            return Err(self.error(format!(
                                "unexpected {} in label matching, expected string",
                                other.describe()
                            )))
                        }
                    };
                    if label == METRIC_NAME_LABEL && name.is_some() {
                        return Err(self.error("metric name must not be set twice"));
                    }
                    let matcher = LabelMatcher::new(label, op, value.as_str())
                        .map_err(|e| self.error(format!("invalid regular expression \"{value}\": {e}")))?;
                    matchers.push(matcher);
                }
                other => {
                    return Err(self.error(format!("unexpected {} in label matching", other.describe())));
                }
            }

            match self.advance() {
                TokenKind::Comma => continue,
                TokenKind::RBrace => break,
                other => return Err(self.error(format!("unexpected {} in label matching", other.describe()))),
            }
        }

        let selector = VectorSelector { name, matchers };
        if selector.name.is_none() && selector.matchers.iter().all(LabelMatcher::matches_empty) {
            return Err(ParseError::new(
                start,
                "vector selector must contain at least one non-empty matcher",
            ));
        }
        Ok(selector)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn selector_names(query: &str) -> Vec<Option<String>> {
        let expr = parse(query).unwrap();
        let mut names = Vec::new();
        expr.walk_selectors(&mut |sel| names.push(sel.name.clone()));
        names
    }

    #[test]
    fn test_precedence_climbing() {
        let expr = parse("a + b * c").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::Add, rhs, .. } => {
                assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected tree: {other:?}"),
        }

        let expr = parse("2 ^ 3 ^ 2").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::Pow, lhs, rhs, .. } => {
                assert_eq!(*lhs, Expr::Number(2.0));
                assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::Pow, .. }));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_walk_collects_nested_selectors() {
        let names = selector_names(
            r#"sum by (job) (rate(http_requests_total{code=~"5.."}[5m])) / on(job) group_left sum(rate(http_requests_total[5m])) > bool 0.1"#,
        );
        assert_eq!(
            names,
            vec![Some("http_requests_total".to_string()), Some("http_requests_total".to_string())]
        );
    }

    #[test]
    fn test_aggregation_forms() {
        assert!(parse("topk(5, node_load1)").is_ok());
        assert!(parse("sum(up) without (instance)").is_ok());
        assert!(parse(r#"count_values("version", build_info)"#).is_ok());
        assert!(parse("quantile(0.9, rate(x[1m]))").is_ok());
        assert!(parse("sum()").is_err());
    }

    #[test]
    fn test_postfix_modifiers() {
        assert!(parse("rate(x[5m] offset 1h)").is_ok());
        assert!(parse("x offset -5m").is_ok());
        assert!(parse("x @ 1609746000").is_ok());
        assert!(parse("x @ start()").is_ok());
        assert!(parse("max_over_time(rate(x[1m])[30m:1m])").is_ok());
        assert!(parse("max_over_time(deriv(x[1m])[30m:])").is_ok());
    }

    #[test]
    fn test_label_selector_only() {
        let names = selector_names(r#"{__name__="up", job="api"}"#);
        assert_eq!(names, vec![None]);
        assert!(parse(r#"{"up"}"#).is_ok());
    }

    #[rstest]
    #[case::unclosed_paren("rate(x[5m]")]
    #[case::empty("")]
    #[case::trailing_tokens("up up")]
    #[case::range_on_call("rate(x[5m])[5m]")]
    #[case::empty_matchers(r#"{job=""}"#)]
    #[case::bad_regex(r#"up{job=~"("}"#)]
    #[case::name_twice(r#"up{__name__="down"}"#)]
    #[case::unknown_function("not_a_function(x)")]
    #[case::arity("rate(x[5m], y[5m])")]
    #[case::bool_on_arith("a + bool b")]
    #[case::group_on_set_op("a and on(x) group_left b")]
    #[case::dangling_operator("a +")]
    fn test_parse_errors(#[case] query: &str) {
        assert!(parse(query).is_err(), "expected parse error for {query:?}");
    }

    #[test]
    fn test_error_position() {
        let err = parse("sum(rate(x[5m])").unwrap_err();
        assert_eq!(err.position, 15);
    }
}
