// ============================================================================
// PROMQL SYNTAX TREE
// ============================================================================

use std::time::Duration;

/// Label matching operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

/// One `label op "value"` constraint of a selector.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    matches_empty: bool,
}

impl LabelMatcher {
    /// Build a matcher. Regex values are compiled once, anchored, here.
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Result<Self, regex::Error> {
        let value = value.into();
        let matches_empty = match op {
            MatchOp::Equal => value.is_empty(),
            MatchOp::NotEqual => !value.is_empty(),
            MatchOp::Regex | MatchOp::NotRegex => {
                let hit = regex::Regex::new(&format!("^(?:{value})$"))?.is_match("");
                (op == MatchOp::Regex) == hit
            }
        };
        Ok(Self {
            name: name.into(),
            op,
            value,
            matches_empty,
        })
    }

    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            matches_empty: value.is_empty(),
            value,
        }
    }

    /// Whether the matcher accepts the empty string, i.e. also selects series
    /// lacking the label.
    pub fn matches_empty(&self) -> bool {
        self.matches_empty
    }
}

/// An instant vector selector. `name` is absent for `{__name__=...}` forms
/// and for pure label selections.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelector {
    pub name: Option<String>,
    pub matchers: Vec<LabelMatcher>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Atan2,
    Eql,
    Neq,
    Lss,
    Lte,
    Gtr,
    Gte,
    And,
    Or,
    Unless,
}

impl BinaryOp {
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And | BinaryOp::Unless => 2,
            BinaryOp::Eql | BinaryOp::Neq | BinaryOp::Lss | BinaryOp::Lte | BinaryOp::Gtr | BinaryOp::Gte => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Atan2 => 5,
            BinaryOp::Pow => 6,
        }
    }

    pub fn is_right_associative(&self) -> bool {
        matches!(self, BinaryOp::Pow)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eql | BinaryOp::Neq | BinaryOp::Lss | BinaryOp::Lte | BinaryOp::Gtr | BinaryOp::Gte
        )
    }

    pub fn is_set_operator(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Unless)
    }
}

/// Vector matching modifiers of a binary expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorMatching {
    pub return_bool: bool,
    pub on: Option<Vec<String>>,
    pub ignoring: Option<Vec<String>>,
    pub group_left: Option<Vec<String>>,
    pub group_right: Option<Vec<String>>,
}

/// `by (...)` or `without (...)` clause of an aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum Grouping {
    By(Vec<String>),
    Without(Vec<String>),
}

/// `@` modifier argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AtModifier {
    Timestamp(f64),
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Selector(VectorSelector),
    Matrix {
        selector: VectorSelector,
        range: Duration,
    },
    Subquery {
        expr: Box<Expr>,
        range: Duration,
        step: Option<Duration>,
    },
    Offset {
        expr: Box<Expr>,
        offset: Duration,
        negative: bool,
    },
    At {
        expr: Box<Expr>,
        at: AtModifier,
    },
    Paren(Box<Expr>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        matching: VectorMatching,
    },
    Aggregate {
        op: String,
        param: Option<Box<Expr>>,
        expr: Box<Expr>,
        grouping: Option<Grouping>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Visit every vector selector in the tree, including the selectors
    /// underneath range and subquery expressions.
    pub fn walk_selectors<'a>(&'a self, visit: &mut impl FnMut(&'a VectorSelector)) {
        match self {
            Expr::Number(_) | Expr::Str(_) => {}
            Expr::Selector(sel) => visit(sel),
            Expr::Matrix { selector, .. } => visit(selector),
            Expr::Subquery { expr, .. }
            | Expr::Offset { expr, .. }
            | Expr::At { expr, .. }
            | Expr::Paren(expr)
            | Expr::Unary { expr, .. } => expr.walk_selectors(visit),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk_selectors(visit);
                rhs.walk_selectors(visit);
            }
            Expr::Aggregate { param, expr, .. } => {
                if let Some(param) = param {
                    param.walk_selectors(visit);
                }
                expr.walk_selectors(visit);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.walk_selectors(visit);
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
