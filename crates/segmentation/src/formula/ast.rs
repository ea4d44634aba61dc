//! Formula syntax tree.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Cat,
    If,
    Math,
    Date,
}

impl Function {
    pub fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "CAT" => Some(Function::Cat),
            "IF" => Some(Function::If),
            "MATH" => Some(Function::Math),
            "DATE" => Some(Function::Date),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Cat => "CAT",
            Function::If => "IF",
            Function::Math => "MATH",
            Function::Date => "DATE",
        }
    }

    /// Accepted argument counts as (min, max).
    pub fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Function::Cat => (1, None),
            Function::If => (3, Some(3)),
            Function::Math | Function::Date => (1, Some(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl BinaryOp {
    pub fn is_arithmetic(&self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    Str(String),
    Number(f64),
    /// Seconds.
    Duration(f64),
    Bool(bool),
    Null,
    Call {
        func: Function,
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Negate(Box<Expr>),
}

impl Expr {
    /// Every identifier in the tree, deduplicated, in first-seen order.
    /// Both branches of an IF are included.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut Vec<String>) {
        match self {
            Expr::Ident(name) => {
                if !out.iter().any(|n| n == name) {
                    out.push(name.clone());
                }
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_identifiers(out)),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_identifiers(out);
                rhs.collect_identifiers(out);
            }
            Expr::Negate(inner) => inner.collect_identifiers(out),
            Expr::Str(_) | Expr::Number(_) | Expr::Duration(_) | Expr::Bool(_) | Expr::Null => {}
        }
    }
}
