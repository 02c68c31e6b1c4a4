use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::ast::{AstNode, Literal};

/// 次元サイズを表すシンボリック式
///
/// 定数(`Const`)と変数(`Var`)、およびその四則演算からなる整数式。
/// 静的形状のバッファでは全次元が`Const`に簡約される。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    // 定数と変数
    Const(isize),
    Var(String),

    // 算術演算
    Add(Box<Self>, Box<Self>),
    Sub(Box<Self>, Box<Self>),
    Mul(Box<Self>, Box<Self>),
    Div(Box<Self>, Box<Self>),
}

impl From<isize> for Expr {
    fn from(v: isize) -> Self {
        Expr::Const(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Const(v as isize)
    }
}

impl From<usize> for Expr {
    fn from(v: usize) -> Self {
        Expr::Const(v as isize)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::Var(name.to_string())
    }
}

impl<T: Into<Expr>> Add<T> for Expr {
    type Output = Expr;

    fn add(self, rhs: T) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Sub<T> for Expr {
    type Output = Expr;

    fn sub(self, rhs: T) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Mul<T> for Expr {
    type Output = Expr;

    fn mul(self, rhs: T) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Div<T> for Expr {
    type Output = Expr;

    fn div(self, rhs: T) -> Expr {
        Expr::Div(Box::new(self), Box::new(rhs.into()))
    }
}

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Sub(Box::new(Expr::Const(0)), Box::new(self))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Var(name) => write!(f, "{}", name),
            Expr::Add(l, r) => write!(f, "({} + {})", l, r),
            Expr::Sub(l, r) => write!(f, "({} - {})", l, r),
            Expr::Mul(l, r) => write!(f, "({} * {})", l, r),
            Expr::Div(l, r) => write!(f, "({} / {})", l, r),
        }
    }
}

/// ExprをAstNodeに変換する
///
/// 変換前にsimplifyし、定数になる場合は定数ノードを返す。
/// 除算はインデックス計算なので整数除算(`Idiv`)に変換する。
impl From<Expr> for AstNode {
    fn from(expr: Expr) -> Self {
        let expr = expr.simplify();
        match expr {
            Expr::Const(c) => AstNode::Const(Literal::Int(c)),
            Expr::Var(s) => AstNode::Var(s),
            Expr::Add(l, r) => AstNode::Add(Box::new((*l).into()), Box::new((*r).into())),
            Expr::Sub(l, r) => {
                // a - b = a + (-b)
                let left: AstNode = (*l).into();
                let right: AstNode = (*r).into();
                left + (-right)
            }
            Expr::Mul(l, r) => AstNode::Mul(Box::new((*l).into()), Box::new((*r).into())),
            Expr::Div(l, r) => {
                let left: AstNode = (*l).into();
                let right: AstNode = (*r).into();
                crate::ast::helper::idiv(left, right)
            }
        }
    }
}

impl Expr {
    /// 定数値を取得（定数の場合のみ）
    pub fn as_const(&self) -> Option<isize> {
        match self {
            Expr::Const(v) => Some(*v),
            _ => None,
        }
    }

    /// 定数値をusizeとして取得（定数の場合のみ）
    ///
    /// 負の値の場合は None を返します。
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            Expr::Const(v) if *v >= 0 => Some(*v as usize),
            _ => None,
        }
    }

    /// 定数値を強制的に取得（定数でない場合はパニック）
    ///
    /// # Panics
    ///
    /// 式が定数でない場合にパニックします。
    pub fn expect_const(&self, msg: &str) -> isize {
        self.as_const()
            .unwrap_or_else(|| panic!("Expected constant expression: {}", msg))
    }

    /// 変数の値を与えて式を評価する
    ///
    /// # Arguments
    /// * `vars` - 変数名と値のマッピング
    ///
    /// # Returns
    /// * `Ok(isize)` - 評価結果
    /// * `Err(String)` - 未定義の変数があった場合
    pub fn evaluate(&self, vars: &HashMap<String, isize>) -> Result<isize, String> {
        match self {
            Expr::Const(v) => Ok(*v),
            Expr::Var(name) => vars
                .get(name)
                .copied()
                .ok_or_else(|| format!("Undefined variable: {}", name)),
            Expr::Add(l, r) => Ok(l.evaluate(vars)? + r.evaluate(vars)?),
            Expr::Sub(l, r) => Ok(l.evaluate(vars)? - r.evaluate(vars)?),
            Expr::Mul(l, r) => Ok(l.evaluate(vars)? * r.evaluate(vars)?),
            Expr::Div(l, r) => {
                let rv = r.evaluate(vars)?;
                if rv == 0 {
                    Err("Division by zero".to_string())
                } else {
                    Ok(l.evaluate(vars)? / rv)
                }
            }
        }
    }

    pub fn simplify(self) -> Self {
        match self {
            Expr::Add(lhs, rhs) => {
                let lhs = lhs.simplify();
                let rhs = rhs.simplify();
                match (lhs, rhs) {
                    (Expr::Const(0), e) | (e, Expr::Const(0)) => e,
                    (Expr::Const(l), Expr::Const(r)) => Expr::Const(l + r),
                    (l, r) => l + r,
                }
            }
            Expr::Sub(lhs, rhs) => {
                let lhs = lhs.simplify();
                let rhs = rhs.simplify();
                match (lhs, rhs) {
                    (e, Expr::Const(0)) => e,
                    (l, r) if l == r => Expr::Const(0),
                    (Expr::Const(l), Expr::Const(r)) => Expr::Const(l - r),
                    (l, r) => l - r,
                }
            }
            Expr::Mul(lhs, rhs) => {
                let lhs = lhs.simplify();
                let rhs = rhs.simplify();
                match (lhs, rhs) {
                    (Expr::Const(0), _) | (_, Expr::Const(0)) => Expr::Const(0),
                    (Expr::Const(1), e) | (e, Expr::Const(1)) => e,
                    (Expr::Const(l), Expr::Const(r)) => Expr::Const(l * r),
                    (l, r) => l * r,
                }
            }
            Expr::Div(lhs, rhs) => {
                let lhs = lhs.simplify();
                let rhs = rhs.simplify();
                match (lhs, rhs) {
                    (_, Expr::Const(0)) => panic!("division by zero"),
                    (e, Expr::Const(1)) => e,
                    (l, r) if l == r => Expr::Const(1),
                    (Expr::Const(0), _) => Expr::Const(0),
                    (Expr::Const(l), Expr::Const(r)) => Expr::Const(l / r),
                    (l, r) => l / r,
                }
            }
            _ => self,
        }
    }
}
