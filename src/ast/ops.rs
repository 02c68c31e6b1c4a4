use super::{AstNode, Literal};
use std::ops::{Add, Mul, Neg, Sub};

// Operator overloading for AstNode with Into<AstNode> abstraction

impl<T: Into<AstNode>> Add<T> for AstNode {
    type Output = AstNode;

    fn add(self, rhs: T) -> AstNode {
        AstNode::Add(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<AstNode>> Mul<T> for AstNode {
    type Output = AstNode;

    fn mul(self, rhs: T) -> AstNode {
        AstNode::Mul(Box::new(self), Box::new(rhs.into()))
    }
}

// Subtraction: a - b = a + (-b)
impl<T: Into<AstNode>> Sub<T> for AstNode {
    type Output = AstNode;

    fn sub(self, rhs: T) -> AstNode {
        self + (-rhs.into())
    }
}

// Negation: -x = -1 * x (index arithmetic, so the constant is Int)
impl Neg for AstNode {
    type Output = AstNode;

    fn neg(self) -> AstNode {
        AstNode::Const(Literal::Int(-1)) * self
    }
}

// Into<AstNode> implementations for numeric types
impl From<f32> for AstNode {
    fn from(value: f32) -> Self {
        AstNode::Const(Literal::F32(value))
    }
}

impl From<isize> for AstNode {
    fn from(value: isize) -> Self {
        AstNode::Const(Literal::Int(value))
    }
}

impl From<usize> for AstNode {
    fn from(value: usize) -> Self {
        AstNode::Const(Literal::Int(value as isize))
    }
}

impl From<i32> for AstNode {
    fn from(value: i32) -> Self {
        AstNode::Const(Literal::Int(value as isize))
    }
}
