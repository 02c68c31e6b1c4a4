//! Debug evaluator for lowered statement trees.
//!
//! Executes `Range`/`Block`/`Store` statements against named f32 buffers,
//! with the same scalar semantics a code generator would emit for the same
//! nodes (`*ptr.add(offset)` loads, lazy `if cond { a } else { b }` selects,
//! integer `/` for `Idiv`). Used by tests to compare transformed and
//! untransformed loop nests element for element.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{AstNode, Literal};

/// Scalar value produced by expression evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(isize),
    F32(f32),
}

impl Value {
    fn as_int(self) -> Result<isize, EvalError> {
        match self {
            Value::Int(v) => Ok(v),
            other => Err(EvalError::TypeMismatch {
                expected: "Int",
                got: other,
            }),
        }
    }

    fn as_bool(self) -> Result<bool, EvalError> {
        match self {
            Value::Bool(v) => Ok(v),
            other => Err(EvalError::TypeMismatch {
                expected: "Bool",
                got: other,
            }),
        }
    }

    /// Int は F32 に昇格する
    fn as_f32(self) -> Result<f32, EvalError> {
        match self {
            Value::F32(v) => Ok(v),
            Value::Int(v) => Ok(v as f32),
            other => Err(EvalError::TypeMismatch {
                expected: "F32",
                got: other,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("undefined variable: {0}")]
    UndefinedVar(String),
    #[error("unknown buffer: {0}")]
    UnknownBuffer(String),
    #[error("offset {offset} out of bounds for buffer {buffer} (len {len})")]
    OutOfBounds {
        buffer: String,
        offset: isize,
        len: usize,
    },
    #[error("type mismatch: expected {expected}, got {got:?}")]
    TypeMismatch { expected: &'static str, got: Value },
    #[error("{0}")]
    Unsupported(&'static str),
}

/// Statement-tree evaluator over named f32 buffers.
///
/// Buffers must be bound (including the output buffer, zero-filled or
/// otherwise) before `run` is called; `run` mutates them in place.
#[derive(Debug, Default)]
pub struct Evaluator {
    buffers: HashMap<String, Vec<f32>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a named buffer.
    pub fn bind(&mut self, name: impl Into<String>, data: Vec<f32>) {
        self.buffers.insert(name.into(), data);
    }

    /// Get a bound buffer's contents.
    pub fn buffer(&self, name: &str) -> Option<&[f32]> {
        self.buffers.get(name).map(|v| v.as_slice())
    }

    /// Execute a statement tree.
    pub fn run(&mut self, stmt: &AstNode) -> Result<(), EvalError> {
        let mut env = HashMap::new();
        self.exec(stmt, &mut env)
    }

    /// Evaluate a closed integer expression (no loop variables in scope).
    pub fn eval_const(&self, expr: &AstNode) -> Result<isize, EvalError> {
        self.eval(expr, &HashMap::new())?.as_int()
    }

    fn exec(&mut self, node: &AstNode, env: &mut HashMap<String, isize>) -> Result<(), EvalError> {
        match node {
            AstNode::Block { statements } => {
                for stmt in statements {
                    self.exec(stmt, env)?;
                }
                Ok(())
            }
            AstNode::Range {
                var,
                start,
                step,
                stop,
                body,
            } => {
                let start = self.eval(start, env)?.as_int()?;
                let step = self.eval(step, env)?.as_int()?;
                let stop = self.eval(stop, env)?.as_int()?;
                if step <= 0 {
                    return Err(EvalError::Unsupported("non-positive loop step"));
                }

                let mut i = start;
                while i < stop {
                    env.insert(var.clone(), i);
                    self.exec(body, env)?;
                    i += step;
                }
                env.remove(var);
                Ok(())
            }
            AstNode::Store { ptr, offset, value } => {
                let AstNode::Var(name) = ptr.as_ref() else {
                    return Err(EvalError::Unsupported("store through a non-variable pointer"));
                };
                let offset = self.eval(offset, env)?.as_int()?;
                let value = self.eval(value, env)?.as_f32()?;

                let buf = self
                    .buffers
                    .get_mut(name)
                    .ok_or_else(|| EvalError::UnknownBuffer(name.clone()))?;
                if offset < 0 || offset as usize >= buf.len() {
                    return Err(EvalError::OutOfBounds {
                        buffer: name.clone(),
                        offset,
                        len: buf.len(),
                    });
                }
                buf[offset as usize] = value;
                Ok(())
            }
            _ => Err(EvalError::Unsupported("expression in statement position")),
        }
    }

    fn eval(&self, node: &AstNode, env: &HashMap<String, isize>) -> Result<Value, EvalError> {
        match node {
            AstNode::Const(Literal::Bool(v)) => Ok(Value::Bool(*v)),
            AstNode::Const(Literal::Int(v)) => Ok(Value::Int(*v)),
            AstNode::Const(Literal::F32(v)) => Ok(Value::F32(*v)),
            AstNode::Var(name) => env
                .get(name)
                .copied()
                .map(Value::Int)
                .ok_or_else(|| EvalError::UndefinedVar(name.clone())),
            AstNode::Add(a, b) => self.numeric_binop(a, b, env, |x, y| x + y, |x, y| x + y),
            AstNode::Mul(a, b) => self.numeric_binop(a, b, env, |x, y| x * y, |x, y| x * y),
            AstNode::Max(a, b) => self.numeric_binop(a, b, env, isize::max, f32::max),
            AstNode::Idiv(a, b) => {
                let a = self.eval(a, env)?.as_int()?;
                let b = self.eval(b, env)?.as_int()?;
                if b == 0 {
                    return Err(EvalError::Unsupported("division by zero"));
                }
                Ok(Value::Int(a / b))
            }
            AstNode::Lt(a, b) => {
                let a = self.eval(a, env)?.as_int()?;
                let b = self.eval(b, env)?.as_int()?;
                Ok(Value::Bool(a < b))
            }
            AstNode::Ge(a, b) => {
                let a = self.eval(a, env)?.as_int()?;
                let b = self.eval(b, env)?.as_int()?;
                Ok(Value::Bool(a >= b))
            }
            AstNode::Or(a, b) => {
                let a = self.eval(a, env)?.as_bool()?;
                let b = self.eval(b, env)?.as_bool()?;
                Ok(Value::Bool(a || b))
            }
            AstNode::Select {
                cond,
                then_val,
                else_val,
            } => {
                // Only the taken branch is evaluated: the untaken branch may
                // contain a load that the mask exists to guard.
                if self.eval(cond, env)?.as_bool()? {
                    self.eval(then_val, env)
                } else {
                    self.eval(else_val, env)
                }
            }
            AstNode::Load { ptr, offset, .. } => {
                let AstNode::Var(name) = ptr.as_ref() else {
                    return Err(EvalError::Unsupported("load through a non-variable pointer"));
                };
                let offset = self.eval(offset, env)?.as_int()?;
                let buf = self
                    .buffers
                    .get(name)
                    .ok_or_else(|| EvalError::UnknownBuffer(name.clone()))?;
                if offset < 0 || offset as usize >= buf.len() {
                    return Err(EvalError::OutOfBounds {
                        buffer: name.clone(),
                        offset,
                        len: buf.len(),
                    });
                }
                Ok(Value::F32(buf[offset as usize]))
            }
            AstNode::Store { .. } | AstNode::Range { .. } | AstNode::Block { .. } => {
                Err(EvalError::Unsupported("statement in expression position"))
            }
        }
    }

    fn numeric_binop(
        &self,
        a: &AstNode,
        b: &AstNode,
        env: &HashMap<String, isize>,
        int_op: impl Fn(isize, isize) -> isize,
        f32_op: impl Fn(f32, f32) -> f32,
    ) -> Result<Value, EvalError> {
        let a = self.eval(a, env)?;
        let b = self.eval(b, env)?;
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(int_op(x, y))),
            // mixed operands promote to f32
            (x, y) => Ok(Value::F32(f32_op(x.as_f32()?, y.as_f32()?))),
        }
    }
}
