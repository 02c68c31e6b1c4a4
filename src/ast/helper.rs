//! ASTノードのヘルパーコンストラクタ
//!
//! Loweringコードが直接 `AstNode::...` を書かずに済むようにする
//! 小さな関数群です。

use super::{AstNode, DType, Literal};

/// 変数参照ノードを生成
pub fn var(name: impl Into<String>) -> AstNode {
    AstNode::Var(name.into())
}

/// 整数定数ノードを生成
pub fn const_int(v: isize) -> AstNode {
    AstNode::Const(Literal::Int(v))
}

/// f32定数ノードを生成
pub fn const_f32(v: f32) -> AstNode {
    AstNode::Const(Literal::F32(v))
}

/// Forループノードを生成
pub fn range(
    var: impl Into<String>,
    start: AstNode,
    step: AstNode,
    stop: AstNode,
    body: AstNode,
) -> AstNode {
    AstNode::Range {
        var: var.into(),
        start: Box::new(start),
        step: Box::new(step),
        stop: Box::new(stop),
        body: Box::new(body),
    }
}

/// 文の並びをブロックにまとめる
pub fn block(statements: Vec<AstNode>) -> AstNode {
    AstNode::Block { statements }
}

/// バッファからの読み込みノードを生成
pub fn load(ptr: AstNode, offset: AstNode, dtype: DType) -> AstNode {
    AstNode::Load {
        ptr: Box::new(ptr),
        offset: Box::new(offset),
        dtype,
    }
}

/// バッファへの書き込み文を生成
pub fn store(ptr: AstNode, offset: AstNode, value: AstNode) -> AstNode {
    AstNode::Store {
        ptr: Box::new(ptr),
        offset: Box::new(offset),
        value: Box::new(value),
    }
}

/// データ依存の選択ノードを生成
pub fn select(cond: AstNode, then_val: AstNode, else_val: AstNode) -> AstNode {
    AstNode::Select {
        cond: Box::new(cond),
        then_val: Box::new(then_val),
        else_val: Box::new(else_val),
    }
}

/// 比較 a < b
pub fn lt(a: AstNode, b: impl Into<AstNode>) -> AstNode {
    AstNode::Lt(Box::new(a), Box::new(b.into()))
}

/// 比較 a >= b
pub fn ge(a: AstNode, b: impl Into<AstNode>) -> AstNode {
    AstNode::Ge(Box::new(a), Box::new(b.into()))
}

/// 論理和 a || b
pub fn or_(a: AstNode, b: AstNode) -> AstNode {
    AstNode::Or(Box::new(a), Box::new(b))
}

/// 整数除算 a / b
pub fn idiv(a: AstNode, b: impl Into<AstNode>) -> AstNode {
    AstNode::Idiv(Box::new(a), Box::new(b.into()))
}

/// 最大値 max(a, b)
pub fn max(a: AstNode, b: AstNode) -> AstNode {
    AstNode::Max(Box::new(a), Box::new(b))
}
