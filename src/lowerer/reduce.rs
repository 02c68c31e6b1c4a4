//! マスク付き多次元縮約のループネスト構築
//!
//! 出力インデックス空間と縮約インデックス空間を受け取り、
//! 初期化ループネストと縮約ループネストの2つを生成します。
//! 縮約は出力バッファ自体に蓄積するため、出力バッファへ書き込む
//! ループネストは常に2つ存在します(初期化分割)。後段のループ特殊化は
//! この構造を前提とします。

use crate::ast::helper::*;
use crate::ast::{AstNode, DType};
use crate::buffer::Buffer;
use crate::shape::Expr;

use super::{ComputeStmt, Lowered};

/// 縮約の結合演算子
///
/// 結合的・可換な演算と、その単位元を提供する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
}

impl ReduceOp {
    /// 単位元を取得
    pub fn identity(&self, dtype: &DType) -> AstNode {
        match self {
            ReduceOp::Sum => match dtype {
                DType::Int => const_int(0),
                _ => const_f32(0.0),
            },
            ReduceOp::Prod => match dtype {
                DType::Int => const_int(1),
                _ => const_f32(1.0),
            },
            ReduceOp::Max => match dtype {
                DType::Int => const_int(isize::MIN),
                _ => const_f32(f32::NEG_INFINITY),
            },
        }
    }

    /// 蓄積式 acc <op> val を構築
    pub fn apply(&self, acc: AstNode, val: AstNode) -> AstNode {
        match self {
            ReduceOp::Sum => acc + val,
            ReduceOp::Prod => acc * val,
            ReduceOp::Max => max(acc, val),
        }
    }
}

/// 出力インデックスから初期値を生成する関数
pub type InitFn<'a> = dyn Fn(&[AstNode]) -> AstNode + 'a;

/// 縮約計算のループネストを構築する
///
/// # Arguments
/// * `name` - 出力バッファ名
/// * `dtype` - 出力の型
/// * `output_dims` - 出力インデックス空間 (範囲, 変数名) の列
/// * `op` - 結合演算子
/// * `init` - 初期値の上書き(Noneなら演算子の単位元)
/// * `body` - 出力インデックス+縮約インデックスから寄与を生成する関数
/// * `reduce_dims` - 縮約インデックス空間 (範囲, 変数名) の列
///
/// # 生成される構造
/// ```text
/// // 初期化ループネスト
/// for n ... { out[...] = init(n, ...) }
/// // 縮約ループネスト
/// for n ... { for c ... { out[...] = out[...] + body(n, ..., c, ...) } }
/// ```
///
/// インデックス変数は縮約の中にのみ存在し、境界は形状式から変換される
/// (静的形状なら定数、シンボリック形状なら式のまま)。
pub fn reduce(
    name: &str,
    dtype: DType,
    output_dims: &[(Expr, &str)],
    op: ReduceOp,
    init: Option<&InitFn<'_>>,
    body: impl Fn(&[AstNode]) -> AstNode,
    reduce_dims: &[(Expr, &str)],
) -> Lowered {
    log::trace!(
        "building {:?} reduction {} over {} output dims and {} reduce dims",
        op,
        name,
        output_dims.len(),
        reduce_dims.len()
    );

    let buf = Buffer::new(
        name,
        output_dims.iter().map(|(e, _)| e.clone()).collect(),
        dtype.clone(),
    );

    let output_vars: Vec<AstNode> = output_dims.iter().map(|(_, v)| var(*v)).collect();
    let mut all_vars = output_vars.clone();
    all_vars.extend(reduce_dims.iter().map(|(_, v)| var(*v)));

    let offset = buf.flat_offset(&output_vars);

    // 初期化ループネスト
    let seed = match init {
        Some(f) => f(&output_vars),
        None => op.identity(&dtype),
    };
    let mut init_nest = block(vec![store(var(name), offset.clone(), seed)]);
    for (extent, loop_var) in output_dims.iter().rev() {
        init_nest = range(
            *loop_var,
            const_int(0),
            const_int(1),
            extent.clone().into(),
            init_nest,
        );
    }

    // 縮約ループネスト
    let acc = op.apply(
        load(var(name), offset.clone(), dtype),
        body(&all_vars),
    );
    let mut reduce_nest = block(vec![store(var(name), offset, acc)]);
    for (extent, loop_var) in reduce_dims.iter().rev() {
        reduce_nest = range(
            *loop_var,
            const_int(0),
            const_int(1),
            extent.clone().into(),
            reduce_nest,
        );
    }
    for (extent, loop_var) in output_dims.iter().rev() {
        reduce_nest = range(
            *loop_var,
            const_int(0),
            const_int(1),
            extent.clone().into(),
            reduce_nest,
        );
    }

    Lowered {
        buf,
        stmt: ComputeStmt::Loops(block(vec![init_nest, reduce_nest])),
    }
}
