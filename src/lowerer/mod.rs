//! テンソル演算子のLowering
//!
//! 高レベルの演算子記述を、スケジューリング可能なループネスト計算
//! (または外部ルーチン呼び出し)へ変換します。
//!
//! # 構成
//!
//! - [`reduce`] - マスク付き多次元縮約のループネストを構築する
//! - [`loopnest`] - 構築済みループネストに対する分割(peeling)変換
//! - [`conv2d`] - depthwise conv2dのサポート判定・Lowering・ディスパッチ

pub mod conv2d;
pub mod loopnest;
pub mod reduce;

pub use conv2d::{
    Conv2dParams, UnsupportedConv2d, conv2d_depthwise, conv2d_depthwise_dynamic,
    conv2d_is_supported, lower_conv2d, lower_prepacked_conv2d_clamp_run,
    lower_prepacked_linear_clamp_run, specialize_depthwise_loops,
};
pub use loopnest::{LoopId, LoopNest};
pub use reduce::{ReduceOp, reduce};

use crate::ast::AstNode;
use crate::buffer::Buffer;

/// 出力バッファを定義する計算
///
/// 縮約で定義される場合はループネスト文、特殊化できない場合は
/// 外部ルーチン呼び出し文になる。
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeStmt {
    /// ループネストによる計算
    Loops(AstNode),
    /// プリコンパイル済み外部ルーチンの呼び出し
    ///
    /// ルーチン名はコード生成時に解決される。バッファ引数と
    /// スカラー引数の順序はルーチンごとに固定。
    Extern {
        routine: String,
        buffer_args: Vec<Buffer>,
        scalar_args: Vec<isize>,
    },
}

/// 名前付き出力バッファと、それを定義する計算の組
///
/// Lowering呼び出しごとに新しく構築され、そのままIR層へ渡される。
#[derive(Debug, Clone, PartialEq)]
pub struct Lowered {
    pub buf: Buffer,
    pub stmt: ComputeStmt,
}

impl Lowered {
    /// ループネスト文への参照を取得(外部呼び出しの場合は None)
    pub fn loops(&self) -> Option<&AstNode> {
        match &self.stmt {
            ComputeStmt::Loops(root) => Some(root),
            ComputeStmt::Extern { .. } => None,
        }
    }
}
