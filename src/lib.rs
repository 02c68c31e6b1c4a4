//! Lyra: Lowering of tensor operators into masked-reduction loop nests
//!
//! 高レベルの演算子記述(現状はdepthwise 2次元畳み込み)を、後段の
//! スケジューリング・コード生成に適した明示的なループネスト計算へ変換
//! します。呼び出しごとに、特殊化されたLoweringが合法かを判定し、
//! 不可能な場合はプリコンパイル済みの汎用ルーチンへの外部呼び出しに
//! フォールバックします。
//!
//! # 基本的な使い方
//!
//! ```
//! use lyra::prelude::*;
//!
//! // 静的形状のオペランドを宣言
//! let dims = |d: &[isize]| d.iter().map(|&v| Expr::Const(v)).collect::<Vec<_>>();
//! let input = Buffer::new("input", dims(&[1, 4, 8, 8]), DType::F32);
//! let weight = Buffer::new("weight", dims(&[4, 1, 3, 3]), DType::F32);
//! let bias = Buffer::new("bias", dims(&[4]), DType::F32);
//!
//! let params = Conv2dParams::isotropic(1, 1, 1, 4);
//! let lowered = lower_conv2d(&input, &weight, &bias, &params, &dims(&[1, 4, 8, 8]), None);
//!
//! // depthwise 3x3 なので特殊化パスが選ばれる
//! assert_eq!(lowered.buf.name(), "conv2d_depthwise");
//! assert!(lowered.loops().is_some());
//! ```

pub mod ast;
pub mod buffer;
pub mod interp;
pub mod lowerer;
pub mod shape;

pub use buffer::{Buffer, TensorMeta};
pub use lowerer::{ComputeStmt, Lowered};
pub use shape::Expr;

/// Prelude module with commonly used types and functions
///
/// # Example
///
/// ```
/// use lyra::prelude::*;
/// ```
pub mod prelude {
    pub use crate::ast::{AstNode, DType, Literal};
    pub use crate::buffer::{Buffer, TensorMeta};
    pub use crate::interp::Evaluator;
    pub use crate::lowerer::{
        ComputeStmt, Conv2dParams, LoopNest, Lowered, ReduceOp, UnsupportedConv2d,
        conv2d_depthwise, conv2d_depthwise_dynamic, conv2d_is_supported, lower_conv2d,
        lower_prepacked_conv2d_clamp_run, lower_prepacked_linear_clamp_run, reduce,
        specialize_depthwise_loops,
    };
    pub use crate::shape::Expr;
}
