//! Depthwise conv2dのLowering
//!
//! depthwise 2次元畳み込みを、境界マスク付きの縮約ループネストへ変換
//! します。サポート判定([`conv2d_is_supported`])が通る構成だけが特殊化
//! され、それ以外は汎用の外部ルーチン呼び出しへ静かにフォールバック
//! します。
//!
//! マスクは制御フローではなくデータ依存のSelectで表現され、ループ本体は
//! 縮約インデックス空間全体で一様になります。これにより、認識された
//! (カーネルサイズ, ストライド, パディング) 構成では境界反復だけを
//! 別ループに切り出し、内側の大部分からマスクを実質的に除去できます。

use thiserror::Error;

use crate::ast::helper::*;
use crate::ast::{AstNode, DType};
use crate::buffer::{Buffer, TensorMeta};
use crate::shape::Expr;

use super::{ComputeStmt, Lowered, LoopNest, ReduceOp, reduce};

/// 汎用conv2dフォールバックの外部ルーチン名
pub const CONV2D_EXTERN: &str = "lyra_conv2d";
/// prepacked conv2d+clampの外部ルーチン名
pub const PREPACKED_CONV2D_CLAMP_RUN_EXTERN: &str = "lyra_prepacked_conv2d_clamp_run";
/// prepacked linear+clampの外部ルーチン名
pub const PREPACKED_LINEAR_CLAMP_RUN_EXTERN: &str = "lyra_prepacked_linear_clamp_run";

/// 2次元畳み込みのパラメータ
///
/// stride/padding/dilationは(高さ, 幅)の2要素。特殊化パスでは
/// 両成分が等しい(等方)ことが要求される。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dParams {
    pub stride: [isize; 2],
    pub padding: [isize; 2],
    pub dilation: [isize; 2],
    pub groups: isize,
}

impl Conv2dParams {
    /// # Panics
    /// groupsが正でない場合
    pub fn new(
        stride: [isize; 2],
        padding: [isize; 2],
        dilation: [isize; 2],
        groups: isize,
    ) -> Self {
        assert!(groups > 0, "groups must be positive");
        Self {
            stride,
            padding,
            dilation,
            groups,
        }
    }

    /// 高さ・幅で等しいパラメータから作成
    pub fn isotropic(stride: isize, padding: isize, dilation: isize, groups: isize) -> Self {
        Self::new(
            [stride, stride],
            [padding, padding],
            [dilation, dilation],
            groups,
        )
    }

    /// 外部ルーチンへ渡すスカラー引数列
    ///
    /// 順序は {stride_h, stride_w, pad_h, pad_w, dilation_h, dilation_w,
    /// groups} で固定。
    pub fn flat_scalars(&self) -> Vec<isize> {
        vec![
            self.stride[0],
            self.stride[1],
            self.padding[0],
            self.padding[1],
            self.dilation[0],
            self.dilation[1],
            self.groups,
        ]
    }
}

/// 特殊化パスが適用できない理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UnsupportedConv2d {
    #[error("only float32 is supported")]
    Dtype,
    #[error("operands have the wrong rank")]
    Rank,
    #[error("not a depthwise convolution")]
    NotDepthwise,
    #[error("kernel is not 3x3")]
    KernelSize,
    #[error("anisotropic stride")]
    Stride,
    #[error("anisotropic padding")]
    Padding,
    #[error("dilation is not 1")]
    Dilation,
}

/// depthwise特殊化パスのサポート判定
///
/// 条件を順に検査し、最初に失敗した理由を`diag`へ報告してfalseを返す。
/// 全条件を満たす場合のみtrue。判定は純粋で、`diag`の呼び出し以外の
/// 副作用を持たない。
pub fn conv2d_is_supported(
    input: &TensorMeta,
    weight: &TensorMeta,
    bias: &TensorMeta,
    params: &Conv2dParams,
    diag: &mut dyn FnMut(UnsupportedConv2d),
) -> bool {
    if input.dtype != DType::F32 || weight.dtype != DType::F32 || bias.dtype != DType::F32 {
        diag(UnsupportedConv2d::Dtype);
        return false;
    }
    if input.dims.len() != 4 || weight.dims.len() != 4 || bias.dims.len() != 1 {
        diag(UnsupportedConv2d::Rank);
        return false;
    }
    let c_in = input.dims[1];
    let c_out = weight.dims[0];
    let c_per_group = weight.dims[1];
    if c_in != c_out || c_in != params.groups || c_per_group != 1 {
        diag(UnsupportedConv2d::NotDepthwise);
        return false;
    }
    let kh = weight.dims[2];
    let kw = weight.dims[3];
    if kh != 3 || kw != 3 {
        diag(UnsupportedConv2d::KernelSize);
        return false;
    }
    if params.stride[0] != params.stride[1] {
        diag(UnsupportedConv2d::Stride);
        return false;
    }
    if params.padding[0] != params.padding[1] {
        diag(UnsupportedConv2d::Padding);
        return false;
    }
    if params.dilation[0] != 1 || params.dilation[1] != 1 {
        diag(UnsupportedConv2d::Dilation);
        return false;
    }
    true
}

/// depthwise縮約の寄与式を構築するクロージャを生成
///
/// 静的・動的の両バリアントで共有される核となる代数。
/// 入力空間オフセットは ih = oh*stride - pad + r, iw = ow*stride - pad + s。
/// 4条件の境界判定 (ih < 0 || iw < 0 || ih >= H || iw >= W) が真のとき
/// 入力因子は加法単位元(ゼロパディング)、偽のとき input[n, k, ih, iw]。
/// depthwise制約 C == K により入力のチャネル添字は出力チャネルの k。
fn depthwise_contribution<'a>(
    input: &'a Buffer,
    weight: &'a Buffer,
    stride: AstNode,
    pad: AstNode,
    h: AstNode,
    w: AstNode,
) -> impl Fn(&[AstNode]) -> AstNode + 'a {
    move |v: &[AstNode]| {
        let (n, k, oh, ow) = (v[0].clone(), v[1].clone(), v[2].clone(), v[3].clone());
        let (c, r, s) = (v[4].clone(), v[5].clone(), v[6].clone());

        let ih = oh * stride.clone() - pad.clone() + r.clone();
        let iw = ow * stride.clone() - pad.clone() + s.clone();

        let out_of_bounds = or_(
            or_(lt(ih.clone(), 0), lt(iw.clone(), 0)),
            or_(ge(ih.clone(), h.clone()), ge(iw.clone(), w.clone())),
        );
        let masked_input = select(
            out_of_bounds,
            const_f32(0.0),
            input.load(&[n, k.clone(), ih, iw]),
        );
        masked_input * weight.load(&[k, c, r, s])
    }
}

/// 静的形状のdepthwise conv2dをLoweringする
///
/// 入力・重みの全次元が定数であることを前提とする。depthwise不変条件は
/// サポート判定とは独立にここでも再検証する(このビルダー単体でも安全に
/// 呼び出せるように)。構築後、認識された構成にはループ特殊化を適用する。
///
/// # Panics
/// ランク・定数性・depthwise条件・正方カーネルのいずれかに反する場合。
/// 出力サイズ式が割り切れない組み合わせは検査されない前提条件違反。
pub fn conv2d_depthwise(
    input: &Buffer,
    weight: &Buffer,
    bias: Option<&Buffer>,
    stride: isize,
    pad: isize,
    groups: isize,
) -> Lowered {
    assert_eq!(input.ndim(), 4, "depthwise conv2d input must be rank 4");
    assert_eq!(weight.ndim(), 4, "depthwise conv2d weight must be rank 4");

    let n = input.dim(0).expect_const("input batch dim");
    let c = input.dim(1).expect_const("input channel dim");
    let h = input.dim(2).expect_const("input height dim");
    let w = input.dim(3).expect_const("input width dim");

    let k = weight.dim(0).expect_const("weight output-channel dim");
    let c_per_group = weight.dim(1).expect_const("weight channels-per-group dim");
    let r = weight.dim(2).expect_const("weight kernel-height dim");
    let s = weight.dim(3).expect_const("weight kernel-width dim");

    if let Some(b) = bias {
        assert!(b.is_static(), "bias dims must be constant");
    }
    assert!(
        c == k && k == groups && c_per_group == 1,
        "not a depthwise configuration"
    );
    assert_eq!(r, s, "kernel must be square");

    let oh = (h - r + 2 * pad) / stride + 1;
    let ow = (w - s + 2 * pad) / stride + 1;

    let body = depthwise_contribution(
        input,
        weight,
        const_int(stride),
        const_int(pad),
        const_int(h),
        const_int(w),
    );
    let init = bias.map(|b| {
        Box::new(move |v: &[AstNode]| b.load(&[v[1].clone()]))
            as Box<dyn Fn(&[AstNode]) -> AstNode + '_>
    });

    let lowered = reduce(
        "conv2d_depthwise",
        DType::F32,
        &[
            (Expr::Const(n), "n"),
            (Expr::Const(k), "k"),
            (Expr::Const(oh), "oh"),
            (Expr::Const(ow), "ow"),
        ],
        ReduceOp::Sum,
        init.as_deref(),
        body,
        &[
            (Expr::Const(c / groups), "c"),
            (Expr::Const(r), "r"),
            (Expr::Const(s), "s"),
        ],
    );

    let ComputeStmt::Loops(root) = lowered.stmt else {
        unreachable!("reduce always produces a loop nest");
    };
    let mut nest = LoopNest::new(root);
    specialize_depthwise_loops(&mut nest, &lowered.buf, r, stride, pad);

    Lowered {
        buf: lowered.buf,
        stmt: ComputeStmt::Loops(nest.into_root()),
    }
}

/// シンボリック形状のdepthwise conv2dをLoweringする
///
/// 静的バリアントと同一の代数だが、全範囲とパラメータがシンボリック式の
/// まま残る。定数形状の検証は行わず、ループ特殊化も適用しない
/// (変換には既知の境界が必要)。
pub fn conv2d_depthwise_dynamic(
    input: &Buffer,
    weight: &Buffer,
    bias: Option<&Buffer>,
    stride: Expr,
    pad: Expr,
    groups: Expr,
) -> Lowered {
    assert_eq!(input.ndim(), 4, "depthwise conv2d input must be rank 4");
    assert_eq!(weight.ndim(), 4, "depthwise conv2d weight must be rank 4");

    let n = input.dim(0).clone();
    let c = input.dim(1).clone();
    let h = input.dim(2).clone();
    let w = input.dim(3).clone();

    let k = weight.dim(0).clone();
    let r = weight.dim(2).clone();
    let s = weight.dim(3).clone();

    let oh = (h.clone() - r.clone() + pad.clone() * 2) / stride.clone() + 1;
    let ow = (w.clone() - s.clone() + pad.clone() * 2) / stride.clone() + 1;

    let body = depthwise_contribution(
        input,
        weight,
        stride.into(),
        pad.into(),
        h.into(),
        w.into(),
    );
    let init = bias.map(|b| {
        Box::new(move |v: &[AstNode]| b.load(&[v[1].clone()]))
            as Box<dyn Fn(&[AstNode]) -> AstNode + '_>
    });

    reduce(
        "conv2d_depthwise",
        DType::F32,
        &[(n, "n"), (k, "k"), (oh, "oh"), (ow, "ow")],
        ReduceOp::Sum,
        init.as_deref(),
        body,
        &[(c / groups, "c"), (r, "r"), (s, "s")],
    )
}

// 縮約ネストの外側ループ列における出力空間ループの固定位置 [n, k, oh, ow]
const LOOP_OH: usize = 2;
const LOOP_OW: usize = 3;

/// 認識された構成に対してループ分割を適用する
///
/// ちょうど1つの規則を優先順で適用する:
///
/// - `R == 3 && stride == 2 && pad == 1`: 出力幅・出力高さループの先頭2
///   反復を切り出す。この構成ではマスク条件が真になり得るのは各空間次元の
///   先頭2出力位置だけなので、残りの反復では境界判定が常に偽になる。
/// - `R == 3 && stride == 1 && pad == 1`: 縮約ネスト(出力バッファへ書き込む
///   ループネストのうち2本目)の出力幅ループの先頭1・末尾1反復を切り出し、
///   その親(出力高さ)ループにも同じ操作を繰り返す。4辺の境界行・列が
///   内側から分離される。
/// - どちらにも一致しない場合はループネストを変更しない。マスクが全アクセス
///   を保護しているので正しさは変わらない。
///
/// 変換は結果を変えない。分割前後のループネストが同一の出力を生成する
/// ことはテストで検証される。
pub fn specialize_depthwise_loops(
    nest: &mut LoopNest,
    buf: &Buffer,
    r: isize,
    stride: isize,
    pad: isize,
) {
    if r == 3 && stride == 2 && pad == 1 {
        log::debug!(
            "conv2d: peeling 2 head iterations off the output loops of {}",
            buf.name()
        );
        let nests = nest.loop_nests_writing_to(buf.name());
        if let Some(chain) = nests.last()
            && chain.len() > LOOP_OW
        {
            nest.slice_head(&chain[LOOP_OW], 2);
        }
        let nests = nest.loop_nests_writing_to(buf.name());
        if let Some(chain) = nests.last()
            && chain.len() > LOOP_OH
        {
            nest.slice_head(&chain[LOOP_OH], 2);
        }
    } else if r == 3 && stride == 1 && pad == 1 {
        log::debug!(
            "conv2d: peeling the boundary iterations off the output loops of {}",
            buf.name()
        );
        let nests = nest.loop_nests_writing_to(buf.name());
        let Some(chain) = nests.get(1) else {
            return;
        };
        if chain.len() <= LOOP_OW {
            return;
        }

        let mut main = chain[LOOP_OW].clone();
        let Some((_, tail)) = nest.slice_head(&main, 1) else {
            return;
        };
        main = tail;
        let Some((kept, _)) = nest.slice_tail(&main, 1) else {
            return;
        };
        main = kept;

        let Some(parent) = nest.parent_loop(&main) else {
            return;
        };
        let Some((_, tail)) = nest.slice_head(&parent, 1) else {
            return;
        };
        nest.slice_tail(&tail, 1);
    }
}

/// conv2d演算子のLoweringディスパッチャ
///
/// 3オペランドすべての静的メタデータが取得でき、かつサポート判定が
/// 通る場合のみ特殊化パスを使う。それ以外は結果バッファに対する
/// 外部ルーチン呼び出しを発行する。フォールバックはエラーではなく
/// 設計された無音の分岐。
pub fn lower_conv2d(
    input: &Buffer,
    weight: &Buffer,
    bias: &Buffer,
    params: &Conv2dParams,
    output_shape: &[Expr],
    output_dtype: Option<DType>,
) -> Lowered {
    let dtype = output_dtype.unwrap_or(DType::F32);

    if let (Some(input_meta), Some(weight_meta), Some(bias_meta)) =
        (input.meta(), weight.meta(), bias.meta())
        && conv2d_is_supported(&input_meta, &weight_meta, &bias_meta, params, &mut |reason| {
            log::debug!("conv2d: specialized lowering rejected: {}", reason);
        })
    {
        return conv2d_depthwise(
            input,
            weight,
            Some(bias),
            params.stride[0],
            params.padding[0],
            params.groups,
        );
    }

    Lowered {
        buf: Buffer::new("conv", output_shape.to_vec(), dtype),
        stmt: ComputeStmt::Extern {
            routine: CONV2D_EXTERN.to_string(),
            buffer_args: vec![input.clone(), weight.clone(), bias.clone()],
            scalar_args: params.flat_scalars(),
        },
    }
}

/// prepacked conv2d+clampのLowering (純粋なパススルー)
pub fn lower_prepacked_conv2d_clamp_run(
    input: &Buffer,
    prepacked: &Buffer,
    output_shape: &[Expr],
    output_dtype: Option<DType>,
) -> Lowered {
    let dtype = output_dtype.unwrap_or(DType::F32);
    Lowered {
        buf: Buffer::new("prepacked_conv2d_clamp_run", output_shape.to_vec(), dtype),
        stmt: ComputeStmt::Extern {
            routine: PREPACKED_CONV2D_CLAMP_RUN_EXTERN.to_string(),
            buffer_args: vec![input.clone(), prepacked.clone()],
            scalar_args: vec![],
        },
    }
}

/// prepacked linear+clampのLowering (純粋なパススルー)
pub fn lower_prepacked_linear_clamp_run(
    input: &Buffer,
    prepacked: &Buffer,
    output_shape: &[Expr],
    output_dtype: Option<DType>,
) -> Lowered {
    let dtype = output_dtype.unwrap_or(DType::F32);
    Lowered {
        buf: Buffer::new("prepacked_linear_clamp_run", output_shape.to_vec(), dtype),
        stmt: ComputeStmt::Extern {
            routine: PREPACKED_LINEAR_CLAMP_RUN_EXTERN.to_string(),
            buffer_args: vec![input.clone(), prepacked.clone()],
            scalar_args: vec![],
        },
    }
}
