use lyra::lowerer::conv2d::{
    CONV2D_EXTERN, PREPACKED_CONV2D_CLAMP_RUN_EXTERN, PREPACKED_LINEAR_CLAMP_RUN_EXTERN,
};
use lyra::prelude::*;
use ndarray::{Array1, Array4};
use rstest::rstest;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn dims(d: &[isize]) -> Vec<Expr> {
    d.iter().map(|&v| Expr::Const(v)).collect()
}

fn static_buffer(name: &str, d: &[isize]) -> Buffer {
    Buffer::new(name, dims(d), DType::F32)
}

/// Deterministic, sign-varying test data.
fn test_data(len: usize, seed: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 31 + seed * 17) % 23) as f32 * 0.25 - 2.5)
        .collect()
}

/// Straightforward depthwise convolution over ndarray, accumulating in the
/// same (r, s ascending) order as the lowered reduction so results match
/// bit for bit.
fn reference_depthwise(
    input: &Array4<f32>,
    weight: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    stride: usize,
    pad: usize,
) -> Array4<f32> {
    let (n, c, h, w) = input.dim();
    let (k, _, r, s) = weight.dim();
    assert_eq!(c, k);

    let oh = (h + 2 * pad - r) / stride + 1;
    let ow = (w + 2 * pad - s) / stride + 1;
    let mut out = Array4::<f32>::zeros((n, k, oh, ow));

    for b in 0..n {
        for g in 0..k {
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = bias.map_or(0.0, |bv| bv[g]);
                    for dy in 0..r {
                        for dx in 0..s {
                            let iy = (y * stride + dy) as isize - pad as isize;
                            let ix = (x * stride + dx) as isize - pad as isize;
                            if iy >= 0 && (iy as usize) < h && ix >= 0 && (ix as usize) < w {
                                acc += input[[b, g, iy as usize, ix as usize]]
                                    * weight[[g, 0, dy, dx]];
                            }
                        }
                    }
                    out[[b, g, y, x]] = acc;
                }
            }
        }
    }
    out
}

/// Evaluate a lowered depthwise conv over the given operand data.
fn run_lowered(
    lowered: &Lowered,
    input_data: &[f32],
    weight_data: &[f32],
    bias_data: Option<&[f32]>,
    out_len: usize,
) -> Vec<f32> {
    let mut ev = Evaluator::new();
    ev.bind("input", input_data.to_vec());
    ev.bind("weight", weight_data.to_vec());
    if let Some(b) = bias_data {
        ev.bind("bias", b.to_vec());
    }
    ev.bind(lowered.buf.name().to_string(), vec![0.0; out_len]);
    ev.run(lowered.loops().expect("expected a loop nest"))
        .expect("evaluation failed");
    ev.buffer(lowered.buf.name()).unwrap().to_vec()
}

fn count_loops_named(node: &AstNode, name: &str) -> usize {
    match node {
        AstNode::Range { var, body, .. } => {
            (var == name) as usize + count_loops_named(body, name)
        }
        AstNode::Block { statements } => {
            statements.iter().map(|s| count_loops_named(s, name)).sum()
        }
        _ => 0,
    }
}

/// The specialized lowering matches the reference convolution for every
/// slicing-rule class, and the transformed (sliced) nest produces exactly
/// the same buffer as the untransformed one (the dynamic variant with
/// constant extents, which never slices).
#[rstest]
#[case::rule_a_head_sliced(2, 1)]
#[case::rule_b_boundary_peeled(1, 1)]
#[case::no_rule_unpadded(1, 0)]
#[case::no_rule_strided_unpadded(2, 0)]
fn depthwise_matches_reference_and_unsliced_form(
    #[case] stride: usize,
    #[case] pad: usize,
    #[values(false, true)] with_bias: bool,
) {
    init_logger();

    let (n, c, h, w) = (2usize, 3usize, 9usize, 9usize);
    let input_data = test_data(n * c * h * w, 1);
    let weight_data = test_data(c * 3 * 3, 2);
    let bias_data = test_data(c, 3);

    let input = static_buffer("input", &[2, 3, 9, 9]);
    let weight = static_buffer("weight", &[3, 1, 3, 3]);
    let bias_buf = static_buffer("bias", &[3]);
    let bias = with_bias.then_some(&bias_buf);

    let sliced = conv2d_depthwise(&input, &weight, bias, stride as isize, pad as isize, 3);
    let unsliced = conv2d_depthwise_dynamic(
        &input,
        &weight,
        bias,
        Expr::Const(stride as isize),
        Expr::Const(pad as isize),
        Expr::Const(3),
    );

    let oh = (h + 2 * pad - 3) / stride + 1;
    let ow = (w + 2 * pad - 3) / stride + 1;
    let out_len = n * c * oh * ow;

    let bias_slice = with_bias.then_some(bias_data.as_slice());
    let got_sliced = run_lowered(&sliced, &input_data, &weight_data, bias_slice, out_len);
    let got_unsliced = run_lowered(&unsliced, &input_data, &weight_data, bias_slice, out_len);

    let input_arr = Array4::from_shape_vec((n, c, h, w), input_data).unwrap();
    let weight_arr = Array4::from_shape_vec((c, 1, 3, 3), weight_data).unwrap();
    let bias_arr = Array1::from_vec(bias_data);
    let expected = reference_depthwise(
        &input_arr,
        &weight_arr,
        with_bias.then_some(&bias_arr),
        stride,
        pad,
    );

    assert_eq!(expected.dim(), (n, c, oh, ow));
    let expected_flat: Vec<f32> = expected.iter().copied().collect();
    assert_eq!(got_sliced, expected_flat);
    assert_eq!(got_sliced, got_unsliced);
}

/// Input [1,4,8,8], weight [4,1,3,3], bias [4], stride 1, pad 1, groups 4:
/// the output shape is [1,4,8,8], and at the top-left corner only the 2x2
/// sub-kernel with r,s in {1,2} contributes.
#[test]
fn top_left_corner_sees_only_the_inner_subkernel() {
    init_logger();

    let input_data = test_data(4 * 8 * 8, 4);
    let weight_data = test_data(4 * 3 * 3, 5);
    let bias_data = test_data(4, 6);

    let input = static_buffer("input", &[1, 4, 8, 8]);
    let weight = static_buffer("weight", &[4, 1, 3, 3]);
    let bias = static_buffer("bias", &[4]);
    let lowered = conv2d_depthwise(&input, &weight, Some(&bias), 1, 1, 4);

    assert_eq!(lowered.buf.dims(), dims(&[1, 4, 8, 8]).as_slice());

    let got = run_lowered(
        &lowered,
        &input_data,
        &weight_data,
        Some(&bias_data),
        4 * 8 * 8,
    );

    let at = |buf: &[f32], k: usize, y: usize, x: usize| buf[(k * 8 + y) * 8 + x];
    for k in 0..4 {
        // bias[k] + sum over r,s >= 1 of input[0,k,r-1,s-1] * weight[k,0,r,s],
        // accumulated in the same r-major order as the lowered loops
        let mut expected = bias_data[k];
        for r in 1..3 {
            for s in 1..3 {
                expected += at(&input_data, k, r - 1, s - 1) * weight_data[(k * 3 + r) * 3 + s];
            }
        }
        assert_eq!(got[k * 8 * 8], expected, "channel {}", k);
    }
}

/// The zero-padding law: a contribution whose input offset falls outside
/// [0,H)x[0,W) is exactly zero regardless of the weight value. With pad 1
/// and hostile weights, the border outputs must not change when the
/// out-of-range weights do.
#[test]
fn out_of_bounds_contributions_are_exactly_zero() {
    init_logger();

    let input = static_buffer("input", &[1, 1, 4, 4]);
    let weight = static_buffer("weight", &[1, 1, 3, 3]);
    let lowered = conv2d_depthwise(&input, &weight, None, 1, 1, 1);

    let input_data = test_data(16, 7);
    let benign: Vec<f32> = vec![1.0; 9];
    let mut hostile = benign.clone();
    hostile[0] = 1.0e30; // the (0,0) tap, out of range at the top-left corner

    let got_benign = run_lowered(&lowered, &input_data, &benign, None, 16);
    let got_hostile = run_lowered(&lowered, &input_data, &hostile, None, 16);

    // corner (0,0) never reads the (0,0) weight tap
    assert_eq!(got_benign[0], got_hostile[0]);
    // the interior does
    assert_ne!(got_benign[5], got_hostile[5]);
}

#[test]
fn oracle_accepts_the_reference_configuration() {
    let input = TensorMeta {
        dims: vec![1, 4, 8, 8],
        dtype: DType::F32,
    };
    let weight = TensorMeta {
        dims: vec![4, 1, 3, 3],
        dtype: DType::F32,
    };
    let bias = TensorMeta {
        dims: vec![4],
        dtype: DType::F32,
    };
    let params = Conv2dParams::isotropic(1, 1, 1, 4);

    let mut reasons = Vec::new();
    assert!(conv2d_is_supported(
        &input,
        &weight,
        &bias,
        &params,
        &mut |r| reasons.push(r)
    ));
    assert!(reasons.is_empty());
}

/// Flipping any single check to a failing value makes the predicate false
/// and reports exactly that check's reason.
#[rstest]
#[case::dtype(
    TensorMeta { dims: vec![1, 4, 8, 8], dtype: DType::Int },
    TensorMeta { dims: vec![4, 1, 3, 3], dtype: DType::F32 },
    TensorMeta { dims: vec![4], dtype: DType::F32 },
    Conv2dParams::isotropic(1, 1, 1, 4),
    UnsupportedConv2d::Dtype
)]
#[case::rank(
    TensorMeta { dims: vec![1, 4, 8, 8], dtype: DType::F32 },
    TensorMeta { dims: vec![4, 1, 3, 3], dtype: DType::F32 },
    TensorMeta { dims: vec![4, 1], dtype: DType::F32 },
    Conv2dParams::isotropic(1, 1, 1, 4),
    UnsupportedConv2d::Rank
)]
#[case::not_depthwise(
    TensorMeta { dims: vec![1, 4, 8, 8], dtype: DType::F32 },
    TensorMeta { dims: vec![4, 1, 3, 3], dtype: DType::F32 },
    TensorMeta { dims: vec![4], dtype: DType::F32 },
    Conv2dParams::isotropic(1, 1, 1, 1),
    UnsupportedConv2d::NotDepthwise
)]
#[case::kernel_size(
    TensorMeta { dims: vec![1, 4, 8, 8], dtype: DType::F32 },
    TensorMeta { dims: vec![4, 1, 5, 5], dtype: DType::F32 },
    TensorMeta { dims: vec![4], dtype: DType::F32 },
    Conv2dParams::isotropic(1, 1, 1, 4),
    UnsupportedConv2d::KernelSize
)]
#[case::stride(
    TensorMeta { dims: vec![1, 4, 8, 8], dtype: DType::F32 },
    TensorMeta { dims: vec![4, 1, 3, 3], dtype: DType::F32 },
    TensorMeta { dims: vec![4], dtype: DType::F32 },
    Conv2dParams::new([1, 2], [1, 1], [1, 1], 4),
    UnsupportedConv2d::Stride
)]
#[case::padding(
    TensorMeta { dims: vec![1, 4, 8, 8], dtype: DType::F32 },
    TensorMeta { dims: vec![4, 1, 3, 3], dtype: DType::F32 },
    TensorMeta { dims: vec![4], dtype: DType::F32 },
    Conv2dParams::new([1, 1], [1, 0], [1, 1], 4),
    UnsupportedConv2d::Padding
)]
#[case::dilation(
    TensorMeta { dims: vec![1, 4, 8, 8], dtype: DType::F32 },
    TensorMeta { dims: vec![4, 1, 3, 3], dtype: DType::F32 },
    TensorMeta { dims: vec![4], dtype: DType::F32 },
    Conv2dParams::new([1, 1], [1, 1], [2, 2], 4),
    UnsupportedConv2d::Dilation
)]
fn oracle_rejects_each_check_in_isolation(
    #[case] input: TensorMeta,
    #[case] weight: TensorMeta,
    #[case] bias: TensorMeta,
    #[case] params: Conv2dParams,
    #[case] expected: UnsupportedConv2d,
) {
    let mut reasons = Vec::new();
    assert!(!conv2d_is_supported(
        &input,
        &weight,
        &bias,
        &params,
        &mut |r| reasons.push(r)
    ));
    assert_eq!(reasons, vec![expected]);
}

/// A rejected configuration dispatches to the external call and never
/// invokes the specialized builder.
#[test]
fn dispatcher_falls_back_when_not_depthwise() {
    init_logger();

    let input = static_buffer("input", &[1, 4, 8, 8]);
    let weight = static_buffer("weight", &[4, 1, 3, 3]);
    let bias = static_buffer("bias", &[4]);
    // groups=1: channels-per-group would be 4, not 1
    let params = Conv2dParams::isotropic(1, 1, 1, 1);

    let lowered = lower_conv2d(&input, &weight, &bias, &params, &dims(&[1, 4, 8, 8]), None);

    assert_eq!(lowered.buf.name(), "conv");
    match &lowered.stmt {
        ComputeStmt::Extern {
            routine,
            buffer_args,
            scalar_args,
        } => {
            assert_eq!(routine, CONV2D_EXTERN);
            let names: Vec<&str> = buffer_args.iter().map(|b| b.name()).collect();
            assert_eq!(names, vec!["input", "weight", "bias"]);
            // {stride_h, stride_w, pad_h, pad_w, dilation_h, dilation_w, groups}
            assert_eq!(scalar_args, &[1, 1, 1, 1, 1, 1, 1]);
        }
        other => panic!("Expected external call, got {:?}", other),
    }
}

#[test]
fn dispatcher_falls_back_on_symbolic_shapes() {
    let input = Buffer::new(
        "input",
        vec![
            Expr::Var("N".to_string()),
            Expr::Const(4),
            Expr::Const(8),
            Expr::Const(8),
        ],
        DType::F32,
    );
    let weight = static_buffer("weight", &[4, 1, 3, 3]);
    let bias = static_buffer("bias", &[4]);
    let params = Conv2dParams::isotropic(1, 1, 1, 4);

    let out_shape = vec![
        Expr::Var("N".to_string()),
        Expr::Const(4),
        Expr::Const(8),
        Expr::Const(8),
    ];
    let lowered = lower_conv2d(&input, &weight, &bias, &params, &out_shape, None);
    assert!(matches!(lowered.stmt, ComputeStmt::Extern { .. }));
}

#[test]
fn dispatcher_takes_the_specialized_path_when_supported() {
    init_logger();

    let input = static_buffer("input", &[1, 4, 8, 8]);
    let weight = static_buffer("weight", &[4, 1, 3, 3]);
    let bias = static_buffer("bias", &[4]);
    let params = Conv2dParams::isotropic(1, 1, 1, 4);

    let lowered = lower_conv2d(&input, &weight, &bias, &params, &dims(&[1, 4, 8, 8]), None);
    assert_eq!(lowered.buf.name(), "conv2d_depthwise");
    assert_eq!(lowered.buf.dims(), dims(&[1, 4, 8, 8]).as_slice());
    assert!(lowered.loops().is_some());
}

/// Rule A (stride 2, pad 1) splits the output-width and output-height loops
/// of the reduction nest into head and tail.
#[test]
fn stride2_pad1_slices_the_output_loops() {
    init_logger();

    let input = static_buffer("input", &[1, 4, 9, 9]);
    let weight = static_buffer("weight", &[4, 1, 3, 3]);
    let lowered = conv2d_depthwise(&input, &weight, None, 2, 1, 4);
    let root = lowered.loops().unwrap();

    // init nest: 1 each; reduction nest: oh split in 2, each containing the
    // split ow pair
    assert_eq!(count_loops_named(root, "oh"), 3);
    assert_eq!(count_loops_named(root, "ow"), 5);
}

/// Rule B (stride 1, pad 1) peels one head and one tail iteration off the
/// output-width loop and its parent.
#[test]
fn stride1_pad1_peels_the_boundary_iterations() {
    init_logger();

    let input = static_buffer("input", &[1, 4, 8, 8]);
    let weight = static_buffer("weight", &[4, 1, 3, 3]);
    let lowered = conv2d_depthwise(&input, &weight, None, 1, 1, 4);
    let root = lowered.loops().unwrap();

    // the reduction nest's oh loop becomes 3 (head/main/tail), each carrying
    // a clone of the 3-way split ow loop; the init nest keeps 1 of each
    assert_eq!(count_loops_named(root, "oh"), 4);
    assert_eq!(count_loops_named(root, "ow"), 10);
}

/// No rule matches: the nest is left as built.
#[test]
fn unrecognized_configuration_is_not_sliced() {
    let input = static_buffer("input", &[1, 4, 9, 9]);
    let weight = static_buffer("weight", &[4, 1, 3, 3]);
    let lowered = conv2d_depthwise(&input, &weight, None, 1, 0, 4);
    let root = lowered.loops().unwrap();

    assert_eq!(count_loops_named(root, "oh"), 2);
    assert_eq!(count_loops_named(root, "ow"), 2);
}

#[rstest]
#[case::conv2d(
    lower_prepacked_conv2d_clamp_run as fn(&Buffer, &Buffer, &[Expr], Option<DType>) -> Lowered,
    PREPACKED_CONV2D_CLAMP_RUN_EXTERN,
    "prepacked_conv2d_clamp_run"
)]
#[case::linear(
    lower_prepacked_linear_clamp_run as fn(&Buffer, &Buffer, &[Expr], Option<DType>) -> Lowered,
    PREPACKED_LINEAR_CLAMP_RUN_EXTERN,
    "prepacked_linear_clamp_run"
)]
fn prepacked_ops_are_pure_external_calls(
    #[case] lower: fn(&Buffer, &Buffer, &[Expr], Option<DType>) -> Lowered,
    #[case] expected_routine: &str,
    #[case] expected_buf: &str,
) {
    let input = static_buffer("input", &[1, 4, 8, 8]);
    let prepacked = static_buffer("prepacked", &[64]);

    let lowered = lower(&input, &prepacked, &dims(&[1, 4, 8, 8]), None);
    assert_eq!(lowered.buf.name(), expected_buf);
    match &lowered.stmt {
        ComputeStmt::Extern {
            routine,
            buffer_args,
            scalar_args,
        } => {
            assert_eq!(routine, expected_routine);
            let names: Vec<&str> = buffer_args.iter().map(|b| b.name()).collect();
            assert_eq!(names, vec!["input", "prepacked"]);
            assert!(scalar_args.is_empty());
        }
        other => panic!("Expected external call, got {:?}", other),
    }
}
