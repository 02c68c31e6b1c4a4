//! 名前付きバッファの記述子
//!
//! Loweringの入出力となるテンソルバッファを表します。形状は次元ごとの
//! [`Expr`]で保持し、全次元が定数のときだけ静的形状として扱われます。

use crate::ast::helper::{const_int, load, var};
use crate::ast::{AstNode, DType};
use crate::shape::Expr;

/// 静的形状のオペランドメタデータ
///
/// 全次元が定数のバッファから抽出され、サポート判定(oracle)の入力になる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    pub dims: Vec<isize>,
    pub dtype: DType,
}

/// 名前付きバッファ
///
/// 行メジャー(連続)レイアウトを前提とし、多次元インデックスは
/// [`Buffer::flat_offset`]でフラットなオフセット式に変換される。
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    name: String,
    dtype: DType,
    dims: Vec<Expr>,
}

impl Buffer {
    pub fn new(name: impl Into<String>, dims: Vec<Expr>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            dims,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Expr] {
        &self.dims
    }

    /// 指定軸の次元サイズを取得
    ///
    /// # Panics
    /// 軸が範囲外の場合にパニックします。
    pub fn dim(&self, axis: usize) -> &Expr {
        &self.dims[axis]
    }

    /// 全次元が定数かどうか
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|d| d.as_const().is_some())
    }

    /// 静的形状のメタデータを抽出する
    ///
    /// シンボリックな次元を含む場合は None を返します。
    pub fn meta(&self) -> Option<TensorMeta> {
        let dims = self
            .dims
            .iter()
            .map(|d| d.as_const())
            .collect::<Option<Vec<isize>>>()?;
        Some(TensorMeta {
            dims,
            dtype: self.dtype.clone(),
        })
    }

    /// 多次元インデックスをフラットオフセット式に変換する
    ///
    /// 行メジャーの連続レイアウト: offset = i0*d1*...*dn + ... + i(n-1)。
    /// ストライドは形状式の積として構築し、定数形状なら定数に簡約される。
    ///
    /// # Panics
    /// インデックス数がランクと一致しない場合にパニックします。
    pub fn flat_offset(&self, indices: &[AstNode]) -> AstNode {
        assert_eq!(
            indices.len(),
            self.ndim(),
            "index count must match buffer rank"
        );

        let ndim = self.ndim();
        if ndim == 0 {
            return const_int(0);
        }

        let mut offset = indices[ndim - 1].clone();
        for axis in (0..ndim - 1).rev() {
            let mut stride = self.dims[axis + 1].clone();
            for inner_axis in (axis + 2)..ndim {
                stride = stride * self.dims[inner_axis].clone();
            }
            let stride_node: AstNode = stride.into();
            offset = indices[axis].clone() * stride_node + offset;
        }

        offset
    }

    /// 多次元インデックスでの読み込みノードを生成する
    pub fn load(&self, indices: &[AstNode]) -> AstNode {
        load(
            var(self.name.clone()),
            self.flat_offset(indices),
            self.dtype.clone(),
        )
    }
}
