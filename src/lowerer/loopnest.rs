//! ループネストと分割(peeling)変換
//!
//! Loweringが構築した文ツリーを所有し、ループの先頭/末尾の反復を
//! 別ループとして切り出す変換をインプレースで適用します。
//! ループはツリー内のパス([`LoopId`])で指し示し、分割後は新しい
//! 2つのループのハンドルを返します。分割済みループへの古いハンドルを
//! 使い続けることはできません(兄弟・祖先のハンドルは影響を受けません)。

use crate::ast::helper::{block, const_int};
use crate::ast::AstNode;

/// ループネスト内のループを指すハンドル
///
/// ルートからの子インデックスのパス。`Block`では文の位置、
/// `Range`では本体(常に0)を指す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopId(Vec<usize>);

impl LoopId {
    fn child(&self, index: usize) -> LoopId {
        let mut path = self.0.clone();
        path.push(index);
        LoopId(path)
    }
}

/// 所有された文ツリーとしてのループネスト
#[derive(Debug, Clone, PartialEq)]
pub struct LoopNest {
    root: AstNode,
}

impl LoopNest {
    pub fn new(root: AstNode) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &AstNode {
        &self.root
    }

    pub fn into_root(self) -> AstNode {
        self.root
    }

    fn node(&self, id: &LoopId) -> Option<&AstNode> {
        let mut node = &self.root;
        for &index in &id.0 {
            node = child(node, index)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, id: &LoopId) -> Option<&mut AstNode> {
        let mut node = &mut self.root;
        for &index in &id.0 {
            node = child_mut(node, index)?;
        }
        Some(node)
    }

    /// 指定バッファへ書き込む全ループネストの、外側から内側へのループ列
    ///
    /// 各ネストの「列」は左端(最初に現れる書き込み側)の鎖をたどる。
    /// 縮約Loweringでは [初期化ネスト, 縮約ネスト] の2本が返る。
    pub fn loop_nests_writing_to(&self, buf: &str) -> Vec<Vec<LoopId>> {
        let mut tops = Vec::new();
        collect_top_loops(&self.root, LoopId(Vec::new()), buf, &mut tops);

        tops.into_iter()
            .map(|top| {
                let mut chain = vec![top.clone()];
                let mut current = top;
                while let Some(next) = self.first_inner_loop(&current, buf) {
                    chain.push(next.clone());
                    current = next;
                }
                chain
            })
            .collect()
    }

    /// 指定ループの直近の親ループを取得
    pub fn parent_loop(&self, id: &LoopId) -> Option<LoopId> {
        let mut path = id.0.clone();
        while !path.is_empty() {
            path.pop();
            let candidate = LoopId(path.clone());
            if matches!(self.node(&candidate), Some(AstNode::Range { .. })) {
                return Some(candidate);
            }
        }
        None
    }

    /// ループ先頭の `n` 反復を別ループとして切り出す
    ///
    /// `for v in start..stop` を `{ for v in start..mid; for v in mid..stop }`
    /// (mid = min(start+n, stop)) に置き換え、(先頭ループ, 残りループ) の
    /// ハンドルを返す。境界が定数でないループやステップが1でないループは
    /// 変換せず None を返す。
    pub fn slice_head(&mut self, id: &LoopId, n: isize) -> Option<(LoopId, LoopId)> {
        self.slice(id, n, true)
    }

    /// ループ末尾の `n` 反復を別ループとして切り出す
    ///
    /// (残りループ, 末尾ループ) のハンドルを返す。
    pub fn slice_tail(&mut self, id: &LoopId, n: isize) -> Option<(LoopId, LoopId)> {
        self.slice(id, n, false)
    }

    fn slice(&mut self, id: &LoopId, n: isize, head: bool) -> Option<(LoopId, LoopId)> {
        let node = self.node_mut(id)?;
        let AstNode::Range {
            var,
            start,
            step,
            stop,
            body,
        } = &mut *node
        else {
            return None;
        };

        if step.as_const_int() != Some(1) {
            log::trace!("skipping slice of loop {} with step != 1", var);
            return None;
        }
        let (Some(start_v), Some(stop_v)) = (start.as_const_int(), stop.as_const_int()) else {
            log::trace!("skipping slice of loop {} with non-constant bounds", var);
            return None;
        };

        // 切断点はループ範囲内にクランプする
        let mid = if head {
            (start_v + n).min(stop_v)
        } else {
            (stop_v - n).max(start_v)
        };
        log::debug!(
            "slicing {} of loop {} [{}, {}) at {}",
            if head { "head" } else { "tail" },
            var,
            start_v,
            stop_v,
            mid
        );

        let first = AstNode::Range {
            var: var.clone(),
            start: Box::new(const_int(start_v)),
            step: step.clone(),
            stop: Box::new(const_int(mid)),
            body: body.clone(),
        };
        let second = AstNode::Range {
            var: var.clone(),
            start: Box::new(const_int(mid)),
            step: step.clone(),
            stop: Box::new(const_int(stop_v)),
            body: body.clone(),
        };
        *node = block(vec![first, second]);

        Some((id.child(0), id.child(1)))
    }

    /// 指定ループの本体から、バッファへ書き込む最初の内側ループを探す
    ///
    /// ブロックは順にたどるが、見つかったループの中へは降りない。
    fn first_inner_loop(&self, id: &LoopId, buf: &str) -> Option<LoopId> {
        let AstNode::Range { .. } = self.node(id)? else {
            return None;
        };
        find_first_loop(self.node(&id.child(0))?, id.child(0), buf)
    }
}

fn child(node: &AstNode, index: usize) -> Option<&AstNode> {
    match node {
        AstNode::Block { statements } => statements.get(index),
        AstNode::Range { body, .. } => (index == 0).then_some(body.as_ref()),
        _ => None,
    }
}

fn child_mut(node: &mut AstNode, index: usize) -> Option<&mut AstNode> {
    match node {
        AstNode::Block { statements } => statements.get_mut(index),
        AstNode::Range { body, .. } => (index == 0).then_some(body.as_mut()),
        _ => None,
    }
}

/// 部分木が指定バッファへのStoreを含むか
fn writes_to(node: &AstNode, buf: &str) -> bool {
    match node {
        AstNode::Store { ptr, .. } => {
            matches!(ptr.as_ref(), AstNode::Var(name) if name == buf)
        }
        AstNode::Block { statements } => statements.iter().any(|s| writes_to(s, buf)),
        AstNode::Range { body, .. } => writes_to(body, buf),
        _ => false,
    }
}

/// ブロック直下の(ループの外にある)トップレベルループを収集する
fn collect_top_loops(node: &AstNode, id: LoopId, buf: &str, out: &mut Vec<LoopId>) {
    match node {
        AstNode::Block { statements } => {
            for (index, stmt) in statements.iter().enumerate() {
                collect_top_loops(stmt, id.child(index), buf, out);
            }
        }
        AstNode::Range { .. } if writes_to(node, buf) => out.push(id),
        _ => {}
    }
}

/// ブロックを順にたどり、バッファへ書き込む最初のループを返す
fn find_first_loop(node: &AstNode, id: LoopId, buf: &str) -> Option<LoopId> {
    match node {
        AstNode::Range { .. } if writes_to(node, buf) => Some(id),
        AstNode::Block { statements } => statements
            .iter()
            .enumerate()
            .find_map(|(index, stmt)| find_first_loop(stmt, id.child(index), buf)),
        _ => None,
    }
}
