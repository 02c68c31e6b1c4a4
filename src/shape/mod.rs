//! テンソル形状の表現
//!
//! 各次元サイズはコンパイル時定数またはシンボリック式([`Expr`])として
//! 表現されます。

mod expr;

pub use expr::Expr;
