//! 物理I/O層のインターフェース定義と実装群.
//!
//! このモジュールは[RecoveryJournal](../journal/struct.RecoveryJournal.html)が
//! ジャーナルブロックの書き込みとフラッシュに使用する永続化層を提供する.
//!
//! I/Oの発行(`submit_*`)と完了の受領(`poll_completion`)は分離されており、
//! ジャーナルは複数のブロック書き込みを同時に発行できる.
//! 完了はジャーナルスレッド上で`poll_completion`を呼び出すことで受け取る.
pub use self::file::{FileLayer, FileLayerBuilder};
pub use self::memory::MemoryLayer;

use crate::Result;

mod file;
mod memory;

/// デバイスブロックのサイズ(バイト単位).
///
/// ジャーナルブロックは常にこのサイズで読み書きされる.
pub const BLOCK_SIZE: usize = 4096;

/// 書き込みポリシー.
///
/// ジャーナルのコミットと領域回収の際のフラッシュ発行方針を決定する.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// 全てのブロック書き込みの前にフラッシュが発行される.
    ///
    /// 書き込み完了の時点で、それ以前の全ての書き込みの永続化が保証されるため、
    /// 領域回収時に追加のフラッシュは不要となる.
    Sync,

    /// 書き込みとフラッシュを分離し、バッチ化する.
    ///
    /// 満杯のブロック群は、先行する書き込みが完了した時点でまとめて発行される.
    /// 領域回収の前には明示的なフラッシュが必要となる.
    Async,

    /// `Async`と同様だが、満杯のブロックを即座に発行する.
    AsyncUnsafe,
}

/// 発行したI/Oを識別するためのトークン.
///
/// 完了通知([`IoCompletion`])で同じ値が返される.
///
/// [`IoCompletion`]: ./struct.IoCompletion.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoToken {
    /// ジャーナルブロックの書き込み.
    ///
    /// `buffer`は発行側が管理するバッファの識別子.
    BlockWrite {
        /// 発行側が管理するバッファの識別子.
        buffer: usize,
    },

    /// デバイスフラッシュ.
    Flush,
}

/// I/Oの完了通知.
#[derive(Debug)]
pub struct IoCompletion {
    /// 発行時に指定されたトークン.
    pub token: IoToken,

    /// I/Oの実行結果.
    pub result: Result<()>,
}

/// 物理I/O層を表すトレイト.
///
/// 実装は、発行されたI/Oを任意のタイミングで実行して構わないが、
/// 以下の性質を満たす必要がある:
///
/// - 同一ブロックに対する書き込みは発行順に実行される
/// - `WritePolicy::Sync`の場合、書き込み完了はそれ以前の全書き込みの永続化を意味する
/// - 完了通知は`poll_completion`からのみ(発行とは非同期に)返される
pub trait PhysicalLayer {
    /// この層の書き込みポリシーを返す.
    fn write_policy(&self) -> WritePolicy;

    /// ジャーナルパーティション内の`block`番目のブロックへの書き込みを発行する.
    ///
    /// `data`の長さは[`BLOCK_SIZE`](./constant.BLOCK_SIZE.html)と等しくなければならない.
    /// 返り値は発行自体の成否であり、I/Oの結果は完了通知で返される.
    fn submit_block_write(&mut self, block: u64, data: &[u8], token: IoToken) -> Result<()>;

    /// デバイスフラッシュを発行する.
    fn submit_flush(&mut self, token: IoToken) -> Result<()>;

    /// 完了済みのI/Oを一つ取り出す.
    fn poll_completion(&mut self) -> Option<IoCompletion>;
}
