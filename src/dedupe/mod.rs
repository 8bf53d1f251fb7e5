//! コンテンツハッシュ単位の重複排除調停(ハッシュロック).
//!
//! 同一の内容を書き込もうとする並行リクエスト群は、
//! コンテンツハッシュをキーとする一つの[`HashLock`の状態機械][state]へと集約される.
//! これにより、重複排除インデックスへの問い合わせ・候補ブロックの読み出し検証・
//! 新規データの書き込みが、ハッシュ毎に一度だけ行われる.
//!
//! # 状態機械の概要
//!
//! ロックは開始(`Initializing`)と終了(`Destroying`)を除き、
//! 常に何らかの非同期処理の実行中を表す状態を取る.
//! `Deduping`以外の状態では、単一のメンバー(**エージェント**)が
//! ロックを代表して非同期処理を進め、残りのメンバーは待機キューで待つ.
//! `Deduping`に入るとロックは共有モードとなり、
//! 全メンバーが単一の重複ブロックに対する参照追加を並行して行う.
//!
//! 候補ブロックの参照増加枠が尽きた場合には、ロックの**fork**が起きる:
//! 新しいロックがマップ上で旧ロックを置き換え、待機者はそちらへ移って
//! 新しいコピーの書き込みへと進む. インデックスの更新権は新しいロックだけが持つ.
//!
//! # 非同期処理の駆動
//!
//! 各状態の非同期処理は[`DedupeAction`]として
//! [`HashZone::poll_action`]から取り出され、利用者側の実行基盤が
//! 対象の処理(インデックス問い合わせ・書き込み・検証・ロック取得等)を
//! 適切なスレッドで実行した上で、対応する`finish_*` /
//! `continue_hash_lock`を(再び)ハッシュゾーンのスレッド上で呼び出す.
//!
//! [state]: ./enum.HashLockState.html
//! [`DedupeAction`]: ./enum.DedupeAction.html
//! [`HashZone::poll_action`]: ./struct.HashZone.html#method.poll_action
use std::sync::Arc;

pub use self::hash_lock::HashLockState;
pub use self::pbn_lock::{PbnLock, PbnLockType, PhysicalZone};
pub use self::zone::{AcquireResult, DedupeAction, HashZone, HashZoneBuilder, VioId};

use crate::address::Pbn;
use crate::Result;

mod hash_lock;
mod pbn_lock;
mod zone;

/// スラブデポ(物理割り当て層)との連携インターフェース.
pub trait SlabDepot {
    /// `pbn`が追加で受け入れられる参照の数を返す.
    fn get_increment_limit(&self, pbn: Pbn) -> u32;

    /// `pbn`に対する仮参照を取得する.
    ///
    /// 成功時には`lock`に仮参照の保持が記録される.
    /// 仮参照は、リードロックの解放までの間ブロックが回収されないことを保証する.
    fn acquire_provisional_reference(&mut self, pbn: Pbn, lock: &Arc<PbnLock>) -> Result<()>;
}
