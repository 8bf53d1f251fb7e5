//! Deduplicating block-storage core.
//!
//! `dedupvd`は、ブロックデバイス上で重複排除付きの書き込みを
//! クラッシュ一貫性を保ちながら並行実行するための、二つの密結合したコア層を提供するcrate.
//!
//! # 特徴
//!
//! - **リカバリジャーナル([journal])**:
//!   専用パーティション上の循環型write-aheadログ
//!   - 書き込み毎の参照カウント増減分をジャーナルエントリとして記録する
//!   - ジャーナル容量による書き込み流入制御(バックプレッシャー)を行う
//!   - コミット完了の通知は`(シーケンス番号, エントリ番号)`の昇順であることが保証される
//!   - 下流(ブロックマップ・スラブジャーナル)がブロックを参照しなくなった時点で領域を回収(reap)する
//! - **ハッシュロック([dedupe])**:
//!   コンテンツハッシュ毎の状態機械
//!   - 同一データを書き込む並行リクエスト群を一つのロックに集約し、
//!     物理ブロックのリードロック・インデックス問い合わせ・新規書き込みを共有する
//!   - 参照カウントの増加枠が尽きた場合には新しいロックへのロールオーバー(fork)を行う
//!
//! # モジュールの依存関係
//!
//! ```text
//! journal => layer
//! dedupe  => (journalの参照ハンドル経由で連携)
//! ```
//!
//! # スレッドモデル
//!
//! 本crate自体はスレッドを起動しない。各コンポーネントは「単一のスレッドに
//! 所有されること」を前提に設計されており、利用者側の実行基盤が
//! それぞれの専用スレッド上でメソッドを呼び出す:
//!
//! - ジャーナルスレッド: [`RecoveryJournal`]の全ての更新操作
//! - ハッシュゾーンスレッド: [`HashZone`]および各ハッシュロックの状態遷移
//! - 物理ゾーンスレッド: [`PhysicalZone`]とPBNロックの取得・解放
//!
//! スレッド間の連携は、完了通知([completion])・アクションキュー
//! ([`DedupeAction`])・アトミックな参照カウンタ([`LockCounter`])のみを介して行う。
//!
//! [journal]: ./journal/index.html
//! [dedupe]: ./dedupe/index.html
//! [completion]: ./completion/index.html
//! [`RecoveryJournal`]: ./journal/struct.RecoveryJournal.html
//! [`HashZone`]: ./dedupe/struct.HashZone.html
//! [`PhysicalZone`]: ./dedupe/struct.PhysicalZone.html
//! [`DedupeAction`]: ./dedupe/enum.DedupeAction.html
//! [`LockCounter`]: ./journal/struct.LockCounter.html
#![warn(missing_docs)]
extern crate adler32;
extern crate byteorder;
extern crate futures;
extern crate libc;
extern crate prometrics;
#[macro_use]
extern crate slog;
#[cfg(test)]
extern crate tempdir;
#[macro_use]
extern crate trackable;

pub use crate::error::{Error, ErrorKind};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod address;
pub mod admin;
pub mod buffer;
pub mod completion;
pub mod dedupe;
pub mod journal;
pub mod layer;
pub mod metrics;
pub mod notifier;
pub mod vio;
pub mod wait_queue;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
