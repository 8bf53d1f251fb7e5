//! 書き込みリクエスト(DataVio)と、その参照カウント操作の表現.
use std::fmt;
use std::sync::Arc;

use crate::address::{Lbn, Pbn};
use crate::completion::{AsyncReply, AsyncResult};
use crate::dedupe::PbnLock;
use crate::journal::JournalPoint;
use crate::{Error, Result};

/// ブロック内容のコンテンツハッシュ(128bit).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 16]);
impl ContentDigest {
    /// バイト列からダイジェストを生成する.
    pub fn new(bytes: [u8; 16]) -> Self {
        ContentDigest(bytes)
    }

    /// ダイジェストのバイト列を返す.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}
impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ContentDigest(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// ジャーナルに記録される参照カウント操作の種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOperation {
    /// データブロックへの参照の削減.
    DataDecrement,

    /// データブロックへの参照の追加.
    DataIncrement,

    /// ブロックマップページへの参照の削減.
    ///
    /// 稼働中のジャーナルでは発生せず、エントリとしての割り当ては常に失敗する.
    BlockMapDecrement,

    /// ブロックマップページへの参照の追加.
    BlockMapIncrement,
}
impl JournalOperation {
    /// 参照を増やす操作かどうかを判定する.
    pub fn is_increment(self) -> bool {
        match self {
            JournalOperation::DataIncrement | JournalOperation::BlockMapIncrement => true,
            _ => false,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            JournalOperation::DataDecrement => 0,
            JournalOperation::DataIncrement => 1,
            JournalOperation::BlockMapDecrement => 2,
            JournalOperation::BlockMapIncrement => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(JournalOperation::DataDecrement),
            1 => Some(JournalOperation::DataIncrement),
            2 => Some(JournalOperation::BlockMapDecrement),
            3 => Some(JournalOperation::BlockMapIncrement),
            _ => None,
        }
    }
}

/// ブロックマップ上でのマッピング状態.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// 未割り当て.
    Unmapped,

    /// 非圧縮データとして割り当て済み.
    Uncompressed,

    /// 圧縮ブロック内のスロットとして割り当て済み.
    ///
    /// 値は圧縮ブロック内のスロット番号(`0..=13`).
    Compressed(u8),
}
impl MappingState {
    /// 圧縮状態かどうかを判定する.
    pub fn is_compressed(self) -> bool {
        match self {
            MappingState::Compressed(_) => true,
            _ => false,
        }
    }

    /// 未割り当て状態かどうかを判定する.
    pub fn is_unmapped(self) -> bool {
        self == MappingState::Unmapped
    }

    pub(crate) fn to_nibble(self) -> u8 {
        match self {
            MappingState::Unmapped => 0,
            MappingState::Uncompressed => 1,
            MappingState::Compressed(slot) => 2 + slot,
        }
    }

    pub(crate) fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0 => Some(MappingState::Unmapped),
            1 => Some(MappingState::Uncompressed),
            2..=15 => Some(MappingState::Compressed(value - 2)),
            _ => None,
        }
    }
}

/// マッピング状態付きの物理ブロック位置.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLocation {
    /// 物理ブロック番号.
    pub pbn: Pbn,

    /// マッピング状態.
    pub state: MappingState,
}
impl DataLocation {
    /// 新しい`DataLocation`を生成する.
    pub fn new(pbn: Pbn, state: MappingState) -> Self {
        DataLocation { pbn, state }
    }
}

/// 一つのジャーナルエントリに対応する参照カウント操作.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceOperation {
    /// 操作種別.
    pub kind: JournalOperation,

    /// 操作対象の物理ブロック番号.
    pub pbn: Pbn,

    /// 操作対象のマッピング状態.
    pub state: MappingState,
}
impl ReferenceOperation {
    /// 新しい`ReferenceOperation`を生成する.
    pub fn new(kind: JournalOperation, pbn: Pbn, state: MappingState) -> Self {
        ReferenceOperation { kind, pbn, state }
    }
}

/// 圧縮処理(パッカー)との連携状態.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompressionStatus {
    Idle,
    InPacker,
    Canceled,
}

/// 処理中の書き込みリクエスト.
///
/// リクエストの識別情報(論理位置・操作・コンテンツハッシュ)と、
/// 重複排除およびジャーナリングの過程で蓄積される中間状態を保持する.
///
/// 生成時にペアとなる[`AsyncResult`]が返され、
/// リクエストがコア層での処理を終えた時点で
/// (成功時にはこの構造体自身が、失敗時にはエラーが)そこへ通知される.
///
/// [`AsyncResult`]: ../completion/struct.AsyncResult.html
#[derive(Debug)]
pub struct DataVio {
    /// 書き込み先の論理ブロック番号.
    pub logical: Lbn,

    /// ジャーナルに記録する参照カウント操作.
    pub operation: ReferenceOperation,

    /// ブロック内容のコンテンツハッシュ.
    pub digest: ContentDigest,

    /// ブロック内容.
    ///
    /// 重複排除の検証およびハッシュ衝突の検出時の比較に使用される.
    pub data: Arc<Vec<u8>>,

    /// 新規書き込み用に割り当て済みの物理ブロック.
    pub allocation: Option<Pbn>,

    /// 重複排除の候補ブロックが有効であると判断されているかどうか.
    pub is_duplicate: bool,

    /// 重複排除の候補位置(インデックスからのアドバイス、または検証済みの位置).
    pub duplicate: Option<DataLocation>,

    /// 書き込み完了後の新しいマッピング位置.
    pub new_mapped: Option<DataLocation>,

    pub(crate) allocation_lock: Option<Arc<PbnLock>>,
    pub(crate) hash_lock: Option<usize>,
    pub(crate) journal_point: Option<JournalPoint>,
    compression: CompressionStatus,
    error: Option<Error>,
    reply: Option<AsyncReply<DataVio>>,
}
impl DataVio {
    /// 新しい`DataVio`インスタンスと、完了通知の受信側を生成する.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(logical: Lbn, operation: ReferenceOperation) -> (Self, AsyncResult<DataVio>) {
        let (reply, result) = AsyncResult::new();
        let vio = DataVio {
            logical,
            operation,
            digest: ContentDigest::new([0; 16]),
            data: Arc::new(Vec::new()),
            allocation: None,
            is_duplicate: false,
            duplicate: None,
            new_mapped: None,
            allocation_lock: None,
            hash_lock: None,
            journal_point: None,
            compression: CompressionStatus::Idle,
            error: None,
            reply: Some(reply),
        };
        (vio, result)
    }

    /// ジャーナル内でこのリクエストに割り当てられた位置を返す.
    ///
    /// エントリが未割り当ての場合は`None`.
    pub fn journal_point(&self) -> Option<JournalPoint> {
        self.journal_point
    }

    /// 書き込みパスで取得した(リードロックへ降格済みの)PBNロックを引き渡す.
    ///
    /// ハッシュロックはこのロックを重複排除用ロックへと転用する.
    pub fn set_allocation_lock(&mut self, lock: Arc<PbnLock>) {
        self.allocation_lock = Some(lock);
    }

    /// 圧縮待ちでパッカーに入ったことを記録する.
    pub fn enter_packer(&mut self) {
        if self.compression == CompressionStatus::Idle {
            self.compression = CompressionStatus::InPacker;
        }
    }

    /// 圧縮の中止を要求する.
    ///
    /// パッカー内で待機していた場合にのみ`true`を返す.
    pub(crate) fn cancel_compression(&mut self) -> bool {
        let was_in_packer = self.compression == CompressionStatus::InPacker;
        self.compression = CompressionStatus::Canceled;
        was_in_packer
    }

    /// 最初に発生したエラーを記録する(後続のエラーでは上書きされない).
    pub(crate) fn set_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// リクエストを完了させ、生成時のペアである`AsyncResult`へ結果を通知する.
    ///
    /// `set_error`で記録済みのエラーがある場合には、`result`よりもそちらが優先される.
    pub(crate) fn complete(mut self, result: Result<()>) {
        let reply = self.reply.take();
        let stored = self.error.take();
        if let Some(reply) = reply {
            match (stored, result) {
                (Some(e), _) => reply.send_error(e),
                (None, Err(e)) => reply.send_error(e),
                (None, Ok(())) => reply.send(Ok(self)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use trackable::error::ErrorKindExt;

    fn increment(lbn: u32, pbn: u32) -> (DataVio, AsyncResult<DataVio>) {
        DataVio::new(
            Lbn::from(lbn),
            ReferenceOperation::new(
                JournalOperation::DataIncrement,
                Pbn::from(pbn),
                MappingState::Uncompressed,
            ),
        )
    }

    #[test]
    fn operation_predicates() {
        assert!(JournalOperation::DataIncrement.is_increment());
        assert!(JournalOperation::BlockMapIncrement.is_increment());
        assert!(!JournalOperation::DataDecrement.is_increment());
        assert!(!JournalOperation::BlockMapDecrement.is_increment());
    }

    #[test]
    fn mapping_state_nibble_round_trip() {
        for nibble in 0..=15 {
            let state = MappingState::from_nibble(nibble).unwrap();
            assert_eq!(state.to_nibble(), nibble);
        }
        assert!(MappingState::Compressed(0).is_compressed());
        assert!(!MappingState::Uncompressed.is_compressed());
    }

    #[test]
    fn completion_reports_success() {
        let (vio, mut result) = increment(1, 10);
        vio.complete(Ok(()));
        let vio = result.try_take().expect("completed").expect("success");
        assert_eq!(vio.logical, Lbn::from(1));
    }

    #[test]
    fn stored_error_takes_precedence() {
        let (mut vio, mut result) = increment(1, 10);
        vio.set_error(ErrorKind::ReadOnly.error().into());
        vio.set_error(ErrorKind::Other.error().into());
        vio.complete(Ok(()));
        let e = result.try_take().expect("completed").expect_err("error");
        assert_eq!(*e.kind(), ErrorKind::ReadOnly);
    }
}
