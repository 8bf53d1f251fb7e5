use std;
use trackable;
use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(e) = e.get_ref().and_then(|e| e.downcast_ref::<Error>()).cloned() {
            e
        } else if e.kind() == std::io::ErrorKind::InvalidInput {
            ErrorKind::InvalidInput.cause(e).into()
        } else {
            ErrorKind::Other.cause(e).into()
        }
    }
}
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        if *e.kind() == ErrorKind::InvalidInput {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        } else {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        }
    }
}
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ErrorKind::Other.cause(e.to_string()).into()
    }
}

/// 発生し得るエラーの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// システム全体がリードオンリーモードに移行している.
    ///
    /// 一度このモードに入った後は、新規のエントリ追加は全て失敗し、
    /// 処理途中のリクエスト群もこのエラーで完了させられる.
    ///
    /// # 典型的な対応策
    ///
    /// - 構成を保存した上で再起動し、リカバリ(リプレイ)を実行する
    ReadOnly,

    /// ジャーナルのシーケンス番号が上限(2^48)を超過した.
    ///
    /// このエラーの発生と同時にリードオンリーモードへと移行する.
    JournalOverflow,

    /// デクリメントエントリ用に予約されていたはずのジャーナル領域が不足した.
    ///
    /// 流入制御の会計にバグがあることを示しており、
    /// 発生と同時にリードオンリーモードへと移行する.
    JournalFull,

    /// 管理状態が通常運転ではないため、操作を受け付けられない.
    ///
    /// # 典型的な対応策
    ///
    /// - サスペンド・セーブ処理の完了後に`resume`してからリトライする
    InvalidAdminState,

    /// 未実装の操作種別が指定された.
    NotImplemented,

    /// 入力が不正.
    ///
    /// 永続化された状態のデコード時にヘッダの不一致を検出した場合等に返される.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 内部状態が不整合に陥っている.
    ///
    /// プログラムにバグがあることを示している.
    ///
    /// # 典型的な対応策
    ///
    /// - バグ修正を行ってプログラムを更新する
    InconsistentState,

    /// その他エラー.
    ///
    /// E.g., I/Oエラー
    Other,
}
impl trackable::error::ErrorKind for ErrorKind {}
