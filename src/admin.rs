//! コンポーネントの管理状態(通常運転・サスペンド・セーブ)の状態機械.
use crate::completion::AsyncReply;
use crate::{Error, ErrorKind, Result};
use trackable::error::ErrorKindExt;

/// 管理状態のコード.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStateCode {
    /// 構築直後で、まだ`open`されていない.
    New,

    /// 通常運転中.
    NormalOperation,

    /// サスペンドに向けたドレイン中.
    Suspending,

    /// サスペンド済み.
    Suspended,

    /// セーブに向けたドレイン中.
    Saving,

    /// セーブ済み.
    Saved,
}
impl AdminStateCode {
    /// ドレイン処理の途中かどうかを判定する.
    pub fn is_draining(self) -> bool {
        match self {
            AdminStateCode::Suspending | AdminStateCode::Saving => true,
            _ => false,
        }
    }

    /// 静止状態(これ以上の内部活動が無い状態)かどうかを判定する.
    pub fn is_quiescent(self) -> bool {
        match self {
            AdminStateCode::Suspended | AdminStateCode::Saved => true,
            _ => false,
        }
    }
}

/// ドレイン操作の種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOperation {
    /// 処理中のリクエストを完了させ、サスペンド状態へ移行する.
    Suspend,

    /// 処理中のリクエストとバッファ内容を全て書き出し、セーブ状態へ移行する.
    Save,
}
impl DrainOperation {
    fn draining_code(self) -> AdminStateCode {
        match self {
            DrainOperation::Suspend => AdminStateCode::Suspending,
            DrainOperation::Save => AdminStateCode::Saving,
        }
    }

    fn quiescent_code(self) -> AdminStateCode {
        match self {
            DrainOperation::Suspend => AdminStateCode::Suspended,
            DrainOperation::Save => AdminStateCode::Saved,
        }
    }
}

/// 管理状態の状態機械.
///
/// ドレインの完了通知先(`AsyncReply`)を預かり、
/// `finish_draining_with_result`の呼び出し時にそこへ結果を送る.
#[derive(Debug)]
pub struct AdminState {
    code: AdminStateCode,
    operation: Option<DrainOperation>,
    waiter: Option<AsyncReply<()>>,
}
impl AdminState {
    /// 新しい`AdminState`インスタンスを生成する.
    pub fn new() -> Self {
        AdminState {
            code: AdminStateCode::New,
            operation: None,
            waiter: None,
        }
    }

    /// 現在の状態コードを返す.
    pub fn code(&self) -> AdminStateCode {
        self.code
    }

    /// 通常運転中かどうかを判定する.
    pub fn is_normal(&self) -> bool {
        self.code == AdminStateCode::NormalOperation
    }

    /// ドレイン中かどうかを判定する.
    pub fn is_draining(&self) -> bool {
        self.code.is_draining()
    }

    /// セーブに向けたドレイン中かどうかを判定する.
    pub fn is_saving(&self) -> bool {
        self.code == AdminStateCode::Saving
    }

    /// セーブ済みかどうかを判定する.
    pub fn is_saved(&self) -> bool {
        self.code == AdminStateCode::Saved
    }

    /// 静止状態かどうかを判定する.
    pub fn is_quiescent(&self) -> bool {
        self.code.is_quiescent()
    }

    pub(crate) fn set_code(&mut self, code: AdminStateCode) {
        self.code = code;
    }

    /// ドレインを開始する.
    ///
    /// 通常運転中でなければ`reply`へ`InvalidAdminState`を通知して`false`を返す.
    pub fn start_draining(&mut self, operation: DrainOperation, reply: AsyncReply<()>) -> bool {
        if !self.is_normal() {
            reply.send_error(track!(Error::from(ErrorKind::InvalidAdminState.error())));
            return false;
        }
        self.code = operation.draining_code();
        self.operation = Some(operation);
        self.waiter = Some(reply);
        true
    }

    /// ドレインを完了させ、預かっていた通知先へ結果を送る.
    ///
    /// ドレイン中でない場合は何もしない(冪等).
    pub fn finish_draining_with_result(&mut self, result: Result<()>) {
        if let Some(operation) = self.operation.take() {
            self.code = operation.quiescent_code();
            if let Some(waiter) = self.waiter.take() {
                waiter.send(result);
            }
        }
    }

    /// 静止状態からの運転再開を行う.
    ///
    /// 静止状態でない場合には`InvalidAdminState`エラーが返される.
    pub fn resume_if_quiescent(&mut self) -> Result<()> {
        track_assert!(self.is_quiescent(), ErrorKind::InvalidAdminState; self.code);
        self.code = AdminStateCode::NormalOperation;
        Ok(())
    }
}
impl Default for AdminState {
    fn default() -> Self {
        AdminState::new()
    }
}
