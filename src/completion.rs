//! コンポーネント間の非同期な完了通知.
//!
//! ジャーナルのコミット完了通知やドレイン完了通知のように、
//! 「要求の発行」と「結果の受領」が別々のタイミング・スレッドで行われる箇所で使用される.
use futures::channel::oneshot;
use futures::{Future, FutureExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use trackable::error::ErrorKindExt;

use crate::{Error, ErrorKind, Result};

/// `Result`の非同期版.
#[derive(Debug)]
pub struct AsyncResult<T>(oneshot::Receiver<Result<T>>);
impl<T> AsyncResult<T> {
    /// 送信側と受信側のペアを生成する.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (AsyncReply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (AsyncReply(tx), AsyncResult(rx))
    }

    /// 既に結果が届いているかどうかを(消費せずに)問い合わせるためのヘルパ.
    ///
    /// テストのように単一スレッドで駆動する場合には、
    /// `futures`のエグゼキュータを用意せずに結果を取り出せた方が便利なことが多い.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.0.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(_) => Some(Err(track!(Error::from(ErrorKind::Other
                .cause("acknowledgement channel disconnected"))))),
        }
    }
}
impl<T> Future for AsyncResult<T> {
    type Output = Result<T>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.0.poll_unpin(cx).map(|result| match result {
            Ok(Ok(x)) => Ok(x),
            Ok(Err(e)) => Err(track!(e)),
            Err(_) => Err(track!(Error::from(ErrorKind::Other
                .cause("acknowledgement channel disconnected")))),
        })
    }
}

/// `AsyncResult`に結果を通知するための送信側ハンドル.
#[derive(Debug)]
pub struct AsyncReply<T>(oneshot::Sender<Result<T>>);
impl<T> AsyncReply<T> {
    /// 結果を送信する.
    pub fn send(self, result: Result<T>) {
        let _ = self.0.send(result); // fails if the receiver has been dropped
    }

    /// エラーを送信する.
    pub fn send_error(self, error: Error) {
        self.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_take() {
        let (reply, mut result) = AsyncResult::<u32>::new();
        assert!(result.try_take().is_none());
        reply.send(Ok(7));
        assert_eq!(result.try_take().map(|r| r.unwrap()), Some(7));
    }

    #[test]
    fn dropped_reply_is_an_error() {
        let (reply, mut result) = AsyncResult::<u32>::new();
        drop(reply);
        assert!(result.try_take().map_or(false, |r| r.is_err()));
    }
}
