//! プロセス全体で共有されるリードオンリーモードの通知機構.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::ErrorKind;

#[derive(Debug)]
struct Shared {
    // 最初に報告されたエラーのみを保持する(後続のエラーでは上書きしない)
    error: Mutex<Option<ErrorKind>>,
    epoch: AtomicU64,
}

/// リードオンリーモードの通知ハンドル.
///
/// システムのどこかで構造的なエラーが起きた際に、
/// 全コンポーネントを「新規の処理は受け付けないが、
/// 処理中のものは(エラーで)完了させる」モードへと移行させるために使用される.
///
/// ハンドルは`clone`して各コンポーネント(のスレッド)へ配布できる.
/// 一度リードオンリーモードに入った後は、二度と通常モードには戻らない.
#[derive(Debug, Clone)]
pub struct ReadOnlyNotifier {
    shared: Arc<Shared>,
}
impl ReadOnlyNotifier {
    /// 新しい`ReadOnlyNotifier`インスタンスを生成する.
    pub fn new() -> Self {
        ReadOnlyNotifier {
            shared: Arc::new(Shared {
                error: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// リードオンリーモードへ移行する.
    ///
    /// 最初の呼び出しで渡されたエラー種別が記録され、
    /// 以降の呼び出しではエラー種別は変化しない(通知だけが行われる).
    pub fn enter_read_only_mode(&self, error: ErrorKind) {
        {
            let mut slot = self.shared.error.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// リードオンリーモードかどうかを判定する.
    pub fn is_read_only(&self) -> bool {
        self.shared
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// リードオンリーモードへの移行原因となったエラー種別を返す.
    pub fn read_only_error(&self) -> Option<ErrorKind> {
        *self.shared.error.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// このnotifierを監視するリスナーを登録する.
    ///
    /// リスナーは各コンポーネントが所有し、
    /// そのコンポーネントのスレッド上で`poll_notification`を呼び出して使用する.
    pub fn register_listener(&self) -> ReadOnlyListener {
        ReadOnlyListener {
            shared: Arc::clone(&self.shared),
            acknowledged: self.shared.epoch.load(Ordering::SeqCst),
        }
    }
}
impl Default for ReadOnlyNotifier {
    fn default() -> Self {
        ReadOnlyNotifier::new()
    }
}

/// リードオンリー通知のリスナー.
///
/// 通知は合流(coalesce)される: `poll_notification`が`true`を返した時点で、
/// それまでの全ての通知に応答した(acknowledge)ものとして扱われる.
#[derive(Debug)]
pub struct ReadOnlyListener {
    shared: Arc<Shared>,
    acknowledged: u64,
}
impl ReadOnlyListener {
    /// 未応答の通知があるかどうかを確認する.
    ///
    /// `true`が返された場合、呼び出し側はリードオンリーモードへの
    /// 対応処理(待機中リクエストの解放等)を行う必要がある.
    pub fn poll_notification(&mut self) -> bool {
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        if epoch != self.acknowledged {
            self.acknowledged = epoch;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn read_only_is_absorbing() {
        let notifier = ReadOnlyNotifier::new();
        assert!(!notifier.is_read_only());

        notifier.enter_read_only_mode(ErrorKind::JournalOverflow);
        notifier.enter_read_only_mode(ErrorKind::Other);
        assert!(notifier.is_read_only());
        // 最初のエラーが保持される
        assert_eq!(notifier.read_only_error(), Some(ErrorKind::JournalOverflow));
    }

    #[test]
    fn listener_coalesces_notifications() {
        let notifier = ReadOnlyNotifier::new();
        let mut listener = notifier.register_listener();
        assert!(!listener.poll_notification());

        notifier.enter_read_only_mode(ErrorKind::Other);
        notifier.enter_read_only_mode(ErrorKind::Other);
        assert!(listener.poll_notification());
        assert!(!listener.poll_notification());
    }

    proptest! {
        // 操作列は(種別, 引数)の組: 0 = モード移行, 1 = リスナー登録, 2 = 全リスナーの確認
        #[test]
        fn absorption_holds_under_arbitrary_interleaving(
            ops in proptest::collection::vec((0u8..3, 0usize..4), 1..40),
        ) {
            let kinds = [
                ErrorKind::JournalOverflow,
                ErrorKind::JournalFull,
                ErrorKind::NotImplemented,
                ErrorKind::Other,
            ];
            let notifier = ReadOnlyNotifier::new();
            let mut listeners: Vec<(ReadOnlyListener, bool)> = Vec::new();
            let mut first_error: Option<ErrorKind> = None;

            for (op, arg) in ops {
                match op {
                    0 => {
                        let kind = kinds[arg % kinds.len()];
                        notifier.enter_read_only_mode(kind);
                        first_error = first_error.or(Some(kind));
                        for entry in listeners.iter_mut() {
                            entry.1 = true;
                        }
                    }
                    1 => {
                        // 登録時点より前の通知には反応しない
                        listeners.push((notifier.register_listener(), false));
                    }
                    _ => {
                        for (listener, pending) in listeners.iter_mut() {
                            prop_assert_eq!(listener.poll_notification(), *pending);
                            // 通知は合流済みなので、直後の再確認では何も届かない
                            prop_assert!(!listener.poll_notification());
                            *pending = false;
                        }
                    }
                }

                // 一度リードオンリーモードに入った後は決して通常モードへ戻らず、
                // 最初に報告されたエラー種別が保持され続ける
                prop_assert_eq!(notifier.is_read_only(), first_error.is_some());
                prop_assert_eq!(notifier.read_only_error(), first_error);
            }
        }
    }
}
