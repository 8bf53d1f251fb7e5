//! ハッシュロックの状態機械.
//!
//! 各状態の遷移関数は(遷移元, 動詞)の組で命名されている:
//! `start_xxx`は状態`Xxx`への遷移と非同期処理の依頼を行い、
//! `finish_xxx`は処理の完了を受けて次状態の`start_*`を呼び出す.
//! 全ての遷移はロックを所有するハッシュゾーンのスレッド上で実行される.
use std::mem;
use std::sync::Arc;
use trackable::error::ErrorKindExt;

use crate::dedupe::zone::{DedupeAction, HashZone, VioId};
use crate::dedupe::PbnLock;
use crate::vio::{ContentDigest, DataLocation};
use crate::wait_queue::WaitQueue;
use crate::{Error, ErrorKind};

/// ハッシュロックの状態.
///
/// `Initializing`と`Destroying`を除き、各状態は実行中の非同期処理を表す.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashLockState {
    /// プールから取り出された直後.
    Initializing,

    /// エージェントが重複排除インデックスへ問い合わせ中.
    Querying,

    /// エージェントが新規データを圧縮・書き込み中.
    Writing,

    /// エージェントがアドバイス対象ブロックのリードロックを取得中.
    Locking,

    /// エージェントが候補ブロックを読み出して照合中.
    Verifying,

    /// 全メンバーが単一の重複ロックに対して並行で参照を追加中(共有状態).
    Deduping,

    /// エージェントが重複排除インデックスを更新中.
    Updating,

    /// エージェントが重複ブロックのリードロックを解放中.
    Unlocking,

    /// 重複排除を断念し、メンバーを通常の書き込みパスへと流している.
    Bypassing,

    /// プールへ返却される直前の最終状態.
    Destroying,
}

/// 同一コンテンツハッシュの並行リクエスト群を調停するロック.
#[derive(Debug)]
pub(crate) struct HashLock {
    pub(crate) digest: ContentDigest,
    pub(crate) state: HashLockState,
    pub(crate) agent: Option<VioId>,
    pub(crate) waiters: WaitQueue<VioId>,
    pub(crate) duplicate: Option<DataLocation>,
    pub(crate) duplicate_lock: Option<Arc<PbnLock>>,
    pub(crate) verified: bool,
    pub(crate) verify_counted: bool,
    pub(crate) update_advice: bool,
    pub(crate) registered: bool,
    pub(crate) members: Vec<VioId>,
    pub(crate) reference_count: usize,
    pub(crate) max_references: usize,
}
impl HashLock {
    pub fn new(digest: ContentDigest) -> Self {
        HashLock {
            digest,
            state: HashLockState::Initializing,
            agent: None,
            waiters: WaitQueue::new(),
            duplicate: None,
            duplicate_lock: None,
            verified: false,
            verify_counted: false,
            update_advice: false,
            registered: false,
            members: Vec::new(),
            reference_count: 0,
            max_references: 0,
        }
    }

    pub fn reset(&mut self, digest: ContentDigest) {
        debug_assert!(self.duplicate_lock.is_none());
        debug_assert!(self.waiters.is_empty());
        debug_assert!(self.members.is_empty());
        *self = HashLock::new(digest);
    }
}

impl HashZone {
    /// ロックへ参加済みのリクエストの処理を開始する.
    ///
    /// ロックの現在の状態に応じて、エージェントになるか、待機するか、
    /// 共有中の重複排除へと合流する.
    pub fn enter_hash_lock(&mut self, id: VioId) {
        let lock_index = self.lock_index_of(id);
        match self.locks[lock_index].state {
            HashLockState::Initializing => self.start_querying(lock_index, id),
            HashLockState::Querying
            | HashLockState::Writing
            | HashLockState::Updating
            | HashLockState::Locking
            | HashLockState::Verifying
            | HashLockState::Unlocking => {
                // ロックは専有中でまだ共有できない
                self.wait_on_hash_lock(lock_index, id);
            }
            HashLockState::Bypassing => {
                // 重複排除を完全に迂回する
                self.actions
                    .push_back(DedupeAction::CompressAndWrite { vio: id });
            }
            HashLockState::Deduping => self.launch_dedupe(lock_index, id, false),
            HashLockState::Destroying => self.report_bogus_lock_state(id),
        }
    }

    /// エージェントまたはメンバーの非同期処理の完了を通知する.
    ///
    /// `Writing`(書き込み完了)・`Deduping`(参照追加完了)・
    /// `Bypassing`(迂回書き込み完了)のいずれかの状態でのみ呼び出せる.
    pub fn continue_hash_lock(&mut self, id: VioId) {
        let lock_index = self.lock_index_of(id);
        match self.locks[lock_index].state {
            HashLockState::Writing => {
                debug_assert_eq!(
                    self.locks[lock_index].agent,
                    Some(id),
                    "only the lock agent may continue the lock"
                );
                self.finish_writing(id);
            }
            HashLockState::Deduping => self.finish_deduping(id),
            HashLockState::Bypassing => {
                // 書き込みパスを終えたリクエストをロックから送り出す
                self.exit_hash_lock(id);
            }
            _ => self.report_bogus_lock_state(id),
        }
    }

    /// 非同期処理がエラーとなったことを通知する.
    ///
    /// エラーを起こしたのがエージェント以外で、かつ他のメンバーがまだロックを
    /// 共有している場合には、当該リクエストだけがエラーと共に退出する.
    /// それ以外の場合、ロックは`Bypassing`へと移行し、
    /// 待機者は全員通常の書き込みパスへと流される.
    pub fn continue_hash_lock_on_error(&mut self, id: VioId, error: Error) {
        self.vio_mut(id).set_error(error);
        let lock_index = self.lock_index_of(id);

        // 既に迂回へ移行済みであれば、このリクエストを退出させるだけでよい
        if self.locks[lock_index].state == HashLockState::Bypassing {
            self.exit_hash_lock(id);
            return;
        }

        if self.locks[lock_index].agent != Some(id) {
            if self.locks[lock_index].agent.is_some()
                || self.locks[lock_index].reference_count > 1
            {
                // 他のメンバーがロックを共有中(Deduping)なので、
                // エラーを報告するこのリクエストだけを退出させる
                self.exit_hash_lock(id);
                return;
            }
            // 単独のメンバーをエージェントにして後始末をさせる
            self.locks[lock_index].agent = Some(id);
        }

        self.start_bypassing(lock_index, Some(id));
    }

    /// インデックス問い合わせの完了を通知する.
    ///
    /// `advice`が`Some`ならばアドバイスされた候補位置の検証へと進み、
    /// `None`ならば新規書き込みへと進む.
    pub fn finish_querying(&mut self, id: VioId, advice: Option<DataLocation>) {
        let lock_index = self.lock_index_of(id);
        debug_assert_eq!(self.locks[lock_index].state, HashLockState::Querying);

        if let Some(duplicate) = advice {
            self.vio_mut(id).is_duplicate = true;
            self.vio_mut(id).duplicate = Some(duplicate);
            self.locks[lock_index].duplicate = Some(duplicate);
            self.start_locking(lock_index, id);
        } else {
            // エージェントが割り当てを持っていればその位置がインデックスへ
            // 登録されているため、後の更新は不要となる
            let has_allocation = self.vio(id).allocation.is_some();
            self.locks[lock_index].update_advice = !has_allocation;
            self.locks[lock_index].registered = has_allocation;
            self.start_writing(lock_index, id);
        }
    }

    /// 候補ブロックのリードロック取得の結果を通知する.
    ///
    /// `lock`は`PhysicalZone::lock_duplicate_pbn`の返り値をそのまま渡す.
    pub fn finish_locking(&mut self, id: VioId, lock: Option<Arc<PbnLock>>) {
        let lock_index = self.lock_index_of(id);
        debug_assert_eq!(self.locks[lock_index].state, HashLockState::Locking);

        let pbn_lock = match lock {
            None => {
                debug_assert!(self.locks[lock_index].duplicate_lock.is_none());
                // 候補ブロックは書き換え中か参照枠が無いので、新しいデータを
                // 書き込み、後でインデックスを更新する
                self.metrics.dedupe_advice_stale.increment();
                self.locks[lock_index].update_advice = true;
                self.start_writing(lock_index, id);
                return;
            }
            Some(pbn_lock) => pbn_lock,
        };
        self.set_duplicate_lock(lock_index, pbn_lock);

        if !self.locks[lock_index].verified {
            // 未検証の候補なので、読み出して照合する
            self.start_verifying(lock_index, id);
            return;
        }

        let claimed = self.locks[lock_index]
            .duplicate_lock
            .as_ref()
            .expect("duplicate lock")
            .claim_increment();
        if !claimed {
            // 検証済みブロックを再ロックできたが参照枠が残っていない。
            // 新しいコピーへロールオーバーする前に、このロックを手放す必要がある。
            self.vio_mut(id).is_duplicate = false;
            self.locks[lock_index].verified = false;
            self.locks[lock_index].update_advice = true;
            self.start_unlocking(lock_index, id);
            return;
        }

        self.start_deduping(lock_index, id, false);
    }

    /// 候補ブロックとの照合結果を通知する.
    pub fn finish_verifying(&mut self, id: VioId, matched: bool) {
        let lock_index = self.lock_index_of(id);
        debug_assert_eq!(self.locks[lock_index].state, HashLockState::Verifying);

        self.locks[lock_index].verified = matched;

        // アドバイスの有効・陳腐の判定としてカウントするのは最初の検証のみ
        // (リードロック解放に伴う再検証は含めない)
        if !self.locks[lock_index].verify_counted {
            self.locks[lock_index].verify_counted = true;
            if matched {
                self.metrics.dedupe_advice_valid.increment();
            } else {
                self.metrics.dedupe_advice_stale.increment();
            }
        }

        // 真の重複であっても、エージェント用の参照枠を確保できなければ
        // 重複排除は開始できない
        if self.locks[lock_index].verified {
            let claimed = self.locks[lock_index]
                .duplicate_lock
                .as_ref()
                .expect("duplicate lock")
                .claim_increment();
            if !claimed {
                self.vio_mut(id).is_duplicate = false;
                self.locks[lock_index].verified = false;
            }
        }

        if self.locks[lock_index].verified {
            self.start_deduping(lock_index, id, false);
        } else {
            self.locks[lock_index].update_advice = true;
            self.start_unlocking(lock_index, id);
        }
    }

    /// 重複ブロックのリードロック解放の完了を通知する.
    pub fn finish_unlocking(&mut self, id: VioId) {
        let lock_index = self.lock_index_of(id);
        debug_assert!(self.locks[lock_index].duplicate_lock.is_none());

        match self.locks[lock_index].state {
            HashLockState::Bypassing => {
                // 迂回中の後始末が終わったので、エージェントも退出する
                self.exit_hash_lock(id);
            }
            HashLockState::Unlocking => {
                if !self.locks[lock_index].verified {
                    // 解放したのは未検証ブロックのロック、つまりアドバイスの
                    // 検証用であって重複排除に使った位置ではない。
                    // 書き込みによって重複排除先となる位置を作る。
                    self.start_writing(lock_index, id);
                    return;
                }

                // ロックを手放した以上、検証済みだったブロックは既に書き換え
                // られているかもしれない。後続が居れば再検証が必要になる。
                self.locks[lock_index].verified = false;

                if !self.locks[lock_index].waiters.is_empty() {
                    // エージェントの解放中に新しいリクエストが到着した。
                    // 現エージェントは退出し、待機者が再ロックと再検証を行う。
                    if let Some(new_agent) = self.retire_lock_agent(lock_index) {
                        self.start_locking(lock_index, new_agent);
                    }
                    return;
                }

                // 誰も残っていないので、ロックをマップから外してプールへ返す
                self.exit_hash_lock(id);
            }
            _ => self.report_bogus_lock_state(id),
        }
    }

    /// インデックス更新の完了を通知する.
    pub fn finish_updating(&mut self, id: VioId) {
        let lock_index = self.lock_index_of(id);
        debug_assert_eq!(self.locks[lock_index].state, HashLockState::Updating);

        // 更新に成功したので、ロールオーバーで位置が変わらない限り再更新は不要
        self.locks[lock_index].update_advice = false;

        if !self.locks[lock_index].waiters.is_empty() {
            // 更新中に新しいリクエストが到着した。検証済みの重複排除パスへ送る。
            self.start_deduping(lock_index, id, true);
        } else if self.locks[lock_index].duplicate_lock.is_some() {
            self.start_unlocking(lock_index, id);
        } else {
            self.start_bypassing(lock_index, None);
            self.exit_hash_lock(id);
        }
    }

    /// 圧縮ブロック書き込みで得たPBNロックを、ハッシュロックの重複ロックとして共有する.
    ///
    /// 最初の共有者が書き込みロックをリードロックへと降格する.
    /// 参照枠を一つ即座に確保することで、他のハッシュロックが先に
    /// 参照を使い切ってしまうことを防ぐ.
    pub fn share_compressed_write_lock(&mut self, id: VioId, pbn_lock: Arc<PbnLock>) {
        let lock_index = self.lock_index_of(id);
        debug_assert!(self.locks[lock_index].duplicate_lock.is_none());
        let new_mapped = self.vio(id).new_mapped.expect("compressed write location");
        debug_assert!(new_mapped.state.is_compressed());

        if !pbn_lock.is_read_lock() {
            pbn_lock.downgrade_to_read();
        }

        self.vio_mut(id).duplicate = Some(new_mapped);
        self.locks[lock_index].duplicate = Some(new_mapped);
        self.set_duplicate_lock(lock_index, pbn_lock);

        let claimed = self.locks[lock_index]
            .duplicate_lock
            .as_ref()
            .expect("duplicate lock")
            .claim_increment();
        debug_assert!(claimed, "initial increment claim must succeed");
    }

    fn lock_index_of(&self, id: VioId) -> usize {
        self.vio(id).hash_lock.expect("vio holds a hash lock")
    }

    fn set_duplicate_lock(&mut self, lock_index: usize, pbn_lock: Arc<PbnLock>) {
        debug_assert!(
            self.locks[lock_index].duplicate_lock.is_none(),
            "hash lock must not already hold a duplicate lock"
        );
        pbn_lock.add_holder();
        self.locks[lock_index].duplicate_lock = Some(pbn_lock);
    }

    fn wait_on_hash_lock(&mut self, lock_index: usize, id: VioId) {
        self.locks[lock_index].waiters.enqueue(id);

        // エージェントに少なくとも一つの待機者が付いた以上、
        // パッカー内で無期限に停止させてはならない
        if self.locks[lock_index].state != HashLockState::Writing {
            return;
        }
        let agent = self.locks[lock_index].agent.expect("writing lock has agent");
        if self.vio_mut(agent).cancel_compression() {
            self.actions
                .push_back(DedupeAction::RemoveLockHolderFromPacker { vio: id, agent });
        }
    }

    fn start_querying(&mut self, lock_index: usize, id: VioId) {
        self.locks[lock_index].agent = Some(id);
        self.locks[lock_index].state = HashLockState::Querying;
        self.actions
            .push_back(DedupeAction::CheckForDuplication { vio: id });
    }

    fn start_locking(&mut self, lock_index: usize, agent: VioId) {
        debug_assert!(
            self.locks[lock_index].duplicate_lock.is_none(),
            "must not acquire a duplicate lock when already holding it"
        );
        self.locks[lock_index].state = HashLockState::Locking;
        let duplicate = self.locks[lock_index]
            .duplicate
            .expect("advice to lock against");
        self.vio_mut(agent).duplicate = Some(duplicate);
        self.actions.push_back(DedupeAction::LockDuplicatePbn {
            vio: agent,
            duplicate,
        });
    }

    fn start_verifying(&mut self, lock_index: usize, agent: VioId) {
        debug_assert!(
            !self.locks[lock_index].verified,
            "hash lock only verifies advice once"
        );
        self.locks[lock_index].state = HashLockState::Verifying;
        let duplicate = self.locks[lock_index]
            .duplicate
            .expect("advice to verify");
        self.actions.push_back(DedupeAction::VerifyDuplication {
            vio: agent,
            duplicate,
        });
    }

    fn start_writing(&mut self, lock_index: usize, agent: VioId) {
        self.locks[lock_index].state = HashLockState::Writing;

        // エージェントは割り当てを受けられなかったかもしれないが、
        // 待機者の誰かは持っている可能性がある
        let mut agent = agent;
        if self.vio(agent).allocation.is_none() {
            agent = self.select_writing_agent(lock_index);
            if self.vio(agent).allocation.is_none() {
                // 誰も割り当てを持っていないので、全ての書き込みは失敗するしかない
                self.start_bypassing(lock_index, Some(agent));
                return;
            }
        }

        // 他に待機者が居る場合、エージェントをパッカー内で
        // 無期限に待たせるわけにはいかない
        if !self.locks[lock_index].waiters.is_empty() {
            let _ = self.vio_mut(agent).cancel_compression();
        }

        self.actions
            .push_back(DedupeAction::CompressAndWrite { vio: agent });
    }

    /// 待機者の中から割り当てを持つリクエストを探し、エージェントを交代する.
    ///
    /// 交代が起きた場合、旧エージェントは先頭の待機者となる
    /// (最初にロックへ到達したのは旧エージェントであるため).
    fn select_writing_agent(&mut self, lock_index: usize) -> VioId {
        let current = self.locks[lock_index].agent.expect("writing lock has agent");

        // 空き容量が枯渇しかけている時にしか起きないため、線形探索で構わない
        let mut scanned = WaitQueue::new();
        let mut found = None;
        while let Some(waiter) = self.locks[lock_index].waiters.dequeue() {
            if self.vio(waiter).allocation.is_some() {
                found = Some(waiter);
                break;
            }
            scanned.enqueue(waiter);
        }

        if let Some(found) = found {
            // 残りの待機者も到着順を保ったまま退避する
            while let Some(waiter) = self.locks[lock_index].waiters.dequeue() {
                scanned.enqueue(waiter);
            }
            self.locks[lock_index].waiters.enqueue(current);
            self.locks[lock_index].waiters.transfer_all(&mut scanned);
            self.locks[lock_index].agent = Some(found);
            found
        } else {
            self.locks[lock_index].waiters.transfer_all(&mut scanned);
            current
        }
    }

    fn finish_writing(&mut self, agent: VioId) {
        let lock_index = self.lock_index_of(agent);

        // エージェントが書き込んだブロック(または圧縮スロット)に対して重複排除
        // する。書き込みの成功は分かっているので、検証は不要となる。
        let new_mapped = self.vio(agent).new_mapped.expect("written data location");
        self.locks[lock_index].duplicate = Some(new_mapped);
        self.locks[lock_index].verified = true;

        if new_mapped.state.is_compressed() && self.locks[lock_index].registered {
            // 圧縮されたことで、インデックスに登録済みの位置と実際の重複排除先が
            // 食い違ったため、更新が必要になる
            self.locks[lock_index].update_advice = true;
        }

        if !self.locks[lock_index].waiters.is_empty() {
            // 待機者が居るので、書き込んだばかりのブロックへの重複排除を始める
            self.start_deduping(lock_index, agent, true);
            return;
        }

        if self.locks[lock_index].update_advice {
            self.start_updating(lock_index, agent);
        } else if self.locks[lock_index].duplicate_lock.is_some() {
            // 圧縮書き込みが共有リードロックを残したので、解放してまわる
            self.vio_mut(agent).duplicate = Some(new_mapped);
            self.start_unlocking(lock_index, agent);
        } else {
            // 待機者も更新も保持中のロックも無いので、エージェントとロックの
            // 双方に残る仕事は無い
            self.start_bypassing(lock_index, None);
            self.exit_hash_lock(agent);
        }
    }

    fn start_deduping(&mut self, lock_index: usize, agent: VioId, agent_is_done: bool) {
        self.locks[lock_index].state = HashLockState::Deduping;

        // エージェントの(降格済み)割り当てロックは、実際にそのブロックへ
        // 重複排除する場合にのみ引き取る
        if self.locks[lock_index].duplicate_lock.is_none() {
            debug_assert!(
                !self
                    .vio(agent)
                    .new_mapped
                    .expect("written data location")
                    .state
                    .is_compressed(),
                "compression must have shared a lock"
            );
            debug_assert!(agent_is_done, "agent must have written the new duplicate");
            self.transfer_allocation_lock(agent);
        }

        debug_assert!(
            self.locks[lock_index]
                .duplicate_lock
                .as_ref()
                .map_or(false, |lock| lock.is_read_lock()),
            "duplicate lock must be a read lock"
        );

        // この状態だけは特殊で、指名されたエージェントを持たない。
        // 遷移させたエージェントと待機者の全員が並行で重複排除を行う。
        self.locks[lock_index].agent = None;

        // エージェント(未完了の場合)と、参照枠の続く限りの待機者を
        // 重複排除パスへと送り出す。枠が尽きた時点でロールオーバーが起き、
        // 残りの待機者は新しいロックへと引き継がれる。
        if !agent_is_done {
            self.launch_dedupe(lock_index, agent, true);
        }
        while let Some(waiter) = self.locks[lock_index].waiters.dequeue() {
            self.launch_dedupe(lock_index, waiter, false);
        }

        if agent_is_done {
            // 全ての待機者がロールオーバーした縮退ケースでは、引き続き旧
            // エージェントがこのロックの後始末に使われる。そうでなければ、
            // 単にエージェントをロックから退出させる。
            self.finish_deduping(agent);
        }
    }

    fn launch_dedupe(&mut self, lock_index: usize, id: VioId, has_claim: bool) {
        let claimed = has_claim
            || self.locks[lock_index]
                .duplicate_lock
                .as_ref()
                .expect("duplicate lock")
                .claim_increment();
        if !claimed {
            // 参照枠が尽きたので、新しいロックへロールオーバーする
            self.fork_hash_lock(lock_index, id);
            return;
        }

        // ロックの検証済みの位置に対して重複排除する
        let duplicate = self.locks[lock_index]
            .duplicate
            .expect("verified duplicate location");
        self.vio_mut(id).duplicate = Some(duplicate);
        self.actions.push_back(DedupeAction::ShareBlock {
            vio: id,
            duplicate,
        });
    }

    fn finish_deduping(&mut self, id: VioId) {
        let lock_index = self.lock_index_of(id);
        debug_assert!(
            self.locks[lock_index].agent.is_none(),
            "shouldn't have an agent in deduping"
        );
        debug_assert!(
            self.locks[lock_index].waiters.is_empty(),
            "shouldn't have any lock waiters in deduping"
        );

        // 他のメンバーがまだ重複排除中なら、共有を手放すだけでよい
        if self.locks[lock_index].reference_count > 1 {
            self.exit_hash_lock(id);
            return;
        }

        // 最後のメンバーがエージェントとなり、ロックの解体を進める
        self.locks[lock_index].agent = Some(id);
        if self.locks[lock_index].update_advice {
            // 圧縮・ロールオーバー・問い合わせエージェントの割り当て不足の
            // いずれかによって、重複ブロックの位置が最初の問い合わせ結果から
            // 変わっている。位置の再変更に備えて更新は遅延されていたが、
            // このリクエストが最後なので今が更新の時となる。
            self.start_updating(lock_index, id);
        } else {
            self.start_unlocking(lock_index, id);
        }
    }

    /// 参照枠を使い切ったロックをforkする.
    ///
    /// 新しいエージェントと待機者は、マップ上で旧ロックを置き換える新しい
    /// ロックへと移される. 旧ロックは活動を続けるが、アドバイスの更新は行わない.
    fn fork_hash_lock(&mut self, old_index: usize, new_agent: VioId) {
        let digest = self.locks[old_index].digest;
        let new_index = self.allocate_lock(digest);
        self.lock_map.insert(digest, new_index);

        // インデックスを更新してよいのは二つのうち一方のみ。旧ロックは参照枠が
        // 尽きているため、短期的には質の悪いアドバイスにしかならない。
        self.locks[old_index].update_advice = false;
        self.locks[new_index].update_advice = true;

        self.remove_lock_member(new_agent, old_index);
        self.add_lock_member(new_agent, new_index);
        self.locks[new_index].agent = Some(new_agent);

        let mut waiters = mem::replace(&mut self.locks[old_index].waiters, WaitQueue::new());
        while let Some(waiter) = waiters.dequeue() {
            self.remove_lock_member(waiter, old_index);
            self.add_lock_member(waiter, new_index);
            self.wait_on_hash_lock(new_index, waiter);
        }

        self.vio_mut(new_agent).is_duplicate = false;
        self.start_writing(new_index, new_agent);
    }

    fn start_updating(&mut self, lock_index: usize, agent: VioId) {
        debug_assert!(
            self.locks[lock_index].verified,
            "new advice should have been verified"
        );
        debug_assert!(
            self.locks[lock_index].update_advice,
            "should only update advice if needed"
        );
        self.locks[lock_index].state = HashLockState::Updating;
        self.actions
            .push_back(DedupeAction::UpdateDedupeIndex { vio: agent });
    }

    fn start_unlocking(&mut self, lock_index: usize, agent: VioId) {
        self.locks[lock_index].state = HashLockState::Unlocking;
        let duplicate = self.locks[lock_index]
            .duplicate
            .expect("duplicate location");
        self.vio_mut(agent).duplicate = Some(duplicate);
        let lock = self.locks[lock_index]
            .duplicate_lock
            .take()
            .expect("duplicate lock to release");
        self.actions.push_back(DedupeAction::ReleaseDuplicateLock {
            vio: agent,
            pbn: duplicate.pbn,
            lock,
        });
    }

    fn start_bypassing(&mut self, lock_index: usize, agent: Option<VioId>) {
        self.locks[lock_index].state = HashLockState::Bypassing;

        // 後始末の際にアドバイスを更新しないようにする
        self.locks[lock_index].update_advice = false;

        debug_assert!(
            agent.is_some() || self.locks[lock_index].waiters.is_empty(),
            "should not have waiters without an agent"
        );
        let mut waiters = mem::replace(&mut self.locks[lock_index].waiters, WaitQueue::new());
        while let Some(waiter) = waiters.dequeue() {
            self.vio_mut(waiter).is_duplicate = false;
            self.actions
                .push_back(DedupeAction::CompressAndWrite { vio: waiter });
        }

        if self.locks[lock_index].duplicate_lock.is_some() {
            // 重複ロックの解放にはエージェントが必要となる
            let agent = agent.expect("hash lock holding a PBN lock must have an agent");
            let duplicate = self.locks[lock_index]
                .duplicate
                .expect("duplicate location");
            self.vio_mut(agent).duplicate = Some(duplicate);
            let lock = self.locks[lock_index]
                .duplicate_lock
                .take()
                .expect("checked above");
            self.actions.push_back(DedupeAction::ReleaseDuplicateLock {
                vio: agent,
                pbn: duplicate.pbn,
                lock,
            });
            return;
        }

        let agent = match agent {
            Some(agent) => agent,
            None => return,
        };
        self.locks[lock_index].agent = None;
        self.vio_mut(agent).is_duplicate = false;
        self.actions
            .push_back(DedupeAction::CompressAndWrite { vio: agent });
    }

    /// エージェントを先頭の待機者と交代させ、旧エージェントを退出させる.
    fn retire_lock_agent(&mut self, lock_index: usize) -> Option<VioId> {
        let old_agent = self.locks[lock_index].agent.take().expect("agent");
        let new_agent = self.locks[lock_index].waiters.dequeue();
        self.locks[lock_index].agent = new_agent;
        self.exit_hash_lock(old_agent);
        if let Some(new_agent) = new_agent {
            let duplicate = self.locks[lock_index].duplicate;
            self.vio_mut(new_agent).duplicate = duplicate;
        }
        new_agent
    }

    /// エージェントの降格済み割り当てロックを、ハッシュロックの重複ロックへと転用する.
    fn transfer_allocation_lock(&mut self, agent: VioId) {
        let lock_index = self.lock_index_of(agent);
        let vio = self.vio_mut(agent);
        let new_mapped = vio.new_mapped.expect("written data location");
        debug_assert_eq!(
            Some(new_mapped.pbn),
            vio.allocation,
            "transferred lock must be for the block written"
        );

        let pbn_lock = vio.allocation_lock.take().expect("allocation lock");
        vio.allocation = None;
        debug_assert!(
            pbn_lock.is_read_lock(),
            "must have downgraded the allocation lock before transfer"
        );

        vio.duplicate = Some(new_mapped);
        self.locks[lock_index].duplicate = Some(new_mapped);

        // ロックの移譲であるため、保持者数は変化しない
        self.locks[lock_index].duplicate_lock = Some(pbn_lock);
    }

    /// 書き込みまたは重複排除を終え、エージェントの役目も無くなった
    /// リクエストの合流点.
    fn exit_hash_lock(&mut self, id: VioId) {
        let lock_index = self.lock_index_of(id);
        self.remove_lock_member(id, lock_index);

        if self.locks[lock_index].reference_count == 0 {
            self.locks[lock_index].state = HashLockState::Destroying;
            self.locks[lock_index].agent = None;
            self.return_lock_to_zone(lock_index);
        }

        // リクエストを完了させ、後段の処理(クリーンアップ)へと返す
        let vio = self.take_vio(id);
        vio.complete(Ok(()));
    }

    fn report_bogus_lock_state(&mut self, id: VioId) {
        let lock_index = self.lock_index_of(id);
        warn!(
            self.logger,
            "hash lock must not be entered or continued in state {:?}",
            self.locks[lock_index].state
        );
        self.remove_lock_member(id, lock_index);
        if self.locks[lock_index].reference_count == 0 {
            self.locks[lock_index].state = HashLockState::Destroying;
            self.locks[lock_index].agent = None;
            self.return_lock_to_zone(lock_index);
        }
        let vio = self.take_vio(id);
        vio.complete(Err(track!(Error::from(ErrorKind::InconsistentState.error()))));
    }
}

#[cfg(test)]
mod tests {
    use slog::{Discard, Logger};
    use std::sync::Arc;

    use super::*;
    use crate::address::{Lbn, Pbn};
    use crate::completion::AsyncResult;
    use crate::dedupe::pbn_lock::{PbnLockType, PhysicalZone};
    use crate::dedupe::zone::AcquireResult;
    use crate::dedupe::{HashZone, SlabDepot};
    use crate::vio::{DataVio, JournalOperation, MappingState, ReferenceOperation};
    use crate::{ErrorKind, Result};

    struct TestDepot {
        limit_at_9000: u32,
    }
    impl SlabDepot for TestDepot {
        fn get_increment_limit(&self, pbn: Pbn) -> u32 {
            if pbn.as_u64() == 9000 {
                self.limit_at_9000
            } else {
                254
            }
        }

        fn acquire_provisional_reference(&mut self, _pbn: Pbn, lock: &Arc<PbnLock>) -> Result<()> {
            lock.assign_provisional_reference();
            Ok(())
        }
    }

    fn depot(limit_at_9000: u32) -> TestDepot {
        TestDepot { limit_at_9000 }
    }

    fn physical_zone() -> PhysicalZone {
        PhysicalZone::new(Logger::root(Discard, o!()))
    }

    fn digest(seed: u8) -> ContentDigest {
        ContentDigest::new([seed; 16])
    }

    fn location(pbn: u64) -> DataLocation {
        DataLocation::new(Pbn::from_u64(pbn).unwrap(), MappingState::Uncompressed)
    }

    fn write_vio(seed: u8, lbn: u64) -> (DataVio, AsyncResult<DataVio>) {
        let (mut vio, result) = DataVio::new(
            Lbn::from_u64(lbn).unwrap(),
            ReferenceOperation::new(
                JournalOperation::DataIncrement,
                Pbn::ZERO_BLOCK,
                MappingState::Uncompressed,
            ),
        );
        vio.digest = digest(seed);
        vio.data = Arc::new(vec![seed; 64]);
        (vio, result)
    }

    fn join(zone: &mut HashZone, vio: DataVio) -> VioId {
        match zone.acquire_hash_lock(vio) {
            AcquireResult::Joined(id) => {
                zone.enter_hash_lock(id);
                id
            }
            AcquireResult::Collision(_) => panic!("unexpected hash collision"),
        }
    }

    fn state_of(zone: &HashZone, seed: u8) -> Option<HashLockState> {
        zone.lock_state_of(&digest(seed))
    }

    fn expect_query(zone: &mut HashZone) -> VioId {
        match zone.poll_action() {
            Some(DedupeAction::CheckForDuplication { vio }) => vio,
            other => panic!("unexpected action: {:?}", other),
        }
    }

    fn expect_lock(zone: &mut HashZone) -> VioId {
        match zone.poll_action() {
            Some(DedupeAction::LockDuplicatePbn { vio, .. }) => vio,
            other => panic!("unexpected action: {:?}", other),
        }
    }

    fn expect_verify(zone: &mut HashZone) -> VioId {
        match zone.poll_action() {
            Some(DedupeAction::VerifyDuplication { vio, .. }) => vio,
            other => panic!("unexpected action: {:?}", other),
        }
    }

    fn expect_share(zone: &mut HashZone) -> (VioId, DataLocation) {
        match zone.poll_action() {
            Some(DedupeAction::ShareBlock { vio, duplicate }) => (vio, duplicate),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    fn expect_write(zone: &mut HashZone) -> VioId {
        match zone.poll_action() {
            Some(DedupeAction::CompressAndWrite { vio }) => vio,
            other => panic!("unexpected action: {:?}", other),
        }
    }

    fn expect_release(zone: &mut HashZone) -> (VioId, Pbn, Arc<PbnLock>) {
        match zone.poll_action() {
            Some(DedupeAction::ReleaseDuplicateLock { vio, pbn, lock }) => (vio, pbn, lock),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    fn expect_update(zone: &mut HashZone) -> VioId {
        match zone.poll_action() {
            Some(DedupeAction::UpdateDedupeIndex { vio }) => vio,
            other => panic!("unexpected action: {:?}", other),
        }
    }

    /// 書き込みパスをシミュレートする: 割り当て済みブロックへの非圧縮書き込みを
    /// 行い、書き込みロックをリードロックへ降格してVIOに残す.
    fn perform_data_write(zone: &mut HashZone, physical: &mut PhysicalZone, id: VioId) {
        let pbn = zone.vio(id).allocation.expect("allocation to write to");
        let lock = physical.attempt_pbn_lock(pbn, PbnLockType::Write);
        lock.downgrade_to_read();
        lock.set_increment_limit(253);
        zone.vio_mut(id).set_allocation_lock(lock);
        zone.vio_mut(id).new_mapped = Some(DataLocation::new(pbn, MappingState::Uncompressed));
    }

    #[test]
    fn no_advice_solo_write_with_concurrent_sharer() {
        let mut zone = HashZone::new();
        let mut physical = physical_zone();

        // 一つ目のリクエストがエージェントとなり、インデックスへ問い合わせる
        let (mut vio1, mut r1) = write_vio(7, 1);
        vio1.allocation = Some(Pbn::from_u64(100).unwrap());
        let id1 = join(&mut zone, vio1);
        assert_eq!(state_of(&zone, 7), Some(HashLockState::Querying));
        assert_eq!(expect_query(&mut zone), id1);

        // アドバイス無し → 書き込みへ
        zone.finish_querying(id1, None);
        assert_eq!(state_of(&zone, 7), Some(HashLockState::Writing));
        assert_eq!(expect_write(&mut zone), id1);
        zone.vio_mut(id1).enter_packer();

        // 書き込み中に同一データの二つ目が到着し、圧縮の中止が要求される
        let (vio2, mut r2) = write_vio(7, 2);
        let id2 = join(&mut zone, vio2);
        match zone.poll_action() {
            Some(DedupeAction::RemoveLockHolderFromPacker { vio, agent }) => {
                assert_eq!(vio, id2);
                assert_eq!(agent, id1);
            }
            other => panic!("unexpected action: {:?}", other),
        }
        assert_eq!(zone.metrics().concurrent_data_matches(), 1);
        assert_eq!(zone.metrics().max_references(), 2);

        // 書き込み完了: エージェントは書いたブロックを重複ロックとして共有し、退出する
        perform_data_write(&mut zone, &mut physical, id1);
        zone.continue_hash_lock(id1);
        assert_eq!(state_of(&zone, 7), Some(HashLockState::Deduping));
        assert!(r1.try_take().expect("agent done").is_ok());

        // 二つ目は書かれたばかりのブロックに対して重複排除する
        let (share_vio, duplicate) = expect_share(&mut zone);
        assert_eq!(share_vio, id2);
        assert_eq!(duplicate, location(100));
        zone.continue_hash_lock(id2);

        // 最後のメンバーが重複ロックを解放してロックを解体する
        let (unlock_vio, pbn, lock) = expect_release(&mut zone);
        assert_eq!(unlock_vio, id2);
        assert_eq!(pbn, Pbn::from_u64(100).unwrap());
        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id2);

        assert!(r2.try_take().expect("sharer done").is_ok());
        assert!(state_of(&zone, 7).is_none());
        assert_eq!(zone.active_lock_count(), 0);
        assert_eq!(physical.lock_count(), 0);
        assert!(zone.poll_action().is_none());
    }

    #[test]
    fn valid_advice_solo_dedupe() {
        let mut zone = HashZone::new();
        let mut physical = physical_zone();
        let mut depot = depot(254);

        let (vio1, mut r1) = write_vio(8, 1);
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);

        // 有効なアドバイス → リードロック取得へ
        zone.finish_querying(id1, Some(location(9000)));
        assert_eq!(state_of(&zone, 8), Some(HashLockState::Locking));
        assert_eq!(expect_lock(&mut zone), id1);

        let lock = physical
            .lock_duplicate_pbn(&mut depot, zone.vio_mut(id1))
            .unwrap();
        assert!(lock.is_some());
        zone.finish_locking(id1, lock);
        assert_eq!(state_of(&zone, 8), Some(HashLockState::Verifying));
        assert_eq!(expect_verify(&mut zone), id1);

        // 照合成功 → 重複排除
        zone.finish_verifying(id1, true);
        assert_eq!(zone.metrics().dedupe_advice_valid(), 1);
        assert_eq!(state_of(&zone, 8), Some(HashLockState::Deduping));
        let (share_vio, duplicate) = expect_share(&mut zone);
        assert_eq!(share_vio, id1);
        assert_eq!(duplicate, location(9000));

        zone.continue_hash_lock(id1);
        assert_eq!(state_of(&zone, 8), Some(HashLockState::Unlocking));
        let (_, pbn, lock) = expect_release(&mut zone);
        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id1);

        assert!(r1.try_take().expect("done").is_ok());
        assert_eq!(zone.active_lock_count(), 0);
        assert_eq!(physical.lock_count(), 0);
    }

    #[test]
    fn fork_on_rollover() {
        let mut zone = HashZone::new();
        let mut physical = physical_zone();
        let mut depot = depot(1);

        // 一つ目: アドバイスの検証に成功し、唯一の参照枠を確保する
        let (vio1, mut r1) = write_vio(9, 1);
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);
        zone.finish_querying(id1, Some(location(9000)));
        assert_eq!(expect_lock(&mut zone), id1);
        let lock = physical
            .lock_duplicate_pbn(&mut depot, zone.vio_mut(id1))
            .unwrap();
        zone.finish_locking(id1, lock);
        assert_eq!(expect_verify(&mut zone), id1);
        zone.finish_verifying(id1, true);
        let (share_vio, _) = expect_share(&mut zone);
        assert_eq!(share_vio, id1);

        // 二つ目: 参照枠を確保できず、新しいロックへforkしてその書き込み
        // エージェントとなる
        let (mut vio2, mut r2) = write_vio(9, 2);
        vio2.allocation = Some(Pbn::from_u64(200).unwrap());
        let id2 = join(&mut zone, vio2);
        assert_eq!(state_of(&zone, 9), Some(HashLockState::Writing));
        assert_eq!(expect_write(&mut zone), id2);

        // 三つ目は新しいロックに合流して待機する
        let (vio3, mut r3) = write_vio(9, 3);
        let id3 = join(&mut zone, vio3);
        assert!(zone.poll_action().is_none());

        // 二つ目の書き込みが完了し、三つ目はその複製に対して重複排除する
        perform_data_write(&mut zone, &mut physical, id2);
        zone.continue_hash_lock(id2);
        assert!(r2.try_take().expect("writer done").is_ok());
        let (share_vio, duplicate) = expect_share(&mut zone);
        assert_eq!(share_vio, id3);
        assert_eq!(duplicate, location(200));

        // 一つ目(旧ロック)の重複排除が完了し、旧ロックは更新無しで解体される
        zone.continue_hash_lock(id1);
        let (unlock_vio, pbn, lock) = expect_release(&mut zone);
        assert_eq!(unlock_vio, id1);
        assert_eq!(pbn, Pbn::from_u64(9000).unwrap());
        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id1);
        assert!(r1.try_take().expect("done").is_ok());

        // 三つ目(新ロックの最後のメンバー)はインデックスを更新してから解体する
        zone.continue_hash_lock(id3);
        assert_eq!(state_of(&zone, 9), Some(HashLockState::Updating));
        assert_eq!(expect_update(&mut zone), id3);
        zone.finish_updating(id3);
        let (_, pbn, lock) = expect_release(&mut zone);
        assert_eq!(pbn, Pbn::from_u64(200).unwrap());
        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id3);
        assert!(r3.try_take().expect("done").is_ok());

        assert_eq!(zone.active_lock_count(), 0);
        assert_eq!(physical.lock_count(), 0);
        assert_eq!(zone.metrics().dedupe_advice_valid(), 1);
        assert_eq!(zone.metrics().concurrent_data_matches(), 2);
    }

    #[test]
    fn hash_collision_bypasses_the_lock() {
        let mut zone = HashZone::new();

        let (vio1, _r1) = write_vio(10, 1);
        let _id1 = join(&mut zone, vio1);

        // ハッシュは同じだがデータが異なる
        let (mut vio2, _r2) = write_vio(10, 2);
        vio2.data = Arc::new(vec![0xFF; 64]);
        match zone.acquire_hash_lock(vio2) {
            AcquireResult::Collision(vio) => {
                assert!(vio.hash_lock.is_none());
            }
            AcquireResult::Joined(_) => panic!("collision must not join the lock"),
        }
        assert_eq!(zone.metrics().hash_collisions(), 1);
    }

    #[test]
    fn stale_advice_falls_back_to_writing() {
        let mut zone = HashZone::new();
        let mut physical = physical_zone();
        let mut depot = depot(254);

        let (mut vio1, mut r1) = write_vio(11, 1);
        vio1.allocation = Some(Pbn::from_u64(300).unwrap());
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);
        zone.finish_querying(id1, Some(location(9000)));
        assert_eq!(expect_lock(&mut zone), id1);
        let lock = physical
            .lock_duplicate_pbn(&mut depot, zone.vio_mut(id1))
            .unwrap();
        zone.finish_locking(id1, lock);
        assert_eq!(expect_verify(&mut zone), id1);

        // 照合失敗 → アドバイスは陳腐。ロックを解放してから書き込む
        zone.finish_verifying(id1, false);
        assert_eq!(zone.metrics().dedupe_advice_stale(), 1);
        assert_eq!(state_of(&zone, 11), Some(HashLockState::Unlocking));
        let (_, pbn, lock) = expect_release(&mut zone);
        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id1);
        assert_eq!(state_of(&zone, 11), Some(HashLockState::Writing));
        assert_eq!(expect_write(&mut zone), id1);

        // 書き込み後はインデックスの更新が必要となる
        perform_data_write(&mut zone, &mut physical, id1);
        zone.continue_hash_lock(id1);
        assert_eq!(state_of(&zone, 11), Some(HashLockState::Updating));
        assert_eq!(expect_update(&mut zone), id1);
        zone.finish_updating(id1);

        assert!(r1.try_take().expect("done").is_ok());
        assert_eq!(zone.active_lock_count(), 0);
    }

    #[test]
    fn write_locked_advice_is_abandoned() {
        let mut zone = HashZone::new();
        let mut physical = physical_zone();
        let mut depot = depot(254);

        physical.attempt_pbn_lock(Pbn::from_u64(9000).unwrap(), PbnLockType::CompressedWrite);

        let (mut vio1, _r1) = write_vio(12, 1);
        vio1.allocation = Some(Pbn::from_u64(300).unwrap());
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);
        zone.finish_querying(id1, Some(location(9000)));
        assert_eq!(expect_lock(&mut zone), id1);

        let lock = physical
            .lock_duplicate_pbn(&mut depot, zone.vio_mut(id1))
            .unwrap();
        assert!(lock.is_none());
        zone.finish_locking(id1, lock);

        assert_eq!(zone.metrics().dedupe_advice_stale(), 1);
        assert_eq!(state_of(&zone, 12), Some(HashLockState::Writing));
        assert_eq!(expect_write(&mut zone), id1);
    }

    #[test]
    fn error_during_query_bypasses_and_reports() {
        use trackable::error::ErrorKindExt;

        let mut zone = HashZone::new();

        let (mut vio1, mut r1) = write_vio(13, 1);
        vio1.allocation = Some(Pbn::from_u64(300).unwrap());
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);

        zone.continue_hash_lock_on_error(id1, ErrorKind::Other.error().into());
        assert_eq!(state_of(&zone, 13), Some(HashLockState::Bypassing));
        assert_eq!(expect_write(&mut zone), id1);

        // 迂回書き込みの完了後、リクエストは元のエラーと共に完了する
        zone.continue_hash_lock(id1);
        let e = r1.try_take().expect("completed").expect_err("error");
        assert_eq!(*e.kind(), ErrorKind::Other);
        assert_eq!(zone.active_lock_count(), 0);
    }

    #[test]
    fn writing_agent_is_selected_from_waiters_with_allocation() {
        let mut zone = HashZone::new();
        let mut physical = physical_zone();

        // エージェントは割り当てを持たないが、待機者は持っている
        let (vio1, mut r1) = write_vio(14, 1);
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);

        let (mut vio2, mut r2) = write_vio(14, 2);
        vio2.allocation = Some(Pbn::from_u64(400).unwrap());
        let id2 = join(&mut zone, vio2);

        zone.finish_querying(id1, None);
        // 割り当てを持つ待機者が書き込みエージェントに選ばれる
        assert_eq!(expect_write(&mut zone), id2);

        perform_data_write(&mut zone, &mut physical, id2);
        zone.continue_hash_lock(id2);
        assert!(r2.try_take().expect("writer done").is_ok());

        // 旧エージェントは書かれたブロックに対して重複排除する
        let (share_vio, duplicate) = expect_share(&mut zone);
        assert_eq!(share_vio, id1);
        assert_eq!(duplicate, location(400));
        zone.continue_hash_lock(id1);

        // 問い合わせエージェントに割り当てが無かったため、インデックスの更新が要る
        assert_eq!(state_of(&zone, 14), Some(HashLockState::Updating));
        assert_eq!(expect_update(&mut zone), id1);
        zone.finish_updating(id1);
        let (_, pbn, lock) = expect_release(&mut zone);
        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id1);
        assert!(r1.try_take().expect("done").is_ok());
    }

    #[test]
    fn bypass_when_nobody_has_an_allocation() {
        let mut zone = HashZone::new();

        let (vio1, mut r1) = write_vio(15, 1);
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);

        zone.finish_querying(id1, None);
        assert_eq!(state_of(&zone, 15), Some(HashLockState::Bypassing));
        assert_eq!(expect_write(&mut zone), id1);

        zone.continue_hash_lock(id1);
        assert!(r1.try_take().expect("done").is_ok());
        assert_eq!(zone.active_lock_count(), 0);
    }

    #[test]
    fn waiter_arriving_during_unlock_relocks_from_scratch() {
        let mut zone = HashZone::new();
        let mut physical = physical_zone();
        let mut depot = depot(254);

        let (vio1, mut r1) = write_vio(16, 1);
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);
        zone.finish_querying(id1, Some(location(9000)));
        assert_eq!(expect_lock(&mut zone), id1);
        let lock = physical
            .lock_duplicate_pbn(&mut depot, zone.vio_mut(id1))
            .unwrap();
        zone.finish_locking(id1, lock);
        assert_eq!(expect_verify(&mut zone), id1);
        zone.finish_verifying(id1, true);
        let _ = expect_share(&mut zone);
        zone.continue_hash_lock(id1);

        // エージェントがロック解放中に、新しいリクエストが到着する
        let (release_vio, pbn, lock) = expect_release(&mut zone);
        assert_eq!(release_vio, id1);
        let (vio2, mut r2) = write_vio(16, 2);
        let id2 = join(&mut zone, vio2);
        assert!(zone.poll_action().is_none());

        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id1);
        assert!(r1.try_take().expect("done").is_ok());

        // 待機者が新エージェントとなり、再ロックと再検証を行う
        assert_eq!(state_of(&zone, 16), Some(HashLockState::Locking));
        assert_eq!(expect_lock(&mut zone), id2);
        let lock = physical
            .lock_duplicate_pbn(&mut depot, zone.vio_mut(id2))
            .unwrap();
        zone.finish_locking(id2, lock);
        assert_eq!(expect_verify(&mut zone), id2);
        zone.finish_verifying(id2, true);

        // 再検証は有効・陳腐の統計には数えない
        assert_eq!(zone.metrics().dedupe_advice_valid(), 1);

        let _ = expect_share(&mut zone);
        zone.continue_hash_lock(id2);
        let (_, pbn, lock) = expect_release(&mut zone);
        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id2);
        assert!(r2.try_take().expect("done").is_ok());
        assert_eq!(zone.active_lock_count(), 0);
        assert_eq!(physical.lock_count(), 0);
    }

    #[test]
    fn compressed_write_shares_its_lock_and_updates_advice() {
        let mut zone = HashZone::new();
        let mut physical = physical_zone();

        let (mut vio1, mut r1) = write_vio(17, 1);
        vio1.allocation = Some(Pbn::from_u64(500).unwrap());
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);
        zone.finish_querying(id1, None);
        assert_eq!(expect_write(&mut zone), id1);

        // 書き込みは圧縮ブロックのスロットに入り、パッカーのロックを共有する
        let pbn = Pbn::from_u64(500).unwrap();
        let packer_lock = physical.attempt_pbn_lock(pbn, PbnLockType::CompressedWrite);
        packer_lock.set_increment_limit(13);
        zone.vio_mut(id1).new_mapped =
            Some(DataLocation::new(pbn, MappingState::Compressed(0)));
        zone.share_compressed_write_lock(id1, Arc::clone(&packer_lock));
        assert!(packer_lock.is_read_lock());
        assert_eq!(packer_lock.increments_claimed(), 1);

        zone.continue_hash_lock(id1);

        // 圧縮によって登録済みの位置と食い違ったため、更新が必要となる
        assert_eq!(state_of(&zone, 17), Some(HashLockState::Updating));
        assert_eq!(expect_update(&mut zone), id1);
        zone.finish_updating(id1);

        let (_, pbn, lock) = expect_release(&mut zone);
        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id1);
        assert!(r1.try_take().expect("done").is_ok());
        assert_eq!(zone.active_lock_count(), 0);
    }

    #[test]
    fn lone_non_agent_error_cleans_up_the_lock() {
        use trackable::error::ErrorKindExt;

        let mut zone = HashZone::new();
        let mut physical = physical_zone();
        let mut depot = depot(254);

        // 検証済みの重複排除中(Deduping、エージェント無し)のリクエストが
        // エラーを起こす
        let (vio1, mut r1) = write_vio(18, 1);
        let id1 = join(&mut zone, vio1);
        assert_eq!(expect_query(&mut zone), id1);
        zone.finish_querying(id1, Some(location(9000)));
        assert_eq!(expect_lock(&mut zone), id1);
        let lock = physical
            .lock_duplicate_pbn(&mut depot, zone.vio_mut(id1))
            .unwrap();
        zone.finish_locking(id1, lock);
        assert_eq!(expect_verify(&mut zone), id1);
        zone.finish_verifying(id1, true);
        let _ = expect_share(&mut zone);

        zone.continue_hash_lock_on_error(id1, ErrorKind::Other.error().into());

        // 単独のメンバーなので後始末のエージェントとなり、ロックを解放して退出する
        assert_eq!(state_of(&zone, 18), Some(HashLockState::Bypassing));
        let (release_vio, pbn, lock) = expect_release(&mut zone);
        assert_eq!(release_vio, id1);
        physical.release_pbn_lock(pbn, lock);
        zone.finish_unlocking(id1);

        let e = r1.try_take().expect("completed").expect_err("error");
        assert_eq!(*e.kind(), ErrorKind::Other);
        assert_eq!(zone.active_lock_count(), 0);
        assert_eq!(physical.lock_count(), 0);
    }

    mod lifecycle_properties {
        use proptest::prelude::*;
        use trackable::error::ErrorKindExt;

        use super::*;

        /// 観測され得る状態遷移の集合.
        ///
        /// 一回の呼び出しの中で複数の遷移が連続するケースは、畳み込まれた
        /// 一つの遷移として観測される:
        ///
        /// - `Bypassing`を経由して即座に`Destroying`へ至るケース
        /// - fork時の新しいロックが`Initializing`から即座に`Writing`
        ///   (割り当てが無い場合は`Bypassing`)へ至るケース
        ///
        /// `Destroying`からの遷移はプールからの再利用を表す.
        fn is_valid_transition(from: HashLockState, to: HashLockState) -> bool {
            use crate::dedupe::HashLockState::*;
            match (from, to) {
                (Initializing, Querying) => true,
                (Querying, Locking) | (Querying, Writing) | (Querying, Bypassing) => true,
                (Locking, Verifying)
                | (Locking, Deduping)
                | (Locking, Unlocking)
                | (Locking, Writing)
                | (Locking, Bypassing) => true,
                (Verifying, Deduping) | (Verifying, Unlocking) | (Verifying, Bypassing) => true,
                (Writing, Deduping)
                | (Writing, Updating)
                | (Writing, Unlocking)
                | (Writing, Bypassing)
                | (Writing, Destroying) => true,
                (Deduping, Updating) | (Deduping, Unlocking) | (Deduping, Bypassing) => true,
                (Updating, Deduping)
                | (Updating, Unlocking)
                | (Updating, Bypassing)
                | (Updating, Destroying) => true,
                (Unlocking, Writing)
                | (Unlocking, Locking)
                | (Unlocking, Destroying)
                | (Unlocking, Bypassing) => true,
                (Bypassing, Destroying) => true,
                (Destroying, Initializing)
                | (Destroying, Writing)
                | (Destroying, Bypassing) => true,
                _ => false,
            }
        }

        /// 全ロックの現在状態を記録し、変化していれば履歴へと追加する.
        fn record_states(zone: &HashZone, histories: &mut Vec<Vec<HashLockState>>) {
            for (index, lock) in zone.locks.iter().enumerate() {
                if histories.len() <= index {
                    histories.push(Vec::new());
                }
                let history = &mut histories[index];
                if history.last() != Some(&lock.state) {
                    history.push(lock.state);
                }
            }
        }

        /// 依頼中の非同期処理を最大`limit`個実行する.
        ///
        /// `error_at`番目に処理したものはエラーとして完了させる.
        fn drive(
            zone: &mut HashZone,
            physical: &mut PhysicalZone,
            depot: &mut TestDepot,
            advice: Option<DataLocation>,
            verify_matches: bool,
            error_at: Option<usize>,
            handled: &mut usize,
            limit: usize,
            histories: &mut Vec<Vec<HashLockState>>,
        ) {
            for _ in 0..limit {
                let action = match zone.poll_action() {
                    Some(action) => action,
                    None => return,
                };
                let inject_error = error_at == Some(*handled);
                *handled += 1;
                match action {
                    DedupeAction::CheckForDuplication { vio } => {
                        if inject_error {
                            zone.continue_hash_lock_on_error(vio, ErrorKind::Other.error().into());
                        } else {
                            zone.finish_querying(vio, advice);
                        }
                    }
                    DedupeAction::LockDuplicatePbn { vio, .. } => {
                        match physical.lock_duplicate_pbn(depot, zone.vio_mut(vio)) {
                            Ok(lock) => zone.finish_locking(vio, lock),
                            Err(e) => zone.continue_hash_lock_on_error(vio, e),
                        }
                    }
                    DedupeAction::VerifyDuplication { vio, .. } => {
                        if inject_error {
                            zone.continue_hash_lock_on_error(vio, ErrorKind::Other.error().into());
                        } else {
                            zone.finish_verifying(vio, verify_matches);
                        }
                    }
                    DedupeAction::ShareBlock { vio, .. } => {
                        if inject_error {
                            zone.continue_hash_lock_on_error(vio, ErrorKind::Other.error().into());
                        } else {
                            zone.continue_hash_lock(vio);
                        }
                    }
                    DedupeAction::CompressAndWrite { vio } => {
                        let lock_index = zone.vio(vio).hash_lock.expect("lock member");
                        let writing = zone.locks[lock_index].state == HashLockState::Writing;
                        if inject_error {
                            zone.continue_hash_lock_on_error(vio, ErrorKind::Other.error().into());
                        } else {
                            if writing {
                                perform_data_write(zone, physical, vio);
                            }
                            zone.continue_hash_lock(vio);
                        }
                    }
                    DedupeAction::ReleaseDuplicateLock { vio, pbn, lock } => {
                        physical.release_pbn_lock(pbn, lock);
                        zone.finish_unlocking(vio);
                    }
                    DedupeAction::UpdateDedupeIndex { vio } => {
                        if inject_error {
                            zone.continue_hash_lock_on_error(vio, ErrorKind::Other.error().into());
                        } else {
                            zone.finish_updating(vio);
                        }
                    }
                    DedupeAction::RemoveLockHolderFromPacker { .. } => {}
                }
                record_states(zone, histories);
            }
        }

        proptest! {
            #[test]
            fn randomized_lifecycles_follow_the_state_machine(
                vio_count in 1usize..4,
                allocations in proptest::collection::vec(any::<bool>(), 3),
                interleave in proptest::collection::vec(0usize..3, 3),
                has_advice in any::<bool>(),
                verify_matches in any::<bool>(),
                increment_limit in 0u32..3,
                error_at in proptest::option::of(0usize..8),
            ) {
                let mut zone = HashZone::new();
                let mut physical = physical_zone();
                let mut depot = depot(increment_limit);
                let advice = if has_advice { Some(location(9000)) } else { None };

                let mut histories: Vec<Vec<HashLockState>> = Vec::new();
                let mut handled = 0;
                let mut results = Vec::new();
                for i in 0..vio_count {
                    let (mut vio, result) = write_vio(42, i as u64 + 1);
                    if allocations[i] {
                        vio.allocation = Some(Pbn::from_u64(100 + i as u64).unwrap());
                    }
                    results.push(result);
                    let id = match zone.acquire_hash_lock(vio) {
                        AcquireResult::Joined(id) => id,
                        AcquireResult::Collision(_) => panic!("identical data must not collide"),
                    };
                    record_states(&zone, &mut histories);
                    zone.enter_hash_lock(id);
                    record_states(&zone, &mut histories);
                    // 到着タイミングを散らすため、参加の合間にも処理を進める
                    drive(
                        &mut zone,
                        &mut physical,
                        &mut depot,
                        advice,
                        verify_matches,
                        error_at,
                        &mut handled,
                        interleave[i],
                        &mut histories,
                    );
                }
                drive(
                    &mut zone,
                    &mut physical,
                    &mut depot,
                    advice,
                    verify_matches,
                    error_at,
                    &mut handled,
                    400,
                    &mut histories,
                );
                prop_assert!(zone.poll_action().is_none());

                // 全リクエストが完了している
                for result in results.iter_mut() {
                    prop_assert!(result.try_take().is_some());
                }

                // 各ロックの履歴は遷移図上の有効な経路になっており、
                // 必ずDestroyingで終わる。先頭は通常Initializingだが、
                // forkで生まれたロックは最初の観測が畳み込み先の状態になる。
                for history in &histories {
                    prop_assert!(matches!(
                        history.first(),
                        Some(&HashLockState::Initializing)
                            | Some(&HashLockState::Writing)
                            | Some(&HashLockState::Bypassing)
                    ));
                    prop_assert_eq!(history.last(), Some(&HashLockState::Destroying));
                    for pair in history.windows(2) {
                        prop_assert!(
                            is_valid_transition(pair[0], pair[1]),
                            "invalid transition {:?} -> {:?}",
                            pair[0],
                            pair[1]
                        );
                    }
                }

                // 終端では全ロックが解体済みで、重複ロックも残っていない
                prop_assert_eq!(zone.active_lock_count(), 0);
                prop_assert!(zone.locks.iter().all(|lock| lock.duplicate_lock.is_none()));
            }
        }
    }
}
