//! 物理ブロック(PBN)ロックと物理ゾーン.
use slog::Logger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::address::Pbn;
use crate::dedupe::SlabDepot;
use crate::vio::DataVio;
use crate::{ErrorKind, Result};

/// PBNロックの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PbnLockType {
    /// 共有リードロック. 重複排除の対象ブロックの保護に使用される.
    Read,

    /// データブロック書き込み用の排他ロック.
    Write,

    /// 圧縮ブロック書き込み用の排他ロック.
    CompressedWrite,

    /// ブロックマップページ書き込み用の排他ロック.
    BlockMapWrite,
}
impl PbnLockType {
    fn to_u8(self) -> u8 {
        match self {
            PbnLockType::Read => 0,
            PbnLockType::Write => 1,
            PbnLockType::CompressedWrite => 2,
            PbnLockType::BlockMapWrite => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PbnLockType::Read,
            1 => PbnLockType::Write,
            2 => PbnLockType::CompressedWrite,
            _ => PbnLockType::BlockMapWrite,
        }
    }
}

/// 一つの物理ブロックに対するロック.
///
/// リードロックは複数のハッシュロックから共有され得る.
/// `increment_limit`は「このブロックが追加で受け入れられる参照の数」であり、
/// 共有者は[`claim_increment`](#method.claim_increment)で枠を一つずつ消費する.
#[derive(Debug)]
pub struct PbnLock {
    kind: AtomicU8,
    holder_count: AtomicU32,
    increment_limit: AtomicU32,
    increments_claimed: AtomicU32,
    has_provisional_reference: AtomicBool,
}
impl PbnLock {
    /// 新しい`PbnLock`インスタンスを生成する.
    ///
    /// 排他(書き込み系)ロックは取得者自身が保持者となるため、保持数`1`で始まる.
    /// リードロックの保持数は、共有するハッシュロックが登場した時点で加算される.
    pub fn new(kind: PbnLockType) -> Self {
        let holders = if kind == PbnLockType::Read { 0 } else { 1 };
        PbnLock {
            kind: AtomicU8::new(kind.to_u8()),
            holder_count: AtomicU32::new(holders),
            increment_limit: AtomicU32::new(0),
            increments_claimed: AtomicU32::new(0),
            has_provisional_reference: AtomicBool::new(false),
        }
    }

    /// ロックの種別を返す.
    pub fn kind(&self) -> PbnLockType {
        PbnLockType::from_u8(self.kind.load(Ordering::Acquire))
    }

    /// リードロックかどうかを判定する.
    pub fn is_read_lock(&self) -> bool {
        self.kind() == PbnLockType::Read
    }

    /// 書き込みロックをリードロックへと降格する.
    ///
    /// ロックを所有する物理ゾーンのスレッド上でのみ呼び出せる.
    pub fn downgrade_to_read(&self) {
        debug_assert!(!self.is_read_lock());
        self.kind
            .store(PbnLockType::Read.to_u8(), Ordering::Release);
    }

    /// 参照の増加枠を一つ消費する.
    ///
    /// 枠が残っていない場合には`false`を返す. 任意のスレッドから呼び出せる.
    pub fn claim_increment(&self) -> bool {
        let limit = self.increment_limit.load(Ordering::Acquire);
        self.increments_claimed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |claimed| {
                if claimed < limit {
                    Some(claimed + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// 参照の増加枠を設定する.
    pub fn set_increment_limit(&self, limit: u32) {
        self.increment_limit.store(limit, Ordering::Release);
    }

    /// 参照の増加枠を返す.
    pub fn increment_limit(&self) -> u32 {
        self.increment_limit.load(Ordering::Acquire)
    }

    /// 消費済みの増加枠の数を返す.
    pub fn increments_claimed(&self) -> u32 {
        self.increments_claimed.load(Ordering::Acquire)
    }

    /// このロックを共有している保持者の数を返す.
    pub fn holder_count(&self) -> u32 {
        self.holder_count.load(Ordering::Acquire)
    }

    /// 仮参照(provisional reference)の保持を記録する.
    ///
    /// スラブデポが`acquire_provisional_reference`の成功時に呼び出す.
    pub fn assign_provisional_reference(&self) {
        self.has_provisional_reference.store(true, Ordering::Release);
    }

    /// 仮参照を保持しているかどうかを返す.
    pub fn has_provisional_reference(&self) -> bool {
        self.has_provisional_reference.load(Ordering::Acquire)
    }

    pub(crate) fn add_holder(&self) {
        self.holder_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_holder(&self) -> u32 {
        let mut current = self.holder_count.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(1);
            match self.holder_count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}

/// 物理ゾーン.
///
/// 担当範囲内のPBNロックを所有する. 全ての操作は、
/// このゾーンを所有する物理ゾーンスレッド上で行われる
/// (ただし取得済みロックの`claim_increment`は任意のスレッドから呼び出せる).
#[derive(Debug)]
pub struct PhysicalZone {
    logger: Logger,
    locks: HashMap<u64, Arc<PbnLock>>,
}
impl PhysicalZone {
    /// 新しい`PhysicalZone`インスタンスを生成する.
    pub fn new(logger: Logger) -> Self {
        PhysicalZone {
            logger,
            locks: HashMap::new(),
        }
    }

    /// 現在保持されているロックの数を返す.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// `pbn`に対するロックの取得を試みる.
    ///
    /// 既にロックが存在する場合にはそれが返される
    /// (種別の確認は呼び出し側の責務となる).
    pub fn attempt_pbn_lock(&mut self, pbn: Pbn, kind: PbnLockType) -> Arc<PbnLock> {
        Arc::clone(
            self.locks
                .entry(pbn.as_u64())
                .or_insert_with(|| Arc::new(PbnLock::new(kind))),
        )
    }

    /// ロックの共有を一つ手放し、最後の保持者であればロックを解放する.
    pub fn release_pbn_lock(&mut self, pbn: Pbn, lock: Arc<PbnLock>) {
        if lock.remove_holder() == 0 {
            self.locks.remove(&pbn.as_u64());
        }
    }

    /// 重複排除候補ブロックのリードロックを取得する.
    ///
    /// 候補位置は`vio.duplicate`から読まれる. 以下の場合には候補を断念し、
    /// `vio.is_duplicate`を落とした上で`None`を返す:
    ///
    /// - 候補ブロックに参照の増加枠が残っていない
    /// - 候補ブロックが書き込みロックで保持されている
    ///   (ブロックマップページ・圧縮ブロック・別データの書き込み)
    ///
    /// 新規にロックを作成した場合には、回収との競合を防ぐために
    /// スラブから仮参照を取得し、ロックへ増加枠を引き継がせる.
    pub fn lock_duplicate_pbn(
        &mut self,
        depot: &mut dyn SlabDepot,
        vio: &mut DataVio,
    ) -> Result<Option<Arc<PbnLock>>> {
        let duplicate = track_assert_some!(vio.duplicate, ErrorKind::InconsistentState);

        // ロックの所有ゾーン内に居る間に、このブロックが本当に重複だった場合へ
        // 備えて、追加で参照できる数を調べておく
        let increment_limit = depot.get_increment_limit(duplicate.pbn);
        if increment_limit == 0 {
            // 検証中に参照が解放されれば後で重複排除できる可能性はあるが、
            // 今は見送った方がよい
            vio.is_duplicate = false;
            return Ok(None);
        }

        let lock = self.attempt_pbn_lock(duplicate.pbn, PbnLockType::Read);
        if !lock.is_read_lock() {
            // 書き込みロック保持中のブロックについては、アドバイスの検証も
            // 保持者のデータへの重複排除も行わない
            vio.is_duplicate = false;
            return Ok(None);
        }

        if lock.holder_count() == 0 {
            // 新規ロックなので、対象ブロックが参照されている状態を保証する
            if let Err(e) = track!(depot.acquire_provisional_reference(duplicate.pbn, &lock)) {
                warn!(
                    self.logger,
                    "cannot acquire provisional reference for dedupe candidate: {}", e
                );
                vio.is_duplicate = false;
                self.locks.remove(&duplicate.pbn.as_u64());
                return Err(e);
            }

            // 先に調べた増加枠はまだ有効であり、その権利はこのリードロックが
            // 引き継ぐ. 枠はこのロックを共有するハッシュロック群が消費していく.
            lock.set_increment_limit(increment_limit);
        }

        Ok(Some(lock))
    }
}
