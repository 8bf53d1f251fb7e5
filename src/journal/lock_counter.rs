//! ジャーナルブロック毎のゾーン別参照カウンタ.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{ErrorKind, Result};

/// 参照を保持するゾーンの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
    /// 論理ゾーン(ブロックマップの更新を担当).
    Logical,

    /// 物理ゾーン(スラブジャーナルの更新を担当).
    Physical,
}

/// ジャーナルブロック毎の参照カウンタ群.
///
/// ジャーナル内の各ブロックについて、
/// 「そのブロックのエントリの効果をまだ永続化していないコンポーネント」からの
/// 参照を数える. 参照が残っている間、そのブロックの領域は再利用(reap)できない.
///
/// カウンタは三層に分かれる:
///
/// - ジャーナルゾーン自身が持つエントリ毎のロック(ジャーナルスレッド専用)
/// - 論理・物理の各ゾーンが持つゾーン別カウント(任意のスレッドから操作可能)
/// - ゾーン別カウントの集約値(あるブロックを参照しているゾーンの数)
///
/// 全てのカウントがゼロになったブロックが現れると、
/// ジャーナルスレッドへの通知が(合流された形で)一件だけ保留される.
/// ジャーナルスレッドは`acknowledge_unlock`で応答してから回収処理を行う.
#[derive(Debug)]
pub struct LockCounter {
    size: usize,
    logical_zones: usize,
    physical_zones: usize,
    journal_counters: Vec<AtomicU32>,
    logical_counters: Vec<AtomicU32>,
    logical_zone_counts: Vec<AtomicU32>,
    physical_counters: Vec<AtomicU32>,
    physical_zone_counts: Vec<AtomicU32>,
    notifying: AtomicBool,
}
impl LockCounter {
    /// 新しい`LockCounter`インスタンスを生成する.
    ///
    /// `size`はジャーナルのブロック数.
    pub fn new(size: usize, logical_zones: usize, physical_zones: usize) -> Self {
        let make = |len: usize| (0..len).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();
        LockCounter {
            size,
            logical_zones,
            physical_zones,
            journal_counters: make(size),
            logical_counters: make(size * logical_zones),
            logical_zone_counts: make(size),
            physical_counters: make(size * physical_zones),
            physical_zone_counts: make(size),
            notifying: AtomicBool::new(false),
        }
    }

    /// ジャーナルのブロック数を返す.
    pub fn size(&self) -> usize {
        self.size
    }

    /// ブロックのエントリ毎ロックを初期化する.
    ///
    /// ジャーナルスレッド上で、ブロックの最初のエントリ割り当て前に呼び出される.
    pub fn initialize_lock_count(&self, block: usize, value: u32) {
        debug_assert_eq!(self.journal_counters[block].load(Ordering::Relaxed), 0);
        self.journal_counters[block].store(value, Ordering::Release);
    }

    /// 指定ブロックが(ジャーナルスレッドから見て)ロックされているかどうかを判定する.
    ///
    /// ジャーナルゾーン自身のエントリ毎ロックが残っている場合にも、ロック中として扱われる.
    pub fn is_locked(&self, block: usize, zone_type: ZoneType) -> bool {
        if self.journal_counters[block].load(Ordering::Acquire) != 0 {
            return true;
        }
        let counts = match zone_type {
            ZoneType::Logical => &self.logical_zone_counts,
            ZoneType::Physical => &self.physical_zone_counts,
        };
        counts[block].load(Ordering::Acquire) != 0
    }

    /// 指定ゾーンからブロックへの参照を追加する.
    ///
    /// 当該ゾーンのカウントが0から1へ変化した場合には、集約値も加算される.
    pub fn acquire(&self, block: usize, zone_type: ZoneType, zone_id: usize) -> Result<()> {
        let (counts, aggregates) = self.zone_slots(zone_type);
        let index = track!(self.zone_index(block, zone_type, zone_id))?;
        if counts[index].fetch_add(1, Ordering::AcqRel) == 0 {
            aggregates[block].fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// 指定ゾーンからブロックへの参照を解放する.
    ///
    /// 当該ゾーンのカウントが1から0へ変化した場合には集約値が減算され、
    /// ブロックの全カウントがゼロになった場合にはジャーナルスレッドへの通知が保留される.
    pub fn release(&self, block: usize, zone_type: ZoneType, zone_id: usize) -> Result<()> {
        let (counts, aggregates) = self.zone_slots(zone_type);
        let index = track!(self.zone_index(block, zone_type, zone_id))?;
        let prior = track!(decrement(&counts[index]))?;
        if prior == 1 {
            let aggregate_prior = track!(decrement(&aggregates[block]))?;
            if aggregate_prior == 1 {
                self.attempt_notification(block);
            }
        }
        Ok(())
    }

    /// ジャーナルスレッドが保持しているエントリ毎ロックを一つ解放する.
    pub fn release_journal_zone_reference(&self, block: usize) -> Result<()> {
        let prior = track!(decrement(&self.journal_counters[block]))?;
        if prior == 1 {
            self.attempt_notification(block);
        }
        Ok(())
    }

    /// ジャーナルスレッド以外からエントリ毎ロックを解放する.
    ///
    /// 解放元が「このブロックは他の参照によってまだロックされている」と
    /// 分かっている場合の高速パスであり、通知の発行は行われない.
    pub fn release_journal_zone_reference_from_other_zone(&self, block: usize) -> Result<()> {
        track!(decrement(&self.journal_counters[block]))?;
        Ok(())
    }

    /// 保留中の通知があるかどうかを確認する.
    pub fn is_notification_pending(&self) -> bool {
        self.notifying.load(Ordering::Acquire)
    }

    /// 通知に応答する.
    ///
    /// これ以降の解放は再び新しい通知を発行できるようになる.
    /// 通知と応答の間に発生した解放は、応答済みの通知に合流した扱いとなる.
    pub fn acknowledge_unlock(&self) {
        self.notifying.store(false, Ordering::Release);
    }

    fn attempt_notification(&self, block: usize) {
        if self.journal_counters[block].load(Ordering::Acquire) != 0
            || self.logical_zone_counts[block].load(Ordering::Acquire) != 0
            || self.physical_zone_counts[block].load(Ordering::Acquire) != 0
        {
            return;
        }
        // 既に未応答の通知があるなら、そちらに合流する
        let _ = self
            .notifying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);
    }

    fn zone_slots(&self, zone_type: ZoneType) -> (&[AtomicU32], &[AtomicU32]) {
        match zone_type {
            ZoneType::Logical => (&self.logical_counters, &self.logical_zone_counts),
            ZoneType::Physical => (&self.physical_counters, &self.physical_zone_counts),
        }
    }

    fn zone_index(&self, block: usize, zone_type: ZoneType, zone_id: usize) -> Result<usize> {
        let zones = match zone_type {
            ZoneType::Logical => self.logical_zones,
            ZoneType::Physical => self.physical_zones,
        };
        track_assert!(block < self.size, ErrorKind::InvalidInput; block, self.size);
        track_assert!(zone_id < zones, ErrorKind::InvalidInput; zone_id, zones);
        Ok(block * zones + zone_id)
    }
}

/// カウンタを一つ減算し、減算前の値を返す.
///
/// ゼロのカウンタの減算は会計のバグであり、`InconsistentState`エラーとなる.
fn decrement(counter: &AtomicU32) -> Result<u32> {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        track_assert!(current > 0, ErrorKind::InconsistentState);
        match counter.compare_exchange_weak(
            current,
            current - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prior) => return Ok(prior),
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_single_zone() {
        let counter = LockCounter::new(4, 2, 1);
        counter.acquire(0, ZoneType::Logical, 0).unwrap();
        assert!(counter.is_locked(0, ZoneType::Logical));
        assert!(!counter.is_locked(0, ZoneType::Physical));
        assert!(!counter.is_locked(1, ZoneType::Logical));

        counter.release(0, ZoneType::Logical, 0).unwrap();
        assert!(!counter.is_locked(0, ZoneType::Logical));
        assert!(counter.is_notification_pending());
    }

    #[test]
    fn journal_zone_reference_locks_all_types() {
        let counter = LockCounter::new(4, 1, 1);
        counter.initialize_lock_count(2, 3);
        assert!(counter.is_locked(2, ZoneType::Logical));
        assert!(counter.is_locked(2, ZoneType::Physical));

        counter.release_journal_zone_reference(2).unwrap();
        counter.release_journal_zone_reference(2).unwrap();
        assert!(counter.is_locked(2, ZoneType::Logical));
        assert!(!counter.is_notification_pending());

        counter.release_journal_zone_reference(2).unwrap();
        assert!(!counter.is_locked(2, ZoneType::Logical));
        assert!(counter.is_notification_pending());
    }

    #[test]
    fn notifications_coalesce_until_acknowledged() {
        let counter = LockCounter::new(4, 1, 1);
        counter.acquire(0, ZoneType::Logical, 0).unwrap();
        counter.acquire(1, ZoneType::Physical, 0).unwrap();

        counter.release(0, ZoneType::Logical, 0).unwrap();
        counter.release(1, ZoneType::Physical, 0).unwrap();
        assert!(counter.is_notification_pending());

        counter.acknowledge_unlock();
        assert!(!counter.is_notification_pending());
    }

    #[test]
    fn aggregate_tracks_distinct_zones() {
        let counter = LockCounter::new(2, 3, 1);
        counter.acquire(0, ZoneType::Logical, 0).unwrap();
        counter.acquire(0, ZoneType::Logical, 1).unwrap();
        counter.acquire(0, ZoneType::Logical, 1).unwrap();

        counter.release(0, ZoneType::Logical, 1).unwrap();
        counter.release(0, ZoneType::Logical, 1).unwrap();
        assert!(counter.is_locked(0, ZoneType::Logical));

        counter.release(0, ZoneType::Logical, 0).unwrap();
        assert!(!counter.is_locked(0, ZoneType::Logical));
    }

    #[test]
    fn underflow_is_rejected() {
        let counter = LockCounter::new(2, 1, 1);
        assert!(counter.release(0, ZoneType::Logical, 0).is_err());
        assert!(counter.release_journal_zone_reference(0).is_err());
    }

    #[test]
    fn other_zone_release_does_not_notify() {
        let counter = LockCounter::new(2, 1, 1);
        counter.initialize_lock_count(0, 1);
        counter
            .release_journal_zone_reference_from_other_zone(0)
            .unwrap();
        assert!(!counter.is_notification_pending());
    }
}
