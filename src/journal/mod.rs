//! リカバリジャーナル.
//!
//! リカバリジャーナルは、専用パーティション上の循環型write-aheadログであり、
//! 書き込み毎の参照カウントの増減分([`DataVio`]の操作)をエントリとして記録する.
//! クラッシュ後には、このログをリプレイすることで
//! ブロックマップとスラブ(物理割り当て)層の参照カウントを復元できる.
//!
//! # 構成要素
//!
//! - [`RecoveryJournal`]: ジャーナル本体。インメモリブロックのリング
//!   (フリーリスト+アクティブリスト)、単調増加する末尾シーケンス番号、
//!   流入制御用のキュー、フラッシュI/O、管理状態を所有する
//! - `JournalBlock`: 一つのオンディスクブロックに対応するステージングバッファ
//! - [`LockCounter`]: ブロック毎・ゾーン毎の参照カウンタ。下流コンポーネントが
//!   参照を手放したブロックの領域回収(reap)を駆動する
//!
//! # スレッドモデル
//!
//! ジャーナルの全ての更新操作は、単一の「ジャーナルスレッド」上で行われることを
//! 前提としている. 他ゾーンとの連携は[`JournalReferences`]ハンドル(アトミック)と
//! I/O完了キュー経由でのみ行われ、
//! ジャーナルスレッドは[`RecoveryJournal::poll_events`]でそれらを取り込む.
//!
//! [`DataVio`]: ../vio/struct.DataVio.html
//! [`RecoveryJournal`]: ./struct.RecoveryJournal.html
//! [`LockCounter`]: ./struct.LockCounter.html
//! [`JournalReferences`]: ./struct.JournalReferences.html
//! [`RecoveryJournal::poll_events`]: ./struct.RecoveryJournal.html#method.poll_events
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::cmp;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use trackable::error::ErrorKindExt;

pub use self::codec::{
    compute_check_byte, compute_recovery_count_byte, JournalComponentState, PackedBlockHeader,
    PackedJournalEntry, ENTRIES_PER_BLOCK,
};
pub use self::lock_counter::{LockCounter, ZoneType};

use self::block::{CommitContext, JournalBlock};
use crate::admin::{AdminState, AdminStateCode, DrainOperation};
use crate::completion::AsyncResult;
use crate::layer::{IoToken, PhysicalLayer, WritePolicy};
use crate::metrics::RecoveryJournalMetrics;
use crate::notifier::{ReadOnlyListener, ReadOnlyNotifier};
use crate::vio::{DataVio, JournalOperation};
use crate::wait_queue::WaitQueue;
use crate::{Error, ErrorKind, Result};

pub mod codec;

mod block;
mod lock_counter;

/// ジャーナルエントリのシーケンス番号.
pub type SequenceNumber = u64;

/// シーケンス番号の上限. これを超えると`JournalOverflow`となる.
const MAXIMUM_SEQUENCE_NUMBER: SequenceNumber = 1 << 48;

/// 予約ブロック数の上限.
///
/// 新しいジャーナルブロックの書き込みが、まだ有効なヘッドブロックに見える領域を
/// 上書きしないために必要な予約.
const RESERVED_BLOCKS: u64 = 8;

/// ジャーナル内の位置(シーケンス番号とブロック内エントリ番号の組).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct JournalPoint {
    /// ブロックのシーケンス番号.
    pub sequence_number: SequenceNumber,

    /// ブロック内のエントリ番号(0始まり).
    pub entry_index: u16,
}

/// 指定サイズのジャーナルのうち、エントリ格納に使用できるブロック数を返す.
///
/// 残りは循環バッファの追い越しを防ぐための予約領域となる.
pub fn recovery_journal_length(journal_size: u64) -> u64 {
    journal_size - cmp::min(journal_size / 4, RESERVED_BLOCKS)
}

/// ブロックマップ層との連携インターフェース.
pub trait BlockMapClient {
    /// ブロックマップの「時代(era)」を新しい末尾シーケンス番号へと進める.
    fn advance_era(&mut self, sequence_number: SequenceNumber);
}

/// スラブデポ(スラブジャーナル)層との連携インターフェース.
pub trait SlabJournalClient {
    /// `up_to`以前のジャーナルブロックを参照している、
    /// 最古のスラブジャーナル末尾ブロック群のコミットを要求する.
    fn commit_oldest_tail_blocks(&mut self, up_to: SequenceNumber);
}

/// ジャーナルブロックへの参照を他ゾーンから操作するためのハンドル.
///
/// ブロックマップや物理ゾーンのスレッドは、このハンドルを通して
/// 「どのジャーナルブロックのエントリの効果が未永続か」を表す参照を増減する.
#[derive(Debug, Clone)]
pub struct JournalReferences {
    lock_counter: Arc<LockCounter>,
    size: u64,
}
impl JournalReferences {
    /// `sequence_number`のブロックへの参照を追加する.
    ///
    /// `sequence_number`が`0`の場合は何もしない.
    pub fn acquire(
        &self,
        sequence_number: SequenceNumber,
        zone_type: ZoneType,
        zone_id: usize,
    ) -> Result<()> {
        if sequence_number == 0 {
            return Ok(());
        }
        let block = (sequence_number % self.size) as usize;
        track!(self.lock_counter.acquire(block, zone_type, zone_id))
    }

    /// `sequence_number`のブロックへの参照を解放する.
    ///
    /// `sequence_number`が`0`の場合は何もしない.
    pub fn release(
        &self,
        sequence_number: SequenceNumber,
        zone_type: ZoneType,
        zone_id: usize,
    ) -> Result<()> {
        if sequence_number == 0 {
            return Ok(());
        }
        let block = (sequence_number % self.size) as usize;
        track!(self.lock_counter.release(block, zone_type, zone_id))
    }

    /// エントリ毎ロックを、ジャーナルスレッド以外から一つ解放する.
    ///
    /// ブロックマップ更新の完了時に呼び出される.
    /// 呼び出し時点では(更新対象ページが保持する)他の参照が残っているため、
    /// ジャーナルスレッドへの通知は行われない.
    pub fn release_per_entry_lock_from_other_zone(
        &self,
        sequence_number: SequenceNumber,
    ) -> Result<()> {
        if sequence_number == 0 {
            return Ok(());
        }
        let block = (sequence_number % self.size) as usize;
        track!(self
            .lock_counter
            .release_journal_zone_reference_from_other_zone(block))
    }
}

/// ジャーナルの統計情報のスナップショット.
#[derive(Debug, Clone)]
pub struct RecoveryJournalStatistics {
    /// 使用が開始されたブロック数.
    pub blocks_started: u64,

    /// 書き込みが発行されたブロック数.
    pub blocks_written: u64,

    /// 書き込みが完了したブロック数.
    pub blocks_committed: u64,

    /// 割り当てられたエントリ数.
    pub entries_started: u64,

    /// 書き込みが発行されたエントリ数.
    pub entries_written: u64,

    /// 永続化が完了したエントリ数.
    pub entries_committed: u64,

    /// ジャーナル満杯によりエントリ割り当てを保留した回数.
    pub disk_full: u64,

    /// スラブジャーナルへコミットを要求した回数.
    pub slab_journal_commits_requested: u64,

    /// 使用中の論理ブロック数.
    pub logical_blocks_used: u64,

    /// ブロックマップ用データブロック数.
    pub block_map_data_blocks: u64,
}

/// `RecoveryJournal`のビルダ.
#[derive(Debug, Clone)]
pub struct RecoveryJournalBuilder {
    journal_size: u64,
    tail_buffer_size: usize,
    nonce: u64,
    recovery_count: u64,
    logical_zones: usize,
    physical_zones: usize,
    logger: Logger,
    metrics: MetricBuilder,
}
impl RecoveryJournalBuilder {
    /// 新しい`RecoveryJournalBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        RecoveryJournalBuilder {
            journal_size: 32,
            tail_buffer_size: 8,
            nonce: 0,
            recovery_count: 0,
            logical_zones: 1,
            physical_zones: 1,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// ジャーナルパーティションのサイズ(ブロック数)を設定する.
    ///
    /// デフォルト値は`32`.
    pub fn journal_size(&mut self, size: u64) -> &mut Self {
        self.journal_size = size;
        self
    }

    /// インメモリのステージングブロック数を設定する.
    ///
    /// デフォルト値は`8`.
    pub fn tail_buffer_size(&mut self, size: usize) -> &mut Self {
        self.tail_buffer_size = size;
        self
    }

    /// ジャーナルインスタンスを識別するノンスを設定する.
    ///
    /// リプレイ時に、別インスタンスの残骸ブロックを誤って読まないために使用される.
    pub fn nonce(&mut self, nonce: u64) -> &mut Self {
        self.nonce = nonce;
        self
    }

    /// リカバリカウント(クラッシュ後の世代番号)を設定する.
    pub fn recovery_count(&mut self, count: u64) -> &mut Self {
        self.recovery_count = count;
        self
    }

    /// 論理ゾーン数を設定する.
    ///
    /// デフォルト値は`1`.
    pub fn logical_zones(&mut self, zones: usize) -> &mut Self {
        self.logical_zones = zones;
        self
    }

    /// 物理ゾーン数を設定する.
    ///
    /// デフォルト値は`1`.
    pub fn physical_zones(&mut self, zones: usize) -> &mut Self {
        self.physical_zones = zones;
        self
    }

    /// ロガーを設定する.
    ///
    /// デフォルトでは何も出力しない.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクスの共通設定を行うためのビルダを設定する.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// ジャーナルを構築する.
    pub fn build<L: PhysicalLayer>(
        &self,
        layer: L,
        notifier: &ReadOnlyNotifier,
    ) -> Result<RecoveryJournal<L>> {
        track_assert!(self.journal_size >= 2, ErrorKind::InvalidInput; self.journal_size);
        track_assert!(self.tail_buffer_size >= 1, ErrorKind::InvalidInput; self.tail_buffer_size);
        track_assert!(
            self.logical_zones >= 1 && self.physical_zones >= 1,
            ErrorKind::InvalidInput
        );
        let journal_length = recovery_journal_length(self.journal_size);

        let blocks = (0..self.tail_buffer_size)
            .map(|_| JournalBlock::new())
            .collect::<Vec<_>>();
        let free_tail_blocks = (0..self.tail_buffer_size).collect::<VecDeque<_>>();
        let lock_counter = Arc::new(LockCounter::new(
            self.journal_size as usize,
            self.logical_zones,
            self.physical_zones,
        ));

        let mut journal = RecoveryJournal {
            logger: self.logger.clone(),
            metrics: RecoveryJournalMetrics::new(&self.metrics),
            layer,
            lock_counter,
            notifier: notifier.clone(),
            read_only_listener: notifier.register_listener(),
            state: AdminState::new(),
            block_map: None,
            depot: None,
            nonce: self.nonce,
            recovery_count: compute_recovery_count_byte(self.recovery_count),
            size: self.journal_size,
            entries_per_block: ENTRIES_PER_BLOCK,
            slab_journal_commit_threshold: self.journal_size * 2 / 3,
            tail: 1,
            append_point: JournalPoint::default(),
            last_write_acknowledged: 0,
            commit_point: JournalPoint::default(),
            block_map_head: 0,
            slab_journal_head: 0,
            block_map_reap_head: 0,
            slab_journal_reap_head: 0,
            block_map_head_block_number: 0,
            slab_journal_head_block_number: 0,
            available_space: ENTRIES_PER_BLOCK as u64 * journal_length,
            pending_decrement_count: 0,
            logical_blocks_used: 0,
            block_map_data_blocks: 0,
            pending_write_count: 0,
            blocks,
            free_tail_blocks,
            active_tail_blocks: VecDeque::new(),
            active_block: None,
            pending_writes: WaitQueue::new(),
            increment_waiters: WaitQueue::new(),
            decrement_waiters: WaitQueue::new(),
            reaping: false,
            adding_entries: false,
        };
        journal.initialize_journal_state();
        Ok(journal)
    }
}
impl Default for RecoveryJournalBuilder {
    fn default() -> Self {
        RecoveryJournalBuilder::new()
    }
}

/// リカバリジャーナル.
///
/// 構築後の操作手順:
///
/// 1. [`open`](#method.open)で下流コンポーネントを接続する
///    (保存済み状態がある場合は先に[`decode`](#method.decode)し、
///    後で[`resume`](#method.resume)する)
/// 2. ジャーナルスレッド上で[`add_entry`](#method.add_entry)により
///    エントリを追加し、[`poll_events`](#method.poll_events)で
///    I/O完了・ロック解放通知を取り込む
/// 3. 停止時には[`drain`](#method.drain)でドレインし、
///    セーブ後に[`encode`](#method.encode)で状態を永続化する
pub struct RecoveryJournal<L: PhysicalLayer> {
    logger: Logger,
    metrics: RecoveryJournalMetrics,
    layer: L,
    lock_counter: Arc<LockCounter>,
    notifier: ReadOnlyNotifier,
    read_only_listener: ReadOnlyListener,
    state: AdminState,
    block_map: Option<Box<dyn BlockMapClient>>,
    depot: Option<Box<dyn SlabJournalClient>>,
    nonce: u64,
    recovery_count: u8,
    size: u64,
    entries_per_block: usize,
    slab_journal_commit_threshold: u64,
    tail: SequenceNumber,
    append_point: JournalPoint,
    last_write_acknowledged: SequenceNumber,
    commit_point: JournalPoint,
    block_map_head: SequenceNumber,
    slab_journal_head: SequenceNumber,
    block_map_reap_head: SequenceNumber,
    slab_journal_reap_head: SequenceNumber,
    block_map_head_block_number: u64,
    slab_journal_head_block_number: u64,
    available_space: u64,
    pending_decrement_count: u64,
    logical_blocks_used: u64,
    block_map_data_blocks: u64,
    pending_write_count: u64,
    blocks: Vec<JournalBlock>,
    free_tail_blocks: VecDeque<usize>,
    active_tail_blocks: VecDeque<usize>,
    active_block: Option<usize>,
    pending_writes: WaitQueue<usize>,
    increment_waiters: WaitQueue<DataVio>,
    decrement_waiters: WaitQueue<DataVio>,
    reaping: bool,
    adding_entries: bool,
}
impl<L: PhysicalLayer> RecoveryJournal<L> {
    /// 下流コンポーネントを接続し、ジャーナルを使用可能にする.
    ///
    /// 構築直後であれば通常運転状態へと遷移する.
    /// デコード済み(サスペンド状態)の場合には、別途[`resume`](#method.resume)が必要となる.
    pub fn open(&mut self, depot: Box<dyn SlabJournalClient>, block_map: Box<dyn BlockMapClient>) {
        self.depot = Some(depot);
        self.block_map = Some(block_map);
        if self.state.code() == AdminStateCode::New {
            self.state.set_code(AdminStateCode::NormalOperation);
        }
    }

    /// 他ゾーン用の参照ハンドルを返す.
    pub fn references(&self) -> JournalReferences {
        JournalReferences {
            lock_counter: Arc::clone(&self.lock_counter),
            size: self.size,
        }
    }

    /// 次に割り当てられるシーケンス番号を返す.
    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    /// コミット済みとして通知された最新のジャーナル位置を返す.
    pub fn commit_point(&self) -> JournalPoint {
        self.commit_point
    }

    /// コミットが完了した最大のシーケンス番号を返す.
    pub fn last_write_acknowledged(&self) -> SequenceNumber {
        self.last_write_acknowledged
    }

    /// ブロックマップ側の回収フロンティアを返す.
    pub fn block_map_head(&self) -> SequenceNumber {
        self.block_map_head
    }

    /// スラブジャーナル側の回収フロンティアを返す.
    pub fn slab_journal_head(&self) -> SequenceNumber {
        self.slab_journal_head
    }

    /// 割り当て可能なエントリ数の残量を返す.
    pub fn available_space(&self) -> u64 {
        self.available_space
    }

    /// デクリメントエントリ用に予約済みの残量を返す.
    pub fn pending_decrement_count(&self) -> u64 {
        self.pending_decrement_count
    }

    /// 使用中の論理ブロック数を返す.
    pub fn logical_blocks_used(&self) -> u64 {
        self.logical_blocks_used
    }

    /// ブロックマップ用データブロック数を返す.
    pub fn block_map_data_blocks(&self) -> u64 {
        self.block_map_data_blocks
    }

    /// ブロックマップ用データブロック数を設定する(リビルド時用).
    pub fn set_block_map_data_blocks(&mut self, blocks: u64) {
        self.block_map_data_blocks = blocks;
    }

    /// ジャーナルのメトリクスを返す.
    pub fn metrics(&self) -> &RecoveryJournalMetrics {
        &self.metrics
    }

    /// 統計情報のスナップショットを返す.
    pub fn statistics(&self) -> RecoveryJournalStatistics {
        RecoveryJournalStatistics {
            blocks_started: self.metrics.blocks_started(),
            blocks_written: self.metrics.blocks_written(),
            blocks_committed: self.metrics.blocks_committed(),
            entries_started: self.metrics.entries_started(),
            entries_written: self.metrics.entries_written(),
            entries_committed: self.metrics.entries_committed(),
            disk_full: self.metrics.disk_full(),
            slab_journal_commits_requested: self.metrics.slab_journal_commits_requested(),
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
    }

    /// 統計情報をログへ出力する.
    pub fn dump(&self) {
        let stats = self.statistics();
        info!(
            self.logger,
            "recovery journal: block_map_head={} slab_journal_head={} \
             last_write_acknowledged={} tail={} block_map_reap_head={} \
             slab_journal_reap_head={} disk_full={} slab_journal_commits_requested={} \
             increment_waiters={} decrement_waiters={}",
            self.block_map_head,
            self.slab_journal_head,
            self.last_write_acknowledged,
            self.tail,
            self.block_map_reap_head,
            self.slab_journal_reap_head,
            stats.disk_full,
            stats.slab_journal_commits_requested,
            self.increment_waiters.len(),
            self.decrement_waiters.len()
        );
        info!(
            self.logger,
            "  entries: started={} written={} committed={}",
            stats.entries_started,
            stats.entries_written,
            stats.entries_committed
        );
        info!(
            self.logger,
            "  blocks: started={} written={} committed={}",
            stats.blocks_started,
            stats.blocks_written,
            stats.blocks_committed
        );
    }

    /// ジャーナルにエントリを追加する.
    ///
    /// ジャーナルスレッド上でのみ呼び出せる.
    /// `vio`は割り当てキューへと積まれ、
    /// エントリの永続化が完了した時点で完了通知が行われる.
    pub fn add_entry(&mut self, vio: DataVio) {
        if !self.state.is_normal() {
            vio.complete(Err(track!(Error::from(ErrorKind::InvalidAdminState.error()))));
            return;
        }
        if self.notifier.is_read_only() {
            vio.complete(Err(track!(Error::from(ErrorKind::ReadOnly.error()))));
            return;
        }

        self.append_point = advance_journal_point(self.append_point, self.entries_per_block);
        if vio.operation.kind.is_increment() {
            self.increment_waiters.enqueue(vio);
        } else {
            self.decrement_waiters.enqueue(vio);
        }
        self.assign_entries();
    }

    /// I/O完了・リードオンリー通知・ロック解放通知を取り込み、対応する処理を進める.
    ///
    /// 何らかの処理を行った場合には`true`を返す.
    /// ジャーナルスレッドのイベントループから繰り返し呼び出されることを想定している.
    pub fn poll_events(&mut self) -> bool {
        let mut progressed = false;
        while let Some(completion) = self.layer.poll_completion() {
            progressed = true;
            match completion.token {
                IoToken::BlockWrite { buffer } => self.complete_write(buffer, completion.result),
                IoToken::Flush => self.complete_flush(completion.result),
            }
        }
        if self.read_only_listener.poll_notification() {
            progressed = true;
            self.check_for_drain_complete();
        }
        if self.lock_counter.is_notification_pending() {
            progressed = true;
            // 応答と通知発行の競合を避けるため、応答を回収処理よりも先に行う
            self.lock_counter.acknowledge_unlock();
            self.reap();
            self.check_slab_journal_commit_threshold();
        }
        progressed
    }

    /// ドレインを開始する.
    ///
    /// 新規のエントリ追加は失敗するようになり、
    /// 処理中のエントリのコミットと領域回収が完了した時点で返り値へ通知される.
    pub fn drain(&mut self, operation: DrainOperation) -> AsyncResult<()> {
        let (reply, result) = AsyncResult::new();
        if self.state.start_draining(operation, reply) {
            self.check_for_drain_complete();
        }
        result
    }

    /// 静止状態からの運転再開を行う.
    pub fn resume(&mut self) -> Result<()> {
        let saved = self.state.is_saved();
        track!(self.state.resume_if_quiescent())?;
        if self.notifier.is_read_only() {
            return Err(track!(Error::from(ErrorKind::ReadOnly.error())));
        }
        if saved {
            self.initialize_journal_state();
        }
        Ok(())
    }

    /// ジャーナルのコンポーネント状態を`buf`の末尾へエンコードする.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let journal_start = if self.state.is_saved() {
            // セーブ済みであれば、アクティブブロックの次から開始すればよい
            // (アクティブブロックが空である保証は無いため)
            self.tail
        } else {
            // サスペンド中やリードオンリーの場合には、適用が必要なエントリを
            // 含み得る最初のブロックを記録しなければならない
            self.journal_head()
        };
        JournalComponentState {
            journal_start,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
        .encode(buf);
    }

    /// 保存されていたコンポーネント状態を読み込み、ジャーナルを再初期化する.
    ///
    /// デコード後の管理状態はサスペンドとなり、運転再開には[`resume`](#method.resume)が必要.
    pub fn decode(&mut self, buf: &[u8]) -> Result<()> {
        let state = track!(JournalComponentState::decode(buf))?;
        self.set_journal_tail(state.journal_start);
        self.logical_blocks_used = state.logical_blocks_used;
        self.block_map_data_blocks = state.block_map_data_blocks;
        self.initialize_journal_state();
        self.state.set_code(AdminStateCode::Suspended);
        Ok(())
    }

    /// リカバリ完了後の再初期化を行う.
    pub fn initialize_post_recovery(&mut self, recovery_count: u64, tail: SequenceNumber) {
        self.set_journal_tail(tail + 1);
        self.recovery_count = compute_recovery_count_byte(recovery_count);
        self.initialize_journal_state();
    }

    /// リビルド完了後の再初期化を行う.
    pub fn initialize_post_rebuild(
        &mut self,
        recovery_count: u64,
        tail: SequenceNumber,
        logical_blocks_used: u64,
        block_map_data_blocks: u64,
    ) {
        self.initialize_post_recovery(recovery_count, tail);
        self.logical_blocks_used = logical_blocks_used;
        self.block_map_data_blocks = block_map_data_blocks;
    }

    fn journal_head(&self) -> SequenceNumber {
        cmp::min(self.block_map_head, self.slab_journal_head)
    }

    fn block_number_of(&self, sequence_number: SequenceNumber) -> u64 {
        sequence_number % self.size
    }

    fn initialize_journal_state(&mut self) {
        self.append_point = JournalPoint {
            sequence_number: self.tail,
            entry_index: 0,
        };
        self.last_write_acknowledged = self.tail;
        self.block_map_head = self.tail;
        self.slab_journal_head = self.tail;
        self.block_map_reap_head = self.tail;
        self.slab_journal_reap_head = self.tail;
        self.block_map_head_block_number = self.block_number_of(self.block_map_head);
        self.slab_journal_head_block_number = self.block_number_of(self.slab_journal_head);
    }

    fn set_journal_tail(&mut self, tail: SequenceNumber) {
        // スラブジャーナル側の表現の制約により、2^48以上のシーケンス番号は扱えない
        if tail >= MAXIMUM_SEQUENCE_NUMBER {
            self.enter_read_only_mode(ErrorKind::JournalOverflow);
        }
        self.tail = tail;
    }

    fn enter_read_only_mode(&mut self, error: ErrorKind) {
        self.notifier.enter_read_only_mode(error);
        self.check_for_drain_complete();
    }

    fn release_journal_reference(&mut self, block_number: u64) {
        if let Err(e) = self
            .lock_counter
            .release_journal_zone_reference(block_number as usize)
        {
            error!(self.logger, "journal zone reference underflow: {}", e);
            self.enter_read_only_mode(ErrorKind::InconsistentState);
        }
    }

    fn has_block_waiters(&self) -> bool {
        // アクティブリングの先頭に待機者が居なければ、他のどのブロックにも居ない
        self.active_tail_blocks
            .front()
            .map_or(false, |&index| self.blocks[index].has_waiters())
    }

    fn check_for_entry_space(&self, increment: bool) -> bool {
        if increment {
            self.available_space - self.pending_decrement_count > 1
        } else {
            self.available_space > 0
        }
    }

    fn assign_entries(&mut self) {
        if self.adding_entries {
            // 再入の防止
            return;
        }
        self.adding_entries = true;
        if self.assign_entries_from_queue(false) {
            self.assign_entries_from_queue(true);
        }
        // エントリの割り当てが一段落したので、書き込み可能なブロックをまとめて発行する
        self.write_blocks();
        self.adding_entries = false;
    }

    fn assign_entries_from_queue(&mut self, increment: bool) -> bool {
        loop {
            let queue_is_empty = if increment {
                self.increment_waiters.is_empty()
            } else {
                self.decrement_waiters.is_empty()
            };
            if queue_is_empty {
                return true;
            }
            if !self.prepare_to_assign_entry(increment) {
                return false;
            }
            let vio = if increment {
                self.increment_waiters.dequeue()
            } else {
                self.decrement_waiters.dequeue()
            }
            .expect("queue has waiters");
            self.assign_entry(vio);
        }
    }

    fn prepare_to_assign_entry(&mut self, increment: bool) -> bool {
        if !self.check_for_entry_space(increment) {
            if increment {
                self.metrics.disk_full.increment();
            } else {
                // デクリメントエントリ用の領域は常に確保されていなければならない
                error!(
                    self.logger,
                    "no space for decrement entry in recovery journal"
                );
                self.enter_read_only_mode(ErrorKind::JournalFull);
            }
            return false;
        }

        let block_is_full = self
            .active_block
            .map_or(true, |index| self.blocks[index].is_full());
        if block_is_full && !self.advance_tail() {
            return false;
        }

        // リードオンリーモードへの移行がアクティブブロックを後始末した場合がある
        let index = match self.active_block {
            Some(index) => index,
            None => return false,
        };
        if !self.blocks[index].is_empty() {
            return true;
        }

        if (self.tail - self.journal_head()) > self.size {
            // 循環バッファを追い越すため、このブロックはまだ使用できない
            self.metrics.disk_full.increment();
            return false;
        }

        // このブロックの全エントリがブロックマップへ反映され、かつブロック自身の
        // コミットが完了するまでは回収させない。スラブジャーナルへの反映はブロック
        // マップ更新よりも先に行われるため、ブロックマップ用のエントリ毎ロックが
        // それらも保護する。
        let block_number = self.blocks[index].block_number();
        self.lock_counter
            .initialize_lock_count(block_number as usize, (self.entries_per_block + 1) as u32);
        self.blocks[index].mark_lock_count_initialized();
        true
    }

    fn advance_tail(&mut self) -> bool {
        let index = match self.free_tail_blocks.pop_front() {
            Some(index) => index,
            None => return false,
        };
        self.active_tail_blocks.push_back(index);
        self.active_block = Some(index);

        let sequence_number = self.tail;
        let block_number = self.block_number_of(sequence_number);
        self.blocks[index].initialize(sequence_number, block_number);
        self.metrics.blocks_started.increment();

        self.set_journal_tail(sequence_number + 1);
        let new_tail = self.tail;
        if let Some(block_map) = &mut self.block_map {
            block_map.advance_era(new_tail);
        }
        true
    }

    fn assign_entry(&mut self, mut vio: DataVio) {
        let index = self.active_block.expect("active block");
        let (sequence_number, entry_index, block_number) = {
            let block = &self.blocks[index];
            (
                block.sequence_number(),
                block.entry_count() as u16,
                block.block_number(),
            )
        };
        // エントリを書き込む位置を記録する
        vio.journal_point = Some(JournalPoint {
            sequence_number,
            entry_index,
        });

        match vio.operation.kind {
            JournalOperation::DataIncrement => {
                if !vio.operation.state.is_unmapped() {
                    self.logical_blocks_used += 1;
                }
                self.pending_decrement_count += 1;
            }
            JournalOperation::DataDecrement => {
                if !vio.operation.state.is_unmapped() {
                    self.logical_blocks_used -= 1;
                }
                // デクリメントエントリは、対となるインクリメントのエントリ毎
                // ロックで保護されるため、自身のロックは保持しない
                self.release_journal_reference(block_number);
                if self.pending_decrement_count == 0 {
                    warn!(self.logger, "decrement entry without a pending reservation");
                } else {
                    self.pending_decrement_count -= 1;
                }
            }
            JournalOperation::BlockMapIncrement => {
                self.block_map_data_blocks += 1;
            }
            JournalOperation::BlockMapDecrement => {
                error!(self.logger, "invalid journal operation: block map decrement");
                self.enter_read_only_mode(ErrorKind::NotImplemented);
                vio.complete(Err(track!(Error::from(ErrorKind::NotImplemented.error()))));
                return;
            }
        }

        self.available_space -= 1;
        self.metrics.entries_started.increment();
        self.blocks[index].enqueue_entry(vio);

        if self.blocks[index].is_full() {
            // 満杯になったブロックは以後いつでも書き込める。コミット中であれば、
            // 完了時に改めて書き込みキューへ積まれる。
            self.schedule_block_write(index);
        }

        // 閾値を超えていたら、スラブジャーナルの末尾ブロックを追い出す
        self.check_slab_journal_commit_threshold();
    }

    fn check_slab_journal_commit_threshold(&mut self) {
        if self.tail - self.slab_journal_head > self.slab_journal_commit_threshold {
            self.metrics.slab_journal_commits_requested.increment();
            let head = self.slab_journal_head;
            if let Some(depot) = &mut self.depot {
                depot.commit_oldest_tail_blocks(head);
            }
        }
    }

    fn schedule_block_write(&mut self, index: usize) {
        if self.blocks[index].is_committing() {
            return;
        }
        debug_assert!(!self.blocks[index].is_queued_for_write());
        self.blocks[index].set_queued_for_write(true);
        self.pending_writes.enqueue(index);

        if self.layer.write_policy() == WritePolicy::Async {
            // エントリ追加処理の最後か、コミット完了時にまとめて発行される
            return;
        }
        self.write_blocks();
    }

    fn write_blocks(&mut self) {
        // この関数の終了時点では、ジャーナル内に待機中のVIOが存在しないか、
        // または完了時に再度この関数を呼び出すI/Oが発行済みであるか、の
        // いずれかでなければならない。
        //
        // 同期系のポリシーでは満杯のブロックを即座に全て発行する。
        // 非同期ポリシーでは、発行済みの書き込みが無い場合にのみ発行する。
        if self.layer.write_policy() != WritePolicy::Async || self.pending_write_count == 0 {
            let mut queued = Vec::new();
            self.pending_writes.notify_all(|index| queued.push(index));
            for index in queued {
                self.blocks[index].set_queued_for_write(false);
                self.write_block(index);
            }
        }

        // 発行済みの書き込みが無く、未コミットのエントリが残っている場合には、
        // アクティブブロックが満杯でなくとも書き込む必要がある
        if self.pending_write_count == 0 {
            if let Some(index) = self.active_block {
                if self.blocks[index].can_commit() {
                    self.write_block(index);
                }
            }
        }
    }

    fn write_block(&mut self, index: usize) {
        if self.notifier.is_read_only() {
            return;
        }

        let context = CommitContext {
            nonce: self.nonce,
            recovery_count: self.recovery_count,
            block_map_head: self.block_map_head,
            slab_journal_head: self.slab_journal_head,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        };

        let blocks = &mut self.blocks;
        let layer = &mut self.layer;
        let block = &mut blocks[index];
        let block_number = block.block_number();
        let image = block.begin_commit(&context);
        let result = layer.submit_block_write(block_number, image, IoToken::BlockWrite {
            buffer: index,
        });

        self.pending_write_count += 1;
        self.metrics.blocks_written.increment();
        self.metrics
            .entries_written
            .add_u64(self.blocks[index].entries_in_commit() as u64);

        if let Err(e) = result {
            // 発行に失敗した場合でも、完了処理を実行してカウンタの整合を保つ
            self.complete_write(index, Err(e));
        }
    }

    fn complete_write(&mut self, index: usize, result: Result<()>) {
        if let Err(e) = result {
            error!(
                self.logger,
                "cannot write recovery journal block {}: {}",
                self.blocks[index].sequence_number(),
                e
            );
            self.enter_read_only_mode(*e.kind());
        }

        self.pending_write_count -= 1;
        self.metrics.blocks_committed.increment();
        let committed = self.blocks[index].finish_commit();
        self.metrics.entries_committed.add_u64(committed as u64);

        let sequence_number = self.blocks[index].sequence_number();
        if sequence_number > self.last_write_acknowledged {
            self.last_write_acknowledged = sequence_number;
        }

        if let Some(&front) = self.active_tail_blocks.front() {
            debug_assert!(sequence_number >= self.blocks[front].sequence_number());
        }

        self.notify_commit_waiters();

        // コミット中にさらにエントリが積まれて満杯になっていたら、改めて書き込む
        if self.blocks[index].is_dirty() && self.blocks[index].is_full() {
            self.schedule_block_write(index);
        }

        self.write_blocks();
        self.check_for_drain_complete();
    }

    fn notify_commit_waiters(&mut self) {
        let mut last_iteration_block = None;
        while let Some(&front) = self.active_tail_blocks.front() {
            if last_iteration_block == Some(front) {
                error!(self.logger, "journal commit notification did not progress");
                self.enter_read_only_mode(ErrorKind::InconsistentState);
                return;
            }
            last_iteration_block = Some(front);

            if self.blocks[front].is_committing() {
                return;
            }

            let read_only = self.notifier.is_read_only();
            let mut waiters = self.blocks[front].take_commit_waiters();
            self.release_committed_waiters(&mut waiters, read_only);

            if read_only {
                // リードオンリーモードのためコミットされない残りのエントリも解放する
                let mut entry_waiters = self.blocks[front].take_entry_waiters();
                self.release_committed_waiters(&mut entry_waiters, read_only);
            } else if self.blocks[front].is_dirty() || !self.blocks[front].is_full() {
                // 部分コミット済み・部分的に埋まったブロックは再利用できない
                return;
            }

            self.recycle_journal_block(front);
        }
    }

    fn release_committed_waiters(&mut self, waiters: &mut WaitQueue<DataVio>, read_only: bool) {
        while let Some(vio) = waiters.dequeue() {
            let point = vio.journal_point().expect("assigned journal entry");
            debug_assert!(
                self.commit_point < point,
                "journal waiters must be released in order: commit point {:?}, waiter {:?}",
                self.commit_point,
                point
            );
            self.commit_point = point;
            let result = if read_only {
                Err(track!(Error::from(ErrorKind::ReadOnly.error())))
            } else {
                Ok(())
            };
            vio.complete(result);
        }
    }

    fn recycle_journal_block(&mut self, index: usize) {
        self.active_tail_blocks.retain(|&i| i != index);
        self.free_tail_blocks.push_back(index);

        let block_number = self.blocks[index].block_number();
        if self.blocks[index].lock_count_initialized() {
            // 未使用エントリ分のロックを解放する
            for _ in self.blocks[index].entry_count()..self.entries_per_block {
                self.release_journal_reference(block_number);
            }
            // ブロックのコミット完了を待っていたブロック自身のロックを解放する
            if self.blocks[index].entry_count() > 0 {
                self.release_journal_reference(block_number);
            }
        }

        if self.active_block == Some(index) {
            self.active_block = None;
        }
    }

    fn reap(&mut self) {
        if self.reaping {
            // 実行中の回収処理の完了を待つ
            return;
        }

        // ヘッドのブロックが参照されていない間、回収フロンティアを進める
        while self.block_map_reap_head < self.last_write_acknowledged
            && !self
                .lock_counter
                .is_locked(self.block_map_head_block_number as usize, ZoneType::Logical)
        {
            self.block_map_reap_head += 1;
            self.block_map_head_block_number += 1;
            if self.block_map_head_block_number == self.size {
                self.block_map_head_block_number = 0;
            }
        }
        while self.slab_journal_reap_head < self.last_write_acknowledged
            && !self.lock_counter.is_locked(
                self.slab_journal_head_block_number as usize,
                ZoneType::Physical,
            )
        {
            self.slab_journal_reap_head += 1;
            self.slab_journal_head_block_number += 1;
            if self.slab_journal_head_block_number == self.size {
                self.slab_journal_head_block_number = 0;
            }
        }

        if self.block_map_reap_head == self.block_map_head
            && self.slab_journal_reap_head == self.slab_journal_head
        {
            return;
        }

        if self.layer.write_policy() != WritePolicy::Sync {
            // ヘッドを進める前に、回収対象エントリが変更したブロックマップページと
            // スラブサマリの更新をフラッシュしなければならない。同期ポリシーでは
            // 各ブロック書き込みがフラッシュを伴うため不要となる。
            self.reaping = true;
            if let Err(e) = self.layer.submit_flush(IoToken::Flush) {
                self.reaping = false;
                error!(self.logger, "cannot flush for journal reaping: {}", e);
                self.enter_read_only_mode(*e.kind());
            }
            return;
        }

        self.finish_reaping();
    }

    fn complete_flush(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.reaping = false;
            error!(self.logger, "journal reaping flush failed: {}", e);
            self.enter_read_only_mode(*e.kind());
            return;
        }
        self.finish_reaping();
        // フラッシュ中にさらにロックが解放されている可能性があるため、再度試みる
        self.reap();
    }

    fn finish_reaping(&mut self) {
        let old_head = self.journal_head();
        self.block_map_head = self.block_map_reap_head;
        self.slab_journal_head = self.slab_journal_reap_head;
        let blocks_reaped = self.journal_head() - old_head;
        self.available_space += blocks_reaped * self.entries_per_block as u64;
        self.reaping = false;
        self.check_slab_journal_commit_threshold();
        self.assign_entries();
        self.check_for_drain_complete();
    }

    fn check_for_drain_complete(&mut self) {
        let mut result = Ok(());
        if self.notifier.is_read_only() {
            result = Err(track!(Error::from(ErrorKind::ReadOnly.error())));
            // リードオンリーモードのため書き込まれなかった満杯のブロック群を後始末する
            self.notify_commit_waiters();

            // エントリ割り当て待ちのVIO群も解放する
            let mut decrements = mem::replace(&mut self.decrement_waiters, WaitQueue::new());
            decrements.notify_all(|vio| {
                vio.complete(Err(track!(Error::from(ErrorKind::ReadOnly.error()))));
            });
            let mut increments = mem::replace(&mut self.increment_waiters, WaitQueue::new());
            increments.notify_all(|vio| {
                vio.complete(Err(track!(Error::from(ErrorKind::ReadOnly.error()))));
            });
        }

        if !self.state.is_draining()
            || self.reaping
            || self.has_block_waiters()
            || !self.increment_waiters.is_empty()
            || !self.decrement_waiters.is_empty()
        {
            return;
        }

        if self.state.is_saving() {
            if let Some(index) = self.active_block {
                debug_assert!(
                    result.is_err() || !self.blocks[index].is_dirty(),
                    "journal being saved has clean active block"
                );
                self.recycle_journal_block(index);
            }
            debug_assert!(
                self.active_tail_blocks.is_empty(),
                "all blocks in a journal being saved must be inactive"
            );
        }

        self.state.finish_draining_with_result(result);
    }
}

fn advance_journal_point(point: JournalPoint, entries_per_block: usize) -> JournalPoint {
    if point.entry_index as usize + 1 == entries_per_block {
        JournalPoint {
            sequence_number: point.sequence_number + 1,
            entry_index: 0,
        }
    } else {
        JournalPoint {
            sequence_number: point.sequence_number,
            entry_index: point.entry_index + 1,
        }
    }
}

#[cfg(test)]
impl<L: PhysicalLayer> RecoveryJournal<L> {
    /// 流入制御の境界条件をテストするためのフック.
    fn set_available_space(&mut self, space: u64) {
        self.available_space = space;
    }

    fn layer_mut(&mut self) -> &mut L {
        &mut self.layer
    }
}
