//! インメモリのジャーナルブロック(ステージングバッファ).
use byteorder::{ByteOrder, LittleEndian};

use crate::buffer::AlignedBytes;
use crate::journal::codec::{
    compute_block_checksum, compute_check_byte, PackedBlockHeader, PackedJournalEntry,
    ENTRIES_PER_BLOCK,
};
use crate::layer::BLOCK_SIZE;
use crate::vio::DataVio;
use crate::wait_queue::WaitQueue;

/// コミット時にヘッダへ記録されるジャーナル全体の状態.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CommitContext {
    pub nonce: u64,
    pub recovery_count: u8,
    pub block_map_head: u64,
    pub slab_journal_head: u64,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
}

/// 一つのオンディスクジャーナルブロックに対応するインメモリのステージングバッファ.
///
/// ジャーナルの起動時に固定個数が確保され、
/// フリーリストとアクティブリストの間を循環しながら再利用される.
#[derive(Debug)]
pub(crate) struct JournalBlock {
    sequence_number: u64,
    block_number: u64,
    entry_count: usize,
    entries_in_commit: usize,
    uncommitted_entry_count: usize,
    committing: bool,
    queued_for_write: bool,
    lock_count_initialized: bool,
    entry_waiters: WaitQueue<DataVio>,
    commit_waiters: WaitQueue<DataVio>,
    buffer: AlignedBytes,
}
impl JournalBlock {
    pub fn new() -> Self {
        JournalBlock {
            sequence_number: 0,
            block_number: 0,
            entry_count: 0,
            entries_in_commit: 0,
            uncommitted_entry_count: 0,
            committing: false,
            queued_for_write: false,
            lock_count_initialized: false,
            entry_waiters: WaitQueue::new(),
            commit_waiters: WaitQueue::new(),
            buffer: AlignedBytes::new_zeroed(BLOCK_SIZE),
        }
    }

    /// ブロックを新しいシーケンス番号で使用開始する.
    pub fn initialize(&mut self, sequence_number: u64, block_number: u64) {
        debug_assert!(self.entry_waiters.is_empty());
        debug_assert!(self.commit_waiters.is_empty());
        self.sequence_number = sequence_number;
        self.block_number = block_number;
        self.entry_count = 0;
        self.entries_in_commit = 0;
        self.uncommitted_entry_count = 0;
        self.committing = false;
        self.queued_for_write = false;
        self.lock_count_initialized = false;
        self.buffer.zero_fill();
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn is_committing(&self) -> bool {
        self.committing
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn is_full(&self) -> bool {
        self.entry_count == ENTRIES_PER_BLOCK
    }

    /// ディスク上の内容が最新でない(未コミットのエントリがある)かどうか.
    pub fn is_dirty(&self) -> bool {
        self.uncommitted_entry_count > 0
    }

    /// このブロックの書き込みを今すぐ開始できるかどうか.
    pub fn can_commit(&self) -> bool {
        self.is_dirty() && !self.committing
    }

    pub fn is_queued_for_write(&self) -> bool {
        self.queued_for_write
    }

    pub fn set_queued_for_write(&mut self, queued: bool) {
        self.queued_for_write = queued;
    }

    /// このブロックの参照カウンタが初期化済みかどうか.
    pub fn lock_count_initialized(&self) -> bool {
        self.lock_count_initialized
    }

    pub fn mark_lock_count_initialized(&mut self) {
        self.lock_count_initialized = true;
    }

    /// 現在実行中のコミットに含まれるエントリ数を返す.
    pub fn entries_in_commit(&self) -> usize {
        self.entries_in_commit
    }

    pub fn has_waiters(&self) -> bool {
        !self.entry_waiters.is_empty() || !self.commit_waiters.is_empty()
    }

    /// エントリを一つ割り当てる.
    ///
    /// `vio`にはジャーナル位置が設定済みでなければならない.
    /// エントリのバイト列はコミット開始時に書き込まれ、
    /// `vio`はそれまで`entry_waiters`で待機する.
    pub fn enqueue_entry(&mut self, vio: DataVio) {
        debug_assert!(!self.is_full());
        debug_assert!(vio.journal_point().is_some());
        self.entry_count += 1;
        self.uncommitted_entry_count += 1;
        self.entry_waiters.enqueue(vio);
    }

    /// コミットを開始し、書き込むべきブロックイメージを返す.
    ///
    /// 待機中の全エントリがバッファへとパックされ、
    /// 対応するVIO群は永続化待ち(`commit_waiters`)へと移される.
    pub fn begin_commit(&mut self, context: &CommitContext) -> &[u8] {
        debug_assert!(self.can_commit());
        self.entries_in_commit = self.entry_waiters.len();

        let buffer = &mut self.buffer;
        let commit_waiters = &mut self.commit_waiters;
        self.entry_waiters.notify_all(|vio| {
            let point = vio.journal_point().expect("assigned journal entry");
            let entry = PackedJournalEntry {
                operation: vio.operation.kind,
                state: vio.operation.state,
                logical: vio.logical,
                pbn: vio.operation.pbn,
            };
            entry.write_to(&mut buffer[PackedJournalEntry::slot_range(point.entry_index as usize)]);
            commit_waiters.enqueue(vio);
        });

        let header = PackedBlockHeader {
            block_map_head: context.block_map_head,
            slab_journal_head: context.slab_journal_head,
            sequence_number: self.sequence_number,
            nonce: context.nonce,
            recovery_count: context.recovery_count,
            check_byte: compute_check_byte(self.sequence_number),
            entry_count: self.entry_count as u16,
            logical_blocks_used: context.logical_blocks_used,
            block_map_data_blocks: context.block_map_data_blocks,
            checksum: 0,
        };
        header.write_to(buffer);
        let checksum = compute_block_checksum(buffer, self.entry_count as u16);
        LittleEndian::write_u32(&mut buffer[52..56], checksum);

        self.committing = true;
        &self.buffer[..]
    }

    /// コミットの完了を記録し、永続化されたエントリ数を返す.
    pub fn finish_commit(&mut self) -> usize {
        let committed = self.entries_in_commit;
        self.uncommitted_entry_count -= committed;
        self.entries_in_commit = 0;
        self.committing = false;
        committed
    }

    /// 永続化待ちのVIO群を取り出す.
    pub fn take_commit_waiters(&mut self) -> WaitQueue<DataVio> {
        std::mem::replace(&mut self.commit_waiters, WaitQueue::new())
    }

    /// エントリ割り当て済みで未パックのVIO群を取り出す.
    ///
    /// リードオンリーモードでの後始末にのみ使用される.
    pub fn take_entry_waiters(&mut self) -> WaitQueue<DataVio> {
        // 取り出されたエントリはもうコミットされない
        self.uncommitted_entry_count -= self.entry_waiters.len();
        std::mem::replace(&mut self.entry_waiters, WaitQueue::new())
    }
}
