//! ジャーナルブロックおよび永続化状態のバイナリ表現.
//!
//! ここで定義されるレイアウトはディスク上の互換性契約であり、
//! リカバリ(リプレイ)処理もこの形式を前提とする. 全てリトルエンディアン.
use adler32::RollingAdler32;
use byteorder::{ByteOrder, LittleEndian};

use crate::address::{Lbn, Pbn};
use crate::layer::BLOCK_SIZE;
use crate::vio::{JournalOperation, MappingState};
use crate::{ErrorKind, Result};

/// 一つのジャーナルブロックに格納されるエントリ数.
///
/// この値はディスクフォーマットの一部であり、変更してはならない.
pub const ENTRIES_PER_BLOCK: usize = 311;

/// ジャーナルブロックヘッダのサイズ(バイト単位).
pub const BLOCK_HEADER_SIZE: usize = 64;

/// パック済みエントリのサイズ(バイト単位).
pub const ENTRY_SIZE: usize = 12;

/// 永続化されるジャーナルコンポーネント状態の識別子.
pub const COMPONENT_ID: u32 = 2;

/// ジャーナルコンポーネント状態のメジャーバージョン.
pub const MAJOR_VERSION: u32 = 7;

/// ジャーナルコンポーネント状態のマイナーバージョン.
pub const MINOR_VERSION: u32 = 0;

/// コンポーネントヘッダのサイズ(バイト単位).
const COMPONENT_HEADER_SIZE: usize = 20;

/// コンポーネント状態本体のサイズ(バイト単位).
const COMPONENT_STATE_SIZE: u64 = 24;

/// ヘッダ内のチェックサムフィールドの位置.
const CHECKSUM_OFFSET: usize = 52;

// ヘッダとエントリ群が1デバイスブロックに収まることの確認
const _ASSERT_BLOCK_FITS: [(); 1] =
    [(); (BLOCK_HEADER_SIZE + ENTRIES_PER_BLOCK * ENTRY_SIZE <= BLOCK_SIZE) as usize];

/// シーケンス番号からチェックバイトを計算する.
///
/// ジャーナル世代の判別用で、最上位ビットは常に立てられる.
pub fn compute_check_byte(sequence_number: u64) -> u8 {
    ((sequence_number & 0x7f) as u8) | 0x80
}

/// リカバリカウントをヘッダに記録される1バイト値へと折り畳む.
pub fn compute_recovery_count_byte(recovery_count: u64) -> u8 {
    (recovery_count & 0xff) as u8
}

/// ブロック先頭のバイト列からチェックサムを計算する.
///
/// 対象はヘッダのチェックサムフィールドより前の部分と、`entry_count`個分のエントリ領域.
pub fn compute_block_checksum(block: &[u8], entry_count: u16) -> u32 {
    let mut adler = RollingAdler32::new();
    adler.update_buffer(&block[..CHECKSUM_OFFSET]);
    let entries_end = BLOCK_HEADER_SIZE + entry_count as usize * ENTRY_SIZE;
    adler.update_buffer(&block[BLOCK_HEADER_SIZE..entries_end]);
    adler.hash()
}

/// ジャーナルブロックのヘッダ.
///
/// ディスクレイアウト(リトルエンディアン):
///
/// ```text
///  0: u64 block_map_head
///  8: u64 slab_journal_head
/// 16: u64 sequence_number
/// 24: u64 nonce
/// 32: u8  recovery_count
/// 33: u8  check_byte
/// 34: u16 entry_count
/// 36: u64 logical_blocks_used
/// 44: u64 block_map_data_blocks
/// 52: u32 checksum
/// 56: [u8; 8] (予約領域)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBlockHeader {
    /// コミット時点のブロックマップ側の回収フロンティア.
    pub block_map_head: u64,

    /// コミット時点のスラブジャーナル側の回収フロンティア.
    pub slab_journal_head: u64,

    /// このブロックのシーケンス番号.
    pub sequence_number: u64,

    /// ジャーナルインスタンスを識別するノンス.
    pub nonce: u64,

    /// ジャーナル世代を表すバイト.
    pub recovery_count: u8,

    /// シーケンス番号から導出される検査バイト.
    pub check_byte: u8,

    /// ブロック内の有効なエントリ数.
    pub entry_count: u16,

    /// コミット時点の使用中論理ブロック数.
    pub logical_blocks_used: u64,

    /// コミット時点のブロックマップ用データブロック数.
    pub block_map_data_blocks: u64,

    /// ヘッダおよびエントリ領域のチェックサム.
    pub checksum: u32,
}
impl PackedBlockHeader {
    /// ヘッダを`block`の先頭へ書き込む.
    pub fn write_to(&self, block: &mut [u8]) {
        LittleEndian::write_u64(&mut block[0..8], self.block_map_head);
        LittleEndian::write_u64(&mut block[8..16], self.slab_journal_head);
        LittleEndian::write_u64(&mut block[16..24], self.sequence_number);
        LittleEndian::write_u64(&mut block[24..32], self.nonce);
        block[32] = self.recovery_count;
        block[33] = self.check_byte;
        LittleEndian::write_u16(&mut block[34..36], self.entry_count);
        LittleEndian::write_u64(&mut block[36..44], self.logical_blocks_used);
        LittleEndian::write_u64(&mut block[44..52], self.block_map_data_blocks);
        LittleEndian::write_u32(&mut block[52..56], self.checksum);
        for b in &mut block[56..BLOCK_HEADER_SIZE] {
            *b = 0;
        }
    }

    /// `block`の先頭からヘッダを読み出す.
    pub fn read_from(block: &[u8]) -> Self {
        PackedBlockHeader {
            block_map_head: LittleEndian::read_u64(&block[0..8]),
            slab_journal_head: LittleEndian::read_u64(&block[8..16]),
            sequence_number: LittleEndian::read_u64(&block[16..24]),
            nonce: LittleEndian::read_u64(&block[24..32]),
            recovery_count: block[32],
            check_byte: block[33],
            entry_count: LittleEndian::read_u16(&block[34..36]),
            logical_blocks_used: LittleEndian::read_u64(&block[36..44]),
            block_map_data_blocks: LittleEndian::read_u64(&block[44..52]),
            checksum: LittleEndian::read_u32(&block[52..56]),
        }
    }
}

/// ジャーナルに記録される一つのエントリ.
///
/// ディスクレイアウト(12バイト):
///
/// ```text
/// 0:    u4 操作種別 | u4 マッピング状態 (下位ニブルが操作種別)
/// 1..7: u48 論理ブロック番号 (LE)
/// 7..12: u40 物理ブロック番号 (LE)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedJournalEntry {
    /// 操作種別.
    pub operation: JournalOperation,

    /// マッピング状態.
    pub state: MappingState,

    /// 論理ブロック番号.
    pub logical: Lbn,

    /// 物理ブロック番号.
    pub pbn: Pbn,
}
impl PackedJournalEntry {
    /// エントリを12バイトのスロットへ書き込む.
    pub fn write_to(&self, slot: &mut [u8]) {
        slot[0] = self.operation.to_u8() | (self.state.to_nibble() << 4);
        LittleEndian::write_uint(&mut slot[1..7], self.logical.as_u64(), 6);
        LittleEndian::write_uint(&mut slot[7..12], self.pbn.as_u64(), 5);
    }

    /// 12バイトのスロットからエントリを読み出す.
    pub fn read_from(slot: &[u8]) -> Result<Self> {
        let operation = track_assert_some!(
            JournalOperation::from_u8(slot[0] & 0x0f),
            ErrorKind::InvalidInput
        );
        let state = track_assert_some!(
            MappingState::from_nibble(slot[0] >> 4),
            ErrorKind::InvalidInput
        );
        let logical = track_assert_some!(
            Lbn::from_u64(LittleEndian::read_uint(&slot[1..7], 6)),
            ErrorKind::InvalidInput
        );
        let pbn = track_assert_some!(
            Pbn::from_u64(LittleEndian::read_uint(&slot[7..12], 5)),
            ErrorKind::InvalidInput
        );
        Ok(PackedJournalEntry {
            operation,
            state,
            logical,
            pbn,
        })
    }

    /// ブロック内の`index`番目のスロットのバイト範囲を返す.
    pub fn slot_range(index: usize) -> std::ops::Range<usize> {
        let start = BLOCK_HEADER_SIZE + index * ENTRY_SIZE;
        start..start + ENTRY_SIZE
    }
}

/// 永続化されるジャーナルコンポーネントの状態.
///
/// ディスクレイアウト: コンポーネントヘッダ
/// `{u32 id, u32 major, u32 minor, u64 size}`に続けて、
/// `{u64 journal_start, u64 logical_blocks_used, u64 block_map_data_blocks}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalComponentState {
    /// ジャーナルの読み出し開始シーケンス番号.
    pub journal_start: u64,

    /// 使用中の論理ブロック数.
    pub logical_blocks_used: u64,

    /// ブロックマップ用に割り当てられたデータブロック数.
    pub block_map_data_blocks: u64,
}
impl JournalComponentState {
    /// エンコード後のサイズ(バイト単位)を返す.
    pub fn encoded_size() -> usize {
        COMPONENT_HEADER_SIZE + COMPONENT_STATE_SIZE as usize
    }

    /// 状態を`buf`の末尾へエンコードする.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.resize(start + Self::encoded_size(), 0);
        let buf = &mut buf[start..];
        LittleEndian::write_u32(&mut buf[0..4], COMPONENT_ID);
        LittleEndian::write_u32(&mut buf[4..8], MAJOR_VERSION);
        LittleEndian::write_u32(&mut buf[8..12], MINOR_VERSION);
        LittleEndian::write_u64(&mut buf[12..20], COMPONENT_STATE_SIZE);
        LittleEndian::write_u64(&mut buf[20..28], self.journal_start);
        LittleEndian::write_u64(&mut buf[28..36], self.logical_blocks_used);
        LittleEndian::write_u64(&mut buf[36..44], self.block_map_data_blocks);
    }

    /// `buf`の先頭から状態をデコードする.
    ///
    /// ヘッダの識別子・バージョン・サイズが一致しない場合には
    /// `ErrorKind::InvalidInput`エラーが返される.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        track_assert!(buf.len() >= Self::encoded_size(), ErrorKind::InvalidInput; buf.len());
        let id = LittleEndian::read_u32(&buf[0..4]);
        track_assert_eq!(id, COMPONENT_ID, ErrorKind::InvalidInput);
        let major = LittleEndian::read_u32(&buf[4..8]);
        let minor = LittleEndian::read_u32(&buf[8..12]);
        track_assert_eq!(major, MAJOR_VERSION, ErrorKind::InvalidInput);
        track_assert_eq!(minor, MINOR_VERSION, ErrorKind::InvalidInput);
        let size = LittleEndian::read_u64(&buf[12..20]);
        track_assert_eq!(size, COMPONENT_STATE_SIZE, ErrorKind::InvalidInput);
        Ok(JournalComponentState {
            journal_start: LittleEndian::read_u64(&buf[20..28]),
            logical_blocks_used: LittleEndian::read_u64(&buf[28..36]),
            block_map_data_blocks: LittleEndian::read_u64(&buf[36..44]),
        })
    }
}
