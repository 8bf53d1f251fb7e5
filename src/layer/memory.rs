use std::collections::VecDeque;
use trackable::error::ErrorKindExt;

use crate::layer::{IoCompletion, IoToken, PhysicalLayer, WritePolicy, BLOCK_SIZE};
use crate::{Error, ErrorKind, Result};

#[derive(Debug)]
struct PendingIo {
    token: IoToken,
    block: Option<u64>,
    data: Vec<u8>,
    fail: bool,
}

/// メモリベースの`PhysicalLayer`の実装.
///
/// # 注意
///
/// これは主にテストや性能計測用途を意図した実装であり、
/// `PhysicalLayer`が本来要求する"不揮発性"は満たしていない.
///
/// デフォルトでは発行されたI/Oは即座に実行され、完了通知キューへと積まれる.
/// `manual_completion()`を呼び出した場合には、
/// テスト側が`complete_next()`で明示的に完了させるまでI/Oは保留される.
/// これにより、複数の書き込みが同時に実行中となる状況を決定的に再現できる.
#[derive(Debug)]
pub struct MemoryLayer {
    blocks: Vec<u8>,
    policy: WritePolicy,
    auto_complete: bool,
    pending: VecDeque<PendingIo>,
    ready: VecDeque<IoCompletion>,
    fail_next_writes: usize,
    fail_next_flushes: usize,
    flush_count: u64,
}
impl MemoryLayer {
    /// `block_count`ブロック分の容量を持つ新しい`MemoryLayer`インスタンスを生成する.
    ///
    /// 書き込みポリシーは`Async`となる.
    pub fn new(block_count: u64) -> Self {
        MemoryLayer {
            blocks: vec![0; block_count as usize * BLOCK_SIZE],
            policy: WritePolicy::Async,
            auto_complete: true,
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            fail_next_writes: 0,
            fail_next_flushes: 0,
            flush_count: 0,
        }
    }

    /// 書き込みポリシーを設定する.
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// I/Oの完了をテスト側が制御するモードに切り替える.
    pub fn manual_completion(mut self) -> Self {
        self.auto_complete = false;
        self
    }

    /// 以降に発行される`count`個のブロック書き込みを失敗させる.
    pub fn inject_write_error(&mut self, count: usize) {
        self.fail_next_writes += count;
    }

    /// 以降に発行される`count`個のフラッシュを失敗させる.
    pub fn inject_flush_error(&mut self, count: usize) {
        self.fail_next_flushes += count;
    }

    /// 保留中のI/Oを一つ完了させる.
    ///
    /// 完了させるI/Oが存在した場合には`true`を返す.
    pub fn complete_next(&mut self) -> bool {
        if let Some(io) = self.pending.pop_front() {
            self.apply(io);
            true
        } else {
            false
        }
    }

    /// 保留中のI/Oを全て完了させる.
    pub fn complete_all(&mut self) {
        while self.complete_next() {}
    }

    /// 保留中のI/Oの数を返す.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 発行されたフラッシュの累計数を返す.
    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// `index`番目のブロックの現在の内容を返す.
    pub fn block_bytes(&self, index: u64) -> &[u8] {
        let offset = index as usize * BLOCK_SIZE;
        &self.blocks[offset..offset + BLOCK_SIZE]
    }

    fn apply(&mut self, io: PendingIo) {
        let result = if io.fail {
            Err(track!(Error::from(ErrorKind::Other.cause("injected I/O error"))))
        } else {
            if let Some(block) = io.block {
                let offset = block as usize * BLOCK_SIZE;
                self.blocks[offset..offset + io.data.len()].copy_from_slice(&io.data);
            }
            Ok(())
        };
        self.ready.push_back(IoCompletion {
            token: io.token,
            result,
        });
    }

    fn submit(&mut self, io: PendingIo) {
        if self.auto_complete {
            self.apply(io);
        } else {
            self.pending.push_back(io);
        }
    }
}
impl PhysicalLayer for MemoryLayer {
    fn write_policy(&self) -> WritePolicy {
        self.policy
    }

    fn submit_block_write(&mut self, block: u64, data: &[u8], token: IoToken) -> Result<()> {
        track_assert_eq!(data.len(), BLOCK_SIZE, ErrorKind::InvalidInput);
        track_assert!(
            (block as usize + 1) * BLOCK_SIZE <= self.blocks.len(),
            ErrorKind::InvalidInput; block
        );
        let fail = if self.fail_next_writes > 0 {
            self.fail_next_writes -= 1;
            true
        } else {
            false
        };
        self.submit(PendingIo {
            token,
            block: Some(block),
            data: data.to_vec(),
            fail,
        });
        Ok(())
    }

    fn submit_flush(&mut self, token: IoToken) -> Result<()> {
        self.flush_count += 1;
        let fail = if self.fail_next_flushes > 0 {
            self.fail_next_flushes -= 1;
            true
        } else {
            false
        };
        self.submit(PendingIo {
            token,
            block: None,
            data: Vec::new(),
            fail,
        });
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<IoCompletion> {
        self.ready.pop_front()
    }
}
