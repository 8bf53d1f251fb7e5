use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::layer::{IoCompletion, IoToken, PhysicalLayer, WritePolicy, BLOCK_SIZE};
use crate::{ErrorKind, Result};

/// `FileLayer`のビルダ.
#[derive(Debug)]
pub struct FileLayerBuilder {
    direct_io: bool,
    policy: WritePolicy,
}
impl FileLayerBuilder {
    /// 新しい`FileLayerBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        FileLayerBuilder {
            direct_io: false,
            policy: WritePolicy::Async,
        }
    }

    /// ダイレクトI/O(`O_DIRECT`)の有効・無効を設定する.
    ///
    /// デフォルトでは無効.
    ///
    /// Linux以外のプラットフォームでは指定は無視される.
    pub fn direct_io(&mut self, enabled: bool) -> &mut Self {
        self.direct_io = enabled;
        self
    }

    /// 書き込みポリシーを設定する.
    ///
    /// デフォルトは`Async`.
    pub fn write_policy(&mut self, policy: WritePolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    /// `block_count`ブロック分のジャーナルパーティションをファイルとして作成する.
    pub fn create<P: AsRef<Path>>(&self, path: P, block_count: u64) -> Result<FileLayer> {
        let file = track_io!(self.open_options(true).open(path))?;
        track_io!(file.set_len(block_count * BLOCK_SIZE as u64))?;
        Ok(FileLayer::with_file(file, block_count, self.policy))
    }

    /// 既存のジャーナルパーティションをファイルとして開く.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<FileLayer> {
        let file = track_io!(self.open_options(false).open(path))?;
        let len = track_io!(file.metadata())?.len();
        track_assert_eq!(len % BLOCK_SIZE as u64, 0, ErrorKind::InvalidInput; len);
        Ok(FileLayer::with_file(
            file,
            len / BLOCK_SIZE as u64,
            self.policy,
        ))
    }

    #[cfg(target_os = "linux")]
    fn open_options(&self, create: bool) -> OpenOptions {
        use std::os::unix::fs::OpenOptionsExt;

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(create);
        if self.direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        options
    }

    #[cfg(not(target_os = "linux"))]
    fn open_options(&self, create: bool) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(create);
        options
    }
}
impl Default for FileLayerBuilder {
    fn default() -> Self {
        FileLayerBuilder::new()
    }
}

/// ファイルベースの`PhysicalLayer`の実装.
///
/// ジャーナル専用パーティション(またはそれに相当するファイル)を想定しており、
/// `block`番目のブロックはファイル先頭から`block * BLOCK_SIZE`バイトの位置に書かれる.
///
/// I/Oは発行元スレッド上で同期的に実行され、完了通知は次の`poll_completion`で返される.
/// `WritePolicy::Sync`の場合には、各ブロック書き込みの完了前に`fdatasync`相当の同期が行われる.
#[derive(Debug)]
pub struct FileLayer {
    file: File,
    block_count: u64,
    policy: WritePolicy,
    completions: VecDeque<IoCompletion>,
}
impl FileLayer {
    fn with_file(file: File, block_count: u64, policy: WritePolicy) -> Self {
        FileLayer {
            file,
            block_count,
            policy,
            completions: VecDeque::new(),
        }
    }

    /// パーティションの容量(ブロック数)を返す.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    fn execute_write(&mut self, block: u64, data: &[u8]) -> Result<()> {
        track_io!(self.file.seek(SeekFrom::Start(block * BLOCK_SIZE as u64)))?;
        track_io!(self.file.write_all(data))?;
        if self.policy == WritePolicy::Sync {
            track_io!(self.file.sync_data())?;
        }
        Ok(())
    }
}
impl PhysicalLayer for FileLayer {
    fn write_policy(&self) -> WritePolicy {
        self.policy
    }

    fn submit_block_write(&mut self, block: u64, data: &[u8], token: IoToken) -> Result<()> {
        track_assert_eq!(data.len(), BLOCK_SIZE, ErrorKind::InvalidInput);
        track_assert!(block < self.block_count, ErrorKind::InvalidInput; block, self.block_count);
        let result = track!(self.execute_write(block, data));
        self.completions.push_back(IoCompletion { token, result });
        Ok(())
    }

    fn submit_flush(&mut self, token: IoToken) -> Result<()> {
        let result = track_io!(self.file.sync_data());
        self.completions.push_back(IoCompletion { token, result });
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<IoCompletion> {
        self.completions.pop_front()
    }
}
