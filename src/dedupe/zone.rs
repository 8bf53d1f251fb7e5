//! ハッシュゾーン: ハッシュロックのマップ・プールとメンバー管理.
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::address::Pbn;
use crate::dedupe::hash_lock::{HashLock, HashLockState};
use crate::dedupe::PbnLock;
use crate::metrics::HashZoneMetrics;
use crate::vio::{ContentDigest, DataLocation, DataVio};

/// ハッシュゾーンに登録されたリクエストの識別子.
///
/// [`HashZone`]がリクエストを所有している間、このIDを通して参照・操作する.
///
/// [`HashZone`]: ./struct.HashZone.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VioId(pub(crate) usize);

/// ハッシュロックが利用者側の実行基盤へ依頼する非同期処理.
///
/// [`HashZone::poll_action`]で取り出し、処理の完了後に
/// 各アクションのドキュメントに記載された完了メソッドを呼び出すこと.
///
/// [`HashZone::poll_action`]: ./struct.HashZone.html#method.poll_action
#[derive(Debug)]
pub enum DedupeAction {
    /// 重複排除インデックスへの問い合わせ.
    ///
    /// 完了時には`finish_querying`を、失敗時には`continue_hash_lock_on_error`を呼び出す.
    CheckForDuplication {
        /// 問い合わせを実行するエージェント.
        vio: VioId,
    },

    /// 候補ブロックのリードロック取得.
    ///
    /// 物理ゾーンスレッド上で`PhysicalZone::lock_duplicate_pbn`を実行し、
    /// その結果を`finish_locking`へと渡す.
    LockDuplicatePbn {
        /// ロックを取得するエージェント.
        vio: VioId,
        /// 候補ブロックの位置.
        duplicate: DataLocation,
    },

    /// 候補ブロックの読み出しとバイト比較による検証.
    ///
    /// 完了時には`finish_verifying`を呼び出す.
    VerifyDuplication {
        /// 検証を実行するエージェント.
        vio: VioId,
        /// 候補ブロックの位置.
        duplicate: DataLocation,
    },

    /// 検証済みの重複ブロックへの参照追加(重複排除本体).
    ///
    /// ブロックマップ更新とジャーナル記入の完了後に`continue_hash_lock`を呼び出す.
    ShareBlock {
        /// 重複排除を行うリクエスト.
        vio: VioId,
        /// 参照先のブロック位置.
        duplicate: DataLocation,
    },

    /// データの圧縮および書き込み.
    ///
    /// 書き込み完了後、`vio`の`new_mapped`へ書き込み先を設定して
    /// `continue_hash_lock`を呼び出す.
    CompressAndWrite {
        /// 書き込みを行うリクエスト.
        vio: VioId,
    },

    /// 重複ブロックのリードロック解放.
    ///
    /// 物理ゾーンスレッド上で`PhysicalZone::release_pbn_lock`を実行し、
    /// その後`finish_unlocking`を呼び出す.
    ReleaseDuplicateLock {
        /// 解放を実行するエージェント.
        vio: VioId,
        /// ロック対象の物理ブロック番号.
        pbn: Pbn,
        /// 解放するロック.
        lock: Arc<PbnLock>,
    },

    /// 重複排除インデックスの更新.
    ///
    /// 完了時には`finish_updating`を呼び出す.
    UpdateDedupeIndex {
        /// 更新を実行するエージェント.
        vio: VioId,
    },

    /// パッカー内で待機中のエージェントの追い出し.
    ///
    /// 圧縮の中止(`cancel_compression`)だけではエージェントが
    /// パッカー内で停止したままとなり得るため、
    /// `vio`をパッカーへの一方向メッセージとして送り、エージェントの実行継続を保証する.
    RemoveLockHolderFromPacker {
        /// メッセージとして送られるリクエスト.
        vio: VioId,
        /// パッカーから追い出されるエージェント.
        agent: VioId,
    },
}

/// [`HashZone::acquire_hash_lock`]の結果.
///
/// [`HashZone::acquire_hash_lock`]: ./struct.HashZone.html#method.acquire_hash_lock
#[derive(Debug)]
pub enum AcquireResult {
    /// ロックへの参加に成功した. 続けて`enter_hash_lock`を呼び出すこと.
    Joined(VioId),

    /// ハッシュ衝突を検出した(ハッシュは一致するがデータが異なる).
    ///
    /// リクエストは返却され、重複排除を迂回して通常の書き込みパスを進む.
    Collision(DataVio),
}

/// `HashZone`のビルダ.
#[derive(Debug)]
pub struct HashZoneBuilder {
    logger: Logger,
    metrics: MetricBuilder,
}
impl HashZoneBuilder {
    /// 新しい`HashZoneBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        HashZoneBuilder {
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
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

    /// ハッシュゾーンを構築する.
    pub fn build(&self) -> HashZone {
        HashZone {
            logger: self.logger.clone(),
            metrics: HashZoneMetrics::new(&self.metrics),
            lock_map: HashMap::new(),
            locks: Vec::new(),
            free_locks: Vec::new(),
            vios: Vec::new(),
            free_vios: Vec::new(),
            actions: VecDeque::new(),
        }
    }
}
impl Default for HashZoneBuilder {
    fn default() -> Self {
        HashZoneBuilder::new()
    }
}

/// ハッシュゾーン.
///
/// コンテンツハッシュからハッシュロックへのマップと、ロックのプール、
/// およびゾーンに登録中のリクエスト群を所有する.
/// 全ての操作は、このゾーンを所有するハッシュゾーンスレッド上で行われる.
#[derive(Debug)]
pub struct HashZone {
    pub(crate) logger: Logger,
    pub(crate) metrics: HashZoneMetrics,
    pub(crate) lock_map: HashMap<ContentDigest, usize>,
    pub(crate) locks: Vec<HashLock>,
    pub(crate) free_locks: Vec<usize>,
    pub(crate) vios: Vec<Option<DataVio>>,
    pub(crate) free_vios: Vec<usize>,
    pub(crate) actions: VecDeque<DedupeAction>,
}
impl HashZone {
    /// デフォルト設定でハッシュゾーンを構築する.
    pub fn new() -> Self {
        HashZoneBuilder::new().build()
    }

    /// ゾーンのメトリクスを返す.
    pub fn metrics(&self) -> &HashZoneMetrics {
        &self.metrics
    }

    /// 依頼中の非同期処理を一つ取り出す.
    pub fn poll_action(&mut self) -> Option<DedupeAction> {
        self.actions.pop_front()
    }

    /// 登録中のリクエストを参照する.
    pub fn vio(&self, id: VioId) -> &DataVio {
        self.vios[id.0].as_ref().expect("registered vio")
    }

    /// 登録中のリクエストを可変参照する.
    pub fn vio_mut(&mut self, id: VioId) -> &mut DataVio {
        self.vios[id.0].as_mut().expect("registered vio")
    }

    /// 指定ハッシュのロックの現在の状態を返す.
    ///
    /// マップにロックが存在しない場合は`None`.
    pub fn lock_state_of(&self, digest: &ContentDigest) -> Option<HashLockState> {
        self.lock_map
            .get(digest)
            .map(|&index| self.locks[index].state)
    }

    /// 使用中のハッシュロックの数を返す.
    pub fn active_lock_count(&self) -> usize {
        self.locks.len() - self.free_locks.len()
    }

    /// リクエストをハッシュロックへと参加させる.
    ///
    /// ハッシュ衝突(同一ハッシュ・異内容)を検出した場合には、
    /// ロックには参加せずリクエストがそのまま返却される.
    /// 参加に成功した場合は、続けて
    /// [`enter_hash_lock`](#method.enter_hash_lock)を呼び出すこと.
    pub fn acquire_hash_lock(&mut self, vio: DataVio) -> AcquireResult {
        debug_assert!(vio.hash_lock.is_none(), "must not already hold a hash lock");

        let digest = vio.digest;
        let lock_index = match self.lock_map.get(&digest) {
            Some(&index) => index,
            None => {
                let index = self.allocate_lock(digest);
                self.lock_map.insert(digest, index);
                index
            }
        };

        if self.is_hash_collision(lock_index, &vio) {
            // ハッシュ衝突は極めて稀だが、誤った重複排除はデータ破壊となる。
            // ロックを持たせないことで重複排除を完全に迂回させる。
            return AcquireResult::Collision(vio);
        }

        let id = self.register_vio(vio);
        self.add_lock_member(id, lock_index);
        AcquireResult::Joined(id)
    }

    fn is_hash_collision(&mut self, lock_index: usize, candidate: &DataVio) -> bool {
        let holder = match self.locks[lock_index].members.first() {
            Some(&id) => id,
            None => return false,
        };
        let collides = *self.vio(holder).data != *candidate.data;
        if collides {
            self.metrics.hash_collisions.increment();
        } else {
            self.metrics.concurrent_data_matches.increment();
        }
        collides
    }

    pub(crate) fn allocate_lock(&mut self, digest: ContentDigest) -> usize {
        if let Some(index) = self.free_locks.pop() {
            self.locks[index].reset(digest);
            index
        } else {
            self.locks.push(HashLock::new(digest));
            self.locks.len() - 1
        }
    }

    pub(crate) fn register_vio(&mut self, vio: DataVio) -> VioId {
        if let Some(index) = self.free_vios.pop() {
            self.vios[index] = Some(vio);
            VioId(index)
        } else {
            self.vios.push(Some(vio));
            VioId(self.vios.len() - 1)
        }
    }

    pub(crate) fn take_vio(&mut self, id: VioId) -> DataVio {
        self.free_vios.push(id.0);
        self.vios[id.0].take().expect("registered vio")
    }

    pub(crate) fn add_lock_member(&mut self, id: VioId, lock_index: usize) {
        // メンバーは完了順が不定なため、データ比較用に常に一つは
        // 辿れるようリング(リスト)へと繋いでおく
        let lock = &mut self.locks[lock_index];
        lock.members.push(id);
        lock.reference_count += 1;
        if lock.reference_count > lock.max_references {
            lock.max_references = lock.reference_count;
        }
        let high_water = lock.max_references as f64;
        if high_water > self.metrics.max_references.value() {
            self.metrics.max_references.set(high_water);
        }
        self.vios[id.0].as_mut().expect("registered vio").hash_lock = Some(lock_index);
    }

    pub(crate) fn remove_lock_member(&mut self, id: VioId, lock_index: usize) {
        let lock = &mut self.locks[lock_index];
        debug_assert!(lock.reference_count > 0);
        lock.members.retain(|&member| member != id);
        lock.reference_count -= 1;
        self.vios[id.0].as_mut().expect("registered vio").hash_lock = None;
    }

    pub(crate) fn return_lock_to_zone(&mut self, lock_index: usize) {
        let digest = self.locks[lock_index].digest;
        if self.lock_map.get(&digest) == Some(&lock_index) {
            self.lock_map.remove(&digest);
        }
        self.free_locks.push(lock_index);
    }
}
impl Default for HashZone {
    fn default() -> Self {
        HashZone::new()
    }
}
