//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

/// リカバリジャーナルのメトリクス.
#[derive(Debug, Clone)]
pub struct RecoveryJournalMetrics {
    pub(crate) blocks_started: Counter,
    pub(crate) blocks_written: Counter,
    pub(crate) blocks_committed: Counter,
    pub(crate) entries_started: Counter,
    pub(crate) entries_written: Counter,
    pub(crate) entries_committed: Counter,
    pub(crate) disk_full: Counter,
    pub(crate) slab_journal_commits_requested: Counter,
}
impl RecoveryJournalMetrics {
    /// 使用が開始されたジャーナルブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_recovery_journal_blocks_total { phase="started" } <COUNTER>
    /// ```
    pub fn blocks_started(&self) -> u64 {
        self.blocks_started.value() as u64
    }

    /// 書き込みが発行されたジャーナルブロックの数.
    ///
    /// 同一ブロックが部分コミットで複数回書かれた場合、その回数分カウントされる.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_recovery_journal_blocks_total { phase="written" } <COUNTER>
    /// ```
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.value() as u64
    }

    /// 書き込みが完了したジャーナルブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_recovery_journal_blocks_total { phase="committed" } <COUNTER>
    /// ```
    pub fn blocks_committed(&self) -> u64 {
        self.blocks_committed.value() as u64
    }

    /// ジャーナルブロック内のスロットに割り当てられたエントリの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_recovery_journal_entries_total { phase="started" } <COUNTER>
    /// ```
    pub fn entries_started(&self) -> u64 {
        self.entries_started.value() as u64
    }

    /// 書き込みが発行されたエントリの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_recovery_journal_entries_total { phase="written" } <COUNTER>
    /// ```
    pub fn entries_written(&self) -> u64 {
        self.entries_written.value() as u64
    }

    /// 永続化が完了したエントリの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_recovery_journal_entries_total { phase="committed" } <COUNTER>
    /// ```
    pub fn entries_committed(&self) -> u64 {
        self.entries_committed.value() as u64
    }

    /// ジャーナルが満杯のためにエントリの割り当てを拒否した回数.
    ///
    /// これは致命的なエラーではなく、領域回収後に割り当てはリトライされる.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_recovery_journal_disk_full_total <COUNTER>
    /// ```
    pub fn disk_full(&self) -> u64 {
        self.disk_full.value() as u64
    }

    /// スラブジャーナルへ末尾ブロックのコミットを要求した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_recovery_journal_slab_journal_commits_requested_total <COUNTER>
    /// ```
    pub fn slab_journal_commits_requested(&self) -> u64 {
        self.slab_journal_commits_requested.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("dedupvd").subsystem("recovery_journal");
        RecoveryJournalMetrics {
            blocks_started: builder
                .counter("blocks_total")
                .help("Number of journal blocks processed")
                .label("phase", "started")
                .finish()
                .expect("Never fails"),
            blocks_written: builder
                .counter("blocks_total")
                .help("Number of journal blocks processed")
                .label("phase", "written")
                .finish()
                .expect("Never fails"),
            blocks_committed: builder
                .counter("blocks_total")
                .help("Number of journal blocks processed")
                .label("phase", "committed")
                .finish()
                .expect("Never fails"),
            entries_started: builder
                .counter("entries_total")
                .help("Number of journal entries processed")
                .label("phase", "started")
                .finish()
                .expect("Never fails"),
            entries_written: builder
                .counter("entries_total")
                .help("Number of journal entries processed")
                .label("phase", "written")
                .finish()
                .expect("Never fails"),
            entries_committed: builder
                .counter("entries_total")
                .help("Number of journal entries processed")
                .label("phase", "committed")
                .finish()
                .expect("Never fails"),
            disk_full: builder
                .counter("disk_full_total")
                .help("Number of times an entry assignment was deferred because the journal was full")
                .finish()
                .expect("Never fails"),
            slab_journal_commits_requested: builder
                .counter("slab_journal_commits_requested_total")
                .help("Number of slab journal tail block commits requested")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// ハッシュゾーンのメトリクス.
#[derive(Debug, Clone)]
pub struct HashZoneMetrics {
    pub(crate) dedupe_advice_valid: Counter,
    pub(crate) dedupe_advice_stale: Counter,
    pub(crate) hash_collisions: Counter,
    pub(crate) concurrent_data_matches: Counter,
    pub(crate) max_references: Gauge,
}
impl HashZoneMetrics {
    /// インデックスからのアドバイスが検証の結果有効であった回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_hash_zone_dedupe_advice_total { kind="valid" } <COUNTER>
    /// ```
    pub fn dedupe_advice_valid(&self) -> u64 {
        self.dedupe_advice_valid.value() as u64
    }

    /// インデックスからのアドバイスが陳腐化していた回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_hash_zone_dedupe_advice_total { kind="stale" } <COUNTER>
    /// ```
    pub fn dedupe_advice_stale(&self) -> u64 {
        self.dedupe_advice_stale.value() as u64
    }

    /// コンテンツハッシュは一致したがデータが異なっていた(ハッシュ衝突)回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_hash_zone_hash_collisions_total <COUNTER>
    /// ```
    pub fn hash_collisions(&self) -> u64 {
        self.hash_collisions.value() as u64
    }

    /// 処理中のロックに同一データのリクエストが合流した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_hash_zone_concurrent_data_matches_total <COUNTER>
    /// ```
    pub fn concurrent_data_matches(&self) -> u64 {
        self.concurrent_data_matches.value() as u64
    }

    /// 一つのハッシュロックを同時に参照したリクエスト数の最大値.
    ///
    /// 並行した重複排除がどの程度起きているかの目安となる.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dedupvd_hash_zone_max_references <GAUGE>
    /// ```
    pub fn max_references(&self) -> u64 {
        self.max_references.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("dedupvd").subsystem("hash_zone");
        HashZoneMetrics {
            dedupe_advice_valid: builder
                .counter("dedupe_advice_total")
                .help("Number of dedupe advice verifications")
                .label("kind", "valid")
                .finish()
                .expect("Never fails"),
            dedupe_advice_stale: builder
                .counter("dedupe_advice_total")
                .help("Number of dedupe advice verifications")
                .label("kind", "stale")
                .finish()
                .expect("Never fails"),
            hash_collisions: builder
                .counter("hash_collisions_total")
                .help("Number of content hash collisions detected")
                .finish()
                .expect("Never fails"),
            concurrent_data_matches: builder
                .counter("concurrent_data_matches_total")
                .help("Number of requests that joined a hash lock with matching data")
                .finish()
                .expect("Never fails"),
            max_references: builder
                .gauge("max_references")
                .help("Maximum number of requests that have concurrently referenced a single hash lock")
                .finish()
                .expect("Never fails"),
        }
    }
}
