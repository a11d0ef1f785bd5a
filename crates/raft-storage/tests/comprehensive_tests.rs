//! # comprehensive storage tests
//!
//! why: verify all durable log scenarios work correctly
//! relations: tests raft-storage crate
//! what: sequencing, batches, trims, iterators, transactions, crash recovery, hooks, codecs

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use raft_storage::{
    Codec, Crc32Codec, IndexEntry, Log, LogConfig, LogError, LogHooks, Result, Seq, TxnLock,
};
use tempfile::tempdir;

fn config(dir: &Path) -> LogConfig {
    LogConfig::new(dir, "node")
}

async fn open_log(dir: &Path) -> Log {
    let log = Log::new(config(dir));
    log.open().await.unwrap();
    log
}

fn bodies(items: &[&str]) -> Vec<Vec<u8>> {
    items.iter().map(|s| s.as_bytes().to_vec()).collect()
}

async fn read_all(log: &Log, from: Seq) -> Vec<Vec<u8>> {
    log.iter(from).unwrap().collect_bodies().await.unwrap()
}

// =============================================================================
// SECTION 1: LIFECYCLE TESTS
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn open_creates_three_streams() {
        let dir = tempdir().unwrap();
        let _log = open_log(dir.path()).await;

        assert!(dir.path().join("node.body").exists());
        assert!(dir.path().join("node.index").exists());
        assert!(dir.path().join("node.lock").exists());
    }

    #[tokio::test]
    async fn open_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let _log = open_log(&nested).await;

        assert!(nested.join("node.index").exists());
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"x", None).await.unwrap();

        log.open().await.unwrap();

        assert_eq!(log.seq(), 0);
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_open() {
        let dir = tempdir().unwrap();
        let log = Log::new(config(dir.path()));

        let (a, b) = tokio::join!(log.open(), log.open());
        a.unwrap();
        b.unwrap();

        assert!(log.is_open());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_resets_view() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"x", None).await.unwrap();

        log.close().await.unwrap();
        log.close().await.unwrap();

        assert!(!log.is_open());
        assert_eq!(log.seq(), -1);
        assert!(log.head().is_none());
    }

    #[tokio::test]
    async fn operations_on_closed_log_fail() {
        let dir = tempdir().unwrap();
        let log = Log::new(config(dir.path()));

        assert!(matches!(log.append(b"x", None).await, Err(LogError::Closed)));
        assert!(matches!(log.iter(0), Err(LogError::Closed)));
    }

    #[tokio::test]
    async fn del_requires_closed_log() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        assert!(matches!(log.del().await, Err(LogError::Open)));

        log.close().await.unwrap();
        log.del().await.unwrap();
        assert!(!dir.path().join("node.body").exists());
        assert!(!dir.path().join("node.index").exists());
        assert!(!dir.path().join("node.lock").exists());
    }

    #[tokio::test]
    async fn del_then_reopen_starts_empty() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"x", None).await.unwrap();
        log.close().await.unwrap();
        log.del().await.unwrap();

        log.open().await.unwrap();

        assert_eq!(log.seq(), -1);
    }

    #[tokio::test]
    async fn close_waits_for_pending_transaction() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        let mut txn = log.txn(TxnLock::Current).await.unwrap();

        let closer = {
            let log = log.clone();
            tokio::spawn(async move { log.close().await })
        };
        tokio::task::yield_now().await;
        assert!(!closer.is_finished());

        txn.append(b"late").await.unwrap();
        txn.commit().await.unwrap();
        closer.await.unwrap().unwrap();

        let log = open_log(dir.path()).await;
        assert_eq!(log.seq(), 0);
    }
}

// =============================================================================
// SECTION 2: SEQUENCING TESTS
// =============================================================================

mod sequencing {
    use super::*;

    #[tokio::test]
    async fn sequence_numbers_start_at_zero() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        assert_eq!(log.append(b"a", None).await.unwrap(), 0);
        assert_eq!(log.append(b"b", None).await.unwrap(), 1);
        assert_eq!(log.append(b"c", None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn explicit_next_sequence_is_accepted() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        assert_eq!(log.append(b"a", Some(0)).await.unwrap(), 0);
        assert_eq!(log.append(b"b", Some(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn gap_is_rejected_without_state_change() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"a", None).await.unwrap();

        let err = log.append(b"b", Some(5)).await.unwrap_err();

        assert!(matches!(err, LogError::Sequence { expected: 1, actual: 5 }));
        assert_eq!(log.seq(), 0);
        assert_eq!(log.head().unwrap().body, b"a".to_vec());
    }

    #[tokio::test]
    async fn replayed_sequence_is_rejected() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"a", None).await.unwrap();

        let err = log.append(b"again", Some(0)).await.unwrap_err();

        assert!(matches!(err, LogError::Sequence { .. }));
        assert_eq!(read_all(&log, 0).await, bodies(&["a"]));
    }

    #[tokio::test]
    async fn zero_length_bodies_are_records() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        log.append(b"", None).await.unwrap();
        log.append(b"", None).await.unwrap();

        assert_eq!(log.seq(), 1);
        assert_eq!(read_all(&log, 0).await, vec![Vec::new(), Vec::new()]);
    }

    #[tokio::test]
    async fn concurrent_appends_stay_gapless() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move { log.append(&[i], None).await }));
        }
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap().unwrap());
        }
        seqs.sort_unstable();

        assert_eq!(seqs, (0..8).collect::<Vec<Seq>>());
        assert_eq!(log.seq(), 7);
    }
}

// =============================================================================
// SECTION 3: BATCH TESTS
// =============================================================================

mod batches {
    use super::*;

    #[tokio::test]
    async fn batch_returns_first_sequence() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"a", None).await.unwrap();

        let first = log
            .append_batch(&bodies(&["b", "c", "d"]), None)
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(log.seq(), 3);
        assert_eq!(log.head().unwrap().body, b"d".to_vec());
    }

    #[tokio::test]
    async fn batch_with_wrong_sequence_leaves_log_unchanged() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"a", None).await.unwrap();

        let err = log
            .append_batch(&bodies(&["b", "c"]), Some(3))
            .await
            .unwrap_err();

        assert!(matches!(err, LogError::Sequence { expected: 1, actual: 3 }));
        assert_eq!(read_all(&log, 0).await, bodies(&["a"]));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        let err = log.append_batch::<Vec<u8>>(&[], None).await.unwrap_err();

        assert!(matches!(err, LogError::EmptyBatch));
    }

    #[tokio::test]
    async fn batch_records_are_contiguous_on_disk() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["aa", "bbb", "c"]), None)
            .await
            .unwrap();

        let mut iter = log.iter(0).unwrap();
        let mut expected_offset = 0;
        while let Some(record) = iter.next().await.unwrap() {
            assert_eq!(record.offset, expected_offset);
            expected_offset += record.length;
        }
    }
}

// =============================================================================
// SECTION 4: TRIM TESTS
// =============================================================================

mod trimming {
    use super::*;

    #[tokio::test]
    async fn trim_discards_later_records() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b", "c", "d"]), None)
            .await
            .unwrap();

        log.trim(1).await.unwrap();

        assert_eq!(log.seq(), 1);
        assert_eq!(log.head().unwrap().body, b"b".to_vec());
        assert_eq!(read_all(&log, 0).await, bodies(&["a", "b"]));
        assert!(log.get(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn trim_minus_one_empties_log() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b"]), None).await.unwrap();

        log.trim(-1).await.unwrap();

        assert_eq!(log.seq(), -1);
        assert!(log.head().is_none());
        assert_eq!(log.append(b"fresh", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trim_beyond_tail_is_noop() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b"]), None).await.unwrap();

        log.trim(10).await.unwrap();

        assert_eq!(log.seq(), 1);
    }

    #[tokio::test]
    async fn trim_rejects_negative_targets() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        assert!(matches!(log.trim(-2).await, Err(LogError::InvalidSeq(-2))));
    }

    #[tokio::test]
    async fn trimmed_log_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let log = open_log(dir.path()).await;
            log.append_batch(&bodies(&["a", "b", "c"]), None)
                .await
                .unwrap();
            log.trim(0).await.unwrap();
            log.append(b"z", None).await.unwrap();
            log.close().await.unwrap();
        }

        let log = open_log(dir.path()).await;
        assert_eq!(log.seq(), 1);
        assert_eq!(read_all(&log, 0).await, bodies(&["a", "z"]));
    }
}

// =============================================================================
// SECTION 5: ITERATOR TESTS
// =============================================================================

mod iteration {
    use super::*;

    #[tokio::test]
    async fn iterates_from_start_sequence() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b", "c", "d"]), None)
            .await
            .unwrap();

        assert_eq!(read_all(&log, 2).await, bodies(&["c", "d"]));
    }

    #[tokio::test]
    async fn small_step_reads_everything() {
        let dir = tempdir().unwrap();
        let log = Log::new(config(dir.path()).with_step(2));
        log.open().await.unwrap();
        let items: Vec<Vec<u8>> = (0..7u8).map(|i| vec![i; i as usize]).collect();
        log.append_batch(&items, None).await.unwrap();

        assert_eq!(read_all(&log, 0).await, items);
    }

    #[tokio::test]
    async fn iterator_bound_is_a_snapshot() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b"]), None).await.unwrap();

        let iter = log.iter(0).unwrap();
        log.append(b"c", None).await.unwrap();

        assert_eq!(iter.bound(), 1);
        assert_eq!(iter.collect_bodies().await.unwrap(), bodies(&["a", "b"]));
    }

    #[tokio::test]
    async fn start_past_tail_yields_nothing() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"a", None).await.unwrap();

        let mut iter = log.iter(5).unwrap();

        assert!(iter.next().await.unwrap().is_none());
        assert!(iter.is_closed());
    }

    #[tokio::test]
    async fn negative_start_is_rejected() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        assert!(matches!(log.iter(-1), Err(LogError::InvalidSeq(-1))));
    }

    #[tokio::test]
    async fn trim_at_position_closes_iterator() {
        let dir = tempdir().unwrap();
        let log = Log::new(config(dir.path()).with_step(1));
        log.open().await.unwrap();
        log.append_batch(&bodies(&["a", "b", "c", "d"]), None)
            .await
            .unwrap();

        let mut iter = log.iter(0).unwrap();
        assert_eq!(iter.next().await.unwrap().unwrap().body, b"a".to_vec());
        assert_eq!(iter.next().await.unwrap().unwrap().body, b"b".to_vec());

        log.trim(0).await.unwrap();

        assert!(iter.next().await.unwrap().is_none());
        assert!(iter.is_closed());
    }

    #[tokio::test]
    async fn trim_ahead_of_position_lowers_bound() {
        let dir = tempdir().unwrap();
        let log = Log::new(config(dir.path()).with_step(1));
        log.open().await.unwrap();
        log.append_batch(&bodies(&["a", "b", "c", "d"]), None)
            .await
            .unwrap();

        let mut iter = log.iter(0).unwrap();
        assert_eq!(iter.next().await.unwrap().unwrap().seq, 0);

        log.trim(1).await.unwrap();
        log.append_batch(&bodies(&["x", "y"]), None).await.unwrap();

        assert_eq!(iter.bound(), 1);
        assert_eq!(iter.next().await.unwrap().unwrap().body, b"b".to_vec());
        assert!(iter.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn buffered_records_are_not_returned_after_trim() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b", "c"]), None)
            .await
            .unwrap();

        let mut iter = log.iter(0).unwrap();
        // the default step buffers all three records on the first advance
        assert_eq!(iter.next().await.unwrap().unwrap().seq, 0);

        log.trim(0).await.unwrap();

        assert!(iter.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closing_log_closes_iterators() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b"]), None).await.unwrap();
        let mut iter = log.iter(0).unwrap();

        log.close().await.unwrap();

        assert!(iter.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_adapter_yields_records() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b", "c"]), None)
            .await
            .unwrap();

        let seqs: Vec<Seq> = log
            .iter(1)
            .unwrap()
            .into_stream()
            .map(|record| record.unwrap().seq)
            .collect()
            .await;

        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn get_reads_single_record() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b"]), None).await.unwrap();

        assert_eq!(log.get(1).await.unwrap().unwrap().body, b"b".to_vec());
        assert!(log.get(2).await.unwrap().is_none());
        assert!(log.get(-1).await.unwrap().is_none());
    }
}

// =============================================================================
// SECTION 6: TRANSACTION TESTS
// =============================================================================

mod transactions {
    use super::*;

    #[tokio::test]
    async fn appends_are_invisible_until_commit() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        let mut txn = log.txn(TxnLock::Current).await.unwrap();
        assert_eq!(txn.append(b"a").await.unwrap(), 0);
        assert_eq!(txn.append(b"b").await.unwrap(), 1);
        assert_eq!(log.seq(), -1);

        txn.commit().await.unwrap();
        assert_eq!(log.seq(), 1);
    }

    #[tokio::test]
    async fn abort_rolls_back_every_append() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"keep", None).await.unwrap();

        let mut txn = log.txn(TxnLock::Current).await.unwrap();
        txn.append(b"drop-1").await.unwrap();
        txn.append(b"drop-2").await.unwrap();
        txn.abort().await.unwrap();

        assert_eq!(log.seq(), 0);
        assert_eq!(read_all(&log, 0).await, bodies(&["keep"]));
        assert_eq!(log.append(b"next", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn finished_transaction_rejects_operations() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;

        let mut txn = log.txn(TxnLock::Current).await.unwrap();
        txn.commit().await.unwrap();

        assert!(matches!(txn.append(b"x").await, Err(LogError::TxnFinished)));
        assert!(matches!(txn.commit().await, Err(LogError::TxnFinished)));
        assert!(matches!(txn.abort().await, Err(LogError::TxnFinished)));
        assert!(matches!(txn.lock(0).await, Err(LogError::TxnFinished)));
    }

    #[tokio::test]
    async fn second_transaction_waits_for_first() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        let mut first = log.txn(TxnLock::Current).await.unwrap();

        let second = {
            let log = log.clone();
            tokio::spawn(async move {
                let mut txn = log.txn(TxnLock::Current).await.unwrap();
                let seq = txn.append(b"second").await.unwrap();
                txn.commit().await.unwrap();
                seq
            })
        };
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        first.append(b"first").await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(second.await.unwrap(), 1);
        assert_eq!(read_all(&log, 0).await, bodies(&["first", "second"]));
    }

    #[tokio::test]
    async fn trim_and_reappend_in_one_transaction() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b", "c"]), None)
            .await
            .unwrap();

        let mut txn = log.txn(TxnLock::Current).await.unwrap();
        txn.trim(0).await.unwrap();
        assert_eq!(txn.append(b"x").await.unwrap(), 1);
        txn.commit().await.unwrap();

        assert_eq!(read_all(&log, 0).await, bodies(&["a", "x"]));
    }

    #[tokio::test]
    async fn aborted_trim_stays_trimmed() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append_batch(&bodies(&["a", "b", "c"]), None)
            .await
            .unwrap();

        let mut txn = log.txn(TxnLock::Current).await.unwrap();
        txn.trim(0).await.unwrap();
        txn.append(b"x").await.unwrap();
        txn.abort().await.unwrap();

        assert_eq!(log.seq(), 0);
        assert_eq!(read_all(&log, 0).await, bodies(&["a"]));
    }

    #[tokio::test]
    async fn dropped_transaction_is_rolled_back() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.append(b"keep", None).await.unwrap();

        {
            let mut txn = log.txn(TxnLock::Current).await.unwrap();
            txn.append(b"lost").await.unwrap();
        }

        // the background rollback holds the write lock until it finishes
        let txn = log.txn(TxnLock::None).await.unwrap();
        assert_eq!(txn.seq(), 0);
        drop(txn);
        assert_eq!(read_all(&log, 0).await, bodies(&["keep"]));
    }

    #[tokio::test]
    async fn closing_log_rejects_queued_transactions() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path()).await;
        let mut held = log.txn(TxnLock::Current).await.unwrap();

        let closer = {
            let log = log.clone();
            tokio::spawn(async move { log.close().await })
        };
        tokio::task::yield_now().await;

        assert!(matches!(
            log.txn(TxnLock::Current).await,
            Err(LogError::Closing)
        ));

        held.commit().await.unwrap();
        closer.await.unwrap().unwrap();
    }
}

// =============================================================================
// SECTION 7: CRASH RECOVERY TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[tokio::test]
    async fn interrupted_append_is_undone_on_open() {
        let dir = tempdir().unwrap();
        let crashed = open_log(dir.path()).await;
        crashed.append_batch(&bodies(&["a", "b"]), None).await.unwrap();

        let mut txn = crashed.txn(TxnLock::Current).await.unwrap();
        txn.append(b"partial").await.unwrap();
        // the process dies between "data written" and "lock cleared"
        std::mem::forget(txn);

        let log = open_log(dir.path()).await;
        assert_eq!(log.seq(), 1);
        assert_eq!(log.head().unwrap().body, b"b".to_vec());
        assert_eq!(read_all(&log, 0).await, bodies(&["a", "b"]));
    }

    #[tokio::test]
    async fn interrupted_batch_is_undone_entirely() {
        let dir = tempdir().unwrap();
        let crashed = open_log(dir.path()).await;
        crashed.append(b"a", None).await.unwrap();

        let mut txn = crashed.txn(TxnLock::Current).await.unwrap();
        txn.append_batch(&bodies(&["b", "c", "d"])).await.unwrap();
        std::mem::forget(txn);

        let log = open_log(dir.path()).await;
        assert_eq!(log.seq(), 0);
    }

    #[tokio::test]
    async fn lock_without_data_is_harmless() {
        let dir = tempdir().unwrap();
        let crashed = open_log(dir.path()).await;
        crashed.append(b"a", None).await.unwrap();

        let txn = crashed.txn(TxnLock::Current).await.unwrap();
        std::mem::forget(txn);

        let log = open_log(dir.path()).await;
        assert_eq!(log.seq(), 0);
        assert_eq!(std::fs::metadata(dir.path().join("node.lock")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn interrupted_trim_finishes_forward() {
        let dir = tempdir().unwrap();
        let crashed = open_log(dir.path()).await;
        crashed
            .append_batch(&bodies(&["a", "b", "c"]), None)
            .await
            .unwrap();

        let mut txn = crashed.txn(TxnLock::At(0)).await.unwrap();
        txn.append(b"never").await.unwrap();
        std::mem::forget(txn);

        let log = open_log(dir.path()).await;
        assert_eq!(log.seq(), 0);
        assert_eq!(read_all(&log, 0).await, bodies(&["a"]));
    }

    #[tokio::test]
    async fn reopening_is_idempotent() {
        let dir = tempdir().unwrap();
        let crashed = open_log(dir.path()).await;
        crashed.append(b"a", None).await.unwrap();
        let mut txn = crashed.txn(TxnLock::Current).await.unwrap();
        txn.append(b"b").await.unwrap();
        std::mem::forget(txn);

        for _ in 0..3 {
            let log = open_log(dir.path()).await;
            assert_eq!(log.seq(), 0);
            assert_eq!(read_all(&log, 0).await, bodies(&["a"]));
            log.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn torn_index_tail_is_cut() {
        let dir = tempdir().unwrap();
        {
            let log = open_log(dir.path()).await;
            log.append_batch(&bodies(&["a", "b"]), None).await.unwrap();
            log.close().await.unwrap();
        }
        let index = dir.path().join("node.index");
        let len = std::fs::metadata(&index).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&index).unwrap();
        file.set_len(len - 3).unwrap();

        let log = open_log(dir.path()).await;
        assert_eq!(log.seq(), 0);
        assert_eq!(read_all(&log, 0).await, bodies(&["a"]));
    }

    #[tokio::test]
    async fn corrupt_body_is_reported_once() {
        let dir = tempdir().unwrap();
        {
            let log = open_log(dir.path()).await;
            log.append_batch(&bodies(&["aaaa", "bbbb"]), None)
                .await
                .unwrap();
            log.close().await.unwrap();
        }
        let body = dir.path().join("node.body");
        let mut bytes = std::fs::read(&body).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&body, bytes).unwrap();

        let log = open_log(dir.path()).await;
        let mut iter = log.iter(0).unwrap();
        assert!(matches!(
            iter.next().await,
            Err(LogError::Corrupt { .. })
        ));
        assert!(iter.next().await.unwrap().is_none());
    }
}

// =============================================================================
// SECTION 8: HOOKS AND CODECS
// =============================================================================

#[derive(Default)]
struct RecordingHooks {
    commits: Mutex<Vec<Seq>>,
    truncations: Mutex<Vec<Seq>>,
    fail_commit: bool,
}

#[async_trait]
impl LogHooks for RecordingHooks {
    async fn pre_commit(&self, seq: Seq) -> Result<()> {
        if self.fail_commit {
            return Err(LogError::Hook("refused".into()));
        }
        self.commits.lock().unwrap().push(seq);
        Ok(())
    }

    async fn post_truncate(&self, seq: Seq) -> Result<()> {
        self.truncations.lock().unwrap().push(seq);
        Ok(())
    }
}

/// xor-scrambles bodies on top of the crc32 layout
struct XorCodec(u8);

impl Codec for XorCodec {
    fn index_entry_size(&self) -> usize {
        Crc32Codec.index_entry_size()
    }

    fn encode_index(&self, entry: &IndexEntry) -> Vec<u8> {
        Crc32Codec.encode_index(entry)
    }

    fn decode_index(&self, bytes: &[u8]) -> Result<IndexEntry> {
        Crc32Codec.decode_index(bytes)
    }

    fn encode_body(&self, seq: Seq, body: &[u8]) -> Vec<u8> {
        let scrambled: Vec<u8> = body.iter().map(|b| b ^ self.0).collect();
        Crc32Codec.encode_body(seq, &scrambled)
    }

    fn decode_body(&self, seq: Seq, bytes: &[u8]) -> Result<Vec<u8>> {
        let scrambled = Crc32Codec.decode_body(seq, bytes)?;
        Ok(scrambled.iter().map(|b| b ^ self.0).collect())
    }
}

mod hooks_and_codecs {
    use super::*;

    #[tokio::test]
    async fn hooks_see_commits_and_truncations() {
        let dir = tempdir().unwrap();
        let hooks = Arc::new(RecordingHooks::default());
        let log = Log::new(config(dir.path()).with_hooks(hooks.clone()));
        log.open().await.unwrap();

        log.append_batch(&bodies(&["a", "b", "c"]), None)
            .await
            .unwrap();
        log.trim(0).await.unwrap();

        assert_eq!(*hooks.commits.lock().unwrap(), vec![2, 0]);
        assert_eq!(*hooks.truncations.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn failing_pre_commit_rolls_back() {
        let dir = tempdir().unwrap();
        let hooks = Arc::new(RecordingHooks {
            fail_commit: true,
            ..Default::default()
        });
        let log = Log::new(config(dir.path()).with_hooks(hooks));
        log.open().await.unwrap();

        let err = log.append(b"a", None).await.unwrap_err();

        assert!(matches!(err, LogError::Hook(_)));
        assert_eq!(log.seq(), -1);
    }

    #[tokio::test]
    async fn custom_codec_round_trips_and_scrambles() {
        let dir = tempdir().unwrap();
        let log = Log::new(config(dir.path()).with_codec(Arc::new(XorCodec(0x5a))));
        log.open().await.unwrap();

        log.append(b"secret", None).await.unwrap();

        assert_eq!(read_all(&log, 0).await, bodies(&["secret"]));
        let raw = std::fs::read(dir.path().join("node.body")).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));
    }
}
