//! Store mutations driven by gameplay are not written inline: handlers
//! enqueue them here and a single flusher task drains the queue when it
//! grows past the batch size or on a timeout tick, grouping operations by
//! type and applying each group in one transaction.

use std::collections::HashMap;
use std::mem::{Discriminant, discriminant};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kviz_core::{GameId, PlayerId};

use crate::store::Store;

/// One deferred store mutation.
#[derive(Debug, Clone)]
pub enum DbOp {
    UpdatePlayerScore {
        game_id: GameId,
        player_id: PlayerId,
        score: u32,
    },
    SaveAnswer {
        game_id: GameId,
        player_id: PlayerId,
        question_index: usize,
        option_index: usize,
        correct: bool,
        points: u32,
        response_time_ms: u64,
        submitted_at: u64,
    },
    UpdateGameState {
        game_id: GameId,
        status: String,
        current_question_index: usize,
        question_start_time: Option<u64>,
    },
    DisconnectPlayer {
        game_id: GameId,
        player_id: PlayerId,
        last_seen: u64,
    },
    RemovePlayer {
        game_id: GameId,
        player_id: PlayerId,
    },
}

/// Handle for enqueueing deferred store writes.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<DbOp>,
}

impl WriteQueue {
    pub fn enqueue(&self, op: DbOp) {
        if self.tx.send(op).is_err() {
            tracing::error!("Write queue receiver gone, dropping store operation");
        }
    }
}

/// Create the queue pair. The receiver side goes to `run_flusher`.
pub fn write_queue() -> (WriteQueue, mpsc::UnboundedReceiver<DbOp>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WriteQueue { tx }, rx)
}

/// Drain loop: flush on batch size, on the timeout tick, and once more on
/// shutdown so nothing queued is lost.
pub async fn run_flusher(
    store: Arc<Store>,
    mut rx: mpsc::UnboundedReceiver<DbOp>,
    batch_size: usize,
    batch_timeout_ms: u64,
    shutdown: CancellationToken,
) {
    let mut buffer: Vec<DbOp> = Vec::with_capacity(batch_size);
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(batch_timeout_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Drain whatever is still sitting in the channel
                while let Ok(op) = rx.try_recv() {
                    buffer.push(op);
                }
                flush(&store, std::mem::take(&mut buffer)).await;
                tracing::info!("Write flusher shutting down");
                break;
            }
            op = rx.recv() => {
                match op {
                    Some(op) => {
                        buffer.push(op);
                        if buffer.len() >= batch_size {
                            flush(&store, std::mem::take(&mut buffer)).await;
                        }
                    },
                    None => {
                        flush(&store, std::mem::take(&mut buffer)).await;
                        break;
                    },
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    flush(&store, std::mem::take(&mut buffer)).await;
                }
            }
        }
    }
}

/// Group ops by type and apply each group in one transaction off the async
/// hot path. A group that fails at the transaction level is retried once,
/// then dropped with a log entry.
pub async fn flush(store: &Arc<Store>, ops: Vec<DbOp>) -> (usize, usize) {
    if ops.is_empty() {
        return (0, 0);
    }
    let groups = group_by_type(ops);
    let mut applied = 0;
    let mut failed = 0;
    for group in groups {
        let store = Arc::clone(store);
        let count = group.len();
        let result = tokio::task::spawn_blocking(move || {
            match store.apply_ops(&group) {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    tracing::warn!(error = %e, count, "Flush group failed, retrying once");
                    store.apply_ops(&group)
                },
            }
        })
        .await;
        match result {
            Ok(Ok(outcome)) => {
                applied += outcome.applied;
                failed += outcome.failed;
            },
            Ok(Err(e)) => {
                failed += count;
                tracing::error!(error = %e, count, "Dropped flush group after retry");
            },
            Err(e) => {
                failed += count;
                tracing::error!(error = %e, count, "Flush task panicked");
            },
        }
    }
    if failed > 0 {
        tracing::warn!(applied, failed, "Write flush finished with failures");
    } else {
        tracing::debug!(applied, "Write flush finished");
    }
    (applied, failed)
}

/// Partition ops by variant, preserving order within each group. Groups
/// run in first-seen order.
fn group_by_type(ops: Vec<DbOp>) -> Vec<Vec<DbOp>> {
    let mut index: HashMap<Discriminant<DbOp>, usize> = HashMap::new();
    let mut groups: Vec<Vec<DbOp>> = Vec::new();
    for op in ops {
        let key = discriminant(&op);
        match index.get(&key) {
            Some(&i) => groups[i].push(op),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![op]);
            },
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use kviz_core::question::Question;

    fn make_store_with_game() -> (Arc<Store>, GameId, PlayerId) {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let questions = vec![Question {
            text: "?".to_string(),
            options: vec!["A".into(), "B".into(), "C".into(), "D".into()],
            correct_index: 0,
            time_limit_secs: 30,
        }];
        let game_id = store
            .create_game("123456", &questions, None, "tok", 1_000)
            .unwrap();
        let player = store.add_player(game_id, 1_000).unwrap();
        (store, game_id, player.ordinal)
    }

    #[test]
    fn grouping_preserves_order_within_type() {
        let ops = vec![
            DbOp::UpdatePlayerScore {
                game_id: 1,
                player_id: 1,
                score: 10,
            },
            DbOp::UpdateGameState {
                game_id: 1,
                status: "results".to_string(),
                current_question_index: 0,
                question_start_time: None,
            },
            DbOp::UpdatePlayerScore {
                game_id: 1,
                player_id: 1,
                score: 20,
            },
            DbOp::UpdatePlayerScore {
                game_id: 1,
                player_id: 2,
                score: 30,
            },
        ];
        let groups = group_by_type(ops);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 1);
        match (&groups[0][0], &groups[0][2]) {
            (
                DbOp::UpdatePlayerScore { score: first, .. },
                DbOp::UpdatePlayerScore { score: last, .. },
            ) => {
                assert_eq!(*first, 10);
                assert_eq!(*last, 30);
            },
            other => panic!("Unexpected group contents: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_applies_mixed_ops() {
        let (store, game_id, player_id) = make_store_with_game();
        let ops = vec![
            DbOp::SaveAnswer {
                game_id,
                player_id,
                question_index: 0,
                option_index: 0,
                correct: true,
                points: 1_500,
                response_time_ms: 10,
                submitted_at: 2_000,
            },
            DbOp::UpdatePlayerScore {
                game_id,
                player_id,
                score: 1_500,
            },
        ];
        let (applied, failed) = flush(&store, ops).await;
        assert_eq!(applied, 2);
        assert_eq!(failed, 0);

        let players = store.get_players_for_game(game_id).unwrap();
        assert_eq!(players[0].score, 1_500);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flusher_flushes_on_batch_size() {
        let (store, game_id, player_id) = make_store_with_game();
        let (queue, rx) = write_queue();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_flusher(
            Arc::clone(&store),
            rx,
            2,
            60_000, // timeout far away: only the size trigger can fire
            shutdown.clone(),
        ));

        queue.enqueue(DbOp::UpdatePlayerScore {
            game_id,
            player_id,
            score: 100,
        });
        queue.enqueue(DbOp::UpdatePlayerScore {
            game_id,
            player_id,
            score: 200,
        });

        // Poll until the size-triggered flush lands
        let mut score = 0;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            score = store.get_players_for_game(game_id).unwrap()[0].score;
            if score == 200 {
                break;
            }
        }
        assert_eq!(score, 200);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flusher_flushes_on_timeout() {
        let (store, game_id, player_id) = make_store_with_game();
        let (queue, rx) = write_queue();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_flusher(
            Arc::clone(&store),
            rx,
            1_000, // size trigger far away: only the timeout can fire
            20,
            shutdown.clone(),
        ));

        queue.enqueue(DbOp::UpdatePlayerScore {
            game_id,
            player_id,
            score: 777,
        });

        let mut score = 0;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            score = store.get_players_for_game(game_id).unwrap()[0].score;
            if score == 777 {
                break;
            }
        }
        assert_eq!(score, 777);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_drains_pending_ops() {
        let (store, game_id, player_id) = make_store_with_game();
        let (queue, rx) = write_queue();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_flusher(
            Arc::clone(&store),
            rx,
            1_000,
            60_000,
            shutdown.clone(),
        ));

        queue.enqueue(DbOp::UpdatePlayerScore {
            game_id,
            player_id,
            score: 42,
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let players = store.get_players_for_game(game_id).unwrap();
        assert_eq!(players[0].score, 42);
    }
}
