//! End-to-end tests for the engine against a store on disk.

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use tempfile::TempDir;
use tweetstore::{
    BatchList, Config, Engine, Message, Reply, ReplyQueue, SelectRequest, Storage, StoreError,
    ThreadingMode, TweetRecord, UserAttributes, UserProfile, WorkerState,
};

const WAIT: Duration = Duration::from_secs(10);

fn config(dir: &TempDir, threading: ThreadingMode) -> Config {
    tweetstore::logging::init_test_logging();
    let mut config = Config::for_path(dir.path().join("tweets.sqlite3"));
    config.store.threading = threading;
    config
}

fn tweet(id: u64) -> TweetRecord {
    TweetRecord {
        id,
        statics_json: format!(
            r#"{{"text":"tweet number {id} with enough text to cross the compression threshold","source":"web"}}"#
        ),
        dyn_json: r#"{"retweet_count":0}"#.to_string(),
        author_id: 1000 + id,
        recipient_id: 0,
        flags: 1,
        timestamp: 1_300_000_000 + id,
    }
}

fn profile(id: u64, screen_name: &str) -> UserProfile {
    UserProfile::new(
        id,
        UserAttributes {
            screen_name: screen_name.to_string(),
            name: screen_name.to_uppercase(),
            followers_count: 10,
            ..UserAttributes::default()
        },
    )
}

fn reopen(dir: &TempDir) -> Storage {
    Storage::open(dir.path().join("tweets.sqlite3"), &Default::default()).unwrap()
}

#[test]
fn select_after_insert_sees_the_row() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &[]).unwrap();
    assert!(engine.is_threaded());
    let (queue, inbox) = ReplyQueue::new();

    engine.insert_tweet(tweet(42), None).unwrap();
    engine
        .select_tweets(SelectRequest::new([42], queue.address(7)))
        .unwrap();

    let delivery = inbox.recv_timeout(WAIT).unwrap();
    assert_eq!(delivery.tag, 7);
    assert_eq!(delivery.reply, Reply::Tweets(vec![tweet(42)]));

    let report = engine.shutdown().unwrap();
    let stats = report.worker.unwrap();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.replies, 1);
}

#[test]
fn messages_run_in_send_order() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &[]).unwrap();
    let (queue, inbox) = ReplyQueue::new();

    engine.insert_tweet(tweet(1), None).unwrap();
    engine.update_tweet_dyn(1, r#"{"retweet_count":1}"#, 3, None).unwrap();
    engine.update_tweet_dyn(1, r#"{"retweet_count":2}"#, 7, None).unwrap();
    engine
        .update_tweet_flags(BTreeSet::from([1]), 0x10, 0x2, None)
        .unwrap();
    engine
        .select_tweets(SelectRequest::new([1], queue.address(1)))
        .unwrap();

    let Reply::Tweets(rows) = inbox.recv_timeout(WAIT).unwrap().reply else {
        panic!("expected tweets");
    };
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dyn_json, r#"{"retweet_count":2}"#);
    assert_eq!(rows[0].flags, 0x15);
    engine.shutdown().unwrap();
}

#[test]
fn empty_select_replies_only_when_asked() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &[]).unwrap();
    let (queue, inbox) = ReplyQueue::new();

    engine
        .select_tweets(SelectRequest::new([404], queue.address(1)))
        .unwrap();
    engine
        .select_tweets(SelectRequest::new([404], queue.address(2)).reply_when_empty(true))
        .unwrap();

    let delivery = inbox.recv_timeout(WAIT).unwrap();
    assert_eq!(delivery.tag, 2);
    assert_eq!(delivery.reply, Reply::Tweets(Vec::new()));

    engine.shutdown().unwrap();
    assert!(inbox.try_recv().is_none());
}

#[test]
fn batch_commits_and_acknowledges() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &[]).unwrap();
    let (queue, inbox) = ReplyQueue::new();

    let mut batch = BatchList::new().with_ack(queue.address(9));
    engine.insert_tweet(tweet(1), Some(&mut batch)).unwrap();
    engine.insert_tweet(tweet(2), Some(&mut batch)).unwrap();
    engine.insert_tweet(tweet(1), Some(&mut batch)).unwrap();
    engine.send(batch).unwrap();

    let delivery = inbox.recv_timeout(WAIT).unwrap();
    assert_eq!(delivery.tag, 9);
    let Reply::BatchAck(outcome) = delivery.reply else {
        panic!("expected batch ack");
    };
    assert_eq!(outcome.executed, 2);
    assert_eq!(outcome.failed, 1);
    assert!(!outcome.is_success());

    engine.shutdown().unwrap();
    assert_eq!(reopen(&dir).counts().unwrap().tweets, 2);
}

#[test]
fn pending_batch_is_flushed_at_shutdown() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &[]).unwrap();

    engine.send_batched(Message::InsertTweet(tweet(1)));
    engine.send_batched(Message::InsertTweet(tweet(2)));
    engine.send_batched(Message::InsertTweet(tweet(3)));
    engine.shutdown().unwrap();

    assert_eq!(reopen(&dir).counts().unwrap().tweets, 3);
}

#[test]
fn repeated_user_insert_is_suppressed() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &[]).unwrap();

    assert!(engine.insert_user(profile(5, "five"), None).unwrap());
    let first = engine.user(5).unwrap().clone();
    assert_eq!(first.last_written, first.last_update);

    // Same content again: store already matches memory.
    assert!(!engine.insert_user(profile(5, "five"), None).unwrap());
    assert_eq!(engine.user(5).unwrap().last_update, first.last_update);

    let report = engine.shutdown().unwrap();
    assert_eq!(report.users_written, 0);

    let row = reopen(&dir).get_user(5).unwrap().unwrap();
    assert_eq!(row.last_update, first.last_update);
    let stored = UserProfile::from_row(row);
    assert_eq!(stored.attributes.screen_name, "five");
}

#[test]
fn users_survive_a_restart_clean() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &[]).unwrap();
    engine.stage_user(profile(1, "one"));
    engine.stage_user(profile(2, "two"));
    let report = engine.shutdown().unwrap();
    assert_eq!(report.users_written, 2);

    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &[]).unwrap();
    assert_eq!(engine.users().len(), 2);
    assert!(engine.users().values().all(|u| !u.is_dirty()));
    assert!(!engine.insert_user(profile(1, "one"), None).unwrap());
    assert_eq!(engine.shutdown().unwrap().users_written, 0);
}

#[test]
fn account_id_sets_are_written_back() {
    let dir = TempDir::new().unwrap();
    let names = vec!["main".to_string()];
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &names).unwrap();

    let account = engine.account_mut("main").unwrap();
    account.tweet_ids.extend([u64::MAX, 300, 5]);
    account.dm_ids.insert(9);
    let report = engine.shutdown().unwrap();
    assert_eq!(report.accounts_written, 1);

    let engine = Engine::init(&config(&dir, ThreadingMode::Auto), &names).unwrap();
    let account = engine.account("main").unwrap();
    assert_eq!(account.tweet_ids, BTreeSet::from([5, 300, u64::MAX]));
    assert_eq!(account.dm_ids, BTreeSet::from([9]));
    engine.shutdown().unwrap();
}

#[test]
fn write_back_state_async_acknowledges() {
    let dir = TempDir::new().unwrap();
    let names = vec!["main".to_string()];
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &names).unwrap();
    let (queue, inbox) = ReplyQueue::new();

    engine.stage_user(profile(3, "three"));
    engine.account_mut("main").unwrap().tweet_ids.insert(77);
    let queued = engine.write_back_state_async(Some(queue.address(4))).unwrap();
    assert_eq!(queued, 2);

    let Reply::BatchAck(outcome) = inbox.recv_timeout(WAIT).unwrap().reply else {
        panic!("expected batch ack");
    };
    assert!(outcome.is_success());
    assert_eq!(outcome.executed, 2);
    assert!(!engine.user(3).unwrap().is_dirty());

    let report = engine.shutdown().unwrap();
    assert_eq!(report.users_written, 0);
    assert!(reopen(&dir).get_user(3).unwrap().is_some());
}

#[test]
fn locked_store_gives_up_after_retry_budget() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, ThreadingMode::Auto);
    config.store.busy_initial_delay_ms = 1;
    config.store.busy_max_delay_ms = 2;
    let mut engine = Engine::init(&config, &[]).unwrap();

    let locker = Connection::open(dir.path().join("tweets.sqlite3")).unwrap();
    locker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    engine.insert_tweet(tweet(1), None).unwrap();
    engine
        .run_on_store(move |_| {
            let _ = done_tx.send(());
        })
        .unwrap();

    // The insert has been abandoned once the probe runs.
    done_rx.recv_timeout(WAIT).unwrap();
    locker.execute_batch("ROLLBACK").unwrap();

    let report = engine.shutdown().unwrap();
    let stats = report.worker.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.busy_abandoned, 1);
    assert!(reopen(&dir).get_tweet(1).unwrap().is_none());
}

#[test]
fn synchronous_mode_runs_on_calling_thread() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Synchronous), &[]).unwrap();
    assert!(!engine.is_threaded());
    assert_eq!(engine.worker_state(), None);

    let (tx, rx) = crossbeam_channel::unbounded();
    engine
        .run_on_store(move |_| {
            let _ = tx.send(thread::current().id());
        })
        .unwrap();
    // Already executed by the time the call returns.
    assert_eq!(rx.try_recv().unwrap(), thread::current().id());

    let (queue, inbox) = ReplyQueue::new();
    engine.insert_tweet(tweet(8), None).unwrap();
    engine
        .select_tweets(SelectRequest::new([8], queue.address(1)))
        .unwrap();
    assert_eq!(inbox.try_recv().unwrap().reply, Reply::Tweets(vec![tweet(8)]));
    assert_eq!(engine.worker_stats().messages, 3);

    let report = engine.shutdown().unwrap();
    assert!(report.worker.is_none());
}

#[test]
fn worker_is_idle_between_messages() {
    let dir = TempDir::new().unwrap();
    let mut engine = Engine::init(&config(&dir, ThreadingMode::Auto), &[]).unwrap();
    let (queue, inbox) = ReplyQueue::new();
    engine
        .select_tweets(SelectRequest::new([1], queue.address(1)).reply_when_empty(true))
        .unwrap();
    inbox.recv_timeout(WAIT).unwrap();

    // The reply is sent before the state flips back.
    let mut state = engine.worker_state();
    for _ in 0..100 {
        if state == Some(WorkerState::Idle) {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        state = engine.worker_state();
    }
    assert_eq!(state, Some(WorkerState::Idle));
    engine.shutdown().unwrap();
}

#[test]
fn newer_schema_aborts_init() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, ThreadingMode::Auto);
    Engine::init(&config, &[]).unwrap().shutdown().unwrap();

    let conn = Connection::open(config.db_path()).unwrap();
    conn.execute("UPDATE meta SET value = '99' WHERE key = 'schema_version'", [])
        .unwrap();
    drop(conn);

    assert!(matches!(
        Engine::init(&config, &[]),
        Err(StoreError::SchemaMismatch { found: 99, .. })
    ));
}
