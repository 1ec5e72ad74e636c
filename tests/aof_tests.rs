//! AOF Tests
//!
//! Tests verify:
//! - Append path under each fsync policy
//! - SELECT markers on database switches
//! - Replay, including malformed and truncated files
//! - Byte-bounded replay with and without a snapshot preamble
//! - Listeners and shutdown
//! - Log order matching store order for whole-database mutations

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use emberkv::aof::{select_cmd, AofHandler, AofListener, PreambleCodec, SnapshotPreamble, SNAPSHOT_MAGIC};
use emberkv::config::{Config, FsyncPolicy};
use emberkv::database::{Database, Dump, FakeConnection, StandaloneDatabase};
use emberkv::protocol::{encode_command, parse_bytes, to_cmd_line, CmdLine, Reply};
use emberkv::{EmberError, Result};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const DATABASES: usize = 4;

fn setup_config(dir: &TempDir, policy: FsyncPolicy) -> Config {
    Config::builder()
        .append_filename(dir.path().join("appendonly.aof"))
        .append_fsync(policy)
        .databases(DATABASES)
        .build()
}

fn open_handler(config: &Config) -> AofHandler {
    AofHandler::open(
        config,
        Box::new(|| Box::new(StandaloneDatabase::new(DATABASES)) as Box<dyn Dump>),
    )
    .unwrap()
}

fn cmd(parts: &[&str]) -> CmdLine {
    to_cmd_line(parts)
}

/// Encode commands back to back, as they would appear in an AOF
fn encode_all(commands: &[CmdLine]) -> Vec<u8> {
    let mut out = Vec::new();
    for command in commands {
        out.extend_from_slice(&encode_command(command));
    }
    out
}

/// Decode an AOF into its command lines
fn read_commands(path: &Path) -> Vec<CmdLine> {
    let data = fs::read(path).unwrap();
    parse_bytes(&data)
        .into_iter()
        .map(|r| r.unwrap().into_cmd_line().unwrap())
        .collect()
}

fn get(db: &StandaloneDatabase, index: usize, key: &str) -> Option<Vec<u8>> {
    db.store(index).unwrap().get(key.as_bytes())
}

#[derive(Default)]
struct Collector {
    batches: Mutex<Vec<Vec<CmdLine>>>,
}

impl AofListener for Collector {
    fn on_appended(&self, batch: &[CmdLine]) {
        self.batches.lock().unwrap().push(batch.to_vec());
    }
}

// =============================================================================
// Append Path Tests
// =============================================================================

#[test]
fn test_always_policy_writes_before_returning() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::Always);
    let aof = Arc::new(open_handler(&config));

    let db = StandaloneDatabase::new(DATABASES);
    db.attach_aof(Arc::clone(&aof));
    let mut conn = FakeConnection::new();
    assert_eq!(db.exec(&mut conn, &cmd(&["SET", "a", "1"])), Reply::OK);

    // No close: the bytes must already be in the file, with no SELECT 0 on a fresh log
    let data = fs::read(&config.append_filename).unwrap();
    assert_eq!(data, encode_command(&cmd(&["SET", "a", "1"])).to_vec());
    assert_eq!(aof.current_db(), Some(0));
}

#[test]
fn test_select_written_on_database_switch() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::Always);
    let aof = open_handler(&config);

    aof.record(0, cmd(&["SET", "a", "1"]));
    aof.record(2, cmd(&["SET", "b", "2"]));
    aof.record(2, cmd(&["SET", "c", "3"]));

    assert_eq!(
        read_commands(&config.append_filename),
        vec![
            cmd(&["SET", "a", "1"]),
            select_cmd(2),
            cmd(&["SET", "b", "2"]),
            cmd(&["SET", "c", "3"]),
        ]
    );
    assert_eq!(aof.current_db(), Some(2));
}

#[test]
fn test_reopened_log_selects_before_first_write() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::Always);
    {
        let aof = open_handler(&config);
        aof.record(3, cmd(&["SET", "a", "1"]));
        aof.close();
    }

    let aof = open_handler(&config);
    assert_eq!(aof.current_db(), None);
    aof.record(0, cmd(&["SET", "b", "2"]));

    let commands = read_commands(&config.append_filename);
    assert_eq!(&commands[commands.len() - 2..], &[select_cmd(0), cmd(&["SET", "b", "2"])]);
}

#[test]
fn test_queued_policy_drains_on_close() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let aof = open_handler(&config);

    let expected: Vec<CmdLine> = (0..1000)
        .map(|i| cmd(&["SET", format!("k{}", i).as_str(), "v"]))
        .collect();
    for command in &expected {
        aof.record(0, command.clone());
    }
    aof.close();

    assert_eq!(read_commands(&config.append_filename), expected);
}

#[test]
fn test_everysec_policy_closes_cleanly() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::EverySec);
    let aof = open_handler(&config);

    aof.record(1, cmd(&["SET", "a", "1"]));
    aof.fsync();
    aof.close();

    assert_eq!(
        read_commands(&config.append_filename),
        vec![select_cmd(1), cmd(&["SET", "a", "1"])]
    );
}

#[test]
fn test_close_is_idempotent_and_drops_later_records() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let aof = open_handler(&config);

    aof.record(0, cmd(&["SET", "a", "1"]));
    aof.close();
    aof.close();
    aof.record(0, cmd(&["SET", "b", "2"]));

    assert_eq!(read_commands(&config.append_filename), vec![cmd(&["SET", "a", "1"])]);
}

#[test]
fn test_concurrent_writers_keep_records_whole() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let aof = Arc::new(open_handler(&config));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let aof = Arc::clone(&aof);
            std::thread::spawn(move || {
                for i in 0..250 {
                    let key = format!("t{}-{}", t, i);
                    aof.record(t, cmd(&["SET", key.as_str(), "v"]));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    aof.close();

    // Every payload decodes, and replay lands each key in its writer's database
    let db = StandaloneDatabase::new(DATABASES);
    let reopened = open_handler(&config);
    let stats = reopened.load(&db, 0).unwrap();
    assert_eq!(stats.payloads_skipped, 0);
    for t in 0..4 {
        assert_eq!(db.store(t).unwrap().len(), 250);
    }
}

// =============================================================================
// Listener Tests
// =============================================================================

#[test]
fn test_listener_sees_select_and_command() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::Always);
    let aof = open_handler(&config);

    let collector = Arc::new(Collector::default());
    let listener: Arc<dyn AofListener> = collector.clone();
    aof.add_listener(Arc::clone(&listener));

    aof.record(1, cmd(&["SET", "a", "1"]));
    aof.record(1, cmd(&["SET", "b", "2"]));

    aof.remove_listener(&listener);
    aof.record(1, cmd(&["SET", "c", "3"]));

    let batches = collector.batches.lock().unwrap();
    assert_eq!(
        *batches,
        vec![
            vec![select_cmd(1), cmd(&["SET", "a", "1"])],
            vec![cmd(&["SET", "b", "2"])],
        ]
    );
}

// =============================================================================
// Replay Tests
// =============================================================================

#[test]
fn test_load_missing_file_is_empty() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let aof = open_handler(&config);
    fs::remove_file(&config.append_filename).unwrap();

    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof.load(&db, 0).unwrap();

    assert_eq!(stats.commands_replayed, 0);
    assert_eq!(db.store(0).unwrap().len(), 0);
}

#[test]
fn test_load_restores_all_databases() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::Always);
    fs::write(
        &config.append_filename,
        encode_all(&[
            cmd(&["SET", "a", "1"]),
            select_cmd(2),
            cmd(&["SET", "b", "2"]),
            cmd(&["DEL", "b"]),
            cmd(&["SET", "c", "3"]),
        ]),
    )
    .unwrap();

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof.load(&db, 0).unwrap();

    assert_eq!(stats.commands_replayed, 5);
    assert_eq!(stats.exec_errors, 0);
    assert_eq!(get(&db, 0, "a"), Some(b"1".to_vec()));
    assert_eq!(get(&db, 2, "b"), None);
    assert_eq!(get(&db, 2, "c"), Some(b"3".to_vec()));
    // The log ends in database 2, so the next write there needs no SELECT
    assert_eq!(aof.current_db(), Some(2));
}

#[test]
fn test_load_does_not_rejournal() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::Always);
    let original = encode_all(&[cmd(&["SET", "a", "1"]), cmd(&["SET", "b", "2"])]);
    fs::write(&config.append_filename, &original).unwrap();

    let aof = Arc::new(open_handler(&config));
    let db = StandaloneDatabase::new(DATABASES);
    db.attach_aof(Arc::clone(&aof));

    aof.load(&db, 0).unwrap();

    assert_eq!(fs::read(&config.append_filename).unwrap(), original);
    assert!(aof.is_enabled());
    assert_eq!(db.store(0).unwrap().len(), 2);
}

#[test]
fn test_load_skips_malformed_payload() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let mut data = encode_all(&[cmd(&["SET", "a", "1"])]);
    data.extend_from_slice(b"*2\r\n$x\r\n");
    data.extend_from_slice(b":7\r\n");
    data.extend_from_slice(&encode_all(&[cmd(&["SET", "b", "2"])]));
    fs::write(&config.append_filename, data).unwrap();

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof.load(&db, 0).unwrap();

    assert_eq!(stats.commands_replayed, 2);
    assert!(stats.payloads_skipped >= 2);
    assert_eq!(get(&db, 0, "a"), Some(b"1".to_vec()));
    assert_eq!(get(&db, 0, "b"), Some(b"2".to_vec()));
}

#[test]
fn test_load_truncates_partial_tail() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let complete = encode_all(&[cmd(&["SET", "a", "1"])]);
    let partial = encode_command(&cmd(&["SET", "b", "2"]));
    let cut = &partial[..partial.len() - 4];
    fs::write(&config.append_filename, [&complete[..], cut].concat()).unwrap();

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof.load(&db, 0).unwrap();

    assert_eq!(stats.commands_replayed, 1);
    assert_eq!(stats.truncated_bytes, cut.len() as u64);
    assert_eq!(get(&db, 0, "a"), Some(b"1".to_vec()));
    assert_eq!(get(&db, 0, "b"), None);
    assert_eq!(fs::read(&config.append_filename).unwrap(), complete);
}

#[test]
fn test_write_after_partial_tail_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::Always);
    let mut data = encode_all(&[cmd(&["SET", "a", "1"])]);
    let partial = encode_command(&cmd(&["SET", "b", "2"]));
    data.extend_from_slice(&partial[..partial.len() - 4]);
    fs::write(&config.append_filename, data).unwrap();

    {
        let aof = Arc::new(open_handler(&config));
        let db = StandaloneDatabase::new(DATABASES);
        aof.load(&db, 0).unwrap();
        db.attach_aof(Arc::clone(&aof));

        let mut conn = FakeConnection::new();
        assert_eq!(db.exec(&mut conn, &cmd(&["SET", "c", "3"])), Reply::OK);
        aof.close();
    }

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof.load(&db, 0).unwrap();

    assert_eq!(stats.payloads_skipped, 0);
    assert_eq!(stats.truncated_bytes, 0);
    assert_eq!(get(&db, 0, "a"), Some(b"1".to_vec()));
    assert_eq!(get(&db, 0, "b"), None);
    assert_eq!(get(&db, 0, "c"), Some(b"3".to_vec()));
}

#[test]
fn test_bounded_load_leaves_file_intact() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let mut data = encode_all(&[cmd(&["SET", "a", "1"])]);
    let partial = encode_command(&cmd(&["SET", "b", "2"]));
    data.extend_from_slice(&partial[..partial.len() - 4]);
    fs::write(&config.append_filename, &data).unwrap();

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof.load(&db, data.len() as u64).unwrap();

    assert_eq!(stats.truncated_bytes, 0);
    assert_eq!(fs::read(&config.append_filename).unwrap(), data);
}

#[test]
fn test_load_counts_failed_commands() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    fs::write(
        &config.append_filename,
        encode_all(&[cmd(&["BOGUS"]), cmd(&["SET", "a", "1"])]),
    )
    .unwrap();

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof.load(&db, 0).unwrap();

    assert_eq!(stats.exec_errors, 1);
    assert_eq!(get(&db, 0, "a"), Some(b"1".to_vec()));
}

#[test]
fn test_load_max_bytes_bounds_replay() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let first = encode_command(&cmd(&["SET", "a", "1"]));
    let second = encode_command(&cmd(&["SET", "b", "2"]));
    let third = encode_command(&cmd(&["SET", "c", "3"]));
    fs::write(&config.append_filename, [&first[..], &second[..], &third[..]].concat()).unwrap();

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof
        .load(&db, (first.len() + second.len()) as u64)
        .unwrap();

    assert_eq!(stats.commands_replayed, 2);
    assert_eq!(get(&db, 0, "b"), Some(b"2".to_vec()));
    assert_eq!(get(&db, 0, "c"), None);
}

#[test]
fn test_replay_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    fs::write(
        &config.append_filename,
        encode_all(&[
            cmd(&["SET", "a", "1"]),
            cmd(&["SET", "a", "2"]),
            select_cmd(1),
            cmd(&["SETNX", "b", "x"]),
            cmd(&["SETNX", "b", "y"]),
        ]),
    )
    .unwrap();
    let aof = open_handler(&config);

    let first = StandaloneDatabase::new(DATABASES);
    let second = StandaloneDatabase::new(DATABASES);
    aof.load(&first, 0).unwrap();
    aof.load(&second, 0).unwrap();

    for index in 0..DATABASES {
        let mut a = first.store(index).unwrap().keys();
        let mut b = second.store(index).unwrap().keys();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        for key in a {
            assert_eq!(
                first.store(index).unwrap().get(&key),
                second.store(index).unwrap().get(&key)
            );
        }
    }
    assert_eq!(get(&first, 1, "b"), Some(b"x".to_vec()));
}

// =============================================================================
// Snapshot Preamble Tests
// =============================================================================

/// Write a preamble holding `a=1` in db 0 and `p=9` in db 3. Returns its size.
fn write_preamble(path: &Path, tail: &[u8]) -> u64 {
    let source = StandaloneDatabase::new(DATABASES);
    let mut conn = FakeConnection::new();
    source.exec(&mut conn, &cmd(&["SET", "a", "1"]));
    source.exec(&mut conn, &cmd(&["SELECT", "3"]));
    source.exec(&mut conn, &cmd(&["SET", "p", "9"]));

    let mut data = Vec::new();
    let size = SnapshotPreamble.encode(&source, &mut data).unwrap();
    assert_eq!(size, data.len() as u64);
    assert_eq!(&data[..8], SNAPSHOT_MAGIC);

    data.extend_from_slice(tail);
    fs::write(path, data).unwrap();
    size
}

#[test]
fn test_load_preamble_then_commands() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    // Commands after the preamble start in database 0
    let preamble = write_preamble(
        &config.append_filename,
        &encode_all(&[cmd(&["SET", "b", "2"])]),
    );

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof.load(&db, 0).unwrap();

    assert_eq!(stats.preamble_bytes, preamble);
    assert_eq!(stats.commands_replayed, 3);
    assert_eq!(get(&db, 0, "a"), Some(b"1".to_vec()));
    assert_eq!(get(&db, 3, "p"), Some(b"9".to_vec()));
    assert_eq!(get(&db, 0, "b"), Some(b"2".to_vec()));
    assert_eq!(get(&db, 3, "b"), None);
}

#[test]
fn test_load_max_bytes_counts_preamble() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let first = encode_command(&cmd(&["SET", "b", "2"]));
    let second = encode_command(&cmd(&["SET", "c", "3"]));
    let preamble = write_preamble(&config.append_filename, &[&first[..], &second[..]].concat());

    let aof = open_handler(&config);

    // Bound ends after the first command
    let db = StandaloneDatabase::new(DATABASES);
    aof.load(&db, preamble + first.len() as u64).unwrap();
    assert_eq!(get(&db, 0, "a"), Some(b"1".to_vec()));
    assert_eq!(get(&db, 0, "b"), Some(b"2".to_vec()));
    assert_eq!(get(&db, 0, "c"), None);

    // Bound inside the preamble still applies it whole, but no commands
    let db = StandaloneDatabase::new(DATABASES);
    let stats = aof.load(&db, preamble / 2).unwrap();
    assert_eq!(get(&db, 0, "a"), Some(b"1".to_vec()));
    assert_eq!(get(&db, 3, "p"), Some(b"9".to_vec()));
    assert_eq!(get(&db, 0, "b"), None);
    assert_eq!(stats.commands_replayed, 2);
}

#[test]
fn test_load_rejects_corrupt_preamble() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    write_preamble(&config.append_filename, b"");

    let mut data = fs::read(&config.append_filename).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    fs::write(&config.append_filename, data).unwrap();

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    match aof.load(&db, 0) {
        Err(EmberError::Snapshot(_)) => {}
        other => panic!("expected snapshot error, got {:?}", other),
    }
    // A failed load leaves appends enabled
    assert!(aof.is_enabled());
}

#[test]
fn test_load_rejects_truncated_preamble() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    let mut data = SNAPSHOT_MAGIC.to_vec();
    data.extend_from_slice(&100u64.to_le_bytes());
    fs::write(&config.append_filename, data).unwrap();

    let aof = open_handler(&config);
    let db = StandaloneDatabase::new(DATABASES);
    assert!(matches!(aof.load(&db, 0), Err(EmberError::Snapshot(_))));
}

/// Delegates to the default codec and counts decode attempts
struct CountingCodec {
    decodes: Arc<AtomicUsize>,
}

impl PreambleCodec for CountingCodec {
    fn encode(&self, db: &dyn Dump, writer: &mut dyn Write) -> Result<u64> {
        SnapshotPreamble.encode(db, writer)
    }

    fn decode(
        &self,
        reader: &mut dyn Read,
        apply: &mut dyn FnMut(usize, CmdLine),
    ) -> Result<Option<u64>> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        SnapshotPreamble.decode(reader, apply)
    }
}

#[test]
fn test_custom_preamble_codec_is_used() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::No);
    write_preamble(&config.append_filename, b"");

    let decodes = Arc::new(AtomicUsize::new(0));
    let aof = open_handler(&config).with_preamble_codec(Box::new(CountingCodec {
        decodes: Arc::clone(&decodes),
    }));
    let db = StandaloneDatabase::new(DATABASES);
    aof.load(&db, 0).unwrap();

    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    assert_eq!(get(&db, 3, "p"), Some(b"9".to_vec()));
}

// =============================================================================
// Log Order Tests
// =============================================================================

/// First key found that hashes to `shard`
fn key_in_shard(db: &StandaloneDatabase, shard: usize) -> String {
    let store = db.store(0).unwrap();
    (0..)
        .map(|i| format!("k{}", i))
        .find(|key| store.shard_index(key.as_bytes()) == shard)
        .unwrap()
}

#[test]
fn test_flushdb_and_set_replay_in_store_order() {
    let dir = TempDir::new().unwrap();
    let config = setup_config(&dir, FsyncPolicy::Always);
    let aof = Arc::new(open_handler(&config));
    let db = Arc::new(StandaloneDatabase::new(DATABASES));
    db.attach_aof(Arc::clone(&aof));

    let last_shard = db.store(0).unwrap().shard_count() - 1;
    let first_key = key_in_shard(&db, 0);
    let blocker = key_in_shard(&db, last_shard);

    // Stall FLUSHDB behind a reader on the last shard, then race a SET on
    // the first shard against it
    let reader = db.store(0).unwrap().read(blocker.as_bytes());
    let flusher = {
        let db = Arc::clone(&db);
        std::thread::spawn(move || {
            let mut conn = FakeConnection::new();
            db.exec(&mut conn, &cmd(&["FLUSHDB"]))
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(100));
    let setter = {
        let db = Arc::clone(&db);
        let key = first_key.clone();
        std::thread::spawn(move || {
            let mut conn = FakeConnection::new();
            db.exec(&mut conn, &cmd(&["SET", key.as_str(), "v"]))
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(100));
    drop(reader);

    assert_eq!(flusher.join().unwrap(), Reply::OK);
    assert_eq!(setter.join().unwrap(), Reply::OK);
    aof.close();

    let live = get(&db, 0, &first_key);
    let replayed = StandaloneDatabase::new(DATABASES);
    open_handler(&config).load(&replayed, 0).unwrap();
    assert_eq!(get(&replayed, 0, &first_key), live);
}
