//! Standalone database
//!
//! A small string command set over one `ShardedStore` per logical database.
//! Mutations are journaled while the owning shard is still locked, so the
//! AOF sees writes to a key in the order the store applied them.

use std::sync::{Arc, OnceLock};
use std::thread;

use tracing::{debug, error, warn};

use crate::aof::AofHandler;
use crate::protocol::{cmd_name, CmdLine, Reply};
use crate::store::ShardedStore;

use super::{Connection, Database, Dump};

/// Shards per logical database
const SHARDS_PER_DB: usize = 1024;

/// Keyspace made of `databases` independent stores
pub struct StandaloneDatabase {
    dbs: Vec<ShardedStore<Vec<u8>>>,
    aof: OnceLock<Arc<AofHandler>>,
}

impl StandaloneDatabase {
    /// Create `databases` empty stores.
    ///
    /// Panics if `databases` is zero.
    pub fn new(databases: usize) -> Self {
        assert!(databases > 0, "at least one database is required");
        Self {
            dbs: (0..databases).map(|_| ShardedStore::new(SHARDS_PER_DB)).collect(),
            aof: OnceLock::new(),
        }
    }

    /// Start journaling mutations to `aof`
    pub fn attach_aof(&self, aof: Arc<AofHandler>) {
        if self.aof.set(aof).is_err() {
            warn!("AOF handler already attached, ignoring");
        }
    }

    pub fn aof(&self) -> Option<&Arc<AofHandler>> {
        self.aof.get()
    }

    /// The store behind database `index`
    pub fn store(&self, index: usize) -> Option<&ShardedStore<Vec<u8>>> {
        self.dbs.get(index)
    }

    fn record(&self, db_index: usize, args: CmdLine) {
        if let Some(aof) = self.aof.get() {
            aof.record(db_index, args);
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn ping(&self, args: &[Vec<u8>]) -> Reply {
        match args.len() {
            1 => Reply::PONG,
            2 => Reply::bulk(args[1].clone()),
            _ => Reply::arg_num_error("ping"),
        }
    }

    fn select(&self, conn: &mut dyn Connection, args: &[Vec<u8>]) -> Reply {
        if args.len() != 2 {
            return Reply::arg_num_error("select");
        }
        let index = match std::str::from_utf8(&args[1]).ok().and_then(|s| s.parse::<usize>().ok()) {
            Some(index) => index,
            None => return Reply::error("ERR invalid DB index"),
        };
        if index >= self.dbs.len() {
            return Reply::error("ERR DB index is out of range");
        }
        conn.select_db(index);
        Reply::OK
    }

    fn set(&self, index: usize, args: &[Vec<u8>]) -> Reply {
        if args.len() < 3 {
            return Reply::arg_num_error("set");
        }
        if args.len() > 3 {
            return Reply::SYNTAX_ERR;
        }
        let key = &args[1];
        let mut shard = self.dbs[index].lock(key);
        shard.put(key, args[2].clone());
        self.record(index, args.to_vec());
        Reply::OK
    }

    fn setnx(&self, index: usize, args: &[Vec<u8>]) -> Reply {
        if args.len() != 3 {
            return Reply::arg_num_error("setnx");
        }
        let key = &args[1];
        let mut shard = self.dbs[index].lock(key);
        let inserted = shard.put_if_absent(key, args[2].clone());
        if inserted > 0 {
            self.record(index, args.to_vec());
        }
        Reply::integer(inserted as i64)
    }

    fn get(&self, index: usize, args: &[Vec<u8>]) -> Reply {
        if args.len() != 2 {
            return Reply::arg_num_error("get");
        }
        match self.dbs[index].get(&args[1]) {
            Some(value) => Reply::Bulk(Some(value)),
            None => Reply::NULL_BULK,
        }
    }

    fn del(&self, index: usize, args: &[Vec<u8>]) -> Reply {
        if args.len() < 2 {
            return Reply::arg_num_error("del");
        }
        let mut removed = 0;
        for key in &args[1..] {
            let mut shard = self.dbs[index].lock(key);
            if shard.remove(key) > 0 {
                removed += 1;
                self.record(index, vec![b"DEL".to_vec(), key.clone()]);
            }
        }
        Reply::integer(removed)
    }

    fn exists(&self, index: usize, args: &[Vec<u8>]) -> Reply {
        if args.len() < 2 {
            return Reply::arg_num_error("exists");
        }
        let store = &self.dbs[index];
        let found = args[1..].iter().filter(|key| store.contains_key(key)).count();
        Reply::integer(found as i64)
    }

    fn flushdb(&self, index: usize, args: &[Vec<u8>]) -> Reply {
        if args.len() != 1 {
            return Reply::arg_num_error("flushdb");
        }
        // Every shard stays locked until FLUSHDB is journaled
        let mut all = self.dbs[index].lock_all();
        all.clear();
        self.record(index, args.to_vec());
        drop(all);
        Reply::OK
    }

    fn rewrite_aof(&self) -> Reply {
        let Some(aof) = self.aof.get() else {
            return Reply::error("ERR append only file is disabled");
        };
        match aof.rewrite() {
            Ok(()) => Reply::OK,
            Err(err) => Reply::error(format!("ERR {}", err)),
        }
    }

    fn bg_rewrite_aof(&self) -> Reply {
        let Some(aof) = self.aof.get() else {
            return Reply::error("ERR append only file is disabled");
        };
        let aof = Arc::clone(aof);
        let spawned = thread::Builder::new()
            .name("emberkv-aof-rewrite".to_string())
            .spawn(move || {
                if let Err(err) = aof.rewrite() {
                    error!(error = %err, "background AOF rewrite failed");
                }
            });
        match spawned {
            Ok(_) => Reply::status("Background append only file rewriting started"),
            Err(err) => Reply::error(format!("ERR {}", err)),
        }
    }
}

impl Database for StandaloneDatabase {
    fn exec(&self, conn: &mut dyn Connection, args: &[Vec<u8>]) -> Reply {
        if args.is_empty() {
            return Reply::error("ERR empty command");
        }
        let index = conn.db_index();
        if index >= self.dbs.len() {
            return Reply::error("ERR DB index is out of range");
        }

        let name = cmd_name(args);
        match name.as_str() {
            "ping" => self.ping(args),
            "echo" if args.len() == 2 => Reply::bulk(args[1].clone()),
            "echo" => Reply::arg_num_error("echo"),
            "select" => self.select(conn, args),
            "set" => self.set(index, args),
            "setnx" => self.setnx(index, args),
            "get" => self.get(index, args),
            "del" => self.del(index, args),
            "exists" => self.exists(index, args),
            "dbsize" => Reply::integer(self.dbs[index].len() as i64),
            "flushdb" => self.flushdb(index, args),
            "rewriteaof" => self.rewrite_aof(),
            "bgrewriteaof" => self.bg_rewrite_aof(),
            _ => Reply::error(format!("ERR unknown command '{}'", name)),
        }
    }

    fn close(&self) {
        debug!(databases = self.dbs.len(), "database closed");
    }

    fn after_client_close(&self, conn: &dyn Connection) {
        debug!(db_index = conn.db_index(), "client closed");
    }
}

impl Dump for StandaloneDatabase {
    fn database_count(&self) -> usize {
        self.dbs.len()
    }

    fn dump_db(&self, db_index: usize, visitor: &mut dyn FnMut(CmdLine) -> bool) {
        let Some(store) = self.dbs.get(db_index) else {
            return;
        };
        store.for_each(|key, value| visitor(vec![b"SET".to_vec(), key.to_vec(), value.clone()]));
    }
}
