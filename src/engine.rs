//! Engine Module
//!
//! Wires the database and the append-only file together.
//!
//! ## Responsibilities
//! - Create the keyspace
//! - Open the AOF and replay it before anything else touches the keyspace
//! - Attach the AOF so later mutations are journaled
//! - Shut persistence down cleanly

use std::sync::Arc;

use tracing::info;

use crate::aof::{AofHandler, ReplayStats};
use crate::config::Config;
use crate::database::{Connection, Database, Dump, StandaloneDatabase};
use crate::error::{EmberError, Result};
use crate::protocol::Reply;

/// A database with its persistence attached
///
/// ## Startup order
/// 1. create empty databases
/// 2. open the AOF (writer thread running, nothing queued yet)
/// 3. replay the AOF with appends paused
/// 4. attach the AOF to the database
///
/// Nothing can reach the database through the engine until `open` returns.
pub struct Engine {
    config: Config,
    db: Arc<StandaloneDatabase>,
    aof: Option<Arc<AofHandler>>,
    replayed: Option<ReplayStats>,
}

impl Engine {
    /// Open an engine, recovering from the AOF if configured
    pub fn open(config: Config) -> Result<Self> {
        if config.databases == 0 {
            return Err(EmberError::Config("databases must be at least 1".to_string()));
        }

        let db = Arc::new(StandaloneDatabase::new(config.databases));
        if !config.append_only {
            info!(databases = config.databases, "engine opened without AOF");
            return Ok(Self {
                config,
                db,
                aof: None,
                replayed: None,
            });
        }

        let databases = config.databases;
        let aof = AofHandler::open(
            &config,
            Box::new(move || Box::new(StandaloneDatabase::new(databases)) as Box<dyn Dump>),
        )?;

        let replayed = if config.load_on_startup {
            Some(aof.load(&*db, 0)?)
        } else {
            None
        };

        let aof = Arc::new(aof);
        db.attach_aof(Arc::clone(&aof));

        info!(
            databases = config.databases,
            aof = %config.append_filename.display(),
            fsync = %config.append_fsync,
            "engine opened"
        );

        Ok(Self {
            config,
            db,
            aof: Some(aof),
            replayed,
        })
    }

    /// Execute one command on behalf of `conn`
    pub fn exec(&self, conn: &mut dyn Connection, args: &[Vec<u8>]) -> Reply {
        self.db.exec(conn, args)
    }

    /// Drain and fsync the AOF, then close the database. Idempotent.
    pub fn close(&self) {
        if let Some(aof) = &self.aof {
            aof.close();
        }
        self.db.close();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn database(&self) -> &Arc<StandaloneDatabase> {
        &self.db
    }

    pub fn aof(&self) -> Option<&Arc<AofHandler>> {
        self.aof.as_ref()
    }

    /// What startup replay did, if it ran
    pub fn replay_stats(&self) -> Option<&ReplayStats> {
        self.replayed.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
