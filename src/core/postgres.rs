// src/core/postgres.rs

//! The local database controller: process lifecycle, role flips, and
//! replication wiring for the single PostgreSQL instance this agent owns.
//!
//! The controller shells out to the standard binaries (initdb, pg_ctl,
//! pg_basebackup, psql) the way an operator would; the HA engine only sees
//! the `DatabaseController` contract, which keeps the decision procedure
//! testable without a postmaster.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::PostgresConfig;
use crate::core::cluster::Member;
use crate::core::{Result, StewardError};

/// Shutdown modes understood by pg_ctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Smart,
    Fast,
    Immediate,
}

impl StopMode {
    fn as_flag(self) -> &'static str {
        match self {
            StopMode::Smart => "smart",
            StopMode::Fast => "fast",
            StopMode::Immediate => "immediate",
        }
    }
}

/// What the HA engine requires from the local database.
///
/// Invariants: `promote` requires a running replica; a `demote` whose
/// restart fails leaves the instance stopped and the next tick retries via
/// the restart path.
#[async_trait]
pub trait DatabaseController: Send + Sync {
    /// This member's unique name.
    fn name(&self) -> &str;

    /// The connection URL advertised in our member record.
    fn connection_string(&self) -> String;

    async fn data_directory_empty(&self) -> Result<bool>;

    /// Create a fresh primary on-disk cluster.
    async fn initialize(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self, mode: StopMode) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    async fn is_running(&self) -> Result<bool>;

    /// Currently serving writes (not in recovery).
    async fn is_leader(&self) -> Result<bool>;

    /// Convert a running replica into a primary.
    async fn promote(&self) -> Result<()>;

    /// Become a replica of `leader`; `None` fences the instance as a
    /// standby with no upstream (used when the lease is lost before a new
    /// leader is known).
    async fn demote(&self, leader: Option<&Member>) -> Result<()>;

    /// No-op when already streaming from `leader`, else demote to it.
    async fn follow_the_leader(&self, leader: &Member) -> Result<()>;

    /// Base-copy from a running leader into the (empty) data directory.
    /// `Ok(false)` means the leader was not usable; the caller retries.
    async fn sync_from_leader(&self, leader: &Member) -> Result<bool>;

    async fn write_recovery_conf(&self, leader: Option<&Member>) -> Result<()>;

    async fn remove_data_directory(&self) -> Result<()>;

    async fn create_replication_user(&self) -> Result<()>;

    async fn create_connection_users(&self) -> Result<()>;

    /// Ensure a physical replication slot exists for every peer member.
    async fn load_replication_slots(&self, member_names: &[String]) -> Result<()>;

    /// Current WAL position (replayed on a replica, written on a primary),
    /// `None` when it cannot be determined.
    async fn xlog_position(&self) -> Result<Option<u64>>;
}

/// Parses a PostgreSQL LSN of the form `X/Y` into a single 64-bit offset.
pub fn parse_lsn(lsn: &str) -> Option<u64> {
    let (hi, lo) = lsn.trim().split_once('/')?;
    let hi = u64::from_str_radix(hi, 16).ok()?;
    let lo = u64::from_str_radix(lo, 16).ok()?;
    Some((hi << 32) | lo)
}

/// The concrete controller driving one local PostgreSQL instance.
pub struct Postgres {
    config: PostgresConfig,
}

impl Postgres {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    fn binary(&self, name: &str) -> PathBuf {
        match &self.config.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn data_dir(&self) -> &str {
        self.config.data_dir.to_str().unwrap_or_default()
    }

    fn listen_host_port(&self) -> (String, String) {
        match self.config.listen.split_once(':') {
            Some((host, port)) => (host.to_string(), port.to_string()),
            None => (self.config.listen.clone(), "5432".to_string()),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        let output = Command::new(self.binary(program))
            .args(args)
            .output()
            .await
            .map_err(|e| StewardError::DbTransient(format!("failed to spawn {program}: {e}")))?;
        Ok(output)
    }

    /// Runs one SQL statement through psql against the local instance and
    /// returns its unaligned output.
    async fn query(&self, sql: &str) -> Result<String> {
        let (host, port) = self.listen_host_port();
        let mut command = Command::new(self.binary("psql"));
        command
            .arg("-tA")
            .arg("-h")
            .arg(&host)
            .arg("-p")
            .arg(&port)
            .arg("-U")
            .arg(&self.config.superuser.username)
            .arg("-d")
            .arg("postgres")
            .arg("-c")
            .arg(sql);
        if let Some(password) = &self.config.superuser.password {
            command.env("PGPASSWORD", password);
        }
        let output = command
            .output()
            .await
            .map_err(|e| StewardError::DbTransient(format!("failed to spawn psql: {e}")))?;
        if !output.status.success() {
            return Err(StewardError::DbTransient(format!(
                "query '{sql}' failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Server options passed to the postmaster on every start.
    fn server_options(&self) -> String {
        let (host, port) = self.listen_host_port();
        let mut options = format!("--listen_addresses={host} --port={port}");
        for (name, value) in &self.config.parameters {
            options.push_str(&format!(" --{name}={value}"));
        }
        options
    }

    fn recovery_conf_path(&self) -> PathBuf {
        self.config.data_dir.join("recovery.conf")
    }

    /// The primary_conninfo pointing at `leader`, with our replication
    /// credentials and our name as application_name.
    fn primary_conninfo(&self, leader: &Member) -> Result<String> {
        let (host, port) = leader.conn_host_port().ok_or_else(|| {
            StewardError::DbTransient(format!(
                "leader '{}' has an unparsable connection URL",
                leader.name
            ))
        })?;
        let mut conninfo = format!(
            "host={host} port={port} user={} application_name={}",
            self.config.replication.username, self.config.name
        );
        if let Some(password) = &self.config.replication.password {
            conninfo.push_str(&format!(" password={password}"));
        }
        Ok(conninfo)
    }

    /// Replication slot names must be valid identifiers.
    fn slot_name(member: &str) -> String {
        member
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect()
    }
}

#[async_trait]
impl DatabaseController for Postgres {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn connection_string(&self) -> String {
        let user = &self.config.superuser.username;
        let address = self.config.advertised_address();
        match &self.config.superuser.password {
            Some(password) => format!("postgres://{user}:{password}@{address}/postgres"),
            None => format!("postgres://{user}@{address}/postgres"),
        }
    }

    async fn data_directory_empty(&self) -> Result<bool> {
        match fs::read_dir(&self.config.data_dir).await {
            Ok(mut entries) => Ok(entries.next_entry().await?.is_none()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn initialize(&self) -> Result<()> {
        let output = self.run("initdb", &["-D", self.data_dir()]).await?;
        if !output.status.success() {
            return Err(StewardError::DbFatal(format!(
                "initdb failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // Let the replication user in from the configured network, and
        // ordinary connections from anywhere the operator routes them.
        let hba = format!(
            "\nhost replication {} {} md5\nhost all all 0.0.0.0/0 md5\n",
            self.config.replication.username, self.config.replication.network
        );
        let hba_path = self.config.data_dir.join("pg_hba.conf");
        let existing = fs::read_to_string(&hba_path).await.unwrap_or_default();
        fs::write(&hba_path, existing + &hba).await?;
        info!("initialized a fresh data directory at {}", self.data_dir());
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let options = self.server_options();
        let output = self
            .run(
                "pg_ctl",
                &["-D", self.data_dir(), "-o", &options, "-w", "start"],
            )
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(StewardError::DbTransient(format!(
                "start failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn stop(&self, mode: StopMode) -> Result<()> {
        let output = self
            .run(
                "pg_ctl",
                &["-D", self.data_dir(), "-m", mode.as_flag(), "-w", "stop"],
            )
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("is not running") {
            return Ok(());
        }
        Err(StewardError::DbTransient(format!(
            "stop failed: {}",
            stderr.trim()
        )))
    }

    async fn restart(&self) -> Result<()> {
        let options = self.server_options();
        let output = self
            .run(
                "pg_ctl",
                &[
                    "-D",
                    self.data_dir(),
                    "-o",
                    &options,
                    "-m",
                    "fast",
                    "-w",
                    "restart",
                ],
            )
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(StewardError::DbTransient(format!(
                "restart failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn is_running(&self) -> Result<bool> {
        let output = self.run("pg_ctl", &["-D", self.data_dir(), "status"]).await?;
        Ok(output.status.success())
    }

    async fn is_leader(&self) -> Result<bool> {
        let in_recovery = self.query("SELECT pg_is_in_recovery()").await?;
        Ok(in_recovery == "f")
    }

    async fn promote(&self) -> Result<()> {
        let output = self
            .run("pg_ctl", &["-D", self.data_dir(), "-w", "promote"])
            .await?;
        if output.status.success() {
            info!("promoted the local instance to primary");
            Ok(())
        } else {
            Err(StewardError::DbTransient(format!(
                "promote failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn demote(&self, leader: Option<&Member>) -> Result<()> {
        self.stop(StopMode::Fast).await?;
        self.write_recovery_conf(leader).await?;
        self.start().await?;
        match leader {
            Some(leader) => info!("demoted the local instance, now following '{}'", leader.name),
            None => info!("demoted the local instance into a fenced standby"),
        }
        Ok(())
    }

    async fn follow_the_leader(&self, leader: &Member) -> Result<()> {
        let conninfo = self.primary_conninfo(leader)?;
        if let Ok(current) = fs::read_to_string(self.recovery_conf_path()).await
            && current.contains(&conninfo)
        {
            return Ok(());
        }
        self.demote(Some(leader)).await
    }

    async fn sync_from_leader(&self, leader: &Member) -> Result<bool> {
        let conninfo = self.primary_conninfo(leader)?;
        let mut command = Command::new(self.binary("pg_basebackup"));
        command
            .arg("--pgdata")
            .arg(&self.config.data_dir)
            .arg("--xlog-method=stream")
            .arg("--dbname")
            .arg(&conninfo);
        if let Some(password) = &self.config.replication.password {
            command.env("PGPASSWORD", password);
        }
        let output = command
            .output()
            .await
            .map_err(|e| StewardError::DbTransient(format!("failed to spawn pg_basebackup: {e}")))?;
        if output.status.success() {
            Ok(true)
        } else {
            warn!(
                "base backup from '{}' failed: {}",
                leader.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Ok(false)
        }
    }

    async fn write_recovery_conf(&self, leader: Option<&Member>) -> Result<()> {
        let mut conf = String::from("standby_mode = 'on'\nrecovery_target_timeline = 'latest'\n");
        if let Some(leader) = leader {
            let conninfo = self.primary_conninfo(leader)?;
            conf.push_str(&format!("primary_conninfo = '{conninfo}'\n"));
        }
        fs::write(self.recovery_conf_path(), conf).await?;
        Ok(())
    }

    async fn remove_data_directory(&self) -> Result<()> {
        match fs::remove_dir_all(&self.config.data_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_replication_user(&self) -> Result<()> {
        let user = &self.config.replication.username;
        let sql = match &self.config.replication.password {
            Some(password) => {
                format!("CREATE USER \"{user}\" WITH REPLICATION ENCRYPTED PASSWORD '{password}'")
            }
            None => format!("CREATE USER \"{user}\" WITH REPLICATION"),
        };
        match self.query(&sql).await {
            Ok(_) => Ok(()),
            Err(StewardError::DbTransient(msg)) if msg.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_connection_users(&self) -> Result<()> {
        let Some(admin) = &self.config.admin else {
            return Ok(());
        };
        let sql = match &admin.password {
            Some(password) => format!(
                "CREATE USER \"{}\" WITH CREATEDB CREATEROLE ENCRYPTED PASSWORD '{password}'",
                admin.username
            ),
            None => format!("CREATE USER \"{}\" WITH CREATEDB CREATEROLE", admin.username),
        };
        match self.query(&sql).await {
            Ok(_) => Ok(()),
            Err(StewardError::DbTransient(msg)) if msg.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn load_replication_slots(&self, member_names: &[String]) -> Result<()> {
        let existing = self
            .query("SELECT slot_name FROM pg_replication_slots")
            .await?;
        let existing: Vec<&str> = existing.lines().collect();
        for member in member_names {
            if member == self.name() {
                continue;
            }
            let slot = Self::slot_name(member);
            if !existing.contains(&slot.as_str()) {
                self.query(&format!(
                    "SELECT pg_create_physical_replication_slot('{slot}')"
                ))
                .await?;
                info!("created replication slot '{slot}'");
            }
        }
        Ok(())
    }

    async fn xlog_position(&self) -> Result<Option<u64>> {
        let sql = if self.is_leader().await? {
            "SELECT pg_current_xlog_location()"
        } else {
            "SELECT pg_last_xlog_replay_location()"
        };
        let lsn = self.query(sql).await?;
        Ok(parse_lsn(&lsn))
    }
}
