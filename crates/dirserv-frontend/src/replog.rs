//! The replication log.
//!
//! Successful modifies are appended as LDIF-style change records for the
//! replication consumers. The sink is append-only; a mutex serializes
//! concurrent writers.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::debug;

use dirserv_core::clock::Clock;
use dirserv_core::dn::Dn;
use dirserv_core::modify::ModList;

/// Where replicated changes go.
pub trait ReplicationLog: Send + Sync {
    fn append_modify(&self, dn: &Dn, mods: &ModList) -> std::io::Result<()>;
}

/// Renders one change record.
///
/// ```text
/// time: 1783900800
/// dn: cn=Alice,dc=example
/// changetype: modify
/// replace: cn
/// cn: Alicia
/// -
/// ```
pub fn format_modify_record(time: i64, dn: &Dn, mods: &ModList) -> String {
    let mut out = String::new();
    out.push_str(&format!("time: {time}\n"));
    out.push_str(&format!("dn: {}\n", dn.as_str()));
    out.push_str("changetype: modify\n");
    for m in mods {
        out.push_str(&format!("{}: {}\n", m.op, m.attr));
        for v in &m.values {
            out.push_str(&format!("{}: {v}\n", m.attr));
        }
        out.push_str("-\n");
    }
    out.push('\n');
    out
}

/// File-backed replication log.
pub struct FileReplog {
    file: Mutex<File>,
    clock: Arc<dyn Clock>,
}

impl FileReplog {
    /// Opens (or creates) the log at `path` in append mode.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        debug!(path = ?path.as_ref(), "opened replication log");
        Ok(Self {
            file: Mutex::new(file),
            clock,
        })
    }
}

impl ReplicationLog for FileReplog {
    fn append_modify(&self, dn: &Dn, mods: &ModList) -> std::io::Result<()> {
        let record = format_modify_record(self.clock.now().timestamp(), dn, mods);
        let mut file = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("replog mutex poisoned: {e}")))?;
        file.write_all(record.as_bytes())?;
        file.flush()
    }
}

/// In-memory log for tests.
#[derive(Default)]
pub struct MemoryReplog {
    records: Mutex<Vec<String>>,
}

impl MemoryReplog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<String> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ReplicationLog for MemoryReplog {
    fn append_modify(&self, dn: &Dn, mods: &ModList) -> std::io::Result<()> {
        let record = format_modify_record(0, dn, mods);
        self.records
            .lock()
            .map_err(|e| std::io::Error::other(format!("replog mutex poisoned: {e}")))?
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use dirserv_core::clock::FixedClock;
    use dirserv_core::modify::{ModOp, Modification};

    fn mods() -> ModList {
        vec![
            Modification::replace_one("cn", "Alicia"),
            Modification::new(ModOp::Delete, "mail", vec!["a@x".to_owned()]),
        ]
    }

    #[test]
    fn record_format() {
        let dn = Dn::parse("cn=Alice,dc=example").unwrap();
        let record = format_modify_record(100, &dn, &mods());
        assert_eq!(
            record,
            "time: 100\n\
             dn: cn=Alice,dc=example\n\
             changetype: modify\n\
             replace: cn\n\
             cn: Alicia\n\
             -\n\
             delete: mail\n\
             mail: a@x\n\
             -\n\n"
        );
    }

    #[test]
    fn file_replog_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replog");
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()));
        let log = FileReplog::open(&path, clock).unwrap();

        let dn = Dn::parse("cn=Alice,dc=example").unwrap();
        log.append_modify(&dn, &mods()).unwrap();
        log.append_modify(&dn, &mods()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("changetype: modify").count(), 2);
        assert!(content.starts_with("time: "));
    }

    #[test]
    fn memory_replog_collects_records() {
        let log = MemoryReplog::new();
        let dn = Dn::parse("cn=Alice,dc=example").unwrap();
        log.append_modify(&dn, &mods()).unwrap();
        let records = log.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].contains("dn: cn=Alice,dc=example"));
    }
}
