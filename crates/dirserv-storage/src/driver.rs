//! The transaction driver: one modify, end to end.
//!
//! Each call runs the state sequence open-outer, lookup (taking the entry's
//! cache writer lock), open-nested, apply, persist, commit-nested, commit-
//! outer. Transient storage errors (deadlock, lock not granted) abort the
//! outer transaction, release the entry lock, and restart the whole sequence
//! after a capped exponential backoff; everything else surfaces as the reply.
//! External observers see either the full pre-state or the full post-state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use dirserv_core::acl::AccessControl;
use dirserv_core::dn::Dn;
use dirserv_core::entry::{Attribute, Entry, Value};
use dirserv_core::modify::ModList;
use dirserv_core::operation::{Assertion, Operation, ReadEntry, Reply, ResultCode};
use dirserv_core::schema::Schema;

use crate::cache::EntryCache;
use crate::engine;
use crate::error::StorageError;
use crate::traits::{Store, TxnId};

/// Restart policy for transient storage errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Restarts allowed before the transient error surfaces as `Other`.
    pub max_retries: u32,
    /// First backoff; doubles per retry.
    pub backoff_ms: u64,
    /// Backoff ceiling.
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            backoff_ms: 10,
            backoff_cap_ms: 1000,
        }
    }
}

/// Checkpoint thresholds forwarded to the store after successful commits.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    pub kbytes: u32,
    pub minutes: u32,
}

/// Outcome of one attempt.
enum Attempt {
    Done(Reply),
    Retry,
}

/// Drives modify operations against one store.
pub struct ModifyDriver {
    store: Arc<dyn Store>,
    cache: Arc<EntryCache>,
    schema: Arc<Schema>,
    acl: Arc<dyn AccessControl>,
    retry: RetryPolicy,
    checkpoint: Option<CheckpointPolicy>,
}

impl ModifyDriver {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<EntryCache>,
        schema: Arc<Schema>,
        acl: Arc<dyn AccessControl>,
    ) -> Self {
        Self {
            store,
            cache,
            schema,
            acl,
            retry: RetryPolicy::default(),
            checkpoint: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = Some(policy);
        self
    }

    /// Applies `mods` to the entry named by `dn`.
    ///
    /// The returned reply is ready for the sink; a reply of
    /// [`ResultCode::Abandoned`] means no reply is sent at all.
    pub fn modify(&self, op: &Operation, dn: &Dn, mods: &ModList) -> Reply {
        let mut retries: u32 = 0;
        loop {
            // Retry boundary: a concurrent Abandon stops us here, never
            // mid-attempt.
            if op.is_abandoned() {
                return Reply::with_code(ResultCode::Abandoned);
            }
            match self.attempt(op, dn, mods) {
                Attempt::Done(reply) => {
                    if retries > 0 {
                        debug!(retries, dn = %dn, "modify completed after restarts");
                    }
                    return reply;
                }
                Attempt::Retry => {
                    if retries >= self.retry.max_retries {
                        warn!(retries, dn = %dn, "modify giving up after repeated contention");
                        return Reply::error(ResultCode::Other, "internal error");
                    }
                    retries += 1;
                    debug!(retries, dn = %dn, "transient storage error, restarting modify");
                    std::thread::yield_now();
                    std::thread::sleep(self.backoff(retries));
                }
            }
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let ms = (self.retry.backoff_ms << shift).min(self.retry.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    /// Aborts the outer transaction and routes the error: transient restarts,
    /// everything else is an internal failure.
    fn fail(&self, outer: TxnId, e: &StorageError) -> Attempt {
        let _ = self.store.txn_abort(outer);
        if e.is_retryable() {
            Attempt::Retry
        } else {
            warn!(error = %e, "modify failed with storage error");
            Attempt::Done(Reply::error(ResultCode::Other, "internal error"))
        }
    }

    fn done(&self, outer: TxnId, reply: Reply) -> Attempt {
        let _ = self.store.txn_abort(outer);
        Attempt::Done(reply)
    }

    fn attempt(&self, op: &Operation, dn: &Dn, mods: &ModList) -> Attempt {
        let outer = match self.store.txn_begin(None) {
            Ok(t) => t,
            Err(e) if e.is_retryable() => return Attempt::Retry,
            Err(e) => {
                warn!(error = %e, "failed to open transaction");
                return Attempt::Done(Reply::error(ResultCode::Other, "internal error"));
            }
        };

        // Pin the entry: writer lock for the rest of the attempt. Released
        // (guard dropped) before any backoff sleep.
        let slot = match self.cache.slot(dn.normalized()) {
            Ok(s) => s,
            Err(e) => return self.fail(outer, &e),
        };
        let Ok(mut guard) = slot.write() else {
            return self.done(outer, Reply::error(ResultCode::Other, "internal error"));
        };

        let mut fakeroot = false;
        let entry: Entry = match guard.as_ref() {
            Some(cached) => cached.clone(),
            None => match self.store.dn2entry(outer, dn.normalized()) {
                Ok(Some(e)) => {
                    *guard = Some(e.clone());
                    e
                }
                Ok(None) if dn.is_root() => {
                    // Modifying the tree root before anything exists: give
                    // the engine an in-memory glue entry, never persisted.
                    fakeroot = true;
                    match self.fake_root() {
                        Ok(e) => e,
                        Err(e) => return self.fail(outer, &e),
                    }
                }
                Ok(None) => {
                    return self.done(outer, Reply::with_code(ResultCode::NoSuchObject));
                }
                Err(e) => return self.fail(outer, &e),
            },
        };

        // Referrals and unpromoted glue are only writable when the client
        // asserts it is managing the DSA-specific entries itself.
        if !op.manage_dsa_it && (entry.is_referral() || entry.is_glue()) {
            return self.done(
                outer,
                Reply::referral(ResultCode::Referral, entry.referral_uris()),
            );
        }

        if let Some(assertion) = &op.assertion {
            if !self.assertion_holds(&entry, assertion) {
                return self.done(outer, Reply::with_code(ResultCode::AssertionFailed));
            }
        }

        let pre_read = op
            .pre_read
            .as_ref()
            .map(|ctl| ReadEntry::materialize(&entry, ctl));

        let nested = match self.store.txn_begin(Some(outer)) {
            Ok(t) => t,
            Err(e) => return self.fail(outer, &e),
        };

        // The engine works on a stack copy; the cached image stays pristine
        // until commit.
        let mut working = entry.clone();
        match engine::apply_mods(
            self.store.as_ref(),
            nested,
            &self.schema,
            self.acl.as_ref(),
            op,
            &mut working,
            mods,
        ) {
            Ok(outcome) if !outcome.applied => {
                // Validated no-op: abort everything, tell the client it
                // would have worked.
                return self.done(outer, Reply::with_code(ResultCode::NoOperation));
            }
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                let _ = self.store.txn_abort(outer);
                return Attempt::Retry;
            }
            Err(e) => {
                return self.done(outer, Reply::error(e.result_code(), e.to_string()));
            }
        }

        if !fakeroot {
            if let Err(e) = self.store.id2entry_update(nested, &working) {
                return self.fail(outer, &e);
            }
        }

        if let Err(e) = self.store.txn_commit(nested) {
            warn!(error = %e, "nested transaction commit failed");
            return self.done(outer, Reply::error(ResultCode::Other, "internal error"));
        }

        let post_read = op
            .post_read
            .as_ref()
            .map(|ctl| ReadEntry::materialize(&working, ctl));

        // Install the new image, then commit. The fakeroot is dropped, not
        // cached.
        *guard = if fakeroot { None } else { Some(working) };
        if let Err(e) = self.store.txn_commit(outer) {
            warn!(error = %e, "outer transaction commit failed");
            // The cached image no longer matches the store.
            *guard = None;
            return Attempt::Done(Reply::error(ResultCode::Other, "internal error"));
        }

        if let Some(cp) = &self.checkpoint {
            std::thread::yield_now();
            if let Err(e) = self.store.checkpoint(cp.kbytes, cp.minutes) {
                warn!(error = %e, "checkpoint failed");
            }
        }

        let mut reply = Reply::success();
        reply.pre_read = pre_read;
        reply.post_read = post_read;
        Attempt::Done(reply)
    }

    fn assertion_holds(&self, entry: &Entry, assertion: &Assertion) -> bool {
        let Some(desc) = self.schema.attr(&assertion.attr) else {
            return false;
        };
        let Ok(value) = Value::normalized(&desc, &assertion.value) else {
            return false;
        };
        entry
            .attr_find(&desc)
            .is_some_and(|a| a.find(&value).is_some())
    }

    fn fake_root(&self) -> Result<Entry, StorageError> {
        let desc = self
            .schema
            .attr("objectClass")
            .ok_or_else(|| StorageError::Internal("schema lacks objectClass".to_owned()))?;
        let glue = Value::normalized(&desc, "glue")
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let mut entry = Entry::new(0, Dn::root());
        entry.attrs.push(Attribute::with_values(desc, vec![glue]));
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use dirserv_core::acl::AllowAll;
    use dirserv_core::modify::{ModOp, Modification};
    use dirserv_core::operation::ReadControl;
    use dirserv_core::schema::AttrDesc;

    use crate::traits::IndexOp;

    /// In-memory single-entry store with injectable transient failures.
    struct MockStore {
        entry: Mutex<Option<Entry>>,
        /// Remaining dn2entry calls that fail with `Deadlock`.
        fail_lookups: Mutex<u32>,
        /// Remaining txn_begin(None) calls that fail with `NotGranted`.
        fail_begins: Mutex<u32>,
        log: Mutex<Vec<String>>,
        next: AtomicU64,
    }

    impl MockStore {
        fn new(entry: Option<Entry>) -> Self {
            Self {
                entry: Mutex::new(entry),
                fail_lookups: Mutex::new(0),
                fail_begins: Mutex::new(0),
                log: Mutex::new(Vec::new()),
                next: AtomicU64::new(0),
            }
        }

        fn log_entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.log_entries()
                .iter()
                .filter(|l| l.starts_with(prefix))
                .count()
        }

        fn push(&self, line: String) {
            self.log.lock().unwrap().push(line);
        }
    }

    impl Store for MockStore {
        fn txn_begin(&self, parent: Option<TxnId>) -> crate::error::Result<TxnId> {
            if parent.is_none() {
                let mut fail = self.fail_begins.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(StorageError::NotGranted);
                }
            }
            let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            self.push(format!(
                "begin {}",
                if parent.is_some() { "nested" } else { "outer" }
            ));
            Ok(TxnId(id))
        }

        fn txn_commit(&self, txn: TxnId) -> crate::error::Result<()> {
            self.push(format!("commit {txn}"));
            Ok(())
        }

        fn txn_abort(&self, txn: TxnId) -> crate::error::Result<()> {
            self.push(format!("abort {txn}"));
            Ok(())
        }

        fn checkpoint(&self, _kbytes: u32, _minutes: u32) -> crate::error::Result<()> {
            self.push("checkpoint".to_owned());
            Ok(())
        }

        fn dn2entry(&self, _txn: TxnId, ndn: &str) -> crate::error::Result<Option<Entry>> {
            let mut fail = self.fail_lookups.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(StorageError::Deadlock);
            }
            self.push(format!("lookup {ndn}"));
            Ok(self
                .entry
                .lock()
                .unwrap()
                .as_ref()
                .filter(|e| e.dn.normalized() == ndn)
                .cloned())
        }

        fn id2entry_add(&self, _txn: TxnId, _entry: &mut Entry) -> crate::error::Result<()> {
            Err(StorageError::Internal("not supported".to_owned()))
        }

        fn id2entry_update(&self, _txn: TxnId, entry: &Entry) -> crate::error::Result<()> {
            self.push("update".to_owned());
            *self.entry.lock().unwrap() = Some(entry.clone());
            Ok(())
        }

        fn is_indexed(&self, _desc: &AttrDesc) -> bool {
            false
        }

        fn index_values(
            &self,
            _txn: TxnId,
            _desc: &AttrDesc,
            _norm_values: &[String],
            _id: u64,
            _op: IndexOp,
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::core())
    }

    fn alice(s: &Schema) -> Entry {
        let mut e = Entry::new(1, Dn::parse("cn=Alice,dc=example").unwrap());
        for (name, raws) in [
            ("objectClass", vec!["top", "person"]),
            ("cn", vec!["Alice"]),
            ("sn", vec!["Smith"]),
        ] {
            let desc = s.attr(name).unwrap();
            let vals = raws
                .iter()
                .map(|r| Value::normalized(&desc, r).unwrap())
                .collect();
            e.attrs.push(Attribute::with_values(desc, vals));
        }
        e
    }

    fn driver(store: Arc<MockStore>, s: Arc<Schema>) -> ModifyDriver {
        ModifyDriver::new(store, Arc::new(EntryCache::new()), s, Arc::new(AllowAll))
            .with_retry_policy(RetryPolicy {
                max_retries: 4,
                backoff_ms: 1,
                backoff_cap_ms: 2,
            })
    }

    fn rename_mod() -> ModList {
        vec![Modification::replace_one("cn", "Alicia")]
    }

    #[test]
    fn success_path_commits_nested_then_outer() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        let d = driver(Arc::clone(&store), s);

        let reply = d.modify(
            &Operation::anonymous(),
            &Dn::parse("cn=alice,dc=example").unwrap(),
            &rename_mod(),
        );
        assert_eq!(reply.code, ResultCode::Success);
        assert_eq!(store.count("begin outer"), 1);
        assert_eq!(store.count("begin nested"), 1);
        assert_eq!(store.count("commit"), 2);
        assert_eq!(store.count("update"), 1);
        let stored = store.entry.lock().unwrap().clone().unwrap();
        assert_eq!(stored.attr_by_name("cn").unwrap().vals[0].raw(), "Alicia");
    }

    #[test]
    fn deadlock_on_lookup_retries_and_succeeds() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        *store.fail_lookups.lock().unwrap() = 2;
        let d = driver(Arc::clone(&store), s);

        let reply = d.modify(
            &Operation::anonymous(),
            &Dn::parse("cn=alice,dc=example").unwrap(),
            &rename_mod(),
        );
        assert_eq!(reply.code, ResultCode::Success);
        // Attempts 1 and 2 deadlocked after opening the outer transaction;
        // both were aborted, the third went through.
        assert_eq!(store.count("begin outer"), 3);
        assert_eq!(store.count("abort"), 2);
        assert_eq!(store.count("update"), 1);
    }

    #[test]
    fn retry_ceiling_becomes_internal_error() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        *store.fail_begins.lock().unwrap() = u32::MAX;
        let d = driver(Arc::clone(&store), s);

        let reply = d.modify(
            &Operation::anonymous(),
            &Dn::parse("cn=alice,dc=example").unwrap(),
            &rename_mod(),
        );
        assert_eq!(reply.code, ResultCode::Other);
        assert_eq!(reply.text, "internal error");
        assert_eq!(store.count("begin outer"), 0);
    }

    #[test]
    fn abandon_before_start_performs_no_storage_io() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        let d = driver(Arc::clone(&store), s);

        let op = Operation::anonymous();
        op.abandon();
        let reply = d.modify(&op, &Dn::parse("cn=alice,dc=example").unwrap(), &rename_mod());
        assert_eq!(reply.code, ResultCode::Abandoned);
        assert!(store.log_entries().is_empty());
    }

    #[test]
    fn abandon_at_retry_boundary_stops_the_operation() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        // Every attempt deadlocks, so the driver keeps hitting the retry
        // boundary until the concurrent abandon lands.
        *store.fail_lookups.lock().unwrap() = u32::MAX;
        let d = driver(Arc::clone(&store), Arc::clone(&s)).with_retry_policy(RetryPolicy {
            max_retries: u32::MAX,
            backoff_ms: 1,
            backoff_cap_ms: 2,
        });

        let op = Operation::anonymous();
        let handle = op.abandon_handle();
        let abandoner = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.store(true, Ordering::Release);
        });
        let reply = d.modify(&op, &Dn::parse("cn=alice,dc=example").unwrap(), &rename_mod());
        abandoner.join().unwrap();

        assert_eq!(reply.code, ResultCode::Abandoned);
        assert_eq!(store.count("commit"), 0);
        assert_eq!(store.count("update"), 0);
    }

    #[test]
    fn missing_entry_is_no_such_object() {
        let s = schema();
        let store = Arc::new(MockStore::new(None));
        let d = driver(Arc::clone(&store), s);

        let reply = d.modify(
            &Operation::anonymous(),
            &Dn::parse("cn=ghost,dc=example").unwrap(),
            &rename_mod(),
        );
        assert_eq!(reply.code, ResultCode::NoSuchObject);
        assert_eq!(store.count("abort"), 1);
    }

    #[test]
    fn fake_root_is_glue_and_gets_referral_without_manage_dsa_it() {
        let s = schema();
        let store = Arc::new(MockStore::new(None));
        let d = driver(Arc::clone(&store), s);

        let reply = d.modify(&Operation::anonymous(), &Dn::root(), &rename_mod());
        assert_eq!(reply.code, ResultCode::Referral);
    }

    #[test]
    fn fake_root_is_modifiable_with_manage_dsa_it_and_never_persisted() {
        let s = schema();
        let store = Arc::new(MockStore::new(None));
        let d = driver(Arc::clone(&store), s);

        let mut op = Operation::anonymous();
        op.manage_dsa_it = true;
        let mods = vec![Modification::new(
            ModOp::Add,
            "description",
            vec!["root".to_owned()],
        )];
        let reply = d.modify(&op, &Dn::root(), &mods);
        assert_eq!(reply.code, ResultCode::Success);
        assert_eq!(store.count("update"), 0);
    }

    #[test]
    fn assertion_control_gates_the_modify() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        let d = driver(Arc::clone(&store), Arc::clone(&s));
        let dn = Dn::parse("cn=alice,dc=example").unwrap();

        let mut op = Operation::anonymous();
        op.assertion = Some(Assertion {
            attr: "sn".to_owned(),
            value: "Jones".to_owned(),
        });
        let reply = d.modify(&op, &dn, &rename_mod());
        assert_eq!(reply.code, ResultCode::AssertionFailed);

        op.assertion = Some(Assertion {
            attr: "sn".to_owned(),
            value: "smith".to_owned(),
        });
        let reply = d.modify(&op, &dn, &rename_mod());
        assert_eq!(reply.code, ResultCode::Success);
    }

    #[test]
    fn pre_and_post_read_controls_materialize_both_images() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        let d = driver(Arc::clone(&store), s);

        let mut op = Operation::anonymous();
        op.pre_read = Some(ReadControl {
            attrs: vec!["cn".to_owned()],
        });
        op.post_read = Some(ReadControl {
            attrs: vec!["cn".to_owned()],
        });
        let reply = d.modify(
            &op,
            &Dn::parse("cn=alice,dc=example").unwrap(),
            &rename_mod(),
        );
        assert_eq!(reply.code, ResultCode::Success);
        assert_eq!(
            reply.pre_read.unwrap().attrs,
            vec![("cn".to_owned(), vec!["Alice".to_owned()])]
        );
        assert_eq!(
            reply.post_read.unwrap().attrs,
            vec![("cn".to_owned(), vec!["Alicia".to_owned()])]
        );
    }

    #[test]
    fn no_op_request_aborts_instead_of_committing() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        let d = driver(Arc::clone(&store), s);

        let mut op = Operation::anonymous();
        op.no_op = true;
        let reply = d.modify(
            &op,
            &Dn::parse("cn=alice,dc=example").unwrap(),
            &rename_mod(),
        );
        assert_eq!(reply.code, ResultCode::NoOperation);
        assert_eq!(store.count("update"), 0);
        assert_eq!(store.count("commit"), 0);
        assert_eq!(store.count("abort"), 1);
        let stored = store.entry.lock().unwrap().clone().unwrap();
        assert_eq!(stored.attr_by_name("cn").unwrap().vals[0].raw(), "Alice");
    }

    #[test]
    fn engine_error_surfaces_with_engine_text() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        let d = driver(Arc::clone(&store), s);

        let mods = vec![Modification::new(
            ModOp::Add,
            "cn",
            vec!["Alice".to_owned()],
        )];
        let reply = d.modify(
            &Operation::anonymous(),
            &Dn::parse("cn=alice,dc=example").unwrap(),
            &mods,
        );
        assert_eq!(reply.code, ResultCode::TypeOrValueExists);
        assert!(reply.text.contains("cn"));
    }

    #[test]
    fn second_modify_hits_the_cache() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        let d = driver(Arc::clone(&store), s);
        let dn = Dn::parse("cn=alice,dc=example").unwrap();

        d.modify(&Operation::anonymous(), &dn, &rename_mod());
        let mods = vec![Modification::replace_one("description", "two")];
        let reply = d.modify(&Operation::anonymous(), &dn, &mods);
        assert_eq!(reply.code, ResultCode::Success);
        // Only the first attempt had to read from the store.
        assert_eq!(store.count("lookup"), 1);
    }

    #[test]
    fn checkpoint_runs_after_commit_when_configured() {
        let s = schema();
        let store = Arc::new(MockStore::new(Some(alice(&s))));
        let d = driver(Arc::clone(&store), s).with_checkpoint(CheckpointPolicy {
            kbytes: 64,
            minutes: 5,
        });

        let reply = d.modify(
            &Operation::anonymous(),
            &Dn::parse("cn=alice,dc=example").unwrap(),
            &rename_mod(),
        );
        assert_eq!(reply.code, ResultCode::Success);
        assert_eq!(store.count("checkpoint"), 1);
    }
}
