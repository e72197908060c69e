//! Request dispatch.
//!
//! One entry point per decoded modify: validate the frame, pick the backend
//! owning the longest matching suffix, enforce the referral and replica
//! rules, run the backend, and on success feed the replication log. Replies
//! leave through the sink; an abandoned operation produces no reply at all.

use std::sync::Arc;

use tracing::{debug, warn};

use dirserv_core::dn::Dn;
use dirserv_core::operation::{Operation, Reply, ReplySink, ResultCode};

use crate::backend::Backend;
use crate::replog::ReplicationLog;
use crate::request::{ModifyRequest, parse_modify_request};

/// Routes decoded requests to backends.
pub struct Dispatcher {
    backends: Vec<Arc<dyn Backend>>,
    /// Referral URIs for names no backend serves.
    default_referral: Vec<String>,
    replog: Option<Arc<dyn ReplicationLog>>,
    sink: Arc<dyn ReplySink>,
}

impl Dispatcher {
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        default_referral: Vec<String>,
        replog: Option<Arc<dyn ReplicationLog>>,
        sink: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            backends,
            default_referral,
            replog,
            sink,
        }
    }

    /// Handles one modify request end to end; returns the reply code that
    /// went to the sink (or [`ResultCode::Abandoned`], which never does).
    pub fn modify(&self, op: &Operation, req: &ModifyRequest) -> ResultCode {
        let (dn, mods) = match parse_modify_request(req) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(dn = %req.dn, error = %e, "malformed modify request");
                return self.send(op, Reply::error(e.result_code(), e.to_string()));
            }
        };

        let Some(backend) = self.select_backend(&dn) else {
            debug!(dn = %dn, "no backend for target, referring");
            return self.send(
                op,
                Reply::referral(ResultCode::PartialResults, self.default_referral.clone()),
            );
        };

        if !backend.supports_modify() {
            return self.send(
                op,
                Reply::error(
                    ResultCode::UnwillingToPerform,
                    "operation not supported within naming context",
                ),
            );
        }
        if backend.readonly() {
            return self.send(
                op,
                Reply::error(ResultCode::UnwillingToPerform, "database is read-only"),
            );
        }

        // A replica takes writes only from its replication principal;
        // everyone else is sent to the master.
        if let Some(update_dn) = backend.update_dn() {
            if op.bind_dn.as_ref() != Some(update_dn) {
                let referrals = if backend.update_referral().is_empty() {
                    self.default_referral.clone()
                } else {
                    backend.update_referral().to_vec()
                };
                return self.send(
                    op,
                    Reply::referral(ResultCode::PartialResults, referrals),
                );
            }
        }

        let reply = backend.modify(op, &dn, mods.clone());
        if reply.code == ResultCode::Abandoned {
            return ResultCode::Abandoned;
        }
        let code = self.send(op, reply);

        if code.is_success() {
            if let Some(log) = &self.replog {
                if let Err(e) = log.append_modify(&dn, &mods) {
                    warn!(dn = %dn, error = %e, "replication log append failed");
                }
            }
        }
        code
    }

    /// Longest-suffix match over the registered backends.
    fn select_backend(&self, dn: &Dn) -> Option<&Arc<dyn Backend>> {
        self.backends
            .iter()
            .filter(|b| dn.is_within(b.suffix()))
            .max_by_key(|b| b.suffix().normalized().len())
    }

    fn send(&self, op: &Operation, reply: Reply) -> ResultCode {
        self.sink.send_result(op, &reply);
        reply.code
    }
}
