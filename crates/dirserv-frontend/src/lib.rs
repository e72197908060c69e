//! Frontend for the dirserv system: decoded-request validation, operational
//! attribute stamping, backend selection and the replication log.
//!
//! The exposed surface is [`dispatch::Dispatcher::modify`]: one call per
//! decoded modify request, with the reply routed through the configured
//! [`ReplySink`](dirserv_core::operation::ReplySink).

pub mod backend;
pub mod dispatch;
pub mod replog;
pub mod request;
pub mod stamper;
