//! Connection and transaction state handed to the pipeline by the host.
//!
//! A [`Session`] lives as long as one SMTP connection and owns at most one
//! live [`Transaction`]. Stage handlers never mutate a transaction directly:
//! they return a [`StageOutcome`] which the session applies, and an outcome
//! addressed to a transaction that is gone is dropped.

use crate::annotation::{AnnotationOp, AuthMethod, ResultStore, TransactionAnnotation};
use crate::error::KnownSendersError;
use crate::ignore_list::IgnoreList;
use std::net::IpAddr;
use std::sync::Arc;

pub type TxnId = u64;

/// Forward-confirmed reverse DNS names of the connecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcrdnsVerdict {
    pub ptr_hostnames: Vec<String>,
}

impl FcrdnsVerdict {
    pub fn new(ptr_hostname: &str) -> Self {
        FcrdnsVerdict {
            ptr_hostnames: vec![ptr_hostname.to_string()],
        }
    }

    pub fn many<I, S>(ptr_hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FcrdnsVerdict {
            ptr_hostnames: ptr_hostnames.into_iter().map(Into::into).collect(),
        }
    }

    /// When several names are reported only the first is considered.
    pub fn primary(&self) -> Option<&str> {
        self.ptr_hostnames.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfScope {
    Helo,
    Mfrom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfVerdict {
    pub domain: String,
    pub result: SpfResult,
    pub scope: SpfScope,
}

impl SpfVerdict {
    pub fn new(scope: SpfScope, result: SpfResult, domain: &str) -> Self {
        SpfVerdict {
            domain: domain.to_string(),
            result,
            scope,
        }
    }
}

/// Signing domains whose DKIM signatures verified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DkimVerdict {
    pub pass: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub relaying: bool,
    pub remote_ip: Option<IpAddr>,
    pub fcrdns: Option<FcrdnsVerdict>,
    /// SPF verdict for the HELO identity, scoped to the connection.
    pub spf_helo: Option<SpfVerdict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxnState {
    Start,
    SenderSeen,
    RecipientsValidated,
    Queued,
    BodyAuthenticated,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Mail,
    Rcpt,
    Queue,
    Data,
}

impl Stage {
    fn target_state(self) -> TxnState {
        match self {
            Stage::Mail => TxnState::SenderSeen,
            Stage::Rcpt => TxnState::RecipientsValidated,
            Stage::Queue => TxnState::Queued,
            Stage::Data => TxnState::BodyAuthenticated,
        }
    }

    /// Only the recipient stage may run more than once per transaction.
    fn repeatable(self) -> bool {
        matches!(self, Stage::Rcpt)
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TxnId,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    /// SPF verdict for the MAIL FROM identity.
    pub spf_mfrom: Option<SpfVerdict>,
    pub dkim: Option<DkimVerdict>,
    pub results: ResultStore,
    state: TxnState,
    ignore: Arc<IgnoreList>,
}

impl Transaction {
    pub fn new(id: TxnId, mail_from: Option<&str>, ignore: Arc<IgnoreList>) -> Self {
        Transaction {
            id,
            mail_from: mail_from.map(str::to_string),
            rcpt_to: Vec::new(),
            spf_mfrom: None,
            dkim: None,
            results: ResultStore::new(),
            state: TxnState::Start,
            ignore,
        }
    }

    /// Ignore list captured when the transaction started.
    pub fn ignore_list(&self) -> &IgnoreList {
        &self.ignore
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn annotation(&self, name: &str) -> Option<&TransactionAnnotation> {
        self.results.get(name)
    }

    pub fn complete(&mut self) {
        self.state = TxnState::Done;
    }
}

/// What a stage found, surfaced to the host for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageReport {
    /// Stage does not apply to this connection's direction, or a guard stopped it.
    Skipped,
    /// MAIL stage: the validated sender domain, if any.
    Sender(Option<String>),
    /// RCPT stage: the recipient domain and its prior correspondence count.
    Recipient {
        rcpt_od: Option<String>,
        count: Option<u64>,
    },
    /// QUEUE stage: counters written for an outbound message.
    Outbound {
        sender_od: Option<String>,
        rcpt_ods: Vec<String>,
        counts: Vec<u64>,
    },
    /// DATA stage: provenance found after the body, and the recipients re-checked.
    Body {
        auth: Option<AuthMethod>,
        rcpt_ods: Vec<String>,
    },
}

#[derive(Debug)]
pub struct StageOutcome {
    pub subsystem: &'static str,
    pub txn_id: TxnId,
    pub stage: Stage,
    pub ops: Vec<AnnotationOp>,
    pub report: StageReport,
    /// The non-fatal error that cut the stage short, already logged.
    pub error: Option<KnownSendersError>,
}

impl StageOutcome {
    pub fn new(subsystem: &'static str, txn: &Transaction, stage: Stage) -> Self {
        StageOutcome {
            subsystem,
            txn_id: txn.id,
            stage,
            ops: Vec::new(),
            report: StageReport::Skipped,
            error: None,
        }
    }

    pub fn with_report(mut self, report: StageReport) -> Self {
        self.report = report;
        self
    }

    pub fn with_error(mut self, error: KnownSendersError) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug)]
pub struct Session {
    pub connection: ConnectionInfo,
    transaction: Option<Transaction>,
    next_id: TxnId,
}

impl Session {
    pub fn new(connection: ConnectionInfo) -> Self {
        Session {
            connection,
            transaction: None,
            next_id: 1,
        }
    }

    /// Start a new transaction, discarding any previous one.
    pub fn begin_transaction(
        &mut self,
        mail_from: Option<&str>,
        ignore: Arc<IgnoreList>,
    ) -> &mut Transaction {
        let id = self.next_id;
        self.next_id += 1;
        self.transaction.insert(Transaction::new(id, mail_from, ignore))
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn transaction_mut(&mut self) -> Option<&mut Transaction> {
        self.transaction.as_mut()
    }

    pub fn end_transaction(&mut self) -> Option<Transaction> {
        self.transaction.take()
    }

    /// Apply a stage result to the live transaction.
    ///
    /// Returns false, without touching anything, when the outcome belongs to
    /// a transaction that has been torn down or replaced, or arrives out of
    /// lifecycle order.
    pub fn apply(&mut self, outcome: StageOutcome) -> bool {
        let Some(txn) = self.transaction.as_mut() else {
            log::debug!(
                "{}: discarding {:?} result for ended transaction {}",
                outcome.subsystem,
                outcome.stage,
                outcome.txn_id
            );
            return false;
        };

        if txn.id != outcome.txn_id {
            log::debug!(
                "{}: discarding {:?} result for transaction {} (live: {})",
                outcome.subsystem,
                outcome.stage,
                outcome.txn_id,
                txn.id
            );
            return false;
        }

        let target = outcome.stage.target_state();
        if target < txn.state || (target == txn.state && !outcome.stage.repeatable()) {
            log::warn!(
                "{}: {:?} result arrived in state {:?}, ignoring",
                outcome.subsystem,
                outcome.stage,
                txn.state
            );
            return false;
        }

        for op in outcome.ops {
            txn.results.apply(outcome.subsystem, op);
        }
        txn.state = target;
        true
    }
}
