//! Known-senders pipeline.
//!
//! Outbound: after a relayed message is queued, count every remote domain
//! the local sender wrote to.
//!
//! Inbound: once the sender's domain is verified (FCrDNS or SPF at MAIL, DKIM
//! after the body), look up whether each local recipient's domain has written
//! to it before.
//!
//! Every stage returns a [`StageOutcome`]; nothing here can fail the mail
//! transaction.

use crate::annotation::{AnnotationOp, AnnotationUpdate, AuthMethod};
use crate::authentication::{AuthVerdict, Authenticator};
use crate::domain_utils::DomainUtils;
use crate::error::KnownSendersError;
use crate::ignore_list::{IgnoreList, IgnoreListHandle};
use crate::store::ReputationClient;
use crate::transaction::{ConnectionInfo, Stage, StageOutcome, StageReport, Transaction};
use std::sync::Arc;

pub struct KnownSenders {
    client: ReputationClient,
    ignore: Arc<IgnoreListHandle>,
}

impl KnownSenders {
    /// Key of this subsystem's record in the transaction results.
    pub const NAME: &'static str = "known-senders";

    pub fn new(client: ReputationClient, ignore: Arc<IgnoreListHandle>) -> Self {
        KnownSenders { client, ignore }
    }

    pub fn client(&self) -> &ReputationClient {
        &self.client
    }

    pub fn ignore_list(&self) -> &IgnoreListHandle {
        &self.ignore
    }

    /// Snapshot to hand to a transaction that is starting now.
    pub fn ignore_snapshot(&self) -> Arc<IgnoreList> {
        self.ignore.snapshot()
    }

    // ---- outbound ----

    /// QUEUE stage: record the remote domains a local sender just wrote to.
    pub async fn update_sender(&self, conn: &ConnectionInfo, txn: &Transaction) -> StageOutcome {
        let outcome = StageOutcome::new(Self::NAME, txn, Stage::Queue);
        if !conn.relaying {
            return outcome;
        }

        let sender_od = match Self::sender_domain(txn) {
            Ok(od) => od,
            Err(e) => {
                log::error!("update_sender: {e}");
                return outcome
                    .with_report(StageReport::Outbound {
                        sender_od: None,
                        rcpt_ods: Vec::new(),
                        counts: Vec::new(),
                    })
                    .with_error(e);
            }
        };

        let ignore = txn.ignore_list();
        let rcpt_ods: Vec<String> = Self::recipient_domains(txn)
            .into_iter()
            .filter(|od| !ignore.contains(od))
            .collect();

        let report = |rcpt_ods: Vec<String>, counts: Vec<u64>| StageReport::Outbound {
            sender_od: Some(sender_od.clone()),
            rcpt_ods,
            counts,
        };

        if ignore.contains(&sender_od) {
            log::debug!("update_sender: {sender_od} is ignored");
            return outcome.with_report(report(rcpt_ods, Vec::new()));
        }

        if rcpt_ods.is_empty() {
            let e = KnownSendersError::MissingContext(format!("no rcpt ODs for {sender_od}"));
            log::error!("update_sender: {e}");
            return outcome.with_report(report(rcpt_ods, Vec::new())).with_error(e);
        }

        match self.client.increment_batch(&sender_od, &rcpt_ods).await {
            Ok(counts) => {
                for (rcpt_od, count) in rcpt_ods.iter().zip(&counts) {
                    log::info!("saved {sender_od} : {rcpt_od} : {count}");
                }
                outcome.with_report(report(rcpt_ods, counts))
            }
            Err(e) => {
                let e = KnownSendersError::from(e);
                log::error!("update_sender: {e}");
                outcome.with_report(report(rcpt_ods, Vec::new())).with_error(e)
            }
        }
    }

    /// Organizational domain of MAIL FROM.
    pub fn sender_domain(txn: &Transaction) -> Result<String, KnownSendersError> {
        let mail_from = txn
            .mail_from
            .as_deref()
            .ok_or_else(|| KnownSendersError::MissingContext("no mail_from".to_string()))?;
        let host = DomainUtils::extract_host(mail_from)
            .ok_or_else(|| KnownSendersError::MissingContext("no sender domain".to_string()))?;
        let sender_od = DomainUtils::organizational_domain(&host)
            .ok_or_else(|| KnownSendersError::ResolutionFailure(host.clone()))?;
        if host != sender_od {
            log::debug!("sender: {host} -> {sender_od}");
        }
        Ok(sender_od)
    }

    /// Distinct organizational domains of RCPT TO, in first-seen order.
    pub fn recipient_domains(txn: &Transaction) -> Vec<String> {
        let mut rcpt_ods: Vec<String> = Vec::new();
        for rcpt in &txn.rcpt_to {
            let Some(host) = DomainUtils::extract_host(rcpt) else {
                continue;
            };
            let Some(rcpt_od) = DomainUtils::organizational_domain(&host) else {
                log::warn!("rcpt: no organizational domain for {host}");
                continue;
            };
            if host != rcpt_od {
                log::debug!("rcpt: {host} -> {rcpt_od}");
            }
            if !rcpt_ods.contains(&rcpt_od) {
                rcpt_ods.push(rcpt_od);
            }
        }
        rcpt_ods
    }

    // ---- inbound ----

    /// MAIL stage: try to verify the claimed sender domain from the envelope.
    pub fn is_authenticated(&self, conn: &ConnectionInfo, txn: &Transaction) -> StageOutcome {
        let outcome = StageOutcome::new(Self::NAME, txn, Stage::Mail);
        if conn.relaying {
            return outcome;
        }

        let sender_od = match Self::sender_domain(txn) {
            Ok(od) => od,
            Err(e) => {
                log::debug!("is_authenticated: {e}");
                return outcome.with_report(StageReport::Sender(None)).with_error(e);
            }
        };

        let annotation = txn.annotation(Self::NAME);
        match Authenticator::early_pass(&sender_od, conn, txn, annotation) {
            AuthVerdict::Matched(update) => {
                let mut outcome = outcome.with_report(StageReport::Sender(Some(sender_od)));
                outcome.ops.push(AnnotationOp::Add(update));
                outcome
            }
            AuthVerdict::AlreadyMatched => {
                let validated = annotation.and_then(|a| a.sender.clone());
                outcome.with_report(StageReport::Sender(validated))
            }
            AuthVerdict::Ignored => {
                log::debug!("is_authenticated: {sender_od} is ignored");
                outcome.with_report(StageReport::Sender(None))
            }
            AuthVerdict::NoMatch => outcome.with_report(StageReport::Sender(None)),
        }
    }

    /// The sender domain verified earlier in this transaction, if any.
    pub fn validated_sender_od(txn: &Transaction) -> Option<&str> {
        txn.annotation(Self::NAME)?.sender.as_deref()
    }

    /// Recipient domains gathered so far, duplicates included.
    pub fn rcpt_ods(txn: &Transaction) -> &[String] {
        txn.annotation(Self::NAME)
            .map(|a| a.rcpt_ods.as_slice())
            .unwrap_or(&[])
    }

    /// RCPT stage, once per accepted local recipient.
    pub async fn check_recipient(
        &self,
        conn: &ConnectionInfo,
        txn: &Transaction,
        rcpt: &str,
    ) -> StageOutcome {
        let mut outcome = StageOutcome::new(Self::NAME, txn, Stage::Rcpt);
        if conn.relaying {
            return outcome;
        }

        let Some(host) = DomainUtils::extract_host(rcpt) else {
            let e = KnownSendersError::MissingContext(format!("rcpt.host unset in {rcpt:?}"));
            log::error!("check_recipient: {e}");
            return outcome.with_error(e);
        };
        let Some(rcpt_od) = DomainUtils::organizational_domain(&host) else {
            let e = KnownSendersError::ResolutionFailure(host);
            log::error!("check_recipient: {e}");
            return outcome.with_error(e);
        };

        outcome.ops.push(AnnotationOp::PushRcptOd(rcpt_od.clone()));

        let sender_od = match Self::validated_sender_od(txn) {
            Some(od) if !txn.ignore_list().contains(od) => od,
            _ => {
                return outcome.with_report(StageReport::Recipient {
                    rcpt_od: Some(rcpt_od),
                    count: None,
                })
            }
        };

        match self.client.query(&rcpt_od, sender_od).await {
            Ok(count) => {
                log::debug!("{rcpt_od} : {sender_od} : {count:?}");
                if let Some(count) = count {
                    outcome
                        .ops
                        .push(AnnotationOp::Add(AnnotationUpdate::hit(&rcpt_od, count)));
                }
                outcome.with_report(StageReport::Recipient {
                    rcpt_od: Some(rcpt_od),
                    count,
                })
            }
            Err(e) => {
                let e = KnownSendersError::from(e);
                log::error!("check_recipient: {e}");
                outcome
                    .with_report(StageReport::Recipient {
                        rcpt_od: Some(rcpt_od),
                        count: None,
                    })
                    .with_error(e)
            }
        }
    }

    /// DATA stage: last chance to verify the sender, via DKIM, and re-check
    /// the recipients gathered at RCPT.
    pub async fn is_dkim_authenticated(
        &self,
        conn: &ConnectionInfo,
        txn: &Transaction,
    ) -> StageOutcome {
        let mut outcome = StageOutcome::new(Self::NAME, txn, Stage::Data);
        if conn.relaying {
            return outcome;
        }

        let sender_od = match Self::sender_domain(txn) {
            Ok(od) => od,
            Err(e) => {
                log::info!("is_dkim_authenticated: {e}");
                return outcome.with_error(e);
            }
        };

        let update = match Authenticator::deferred_pass(&sender_od, txn, txn.annotation(Self::NAME))
        {
            AuthVerdict::Matched(update) => update,
            AuthVerdict::AlreadyMatched => {
                log::debug!("is_dkim_authenticated: already matched");
                return outcome;
            }
            AuthVerdict::Ignored => {
                log::debug!("is_dkim_authenticated: {sender_od} is ignored");
                return outcome;
            }
            AuthVerdict::NoMatch => {
                log::info!("is_dkim_authenticated: no dkim pass for {sender_od}");
                return outcome.with_report(StageReport::Body {
                    auth: None,
                    rcpt_ods: Vec::new(),
                });
            }
        };
        outcome.ops.push(AnnotationOp::Add(update));

        let rcpt_ods = Self::rcpt_ods(txn).to_vec();
        let report = |rcpt_ods: Vec<String>| StageReport::Body {
            auth: Some(AuthMethod::Dkim),
            rcpt_ods,
        };
        if rcpt_ods.is_empty() {
            log::info!("is_dkim_authenticated: no rcpt_ods");
            return outcome.with_report(report(rcpt_ods));
        }

        let pairs: Vec<(String, String)> = rcpt_ods
            .iter()
            .map(|rcpt_od| (rcpt_od.clone(), sender_od.clone()))
            .collect();

        match self.client.query_batch(&pairs).await {
            Ok(replies) => {
                for (rcpt_od, reply) in rcpt_ods.iter().zip(replies) {
                    if let Some(count) = reply {
                        log::debug!("{rcpt_od} : {sender_od} : {count}");
                        outcome.ops.push(AnnotationOp::Add(
                            AnnotationUpdate::hit(rcpt_od, count).emitted(),
                        ));
                    }
                }
                outcome.with_report(report(rcpt_ods))
            }
            Err(e) => {
                let e = KnownSendersError::from(e);
                log::error!("is_dkim_authenticated: {e}");
                outcome.with_report(report(rcpt_ods)).with_error(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FailingStore;
    use crate::store::{MemoryStore, ReputationStore};
    use crate::transaction::{
        DkimVerdict, FcrdnsVerdict, Session, SpfResult, SpfScope, SpfVerdict,
    };
    use std::time::Duration;

    const NAME: &str = KnownSenders::NAME;

    fn plugin_with(store: Arc<dyn ReputationStore>, ignored: &[&str]) -> KnownSenders {
        let ignore = IgnoreList::new(ignored.iter().copied()).unwrap();
        KnownSenders::new(
            ReputationClient::new(store, Duration::from_millis(200)),
            Arc::new(IgnoreListHandle::new(ignore)),
        )
    }

    fn inbound(fcrdns: Option<&str>) -> Session {
        Session::new(ConnectionInfo {
            relaying: false,
            fcrdns: fcrdns.map(FcrdnsVerdict::new),
            ..Default::default()
        })
    }

    fn outbound() -> Session {
        Session::new(ConnectionInfo {
            relaying: true,
            ..Default::default()
        })
    }

    fn mail(plugin: &KnownSenders, session: &mut Session, mail_from: &str) -> StageReport {
        session.begin_transaction(Some(mail_from), plugin.ignore_snapshot());
        let txn = session.transaction().unwrap();
        let outcome = plugin.is_authenticated(&session.connection, txn);
        let report = outcome.report.clone();
        assert!(session.apply(outcome));
        report
    }

    async fn rcpt(plugin: &KnownSenders, session: &mut Session, rcpt: &str) -> StageReport {
        session.transaction_mut().unwrap().rcpt_to.push(rcpt.to_string());
        let outcome = plugin
            .check_recipient(&session.connection, session.transaction().unwrap(), rcpt)
            .await;
        let report = outcome.report.clone();
        session.apply(outcome);
        report
    }

    // ---- MAIL stage ----

    #[tokio::test]
    async fn test_no_auth_found() {
        let plugin = plugin_with(Arc::new(MemoryStore::new()), &[]);
        let mut session = inbound(None);

        let report = mail(&plugin, &mut session, "<johndoe@test.com>");
        assert_eq!(report, StageReport::Sender(None));
        assert_eq!(KnownSenders::validated_sender_od(session.transaction().unwrap()), None);
    }

    #[tokio::test]
    async fn test_fcrdns_match_is_recorded() {
        let plugin = plugin_with(Arc::new(MemoryStore::new()), &[]);
        let mut session = inbound(Some("validated-test.com"));

        mail(&plugin, &mut session, "<johndoe@validated-test.com>");

        let annotation = session.transaction().unwrap().annotation(NAME).unwrap();
        assert_eq!(annotation.sender.as_deref(), Some("validated-test.com"));
        assert_eq!(annotation.auth, Some(AuthMethod::Fcrdns));
        assert!(annotation.emit);
    }

    #[tokio::test]
    async fn test_spf_mfrom_match_is_recorded() {
        let plugin = plugin_with(Arc::new(MemoryStore::new()), &[]);
        let mut session = inbound(None);
        session.begin_transaction(Some("<johndoe@spf-mfrom.com>"), plugin.ignore_snapshot());
        session.transaction_mut().unwrap().spf_mfrom = Some(SpfVerdict::new(
            SpfScope::Mfrom,
            SpfResult::Pass,
            "spf-mfrom.com",
        ));

        let outcome = plugin.is_authenticated(&session.connection, session.transaction().unwrap());
        assert_eq!(
            outcome.report,
            StageReport::Sender(Some("spf-mfrom.com".to_string()))
        );
        assert!(session.apply(outcome));

        let annotation = session.transaction().unwrap().annotation(NAME).unwrap();
        assert_eq!(annotation.sender.as_deref(), Some("spf-mfrom.com"));
        assert_eq!(annotation.auth, Some(AuthMethod::Spf));
    }

    #[tokio::test]
    async fn test_relaying_skips_authentication() {
        let plugin = plugin_with(Arc::new(MemoryStore::new()), &[]);
        let mut session = outbound();
        session.connection.fcrdns = Some(FcrdnsVerdict::new("mx.example.com"));

        mail(&plugin, &mut session, "<user@example.com>");
        assert!(session.transaction().unwrap().annotation(NAME).is_none());
    }

    #[tokio::test]
    async fn test_null_sender_is_missing_context() {
        let plugin = plugin_with(Arc::new(MemoryStore::new()), &[]);
        let mut session = inbound(Some("mx.example.com"));
        session.begin_transaction(Some("<>"), plugin.ignore_snapshot());

        let outcome = plugin.is_authenticated(&session.connection, session.transaction().unwrap());
        assert!(matches!(
            outcome.error,
            Some(KnownSendersError::MissingContext(_))
        ));
        assert!(outcome.ops.is_empty());
    }

    // ---- RCPT stage ----

    #[tokio::test]
    async fn test_recipient_reduced_to_od() {
        let plugin = plugin_with(Arc::new(MemoryStore::new()), &[]);
        let mut session = inbound(None);
        mail(&plugin, &mut session, "<johndoe@test.com>");

        let report = rcpt(&plugin, &mut session, "<user@host.example.com>").await;
        assert_eq!(
            report,
            StageReport::Recipient {
                rcpt_od: Some("example.com".to_string()),
                count: None
            }
        );
        assert_eq!(
            KnownSenders::rcpt_ods(session.transaction().unwrap()),
            ["example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_recipient_ods_keep_duplicates() {
        let plugin = plugin_with(Arc::new(MemoryStore::new()), &[]);
        let mut session = inbound(None);
        mail(&plugin, &mut session, "<johndoe@test.com>");

        rcpt(&plugin, &mut session, "<a@example.com>").await;
        rcpt(&plugin, &mut session, "<b@mail.example.com>").await;

        assert_eq!(
            KnownSenders::rcpt_ods(session.transaction().unwrap()),
            ["example.com".to_string(), "example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_known_correspondent_is_recorded() {
        let store = Arc::new(MemoryStore::new());
        store.seed("rcpt.com", "sender.com", 5).await;
        let plugin = plugin_with(store.clone(), &[]);
        let mut session = inbound(Some("mail.sender.com"));
        mail(&plugin, &mut session, "<someone@sender.com>");

        let report = rcpt(&plugin, &mut session, "<me@rcpt.com>").await;
        assert_eq!(
            report,
            StageReport::Recipient {
                rcpt_od: Some("rcpt.com".to_string()),
                count: Some(5)
            }
        );

        let annotation = session.transaction().unwrap().annotation(NAME).unwrap();
        assert_eq!(annotation.pass, vec!["rcpt.com"]);
        assert_eq!(annotation.count, vec![5]);
    }

    #[tokio::test]
    async fn test_unvalidated_sender_skips_store() {
        let store = Arc::new(MemoryStore::new());
        store.seed("rcpt.com", "sender.com", 5).await;
        let plugin = plugin_with(store.clone(), &[]);
        let mut session = inbound(None);
        mail(&plugin, &mut session, "<someone@sender.com>");

        rcpt(&plugin, &mut session, "<me@rcpt.com>").await;
        assert_eq!(store.round_trips(), 0);
        assert!(session.transaction().unwrap().annotation(NAME).unwrap().pass.is_empty());
    }

    #[tokio::test]
    async fn test_recipient_store_failure_is_not_fatal() {
        let plugin = plugin_with(Arc::new(FailingStore), &[]);
        let mut session = inbound(Some("mail.sender.com"));
        mail(&plugin, &mut session, "<someone@sender.com>");

        session.transaction_mut().unwrap().rcpt_to.push("<me@rcpt.com>".to_string());
        let outcome = plugin
            .check_recipient(&session.connection, session.transaction().unwrap(), "<me@rcpt.com>")
            .await;
        assert!(matches!(
            outcome.error,
            Some(KnownSendersError::StoreFailure(_))
        ));
        assert!(session.apply(outcome));

        let annotation = session.transaction().unwrap().annotation(NAME).unwrap();
        assert_eq!(annotation.rcpt_ods, vec!["rcpt.com"]);
        assert!(annotation.pass.is_empty());
    }

    #[tokio::test]
    async fn test_recipient_without_host() {
        let plugin = plugin_with(Arc::new(MemoryStore::new()), &[]);
        let mut session = inbound(None);
        mail(&plugin, &mut session, "<johndoe@test.com>");

        let outcome = plugin
            .check_recipient(&session.connection, session.transaction().unwrap(), "<postmaster>")
            .await;
        assert!(matches!(
            outcome.error,
            Some(KnownSendersError::MissingContext(_))
        ));
        assert!(outcome.ops.is_empty());
    }

    // ---- QUEUE stage ----

    #[test]
    fn test_sender_domain() {
        for (mail_from, expected) in [
            ("<user@example.com>", "example.com"),
            ("<user@mail.example.com>", "example.com"),
            ("<user@anything.bbc.co.uk>", "bbc.co.uk"),
        ] {
            let txn = Transaction::new(1, Some(mail_from), Arc::default());
            assert_eq!(KnownSenders::sender_domain(&txn).unwrap(), expected);
        }
    }

    #[test]
    fn test_recipient_domains_are_unique_in_order() {
        let mut txn = Transaction::new(1, Some("<u@example.com>"), Arc::default());
        txn.rcpt_to = vec![
            "<user1@example2.com>".to_string(),
            "<user@example1.com>".to_string(),
            "<user2@mail.example2.com>".to_string(),
            "<>".to_string(),
        ];
        assert_eq!(
            KnownSenders::recipient_domains(&txn),
            vec!["example2.com", "example1.com"]
        );
    }

    #[tokio::test]
    async fn test_update_sender_increments_each_domain_once() {
        let store = Arc::new(MemoryStore::new());
        let plugin = plugin_with(store.clone(), &[]);
        let mut session = outbound();
        session.begin_transaction(Some("<johndoe@example.com>"), plugin.ignore_snapshot());
        session.transaction_mut().unwrap().rcpt_to = vec![
            "<a@test1.com>".to_string(),
            "<b@test1.com>".to_string(),
            "<c@test2.com>".to_string(),
        ];

        let outcome = plugin
            .update_sender(&session.connection, session.transaction().unwrap())
            .await;

        assert_eq!(
            outcome.report,
            StageReport::Outbound {
                sender_od: Some("example.com".to_string()),
                rcpt_ods: vec!["test1.com".to_string(), "test2.com".to_string()],
                counts: vec![1, 1],
            }
        );
        assert!(outcome.error.is_none());
        assert_eq!(store.get("example.com", "test1.com").await, Some(1));
        assert_eq!(store.get("example.com", "test2.com").await, Some(1));
        assert_eq!(store.round_trips(), 1);
        assert!(session.apply(outcome));
    }

    #[tokio::test]
    async fn test_update_sender_without_recipients() {
        let store = Arc::new(MemoryStore::new());
        let plugin = plugin_with(store.clone(), &[]);
        let mut session = outbound();
        session.begin_transaction(Some("<johndoe@example.com>"), plugin.ignore_snapshot());

        let outcome = plugin
            .update_sender(&session.connection, session.transaction().unwrap())
            .await;
        assert_eq!(
            outcome.report,
            StageReport::Outbound {
                sender_od: Some("example.com".to_string()),
                rcpt_ods: Vec::new(),
                counts: Vec::new(),
            }
        );
        assert!(outcome.error.is_some());
        assert_eq!(store.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_update_sender_ignored_sender_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let plugin = plugin_with(store.clone(), &["example.com"]);
        let mut session = outbound();
        session.begin_transaction(Some("<johndoe@example.com>"), plugin.ignore_snapshot());
        session.transaction_mut().unwrap().rcpt_to = vec!["<a@test1.com>".to_string()];

        let outcome = plugin
            .update_sender(&session.connection, session.transaction().unwrap())
            .await;
        assert!(outcome.error.is_none());
        assert_eq!(store.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_update_sender_skips_ignored_recipient_domains() {
        let store = Arc::new(MemoryStore::new());
        let plugin = plugin_with(store.clone(), &["gmail.com"]);
        let mut session = outbound();
        session.begin_transaction(Some("<johndoe@example.com>"), plugin.ignore_snapshot());
        session.transaction_mut().unwrap().rcpt_to =
            vec!["<a@gmail.com>".to_string(), "<b@test1.com>".to_string()];

        plugin
            .update_sender(&session.connection, session.transaction().unwrap())
            .await;
        assert_eq!(store.get("example.com", "gmail.com").await, None);
        assert_eq!(store.get("example.com", "test1.com").await, Some(1));
    }

    #[tokio::test]
    async fn test_update_sender_only_for_relaying() {
        let store = Arc::new(MemoryStore::new());
        let plugin = plugin_with(store.clone(), &[]);
        let mut session = inbound(None);
        session.begin_transaction(Some("<johndoe@example.com>"), plugin.ignore_snapshot());
        session.transaction_mut().unwrap().rcpt_to = vec!["<a@test1.com>".to_string()];

        let outcome = plugin
            .update_sender(&session.connection, session.transaction().unwrap())
            .await;
        assert_eq!(outcome.report, StageReport::Skipped);
        assert_eq!(store.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_update_sender_store_failure_is_not_fatal() {
        let plugin = plugin_with(Arc::new(FailingStore), &[]);
        let mut session = outbound();
        session.begin_transaction(Some("<johndoe@example.com>"), plugin.ignore_snapshot());
        session.transaction_mut().unwrap().rcpt_to = vec!["<a@test1.com>".to_string()];

        let outcome = plugin
            .update_sender(&session.connection, session.transaction().unwrap())
            .await;
        assert!(matches!(
            outcome.error,
            Some(KnownSendersError::StoreFailure(_))
        ));
        assert!(session.apply(outcome));
    }

    // ---- DATA stage ----

    async fn dkim_session(plugin: &KnownSenders, dkim_pass: &[&str]) -> Session {
        let mut session = inbound(None);
        mail(plugin, &mut session, "<someone@sender.com>");
        rcpt(plugin, &mut session, "<me@rcpt.com>").await;
        rcpt(plugin, &mut session, "<you@other.com>").await;
        session.transaction_mut().unwrap().dkim = Some(DkimVerdict {
            pass: dkim_pass.iter().map(|d| d.to_string()).collect(),
        });
        session
    }

    #[tokio::test]
    async fn test_dkim_fallback_rechecks_recipients() {
        let store = Arc::new(MemoryStore::new());
        store.seed("rcpt.com", "sender.com", 3).await;
        let plugin = plugin_with(store.clone(), &[]);
        let mut session = dkim_session(&plugin, &["sender.com"]).await;
        assert_eq!(store.round_trips(), 0);

        let outcome = plugin
            .is_dkim_authenticated(&session.connection, session.transaction().unwrap())
            .await;
        assert_eq!(
            outcome.report,
            StageReport::Body {
                auth: Some(AuthMethod::Dkim),
                rcpt_ods: vec!["rcpt.com".to_string(), "other.com".to_string()],
            }
        );
        assert!(session.apply(outcome));
        assert_eq!(store.round_trips(), 1);

        let annotation = session.transaction().unwrap().annotation(NAME).unwrap();
        assert_eq!(annotation.sender.as_deref(), Some("sender.com"));
        assert_eq!(annotation.auth, Some(AuthMethod::Dkim));
        assert_eq!(annotation.pass, vec!["rcpt.com"]);
        assert_eq!(annotation.count, vec![3]);
    }

    #[tokio::test]
    async fn test_dkim_for_other_domain_does_not_match() {
        let store = Arc::new(MemoryStore::new());
        let plugin = plugin_with(store.clone(), &[]);
        let session = dkim_session(&plugin, &["esp.net"]).await;

        let outcome = plugin
            .is_dkim_authenticated(&session.connection, session.transaction().unwrap())
            .await;
        assert!(outcome.ops.is_empty());
        assert_eq!(store.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_dkim_does_not_overwrite_earlier_provenance() {
        let store = Arc::new(MemoryStore::new());
        let plugin = plugin_with(store.clone(), &[]);
        let mut session = inbound(Some("mx.sender.com"));
        mail(&plugin, &mut session, "<someone@sender.com>");
        rcpt(&plugin, &mut session, "<me@rcpt.com>").await;
        session.transaction_mut().unwrap().dkim = Some(DkimVerdict {
            pass: vec!["sender.com".to_string()],
        });

        let outcome = plugin
            .is_dkim_authenticated(&session.connection, session.transaction().unwrap())
            .await;
        assert_eq!(outcome.report, StageReport::Skipped);
        assert!(session.apply(outcome));

        let annotation = session.transaction().unwrap().annotation(NAME).unwrap();
        assert_eq!(annotation.auth, Some(AuthMethod::Fcrdns));
    }

    #[tokio::test]
    async fn test_dkim_skipped_when_already_matched() {
        let store = Arc::new(MemoryStore::new());
        store.seed("rcpt.com", "sender.com", 2).await;
        let plugin = plugin_with(store.clone(), &[]);
        let mut session = inbound(Some("mx.sender.com"));
        mail(&plugin, &mut session, "<someone@sender.com>");
        rcpt(&plugin, &mut session, "<me@rcpt.com>").await;
        let trips = store.round_trips();

        let outcome = plugin
            .is_dkim_authenticated(&session.connection, session.transaction().unwrap())
            .await;
        assert!(outcome.ops.is_empty());
        assert_eq!(store.round_trips(), trips);
    }

    #[tokio::test]
    async fn test_dkim_store_failure_keeps_provenance() {
        let plugin = plugin_with(Arc::new(FailingStore), &[]);
        let mut session = dkim_session(&plugin, &["sender.com"]).await;

        let outcome = plugin
            .is_dkim_authenticated(&session.connection, session.transaction().unwrap())
            .await;
        assert!(matches!(
            outcome.error,
            Some(KnownSendersError::StoreFailure(_))
        ));
        assert!(session.apply(outcome));

        let annotation = session.transaction().unwrap().annotation(NAME).unwrap();
        assert_eq!(annotation.auth, Some(AuthMethod::Dkim));
        assert!(annotation.pass.is_empty());
    }

    // ---- ignore list ----

    #[tokio::test]
    async fn test_ignored_sender_suppresses_everything() {
        let store = Arc::new(MemoryStore::new());
        store.seed("rcpt.com", "gmail.com", 9).await;
        let plugin = plugin_with(store.clone(), &["gmail.com"]);
        let mut session = dkim_session_for(&plugin, "<someone@gmail.com>", Some("mail-ot1.gmail.com")).await;
        session.transaction_mut().unwrap().dkim = Some(DkimVerdict {
            pass: vec!["gmail.com".to_string()],
        });

        let outcome = plugin
            .is_dkim_authenticated(&session.connection, session.transaction().unwrap())
            .await;
        assert!(session.apply(outcome));

        let annotation = session.transaction().unwrap().annotation(NAME).unwrap();
        assert_eq!(annotation.sender, None);
        assert_eq!(annotation.auth, None);
        assert!(annotation.pass.is_empty());
        assert_eq!(store.round_trips(), 0);
    }

    async fn dkim_session_for(
        plugin: &KnownSenders,
        mail_from: &str,
        fcrdns: Option<&str>,
    ) -> Session {
        let mut session = inbound(fcrdns);
        mail(plugin, &mut session, mail_from);
        rcpt(plugin, &mut session, "<me@rcpt.com>").await;
        session
    }

    #[tokio::test]
    async fn test_reload_applies_to_new_transactions_only() {
        let plugin = plugin_with(Arc::new(MemoryStore::new()), &[]);
        let mut session = inbound(Some("mx.example.com"));
        session.begin_transaction(Some("<u@example.com>"), plugin.ignore_snapshot());

        plugin
            .ignore_list()
            .replace(IgnoreList::new(["example.com"]).unwrap());

        let outcome = plugin.is_authenticated(&session.connection, session.transaction().unwrap());
        assert_eq!(
            outcome.report,
            StageReport::Sender(Some("example.com".to_string()))
        );

        session.begin_transaction(Some("<u@example.com>"), plugin.ignore_snapshot());
        let outcome = plugin.is_authenticated(&session.connection, session.transaction().unwrap());
        assert_eq!(outcome.report, StageReport::Sender(None));
    }

    // ---- cancellation ----

    #[tokio::test]
    async fn test_late_recipient_result_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.seed("rcpt.com", "sender.com", 5).await;
        let plugin = plugin_with(store.clone(), &[]);
        let mut session = inbound(Some("mail.sender.com"));
        mail(&plugin, &mut session, "<someone@sender.com>");

        let outcome = plugin
            .check_recipient(&session.connection, session.transaction().unwrap(), "<me@rcpt.com>")
            .await;
        session.end_transaction();

        assert!(!session.apply(outcome));
        assert!(session.transaction().is_none());
    }
}
