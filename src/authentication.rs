//! Sender authentication aggregator.
//!
//! Decides whether the organizational domain claimed in MAIL FROM is backed
//! by an independent verification: FCrDNS, then SPF (HELO before MAIL FROM)
//! while the envelope is being received, and DKIM once the body is in.

use crate::annotation::{AnnotationUpdate, AuthMethod, TransactionAnnotation};
use crate::domain_utils::DomainUtils;
use crate::transaction::{
    ConnectionInfo, DkimVerdict, SpfResult, SpfScope, SpfVerdict, Transaction,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    /// The claim is verified; merge this into the annotation.
    Matched(AnnotationUpdate),
    NoMatch,
    /// The claimed domain is on the ignore list. Nothing may be recorded.
    Ignored,
    /// A provenance is already recorded for this transaction.
    AlreadyMatched,
}

pub struct Authenticator;

impl Authenticator {
    /// Envelope-time check: FCrDNS first, then SPF. The first match wins.
    pub fn early_pass(
        claimed_od: &str,
        connection: &ConnectionInfo,
        txn: &Transaction,
        annotation: Option<&TransactionAnnotation>,
    ) -> AuthVerdict {
        if txn.ignore_list().contains(claimed_od) {
            return AuthVerdict::Ignored;
        }
        if Self::has_provenance(annotation) {
            return AuthVerdict::AlreadyMatched;
        }

        if Self::has_fcrdns_match(claimed_od, connection) {
            log::debug!("+fcrdns: {claimed_od}");
            return AuthVerdict::Matched(
                AnnotationUpdate::sender(claimed_od, AuthMethod::Fcrdns).emitted(),
            );
        }

        let spf_verdicts = [
            Self::scoped(connection.spf_helo.as_ref(), SpfScope::Helo),
            Self::scoped(txn.spf_mfrom.as_ref(), SpfScope::Mfrom),
        ];
        if spf_verdicts
            .into_iter()
            .any(|verdict| Self::has_spf_match(claimed_od, verdict))
        {
            log::debug!("+spf: {claimed_od}");
            return AuthVerdict::Matched(
                AnnotationUpdate::sender(claimed_od, AuthMethod::Spf).emitted(),
            );
        }

        AuthVerdict::NoMatch
    }

    /// Post-body fallback on DKIM, for senders the envelope could not prove.
    pub fn deferred_pass(
        claimed_od: &str,
        txn: &Transaction,
        annotation: Option<&TransactionAnnotation>,
    ) -> AuthVerdict {
        if txn.ignore_list().contains(claimed_od) {
            return AuthVerdict::Ignored;
        }
        if annotation.is_some_and(TransactionAnnotation::already_matched)
            || Self::has_provenance(annotation)
        {
            return AuthVerdict::AlreadyMatched;
        }

        if Self::has_dkim_match(claimed_od, txn.dkim.as_ref()) {
            log::debug!("+dkim: {claimed_od}");
            return AuthVerdict::Matched(AnnotationUpdate::sender(claimed_od, AuthMethod::Dkim));
        }

        AuthVerdict::NoMatch
    }

    pub fn has_fcrdns_match(claimed_od: &str, connection: &ConnectionInfo) -> bool {
        let Some(ptr_hostname) = connection.fcrdns.as_ref().and_then(|v| v.primary()) else {
            return false;
        };
        log::debug!("fcrdns: {ptr_hostname}");
        Self::reduces_to(ptr_hostname, claimed_od)
    }

    pub fn has_spf_match(claimed_od: &str, verdict: Option<&SpfVerdict>) -> bool {
        match verdict {
            Some(spf) if spf.result == SpfResult::Pass && !spf.domain.is_empty() => {
                Self::reduces_to(&spf.domain, claimed_od)
            }
            _ => false,
        }
    }

    pub fn has_dkim_match(claimed_od: &str, verdict: Option<&DkimVerdict>) -> bool {
        verdict.is_some_and(|dkim| {
            dkim.pass
                .iter()
                .any(|signing_domain| Self::reduces_to(signing_domain, claimed_od))
        })
    }

    /// A verdict filed under the wrong identity is not evidence for this one.
    fn scoped(verdict: Option<&SpfVerdict>, scope: SpfScope) -> Option<&SpfVerdict> {
        match verdict {
            Some(spf) if spf.scope == scope => Some(spf),
            Some(spf) => {
                log::warn!("spf: {:?} verdict supplied as {scope:?}, ignoring", spf.scope);
                None
            }
            None => None,
        }
    }

    fn has_provenance(annotation: Option<&TransactionAnnotation>) -> bool {
        annotation.is_some_and(|a| a.auth.is_some() || a.sender.is_some())
    }

    fn reduces_to(hostname: &str, od: &str) -> bool {
        DomainUtils::organizational_domain(hostname).as_deref() == Some(od)
    }
}
