//! Per-transaction result registry.
//!
//! Each subsystem owns one record per transaction, keyed by its name. The
//! pipeline stages communicate through the record: the MAIL stage writes the
//! validated sender, RCPT appends recipient domains, and the post-body stage
//! reads both back.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Fcrdns,
    Spf,
    Dkim,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMethod::Fcrdns => "fcrdns",
            AuthMethod::Spf => "spf",
            AuthMethod::Dkim => "dkim",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionAnnotation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthMethod>,
    pub rcpt_ods: Vec<String>,
    pub pass: Vec<String>,
    pub count: Vec<u64>,
    pub emit: bool,
}

impl TransactionAnnotation {
    /// A recipient already matched a known correspondent of the sender.
    pub fn already_matched(&self) -> bool {
        !self.pass.is_empty()
    }

    /// Render for the annotation header, e.g.
    /// `sender=example.com; auth=fcrdns; pass=rcpt.com:5`.
    pub fn header_value(&self) -> Option<String> {
        let sender = self.sender.as_ref()?;
        let mut value = format!("sender={sender}");
        if let Some(auth) = self.auth {
            value.push_str(&format!("; auth={auth}"));
        }
        if !self.pass.is_empty() {
            let pairs: Vec<String> = self
                .pass
                .iter()
                .zip(&self.count)
                .map(|(od, count)| format!("{od}:{count}"))
                .collect();
            value.push_str(&format!("; pass={}", pairs.join(",")));
        }
        Some(value)
    }
}

/// Shallow merge into a record. Scalars overwrite, `pass` and `count` append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationUpdate {
    pub sender: Option<String>,
    pub auth: Option<AuthMethod>,
    pub pass: Option<String>,
    pub count: Option<u64>,
    pub emit: Option<bool>,
}

impl AnnotationUpdate {
    pub fn sender(od: &str, auth: AuthMethod) -> Self {
        AnnotationUpdate {
            sender: Some(od.to_string()),
            auth: Some(auth),
            ..Default::default()
        }
    }

    pub fn hit(rcpt_od: &str, count: u64) -> Self {
        AnnotationUpdate {
            pass: Some(rcpt_od.to_string()),
            count: Some(count),
            ..Default::default()
        }
    }

    pub fn emitted(mut self) -> Self {
        self.emit = Some(true);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationOp {
    Add(AnnotationUpdate),
    PushRcptOd(String),
}

#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    records: HashMap<String, TransactionAnnotation>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&TransactionAnnotation> {
        self.records.get(name)
    }

    pub fn add(&mut self, name: &str, update: AnnotationUpdate) {
        let record = self.records.entry(name.to_string()).or_default();
        if let Some(sender) = update.sender {
            record.sender = Some(sender);
        }
        if let Some(auth) = update.auth {
            record.auth = Some(auth);
        }
        if let Some(pass) = update.pass {
            record.pass.push(pass);
        }
        if let Some(count) = update.count {
            record.count.push(count);
        }
        if let Some(emit) = update.emit {
            record.emit = emit;
        }
    }

    /// Append to `rcpt_ods`, creating the record if absent. Duplicates are kept.
    pub fn push_rcpt_od(&mut self, name: &str, od: &str) {
        self.records
            .entry(name.to_string())
            .or_default()
            .rcpt_ods
            .push(od.to_string());
    }

    pub fn apply(&mut self, name: &str, op: AnnotationOp) {
        match op {
            AnnotationOp::Add(update) => self.add(name, update),
            AnnotationOp::PushRcptOd(od) => self.push_rcpt_od(name, &od),
        }
    }
}
