//! Packet classifiers.
//!
//! A classifier chain is an ordered list of filters attached to a class.
//! During classification each filter is offered the packet; the first match
//! wins and yields a class id plus a verdict. A class id with a zero major
//! part is not a direct reference: it indexes the split node's default map.

use rill_abi::Ucred;

use crate::pkt::Pkt;

/// What a matching filter decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClsVerdict {
    /// Deliver to the named class.
    Ok,
    /// Policing wants the packet reclassified from the ancestors' defaults.
    Reclassify,
    /// Policing wants the packet dropped.
    Shot,
}

/// Outcome of a classifier match.
#[derive(Clone, Copy, Debug)]
pub struct ClsResult {
    /// Target class handle; a zero major part selects via the defmap.
    pub classid: u32,
    pub verdict: ClsVerdict,
}

/// A packet filter.
pub trait Classifier: Send {
    /// `None` means no match; the chain continues.
    fn classify(&self, pkt: &Pkt) -> Option<ClsResult>;

    /// The class this filter's verdict names, if it names one directly.
    /// Used to keep the class alive while the filter references it.
    fn bound_classid(&self) -> Option<u32> {
        None
    }
}

/// A concrete filter matching on protocol and/or priority.
///
/// Every present field must match for the filter to fire. This is the
/// workhorse filter for embedders that do not bring their own.
pub struct MatchClassifier {
    pub protocol: Option<u16>,
    pub priority: Option<u32>,
    /// Reserved for credential-based match rules on local traffic.
    pub creds: Option<Ucred>,
    pub classid: u32,
    pub verdict: ClsVerdict,
}

impl MatchClassifier {
    /// Filter sending every packet of `protocol` to `classid`.
    pub fn by_protocol(protocol: u16, classid: u32) -> Self {
        Self {
            protocol: Some(protocol),
            priority: None,
            creds: None,
            classid,
            verdict: ClsVerdict::Ok,
        }
    }

    /// Filter sending every packet of logical priority `priority` to
    /// `classid`.
    pub fn by_priority(priority: u32, classid: u32) -> Self {
        Self {
            protocol: None,
            priority: Some(priority),
            creds: None,
            classid,
            verdict: ClsVerdict::Ok,
        }
    }

    /// Same match rule, different verdict.
    pub fn with_verdict(mut self, verdict: ClsVerdict) -> Self {
        self.verdict = verdict;
        self
    }
}

impl Classifier for MatchClassifier {
    fn classify(&self, pkt: &Pkt) -> Option<ClsResult> {
        if let Some(proto) = self.protocol
            && pkt.protocol != proto
        {
            return None;
        }
        if let Some(prio) = self.priority
            && pkt.priority != prio
        {
            return None;
        }
        Some(ClsResult { classid: self.classid, verdict: self.verdict })
    }

    fn bound_classid(&self) -> Option<u32> {
        (crate::types::th_major(self.classid) != 0).then_some(self.classid)
    }
}
