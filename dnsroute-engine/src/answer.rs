//! Answer processing
//!
//! Turns the A records of an upstream response into address map entries,
//! address-set additions and audit rows.
//!
//! Attribution rules:
//! - Answer section: the address is recorded for the queried name and, if
//!   different, for the record's owner. It goes to the query's class set
//!   and to the owner's class set when those are proxied.
//! - Authority and additional sections: recorded for the owner only and
//!   added to the owner's class set, whatever the query's class.
//! - AAAA records are counted and ignored. CNAME targets are only logged.
//!
//! Each (set, address) pair is added at most once per response. A failed
//! add skips the save signal for that address and nothing else.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record};

use crate::addr_map::AddressMap;
use crate::audit::AuditSink;
use crate::patterns::{PatternStore, Route};
use crate::persist::{PersistHandle, SaveKind};
use dnsroute_dns::normalize;
use dnsroute_ipset::AddressSet;

/// What processing one response did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnswerSummary {
    /// Answer-section IPv4 addresses, in order, without repeats
    pub answer_addrs: Vec<Ipv4Addr>,
    /// New (domain, address) map entries
    pub map_inserts: usize,
    /// Successful set additions
    pub set_adds: Vec<(String, Ipv4Addr)>,
    /// Set additions that failed
    pub failed_adds: usize,
    /// AAAA records seen in any section
    pub ipv6_seen: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Answer,
    Other,
}

/// Applies a response's records to the shared state
pub struct AnswerProcessor {
    patterns: Arc<PatternStore>,
    map: Arc<AddressMap>,
    sets: Arc<dyn AddressSet>,
    set_names: Vec<String>,
    persist: PersistHandle,
    audit: Arc<dyn AuditSink>,
}

impl AnswerProcessor {
    /// `set_names[i]` is the address set of class `i`
    pub fn new(
        patterns: Arc<PatternStore>,
        map: Arc<AddressMap>,
        sets: Arc<dyn AddressSet>,
        set_names: Vec<String>,
        persist: PersistHandle,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            patterns,
            map,
            sets,
            set_names,
            persist,
            audit,
        }
    }

    /// Process `response` to a query for `qname` that was routed by `route`
    pub async fn process(&self, qname: &str, route: Route, response: &Message) -> AnswerSummary {
        let qname = dnsroute_dns::normalize_name(qname);
        let mut summary = AnswerSummary::default();
        let mut added: BTreeSet<(usize, Ipv4Addr)> = BTreeSet::new();

        let sections = [
            (Section::Answer, response.answers()),
            (Section::Other, response.name_servers()),
            (Section::Other, response.additionals()),
        ];

        for (section, records) in sections {
            for record in records {
                self.process_record(&qname, route, section, record, &mut summary, &mut added)
                    .await;
            }
        }

        if !summary.answer_addrs.is_empty() {
            let addrs: Vec<String> = summary.answer_addrs.iter().map(|a| a.to_string()).collect();
            self.audit.record(&qname, &addrs, route.is_proxied());
        }

        summary
    }

    async fn process_record(
        &self,
        qname: &str,
        route: Route,
        section: Section,
        record: &Record,
        summary: &mut AnswerSummary,
        added: &mut BTreeSet<(usize, Ipv4Addr)>,
    ) {
        let owner = normalize(record.name());

        match record.data() {
            RData::A(a) => {
                let addr = a.0;
                log::debug!("A record {} -> {}", owner, addr);

                let owner_route = self.patterns.classify(&owner);
                let mut targets: Vec<Route> = vec![owner_route];

                if section == Section::Answer {
                    if !summary.answer_addrs.contains(&addr) {
                        summary.answer_addrs.push(addr);
                    }
                    self.record_address(qname, addr, summary);
                    targets.push(route);
                }
                if owner != qname || section == Section::Other {
                    self.record_address(&owner, addr, summary);
                }

                for target in targets {
                    if let Some(index) = target.class_index() {
                        if added.insert((index, addr)) {
                            self.add_to_set(index, addr, summary).await;
                        }
                    }
                }
            }
            RData::AAAA(aaaa) => {
                log::debug!("Ignoring AAAA record {} -> {}", owner, aaaa.0);
                summary.ipv6_seen += 1;
            }
            RData::CNAME(cname) => {
                let target = normalize(&cname.0);
                if let Some((index, pattern)) = self.patterns.matching_pattern(&target) {
                    log::debug!(
                        "CNAME {} -> {} matches pattern '{}' of class {}",
                        owner,
                        target,
                        pattern,
                        self.patterns.class_name(Route::Proxied(index))
                    );
                }
            }
            _ => {}
        }
    }

    fn record_address(&self, domain: &str, addr: Ipv4Addr, summary: &mut AnswerSummary) {
        if self.map.insert(domain, &addr.to_string()) {
            log::debug!("Recorded {} for {}", addr, domain);
            summary.map_inserts += 1;
            self.persist.signal(SaveKind::AddressMap);
        }
    }

    async fn add_to_set(&self, index: usize, addr: Ipv4Addr, summary: &mut AnswerSummary) {
        let Some(set) = self.set_names.get(index) else {
            return;
        };

        match self.sets.add(set, IpAddr::V4(addr)).await {
            Ok(()) => {
                log::debug!("Added {} to ipset {}", addr, set);
                summary.set_adds.push((set.clone(), addr));
                self.persist.signal(SaveKind::AddressSet);
            }
            Err(e) => {
                log::warn!("Failed to add {} to ipset {}: {}", addr, set, e);
                summary.failed_adds += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoAudit;
    use crate::config::ClassConfig;
    use dnsroute_ipset::mock::MemoryAddressSet;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{Name, RecordType};
    use std::net::Ipv6Addr;
    use std::path::PathBuf;
    use std::str::FromStr;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CapturingAudit {
        rows: Mutex<Vec<(String, Vec<String>, bool)>>,
    }

    impl AuditSink for CapturingAudit {
        fn record(&self, domain: &str, addrs: &[String], proxied: bool) {
            self.rows
                .lock()
                .unwrap()
                .push((domain.to_string(), addrs.to_vec(), proxied));
        }
    }

    struct Fixture {
        processor: AnswerProcessor,
        map: Arc<AddressMap>,
        sets: Arc<MemoryAddressSet>,
        signals: mpsc::Receiver<SaveKind>,
        audit: Arc<CapturingAudit>,
    }

    fn fixture(lists: &[&[&str]]) -> Fixture {
        let classes: Vec<ClassConfig> = (0..lists.len())
            .map(|i| ClassConfig {
                name: format!("class{}", i),
                patterns: PathBuf::from("/nonexistent"),
                upstream: "10.0.0.1".to_string(),
                ipset: format!("class{}-set", i),
            })
            .collect();
        let patterns = Arc::new(PatternStore::new(&classes));
        for (i, list) in lists.iter().enumerate() {
            patterns.replace(i, list.iter().map(|s| s.to_string()).collect());
        }

        let map = Arc::new(AddressMap::new());
        let sets = Arc::new(MemoryAddressSet::new());
        let (persist, signals) = PersistHandle::channel(100);
        let audit = Arc::new(CapturingAudit::default());

        let processor = AnswerProcessor::new(
            patterns,
            map.clone(),
            sets.clone(),
            classes.iter().map(|c| c.ipset.clone()).collect(),
            persist,
            audit.clone(),
        );

        Fixture {
            processor,
            map,
            sets,
            signals,
            audit,
        }
    }

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn a(owner: &str, ip: [u8; 4]) -> Record {
        Record::from_rdata(name(owner), 300, RData::A(A(Ipv4Addr::from(ip))))
    }

    fn response(qname: &str) -> Message {
        let mut m = Message::new();
        m.set_message_type(MessageType::Response);
        m.add_query(Query::query(name(qname), RecordType::A));
        m
    }

    fn drain(rx: &mut mpsc::Receiver<SaveKind>) -> Vec<SaveKind> {
        let mut out = Vec::new();
        while let Ok(kind) = rx.try_recv() {
            out.push(kind);
        }
        out
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_proxied_answer() {
        let mut f = fixture(&[&["example"]]);
        let mut msg = response("sub.example.com.");
        msg.add_answer(a("sub.example.com.", [93, 184, 216, 34]));

        let summary = f
            .processor
            .process("sub.example.com.", Route::Proxied(0), &msg)
            .await;

        assert_eq!(f.map.get("sub.example.com"), vec!["93.184.216.34"]);
        assert_eq!(f.sets.adds(), vec![("class0-set".to_string(), ip("93.184.216.34"))]);
        assert_eq!(summary.map_inserts, 1);
        assert_eq!(
            drain(&mut f.signals),
            vec![SaveKind::AddressMap, SaveKind::AddressSet]
        );
        assert_eq!(
            *f.audit.rows.lock().unwrap(),
            vec![(
                "sub.example.com".to_string(),
                vec!["93.184.216.34".to_string()],
                true
            )]
        );
    }

    #[tokio::test]
    async fn test_direct_answer_records_without_set() {
        let mut f = fixture(&[&["example"]]);
        let mut msg = response("unrelated.org.");
        msg.add_answer(a("unrelated.org.", [10, 1, 2, 3]));

        f.processor.process("unrelated.org.", Route::Direct, &msg).await;

        assert_eq!(f.map.get("unrelated.org"), vec!["10.1.2.3"]);
        assert!(f.sets.adds().is_empty());
        assert_eq!(drain(&mut f.signals), vec![SaveKind::AddressMap]);
        assert!(!f.audit.rows.lock().unwrap()[0].2);
    }

    #[tokio::test]
    async fn test_cname_chain_records_both_names() {
        let f = fixture(&[&["example"], &["cdn"]]);
        let mut msg = response("www.example.com.");
        msg.add_answer(Record::from_rdata(
            name("www.example.com."),
            300,
            RData::CNAME(CNAME(name("edge.cdn.net."))),
        ));
        msg.add_answer(a("edge.cdn.net.", [1, 2, 3, 4]));

        f.processor
            .process("www.example.com.", Route::Proxied(0), &msg)
            .await;

        assert_eq!(f.map.get("www.example.com"), vec!["1.2.3.4"]);
        assert_eq!(f.map.get("edge.cdn.net"), vec!["1.2.3.4"]);
        // Owner class first, then the query's class
        assert_eq!(
            f.sets.adds(),
            vec![
                ("class1-set".to_string(), ip("1.2.3.4")),
                ("class0-set".to_string(), ip("1.2.3.4")),
            ]
        );
    }

    #[tokio::test]
    async fn test_additional_records_attributed_by_owner() {
        let f = fixture(&[&["example"], &["nsprovider"]]);
        let mut msg = response("plain.org.");
        msg.add_answer(a("plain.org.", [5, 5, 5, 5]));
        msg.add_name_server(a("ns1.nsprovider.net.", [6, 6, 6, 6]));
        msg.add_additional(a("glue.unmatched.net.", [7, 7, 7, 7]));

        let summary = f.processor.process("plain.org.", Route::Direct, &msg).await;

        assert_eq!(f.sets.adds(), vec![("class1-set".to_string(), ip("6.6.6.6"))]);
        assert_eq!(f.map.get("ns1.nsprovider.net"), vec!["6.6.6.6"]);
        assert_eq!(f.map.get("glue.unmatched.net"), vec!["7.7.7.7"]);
        assert_eq!(f.map.get("plain.org"), vec!["5.5.5.5"]);
        // Only answer addresses are audited
        assert_eq!(summary.answer_addrs, vec![Ipv4Addr::new(5, 5, 5, 5)]);
    }

    #[tokio::test]
    async fn test_same_set_address_added_once() {
        let f = fixture(&[&["example"]]);
        let mut msg = response("a.example.com.");
        msg.add_answer(a("a.example.com.", [8, 8, 8, 8]));
        msg.add_answer(a("b.example.com.", [8, 8, 8, 8]));
        msg.add_additional(a("c.example.com.", [8, 8, 8, 8]));

        f.processor
            .process("a.example.com.", Route::Proxied(0), &msg)
            .await;

        assert_eq!(f.sets.adds().len(), 1);
    }

    #[tokio::test]
    async fn test_ipv6_ignored() {
        let mut f = fixture(&[&["example"]]);
        let mut msg = response("v6.example.com.");
        msg.add_answer(Record::from_rdata(
            name("v6.example.com."),
            300,
            RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
        ));

        let summary = f
            .processor
            .process("v6.example.com.", Route::Proxied(0), &msg)
            .await;

        assert_eq!(summary.ipv6_seen, 1);
        assert!(f.map.is_empty());
        assert!(f.sets.calls().is_empty());
        assert!(drain(&mut f.signals).is_empty());
        assert!(f.audit.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_add_skips_set_signal() {
        let mut f = fixture(&[&["example"]]);
        f.sets.fail_on(ip("9.9.9.9"));
        let mut msg = response("x.example.com.");
        msg.add_answer(a("x.example.com.", [9, 9, 9, 9]));

        let summary = f
            .processor
            .process("x.example.com.", Route::Proxied(0), &msg)
            .await;

        assert_eq!(summary.failed_adds, 1);
        assert!(summary.set_adds.is_empty());
        assert_eq!(f.map.get("x.example.com"), vec!["9.9.9.9"]);
        assert_eq!(drain(&mut f.signals), vec![SaveKind::AddressMap]);
    }

    #[tokio::test]
    async fn test_known_address_does_not_signal_map() {
        let mut f = fixture(&[]);
        f.map.insert("known.org", "1.1.1.1");
        let mut msg = response("known.org.");
        msg.add_answer(a("known.org.", [1, 1, 1, 1]));

        let summary = f.processor.process("known.org.", Route::Direct, &msg).await;

        assert_eq!(summary.map_inserts, 0);
        assert!(drain(&mut f.signals).is_empty());
    }

    #[tokio::test]
    async fn test_noaudit_sink() {
        let f = fixture(&[]);
        let processor = AnswerProcessor::new(
            Arc::new(PatternStore::new(&[])),
            f.map.clone(),
            f.sets.clone(),
            Vec::new(),
            PersistHandle::channel(1).0,
            Arc::new(NoAudit),
        );
        let mut msg = response("q.org.");
        msg.add_answer(a("q.org.", [1, 1, 1, 1]));

        let summary = processor.process("q.org.", Route::Direct, &msg).await;
        assert_eq!(summary.answer_addrs.len(), 1);
    }
}
