//! Property-based tests for the text parsers fed by operators and backends

use music::dns::protocol::{fqdn, DnsRecord};
use music::signer::hosted::parse_api_duration;
use proptest::prelude::*;

fn domain_name_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9-]{0,20}[a-z0-9]", 1..5).prop_map(|parts| parts.join("."))
}

proptest! {
    #[test]
    fn test_record_parser_never_panics(text in "\\PC{0,200}") {
        let _ = text.parse::<DnsRecord>();
    }

    #[test]
    fn test_record_parser_handles_any_rdata(
        rrtype in prop::sample::select(vec!["NS", "DNSKEY", "DS", "CDS", "CSYNC", "SOA", "A", "TXT"]),
        rdata in "[ -~]{0,80}",
    ) {
        let _ = format!("example.com. 3600 IN {} {}", rrtype, rdata).parse::<DnsRecord>();
    }

    #[test]
    fn test_fqdn_is_idempotent(name in "[A-Za-z0-9.-]{0,60}") {
        let once = fqdn(&name);
        prop_assert!(once.ends_with('.'));
        prop_assert_eq!(fqdn(&once), once.clone());
    }

    #[test]
    fn test_ns_record_text_is_stable(owner in domain_name_strategy(), host in domain_name_strategy(), ttl in 0u32..86400) {
        let record: DnsRecord = format!("{}. {} IN NS {}.", owner, ttl, host).parse().unwrap();
        let again: DnsRecord = record.to_string().parse().unwrap();
        prop_assert_eq!(record, again);
    }

    #[test]
    fn test_api_duration_never_panics(text in "\\PC{0,40}") {
        let _ = parse_api_duration(&text);
    }

    #[test]
    fn test_api_duration_clock(days in 0i64..400, h in 0i64..24, m in 0i64..60, s in 0i64..60) {
        let text = format!("{} {:02}:{:02}:{:02}.123456", days, h, m, s);
        let parsed = parse_api_duration(&text).unwrap();
        prop_assert_eq!(parsed.num_seconds(), days * 86400 + h * 3600 + m * 60 + s);
    }
}
