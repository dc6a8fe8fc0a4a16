//! Property tests for address classification, URL validation and backoff.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};

use bastion_delivery::{
    url_guard::{classify_ip, IpClass, StaticResolver},
    BackoffSchedule, UrlPolicy, UrlValidator, ValidationCode,
};
use proptest::prelude::*;

fn private_v4() -> impl Strategy<Value = Ipv4Addr> {
    prop_oneof![
        any::<[u8; 3]>().prop_map(|[b, c, d]| Ipv4Addr::new(10, b, c, d)),
        (16u8..32, any::<[u8; 2]>()).prop_map(|(b, [c, d])| Ipv4Addr::new(172, b, c, d)),
        any::<[u8; 2]>().prop_map(|[c, d]| Ipv4Addr::new(192, 168, c, d)),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #[test]
    fn private_ranges_classify_as_private(ip in private_v4()) {
        prop_assert_eq!(classify_ip(IpAddr::V4(ip)), IpClass::Private);
    }

    #[test]
    fn loopback_range_classifies_as_loopback(b: u8, c: u8, d: u8) {
        prop_assert_eq!(classify_ip(IpAddr::V4(Ipv4Addr::new(127, b, c, d))), IpClass::Loopback);
    }

    #[test]
    fn link_local_range_is_never_public(c: u8, d: u8) {
        let class = classify_ip(IpAddr::V4(Ipv4Addr::new(169, 254, c, d)));
        prop_assert!(matches!(class, IpClass::LinkLocal | IpClass::Metadata));
    }

    #[test]
    fn unique_local_v6_classifies_as_private(first in 0xfc00u16..0xfe00, segments: [u16; 7]) {
        let ip = Ipv6Addr::new(
            first, segments[0], segments[1], segments[2],
            segments[3], segments[4], segments[5], segments[6],
        );
        prop_assume!(ip != "fd00:ec2::254".parse::<Ipv6Addr>().unwrap());
        prop_assert_eq!(classify_ip(IpAddr::V6(ip)), IpClass::Private);
    }

    #[test]
    fn mapped_v4_inherits_embedded_class(ip in private_v4()) {
        prop_assert_eq!(classify_ip(IpAddr::V6(ip.to_ipv6_mapped())), IpClass::Private);
    }

    #[test]
    fn hostnames_resolving_to_private_space_are_rejected(ip in private_v4()) {
        let resolver = StaticResolver::new().with_host("hooks.example.com", vec![IpAddr::V4(ip)]);
        let validator = UrlValidator::with_resolver(UrlPolicy::default(), Arc::new(resolver));
        let err = runtime()
            .block_on(validator.validate("https://hooks.example.com/in"))
            .unwrap_err();
        prop_assert_eq!(err.code, ValidationCode::PrivateIpBlocked);
    }

    #[test]
    fn plain_http_requires_development_flag(path in "[a-z]{1,12}") {
        let validator = UrlValidator::new(UrlPolicy::default());
        let url = format!("http://hooks.example.com/{path}");
        let err = runtime().block_on(validator.validate(&url)).unwrap_err();
        prop_assert_eq!(err.code, ValidationCode::HttpsRequired);
    }

    #[test]
    fn backoff_indexes_table_and_clamps(
        table in prop::collection::vec(1u64..100_000, 1..8),
        attempt in 1u32..50,
    ) {
        let schedule = BackoffSchedule::from_secs(&table).unwrap();
        let index = (attempt as usize - 1).min(table.len() - 1);
        prop_assert_eq!(schedule.delay_for_attempt(attempt), Duration::from_secs(table[index]));
    }
}
