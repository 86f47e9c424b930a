use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use axum::http::HeaderMap;
use favkit::ratelimit::{client_ip, Limiter};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn disabled_when_both_rates_are_zero() {
    assert!(Limiter::new(0, 0, 0, 0).is_none());
    assert!(Limiter::new(1, 0, 0, 0).is_some());
    assert!(Limiter::new(0, 0, 1, 0).is_some());
}

#[test]
fn global_bucket_admits_burst_then_rejects() {
    let limiter = Limiter::new(10, 3, 0, 0).unwrap();
    let client = ip("203.0.113.1");
    for _ in 0..3 {
        assert!(limiter.allow(client));
    }
    assert!(!limiter.allow(client));
}

#[test]
fn per_ip_buckets_are_independent() {
    let limiter = Limiter::new(0, 0, 10, 2).unwrap();
    let a = ip("203.0.113.1");
    let b = ip("203.0.113.2");

    assert!(limiter.allow(a));
    assert!(limiter.allow(a));
    assert!(!limiter.allow(a));
    // b has its own bucket
    assert!(limiter.allow(b));
}

#[tokio::test]
async fn tokens_refill_at_the_configured_rate() {
    // 20/s so the refill window stays short
    let limiter = Limiter::new(20, 2, 0, 0).unwrap();
    let client = ip("203.0.113.1");

    assert!(limiter.allow(client));
    assert!(limiter.allow(client));
    assert!(!limiter.allow(client));

    // one token accrues in 50ms at 20/s; allow comfortably more
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(limiter.allow(client));
}

#[test]
fn burst_defaults_to_twice_the_rate() {
    let limiter = Limiter::new(3, 0, 0, 0).unwrap();
    let client = ip("203.0.113.1");
    for _ in 0..6 {
        assert!(limiter.allow(client));
    }
    assert!(!limiter.allow(client));
}

#[test]
fn client_ip_prefers_first_valid_forwarded_for() {
    let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), 41000);

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-forwarded-for",
        "203.0.113.7, 10.0.0.1, 172.16.0.3".parse().unwrap(),
    );
    assert_eq!(client_ip(&headers, remote), ip("203.0.113.7"));

    // surrounding whitespace is trimmed
    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", "  203.0.113.8\t".parse().unwrap());
    assert_eq!(client_ip(&headers, remote), ip("203.0.113.8"));

    // IPv6 entries validate too
    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", "2001:db8::1".parse().unwrap());
    assert_eq!(
        client_ip(&headers, remote),
        IpAddr::V6("2001:db8::1".parse::<Ipv6Addr>().unwrap())
    );
}

#[test]
fn client_ip_falls_back_to_real_ip_then_remote() {
    let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), 41000);

    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
    headers.insert("x-real-ip", "203.0.113.20".parse().unwrap());
    assert_eq!(client_ip(&headers, remote), ip("203.0.113.20"));

    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", "garbage".parse().unwrap());
    headers.insert("x-real-ip", "also garbage".parse().unwrap());
    assert_eq!(client_ip(&headers, remote), ip("192.0.2.9"));

    // port is stripped from the remote address
    let headers = HeaderMap::new();
    assert_eq!(client_ip(&headers, remote), ip("192.0.2.9"));
}
