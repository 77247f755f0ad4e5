//! Lexical endpoint scanning and classification.
//!
//! Scanning is two-pass: full URLs first, then bare host names outside the
//! URL matches. Host candidates only survive if the public suffix list knows
//! their trailing label, which filters out the dotted Java names that
//! dominate dex string pools. Hosts whose last label happens to be a real
//! TLD (`*.app`, `*.dev`) do slip through; that is a known cost of lexical
//! matching.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{Endpoint, EndpointKind};

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://[A-Za-z0-9._~:/?#@!$&'()*+,;=%\[\]{}-]+").expect("url pattern compiles")
});

static HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z][A-Za-z0-9-]{1,62}")
        .expect("host pattern compiles")
});

/// Punctuation that ends up glued to URLs in prose and code.
const TRAILING_JUNK: &[char] = &['.', ',', ';', ':', '!', '?', '\'', '"', ')', ']', '}', '\\'];

/// Scans one piece of text and folds every endpoint occurrence into `acc`.
/// Each occurrence bumps the count by one; values deduplicate via the map.
pub(crate) fn scan(text: &str, acc: &mut BTreeMap<Endpoint, u32>) {
    let mut url_spans: Vec<(usize, usize)> = Vec::new();
    for m in URL_RE.find_iter(text) {
        url_spans.push((m.start(), m.end()));
        let value = m.as_str().trim_end_matches(TRAILING_JUNK);
        if has_host(value) {
            bump(acc, Endpoint::new(value, EndpointKind::Url));
        }
    }

    for m in HOST_RE.find_iter(text) {
        if url_spans
            .iter()
            .any(|&(start, end)| m.start() >= start && m.start() < end)
        {
            continue;
        }
        let host = m.as_str().to_ascii_lowercase();
        if let Some(kind) = classify_host(&host) {
            bump(acc, Endpoint::new(host, kind));
        }
    }
}

fn bump(acc: &mut BTreeMap<Endpoint, u32>, endpoint: Endpoint) {
    *acc.entry(endpoint).or_insert(0) += 1;
}

/// A match only counts as a URL if something host-like follows the scheme.
fn has_host(value: &str) -> bool {
    let Some((_, rest)) = value.split_once("://") else {
        return false;
    };
    rest.split(['/', '?', '#'])
        .next()
        .is_some_and(|host| !host.is_empty())
}

/// Splits a bare host into domain or subdomain, or rejects it.
///
/// The registrable domain is looked up against the public suffix list; a
/// candidate whose suffix the list does not know is discarded rather than
/// guessed at.
fn classify_host(host: &str) -> Option<EndpointKind> {
    if host.len() > 253 {
        return None;
    }
    let domain = psl::domain(host.as_bytes())?;
    if !domain.suffix().is_known() {
        return None;
    }
    let root = std::str::from_utf8(domain.as_bytes()).ok()?;
    if root == host {
        return Some(EndpointKind::Domain);
    }
    let prefix_len = host.len().checked_sub(root.len() + 1)?;
    (host.ends_with(root) && host.as_bytes()[prefix_len] == b'.')
        .then_some(EndpointKind::Subdomain)
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(text: &str) -> Vec<(Endpoint, u32)> {
        let mut acc = BTreeMap::new();
        scan(text, &mut acc);
        acc.into_iter().collect()
    }

    #[test]
    fn finds_urls_and_trims_trailing_punctuation() {
        let found = scan_all("init -> https://api.example.com/v1/init?x=1, then stop");
        assert_eq!(
            found,
            vec![(
                Endpoint::new("https://api.example.com/v1/init?x=1", EndpointKind::Url),
                1
            )]
        );
    }

    #[test]
    fn splits_domains_from_subdomains() {
        let found = scan_all("ping example.com and cdn.example.com");
        assert_eq!(
            found,
            vec![
                (Endpoint::new("cdn.example.com", EndpointKind::Subdomain), 1),
                (Endpoint::new("example.com", EndpointKind::Domain), 1),
            ]
        );
    }

    #[test]
    fn hosts_inside_urls_are_not_double_counted() {
        let found = scan_all("https://cdn.example.com/asset.js");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.kind, EndpointKind::Url);
    }

    #[test]
    fn repeated_occurrences_accumulate() {
        let found = scan_all("a.example.com noise a.example.com");
        assert_eq!(
            found,
            vec![(Endpoint::new("a.example.com", EndpointKind::Subdomain), 2)]
        );
    }

    #[test]
    fn java_style_names_are_rejected_by_the_suffix_list() {
        assert!(scan_all("com.example.myapplication").is_empty());
        assert!(scan_all("Lcom/example/Main;").is_empty());
    }

    #[test]
    fn accepts_hosts_whose_last_label_is_a_real_tld() {
        // Package names ending in a delegated TLD are indistinguishable from
        // hosts at this level.
        let found = scan_all("com.example.app");
        assert_eq!(
            found,
            vec![(Endpoint::new("com.example.app", EndpointKind::Subdomain), 1)]
        );
    }

    #[test]
    fn rejects_numeric_and_single_label_hosts() {
        assert!(scan_all("192.168.0.1 localhost").is_empty());
    }

    #[test]
    fn keeps_scheme_only_fragments_out() {
        assert!(scan_all("prefix https:// suffix").is_empty());
    }

    #[test]
    fn url_with_port_and_bare_host_is_still_a_url() {
        let found = scan_all("http://localhost:8080/status");
        assert_eq!(
            found,
            vec![(
                Endpoint::new("http://localhost:8080/status", EndpointKind::Url),
                1
            )]
        );
    }

    #[test]
    fn hosts_are_lowercased() {
        let found = scan_all("API.Example.COM");
        assert_eq!(
            found,
            vec![(Endpoint::new("api.example.com", EndpointKind::Subdomain), 1)]
        );
    }
}
