//! Payload templates.
//!
//! Placeholders resolved before delivery:
//! `{localtime}`, `{utcstamp}`, `{localstamp}`, `{utcdate}`, `{utcsync}`,
//! `{rand6}`, `{rand20}`, `{rand100}`, `{hostname}`, `{ipv4:<host>}`,
//! `{ipv6:<host>}`. Store references go through the data store next, and
//! `[EOL]` becomes CRLF last.

use std::net::{IpAddr, ToSocketAddrs};

use chrono::{DateTime, Datelike, Local, Utc};
use rand::Rng;

use crate::requirement::DataProviding;

/// Resolve a payload template against the current time.
pub fn resolve(value: &str, store: Option<&dyn DataProviding>) -> String {
    resolve_at(value, Utc::now(), store)
}

/// Resolve a payload template as seen at `now`.
pub fn resolve_at(value: &str, now: DateTime<Utc>, store: Option<&dyn DataProviding>) -> String {
    let mut line = value.to_string();
    if line.contains('{') {
        line = expand_time(&line, now);
        line = expand_random(&line);
        if line.contains("{hostname}") {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".into());
            line = line.replace("{hostname}", &host);
        }
        line = expand_addresses(&line);
        if let Some(store) = store {
            line = store.parse_line(&line);
        }
    }
    line.replace("[EOL]", "\r\n")
}

fn expand_time(line: &str, now: DateTime<Utc>) -> String {
    let local = now.with_timezone(&Local);
    let mut line = line.to_string();
    let tokens: [(&str, String); 5] = [
        ("{localtime}", local.format("%H:%M").to_string()),
        ("{utcstamp}", now.format("%d/%m/%y %H:%M:%S").to_string()),
        ("{localstamp}", local.format("%d/%m/%y %H:%M:%S").to_string()),
        ("{utcdate}", now.format("%y%m%d").to_string()),
        (
            "{utcsync}",
            format!(
                "DT{}{}",
                now.format("%y%m%d%H%M%S"),
                now.weekday().number_from_monday()
            ),
        ),
    ];
    for (token, value) in tokens {
        if line.contains(token) {
            line = line.replace(token, &value);
        }
    }
    line
}

fn expand_random(line: &str) -> String {
    let mut line = line.to_string();
    let mut rng = rand::thread_rng();
    for (token, max) in [("{rand6}", 6), ("{rand20}", 20), ("{rand100}", 100)] {
        while line.contains(token) {
            let roll: u32 = rng.gen_range(1..=max);
            line = line.replacen(token, &roll.to_string(), 1);
        }
    }
    line
}

fn expand_addresses(line: &str) -> String {
    let mut line = line.to_string();
    for (prefix, want_v4) in [("{ipv4:", true), ("{ipv6:", false)] {
        while let Some(start) = line.find(prefix) {
            let Some(len) = line[start..].find('}') else {
                break;
            };
            let host = &line[start + prefix.len()..start + len];
            let addr = lookup(host, want_v4).unwrap_or_default();
            line.replace_range(start..=start + len, &addr);
        }
    }
    line
}

fn lookup(host: &str, want_v4: bool) -> Option<String> {
    let addrs = (host, 0).to_socket_addrs().ok()?;
    addrs
        .map(|a| a.ip())
        .find(|ip| matches!(ip, IpAddr::V4(_)) == want_v4)
        .map(|ip| ip.to_string())
}
