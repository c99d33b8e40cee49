//! # hostname-filter
//!
//! Client-supplied hostnames are hostile input. This crate runs the fixed
//! sanitisation pipeline every hostname passes before it reaches a lease
//! or the DNS zone:
//!
//! strip control characters, optionally strip emoji, keep only DNS-valid
//! characters, lowercase, trim and collapse separators, truncate, then
//! reject against the built-in denylist, configured deny regexes and the
//! optional allow regex. A rejected name falls back to a template derived
//! from the client MAC, and deduplication appends `-2`..`-99` when a
//! different client already owns the name.
//!
//! The pipeline is idempotent: sanitising an already-sanitised name is a
//! no-op.
#![warn(rust_2018_idioms, unreachable_pub)]

use lazy_static::lazy_static;
use pnet::util::MacAddr;
use regex::Regex;
use tracing::{debug, warn};

use dynconfig::SanitizerConfig;

const DEDUPE_MAX: u32 = 99;

lazy_static! {
    // names that must never enter the zone, whatever the client claims
    static ref BUILTIN_DENY: Vec<Regex> = vec![
        Regex::new(r"^localhost$").unwrap(),
        Regex::new(r"^unknown$").unwrap(),
        Regex::new(r"^none$").unwrap(),
        Regex::new(r"^null$").unwrap(),
        Regex::new(r"^broadcasthost$").unwrap(),
        Regex::new(r"^localdomain$").unwrap(),
        Regex::new(r"^android-[0-9a-f]+$").unwrap(),
    ];
}

/// Compiled sanitiser for one scope (global, or one subnet override).
pub struct HostnameFilter {
    cfg: SanitizerConfig,
    deny: Vec<Regex>,
    allow: Option<Regex>,
}

impl std::fmt::Debug for HostnameFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostnameFilter")
            .field("max_length", &self.cfg.max_length)
            .field("deny_rules", &self.deny.len())
            .finish()
    }
}

impl HostnameFilter {
    /// Compile the configured regexes. Invalid patterns are skipped with
    /// a warning rather than disabling sanitisation.
    pub fn new(cfg: SanitizerConfig) -> Self {
        let deny = cfg
            .deny_regexes
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(pattern = %p, ?err, "invalid deny regex skipped");
                    None
                }
            })
            .collect();
        let allow = cfg.allow_regex.as_ref().and_then(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!(pattern = %p, ?err, "invalid allow regex skipped");
                None
            }
        });
        Self { cfg, deny, allow }
    }

    /// Run the transform half of the pipeline. Returns `None` when
    /// nothing survives, or the name is rejected by a deny rule or
    /// misses the allow rule.
    pub fn sanitize(&self, raw: &str) -> Option<String> {
        let mut name = String::with_capacity(raw.len());
        for ch in raw.chars() {
            if ch.is_control() {
                continue;
            }
            if self.cfg.strip_emoji && is_emoji(ch) {
                continue;
            }
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' {
                name.push(ch.to_ascii_lowercase());
            }
        }

        // trim leading/trailing separators, collapse runs
        let mut collapsed = String::with_capacity(name.len());
        let mut last_sep: Option<char> = None;
        for ch in name.chars() {
            if ch == '.' || ch == '-' {
                if collapsed.is_empty() {
                    continue;
                }
                last_sep = Some(ch);
                continue;
            }
            if let Some(sep) = last_sep.take() {
                collapsed.push(sep);
            }
            collapsed.push(ch);
        }
        let mut name = collapsed;
        name.truncate(self.cfg.max_length.min(253));
        while name.ends_with('.') || name.ends_with('-') {
            name.pop();
        }

        if name.is_empty() {
            return None;
        }
        if BUILTIN_DENY.iter().any(|re| re.is_match(&name)) {
            debug!(%name, "hostname rejected by builtin denylist");
            return None;
        }
        if self.deny.iter().any(|re| re.is_match(&name)) {
            debug!(%name, "hostname rejected by configured deny rule");
            return None;
        }
        if let Some(allow) = &self.allow {
            if !allow.is_match(&name) {
                debug!(%name, "hostname missed the allow rule");
                return None;
            }
        }
        Some(name)
    }

    /// The fallback name for a rejected hostname: the configured
    /// template with `{mac}` expanded to the colon-less MAC.
    pub fn fallback(&self, mac: MacAddr) -> String {
        let flat = mac.to_string().replace(':', "");
        self.cfg.fallback_template.replace("{mac}", &flat)
    }

    /// Full pipeline: sanitise, fall back to the MAC template on
    /// rejection, then deduplicate. `owner_of` reports which MAC
    /// currently owns a candidate name, so `mac` keeps its own name
    /// across renewals.
    pub fn resolve(
        &self,
        raw: Option<&str>,
        mac: MacAddr,
        owner_of: impl Fn(&str) -> Option<MacAddr>,
    ) -> String {
        let base = raw
            .and_then(|r| self.sanitize(r))
            .unwrap_or_else(|| self.fallback(mac));
        if !self.cfg.dedupe {
            return base;
        }
        match owner_of(&base) {
            None => return base,
            Some(owner) if owner == mac => return base,
            Some(_) => {}
        }
        for n in 2..=DEDUPE_MAX {
            let candidate = format!("{base}-{n}");
            match owner_of(&candidate) {
                None => return candidate,
                Some(owner) if owner == mac => return candidate,
                Some(_) => {}
            }
        }
        debug!(%base, "dedupe exhausted, falling back to mac template");
        self.fallback(mac)
    }
}

// the common emoji planes; enough to keep pictographs out of the zone
fn is_emoji(ch: char) -> bool {
    matches!(u32::from(ch),
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0xFE00..=0xFE0F | 0x2190..=0x21FF | 0x2B00..=0x2BFF)
}
